//! The wire protocol: framing, the handshake, and message (de)serialization.
//!
//! Two codecs are used in sequence on the same socket, mirroring the
//! protocol itself: [`HandshakeCodec`] decodes exactly the fixed 68 byte
//! handshake, after which the session switches the `Framed` transport over
//! to [`PeerCodec`], which decodes the 4-byte-length-prefixed message
//! stream for the remainder of the connection's life.

use std::collections::HashMap;
use std::convert::TryInto;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::*, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
    MAX_REQUEST_LEN,
};

/// The protocol string sent in every handshake, identifying the protocol
/// (rather than its version, which is instead negotiated via the reserved
/// bytes and extension handshake).
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

const PROTOCOL_STRING_LEN: u8 = 19;

/// `1 (prot len) + 19 (prot) + 8 (reserved) + 20 (info hash) + 20 (peer id)`.
pub(crate) const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Bit 0x10 of reserved byte 5 (0-indexed) advertises BEP 10 extension
/// protocol support.
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;

/// A frame whose declared length exceeds this is rejected outright.
const MAX_FRAME_LEN: usize = (1 << 17) + 9;

/// The fixed-size handshake that precedes all other messages on a peer
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// Always `b"BitTorrent protocol"`; kept as bytes (rather than
    /// discarded on parse) so a caller can debug-assert it if desired.
    pub prot: [u8; 19],
    /// Reserved bytes signaling supported protocol extensions. Only the
    /// BEP 10 extension bit is interpreted by this engine.
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Builds a handshake for this engine, with the BEP 10 extension bit
    /// set since metadata exchange and peer exchange are both supported.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[5] = EXTENSION_PROTOCOL_BIT;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the reserved bytes advertise BEP 10 extension protocol
    /// support.
    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & EXTENSION_PROTOCOL_BIT != 0
    }
}

/// Codec for the handshake only; used for the first exchange on a
/// connection, then discarded in favor of [`PeerCodec`].
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING_LEN);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING_LEN as usize {
            return Err(Error::InvalidProtocolString);
        }

        let mut buf = buf.split_to(HANDSHAKE_LEN);
        buf.advance(1);

        let mut prot = [0; 19];
        prot.copy_from_slice(&buf[..19]);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidProtocolString);
        }
        buf.advance(19);

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[..8]);
        buf.advance(8);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[..20]);
        buf.advance(20);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The standard message ids, as they appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extended = 20,
}

impl MessageId {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            20 => Self::Extended,
            _ => {
                return Err(Error::ProtocolViolation(format!(
                    "unknown message id {}",
                    b
                )))
            }
        })
    }
}

/// A decoded peer wire message.
#[derive(Debug)]
pub(crate) enum Message {
    /// A zero-length message, sent periodically to keep the TCP connection
    /// alive through NAT/firewall idle timeouts.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    /// The wire calls this message `piece`; it's named `Block` here as it
    /// carries a block's worth of bytes, to avoid colliding with the
    /// engine's notion of a whole `Piece`.
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Extended(ExtendedMessage),
}

impl Message {
    /// The wire id of this message, or `None` for the keep-alive, which has
    /// no id (it's the zero-length frame itself).
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Extended(_) => Some(MessageId::Extended),
        }
    }
}

/// The BEP 10 extension id cratetorrent-engine advertises for the metadata
/// exchange extension in its own extension handshake, and the id by which
/// it recognizes the message in incoming extended messages (the peer may
/// advertise a different id for the same extension; that value, not this
/// constant, is what's used when addressing messages to them).
pub(crate) const UT_METADATA_ID: u8 = 1;
/// Same as [`UT_METADATA_ID`] but for peer exchange.
pub(crate) const UT_PEX_ID: u8 = 2;

/// The BEP 10 extension handshake payload (extended message id 0).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// Maps supported extension names to the local id by which messages of
    /// that extension should be addressed.
    pub m: HashMap<String, u8>,
    /// The total size of the info dict, in bytes; only present once the
    /// sender itself knows the torrent's metadata.
    #[serde(rename = "metadata_size", skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,
}

impl ExtendedHandshake {
    pub fn new(metadata_size: Option<u32>) -> Self {
        let mut m = HashMap::new();
        m.insert("ut_metadata".to_owned(), UT_METADATA_ID);
        m.insert("ut_pex".to_owned(), UT_PEX_ID);
        Self { m, metadata_size }
    }

    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get("ut_metadata").copied()
    }

    pub fn ut_pex_id(&self) -> Option<u8> {
        self.m.get("ut_pex").copied()
    }
}

/// The bencoded header shared by all `ut_metadata` messages (BEP 9); the
/// `Data` variant additionally carries raw bytes appended after this dict.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct MetadataMessageHeader {
    msg_type: u8,
    piece: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_size: Option<u32>,
}

/// A decoded `ut_metadata` extension message.
#[derive(Clone, Debug)]
pub(crate) enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, data: Vec<u8> },
    Reject { piece: u32 },
}

/// A decoded extended (BEP 10) message: either the handshake, a metadata
/// exchange message, or an unrecognized/pex payload that is passed through
/// undecoded (peer exchange wire parsing is left to an external collaborator).
#[derive(Debug)]
pub(crate) enum ExtendedMessage {
    Handshake(ExtendedHandshake),
    Metadata(MetadataMessage),
    /// An extended message whose id this engine doesn't recognize as
    /// `ut_metadata`, carried as the raw `(id, payload)` pair. `ut_pex`
    /// payloads (when peer exchange is enabled) arrive this way, since PEX
    /// wire parsing belongs to an external collaborator.
    Unknown { id: u8, payload: Vec<u8> },
}

/// Codec for the post-handshake message stream: a 4-byte big-endian length
/// prefix, followed by a 1-byte message id and the payload (absent for
/// `KeepAlive`, whose frame length is 0).
pub(crate) struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let mut len_bytes = [0; 4];
            len_bytes.copy_from_slice(&buf[..4]);
            let msg_len = u32::from_be_bytes(len_bytes) as usize;

            if msg_len == 0 {
                // keep-alive: just the length prefix, no id or payload
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if msg_len > MAX_FRAME_LEN {
                return Err(Error::FrameTooLarge);
            }

            if buf.len() < 4 + msg_len {
                buf.reserve(4 + msg_len - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let mut msg_bytes = buf.split_to(msg_len);
            let id = MessageId::from_u8(msg_bytes[0])?;
            msg_bytes.advance(1);

            return Ok(Some(parse_payload(id, msg_bytes)?));
        }
    }
}

fn parse_payload(id: MessageId, mut payload: BytesMut) -> Result<Message> {
    match id {
        MessageId::Choke => Ok(Message::Choke),
        MessageId::Unchoke => Ok(Message::Unchoke),
        MessageId::Interested => Ok(Message::Interested),
        MessageId::NotInterested => Ok(Message::NotInterested),
        MessageId::Have => {
            if payload.len() != 4 {
                return Err(Error::ProtocolViolation(
                    "have message payload must be 4 bytes".into(),
                ));
            }
            let piece_index = payload.get_u32() as PieceIndex;
            Ok(Message::Have { piece_index })
        }
        MessageId::Bitfield => {
            let bitfield = Bitfield::from_slice(&payload);
            Ok(Message::Bitfield(bitfield))
        }
        MessageId::Request | MessageId::Cancel => {
            if payload.len() != 12 {
                return Err(Error::InvalidBlockRequest);
            }
            let piece_index = payload.get_u32() as PieceIndex;
            let offset = payload.get_u32();
            let len = payload.get_u32();
            if len > MAX_REQUEST_LEN {
                return Err(Error::RequestTooLarge);
            }
            let info = BlockInfo {
                piece_index,
                offset,
                len,
            };
            Ok(if id == MessageId::Request {
                Message::Request(info)
            } else {
                Message::Cancel(info)
            })
        }
        MessageId::Piece => {
            if payload.len() < 8 {
                return Err(Error::ProtocolViolation(
                    "piece message payload too short".into(),
                ));
            }
            let piece_index = payload.get_u32() as PieceIndex;
            let offset = payload.get_u32();
            let data = payload.to_vec();
            Ok(Message::Block {
                piece_index,
                offset,
                data,
            })
        }
        MessageId::Extended => parse_extended_payload(payload),
    }
}

fn parse_extended_payload(mut payload: BytesMut) -> Result<Message> {
    if payload.is_empty() {
        return Err(Error::ProtocolViolation(
            "extended message missing sub-id".into(),
        ));
    }
    let ext_id = payload[0];
    payload.advance(1);
    let body = payload.to_vec();

    if ext_id == 0 {
        let handshake: ExtendedHandshake = serde_bencode::from_bytes(&body)
            .map_err(|e| {
                Error::ProtocolViolation(format!(
                    "malformed extension handshake: {}",
                    e
                ))
            })?;
        return Ok(Message::Extended(ExtendedMessage::Handshake(handshake)));
    }

    if ext_id == UT_METADATA_ID {
        return Ok(Message::Extended(ExtendedMessage::Metadata(
            decode_metadata_message(&body)?,
        )));
    }

    Ok(Message::Extended(ExtendedMessage::Unknown {
        id: ext_id,
        payload: body,
    }))
}

/// `ut_metadata` messages are a bencoded header dict immediately followed
/// (with no separator) by the raw piece bytes, for `Data` messages only.
/// `serde_bencode` doesn't expose how many bytes of `body` it consumed, so
/// we re-encode the decoded header to learn its length.
fn decode_metadata_message(body: &[u8]) -> Result<MetadataMessage> {
    let header: MetadataMessageHeader =
        serde_bencode::from_bytes(body).map_err(|e| {
            Error::ProtocolViolation(format!(
                "malformed ut_metadata header: {}",
                e
            ))
        })?;
    let header_len = serde_bencode::to_bytes(&header)
        .map_err(|e| {
            Error::ProtocolViolation(format!(
                "could not re-encode ut_metadata header: {}",
                e
            ))
        })?
        .len();
    let data = body.get(header_len..).unwrap_or_default().to_vec();

    Ok(match header.msg_type {
        0 => MetadataMessage::Request { piece: header.piece },
        1 => MetadataMessage::Data {
            piece: header.piece,
            total_size: header.total_size.unwrap_or(data.len() as u32),
            data,
        },
        2 => MetadataMessage::Reject { piece: header.piece },
        other => {
            return Err(Error::ProtocolViolation(format!(
                "unknown ut_metadata msg_type {}",
                other
            )))
        }
    })
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index.try_into().map_err(|_| {
                    Error::ProtocolViolation("piece index overflow".into())
                })?);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_slice();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bytes);
            }
            Message::Request(info) | Message::Cancel(info) => {
                buf.put_u32(13);
                buf.put_u8(msg.id().unwrap() as u8);
                buf.put_u32(info.piece_index.try_into().map_err(|_| {
                    Error::ProtocolViolation("piece index overflow".into())
                })?);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index.try_into().map_err(|_| {
                    Error::ProtocolViolation("piece index overflow".into())
                })?);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Extended(ext) => encode_extended(ext, buf)?,
        }
        Ok(())
    }
}

fn encode_extended(ext: ExtendedMessage, buf: &mut BytesMut) -> Result<()> {
    let (ext_id, body): (u8, Vec<u8>) = match ext {
        ExtendedMessage::Handshake(handshake) => {
            let body = serde_bencode::to_bytes(&handshake)?;
            (0, body)
        }
        ExtendedMessage::Metadata(msg) => {
            let (header, data) = match msg {
                MetadataMessage::Request { piece } => (
                    MetadataMessageHeader {
                        msg_type: 0,
                        piece,
                        total_size: None,
                    },
                    Vec::new(),
                ),
                MetadataMessage::Data {
                    piece,
                    total_size,
                    data,
                } => (
                    MetadataMessageHeader {
                        msg_type: 1,
                        piece,
                        total_size: Some(total_size),
                    },
                    data,
                ),
                MetadataMessage::Reject { piece } => (
                    MetadataMessageHeader {
                        msg_type: 2,
                        piece,
                        total_size: None,
                    },
                    Vec::new(),
                ),
            };
            let mut body = serde_bencode::to_bytes(&header)?;
            body.extend_from_slice(&data);
            // only set once the peer's extension handshake told us its id
            // for ut_metadata; callers are expected to have resolved this
            (UT_METADATA_ID, body)
        }
        ExtendedMessage::Unknown { id, payload } => (id, payload),
    };

    buf.put_u32(1 + 1 + body.len() as u32);
    buf.put_u8(MessageId::Extended as u8);
    buf.put_u8(ext_id);
    buf.extend_from_slice(&body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let info_hash = [3; 20];
        let peer_id = [4; 20];
        let handshake = Handshake::new(info_hash, peer_id);
        assert!(handshake.supports_extension_protocol());

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, info_hash);
        assert_eq!(decoded.peer_id, peer_id);
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_decode_waits_for_full_frame() {
        let info_hash = [1; 20];
        let peer_id = [2; 20];
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(Handshake::new(info_hash, peer_id), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(HANDSHAKE_LEN - 1);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn rejects_mismatched_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(b"not a bittorrent!!!");
        buf.extend_from_slice(&[0; 8]);
        buf.extend_from_slice(&[0; 20]);
        buf.extend_from_slice(&[0; 20]);
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::InvalidProtocolString)
        ));
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &0u32.to_be_bytes()[..]);
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::KeepAlive));
    }

    #[test]
    fn choke_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Choke, &mut buf).unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::Choke));
    }

    #[test]
    fn request_round_trips() {
        let info = BlockInfo {
            piece_index: 4,
            offset: 0x4000,
            len: 0x4000,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(info), &mut buf).unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Request(decoded) => assert_eq!(decoded, info),
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn request_over_max_len_is_rejected() {
        let info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: MAX_REQUEST_LEN + 1,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(info), &mut buf).unwrap();
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::RequestTooLarge)
        ));
    }

    #[test]
    fn block_round_trips() {
        let data = vec![7; 16];
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Block {
                    piece_index: 2,
                    offset: 16,
                    data: data.clone(),
                },
                &mut buf,
            )
            .unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Block {
                piece_index,
                offset,
                data: decoded,
            } => {
                assert_eq!(piece_index, 2);
                assert_eq!(offset, 16);
                assert_eq!(decoded, data);
            }
            _ => panic!("expected block"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::FrameTooLarge)
        ));
    }

    #[test]
    fn decode_waits_for_full_message_body() {
        let info = BlockInfo {
            piece_index: 1,
            offset: 0,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(info), &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn extended_handshake_round_trips() {
        let handshake = ExtendedHandshake::new(Some(1234));
        assert_eq!(handshake.ut_metadata_id(), Some(UT_METADATA_ID));
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Extended(ExtendedMessage::Handshake(handshake)),
                &mut buf,
            )
            .unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Extended(ExtendedMessage::Handshake(decoded)) => {
                assert_eq!(decoded.metadata_size, Some(1234));
                assert_eq!(decoded.ut_metadata_id(), Some(UT_METADATA_ID));
            }
            _ => panic!("expected extension handshake"),
        }
    }

    #[test]
    fn metadata_data_message_round_trips() {
        let data = vec![9; 16 * 1024];
        let msg = MetadataMessage::Data {
            piece: 0,
            total_size: data.len() as u32,
            data: data.clone(),
        };
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Extended(ExtendedMessage::Metadata(msg)), &mut buf)
            .unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Extended(ExtendedMessage::Metadata(MetadataMessage::Data {
                piece,
                total_size,
                data: decoded_data,
            })) => {
                assert_eq!(piece, 0);
                assert_eq!(total_size, data.len() as u32);
                assert_eq!(decoded_data, data);
            }
            _ => panic!("expected metadata data message"),
        }
    }
}
