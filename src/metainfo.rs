//! Parsing and validating a torrent's metadata (the bencoded info dict,
//! whether read from a `.torrent` file or fetched from peers via the
//! `ut_metadata` extension).
//!
//! [`Metainfo`] is the validated, processed form the rest of the engine
//! works with; [`RawMetainfo`] is only the bencode wire shape and is never
//! exposed outside this module.

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::*,
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// The maximum piece length this engine accepts, per the `ParsedTorrent`
/// validation contract. Torrents advertising a larger piece length are
/// rejected rather than silently truncated.
const MAX_PIECE_LEN: u64 = 32 * 1024 * 1024;

/// The validated, processed form of a torrent's metadata.
///
/// Constructed only through [`Metainfo::from_bytes`], which enforces the
/// structural invariants a `Torrent` and its `StorageInfo` rely on: piece
/// length bounds, piece-count/length consistency, and contiguous file
/// offsets. Once built, `info_hash` never changes for the lifetime of the
/// value -- there's no in-place mutation path that could desync it from
/// `info_buffer`.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The SHA-1 hash of the raw bencoded info dict, computed once at
    /// construction time.
    pub info_hash: Sha1Hash,
    /// The torrent's suggested name (used as the archive download dir, or
    /// the single file's name).
    pub name: String,
    /// The nominal piece length, in bytes.
    pub piece_len: u32,
    /// The concatenated 20 byte SHA-1 hashes of every piece, in order.
    pieces: Vec<u8>,
    /// The file layout this torrent's bytes map onto.
    pub structure: FsStructure,
    /// Tracker URLs to announce to, flattened from `announce` and
    /// `announce-list`, in the order they should be tried.
    pub announce: Vec<String>,
    /// Whether the torrent is marked private (no DHT/PEX, trackers only).
    pub is_private: bool,
    /// The raw bencoded bytes of the info dict, kept around so it can be
    /// served verbatim to peers requesting metadata over `ut_metadata`.
    pub info_buffer: Vec<u8>,
}

impl Metainfo {
    /// Parses and validates a torrent's metadata from its raw bencoded
    /// bytes (the contents of a `.torrent` file, or metadata reassembled
    /// from `ut_metadata` piece fetches).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;

        let info_buffer = serde_bencode::to_bytes(&raw.info)?;
        let digest = Sha1::digest(&info_buffer);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        let pieces = raw.info.pieces.into_vec();
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(format!(
                "pieces field length {} is not a positive multiple of 20",
                pieces.len()
            )));
        }
        let piece_count = pieces.len() / 20;

        let piece_len = raw.info.piece_length;
        if piece_len == 0 || piece_len > MAX_PIECE_LEN {
            return Err(Error::InvalidMetainfo(format!(
                "piece length {} exceeds the {} byte maximum",
                piece_len, MAX_PIECE_LEN
            )));
        }
        let piece_len = piece_len as u32;

        let structure = build_structure(&raw.info)?;
        let download_len = structure.download_len();

        // pieces.length * pieceLength >= length >= (pieces.length - 1) *
        // pieceLength + 1
        let max_len = piece_count as u64 * piece_len as u64;
        let min_len = (piece_count as u64 - 1) * piece_len as u64 + 1;
        if download_len > max_len || download_len < min_len {
            return Err(Error::InvalidMetainfo(format!(
                "download length {} inconsistent with {} pieces of length {}",
                download_len, piece_count, piece_len
            )));
        }

        let mut announce = Vec::new();
        if let Some(tiers) = raw.announce_list {
            for tier in tiers {
                announce.extend(tier);
            }
        }
        if let Some(url) = raw.announce {
            if !announce.contains(&url) {
                announce.insert(0, url);
            }
        }

        Ok(Self {
            info_hash,
            name: raw.info.name,
            piece_len,
            pieces,
            structure,
            announce,
            is_private: raw.info.private.unwrap_or(0) != 0,
            info_buffer,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The expected SHA-1 hash of the piece at `index`, as published in the
    /// info dict, or `None` if `index` is out of range.
    pub fn piece_hash(&self, index: crate::PieceIndex) -> Option<Sha1Hash> {
        let start = index.checked_mul(20)?;
        let end = start.checked_add(20)?;
        let slice = self.pieces.get(start..end)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }
}

/// Builds the file layout from the raw info dict, validating that
/// multi-file torrents list contiguous, non-overlapping files starting at
/// offset 0.
fn build_structure(info: &RawInfo) -> Result<FsStructure> {
    match &info.files {
        None => {
            let len = info.length.ok_or_else(|| {
                Error::InvalidMetainfo(
                    "single file torrent missing length".to_owned(),
                )
            })?;
            Ok(FsStructure::File(FileInfo {
                path: info.name.clone().into(),
                len,
                torrent_offset: 0,
            }))
        }
        Some(raw_files) => {
            let mut files = Vec::with_capacity(raw_files.len());
            let mut offset = 0u64;
            for raw_file in raw_files {
                if raw_file.length < 0 {
                    return Err(Error::InvalidMetainfo(
                        "file length must not be negative".to_owned(),
                    ));
                }
                let len = raw_file.length as u64;
                let path: std::path::PathBuf =
                    raw_file.path.iter().collect();
                files.push(FileInfo {
                    path,
                    len,
                    torrent_offset: offset,
                });
                offset += len;
            }
            Ok(FsStructure::Archive { files })
        }
    }
}

/// The raw bencode shape of a `.torrent` file's top level dict. Never used
/// outside this module -- [`Metainfo`] is the type the rest of the engine
/// consumes.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file(piece_len: u64, pieces: usize, length: u64) -> Vec<u8> {
        let info = RawInfo {
            name: "foo.txt".to_owned(),
            pieces: ByteBuf::from(vec![0u8; pieces * 20]),
            piece_length: piece_len,
            length: Some(length),
            files: None,
            private: None,
        };
        let raw = RawMetainfo {
            info,
            announce: Some("http://tracker.example/announce".to_owned()),
            announce_list: None,
        };
        serde_bencode::to_bytes(&raw).unwrap()
    }

    #[test]
    fn parses_single_file_torrent() {
        // 2 full pieces of 16 bytes plus a partial last piece of 5 bytes
        let buf = bencode_single_file(16, 3, 37);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "foo.txt");
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.structure.download_len(), 37);
        assert!(!metainfo.structure.is_archive());
        assert!(!metainfo.is_private);
        assert!(metainfo.announce.contains(&"http://tracker.example/announce".to_owned()));
    }

    #[test]
    fn rejects_piece_length_over_the_cap() {
        let buf = bencode_single_file(MAX_PIECE_LEN + 1, 1, MAX_PIECE_LEN + 1);
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn rejects_length_inconsistent_with_piece_count() {
        // 3 pieces of 16 bytes can cover at most 48 bytes and at least 33
        let buf = bencode_single_file(16, 3, 1000);
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn builds_contiguous_offsets_for_multi_file_torrents() {
        let info = RawInfo {
            name: "archive".to_owned(),
            pieces: ByteBuf::from(vec![0u8; 20]),
            piece_length: 16,
            length: None,
            files: Some(vec![
                RawFile { path: vec!["a.txt".to_owned()], length: 5 },
                RawFile { path: vec!["sub".to_owned(), "b.txt".to_owned()], length: 11 },
            ]),
            private: Some(1),
        };
        let raw = RawMetainfo { info, announce: None, announce_list: None };
        let buf = serde_bencode::to_bytes(&raw).unwrap();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.is_private);
        assert!(metainfo.structure.is_archive());
        match &metainfo.structure {
            FsStructure::Archive { files } => {
                assert_eq!(files[0].torrent_offset, 0);
                assert_eq!(files[1].torrent_offset, 5);
            }
            _ => panic!("expected archive structure"),
        }
    }

    #[test]
    fn info_hash_is_stable_across_identical_inputs() {
        let buf = bencode_single_file(16, 1, 16);
        let a = Metainfo::from_bytes(&buf).unwrap();
        let b = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }
}
