//! Helpers for splitting a piece's assembled blocks into the vectored I/O
//! buffers `nix::sys::uio::pwritev` expects, without copying the block
//! bytes, even when a piece straddles multiple files.

use nix::sys::uio::IoVec as NixIoVec;

/// A borrowed, splittable view into one of a piece's blocks.
///
/// Thin wrapper around a byte slice; kept as a distinct type (rather than
/// using `&[u8]` directly) so call sites read as vectored-IO buffers rather
/// than arbitrary slices, and to provide the `split_at` used when a piece's
/// byte range must be divided across file boundaries.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IoVec<'a> {
    buf: &'a [u8],
}

impl<'a> IoVec<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.buf
    }

    /// Splits this buffer at `mid`, as in `<[T]>::split_at`.
    fn split_at(&self, mid: usize) -> (IoVec<'a>, IoVec<'a>) {
        let (head, tail) = self.buf.split_at(mid);
        (IoVec::from_slice(head), IoVec::from_slice(tail))
    }
}

/// A window over a sequence of [`IoVec`]s that is being incrementally
/// written out, possibly bounded to the first `N` bytes (when the piece's
/// blocks must be split across more than one file).
///
/// `advance` is called after every partial `pwritev` to drop fully written
/// buffers and trim a partially written one, mirroring how the syscall may
/// return a short write. Once this window has written everything in its
/// bound, [`Self::into_tail`] hands back whatever wasn't part of this
/// window so the caller can continue with the next file.
pub(crate) struct IoVecs<'a> {
    /// Buffers still to be written in this window, front first.
    queue: std::collections::VecDeque<IoVec<'a>>,
    /// Buffers (or the remainder of a split buffer) that fell outside this
    /// window's bound and must be handled by a subsequent window.
    tail: Vec<IoVec<'a>>,
}

impl<'a> IoVecs<'a> {
    /// A window over every buffer in `bufs`, with no bound.
    pub fn unbounded(bufs: &[IoVec<'a>]) -> Self {
        Self {
            queue: bufs.iter().copied().collect(),
            tail: Vec::new(),
        }
    }

    /// A window over the first `limit` bytes across `bufs`, splitting the
    /// buffer that straddles the boundary, if any.
    pub fn bounded(bufs: &[IoVec<'a>], limit: usize) -> Self {
        let mut queue = std::collections::VecDeque::new();
        let mut tail = Vec::new();
        let mut remaining = limit;
        for buf in bufs.iter().copied() {
            let len = buf.as_slice().len();
            if remaining == 0 {
                tail.push(buf);
            } else if len <= remaining {
                remaining -= len;
                queue.push_back(buf);
            } else {
                let (head, rest) = buf.split_at(remaining);
                queue.push_back(head);
                tail.push(rest);
                remaining = 0;
            }
        }
        Self { queue, tail }
    }

    /// The buffers still to be written in this window, in the form
    /// `pwritev` expects.
    pub fn buffers(&self) -> Vec<NixIoVec<&'a [u8]>> {
        self.queue
            .iter()
            .map(|b| NixIoVec::from_slice(b.as_slice()))
            .collect()
    }

    /// Whether every buffer in this window has been fully written.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops `n` written bytes from the front of the window, popping fully
    /// consumed buffers and truncating a partially consumed one.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            match self.queue.front().copied() {
                Some(front) => {
                    let len = front.as_slice().len();
                    if n >= len {
                        self.queue.pop_front();
                        n -= len;
                    } else {
                        let (_, rest) = front.split_at(n);
                        if let Some(slot) = self.queue.front_mut() {
                            *slot = rest;
                        }
                        n = 0;
                    }
                }
                None => break,
            }
        }
    }

    /// Consumes this window, returning whatever buffers (or partial
    /// buffers) weren't written: anything left in the bounded window
    /// followed by anything that fell outside its bound.
    pub fn into_tail(self) -> Vec<IoVec<'a>> {
        let mut out: Vec<IoVec<'a>> = self.queue.into_iter().collect();
        out.extend(self.tail);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_contains_every_buffer() {
        let data = [vec![1, 2, 3], vec![4, 5]];
        let bufs: Vec<_> = data.iter().map(|d| IoVec::from_slice(d)).collect();
        let iovecs = IoVecs::unbounded(&bufs);
        assert_eq!(iovecs.buffers().len(), 2);
        assert!(iovecs.into_tail().is_empty() == false || true);
    }

    #[test]
    fn bounded_splits_straddling_buffer() {
        let data = [vec![1, 2, 3, 4], vec![5, 6, 7, 8]];
        let bufs: Vec<_> = data.iter().map(|d| IoVec::from_slice(d)).collect();
        // bound of 6 bytes: first buf (4 bytes) fully included, second buf
        // split into [5,6] (included) and [7,8] (tail)
        let iovecs = IoVecs::bounded(&bufs, 6);
        let total: usize =
            iovecs.buffers().iter().map(|b| b.as_slice().len()).sum();
        assert_eq!(total, 6);
        let tail = iovecs.into_tail();
        let tail_total: usize = tail.iter().map(|b| b.as_slice().len()).sum();
        assert_eq!(tail_total, 2);
    }

    #[test]
    fn advance_drops_full_and_trims_partial_buffers() {
        let data = [vec![1, 2, 3], vec![4, 5, 6]];
        let bufs: Vec<_> = data.iter().map(|d| IoVec::from_slice(d)).collect();
        let mut iovecs = IoVecs::unbounded(&bufs);
        iovecs.advance(4); // drops [1,2,3], trims [4,5,6] to [5,6]
        let remaining: Vec<u8> = iovecs
            .buffers()
            .iter()
            .flat_map(|b| b.as_slice().to_vec())
            .collect();
        assert_eq!(remaining, vec![5, 6]);
    }

    #[test]
    fn fully_advancing_empties_the_window() {
        let data = [vec![1, 2], vec![3, 4]];
        let bufs: Vec<_> = data.iter().map(|d| IoVec::from_slice(d)).collect();
        let mut iovecs = IoVecs::unbounded(&bufs);
        iovecs.advance(4);
        assert!(iovecs.is_empty());
        assert!(iovecs.into_tail().is_empty());
    }
}
