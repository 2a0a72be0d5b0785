//! Fixed-capacity payload arena.
//!
//! The arena holds the fragments of one in-progress application message
//! in a single backing buffer. Each data frame's payload is appended as a
//! contiguous [`FrameRef`], so reassembly is a slice of the buffer rather
//! than a copy, and the send path can re-fragment on its own frame budget
//! instead of echoing the peer's fragmentation. The buffer also bounds
//! per-connection memory: it is allocated once and never resized.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// One recorded fragment: a `[start, end)` range inside the arena buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    start: usize,
    end: usize,
}

impl FrameRef {
    /// Length of the fragment in octets.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True for zero-length fragments.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Fixed-capacity byte buffer with append-only frame records.
pub struct PayloadArena {
    buf: Vec<u8>,
    frames: Vec<FrameRef>,
}

impl PayloadArena {
    /// Create an arena with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            frames: Vec::new(),
        }
    }

    /// Total capacity of the backing buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Capacity still available for new frames.
    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity() - self.frames.last().map_or(0, |f| f.end)
    }

    /// Combined length of all recorded frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.iter().map(FrameRef::len).sum()
    }

    /// True when no frames are recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of recorded frames.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Append a new frame of exactly `size` octets and return its slice.
    ///
    /// The frame starts where the previous one ended, keeping the buffer
    /// contiguous. Fails with [`Error::ArenaOverflow`] when `size` exceeds
    /// the remaining capacity.
    pub fn reserve(&mut self, size: usize) -> Result<&mut [u8]> {
        let remaining = self.remaining_capacity();
        if size > remaining {
            return Err(Error::ArenaOverflow {
                requested: size,
                remaining,
            });
        }

        let start = self.frames.last().map_or(0, |f| f.end);
        let end = start + size;
        self.frames.push(FrameRef { start, end });
        Ok(&mut self.buf[start..end])
    }

    /// Reserve a frame of `size` octets and fill it from `src`.
    ///
    /// Returns the number of octets read. On I/O failure the reserved
    /// frame is retained; the connection engine decides whether to abort
    /// or continue.
    pub async fn read<R>(&mut self, src: &mut R, size: usize) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let frame = self.reserve(size)?;
        src.read_exact(frame).await?;
        Ok(size)
    }

    /// Remove the most recently added frame.
    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// Clear all frames.
    pub fn reset(&mut self) {
        self.frames.clear();
    }

    /// The contiguous slice spanning all recorded frames.
    pub fn combine(&self) -> &[u8] {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => &self.buf[first.start..last.end],
            _ => &[],
        }
    }

    /// Contents of the most recently added frame.
    pub fn last(&self) -> Option<&[u8]> {
        let f = *self.frames.last()?;
        Some(&self.buf[f.start..f.end])
    }

    /// Mutable contents of the most recently added frame.
    pub fn last_mut(&mut self) -> Option<&mut [u8]> {
        let f = *self.frames.last()?;
        Some(&mut self.buf[f.start..f.end])
    }
}
