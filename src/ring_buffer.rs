// src/ring_buffer.rs
//
// Append-only byte accumulator with a logical read cursor.
// Owned exclusively by the framer thread; never shared.

/// Byte accumulator backing the frame extractor.
///
/// Appends go at the tail; `consume` advances a logical cursor over the head.
/// Offsets handed out by `find` are relative to the cursor, so callers never
/// see consumed bytes. The backing region is compacted once the consumed
/// prefix outgrows the live window, which keeps `find` + `consume` amortized
/// linear over the life of the stream.
#[derive(Debug, Default)]
pub struct RingBuffer {
    data: Vec<u8>,
    /// Index of the logical start inside `data`.
    start: usize,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            start: 0,
        }
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a chunk at the tail.
    pub fn append(&mut self, bytes: &[u8]) {
        self.maybe_compact();
        self.data.extend_from_slice(bytes);
    }

    /// The live window, cursor-relative.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// First offset of `needle` at or after `from`, relative to the cursor.
    /// Returns `None` when the needle is empty or not present; a needle split
    /// across two earlier appends is found like any other occurrence because
    /// the window is contiguous.
    pub fn find(&self, needle: &[u8], from: usize) -> Option<usize> {
        let window = self.as_slice();
        if needle.is_empty() || from >= window.len() || window.len() - from < needle.len() {
            return None;
        }
        window[from..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|pos| from + pos)
    }

    /// Drop bytes `[0, upto)` from the logical view. Subsequent offsets are
    /// re-based. `upto` past the end clears the buffer.
    pub fn consume(&mut self, upto: usize) {
        let upto = upto.min(self.len());
        self.start += upto;
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
    }

    /// Reclaim the consumed prefix once it dominates the allocation.
    fn maybe_compact(&mut self) {
        if self.start > 4096 && self.start >= self.data.len() / 2 {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_window() {
        let mut rb = RingBuffer::new();
        rb.append(b"abc");
        rb.append(b"def");
        assert_eq!(rb.as_slice(), b"abcdef");
        assert_eq!(rb.len(), 6);
    }

    #[test]
    fn find_across_append_boundary() {
        let mut rb = RingBuffer::new();
        rb.append(b"abc*");
        rb.append(b"/def");
        // "*/" straddles the two appended chunks
        assert_eq!(rb.find(b"*/", 0), Some(3));
    }

    #[test]
    fn find_respects_from_offset() {
        let mut rb = RingBuffer::new();
        rb.append(b"x,y,z");
        assert_eq!(rb.find(b",", 0), Some(1));
        assert_eq!(rb.find(b",", 2), Some(3));
        assert_eq!(rb.find(b",", 4), None);
    }

    #[test]
    fn consume_rebases_offsets() {
        let mut rb = RingBuffer::new();
        rb.append(b"aaa;bbb;");
        assert_eq!(rb.find(b";", 0), Some(3));
        rb.consume(4);
        assert_eq!(rb.as_slice(), b"bbb;");
        assert_eq!(rb.find(b";", 0), Some(3));
    }

    #[test]
    fn consume_past_end_clears() {
        let mut rb = RingBuffer::new();
        rb.append(b"abc");
        rb.consume(100);
        assert!(rb.is_empty());
        rb.append(b"xy");
        assert_eq!(rb.as_slice(), b"xy");
    }

    #[test]
    fn compaction_keeps_window_intact() {
        let mut rb = RingBuffer::new();
        let chunk = vec![0x41u8; 1024];
        for _ in 0..16 {
            rb.append(&chunk);
            rb.consume(1024);
        }
        assert!(rb.is_empty());
        rb.append(b"tail");
        assert_eq!(rb.as_slice(), b"tail");
    }

    #[test]
    fn empty_needle_is_never_found() {
        let mut rb = RingBuffer::new();
        rb.append(b"abc");
        assert_eq!(rb.find(b"", 0), None);
    }
}
