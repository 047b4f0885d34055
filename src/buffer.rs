//! The send and receive buffers a connection drains into and out of its
//! byte stream.
//!
//! A [`StreamBuffer`] is a linear buffer with a read index and a write
//! index into a growable backing store. Readers consume from the front,
//! writers fill at the back, and [`StreamBuffer::reserve`] compacts or
//! grows the store when a writer needs contiguous room. Compaction is
//! preferred; growth at least doubles the capacity so repeated reserves
//! stay cheap.

/// A linear byte buffer with separate read and write positions.
#[derive(Debug)]
pub struct StreamBuffer {
    store: Vec<u8>,
    start: usize,
    end: usize,
}

impl StreamBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            store: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    /// The number of readable bytes between the read and write positions.
    pub fn fullbytes(&self) -> usize {
        self.end - self.start
    }

    /// The number of writable bytes remaining at the back of the store.
    pub fn tailbytes(&self) -> usize {
        self.store.len() - self.end
    }

    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The readable region.
    pub fn readable(&self) -> &[u8] {
        &self.store[self.start..self.end]
    }

    /// The writable region at the back. Call [`StreamBuffer::fill`] after
    /// copying bytes in.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.store[self.end..]
    }

    /// Marks `n` bytes at the back as written.
    pub fn fill(&mut self, n: usize) {
        assert!(n <= self.tailbytes());
        self.end += n;
    }

    /// Marks `n` bytes at the front as read. Consuming everything resets
    /// both positions so the whole store is writable again.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.fullbytes());
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Ensures at least `min` contiguous writable bytes, compacting the
    /// unread region to the front first and growing the store only when
    /// compaction is not enough.
    pub fn reserve(&mut self, min: usize) {
        if self.tailbytes() >= min {
            return;
        }
        if self.start > 0 {
            self.store.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.tailbytes() < min {
            let needed = self.end + min;
            let grown = (self.store.len() * 2).max(needed);
            self.store.resize(grown, 0);
        }
    }

    /// Appends a slice, reserving room as needed.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.writable()[..bytes.len()].copy_from_slice(bytes);
        self.fill(bytes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_consume() {
        let mut buf = StreamBuffer::with_capacity(8);
        assert_eq!(buf.fullbytes(), 0);
        assert_eq!(buf.tailbytes(), 8);

        buf.writable()[..3].copy_from_slice(b"abc");
        buf.fill(3);
        assert_eq!(buf.readable(), b"abc");
        assert_eq!(buf.tailbytes(), 5);

        buf.consume(2);
        assert_eq!(buf.readable(), b"c");

        // Draining completely resets the positions.
        buf.consume(1);
        assert_eq!(buf.fullbytes(), 0);
        assert_eq!(buf.tailbytes(), 8);
    }

    #[test]
    fn reserve_compacts_before_growing() {
        let mut buf = StreamBuffer::with_capacity(8);
        buf.extend(b"abcdefgh");
        buf.consume(6);
        assert_eq!(buf.tailbytes(), 0);

        buf.reserve(4);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.readable(), b"gh");
        assert_eq!(buf.tailbytes(), 6);
    }

    #[test]
    fn reserve_grows_geometrically() {
        let mut buf = StreamBuffer::with_capacity(4);
        buf.extend(b"abcd");
        buf.reserve(1);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.readable(), b"abcd");

        // A large reserve jumps straight to the needed size.
        buf.reserve(100);
        assert!(buf.tailbytes() >= 100);
        assert_eq!(buf.readable(), b"abcd");
    }

    #[test]
    fn extend_reserves() {
        let mut buf = StreamBuffer::with_capacity(2);
        buf.extend(b"hello world");
        assert_eq!(buf.readable(), b"hello world");
    }
}
