//! Growable byte buffer with read/write cursors
//!
//! Both stream directions park bytes in a `ByteBuffer` between the caller and
//! the network. The live region is `[read, write)`; bytes before `read` have
//! already been handed out and are reclaimed by compaction.

use super::BUFFER_SLACK;

/// Byte region with a read cursor and a write cursor
///
/// Invariant: `0 <= read <= write <= capacity`.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    storage: Vec<u8>,
    read: usize,
    write: usize,
}

impl ByteBuffer {
    /// Create an empty buffer without storage
    pub fn new() -> Self {
        ByteBuffer::default()
    }

    /// Create a buffer with `capacity` bytes of storage
    pub fn with_capacity(capacity: usize) -> Self {
        ByteBuffer {
            storage: vec![0u8; capacity],
            read: 0,
            write: 0,
        }
    }

    /// Total storage size
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes written but not yet consumed
    pub fn unread(&self) -> usize {
        self.write - self.read
    }

    /// Position of the read cursor
    pub fn read_cursor(&self) -> usize {
        self.read
    }

    /// Position of the write cursor
    pub fn write_cursor(&self) -> usize {
        self.write
    }

    /// True when nothing has been written since the last reset
    pub fn is_pristine(&self) -> bool {
        self.write == 0
    }

    /// The unread region
    pub fn unread_slice(&self) -> &[u8] {
        &self.storage[self.read..self.write]
    }

    /// Check whether `required` more bytes fit behind the write cursor
    pub fn has_room(&self, required: usize) -> bool {
        self.write + required <= self.capacity()
    }

    /// Move the unread region to the start of storage
    pub fn compact(&mut self) {
        if self.read == 0 {
            return;
        }

        let unread = self.unread();
        self.storage.copy_within(self.read..self.write, 0);
        self.read = 0;
        self.write = unread;
    }

    /// Reallocate to `unread + required + BUFFER_SLACK` bytes
    ///
    /// The unread region moves to offset 0 of the new storage.
    pub fn grow(&mut self, required: usize) {
        let unread = self.unread();
        let mut storage = vec![0u8; unread + required + BUFFER_SLACK];
        storage[..unread].copy_from_slice(self.unread_slice());

        self.storage = storage;
        self.read = 0;
        self.write = unread;
    }

    /// Make sure `required` bytes fit, compacting before reallocating
    pub fn reserve(&mut self, required: usize) {
        if self.has_room(required) {
            return;
        }
        self.compact();
        if !self.has_room(required) {
            self.grow(required);
        }
    }

    /// Copy `data` behind the write cursor
    ///
    /// # Panics
    ///
    /// Panics if the caller did not make room first.
    pub fn append(&mut self, data: &[u8]) {
        assert!(
            self.has_room(data.len()),
            "append of {} bytes overflows buffer (write {}, capacity {})",
            data.len(),
            self.write,
            self.capacity()
        );

        self.storage[self.write..self.write + data.len()].copy_from_slice(data);
        self.write += data.len();
    }

    /// Advance the read cursor by `n`
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unread length.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.unread(),
            "consume of {} bytes exceeds {} unread",
            n,
            self.unread()
        );
        self.read += n;
    }

    /// Copy up to `out.len()` unread bytes into `out` and consume them
    pub fn copy_to(&mut self, out: &mut [u8]) -> usize {
        let n = self.unread().min(out.len());
        out[..n].copy_from_slice(&self.storage[self.read..self.read + n]);
        self.read += n;
        n
    }

    /// Rewind both cursors, keeping storage
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Drop storage entirely
    pub fn release(&mut self) {
        self.storage = Vec::new();
        self.reset();
    }
}
