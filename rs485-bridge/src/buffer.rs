use crate::error::BufferFull;

/// Fixed-capacity FIFO byte queue holding a client's bytes until its bus turn.
///
/// The buffer never grows. A push that does not fit entirely is rejected as a whole,
/// so an accepted run of bytes is never cut in the middle.
#[derive(Debug)]
pub struct InboundBuffer {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl InboundBuffer {
    pub fn new(capacity: usize) -> InboundBuffer {
        InboundBuffer {
            data: vec![0; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Appends all of `bytes`, or nothing.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if bytes.len() > self.free() {
            return Err(BufferFull {
                capacity: self.capacity(),
                free: self.free(),
                requested: bytes.len(),
            });
        }
        let capacity = self.capacity();
        let tail = (self.head + self.len) % capacity.max(1);
        let first = bytes.len().min(capacity - tail);
        self.data[tail..tail + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.len += bytes.len();
        Ok(())
    }

    /// The oldest contiguous bytes, at most `max` of them.
    pub fn front(&self, max: usize) -> &[u8] {
        let contiguous = self.len.min(self.capacity() - self.head);
        &self.data[self.head..self.head + contiguous.min(max)]
    }

    /// Drops the `count` oldest bytes.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.len);
        self.len -= count;
        self.head = if self.len == 0 {
            0
        } else {
            (self.head + count) % self.capacity()
        };
    }
}
