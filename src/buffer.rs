//! Pooled wire-frame buffers.
//!
//! A [`FrameBuf`] holds one length-prefixed wire frame: a 4-byte big-endian
//! length followed by up to MTU bytes of IPv4 payload. Buffers are drawn from
//! a [`BufferPool`] and handed off between tasks by move; whoever drops the
//! buffer last returns it to the pool. That makes "returned exactly once on
//! every exit path" a structural property instead of a discipline.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Length of the wire-frame header (u32 big-endian payload length).
pub const HEADER_LEN: usize = 4;

/// Pool of reusable frame buffers.
///
/// The free list is bounded: buffers beyond the steady-state cap are simply
/// dropped on return, so a burst never permanently inflates memory.
pub struct BufferPool {
    free: ArrayQueue<Box<[u8]>>,
    payload_capacity: usize,
}

impl BufferPool {
    /// Create a pool of buffers sized `payload_capacity + HEADER_LEN`, with
    /// `initial` buffers pre-allocated and at most `max` kept on the free
    /// list.
    pub fn new(initial: usize, max: usize, payload_capacity: usize) -> Arc<Self> {
        let free = ArrayQueue::new(max);
        for _ in 0..initial.min(max) {
            let _ = free.push(vec![0u8; payload_capacity + HEADER_LEN].into_boxed_slice());
        }
        Arc::new(Self {
            free,
            payload_capacity,
        })
    }

    /// Take a buffer from the pool, allocating a fresh one if the free list
    /// is empty.
    pub fn get(self: &Arc<Self>) -> FrameBuf {
        let data = self
            .free
            .pop()
            .unwrap_or_else(|| vec![0u8; self.payload_capacity + HEADER_LEN].into_boxed_slice());
        FrameBuf {
            data: Some(data),
            len: 0,
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers currently on the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    fn put(&self, data: Box<[u8]>) {
        // Full free list: let the allocation die here.
        let _ = self.free.push(data);
    }
}

/// One wire frame, owned. Returns itself to its pool on drop.
pub struct FrameBuf {
    data: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl FrameBuf {
    /// Payload capacity (the MTU this pool was sized for).
    pub fn payload_capacity(&self) -> usize {
        self.data().len() - HEADER_LEN
    }

    /// Current payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the payload length and stamp it into the wire header.
    ///
    /// Keeps the invariant that the four header bytes always encode the
    /// payload length.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.payload_capacity(), "payload exceeds capacity");
        let header = (len as u32).to_be_bytes();
        self.data_mut()[..HEADER_LEN].copy_from_slice(&header);
        self.len = len;
    }

    /// The full wire region: header plus payload.
    pub fn wire(&self) -> &[u8] {
        &self.data()[..HEADER_LEN + self.len]
    }

    /// The payload region.
    pub fn payload(&self) -> &[u8] {
        &self.data()[HEADER_LEN..HEADER_LEN + self.len]
    }

    /// The whole payload capacity, for filling before `set_len`.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data_mut()[HEADER_LEN..]
    }

    /// The header slot, for filling during a wire read.
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data_mut()[..HEADER_LEN]
    }

    /// Decode the payload length currently stored in the header slot.
    pub fn header_len(&self) -> usize {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.data()[..HEADER_LEN]);
        u32::from_be_bytes(header) as usize
    }

    fn data(&self) -> &[u8] {
        self.data.as_ref().expect("buffer taken")
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_mut().expect("buffer taken")
    }
}

impl Drop for FrameBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.put(data);
        }
    }
}

impl std::fmt::Debug for FrameBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuf")
            .field("len", &self.len)
            .field("capacity", &self.payload_capacity())
            .finish()
    }
}
