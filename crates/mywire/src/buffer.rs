//! Reusable scratch buffers.
//!
//! The compressed transport inflates and deflates through temporary buffers
//! on every frame; recycling them through an explicit checkout/return pool
//! keeps allocation pressure flat under sustained traffic.

use std::sync::Mutex;

/// Buffers larger than this are dropped instead of retained, so one huge
/// result set does not pin its peak allocation forever.
const MAX_RETAINED_CAPACITY: usize = 1 << 20;

/// A small pool of recycled byte buffers with checkout/return semantics.
#[derive(Debug, Default)]
pub struct BufferPool {
    shelf: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared buffer with at least the requested capacity.
    pub fn checkout(&self, capacity: usize) -> Vec<u8> {
        let mut shelf = self.shelf.lock().expect("buffer pool poisoned");
        match shelf.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.reserve(capacity.saturating_sub(buf.capacity()));
                buf
            }
            None => Vec::with_capacity(capacity),
        }
    }

    /// Return a buffer for reuse. Oversized buffers are dropped.
    pub fn give_back(&self, buf: Vec<u8>) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        let mut shelf = self.shelf.lock().expect("buffer pool poisoned");
        if shelf.len() < 4 {
            shelf.push(buf);
        }
    }
}
