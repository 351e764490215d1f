//! Scratch buffers for encoding, pooled by size class.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

/// Capacity of each size class
const CLASSES: [usize; 5] = [1 << 10, 4 << 10, 16 << 10, 64 << 10, 256 << 10];

/// Buffers kept per class
const DEFAULT_RETAIN: usize = 64;

/// Pool of reusable `Vec<u8>` buffers.
///
/// [`BufferPool::acquire`] returns a guard; the buffer goes back to its class
/// when the guard drops, whichever way the caller exits. Buffers that grew
/// past the largest class are freed instead.
#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    retain: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_RETAIN)
    }
}

fn class_for(size: usize) -> Option<usize> {
    CLASSES.iter().position(|&capacity| size <= capacity)
}

impl BufferPool {
    pub fn new(retain: usize) -> Self {
        Self {
            classes: CLASSES.iter().map(|_| Mutex::new(Vec::new())).collect(),
            retain,
        }
    }

    /// Get an empty buffer with at least `size_hint` capacity
    pub fn acquire(&self, size_hint: usize) -> PooledBuf<'_> {
        let buf = class_for(size_hint)
            .and_then(|class| {
                self.classes[class]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop()
            })
            .unwrap_or_else(|| {
                let capacity = class_for(size_hint).map_or(size_hint, |class| CLASSES[class]);
                Vec::with_capacity(capacity)
            });

        PooledBuf { buf, pool: self }
    }

    fn release(&self, mut buf: Vec<u8>) {
        // File under the largest class the buffer can fully serve
        let Some(class) = CLASSES.iter().rposition(|&capacity| buf.capacity() >= capacity) else {
            return;
        };
        if buf.capacity() > CLASSES[CLASSES.len() - 1] {
            return;
        }

        buf.clear();
        let mut slot = self.classes[class]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.len() < self.retain {
            slot.push(buf);
        }
    }

    /// Buffers currently idle in the pool
    pub fn idle(&self) -> usize {
        self.classes
            .iter()
            .map(|class| class.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

/// A buffer on loan from a [`BufferPool`]
pub struct PooledBuf<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
