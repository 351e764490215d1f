//! Shared sink for ready jobs from every pipeline.
//!
//! Delivery order is strictly by priority (higher first), ties broken by
//! arrival order. The queue is unbounded: backpressure is applied upstream
//! by each driver's prefetch limit instead.

use crate::ack::Item;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Entry {
    priority: i64,
    seq: u64,
    item: Item,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then the lower sequence number
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Internally synchronized priority queue of [`Item`]s.
#[derive(Default)]
pub struct PriorityQueue {
    inner: Mutex<Inner>,
    available: Notify,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a ready item. Never blocks on consumers.
    pub fn insert(&self, item: Item) {
        {
            let mut inner = self.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Entry {
                priority: item.priority(),
                seq,
                item,
            });
        }
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<Item> {
        self.lock().heap.pop().map(|entry| entry.item)
    }

    /// Wait for the highest-priority item, or `None` once `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Item> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register interest before checking so an insert in between is not missed
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Take out every waiting item that belongs to `pipeline`
    pub fn remove_pipeline(&self, pipeline: &str) -> Vec<Item> {
        let mut inner = self.lock();
        let (removed, kept): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut inner.heap)
            .into_vec()
            .into_iter()
            .partition(|entry| entry.item.pipeline() == pipeline);
        inner.heap = BinaryHeap::from(kept);
        removed.into_iter().map(|entry| entry.item).collect()
    }
}
