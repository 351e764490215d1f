//! Point-in-time consumer statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// Snapshot returned by `Driver::state` and `Broker::stats`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct State {
    pub pipeline: String,
    pub driver: String,
    /// Backend queue/stream/file the pipeline reads from
    pub queue_name: String,
    pub priority: i64,
    /// Jobs ready for delivery
    pub active_count: i64,
    /// Jobs waiting for their release time
    pub delayed_count: i64,
    /// Jobs handed out and not yet acknowledged
    pub reserved_count: i64,
    /// At least one listener is running
    pub ready: bool,
}

/// Per-adapter counters. Plain atomic increments, so reading them never
/// contends with the listener or with `push`.
#[derive(Debug, Default)]
pub struct Counters {
    active: AtomicI64,
    delayed: AtomicI64,
    reserved: AtomicI64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn delayed(&self) -> i64 {
        self.delayed.load(Ordering::Relaxed)
    }

    pub fn reserved(&self) -> i64 {
        self.reserved.load(Ordering::Relaxed)
    }

    pub fn add_active(&self, n: i64) {
        self.active.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_delayed(&self, n: i64) {
        self.delayed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_reserved(&self, n: i64) {
        self.reserved.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_active(&self, n: i64) {
        self.active.store(n, Ordering::Relaxed);
    }

    pub fn set_delayed(&self, n: i64) {
        self.delayed.store(n, Ordering::Relaxed);
    }

    pub fn set_reserved(&self, n: i64) {
        self.reserved.store(n, Ordering::Relaxed);
    }

    /// A delayed job became ready
    pub fn promote(&self, n: i64) {
        self.add_delayed(-n);
        self.add_active(n);
    }

    /// A ready job was handed out
    pub fn reserve(&self, n: i64) {
        self.add_active(-n);
        self.add_reserved(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_moves() {
        let counters = Counters::new();
        counters.add_active(2);
        counters.add_delayed(3);

        counters.promote(1);
        assert_eq!((counters.active(), counters.delayed()), (3, 2));

        counters.reserve(2);
        assert_eq!((counters.active(), counters.reserved()), (1, 2));

        counters.set_reserved(0);
        assert_eq!(counters.reserved(), 0);
    }

    #[test]
    fn test_state_serializes() {
        let state = State {
            pipeline: "p".into(),
            driver: "memory".into(),
            queue_name: "p".into(),
            priority: 10,
            active_count: 1,
            delayed_count: 0,
            reserved_count: 0,
            ready: true,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["ready"], true);
        assert_eq!(json["active_count"], 1);
    }
}
