//! Outbound UDP rate limiting.
//!
//! A plain per-second token bucket, refilled lazily on use (no timer
//! callback needed). Sends that cannot be admitted immediately queue
//! FIFO and are released in arrival order as capacity frees up -- the
//! same ordering guarantee `bip_util`'s `PrioritySender` gives admission
//! callers via its `Arc<AtomicUsize>` counter, just applied to bytes
//! instead of a request count.

use std::collections::VecDeque;

use chrono::{DateTime, UTC};

pub struct BandwidthGate<T> {
    capacity_per_sec: usize,
    available: usize,
    last_refill: DateTime<UTC>,
    waiters: VecDeque<(usize, T)>,
}

impl<T> BandwidthGate<T> {
    pub fn new(capacity_per_sec: usize, now: DateTime<UTC>) -> BandwidthGate<T> {
        BandwidthGate {
            capacity_per_sec,
            available: capacity_per_sec,
            last_refill: now,
            waiters: VecDeque::new(),
        }
    }

    fn refill(&mut self, now: DateTime<UTC>) {
        let elapsed = (now - self.last_refill).num_milliseconds();
        if elapsed <= 0 {
            return;
        }

        let replenished = (elapsed as u64 * self.capacity_per_sec as u64) / 1000;
        self.available = (self.available as u64 + replenished)
            .min(self.capacity_per_sec as u64) as usize;
        self.last_refill = now;
    }

    /// Attempt to spend `bytes` of budget right now. On success the budget
    /// is debited immediately; on failure the caller decides whether to
    /// queue via `enqueue`.
    pub fn try_reserve(&mut self, bytes: usize, now: DateTime<UTC>) -> bool {
        self.refill(now);

        if self.available >= bytes {
            self.available -= bytes;
            true
        } else {
            false
        }
    }

    pub fn enqueue(&mut self, bytes: usize, item: T) {
        self.waiters.push_back((bytes, item));
    }

    pub fn queue_len(&self) -> usize {
        self.waiters.len()
    }

    /// Release as many queued items as current budget allows, in FIFO
    /// order, debiting budget for each.
    pub fn drain_ready(&mut self, now: DateTime<UTC>) -> Vec<T> {
        self.refill(now);

        let mut released = Vec::new();
        while let Some(&(bytes, _)) = self.waiters.front() {
            if self.available < bytes {
                break;
            }
            self.available -= bytes;
            let (_, item) = self.waiters.pop_front().unwrap();
            released.push(item);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::BandwidthGate;
    use chrono::{Duration, UTC};
    use guess_util::test_support::travel_into_future;

    #[test]
    fn positive_reserve_within_capacity_succeeds() {
        let now = UTC::now();
        let mut gate: BandwidthGate<()> = BandwidthGate::new(1000, now);

        assert!(gate.try_reserve(500, now));
        assert!(gate.try_reserve(500, now));
        assert!(!gate.try_reserve(1, now));
    }

    #[test]
    fn positive_budget_refills_over_time() {
        let now = UTC::now();
        let mut gate: BandwidthGate<()> = BandwidthGate::new(1000, now);
        assert!(gate.try_reserve(1000, now));

        let later = travel_into_future(Duration::milliseconds(500));
        assert!(gate.try_reserve(400, later));
        assert!(!gate.try_reserve(200, later));
    }

    #[test]
    fn positive_queued_sends_drain_fifo_as_budget_frees() {
        let now = UTC::now();
        let mut gate = BandwidthGate::new(1000, now);
        assert!(gate.try_reserve(1000, now));

        gate.enqueue(600, "first");
        gate.enqueue(600, "second");

        let later = travel_into_future(Duration::milliseconds(1000));
        let released = gate.drain_ready(later);

        assert_eq!(released, vec!["first"]);
        assert_eq!(gate.queue_len(), 1);
    }
}
