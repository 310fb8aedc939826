//! Bounded drop-on-full queues
//!
//! Producers are engine threads and must never wait on a slow peer, so a push
//! either fits or is counted as lost. The first push that fits after losses
//! is preceded by a notice carrying the lost count.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after a lost-items notice
    QueuedAfterNotice(u64),
    Dropped,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    lost: u64,
}

#[derive(Debug)]
pub struct LossyQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    wake: Arc<Notify>,
}

impl<T> LossyQueue<T> {
    /// `wake` is notified on every successful push
    pub fn new(capacity: usize, wake: Arc<Notify>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                lost: 0,
            }),
            capacity: capacity.max(1),
            wake,
        }
    }

    /// Push without blocking; `notice` builds the lost-items notice if one is due
    pub fn push(&self, item: T, notice: impl FnOnce(u64) -> T) -> PushOutcome {
        let mut state = self.state.lock();

        if state.items.len() >= self.capacity {
            state.lost += 1;
            return PushOutcome::Dropped;
        }

        let outcome = if state.lost > 0 {
            let lost = std::mem::take(&mut state.lost);
            state.items.push_back(notice(lost));
            if state.items.len() >= self.capacity {
                // The notice took the last slot
                state.lost = 1;
                drop(state);
                self.wake.notify_one();
                return PushOutcome::Dropped;
            }
            PushOutcome::QueuedAfterNotice(lost)
        } else {
            PushOutcome::Queued
        };

        state.items.push_back(item);
        drop(state);
        self.wake.notify_one();
        outcome
    }

    pub fn pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Drop everything queued and forget past losses
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock();
        state.lost = 0;
        let purged = state.items.len();
        state.items.clear();
        purged
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Losses since the last notice
    pub fn lost(&self) -> u64 {
        self.state.lock().lost
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[derive(Debug, PartialEq)]
    enum Item {
        Value(u32),
        Lost(u64),
    }

    fn queue(capacity: usize) -> LossyQueue<Item> {
        LossyQueue::new(capacity, Arc::new(Notify::new()))
    }

    #[test]
    fn test_capacity_two_five_events() {
        let q = queue(2);
        let outcomes: Vec<_> = (1..=5).map(|i| q.push(Item::Value(i), Item::Lost)).collect();
        assert_eq!(outcomes.iter().filter(|o| **o == PushOutcome::Queued).count(), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.lost(), 3);

        assert_eq!(q.pop(), Some(Item::Value(1)));
        assert_eq!(q.pop(), Some(Item::Value(2)));

        assert_eq!(q.push(Item::Value(6), Item::Lost), PushOutcome::QueuedAfterNotice(3));
        assert_eq!(q.pop(), Some(Item::Lost(3)));
        assert_eq!(q.pop(), Some(Item::Value(6)));
        assert_eq!(q.pop(), None);
        assert_eq!(q.lost(), 0);
    }

    #[test]
    fn test_one_notice_per_recovery() {
        let q = queue(3);
        for i in 0..3 {
            q.push(Item::Value(i), Item::Lost);
        }
        q.push(Item::Value(99), Item::Lost);
        q.purge();

        q.push(Item::Value(10), Item::Lost);
        q.push(Item::Value(11), Item::Lost);
        let drained: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        // purge forgets losses, so no notice here
        assert_eq!(drained, vec![Item::Value(10), Item::Value(11)]);

        for i in 0..5 {
            q.push(Item::Value(i), Item::Lost);
        }
        while q.pop().is_some() {}
        q.push(Item::Value(7), Item::Lost);
        q.push(Item::Value(8), Item::Lost);
        let drained: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(drained, vec![Item::Lost(2), Item::Value(7), Item::Value(8)]);
    }

    #[test]
    fn test_notice_taking_last_slot_counts_item_as_lost() {
        let q = queue(2);
        q.push(Item::Value(1), Item::Lost);
        q.push(Item::Value(2), Item::Lost);
        q.push(Item::Value(3), Item::Lost);
        q.pop();

        assert_eq!(q.push(Item::Value(4), Item::Lost), PushOutcome::Dropped);
        assert_eq!(q.lost(), 1);
        assert_eq!(q.pop(), Some(Item::Value(2)));
        assert_eq!(q.pop(), Some(Item::Lost(1)));
    }

    #[test]
    fn test_publisher_never_blocks() {
        let q = queue(16);
        let started = Instant::now();
        for i in 0..100_000 {
            q.push(Item::Value(i), Item::Lost);
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(q.len(), 16);
        assert_eq!(q.lost(), 100_000 - 16);
    }
}
