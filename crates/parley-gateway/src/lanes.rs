//! Per-conversation ordering for pipeline work.
//!
//! A lane is busy while one job for its conversation (an inbound message
//! or an API send) is being processed. Jobs that arrive meanwhile wait in
//! the lane and are taken in arrival order by the task that holds it.
//! Lanes of different conversations are independent.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Result of offering a message to a lane.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue<T> {
    /// The lane was idle and is now held by the caller, who must process
    /// the message and then call [`Lanes::next`] until it returns `None`.
    ProcessNow(T),
    /// The lane is busy; the message will be handed to its holder.
    Queued,
}

pub struct Lanes<T> {
    lanes: Mutex<HashMap<Uuid, VecDeque<T>>>,
}

impl<T> Default for Lanes<T> {
    fn default() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Lanes<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, key: Uuid, item: T) -> Enqueue<T> {
        let mut lanes = self.lanes.lock();
        match lanes.get_mut(&key) {
            Some(pending) => {
                pending.push_back(item);
                Enqueue::Queued
            }
            None => {
                lanes.insert(key, VecDeque::new());
                Enqueue::ProcessNow(item)
            }
        }
    }

    /// Next waiting item for the holder of `key`. Returns `None` and
    /// releases the lane when nothing is waiting.
    pub fn next(&self, key: Uuid) -> Option<T> {
        let mut lanes = self.lanes.lock();
        let pending = lanes.get_mut(&key)?;
        match pending.pop_front() {
            Some(item) => Some(item),
            None => {
                lanes.remove(&key);
                None
            }
        }
    }

    /// Number of lanes currently held.
    pub fn busy(&self) -> usize {
        self.lanes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_item_processes_now() {
        let lanes = Lanes::new();
        let key = Uuid::new_v4();
        assert_eq!(lanes.enqueue(key, 1), Enqueue::ProcessNow(1));
        assert_eq!(lanes.enqueue(key, 2), Enqueue::Queued);
        assert_eq!(lanes.enqueue(key, 3), Enqueue::Queued);
        assert_eq!(lanes.next(key), Some(2));
        assert_eq!(lanes.next(key), Some(3));
        assert_eq!(lanes.next(key), None);
        assert_eq!(lanes.busy(), 0);
        assert_eq!(lanes.enqueue(key, 4), Enqueue::ProcessNow(4));
    }

    #[test]
    fn test_lanes_are_independent() {
        let lanes = Lanes::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(lanes.enqueue(a, "a1"), Enqueue::ProcessNow("a1"));
        assert_eq!(lanes.enqueue(b, "b1"), Enqueue::ProcessNow("b1"));
        assert_eq!(lanes.busy(), 2);
    }

    #[test]
    fn test_next_on_unknown_lane() {
        let lanes: Lanes<u8> = Lanes::new();
        assert_eq!(lanes.next(Uuid::new_v4()), None);
    }
}
