use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// Bounded set of transport message ids the gateway sent itself.
///
/// The network reports our own sends back as `from_me` messages; ids found
/// here are echoes. When full, the oldest id is forgotten.
pub struct SentIds {
    inner: Mutex<SentIdsInner>,
    capacity: usize,
}

struct SentIdsInner {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SentIdsInner {
                order: VecDeque::new(),
                ids: HashSet::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn remember(&self, id: &str) {
        let mut inner = self.inner.lock();
        if !inner.ids.insert(id.to_string()) {
            return;
        }
        inner.order.push_back(id.to_string());
        while inner.order.len() > self.capacity {
            if let Some(old) = inner.order.pop_front() {
                inner.ids.remove(&old);
            }
        }
    }

    /// Remove `id`, returning whether it was present.
    pub fn take(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.ids.remove(id) {
            inner.order.retain(|o| o != id);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_consumes_id() {
        let ids = SentIds::new(8);
        ids.remember("A");
        assert!(ids.take("A"));
        assert!(!ids.take("A"));
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let ids = SentIds::new(2);
        ids.remember("A");
        ids.remember("B");
        ids.remember("C");
        assert_eq!(ids.len(), 2);
        assert!(!ids.take("A"));
        assert!(ids.take("B"));
        assert!(ids.take("C"));
    }

    #[test]
    fn test_duplicate_remember_is_noop() {
        let ids = SentIds::new(2);
        ids.remember("A");
        ids.remember("A");
        ids.remember("B");
        assert!(ids.take("A"));
    }
}
