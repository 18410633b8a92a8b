//! Unbounded FIFO hand-off between collectors and the delivery loop.

use crate::event::SecurityEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

/// Many producers, one or more consumers. Every operation takes the lock once,
/// so a dequeued event is handed to exactly one caller.
#[derive(Debug, Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<SecurityEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event: SecurityEvent) {
        debug!(
            event_type = event.event_type(),
            severity = %event.severity(),
            "event queued"
        );
        self.inner.lock().push_back(event);
    }

    pub fn enqueue_all(&self, events: impl IntoIterator<Item = SecurityEvent>) {
        let mut q = self.inner.lock();
        for event in events {
            debug!(
                event_type = event.event_type(),
                severity = %event.severity(),
                "event queued"
            );
            q.push_back(event);
        }
    }

    pub fn dequeue(&self) -> Option<SecurityEvent> {
        self.inner.lock().pop_front()
    }

    /// Remove up to `max` of the oldest events in one critical section.
    pub fn dequeue_batch(&self, max: usize) -> Vec<SecurityEvent> {
        let mut q = self.inner.lock();
        let n = max.min(q.len());
        q.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn ev(kind: &str) -> SecurityEvent {
        SecurityEvent::new(kind, Severity::Low)
    }

    #[test]
    fn fifo_order() {
        let q = EventQueue::new();
        q.enqueue(ev("a"));
        q.enqueue(ev("b"));
        q.enqueue(ev("c"));
        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue().unwrap().event_type(), "a");
        assert_eq!(q.dequeue().unwrap().event_type(), "b");
        assert_eq!(q.dequeue().unwrap().event_type(), "c");
        assert!(q.dequeue().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn requeue_goes_to_tail() {
        let q = EventQueue::new();
        q.enqueue(ev("first"));
        q.enqueue(ev("second"));
        let failed = q.dequeue().unwrap();
        q.enqueue(failed);
        assert_eq!(q.dequeue().unwrap().event_type(), "second");
        assert_eq!(q.dequeue().unwrap().event_type(), "first");
    }

    #[test]
    fn batch_is_bounded() {
        let q = EventQueue::new();
        q.enqueue_all((0..5).map(|i| ev(&format!("e{}", i))));
        let batch = q.dequeue_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].event_type(), "e0");
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue_batch(10).len(), 2);
        assert!(q.dequeue_batch(10).is_empty());
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        let q = Arc::new(EventQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        q.enqueue(ev("p"));
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..2000 {
                        if let Some(e) = q.dequeue() {
                            seen.push(e.id().to_string());
                        }
                    }
                    seen
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        let mut ids = HashSet::new();
        let mut total = 0;
        for c in consumers {
            for id in c.join().unwrap() {
                total += 1;
                ids.insert(id);
            }
        }
        while let Some(e) = q.dequeue() {
            total += 1;
            ids.insert(e.id().to_string());
        }
        assert_eq!(total, 1000);
        assert_eq!(ids.len(), 1000);
    }
}
