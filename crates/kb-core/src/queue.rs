//! BackpressureQueue - bounded deque for deferred answers
//!
//! Holds messages that cannot be answered immediately without growing
//! unboundedly. Offers at the tail, re-inserts retried items at the head so
//! they keep chronological priority, and counts every rejected offer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use kb_common::{QueueItem, QueueStatus};

/// Bounded double-ended queue with atomic size accounting and drop counting.
///
/// Capacity is fixed at construction; there is no automatic growth. The size
/// counter is updated inside the same critical section as the deque itself,
/// so it never drifts from the number of items actually held.
pub struct BackpressureQueue {
    items: Mutex<VecDeque<QueueItem>>,
    size: AtomicUsize,
    capacity: usize,
    dropped: AtomicU64,
}

impl BackpressureQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            size: AtomicUsize::new(0),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an item if there is room; otherwise count a drop and refuse.
    pub fn offer_tail(&self, item: QueueItem) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            drop(items);
            self.record_drop(&item);
            return false;
        }
        items.push_back(item);
        self.size.store(items.len(), Ordering::SeqCst);
        true
    }

    /// Insert an item at the front, ahead of everything already queued.
    ///
    /// Used to reinsert an item that must be retried before newer items, so
    /// re-queued work keeps its chronological priority. Same capacity rule as
    /// `offer_tail`.
    pub fn offer_head(&self, item: QueueItem) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            drop(items);
            self.record_drop(&item);
            return false;
        }
        items.push_front(item);
        self.size.store(items.len(), Ordering::SeqCst);
        true
    }

    /// Remove and return the head item. Never blocks.
    pub fn poll(&self) -> Option<QueueItem> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        self.size.store(items.len(), Ordering::SeqCst);
        item
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cumulative count of offers rejected due to capacity.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> QueueStatus {
        let size = self.len();
        let utilization_pct = if self.capacity == 0 {
            100.0
        } else {
            size as f64 / self.capacity as f64 * 100.0
        };
        QueueStatus {
            size,
            capacity: self.capacity,
            utilization_pct,
            dropped: self.dropped_count(),
        }
    }

    fn record_drop(&self, item: &QueueItem) {
        let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::counter!("kudosbot_queue_dropped_total").increment(1);
        warn!(
            event_id = %item.event.id,
            chat_id = item.session_key.chat_id,
            capacity = self.capacity,
            dropped = dropped,
            "Queue at capacity, dropping item"
        );
    }
}

impl std::fmt::Debug for BackpressureQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureQueue")
            .field("size", &self.len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_common::{Event, EventKind};

    fn item(id: i64) -> QueueItem {
        let event = Event::new(EventKind::Message, id, id).with_text(format!("msg-{id}"));
        QueueItem::new(event, true)
    }

    #[test]
    fn offer_and_poll_are_fifo() {
        let queue = BackpressureQueue::new(4);
        assert!(queue.offer_tail(item(1)));
        assert!(queue.offer_tail(item(2)));

        assert_eq!(queue.poll().unwrap().session_key.chat_id, 1);
        assert_eq!(queue.poll().unwrap().session_key.chat_id, 2);
        assert!(queue.poll().is_none());
    }

    #[test]
    fn offer_tail_at_capacity_drops_and_counts() {
        let queue = BackpressureQueue::new(2);
        assert!(queue.offer_tail(item(1)));
        assert!(queue.offer_tail(item(2)));

        assert!(!queue.offer_tail(item(3)));
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.len(), 2);

        // Space frees up after a poll; the drop counter is monotonic.
        assert_eq!(queue.poll().unwrap().session_key.chat_id, 1);
        assert!(queue.offer_tail(item(3)));
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn offer_head_takes_priority_over_existing_items() {
        let queue = BackpressureQueue::new(4);
        assert!(queue.offer_tail(item(1)));
        assert!(queue.offer_tail(item(2)));

        assert!(queue.offer_head(item(99)));
        assert_eq!(queue.poll().unwrap().session_key.chat_id, 99);
        assert_eq!(queue.poll().unwrap().session_key.chat_id, 1);
    }

    #[test]
    fn offer_head_respects_capacity() {
        let queue = BackpressureQueue::new(1);
        assert!(queue.offer_tail(item(1)));
        assert!(!queue.offer_head(item(2)));
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn status_reports_utilization() {
        let queue = BackpressureQueue::new(4);
        queue.offer_tail(item(1));
        queue.offer_tail(item(2));
        queue.offer_tail(item(3));

        let status = queue.status();
        assert_eq!(status.size, 3);
        assert_eq!(status.capacity, 4);
        assert!((status.utilization_pct - 75.0).abs() < f64::EPSILON);
        assert_eq!(status.dropped, 0);
        assert!(status.summary().contains("3/4"));
    }
}
