use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::{Notification, NotificationFilter, QueueError};

/// Identifies a consumer (e.g. a session) of the queue.
pub type ConsumerId = String;

struct QueueEntry {
    notification: Arc<dyn Notification>,
    filter: Arc<dyn NotificationFilter>,
    enqueued_at: Instant,
    /// Consumers the notification was returned to.
    seen: HashSet<ConsumerId>,
    /// Consumers that acknowledged it.
    acked: HashSet<ConsumerId>,
}

impl QueueEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.enqueued_at) >= self.notification.ttl()
    }
}

/// A mailbox of pending notifications for one logical channel.
///
/// `put`, `get_next` and `ack` are mutually exclusive under one lock, keeping
/// the coalesce scan and the ack bookkeeping consistent. Entries that outlive
/// their ttl are pruned on every operation.
#[derive(Default)]
pub struct NotificationQueue {
    pending: Mutex<Vec<QueueEntry>>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a notification for all consumers matching the filter.
    ///
    /// Every already-pending notification that reports the new one as
    /// superseding (`pending.coalesce(new)`) is replaced, so at most one of the
    /// coalesced group survives.
    pub fn put(
        &self,
        notification: Arc<dyn Notification>,
        filter: Arc<dyn NotificationFilter>,
    ) -> Result<(), QueueError> {
        if notification.id().is_empty() {
            return Err(QueueError::InvalidNotification);
        }

        let mut pending = self.pending.lock().unwrap();
        let now = Instant::now();
        pending.retain(|entry| !entry.expired(now));

        let before = pending.len();
        pending.retain(|entry| !entry.notification.coalesce(&*notification));
        let coalesced = before - pending.len();
        if coalesced > 0 {
            tracing::trace!(
                notification_id = notification.id(),
                coalesced,
                "notification superseded pending ones",
            );
        }

        pending.push(QueueEntry {
            notification,
            filter,
            enqueued_at: now,
            seen: HashSet::new(),
            acked: HashSet::new(),
        });
        Ok(())
    }

    /// Returns the notifications currently visible to the consumer and marks
    /// them as seen.
    ///
    /// Filters are evaluated now, not at `put` time: entries whose filter is
    /// inactive or does not accept the consumer are skipped but stay queued.
    /// An entry already returned to this consumer is not returned again.
    pub fn get_next(&self, consumer: &str) -> Vec<Arc<dyn Notification>> {
        let mut pending = self.pending.lock().unwrap();
        let now = Instant::now();
        pending.retain(|entry| !entry.expired(now));

        let mut visible = Vec::new();
        for entry in pending.iter_mut() {
            if entry.seen.contains(consumer) {
                continue;
            }
            if !entry.filter.is_active() || !entry.filter.accept(consumer) {
                continue;
            }
            entry.seen.insert(consumer.to_owned());
            visible.push(Arc::clone(&entry.notification));
        }
        visible
    }

    /// Marks the given notification ids as received by the consumer.
    ///
    /// Acking is idempotent. A singlecast notification is removed on the first
    /// ack from any consumer; a multicast one only once every consumer it was
    /// returned to has acked.
    pub fn ack(&self, consumer: &str, ids: &[&str]) -> Result<(), QueueError> {
        if consumer.is_empty() {
            return Err(QueueError::InvalidConsumer);
        }

        let mut pending = self.pending.lock().unwrap();
        let now = Instant::now();
        pending.retain(|entry| !entry.expired(now));

        for entry in pending.iter_mut() {
            if ids.contains(&entry.notification.id()) {
                entry.acked.insert(consumer.to_owned());
            }
        }

        pending.retain(|entry| {
            if !ids.contains(&entry.notification.id()) {
                return true;
            }
            if !entry.filter.is_multicast() {
                // First ack wins, remaining consumers will not see it.
                return false;
            }
            !entry.seen.iter().all(|seen| entry.acked.contains(seen))
        });
        Ok(())
    }

    /// Number of pending entries, visible or not. Diagnostics only.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;

    struct TestNotification {
        id: String,
        subject: String,
    }

    impl TestNotification {
        fn new(id: &str, subject: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_owned(),
                subject: subject.to_owned(),
            })
        }
    }

    impl Notification for TestNotification {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> &str {
            "test"
        }

        fn payload(&self) -> Value {
            json!({ "subject": self.subject })
        }

        fn ttl(&self) -> Duration {
            Duration::from_secs(60)
        }

        fn coalesce(&self, candidate: &dyn Notification) -> bool {
            candidate.payload() == self.payload()
        }
    }

    struct TestFilter {
        multicast: bool,
        active: bool,
    }

    impl NotificationFilter for TestFilter {
        fn is_active(&self) -> bool {
            self.active
        }

        fn accept(&self, _consumer: &str) -> bool {
            true
        }

        fn is_multicast(&self) -> bool {
            self.multicast
        }
    }

    fn filter(multicast: bool) -> Arc<TestFilter> {
        Arc::new(TestFilter {
            multicast,
            active: true,
        })
    }

    #[test]
    fn put_rejects_empty_id() {
        let queue = NotificationQueue::new();
        let result = queue.put(TestNotification::new("", "x"), filter(false));
        assert!(matches!(result, Err(QueueError::InvalidNotification)));
    }

    #[test]
    fn coalescing_keeps_only_the_newest() {
        let queue = NotificationQueue::new();
        queue
            .put(TestNotification::new("n1", "same"), filter(true))
            .unwrap();
        queue
            .put(TestNotification::new("n2", "same"), filter(true))
            .unwrap();
        // n2 already replaced n1; n3 replaces n2.
        queue
            .put(TestNotification::new("n3", "same"), filter(true))
            .unwrap();

        let visible = queue.get_next("a");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id(), "n3");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn singlecast_removed_after_first_ack() {
        let queue = NotificationQueue::new();
        queue
            .put(TestNotification::new("n1", "s"), filter(false))
            .unwrap();

        let for_a = queue.get_next("a");
        assert_eq!(for_a.len(), 1);
        queue.ack("a", &["n1"]).unwrap();

        assert!(queue.get_next("b").is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn multicast_stays_until_every_seen_consumer_acked() {
        let queue = NotificationQueue::new();
        queue
            .put(TestNotification::new("n1", "s"), filter(true))
            .unwrap();

        assert_eq!(queue.get_next("a").len(), 1);
        assert_eq!(queue.get_next("b").len(), 1);

        queue.ack("a", &["n1"]).unwrap();
        // b saw it and has not acked yet.
        assert_eq!(queue.len(), 1);
        // but b does not get it a second time
        assert!(queue.get_next("b").is_empty());

        queue.ack("b", &["n1"]).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn ack_is_idempotent() {
        let queue = NotificationQueue::new();
        queue
            .put(TestNotification::new("n1", "s"), filter(true))
            .unwrap();
        assert_eq!(queue.get_next("a").len(), 1);
        assert_eq!(queue.get_next("b").len(), 1);

        queue.ack("a", &["n1"]).unwrap();
        queue.ack("a", &["n1"]).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn entry_becomes_visible_once_its_filter_activates() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Toggle {
            active: AtomicBool,
        }

        impl NotificationFilter for Toggle {
            fn is_active(&self) -> bool {
                self.active.load(Ordering::SeqCst)
            }
            fn accept(&self, _consumer: &str) -> bool {
                true
            }
            fn is_multicast(&self) -> bool {
                false
            }
        }

        let toggle = Arc::new(Toggle {
            active: AtomicBool::new(false),
        });
        let queue = NotificationQueue::new();
        queue
            .put(
                TestNotification::new("n1", "s"),
                Arc::clone(&toggle) as Arc<dyn NotificationFilter>,
            )
            .unwrap();

        // hidden for now, but the filter is re-evaluated on every poll
        assert!(queue.get_next("a").is_empty());

        toggle.active.store(true, Ordering::SeqCst);
        let visible = queue.get_next("a");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id(), "n1");
    }

    #[test]
    fn inactive_filter_hides_but_keeps_the_entry() {
        let queue = NotificationQueue::new();
        queue
            .put(
                TestNotification::new("n1", "s"),
                Arc::new(TestFilter {
                    multicast: true,
                    active: false,
                }),
            )
            .unwrap();

        assert!(queue.get_next("a").is_empty());
        // still queued, it may become visible later
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn expired_entries_are_pruned() {
        struct ShortLived;
        impl Notification for ShortLived {
            fn id(&self) -> &str {
                "short"
            }
            fn kind(&self) -> &str {
                "test"
            }
            fn payload(&self) -> Value {
                Value::Null
            }
            fn ttl(&self) -> Duration {
                Duration::from_millis(10)
            }
        }

        let queue = NotificationQueue::new();
        queue.put(Arc::new(ShortLived), filter(true)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.get_next("a").is_empty());
        assert!(queue.is_empty());
    }
}
