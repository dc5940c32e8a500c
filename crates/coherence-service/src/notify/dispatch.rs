use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use tokio::sync::oneshot;

use super::Notification;

/// A local handler invoked for every dispatched notification whose kind matches
/// the prefix the handler was registered under.
pub trait NotificationHandler: Send + Sync {
    fn handle<'a>(&'a self, notification: &'a dyn Notification) -> BoxFuture<'a, ()>;
}

type DoneSignal = Shared<BoxFuture<'static, ()>>;

/// An awaitable handle for one dispatched batch.
#[derive(Clone)]
pub struct DispatchHandle {
    done: DoneSignal,
}

impl DispatchHandle {
    /// Waits until every notification of the batch has been handled.
    pub async fn wait(&self) {
        self.done.clone().await;
    }
}

/// Delivers notification batches asynchronously to registered local handlers.
///
/// [`dispatch`](Self::dispatch) schedules the delivery as a background task and
/// immediately returns a handle. Within one batch, all handlers of a
/// notification run to completion before the next notification starts; no order
/// is guaranteed between separately dispatched batches. Callers that need the
/// "everything delivered" guarantee join the outstanding handles via
/// [`wait_idle`](Self::wait_idle).
#[derive(Default)]
pub struct NotificationDispatcher {
    handlers: Mutex<Vec<(String, Arc<dyn NotificationHandler>)>>,
    outstanding: Mutex<Vec<DoneSignal>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for all notifications whose kind equals
    /// `kind_prefix` or starts with `kind_prefix.`.
    ///
    /// Registration order is delivery order for handlers matching the same
    /// notification.
    pub fn register_handler(
        &self,
        kind_prefix: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.push((kind_prefix.into(), handler));
    }

    fn matches(prefix: &str, kind: &str) -> bool {
        kind == prefix || (kind.starts_with(prefix) && kind[prefix.len()..].starts_with('.'))
    }

    /// Schedules delivery of a batch and returns without waiting for it.
    ///
    /// The handler set is snapshotted now; handlers registered later do not see
    /// this batch.
    pub fn dispatch(&self, batch: Vec<Arc<dyn Notification>>) -> DispatchHandle {
        let handlers: Vec<_> = self.handlers.lock().unwrap().clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            for notification in batch {
                let kind = notification.kind().to_owned();
                for (prefix, handler) in &handlers {
                    if Self::matches(prefix, &kind) {
                        handler.handle(&*notification).await;
                    }
                }
                tracing::trace!(
                    notification_id = notification.id(),
                    kind,
                    "notification delivered",
                );
            }
            // Receiver may be gone if nobody awaits the handle.
            let _ = tx.send(());
        });

        let done: DoneSignal = rx.map(|_| ()).boxed().shared();
        let handle = DispatchHandle { done: done.clone() };

        let mut outstanding = self.outstanding.lock().unwrap();
        // Drop signals that already fired before growing the set.
        outstanding.retain(|signal| signal.peek().is_none());
        outstanding.push(done);

        handle
    }

    /// Waits for all currently outstanding deliveries.
    ///
    /// Returns `false` if the timeout elapsed first. A timeout does not cancel
    /// anything, delivery keeps running in the background and stays
    /// outstanding, so a later `wait_idle` still waits for it.
    pub async fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let outstanding: Vec<_> = {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding.retain(|signal| signal.peek().is_none());
            outstanding.clone()
        };
        let all = join_all(outstanding);
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, all).await.is_ok(),
            None => {
                all.await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;

    use super::*;

    struct TestNotification {
        id: String,
        kind: String,
    }

    impl Notification for TestNotification {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> &str {
            &self.kind
        }
        fn payload(&self) -> Value {
            Value::Null
        }
    }

    fn notification(id: &str, kind: &str) -> Arc<dyn Notification> {
        Arc::new(TestNotification {
            id: id.to_owned(),
            kind: kind.to_owned(),
        })
    }

    /// Records the order in which (handler, notification) pairs ran.
    struct RecordingHandler {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl NotificationHandler for RecordingHandler {
        fn handle<'a>(&'a self, notification: &'a dyn Notification) -> BoxFuture<'a, ()> {
            async move {
                tokio::time::sleep(self.delay).await;
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("{}:{}", self.name, notification.id()));
            }
            .boxed()
        }
    }

    #[test]
    fn kind_prefix_matching() {
        assert!(NotificationDispatcher::matches("cache", "cache"));
        assert!(NotificationDispatcher::matches("cache", "cache.invalidate"));
        assert!(NotificationDispatcher::matches(
            "cache.invalidate",
            "cache.invalidate"
        ));
        assert!(!NotificationDispatcher::matches("cache", "cachemiss"));
        assert!(!NotificationDispatcher::matches("cache.invalidate", "cache"));
    }

    #[tokio::test]
    async fn handlers_of_one_notification_finish_before_the_next() {
        let dispatcher = NotificationDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.register_handler(
            "cache",
            Arc::new(RecordingHandler {
                name: "slow",
                log: Arc::clone(&log),
                delay: Duration::from_millis(50),
            }),
        );
        dispatcher.register_handler(
            "cache",
            Arc::new(RecordingHandler {
                name: "fast",
                log: Arc::clone(&log),
                delay: Duration::from_millis(0),
            }),
        );

        let handle = dispatcher.dispatch(vec![
            notification("n1", "cache.invalidate"),
            notification("n2", "cache.invalidate"),
        ]);
        handle.wait().await;

        let log = log.lock().unwrap();
        assert_eq!(*log, vec!["slow:n1", "fast:n1", "slow:n2", "fast:n2"]);
    }

    #[tokio::test]
    async fn dispatch_returns_before_delivery_completes() {
        let dispatcher = NotificationDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        struct Counting(Arc<AtomicUsize>);
        impl NotificationHandler for Counting {
            fn handle<'a>(&'a self, _n: &'a dyn Notification) -> BoxFuture<'a, ()> {
                let count = Arc::clone(&self.0);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    count.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }
        }

        dispatcher.register_handler("test", Arc::new(Counting(Arc::clone(&count))));

        let _handle = dispatcher.dispatch(vec![notification("n1", "test")]);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(dispatcher.wait_idle(None).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_idle_times_out_without_canceling() {
        let dispatcher = NotificationDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        struct Slow(Arc<AtomicUsize>);
        impl NotificationHandler for Slow {
            fn handle<'a>(&'a self, _n: &'a dyn Notification) -> BoxFuture<'a, ()> {
                let count = Arc::clone(&self.0);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    count.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }
        }

        dispatcher.register_handler("test", Arc::new(Slow(Arc::clone(&count))));

        let handle = dispatcher.dispatch(vec![notification("n1", "test")]);
        assert!(!dispatcher.wait_idle(Some(Duration::from_millis(10))).await);

        // the delivery was not canceled by the timed-out wait
        handle.wait().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_out_deliveries_remain_outstanding() {
        let dispatcher = NotificationDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        struct Slow(Arc<AtomicUsize>);
        impl NotificationHandler for Slow {
            fn handle<'a>(&'a self, _n: &'a dyn Notification) -> BoxFuture<'a, ()> {
                let count = Arc::clone(&self.0);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    count.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }
        }

        dispatcher.register_handler("test", Arc::new(Slow(Arc::clone(&count))));

        let _handle = dispatcher.dispatch(vec![notification("n1", "test")]);
        assert!(!dispatcher.wait_idle(Some(Duration::from_millis(10))).await);

        // the in-flight delivery was not forgotten by the timed-out wait
        assert!(dispatcher.wait_idle(None).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmatched_kinds_are_skipped() {
        let dispatcher = NotificationDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.register_handler(
            "cache.invalidate",
            Arc::new(RecordingHandler {
                name: "h",
                log: Arc::clone(&log),
                delay: Duration::from_millis(0),
            }),
        );

        dispatcher
            .dispatch(vec![notification("n1", "session.expired")])
            .wait()
            .await;

        assert!(log.lock().unwrap().is_empty());
    }
}
