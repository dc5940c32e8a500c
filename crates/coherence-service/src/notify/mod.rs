//! # Notification queue and dispatch
//!
//! Invalidation and broadcast notifications travel through two pieces:
//!
//! - The [`NotificationQueue`], a per-consumer mailbox of pending notifications
//!   with coalescing on `put` and acknowledgement-based removal. Filters are
//!   evaluated late, on every `get_next`, so a notification that is currently
//!   not visible to a consumer stays queued and may become visible later.
//! - The [`NotificationDispatcher`], which hands a batch of notifications to a
//!   background task and immediately returns an awaitable handle. All handlers
//!   of one notification run to completion before the next notification of the
//!   batch starts; this is what lets the cache-invalidation handler run before
//!   any listener observes the event.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

mod dispatch;
mod queue;

pub use dispatch::{DispatchHandle, NotificationDispatcher, NotificationHandler};
pub use queue::{ConsumerId, NotificationQueue};

/// A protocol violation on the notification queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A notification without a stable, non-empty id cannot be deduplicated or
    /// acknowledged.
    #[error("notification has an empty id")]
    InvalidNotification,
    /// Acknowledging with an empty consumer id.
    #[error("empty consumer id")]
    InvalidConsumer,
}

/// The payload contract of a queued notification.
///
/// Implementations are enqueued as `Arc<dyn Notification>` and must carry a
/// stable id: the id is what consumers acknowledge.
pub trait Notification: Send + Sync {
    /// A stable identifier, used for acknowledgement and deduplication.
    fn id(&self) -> &str;

    /// A dotted, hierarchical type tag, e.g. `cache.invalidate`.
    ///
    /// Dispatch handlers register for a prefix and receive every notification
    /// whose kind equals the prefix or starts with `prefix.`.
    fn kind(&self) -> &str;

    /// The serializable payload delivered to handlers.
    fn payload(&self) -> Value;

    /// How long the notification may stay queued before it is dropped.
    fn ttl(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Whether the given newer notification supersedes this one.
    ///
    /// Checked on `put`: every pending notification reporting `true` for the
    /// incoming one is replaced by it, so at most one of the coalesced group
    /// survives.
    fn coalesce(&self, _candidate: &dyn Notification) -> bool {
        false
    }
}

/// Decides whether a queued notification is visible to a consumer.
///
/// Evaluated just in time on every `get_next`, never at `put` time: a filter
/// may flip to accepting later (e.g. when session state changes) and the
/// notification becomes visible then.
pub trait NotificationFilter: Send + Sync {
    /// An inactive filter hides the notification without removing it.
    fn is_active(&self) -> bool {
        true
    }

    /// Whether the notification concerns the given consumer.
    ///
    /// The consumer is passed in explicitly rather than picked up from ambient
    /// session state.
    fn accept(&self, consumer: &str) -> bool;

    /// Multicast notifications must be seen by every matching consumer before
    /// being dropped; singlecast ones are dropped after the first ack.
    fn is_multicast(&self) -> bool;
}
