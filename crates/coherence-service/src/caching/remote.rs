use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::notify::{Notification, NotificationHandler};

use super::{
    CacheContents,
    chain::CacheHandle,
    filter::InvalidationFilter,
    resolver::{CacheKey, CacheValue, Resolver},
};

/// The contract a remote peer presents to this process.
///
/// All calls address the peer's cache of the given logical id. The transport
/// behind this trait is out of scope here; any transport failure must surface as
/// [`CacheError::Remote`], which the engine treats exactly like a resolution
/// failure: propagated to the caller, never stored, not retried internally.
pub trait RemotePeer: Send + Sync {
    fn resolve<'a>(
        &'a self,
        cache_id: &'a str,
        key: Value,
    ) -> BoxFuture<'a, CacheContents<Option<Value>>>;

    fn resolve_all<'a>(
        &'a self,
        cache_id: &'a str,
        keys: Vec<Value>,
    ) -> BoxFuture<'a, CacheContents<Vec<(Value, Value)>>>;

    fn invalidate<'a>(
        &'a self,
        cache_id: &'a str,
        filter: Value,
        propagate: bool,
    ) -> BoxFuture<'a, CacheContents<()>>;
}

/// A [`Resolver`] that forwards cache misses to the remote peer's cache of the
/// same logical id.
///
/// Used inside a client-side cache whose authoritative copy lives remotely. Keys
/// and values cross the seam as JSON values.
pub struct RemoteResolver<K, V> {
    cache_id: String,
    peer: Arc<dyn RemotePeer>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> RemoteResolver<K, V> {
    pub fn new(cache_id: impl Into<String>, peer: Arc<dyn RemotePeer>) -> Self {
        Self {
            cache_id: cache_id.into(),
            peer,
            _types: PhantomData,
        }
    }
}

impl<K, V> Resolver<K, V> for RemoteResolver<K, V>
where
    K: CacheKey + Serialize + DeserializeOwned,
    V: CacheValue + DeserializeOwned,
{
    fn resolve<'a>(&'a self, key: &'a K) -> BoxFuture<'a, CacheContents<Option<V>>> {
        async move {
            let key = serde_json::to_value(key)?;
            let value = self.peer.resolve(&self.cache_id, key).await?;
            value
                .map(serde_json::from_value)
                .transpose()
                .map_err(Into::into)
        }
        .boxed()
    }

    fn resolve_all<'a>(&'a self, keys: &'a [K]) -> BoxFuture<'a, CacheContents<BTreeMap<K, V>>> {
        async move {
            let wire_keys = keys
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            let pairs = self.peer.resolve_all(&self.cache_id, wire_keys).await?;

            let mut resolved = BTreeMap::new();
            for (key, value) in pairs {
                resolved.insert(serde_json::from_value(key)?, serde_json::from_value(value)?);
            }
            Ok(resolved)
        }
        .boxed()
    }
}

/// The client-side companion of [`RemoteResolver`].
///
/// Intercepts `invalidate(filter, propagate = true)` and forwards the filter to
/// the remote peer instead of removing entries locally. The peer's own
/// invalidation fires a push notification which eventually clears the client
/// copy with `propagate = false`.
pub struct ClientNotificationCache<K: CacheKey, V: CacheValue> {
    delegate: Arc<dyn CacheHandle<K, V>>,
    peer: Arc<dyn RemotePeer>,
}

impl<K: CacheKey, V: CacheValue> ClientNotificationCache<K, V> {
    pub fn new(delegate: Arc<dyn CacheHandle<K, V>>, peer: Arc<dyn RemotePeer>) -> Self {
        Self { delegate, peer }
    }
}

impl<K: CacheKey + Serialize, V: CacheValue> CacheHandle<K, V> for ClientNotificationCache<K, V> {
    fn cache_id(&self) -> &str {
        self.delegate.cache_id()
    }

    fn layer_name(&self) -> &'static str {
        "client-notification"
    }

    fn get<'a>(&'a self, key: &'a K) -> BoxFuture<'a, CacheContents<Option<V>>> {
        self.delegate.get(key)
    }

    fn get_all<'a>(&'a self, keys: &'a [K]) -> BoxFuture<'a, CacheContents<BTreeMap<K, V>>> {
        self.delegate.get_all(keys)
    }

    fn invalidate<'a>(
        &'a self,
        filter: &'a InvalidationFilter<K>,
        propagate: bool,
    ) -> BoxFuture<'a, CacheContents<()>> {
        if !propagate {
            // The caller already knows the remote state is unaffected, for
            // example when applying an incoming invalidation notification.
            return self.delegate.invalidate(filter, false);
        }
        async move {
            let filter = serde_json::to_value(filter)?;
            self.peer
                .invalidate(self.delegate.cache_id(), filter, true)
                .await
        }
        .boxed()
    }

    fn peek(&self, key: &K) -> Option<Option<V>> {
        self.delegate.peek(key)
    }

    fn snapshot(&self) -> BTreeMap<K, Option<V>> {
        self.delegate.snapshot()
    }

    fn delegate(&self) -> Option<&dyn CacheHandle<K, V>> {
        Some(&*self.delegate)
    }
}

/// The notification kind used for cache invalidations.
pub const INVALIDATION_KIND: &str = "cache.invalidate";

static INVALIDATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// A push notification stating that entries of a shared cache were invalidated.
///
/// The filter is carried type-erased so notification plumbing stays independent
/// of the cache's key type.
#[derive(Debug, Clone)]
pub struct InvalidationNotification {
    id: String,
    cache_id: String,
    filter: Value,
    ttl: Duration,
}

impl InvalidationNotification {
    pub fn new<K: Ord + Serialize>(
        cache_id: impl Into<String>,
        filter: &InvalidationFilter<K>,
    ) -> CacheContents<Self> {
        let cache_id = cache_id.into();
        let seq = INVALIDATION_SEQ.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            id: format!("{cache_id}/invalidate/{seq}"),
            cache_id,
            filter: serde_json::to_value(filter)?,
            ttl: Duration::from_secs(60),
        })
    }

    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }
}

impl Notification for InvalidationNotification {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        INVALIDATION_KIND
    }

    fn payload(&self) -> Value {
        json!({
            "cache_id": self.cache_id,
            "filter": self.filter,
        })
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A newer invalidation supersedes this one if it concerns the same cache
    /// and covers at least the same entries.
    fn coalesce(&self, candidate: &dyn Notification) -> bool {
        if candidate.kind() != INVALIDATION_KIND {
            return false;
        }
        let payload = candidate.payload();
        if payload.get("cache_id").and_then(Value::as_str) != Some(self.cache_id.as_str()) {
            return false;
        }
        let filter = payload.get("filter");
        filter == Some(&json!("all")) || filter == Some(&self.filter)
    }
}

/// Applies incoming invalidation notifications to a local cache handle.
///
/// Register this *before* any listener handlers: the dispatcher runs all
/// handlers of one notification to completion before starting the next, so
/// listeners observe the cache already invalidated.
pub struct InvalidationHandler<K: CacheKey, V: CacheValue> {
    handle: Arc<dyn CacheHandle<K, V>>,
}

impl<K: CacheKey, V: CacheValue> InvalidationHandler<K, V> {
    pub fn new(handle: Arc<dyn CacheHandle<K, V>>) -> Self {
        Self { handle }
    }
}

impl<K, V> NotificationHandler for InvalidationHandler<K, V>
where
    K: CacheKey + DeserializeOwned,
    V: CacheValue,
{
    fn handle<'a>(&'a self, notification: &'a dyn Notification) -> BoxFuture<'a, ()> {
        async move {
            let payload = notification.payload();
            if payload.get("cache_id").and_then(Value::as_str) != Some(self.handle.cache_id()) {
                return;
            }
            let filter = match payload.get("filter") {
                Some(filter) => filter.clone(),
                None => return,
            };
            let filter: InvalidationFilter<K> = match serde_json::from_value(filter) {
                Ok(filter) => filter,
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        notification_id = notification.id(),
                        "malformed invalidation filter in notification",
                    );
                    return;
                }
            };
            // Local removal only: the remote state already reflects this change.
            if let Err(err) = self.handle.invalidate(&filter, false).await {
                tracing::error!(
                    error = %err,
                    cache_id = self.handle.cache_id(),
                    "failed to apply invalidation notification",
                );
            }
        }
        .boxed()
    }
}
