use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;

use futures::future::BoxFuture;

use super::CacheContents;

/// Bounds required of a cache key.
///
/// Blanket-implemented; callers never implement this by hand.
pub trait CacheKey: Clone + Ord + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Ord + Hash + Debug + Send + Sync + 'static> CacheKey for T {}

/// Bounds required of a cache value.
pub trait CacheValue: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> CacheValue for T {}

/// Computes values for missing cache keys.
///
/// Implemented by business logic, or by [`RemoteResolver`](super::RemoteResolver)
/// for caches whose authoritative copy lives on a remote peer.
///
/// A resolver returning `Ok(None)` states that there is *no* value for the key.
/// That absence is a valid result: the engine stores it and will not invoke the
/// resolver for the key again. An `Err` on the other hand is transported verbatim
/// to the caller and nothing is stored, so a retried lookup resolves again.
pub trait Resolver<K: CacheKey, V: CacheValue>: Send + Sync {
    /// Resolves a single key.
    fn resolve<'a>(&'a self, key: &'a K) -> BoxFuture<'a, CacheContents<Option<V>>>;

    /// Resolves many keys at once.
    ///
    /// Keys without a value are simply omitted from the returned map. The default
    /// implementation falls back to per-key resolution; implementations with a
    /// cheaper bulk path should override it.
    fn resolve_all<'a>(&'a self, keys: &'a [K]) -> BoxFuture<'a, CacheContents<BTreeMap<K, V>>> {
        Box::pin(async move {
            let mut resolved = BTreeMap::new();
            for key in keys {
                if let Some(value) = self.resolve(key).await? {
                    resolved.insert(key.clone(), value);
                }
            }
            Ok(resolved)
        })
    }
}
