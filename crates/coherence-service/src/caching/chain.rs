use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::ConfigError;

use super::{
    CacheContents,
    engine::CacheEngine,
    filter::InvalidationFilter,
    remote::{ClientNotificationCache, RemotePeer},
    resolver::{CacheKey, CacheValue, Resolver},
};

/// One layer of a cache chain.
///
/// The outermost layer is what callers hold (usually as `Arc<dyn CacheHandle>`
/// obtained from the registry). Every layer except the engine holds an exclusive
/// reference to its delegate and forwards all operations it does not intercept.
/// [`delegate`](Self::delegate) exposes the chain for diagnostics; traversing it
/// depth-first yields the layers in exactly the configured order.
pub trait CacheHandle<K: CacheKey, V: CacheValue>: Send + Sync {
    fn cache_id(&self) -> &str;

    /// A short name identifying the layer, for diagnostics and chain-order tests.
    fn layer_name(&self) -> &'static str;

    fn get<'a>(&'a self, key: &'a K) -> BoxFuture<'a, CacheContents<Option<V>>>;

    fn get_all<'a>(&'a self, keys: &'a [K]) -> BoxFuture<'a, CacheContents<BTreeMap<K, V>>>;

    fn invalidate<'a>(
        &'a self,
        filter: &'a InvalidationFilter<K>,
        propagate: bool,
    ) -> BoxFuture<'a, CacheContents<()>>;

    /// The stored entry for a key, without triggering a resolution.
    ///
    /// `Some(None)` is a resolved absence, `None` means the key is not resolved
    /// yet.
    fn peek(&self, key: &K) -> Option<Option<V>>;

    fn snapshot(&self) -> BTreeMap<K, Option<V>>;

    /// The next layer towards the engine, or `None` for the engine itself.
    fn delegate(&self) -> Option<&dyn CacheHandle<K, V>>;
}

/// Builds a new layer around an existing chain.
pub type WrapperFactory<K, V> =
    Box<dyn FnOnce(Arc<dyn CacheHandle<K, V>>) -> Arc<dyn CacheHandle<K, V>> + Send>;

/// Caps the number of concurrently in-flight resolutions across all keys.
///
/// A semaphore gate around the delegate's miss path. Lookups whose keys are
/// already resolved bypass the gate, so hit traffic never stalls behind slow
/// resolutions holding all permits.
pub struct BoundedResolveCache<K: CacheKey, V: CacheValue> {
    delegate: Arc<dyn CacheHandle<K, V>>,
    gate: Semaphore,
}

impl<K: CacheKey, V: CacheValue> BoundedResolveCache<K, V> {
    pub fn new(delegate: Arc<dyn CacheHandle<K, V>>, bound: usize) -> Self {
        Self {
            delegate,
            gate: Semaphore::new(bound),
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheHandle<K, V> for BoundedResolveCache<K, V> {
    fn cache_id(&self) -> &str {
        self.delegate.cache_id()
    }

    fn layer_name(&self) -> &'static str {
        "bounded-resolve"
    }

    fn get<'a>(&'a self, key: &'a K) -> BoxFuture<'a, CacheContents<Option<V>>> {
        async move {
            if let Some(entry) = self.delegate.peek(key) {
                return Ok(entry);
            }
            // The semaphore is never closed, acquire cannot fail.
            let _permit = self.gate.acquire().await.unwrap();
            self.delegate.get(key).await
        }
        .boxed()
    }

    fn get_all<'a>(&'a self, keys: &'a [K]) -> BoxFuture<'a, CacheContents<BTreeMap<K, V>>> {
        async move {
            if keys.iter().any(|key| self.delegate.peek(key).is_none()) {
                let _permit = self.gate.acquire().await.unwrap();
                return self.delegate.get_all(keys).await;
            }
            self.delegate.get_all(keys).await
        }
        .boxed()
    }

    fn invalidate<'a>(
        &'a self,
        filter: &'a InvalidationFilter<K>,
        propagate: bool,
    ) -> BoxFuture<'a, CacheContents<()>> {
        self.delegate.invalidate(filter, propagate)
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

/// Assembles a cache engine plus its wrappers into one exposed handle.
///
/// The produced chain, from the outside in: registered wrappers in registration
/// order, then the bounded-concurrency layer if a bound was set, then the engine.
/// For a shared cache with a reachable remote peer, the client notification
/// wrapper is placed around the whole chain.
///
/// A builder is good for a single [`build`](Self::build); obtain a fresh one per
/// cache.
pub struct CacheBuilder<K: CacheKey, V: CacheValue> {
    id: String,
    resolver: Option<Arc<dyn Resolver<K, V>>>,
    thread_safe: bool,
    atomic_insertion: bool,
    max_concurrent_resolves: Option<usize>,
    wrappers: Vec<WrapperFactory<K, V>>,
    shared: bool,
    peer: Option<Arc<dyn RemotePeer>>,
}

impl<K: CacheKey, V: CacheValue> CacheBuilder<K, V> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resolver: None,
            thread_safe: true,
            atomic_insertion: true,
            max_concurrent_resolves: None,
            wrappers: Vec::new(),
            shared: false,
            peer: None,
        }
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver<K, V>>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    pub fn atomic_insertion(mut self, atomic_insertion: bool) -> Self {
        self.atomic_insertion = atomic_insertion;
        self
    }

    pub fn max_concurrent_resolves(mut self, bound: usize) -> Self {
        self.max_concurrent_resolves = Some(bound);
        self
    }

    /// Registers an additional wrapper. Wrappers are applied so that the first
    /// registered one ends up outermost.
    pub fn wrapper(mut self, factory: WrapperFactory<K, V>) -> Self {
        self.wrappers.push(factory);
        self
    }

    /// Marks the cache as shared across client and server.
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// The remote peer holding the authoritative copy of this cache.
    pub fn peer(mut self, peer: Arc<dyn RemotePeer>) -> Self {
        self.peer = Some(peer);
        self
    }
}

impl<K: CacheKey + Serialize, V: CacheValue> CacheBuilder<K, V> {
    pub fn build(self) -> Result<Arc<dyn CacheHandle<K, V>>, ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::MissingId);
        }
        let resolver = self.resolver.ok_or_else(|| {
            ConfigError::MissingResolver(self.id.clone())
        })?;

        let engine = CacheEngine::new(
            self.id.clone(),
            resolver,
            self.thread_safe,
            self.atomic_insertion,
        );
        let mut chain: Arc<dyn CacheHandle<K, V>> = Arc::new(engine);

        if let Some(bound) = self.max_concurrent_resolves {
            if bound == 0 {
                return Err(ConfigError::InvalidResolveBound(self.id));
            }
            chain = Arc::new(BoundedResolveCache::new(chain, bound));
        }

        // Reverse application keeps the first registered wrapper outermost.
        for factory in self.wrappers.into_iter().rev() {
            chain = factory(chain);
        }

        if self.shared {
            if let Some(peer) = self.peer {
                chain = Arc::new(ClientNotificationCache::new(chain, peer));
            }
        }

        tracing::debug!(cache_id = %chain.cache_id(), "built cache chain");
        Ok(chain)
    }
}
