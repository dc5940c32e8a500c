use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use super::{
    CacheContents,
    chain::CacheHandle,
    filter::InvalidationFilter,
    resolver::{CacheKey, CacheValue, Resolver},
};

type InflightFuture<V> = Shared<BoxFuture<'static, CacheContents<Option<V>>>>;
type BulkFuture<K, V> = Shared<BoxFuture<'static, CacheContents<BTreeMap<K, V>>>>;

/// The resolving key/value store at the core of every cache chain.
///
/// An entry maps a key to `Option<V>`: `Some` is a resolved value, `None` is a
/// resolved absence. Presence in the map is what distinguishes "resolved absent"
/// from "not yet resolved". There is no expiry metadata, eviction is driven
/// exclusively by invalidation filters.
///
/// With atomic insertion enabled, concurrent misses for the same key are
/// coalesced onto one in-flight resolution: the first requester kicks off the
/// resolver, later requesters for the same key await the same shared future.
/// Requesters for different keys proceed independently.
pub struct CacheEngine<K: CacheKey, V: CacheValue> {
    id: String,
    resolver: Arc<dyn Resolver<K, V>>,
    entries: Arc<Mutex<BTreeMap<K, Option<V>>>>,
    /// Currently running resolutions, keyed by cache key.
    ///
    /// Lock order: `entries` before `inflight`, never the other way around.
    /// Every in-flight future stores its own result and removes its own marker
    /// on completion, so that bookkeeping runs exactly once regardless of how
    /// many waiters are attached and when they wake up.
    inflight: Arc<Mutex<HashMap<K, InflightFuture<V>>>>,
    thread_safe: bool,
    atomic_insertion: bool,
}

impl<K: CacheKey, V: CacheValue> std::fmt::Debug for CacheEngine<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock().map(|e| e.len()).unwrap_or_default();
        let inflight = self.inflight.lock().map(|i| i.len()).unwrap_or_default();
        f.debug_struct("CacheEngine")
            .field("id", &self.id)
            .field("entries", &entries)
            .field("running resolutions", &inflight)
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> CacheEngine<K, V> {
    pub fn new(
        id: impl Into<String>,
        resolver: Arc<dyn Resolver<K, V>>,
        thread_safe: bool,
        atomic_insertion: bool,
    ) -> Self {
        Self {
            id: id.into(),
            resolver,
            entries: Arc::default(),
            inflight: Arc::default(),
            thread_safe,
            atomic_insertion,
        }
    }

    /// Whether this engine was configured thread-safe.
    ///
    /// The Rust engine serializes all access through its internal locks
    /// regardless; the flag is retained from the construction contract.
    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    pub fn is_atomic_insertion(&self) -> bool {
        self.atomic_insertion
    }

    /// Looks up a key, resolving it on a miss.
    ///
    /// Returns `Ok(None)` both for a freshly resolved absence and for a
    /// previously stored one.
    pub async fn get(&self, key: &K) -> CacheContents<Option<V>> {
        let computation = {
            let entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(key) {
                return Ok(entry.clone());
            }

            if !self.atomic_insertion {
                None
            } else {
                // Entry map stays locked while we register the in-flight marker,
                // so a resolution that finished in between cannot be missed.
                let mut inflight = self.inflight.lock().unwrap();
                let computation = inflight
                    .entry(key.clone())
                    .or_insert_with(|| self.single_resolution(key))
                    .clone();
                Some(computation)
            }
        };

        match computation {
            Some(computation) => computation.await,
            None => {
                let resolved = self.resolver.resolve(key).await;
                if let Ok(value) = &resolved {
                    self.entries
                        .lock()
                        .unwrap()
                        .insert(key.clone(), value.clone());
                }
                resolved
            }
        }
    }

    /// The shared future backing one coalesced single-key resolution.
    ///
    /// Stores the result and clears the in-flight marker itself; waiters only
    /// clone the outcome. Errors are not cached, a retried lookup resolves again.
    fn single_resolution(&self, key: &K) -> InflightFuture<V> {
        let resolver = Arc::clone(&self.resolver);
        let entries = Arc::clone(&self.entries);
        let inflight = Arc::clone(&self.inflight);
        let key = key.clone();
        async move {
            let resolved = resolver.resolve(&key).await;
            if let Ok(value) = &resolved {
                entries.lock().unwrap().insert(key.clone(), value.clone());
            }
            inflight.lock().unwrap().remove(&key);
            resolved
        }
        .boxed()
        .shared()
    }

    /// Looks up many keys at once, bulk-resolving the missing ones.
    ///
    /// Keys currently being resolved by a concurrent `get` or `get_all` attach
    /// to the existing in-flight resolution; only genuinely unclaimed keys go
    /// through the bulk resolver call. The returned map contains only keys with
    /// a non-absent value; resolved absences are still stored so the keys are
    /// not re-resolved later.
    pub async fn get_all(&self, keys: &[K]) -> CacheContents<BTreeMap<K, V>> {
        let mut found = BTreeMap::new();
        let mut missing = BTreeSet::new();
        let mut claimed = Vec::new();

        let bulk = {
            let entries = self.entries.lock().unwrap();
            for key in keys {
                match entries.get(key) {
                    Some(Some(value)) => {
                        found.insert(key.clone(), value.clone());
                    }
                    Some(None) => {} // resolved absence, nothing to return
                    None => {
                        missing.insert(key.clone());
                    }
                }
            }
            if missing.is_empty() {
                return Ok(found);
            }

            if self.atomic_insertion {
                let mut inflight = self.inflight.lock().unwrap();
                missing.retain(|key| match inflight.get(key) {
                    Some(existing) => {
                        claimed.push((key.clone(), existing.clone()));
                        false
                    }
                    None => true,
                });

                if missing.is_empty() {
                    None
                } else {
                    let bulk = self.bulk_resolution(&missing);
                    // Concurrent single-key getters for any of these keys
                    // attach to the bulk resolution instead of starting their own.
                    for key in &missing {
                        let bulk = bulk.clone();
                        let wanted = key.clone();
                        inflight.insert(
                            key.clone(),
                            async move { bulk.await.map(|resolved| resolved.get(&wanted).cloned()) }
                                .boxed()
                                .shared(),
                        );
                    }
                    Some(bulk)
                }
            } else {
                Some(self.bulk_resolution(&missing))
            }
        };

        for (key, existing) in claimed {
            if let Some(value) = existing.await? {
                found.insert(key, value);
            }
        }

        if let Some(bulk) = bulk {
            for (key, value) in bulk.await? {
                found.insert(key, value);
            }
        }
        Ok(found)
    }

    /// The shared future backing one bulk resolution, storing results and
    /// clearing the in-flight markers of all its keys on completion.
    fn bulk_resolution(&self, wanted: &BTreeSet<K>) -> BulkFuture<K, V> {
        let resolver = Arc::clone(&self.resolver);
        let entries = Arc::clone(&self.entries);
        let inflight = Arc::clone(&self.inflight);
        let wanted = wanted.clone();
        async move {
            let keys: Vec<K> = wanted.iter().cloned().collect();
            let resolved = resolver.resolve_all(&keys).await;
            if let Ok(resolved) = &resolved {
                let mut entries = entries.lock().unwrap();
                for key in &wanted {
                    // Keys the bulk call omitted are stored as resolved absences.
                    entries.insert(key.clone(), resolved.get(key).cloned());
                }
            }
            let mut inflight = inflight.lock().unwrap();
            for key in &wanted {
                inflight.remove(key);
            }
            resolved
        }
        .boxed()
        .shared()
    }

    /// The stored entry for a key, if the key is already resolved.
    ///
    /// `Some(None)` is a resolved absence. Never triggers a resolution.
    pub fn peek(&self, key: &K) -> Option<Option<V>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Drops all entries matched by the filter.
    pub fn invalidate(&self, filter: &InvalidationFilter<K>) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|key, _| !filter.matches(key));
    }

    /// A read-only copy of the current entries, for diagnostics and tests.
    pub fn snapshot(&self) -> BTreeMap<K, Option<V>> {
        self.entries.lock().unwrap().clone()
    }
}

impl<K: CacheKey, V: CacheValue> CacheHandle<K, V> for CacheEngine<K, V> {
    fn cache_id(&self) -> &str {
        &self.id
    }

    fn layer_name(&self) -> &'static str {
        "engine"
    }

    fn get<'a>(&'a self, key: &'a K) -> BoxFuture<'a, CacheContents<Option<V>>> {
        CacheEngine::get(self, key).boxed()
    }

    fn get_all<'a>(&'a self, keys: &'a [K]) -> BoxFuture<'a, CacheContents<BTreeMap<K, V>>> {
        CacheEngine::get_all(self, keys).boxed()
    }

    fn invalidate<'a>(
        &'a self,
        filter: &'a InvalidationFilter<K>,
        _propagate: bool,
    ) -> BoxFuture<'a, CacheContents<()>> {
        // The engine is always authoritative for its own entries; propagation is
        // the business of the client notification wrapper.
        CacheEngine::invalidate(self, filter);
        async { Ok(()) }.boxed()
    }

    fn peek(&self, key: &K) -> Option<Option<V>> {
        CacheEngine::peek(self, key)
    }

    fn snapshot(&self) -> BTreeMap<K, Option<V>> {
        CacheEngine::snapshot(self)
    }

    fn delegate(&self) -> Option<&dyn CacheHandle<K, V>> {
        None
    }
}
