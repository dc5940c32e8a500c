//! Helpers for testing the caching and notification services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - [`InProcessPeer`] stands in for the remote side of the cache protocol: it
//!    answers resolve and invalidate calls against a second, in-process
//!    [`CacheRegistry`]. No transport is involved, errors from the "remote"
//!    cache surface verbatim.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use coherence_service::caching::{
    CacheContents, CacheKey, CacheRegistry, CacheValue, InvalidationFilter, RemotePeer,
};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `coherence`
///    crates and mutes everything else.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coherence_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A [`RemotePeer`] backed by a registry in the same process.
///
/// Lets a client-side cache talk to an authoritative "server" cache without any
/// transport in between.
pub struct InProcessPeer<K, V> {
    registry: Arc<CacheRegistry>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> InProcessPeer<K, V> {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self {
            registry,
            _types: PhantomData,
        }
    }
}

impl<K, V> RemotePeer for InProcessPeer<K, V>
where
    K: CacheKey + Serialize + DeserializeOwned,
    V: CacheValue + Serialize + DeserializeOwned,
{
    fn resolve<'a>(
        &'a self,
        cache_id: &'a str,
        key: Value,
    ) -> BoxFuture<'a, CacheContents<Option<Value>>> {
        async move {
            let key: K = serde_json::from_value(key)?;
            let handle = self.registry.lookup::<K, V>(cache_id)?;
            let value = handle.get(&key).await?;
            value
                .map(|v| serde_json::to_value(v))
                .transpose()
                .map_err(Into::into)
        }
        .boxed()
    }

    fn resolve_all<'a>(
        &'a self,
        cache_id: &'a str,
        keys: Vec<Value>,
    ) -> BoxFuture<'a, CacheContents<Vec<(Value, Value)>>> {
        async move {
            let keys = keys
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<K>, _>>()?;
            let handle = self.registry.lookup::<K, V>(cache_id)?;

            let mut pairs = Vec::new();
            for (key, value) in handle.get_all(&keys).await? {
                pairs.push((serde_json::to_value(key)?, serde_json::to_value(value)?));
            }
            Ok(pairs)
        }
        .boxed()
    }

    fn invalidate<'a>(
        &'a self,
        cache_id: &'a str,
        filter: Value,
        propagate: bool,
    ) -> BoxFuture<'a, CacheContents<()>> {
        async move {
            let filter: InvalidationFilter<K> = serde_json::from_value(filter)?;
            let handle = self.registry.lookup::<K, V>(cache_id)?;
            handle.invalidate(&filter, propagate).await
        }
        .boxed()
    }
}
