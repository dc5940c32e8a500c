use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::ConfigError;

use super::{
    CacheError,
    chain::CacheHandle,
    resolver::{CacheKey, CacheValue},
};

/// Process-wide lookup of built cache handles by id.
///
/// Caches are registered explicitly after [`CacheBuilder::build`](super::CacheBuilder::build)
/// and unregistered explicitly at the end of their owning scope. Looking up an
/// unknown id fails loudly; [`try_lookup`](Self::try_lookup) exists for callers
/// that can tolerate absence.
///
/// Handles of different key/value types share one registry, so entries are
/// type-erased internally. A lookup with the wrong types fails the same way an
/// unknown id does.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle under its cache id.
    ///
    /// Registering an id twice is a configuration error.
    pub fn register<K: CacheKey, V: CacheValue>(
        &self,
        handle: Arc<dyn CacheHandle<K, V>>,
    ) -> Result<(), ConfigError> {
        let id = handle.cache_id().to_owned();
        let mut caches = self.caches.lock().unwrap();
        if caches.contains_key(&id) {
            return Err(ConfigError::DuplicateCache(id));
        }
        tracing::debug!(cache_id = %id, "registering cache");
        caches.insert(id, Box::new(handle));
        Ok(())
    }

    /// Removes a cache from the registry, dropping the registry's reference.
    pub fn unregister(&self, id: &str) -> Result<(), CacheError> {
        let mut caches = self.caches.lock().unwrap();
        match caches.remove(id) {
            Some(_) => {
                tracing::debug!(cache_id = %id, "unregistered cache");
                Ok(())
            }
            None => Err(CacheError::UnknownCache(id.to_owned())),
        }
    }

    /// Looks up a previously registered cache, failing loudly on an unknown id.
    pub fn lookup<K: CacheKey, V: CacheValue>(
        &self,
        id: &str,
    ) -> Result<Arc<dyn CacheHandle<K, V>>, CacheError> {
        self.try_lookup(id)
            .ok_or_else(|| CacheError::UnknownCache(id.to_owned()))
    }

    /// Like [`lookup`](Self::lookup), but returns `None` instead of an error.
    pub fn try_lookup<K: CacheKey, V: CacheValue>(
        &self,
        id: &str,
    ) -> Option<Arc<dyn CacheHandle<K, V>>> {
        let caches = self.caches.lock().unwrap();
        caches
            .get(id)?
            .downcast_ref::<Arc<dyn CacheHandle<K, V>>>()
            .cloned()
    }
}
