//! # Coherence caching infrastructure
//!
//! Caching is front and center in Coherence. Every logical cache is a resolving
//! key/value store: a lookup that misses invokes a pluggable [`Resolver`], and the
//! result (including a resolved *absence*) is remembered so the computation does
//! not run again. This module contains the cache engine, the decorator chain that
//! wraps it, the remote resolution bridge, and the process-wide registry, together
//! with our central [`CacheError`] type.
//!
//! ## Cache layers
//!
//! A built cache handle is a chain of layers, each holding an exclusive reference
//! to its delegate:
//!
//! - Caller-supplied wrappers, in registration order from the outside in.
//! - A bounded-concurrency layer that caps the number of in-flight resolutions
//!   with a semaphore, if a bound was configured.
//! - The core [`CacheEngine`], which owns the entry map and performs request
//!   coalescing: with atomic insertion enabled, concurrent misses for the same
//!   key converge on a single resolver invocation.
//!
//! A cache marked *shared* whose authoritative copy lives on a remote peer gets
//! one additional, outermost layer: the client notification wrapper. It
//! intercepts `invalidate(filter, propagate = true)` and forwards the filter to
//! the peer instead of touching the local copy. The peer invalidates its
//! authoritative cache and fires an invalidation notification, which eventually
//! travels back (see [`crate::notify`]) and clears the client copy with
//! `propagate = false`.
//!
//! ## [`CacheContents`] / [`CacheError`]
//!
//! The caching layer primarily deals with [`CacheContents`], an alias for a
//! [`Result`] around a [`CacheError`]. A resolver failure is surfaced to the
//! caller unchanged and is never stored; a retried lookup resolves again. A
//! resolved absence (`Ok(None)`) on the other hand is a valid, stored result and
//! is not retried.

use thiserror::Error;

mod chain;
mod engine;
mod filter;
mod registry;
mod remote;
mod resolver;

pub use chain::{BoundedResolveCache, CacheBuilder, CacheHandle, WrapperFactory};
pub use engine::CacheEngine;
pub use filter::InvalidationFilter;
pub use registry::CacheRegistry;
pub use remote::{
    ClientNotificationCache, InvalidationHandler, InvalidationNotification, RemotePeer,
    RemoteResolver,
};
pub use resolver::{CacheKey, CacheValue, Resolver};

/// An error produced by a cache operation.
///
/// Resolution and remote failures are transported verbatim to the caller and are
/// never stored in the cache, so a retried lookup resolves again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resolver failed to compute a value for a key.
    #[error("resolution failed: {0}")]
    Resolution(String),
    /// The remote peer could not be reached, or failed while handling the call.
    ///
    /// Treated exactly like a resolution failure by the engine.
    #[error("remote call failed: {0}")]
    Remote(String),
    /// A registry lookup for an id that was never registered (or was already
    /// unregistered), or whose registered handle has a different key/value type.
    #[error("unknown cache id: {0}")]
    UnknownCache(String),
    /// De/serialization at the remote seam failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// The contents of a cache operation, either `Ok(T)` or the error that kept the
/// value from being produced.
pub type CacheContents<T = ()> = Result<T, CacheError>;
