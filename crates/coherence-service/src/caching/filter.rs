use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A predicate selecting cache entries, used both to pick entries to drop and,
/// remotely, to describe which entries an invalidation notification concerns.
///
/// The two canonical forms are "all entries" and "entries with one of the given
/// keys". The filter is serializable since it crosses the wire on
/// propagate-invalidate calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationFilter<K: Ord> {
    /// Matches every entry.
    All,
    /// Matches entries whose key is contained in the set.
    Keys(BTreeSet<K>),
}

impl<K: Ord> InvalidationFilter<K> {
    /// Creates a filter matching exactly the given keys.
    pub fn keys(keys: impl IntoIterator<Item = K>) -> Self {
        Self::Keys(keys.into_iter().collect())
    }

    pub fn matches(&self, key: &K) -> bool {
        match self {
            Self::All => true,
            Self::Keys(keys) => keys.contains(key),
        }
    }
}
