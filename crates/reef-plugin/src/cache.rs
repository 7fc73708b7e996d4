//! Per-entry, per-method result cache.
//!
//! Results of `list`, `read`, and `metadata` are memoized keyed by the
//! entry's stable identity (virtual path + state) and the method. At most
//! one invocation per key is in flight: concurrent callers attach to the
//! leader's `watch` slot and share its outcome. A cancelled leader
//! publishes `Cancelled` to its followers and clears the slot, so the next
//! lookup starts a fresh leader.
//!
//! A TTL of zero means pass-through: no memoization and no coalescing.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{PluginError, Result};
use reef_types::CacheableMethod;

/// Stable identity of one cacheable result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    /// Absolute virtual path of the entry.
    pub path: String,
    /// The entry's opaque state string.
    pub state: String,
    /// Which memoized method.
    pub method: CacheableMethod,
}

type SlotResult<V> = Option<std::result::Result<V, PluginError>>;

enum Slot<V> {
    Ready { value: V, expires: Instant },
    InFlight(watch::Receiver<SlotResult<V>>),
}

/// What a lookup found under the lock, with no borrow retained.
enum Role<V> {
    Follow(watch::Receiver<SlotResult<V>>),
    Expired,
    Lead,
}

/// The shared method cache. `V` is the materialized result type.
pub(crate) struct MethodCache<V> {
    slots: Mutex<HashMap<CacheKey, Slot<V>>>,
}

impl<V: Clone + Send + 'static> MethodCache<V> {
    pub(crate) fn new() -> Self {
        MethodCache {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value, attaches to an in-flight invocation, or
    /// runs `invoke` as the leader and shares its outcome.
    pub(crate) async fn get_or_invoke<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        invoke: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if ttl.is_zero() {
            return invoke().await;
        }

        let mut invoke = Some(invoke);
        loop {
            let follow = {
                let mut slots = self.slots.lock().await;
                let role = match slots.get(&key) {
                    Some(Slot::Ready { value, expires }) if *expires > Instant::now() => {
                        return Ok(value.clone());
                    }
                    Some(Slot::Ready { .. }) => Role::Expired,
                    Some(Slot::InFlight(rx)) => Role::Follow(rx.clone()),
                    None => Role::Lead,
                };
                match role {
                    Role::Follow(rx) => Some(rx),
                    Role::Expired => {
                        slots.remove(&key);
                        None
                    }
                    Role::Lead => None,
                }
            };

            match follow {
                Some(mut rx) => {
                    debug!(path = %key.path, method = %key.method, "awaiting in-flight invocation");
                    enum Outcome<T> {
                        Got(T),
                        Empty,
                        Err,
                    }
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(slot) => match slot.clone() {
                            Some(result) => Outcome::Got(result),
                            None => Outcome::Empty,
                        },
                        Err(_) => Outcome::Err,
                    };
                    match outcome {
                        Outcome::Got(result) => return result,
                        Outcome::Empty => {}
                        Outcome::Err => {
                            // The leader was dropped before publishing.
                            // Clear the stale slot (same generation only)
                            // and contend to lead the retry.
                            let mut slots = self.slots.lock().await;
                            let stale = matches!(
                                slots.get(&key),
                                Some(Slot::InFlight(current)) if current.same_channel(&rx)
                            );
                            if stale {
                                slots.remove(&key);
                            }
                        }
                    }
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    {
                        let mut slots = self.slots.lock().await;
                        if slots.contains_key(&key) {
                            // Lost the race to another leader; retry.
                            continue;
                        }
                        slots.insert(key.clone(), Slot::InFlight(rx));
                    }

                    let Some(invoke) = invoke.take() else {
                        // One caller leads at most once per lookup.
                        return Err(PluginError::Cancelled);
                    };
                    let result = invoke().await;

                    {
                        let mut slots = self.slots.lock().await;
                        match &result {
                            Ok(value) => {
                                slots.insert(
                                    key.clone(),
                                    Slot::Ready {
                                        value: value.clone(),
                                        expires: Instant::now() + ttl,
                                    },
                                );
                            }
                            Err(_) => {
                                slots.remove(&key);
                            }
                        }
                    }
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Installs a prefetched result as if a live invocation had produced
    /// it. A zero TTL skips installation, matching pass-through lookups.
    pub(crate) async fn insert_ready(&self, key: CacheKey, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut slots = self.slots.lock().await;
        slots.insert(
            key,
            Slot::Ready {
                value,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Drops every cached result at `path` and below.
    pub(crate) async fn invalidate_subtree(&self, path: &str) {
        let prefix = format!("{path}/");
        let mut slots = self.slots.lock().await;
        slots.retain(|key, _| key.path != path && !key.path.starts_with(&prefix));
    }

    /// Drops cached results for children of `parent_path` that are no
    /// longer listed, identified by their path segment.
    pub(crate) async fn evict_missing_children(
        &self,
        parent_path: &str,
        surviving: &HashSet<String>,
    ) {
        let prefix = format!("{parent_path}/");
        let mut slots = self.slots.lock().await;
        slots.retain(|key, _| {
            let Some(below) = key.path.strip_prefix(&prefix) else {
                return true;
            };
            let segment = below.split('/').next().unwrap_or(below);
            surviving.contains(segment)
        });
    }

    /// Number of resident slots, for diagnostics.
    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

/// Cached `list` results: the parent's materialized children.
pub(crate) type ListValue = std::sync::Arc<Vec<std::sync::Arc<crate::entry::Entry>>>;
/// Cached `read` results: raw content bytes.
pub(crate) type ReadValue = std::sync::Arc<Vec<u8>>;
/// Cached `metadata` results.
pub(crate) type MetadataValue = std::sync::Arc<serde_json::Value>;

/// One typed cache per memoized method.
///
/// Splitting by method keeps each cache's value type concrete; the
/// `method` field of [`CacheKey`] still participates in the identity so
/// the three caches share one key vocabulary.
pub(crate) struct MethodCaches {
    pub(crate) list: MethodCache<ListValue>,
    pub(crate) read: MethodCache<ReadValue>,
    pub(crate) metadata: MethodCache<MetadataValue>,
}

impl MethodCaches {
    pub(crate) fn new() -> Self {
        MethodCaches {
            list: MethodCache::new(),
            read: MethodCache::new(),
            metadata: MethodCache::new(),
        }
    }

    /// Drops every cached result at `path` and below, across methods.
    pub(crate) async fn invalidate_subtree(&self, path: &str) {
        self.list.invalidate_subtree(path).await;
        self.read.invalidate_subtree(path).await;
        self.metadata.invalidate_subtree(path).await;
    }

    /// Applies vanished-child eviction across methods.
    pub(crate) async fn evict_missing_children(
        &self,
        parent_path: &str,
        surviving: &HashSet<String>,
    ) {
        self.list.evict_missing_children(parent_path, surviving).await;
        self.read.evict_missing_children(parent_path, surviving).await;
        self.metadata
            .evict_missing_children(parent_path, surviving)
            .await;
    }
}
