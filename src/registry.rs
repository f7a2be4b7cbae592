// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Registry
//!
//! A keyed cache of asynchronous broker resources with single-flight
//! creation. The first `ensure` for a key marks the entry pending and stores
//! the creation future; every later caller for that key shares the same
//! future, whether it is still pending, ready or failed.
//!
//! Keys are content addressed: the resource kind plus a stable hash of the
//! options it was created with, so identical requests always collide and
//! differing ones never do.

use crate::errors::AmqpError;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashMap, fmt, future::Future};
use tracing::{debug, error};

/// A shareable handle on a resource being created or already created.
pub type ResourceFuture<V> = Shared<BoxFuture<'static, Result<V, AmqpError>>>;

/// Identifies a resource in a [`ResourceCache`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Builds a key from a resource kind and the options it is created with.
    pub fn new<C: Serialize>(kind: &str, config: &C) -> ResourceKey {
        ResourceKey(format!("{}#{:08x}", kind, config_hash(config)))
    }

    pub fn connection<C: Serialize>(url: &str, config: &C) -> ResourceKey {
        ResourceKey::new("connection", &(url, config))
    }

    /// The single channel shared by every queue and exchange of a session.
    pub fn channel() -> ResourceKey {
        ResourceKey("channel".to_owned())
    }

    pub fn queue<C: Serialize>(name: &str, config: &C) -> ResourceKey {
        ResourceKey::new(&format!("queue:{}", name), config)
    }

    pub fn exchange<C: Serialize>(name: &str, config: &C) -> ResourceKey {
        ResourceKey::new(&format!("exchange:{}", name), config)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// String hash that is stable across processes and releases.
pub fn stable_hash(input: &str) -> u32 {
    input
        .chars()
        .fold(0u32, |hash, chr| hash.wrapping_mul(31).wrapping_add(chr as u32))
}

fn config_hash<C: Serialize>(config: &C) -> u32 {
    let normalized = serde_json::to_string(config).unwrap_or_default();
    stable_hash(&normalized)
}

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Ready,
    Failed,
}

/// Single-flight cache of resources of type `V`.
///
/// Entries are never evicted implicitly. A failed entry keeps reporting its
/// error until the caller [`forget`](ResourceCache::forget)s it.
pub struct ResourceCache<V> {
    entries: Mutex<HashMap<ResourceKey, ResourceFuture<V>>>,
}

impl<V> Default for ResourceCache<V> {
    fn default() -> Self {
        ResourceCache {
            entries: Mutex::new(HashMap::default()),
        }
    }
}

impl<V> ResourceCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resource for `key`, invoking `factory` only when no entry
    /// exists yet.
    ///
    /// The lookup and the insertion of the pending entry happen under one
    /// lock, so two concurrent callers can never both create the resource.
    pub fn ensure<F, Fut>(&self, key: &ResourceKey, factory: F) -> ResourceFuture<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, AmqpError>> + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            return existing.clone();
        }

        debug!(key = key.as_str(), "creating resource");

        let creation = factory();
        let logged_key = key.clone();
        let future = async move {
            let res = creation.await;
            match &res {
                Ok(_) => debug!(key = logged_key.as_str(), "resource ready"),
                Err(err) => error!(
                    error = err.to_string(),
                    key = logged_key.as_str(),
                    "failure to create resource"
                ),
            }
            res
        }
        .boxed()
        .shared();

        entries.insert(key.clone(), future.clone());
        future
    }

    pub fn state(&self, key: &ResourceKey) -> Option<EntryState> {
        self.entries.lock().get(key).map(|future| match future.peek() {
            None => EntryState::Pending,
            Some(Ok(_)) => EntryState::Ready,
            Some(Err(_)) => EntryState::Failed,
        })
    }

    /// The handle for `key` if its creation already succeeded.
    pub fn ready(&self, key: &ResourceKey) -> Option<V> {
        self.entries
            .lock()
            .get(key)
            .and_then(|future| future.peek().cloned())
            .and_then(Result::ok)
    }

    /// Every handle whose creation already succeeded.
    pub fn ready_all(&self) -> Vec<V> {
        self.entries
            .lock()
            .values()
            .filter_map(|future| future.peek().cloned())
            .filter_map(Result::ok)
            .collect()
    }

    /// Drops the entry for `key` so the next `ensure` creates it again.
    pub fn forget(&self, key: &ResourceKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
