//! Read-through cache for flag definitions.
//!
//! Entries are snapshots with an absolute expiry. The cache is never a source
//! of truth: dropping an entry only costs a store read on the next lookup.
//!
//! Every invalidation bumps a generation counter. A fill carries the generation
//! observed before its store read and is dropped if an invalidation happened in
//! between, so a kill switch cannot be undone by a slow in-flight lookup.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::evaluation::FlagDefinition;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    flag: FlagDefinition,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    generation: u64,
}

#[derive(Clone)]
pub struct FlagCache {
    entries: Arc<RwLock<Entries>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

fn cache_key(name: &str, environment: &str) -> String {
    format!("{}:{}", name, environment)
}

impl FlagCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Entries::default())),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn get(&self, name: &str, environment: &str) -> Option<FlagDefinition> {
        let now = self.clock.now();
        self.entries
            .read()
            .map
            .get(&cache_key(name, environment))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.flag.clone())
    }

    /// Read this before fetching from the store and hand it to [`FlagCache::insert`].
    pub fn generation(&self) -> u64 {
        self.entries.read().generation
    }

    /// Stores the snapshot unless the cache was invalidated since `generation`
    /// was read. Returns whether it was stored.
    ///
    /// Last writer wins; concurrent misses for the same key insert equivalent snapshots.
    pub fn insert(&self, flag: FlagDefinition, generation: u64) -> bool {
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let key = cache_key(&flag.name, &flag.environment);

        let mut entries = self.entries.write();
        if entries.generation != generation {
            return false;
        }
        entries.map.insert(key, CacheEntry { flag, expires_at });
        true
    }

    /// Drops the flag in every environment.
    pub fn invalidate(&self, name: &str) {
        let prefix = format!("{}:", name);
        let mut entries = self.entries.write();
        entries.generation += 1;
        entries.map.retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.generation += 1;
        entries.map.clear();
    }

    /// Removes expired entries, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.map.len();
        entries.map.retain(|_, entry| entry.expires_at > now);
        before - entries.map.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map.len()
    }

    pub fn spawn_sweeper(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = cache.sweep();
                        tracing::debug!(dropped, remaining = cache.len(), "swept flag cache");
                    }
                }
            }
        })
    }
}
