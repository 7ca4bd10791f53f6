#![forbid(unsafe_code)]

//! TTL + access-count metadata cache.
//!
//! Expiry is lazy: `get` treats stale entries as misses but leaves them in
//! place, and `sweep` reclaims them later. Capacity is enforced on `put` by
//! dropping the least frequently read entries, which keeps popular videos
//! resident even if they were resolved long ago.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::{resolver::VideoMetadata, video::VideoId};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            capacity: 1000,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    metadata: Arc<VideoMetadata>,
    inserted_at: Instant,
    // Atomic so hits only need the read lock.
    access_count: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
pub struct MetadataCache {
    entries: RwLock<HashMap<VideoId, CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MetadataCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached payload if it is younger than the TTL.
    pub fn get(&self, video_id: &VideoId) -> Option<Arc<VideoMetadata>> {
        let now = Instant::now();
        let entries = self.entries.read();
        let fresh = entries
            .get(video_id)
            .filter(|entry| now.duration_since(entry.inserted_at) < self.config.ttl);
        match fresh {
            Some(entry) => {
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.metadata.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a freshly resolved payload and enforces the capacity bound
    /// under the same write lock.
    pub fn put(&self, video_id: VideoId, metadata: Arc<VideoMetadata>) {
        let mut entries = self.entries.write();
        let carried = entries
            .get(&video_id)
            .map(|entry| entry.access_count.load(Ordering::Relaxed))
            .unwrap_or(0);
        entries.insert(
            video_id.clone(),
            CacheEntry {
                metadata,
                inserted_at: Instant::now(),
                access_count: AtomicU64::new(carried),
            },
        );

        let len = entries.len();
        if len <= self.config.capacity {
            return;
        }

        // Bottom decile by access count, and at least enough to get back
        // under capacity. The entry just stored is never a candidate.
        let evict = (len - self.config.capacity).max(len / 10);
        let mut ranked: Vec<(u64, VideoId)> = entries
            .iter()
            .filter(|(key, _)| **key != video_id)
            .map(|(key, entry)| (entry.access_count.load(Ordering::Relaxed), key.clone()))
            .collect();
        ranked.sort_by_key(|(count, _)| *count);
        for (_, key) in ranked.into_iter().take(evict) {
            entries.remove(&key);
        }
        debug!(evicted = evict, remaining = entries.len(), "metadata cache over capacity");
    }

    /// Drops every entry older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.config.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
