use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::server::dtos::sources_dto::ResolvedSources;

/// resolved payloads stay valid for an hour, which comfortably outlives one
/// viewing session without pinning dead links forever
#[derive(Clone)]
pub struct SourceCacheConfig {
    pub ttl: Duration,
    /// writes past this size trigger a sweep of expired entries
    pub max_entries: usize,
}

impl Default for SourceCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 1000,
        }
    }
}

pub type DynSourceCacheService = Arc<dyn SourceCacheServiceTrait + Send + Sync>;

#[async_trait::async_trait]
pub trait SourceCacheServiceTrait {
    /// returns the cached payload when present and inside its TTL
    async fn get(&self, session: &str, episode: &str) -> Option<ResolvedSources>;

    /// stores a payload, fully replacing whatever was there for the key
    async fn set(&self, session: &str, episode: &str, resolved: ResolvedSources);
}

struct CacheEntry {
    resolved: ResolvedSources,
    fetched_at: Instant,
}

/// in-process map, nothing survives a restart by design. concurrent misses
/// for the same key are allowed to race and both fetch upstream, last write
/// wins
pub struct SourceCacheService {
    config: SourceCacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SourceCacheService {
    pub fn new() -> Self {
        Self::with_config(SourceCacheConfig::default())
    }

    pub fn with_config(config: SourceCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// episode ids come straight from upstream urls and can be long or
    /// contain anything, so they are hashed into the key
    fn cache_key(session: &str, episode: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(episode.as_bytes());
        format!("{}:{}", session, hex::encode(hasher.finalize()))
    }
}

impl Default for SourceCacheService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SourceCacheServiceTrait for SourceCacheService {
    async fn get(&self, session: &str, episode: &str) -> Option<ResolvedSources> {
        let key = Self::cache_key(session, episode);
        let mut entries = self.entries.lock().expect("source cache mutex poisoned");

        if let Some(entry) = entries.get(&key) {
            if entry.fetched_at.elapsed() <= self.config.ttl {
                debug!("source cache HIT for {}:{}", session, episode);
                return Some(entry.resolved.clone());
            }
            // expired, drop it on the way out
            entries.remove(&key);
        }

        None
    }

    async fn set(&self, session: &str, episode: &str, resolved: ResolvedSources) {
        let key = Self::cache_key(session, episode);
        let mut entries = self.entries.lock().expect("source cache mutex poisoned");

        entries.insert(
            key,
            CacheEntry {
                resolved,
                fetched_at: Instant::now(),
            },
        );

        if entries.len() > self.config.max_entries {
            let before = entries.len();
            let ttl = self.config.ttl;
            entries.retain(|_, entry| entry.fetched_at.elapsed() <= ttl);
            info!(
                "source cache sweep: {} -> {} entries",
                before,
                entries.len()
            );
        }
    }
}
