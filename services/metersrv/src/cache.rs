//! Last-known-good result cache
//!
//! Successful reads are stored per full register key. An entry is fresh
//! while its age is strictly below the TTL; stale entries are never served,
//! neither as fallback nor as a formula input.

use crate::register::CommandResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CachedResult {
    pub result: CommandResult,
    pub captured_at: Instant,
}

impl CachedResult {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }

    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        self.age(now) < ttl
    }
}

/// Shared result cache
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedResult>>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self, key: &str, result: &CommandResult) {
        self.store_at(key, result, Instant::now());
    }

    /// Store a copy of `result` captured at `now`; raw bytes are not kept
    pub fn store_at(&self, key: &str, result: &CommandResult, now: Instant) {
        self.entries.write().insert(
            key.to_string(),
            CachedResult {
                result: result.without_raw(),
                captured_at: now,
            },
        );
    }

    pub fn get_fresh(&self, key: &str) -> Option<CachedResult> {
        self.get_fresh_at(key, Instant::now())
    }

    pub fn get_fresh_at(&self, key: &str, now: Instant) -> Option<CachedResult> {
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_fresh(now, self.ttl))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
