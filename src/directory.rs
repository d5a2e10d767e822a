//! Display names for actor identities.
//!
//! Purely a presentation concern: the booking engine stores and compares raw
//! identities and never waits on a lookup. Renderers resolve through a
//! [`NameCache`] they own and fall back to the raw identity on failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::observability::NAME_LOOKUPS_TOTAL;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    NotFound(String),
    Unavailable(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::NotFound(actor) => write!(f, "no display name for {actor}"),
            DirectoryError::Unavailable(e) => write!(f, "directory unavailable: {e}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// Best-effort `actor -> display name` lookup.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup(&self, actor: &str) -> Result<String, DirectoryError>;
}

/// Fixed name table, loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    names: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn lookup(&self, actor: &str) -> Result<String, DirectoryError> {
        self.names
            .get(actor)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(actor.to_string()))
    }
}

struct CachedName {
    name: String,
    fetched_at: Instant,
}

/// TTL cache in front of a [`Directory`]. Failed lookups are not cached.
pub struct NameCache {
    directory: Arc<dyn Directory>,
    ttl: Duration,
    entries: DashMap<String, CachedName>,
}

impl NameCache {
    pub fn new(directory: Arc<dyn Directory>, ttl: Duration) -> Self {
        Self {
            directory,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub async fn get_or_resolve(&self, actor: &str) -> Result<String, DirectoryError> {
        let cached = self
            .entries
            .get(actor)
            .filter(|e| e.fetched_at.elapsed() < self.ttl)
            .map(|e| e.name.clone());
        if let Some(name) = cached {
            metrics::counter!(NAME_LOOKUPS_TOTAL, "result" => "hit").increment(1);
            return Ok(name);
        }

        match self.directory.lookup(actor).await {
            Ok(name) => {
                metrics::counter!(NAME_LOOKUPS_TOTAL, "result" => "miss").increment(1);
                self.entries.insert(
                    actor.to_string(),
                    CachedName {
                        name: name.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(name)
            }
            Err(e) => {
                metrics::counter!(NAME_LOOKUPS_TOTAL, "result" => "error").increment(1);
                Err(e)
            }
        }
    }

    /// Display name, or the raw identity if it cannot be resolved.
    pub async fn display_or_raw(&self, actor: &str) -> String {
        match self.get_or_resolve(actor).await {
            Ok(name) => name,
            Err(DirectoryError::NotFound(_)) => actor.to_string(),
            Err(e) => {
                warn!("name lookup for {actor} failed: {e}");
                actor.to_string()
            }
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.fetched_at.elapsed() < self.ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
