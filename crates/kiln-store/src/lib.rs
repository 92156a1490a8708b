#![warn(missing_docs)]

//! # kiln-store
//!
//! Three-tier session metadata store.
//!
//! One façade, [`SessionStore`], over three independently contracted tiers:
//!
//! 1. **Near cache** — process-local, TTL'd, bounded. First read source.
//! 2. **Durable tier** — Redis, namespaced keys, 24 h TTL, bounded connection
//!    pool, its own circuit breaker. Optional.
//! 3. **Fallback tier** — process-local map that always works.
//!
//! Writes fan out to every tier; a write succeeds as long as the fallback
//! accepted it. Reads cascade near → durable → fallback, filling the near
//! cache on durable hits. Durable-tier outages degrade with a warning and
//! never fail caller operations on their own.

pub mod near;
pub mod redis_tier;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_model::Session;

pub use near::{NearCache, NearCacheConfig};
pub use redis_tier::{RedisTier, RedisTierConfig};

/// Contract every storage tier implements.
#[async_trait]
pub trait SessionTier: Send + Sync {
    /// Tier name for logs and health reporting.
    fn name(&self) -> &'static str;

    /// Insert or replace a session record.
    async fn put(&self, session: &Session) -> anyhow::Result<()>;

    /// Fetch a session by id.
    async fn get(&self, id: &str) -> anyhow::Result<Option<Session>>;

    /// Remove a session by id. Returns whether a record existed.
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;

    /// All sessions, optionally filtered to one owner.
    async fn list(&self, owner: Option<&str>) -> anyhow::Result<Vec<Session>>;

    /// Whether the tier is currently usable.
    async fn healthy(&self) -> bool;
}

/// Process-local fallback tier. Infallible by construction.
#[derive(Default)]
pub struct MemoryTier {
    sessions: std::sync::Mutex<std::collections::HashMap<String, Session>>,
}

impl MemoryTier {
    /// Create an empty fallback tier.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .expect("memory tier lock poisoned")
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self
            .sessions
            .lock()
            .expect("memory tier lock poisoned")
            .get(id)
            .cloned())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self
            .sessions
            .lock()
            .expect("memory tier lock poisoned")
            .remove(id)
            .is_some())
    }

    async fn list(&self, owner: Option<&str>) -> anyhow::Result<Vec<Session>> {
        let sessions = self.sessions.lock().expect("memory tier lock poisoned");
        Ok(sessions
            .values()
            .filter(|s| owner.is_none_or(|o| s.owner_client_id == o))
            .cloned()
            .collect())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// Point-in-time tier liveness for the health document.
#[derive(Debug, Clone)]
pub struct StoreHealth {
    /// Near cache entry count.
    pub near_entries: usize,
    /// Whether a durable tier is configured.
    pub durable_configured: bool,
    /// Whether the durable tier answered its last health probe.
    pub durable_healthy: bool,
    /// Fallback tier is always live; the field exists for report symmetry.
    pub fallback_healthy: bool,
}

/// The three-tier façade.
pub struct SessionStore {
    near: NearCache,
    durable: Option<Arc<dyn SessionTier>>,
    fallback: MemoryTier,
}

impl SessionStore {
    /// Build a store with the default near-cache shape and an optional
    /// durable tier.
    pub fn new(durable: Option<Arc<dyn SessionTier>>) -> Self {
        Self {
            near: NearCache::new(NearCacheConfig::default()),
            durable,
            fallback: MemoryTier::new(),
        }
    }

    /// Build a store with a custom near-cache configuration.
    pub fn with_near_config(
        durable: Option<Arc<dyn SessionTier>>,
        near_config: NearCacheConfig,
    ) -> Self {
        Self {
            near: NearCache::new(near_config),
            durable,
            fallback: MemoryTier::new(),
        }
    }

    /// Write a session to every tier.
    ///
    /// The write succeeds as long as the fallback tier accepted it; durable
    /// failures are logged and absorbed.
    pub async fn put(&self, session: &Session) -> anyhow::Result<()> {
        self.near.insert(session.clone());

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.put(session).await {
                tracing::warn!(
                    tier = durable.name(),
                    session_id = %session.id,
                    error = %e,
                    "durable tier write failed, continuing on fallback"
                );
            }
        }

        self.fallback.put(session).await
    }

    /// Read a session: near cache first, then durable (filling the cache on a
    /// hit), then fallback.
    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Session>> {
        if let Some(session) = self.near.get(id) {
            return Ok(Some(session));
        }

        if let Some(durable) = &self.durable {
            match durable.get(id).await {
                Ok(Some(session)) => {
                    self.near.insert(session.clone());
                    return Ok(Some(session));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        tier = durable.name(),
                        session_id = %id,
                        error = %e,
                        "durable tier read failed, falling back"
                    );
                }
            }
        }

        self.fallback.get(id).await
    }

    /// Delete a session from every tier.
    ///
    /// Succeeds when the near cache and fallback are updated, even if the
    /// durable delete failed (the durable record expires via its TTL).
    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        self.near.remove(id);

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.delete(id).await {
                tracing::warn!(
                    tier = durable.name(),
                    session_id = %id,
                    error = %e,
                    "durable tier delete failed, record will expire by TTL"
                );
            }
        }

        self.fallback.delete(id).await
    }

    /// List sessions, merged across the durable tier (or fallback) and the
    /// near cache, de-duplicated by id.
    pub async fn list(&self, owner: Option<&str>) -> anyhow::Result<Vec<Session>> {
        let mut merged: std::collections::HashMap<String, Session> =
            std::collections::HashMap::new();

        let durable_listed = match &self.durable {
            Some(durable) => match durable.list(owner).await {
                Ok(sessions) => {
                    for s in sessions {
                        merged.insert(s.id.clone(), s);
                    }
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        tier = durable.name(),
                        error = %e,
                        "durable tier list failed, using fallback"
                    );
                    false
                }
            },
            None => false,
        };

        if !durable_listed {
            for s in self.fallback.list(owner).await? {
                merged.insert(s.id.clone(), s);
            }
        }

        for s in self.near.snapshot() {
            if owner.is_none_or(|o| s.owner_client_id == o) {
                merged.insert(s.id.clone(), s);
            }
        }

        let mut sessions: Vec<Session> = merged.into_values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Drop expired near-cache entries. Called by the periodic sweeper.
    pub fn evict_expired(&self) -> usize {
        self.near.evict_expired()
    }

    /// Tier liveness for the health document.
    pub async fn health(&self) -> StoreHealth {
        let (durable_configured, durable_healthy) = match &self.durable {
            Some(durable) => (true, durable.healthy().await),
            None => (false, false),
        };
        StoreHealth {
            near_entries: self.near.len(),
            durable_configured,
            durable_healthy,
            fallback_healthy: true,
        }
    }

    /// Shorten the near-cache TTL (tests only).
    #[doc(hidden)]
    pub fn set_near_ttl(&self, ttl: Duration) {
        self.near.set_ttl(ttl);
    }
}
