//! Role lookups for transport gating
//!
//! The coordinator never proves identity; it asks an injected provider which
//! roles a connection id holds and drops restricted events from senders that
//! hold none of the allowed set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::Result;

/// Maps a connection id to the roles it currently holds.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    async fn roles_of(&self, client_id: &str) -> Result<Vec<String>>;
}

/// Provider for sessions that run without role restrictions.
#[derive(Debug, Default, Clone, Copy)]
pub struct EveryoneAllowed;

#[async_trait]
impl RoleProvider for EveryoneAllowed {
    async fn roles_of(&self, _client_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// An empty allowed set means the session is unrestricted.
pub fn holds_any(roles: &[String], allowed: &BTreeSet<String>) -> bool {
    allowed.is_empty() || roles.iter().any(|role| allowed.contains(role))
}

/// Memoizes role lookups per connection id for the life of the connection.
pub struct CachedRoleProvider {
    inner: Arc<dyn RoleProvider>,
    cache: Mutex<HashMap<String, Vec<String>>>,
}

impl CachedRoleProvider {
    pub fn new(inner: Arc<dyn RoleProvider>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn roles_of(&self, client_id: &str) -> Result<Vec<String>> {
        if let Some(roles) = self.cache.lock().await.get(client_id) {
            return Ok(roles.clone());
        }
        let roles = self.inner.roles_of(client_id).await?;
        debug!(client_id, count = roles.len(), "cached roles for connection");
        self.cache
            .lock()
            .await
            .insert(client_id.to_string(), roles.clone());
        Ok(roles)
    }

    /// Drop the cached roles for a departed connection.
    pub async fn invalidate(&self, client_id: &str) {
        if self.cache.lock().await.remove(client_id).is_some() {
            debug!(client_id, "forgot roles for departed connection");
        }
    }
}
