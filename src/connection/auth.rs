use crate::core::{CoreError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A platform API key. `key_hash` is a bcrypt hash of the raw secret; the
/// raw value is only ever returned once, at creation time, the same way a
/// cloud provider issues access keys.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub label: String,
    key_hash: String,
}

impl ApiKey {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Authenticates platform requests (`X-API-Key` / `Authorization: Bearer
/// <api-key>`) against a set of issued keys.
///
/// Owned by `AppState` rather than reached through a global singleton —
/// every process builds exactly one, and tests build their own in
/// isolation.
pub struct AuthManager {
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Bootstraps a manager with a single pre-issued key, e.g. from
    /// configuration (`ENVFORGE_BOOTSTRAP_API_KEY`).
    pub async fn with_bootstrap_key(label: &str, raw_key: &str) -> Result<Self> {
        let manager = Self::new();
        let hash = Self::hash_key(raw_key)?;
        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            key_hash: hash,
        };
        manager.keys.write().await.insert(key.id.clone(), key);
        Ok(manager)
    }

    fn hash_key(raw_key: &str) -> Result<String> {
        bcrypt::hash(raw_key, bcrypt::DEFAULT_COST)
            .map_err(|e| CoreError::Internal(format!("failed to hash api key: {e}")))
    }

    /// Issues a new key, returning the raw secret alongside its record.
    /// The raw secret is never stored or retrievable afterward.
    pub async fn issue_key(&self, label: &str) -> Result<(ApiKey, String)> {
        let raw_key = format!("efk_{}", Uuid::new_v4().simple());
        let hash = Self::hash_key(&raw_key)?;
        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            key_hash: hash,
        };
        self.keys.write().await.insert(key.id.clone(), key.clone());
        Ok((key, raw_key))
    }

    pub async fn revoke_key(&self, id: &str) -> Result<()> {
        let mut keys = self.keys.write().await;
        if keys.remove(id).is_none() {
            return Err(CoreError::Internal(format!("api key '{id}' not found")));
        }
        Ok(())
    }

    /// Authenticates a raw bearer/header value against every issued key.
    /// Returns the matching key's id, or `CoreError::AuthInvalid`.
    pub async fn authenticate(&self, raw_key: &str) -> Result<String> {
        let keys = self.keys.read().await;
        for key in keys.values() {
            if bcrypt::verify(raw_key, &key.key_hash).unwrap_or(false) {
                return Ok(key.id.clone());
            }
        }
        Err(CoreError::AuthInvalid)
    }

    pub async fn list_keys(&self) -> Vec<ApiKey> {
        self.keys.read().await.values().cloned().collect()
    }

    pub async fn key_count(&self) -> usize {
        self.keys.read().await.len()
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}
