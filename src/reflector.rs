//! Schema Reflector (§4.B): lists a namespace's user tables and their
//! column/primary-key shape without ever hard-coding a table name, so a
//! freshly cloned namespace reflects correctly on first use.

use crate::core::{Column, Result};
use crate::store::Store;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct TableShape {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    namespace: String,
    schema_version: u64,
}

/// Read-mostly cache keyed by `(namespace, schema_version)`: a namespace's
/// schema_version increments on every DDL-shaped mutation, so a stale
/// entry can never be served — the key itself is already invalidated.
pub struct SchemaReflector {
    store: Arc<Store>,
    cache: Mutex<LruCache<CacheKey, Arc<Vec<TableShape>>>>,
}

impl SchemaReflector {
    pub fn new(store: Arc<Store>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn reflect(&self, namespace: &str) -> Result<Arc<Vec<TableShape>>> {
        let handle = self.store.namespace(namespace).await?;
        let schema_version = handle.read().await.schema_version();
        let key = CacheKey {
            namespace: namespace.to_string(),
            schema_version,
        };

        {
            let mut cache = self.cache.lock().await;
            if let Some(shapes) = cache.get(&key) {
                return Ok(Arc::clone(shapes));
            }
        }

        let table_names = {
            let ns = handle.read().await;
            ns.user_tables().into_iter().map(str::to_string).collect::<Vec<_>>()
        };

        let mut shapes = Vec::with_capacity(table_names.len());
        for name in table_names {
            let ns = handle.read().await;
            let schema = ns.table_schema(&name).await?;
            shapes.push(TableShape {
                name: name.clone(),
                columns: schema.schema().columns().to_vec(),
                primary_key: schema.primary_key_columns().into_iter().map(str::to_string).collect(),
            });
        }

        let shapes = Arc::new(shapes);
        self.cache.lock().await.put(key, Arc::clone(&shapes));
        Ok(shapes)
    }

    /// Drop every cached entry for a namespace, e.g. on environment
    /// deletion.
    pub async fn invalidate_namespace(&self, namespace: &str) {
        let mut cache = self.cache.lock().await;
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }
}
