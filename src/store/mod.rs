pub mod catalog;
pub mod namespace;
pub mod table;

use crate::core::{CoreError, Result};
use async_trait::async_trait;
use namespace::Namespace;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use namespace::{is_snapshot_table, snapshot_table_name};
pub use table::{RowKey, Table, TableSchema};

/// Behavior every embedded or (eventually) real-database backend must
/// provide. The in-memory `Store` below is the only implementation today;
/// the trait exists so a driver-backed implementation is a drop-in rather
/// than a rewrite of every caller.
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    async fn create_namespace(&self, name: &str) -> Result<()>;
    async fn drop_namespace(&self, name: &str) -> Result<()>;
    async fn fork_namespace(&self, source: &str, dest: &str) -> Result<()>;
    async fn namespace_exists(&self, name: &str) -> bool;
}

/// The embedded relational engine every other component sits on. Owns a
/// map of namespace name → `Namespace`; namespaces are created, forked
/// (template cloning, snapshot tagging), and dropped as whole units.
///
/// In a production deployment this would be a real RDBMS reached over a
/// driver; this engine is a faithful in-process stand-in used both for the
/// default runtime and for the test suite, behind `NamespaceStore` so a
/// future real-database backend can replace it without touching callers.
pub struct Store {
    namespaces: RwLock<HashMap<String, Arc<RwLock<Namespace>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_namespace(&self, name: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        if namespaces.contains_key(name) {
            return Err(CoreError::NamespaceExists(name.to_string()));
        }
        namespaces.insert(name.to_string(), Arc::new(RwLock::new(Namespace::new())));
        Ok(())
    }

    pub async fn drop_namespace(&self, name: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        namespaces.remove(name);
        Ok(())
    }

    pub async fn namespace_exists(&self, name: &str) -> bool {
        self.namespaces.read().await.contains_key(name)
    }

    pub async fn namespace(&self, name: &str) -> Result<Arc<RwLock<Namespace>>> {
        self.namespaces
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NamespaceNotFound(name.to_string()))
    }

    /// Clone `source`'s full contents (catalog + every table's rows) into a
    /// brand-new namespace `dest`. Used both for template-based environment
    /// creation and for `create_template_from_env`'s live-environment
    /// capture.
    pub async fn fork_namespace(&self, source: &str, dest: &str) -> Result<()> {
        let source_handle = self.namespace(source).await?;
        let forked = {
            let source_ns = source_handle.read().await;
            source_ns.fork().await
        };

        let mut namespaces = self.namespaces.write().await;
        if namespaces.contains_key(dest) {
            return Err(CoreError::NamespaceExists(dest.to_string()));
        }
        namespaces.insert(dest.to_string(), Arc::new(RwLock::new(forked)));
        Ok(())
    }

    pub async fn list_namespaces(&self) -> Vec<String> {
        self.namespaces.read().await.keys().cloned().collect()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NamespaceStore for Store {
    async fn create_namespace(&self, name: &str) -> Result<()> {
        Store::create_namespace(self, name).await
    }

    async fn drop_namespace(&self, name: &str) -> Result<()> {
        Store::drop_namespace(self, name).await
    }

    async fn fork_namespace(&self, source: &str, dest: &str) -> Result<()> {
        Store::fork_namespace(self, source, dest).await
    }

    async fn namespace_exists(&self, name: &str) -> bool {
        Store::namespace_exists(self, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, Value};

    #[tokio::test]
    async fn fork_namespace_is_independent() {
        let store = Store::new();
        store.create_namespace("tmpl_acme").await.unwrap();

        {
            let ns_handle = store.namespace("tmpl_acme").await.unwrap();
            let mut ns = ns_handle.write().await;
            ns.create_table(TableSchema::new(
                "channels",
                vec![Column::new("id", DataType::Text).primary_key()],
            ))
            .await
            .unwrap();
            ns.insert_row("channels", vec![Value::Text("c1".into())])
                .await
                .unwrap();
        }

        store.fork_namespace("tmpl_acme", "state_abc123").await.unwrap();

        let forked_handle = store.namespace("state_abc123").await.unwrap();
        {
            let forked = forked_handle.write().await;
            assert_eq!(forked.row_count("channels").await.unwrap(), 1);
        }
        {
            let mut forked = forked_handle.write().await;
            forked
                .insert_row("channels", vec![Value::Text("c2".into())])
                .await
                .unwrap();
        }

        let original_handle = store.namespace("tmpl_acme").await.unwrap();
        let original = original_handle.read().await;
        assert_eq!(original.row_count("channels").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropping_namespace_removes_it() {
        let store = Store::new();
        store.create_namespace("state_x").await.unwrap();
        assert!(store.namespace_exists("state_x").await);
        store.drop_namespace("state_x").await.unwrap();
        assert!(!store.namespace_exists("state_x").await);
    }

    #[tokio::test]
    async fn duplicate_namespace_rejected() {
        let store = Store::new();
        store.create_namespace("state_x").await.unwrap();
        assert!(store.create_namespace("state_x").await.is_err());
    }
}
