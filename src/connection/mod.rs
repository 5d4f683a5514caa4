pub mod auth;

use crate::core::{CoreError, Result, Row};
use crate::store::table::RowKey;
use crate::store::{Store, TableSchema};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Exposes `session_for(environment_id | "meta")`. A single semaphore
/// stands in for the teacher's connection pool's size bound — the
/// embedded Store has no per-connection setup cost, so what's actually
/// bounded is concurrent in-flight sessions, not physical sockets.
pub struct SessionRouter {
    store: Arc<Store>,
    permits: Arc<Semaphore>,
    connect_timeout: Duration,
}

impl SessionRouter {
    pub fn new(store: Arc<Store>, max_sessions: usize, connect_timeout: Duration) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(max_sessions)),
            connect_timeout,
        }
    }

    /// Resolve a namespace-bound session. `namespace` is either a live
    /// environment's `namespace_name` or [`crate::config::META_NAMESPACE`]
    /// for the platform's own tables.
    pub async fn session_for(&self, namespace: &str) -> Result<Session> {
        if !self.store.namespace_exists(namespace).await {
            return Err(CoreError::NamespaceNotFound(namespace.to_string()));
        }

        let permit = tokio::time::timeout(self.connect_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| CoreError::Timeout("timed out waiting for a free session slot".into()))?
            .map_err(|_| CoreError::Internal("session semaphore closed".into()))?;

        Ok(Session {
            store: Arc::clone(&self.store),
            namespace: namespace.to_string(),
            permit: Some(permit),
            acquired_at: Instant::now(),
        })
    }

    pub fn stats(&self) -> SessionRouterStats {
        SessionRouterStats {
            available_permits: self.permits.available_permits(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionRouterStats {
    pub available_permits: usize,
}

/// A namespace-bound session handed to a request handler. Scoped like the
/// Store's own pool guard: the semaphore permit releases on drop, and
/// `close()` is available for callers that want the release to happen at
/// an explicit point rather than implicitly at scope exit.
pub struct Session {
    store: Arc<Store>,
    namespace: String,
    permit: Option<OwnedSemaphorePermit>,
    acquired_at: Instant,
}

impl Session {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub async fn create_table(&self, schema: TableSchema) -> Result<()> {
        let handle = self.store.namespace(&self.namespace).await?;
        let mut ns = handle.write().await;
        ns.create_table(schema).await
    }

    pub async fn insert_row(&self, table: &str, row: Row) -> Result<RowKey> {
        let handle = self.store.namespace(&self.namespace).await?;
        let ns = handle.read().await;
        ns.insert_row(table, row).await
    }

    pub async fn update_row(&self, table: &str, key: &RowKey, row: Row) -> Result<()> {
        let handle = self.store.namespace(&self.namespace).await?;
        let ns = handle.read().await;
        ns.update_row(table, key, row).await
    }

    pub async fn delete_row(&self, table: &str, key: &RowKey) -> Result<bool> {
        let handle = self.store.namespace(&self.namespace).await?;
        let ns = handle.read().await;
        ns.delete_row(table, key).await
    }

    pub async fn scan_table(&self, table: &str) -> Result<Vec<Row>> {
        let handle = self.store.namespace(&self.namespace).await?;
        let ns = handle.read().await;
        ns.scan_table(table).await
    }

    pub async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        let handle = self.store.namespace(&self.namespace).await?;
        let ns = handle.read().await;
        ns.table_schema(table).await
    }

    pub async fn user_tables(&self) -> Result<Vec<String>> {
        let handle = self.store.namespace(&self.namespace).await?;
        let ns = handle.read().await;
        Ok(ns.user_tables().into_iter().map(str::to_string).collect())
    }

    pub async fn schema_version(&self) -> Result<u64> {
        let handle = self.store.namespace(&self.namespace).await?;
        let ns = handle.read().await;
        Ok(ns.schema_version())
    }

    /// Explicit, symmetrical counterpart to the implicit `Drop` release —
    /// callers that want the permit freed at a specific point (rather than
    /// scope exit) call this instead of letting the guard fall out of
    /// scope.
    pub fn close(mut self) {
        self.permit.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, Value};

    async fn router_with_namespace(name: &str) -> SessionRouter {
        let store = Arc::new(Store::new());
        store.create_namespace(name).await.unwrap();
        SessionRouter::new(store, 2, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn session_resolves_existing_namespace() {
        let router = router_with_namespace("state_abc").await;
        let session = router.session_for("state_abc").await.unwrap();
        assert_eq!(session.namespace(), "state_abc");
    }

    #[tokio::test]
    async fn session_for_missing_namespace_fails() {
        let router = router_with_namespace("state_abc").await;
        assert!(router.session_for("state_missing").await.is_err());
    }

    #[tokio::test]
    async fn session_insert_and_scan_round_trip() {
        let router = router_with_namespace("state_abc").await;
        let session = router.session_for("state_abc").await.unwrap();

        session
            .create_table(TableSchema::new(
                "messages",
                vec![
                    Column::new("id", DataType::Text).primary_key(),
                    Column::new("text", DataType::Text),
                ],
            ))
            .await
            .unwrap();

        session
            .insert_row(
                "messages",
                vec![Value::Text("m1".into()), Value::Text("hello".into())],
            )
            .await
            .unwrap();

        let rows = session.scan_table("messages").await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn permit_is_released_on_drop() {
        let router = router_with_namespace("state_abc").await;
        {
            let _session = router.session_for("state_abc").await.unwrap();
            assert_eq!(router.stats().available_permits, 1);
        }
        assert_eq!(router.stats().available_permits, 2);
    }

    #[tokio::test]
    async fn permit_is_released_on_explicit_close() {
        let router = router_with_namespace("state_abc").await;
        let session = router.session_for("state_abc").await.unwrap();
        session.close();
        assert_eq!(router.stats().available_permits, 2);
    }
}
