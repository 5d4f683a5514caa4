use super::catalog::Catalog;
use super::table::{RowKey, Table, TableSchema};
use crate::core::{CoreError, Result, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Suffix marker for side-tables created by the Differ's `snapshot`
/// operation; the Reflector excludes anything matching this shape from
/// user-table enumeration.
pub fn snapshot_table_name(table: &str, suffix: &str) -> String {
    format!("{table}_snapshot_{suffix}")
}

pub fn is_snapshot_table(name: &str) -> bool {
    name.contains("_snapshot_")
}

/// One isolated namespace: a catalog of table schemas plus the row storage
/// for each. Namespaces are the unit of creation, forking, and deletion —
/// callers never address a table without going through its owning
/// namespace.
pub struct Namespace {
    catalog: Catalog,
    tables: HashMap<String, Arc<RwLock<Table>>>,
    schema_version: AtomicU64,
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(),
            tables: HashMap::new(),
            schema_version: AtomicU64::new(0),
        }
    }

    pub fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::SeqCst)
    }

    fn bump_schema_version(&self) {
        self.schema_version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn create_table(&mut self, schema: TableSchema) -> Result<()> {
        let name = schema.name().to_string();
        self.catalog = std::mem::take(&mut self.catalog).with_table(schema.clone())?;
        self.tables.insert(name, Arc::new(RwLock::new(Table::new(schema))));
        self.bump_schema_version();
        Ok(())
    }

    pub async fn drop_table(&mut self, name: &str) -> Result<()> {
        self.catalog = std::mem::take(&mut self.catalog).without_table(name)?;
        self.tables.remove(name);
        self.bump_schema_version();
        Ok(())
    }

    fn table_handle(&self, name: &str) -> Result<Arc<RwLock<Table>>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::TableNotFound(name.to_string()))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.catalog.table_exists(name)
    }

    /// User tables, excluding the Differ's own `*_snapshot_*` side-tables —
    /// this is what the Schema Reflector exposes.
    pub fn user_tables(&self) -> Vec<&str> {
        self.catalog
            .list_tables()
            .into_iter()
            .filter(|name| !is_snapshot_table(name))
            .collect()
    }

    pub async fn insert_row(&self, table: &str, row: Row) -> Result<RowKey> {
        let handle = self.table_handle(table)?;
        let mut t = handle.write().await;
        t.insert(row)
    }

    pub async fn update_row(&self, table: &str, key: &RowKey, row: Row) -> Result<()> {
        let handle = self.table_handle(table)?;
        let mut t = handle.write().await;
        t.update(key, row)
    }

    pub async fn delete_row(&self, table: &str, key: &RowKey) -> Result<bool> {
        let handle = self.table_handle(table)?;
        let mut t = handle.write().await;
        t.delete(key)
    }

    pub async fn scan_table(&self, table: &str) -> Result<Vec<Row>> {
        let handle = self.table_handle(table)?;
        let t = handle.read().await;
        Ok(t.scan())
    }

    pub async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        let handle = self.table_handle(table)?;
        let t = handle.read().await;
        Ok(t.schema().clone())
    }

    /// Create `{table}_snapshot_{suffix}` as a full copy of `table`'s
    /// current contents. Cloning the underlying `Table` is O(1) structural
    /// sharing (`im::OrdMap`), which is what makes inline snapshotting on
    /// the request path viable.
    pub async fn snapshot_table(&mut self, table: &str, suffix: &str) -> Result<()> {
        let snapshot_name = snapshot_table_name(table, suffix);
        if self.table_exists(&snapshot_name) {
            return Err(CoreError::Conflict(format!(
                "snapshot '{snapshot_name}' already exists"
            )));
        }
        let handle = self.table_handle(table)?;
        let cloned = {
            let t = handle.read().await;
            t.clone()
        };
        let mut snapshot_schema = cloned.schema().clone();
        snapshot_schema.name = snapshot_name.clone();

        self.catalog = std::mem::take(&mut self.catalog).with_table(snapshot_schema)?;
        self.tables.insert(snapshot_name, Arc::new(RwLock::new(cloned)));
        self.bump_schema_version();
        Ok(())
    }

    /// Drop every `{table}_snapshot_{suffix}` table for the given suffix,
    /// used both to tear down a run's snapshots and to roll back a
    /// partially-created snapshot batch.
    pub async fn drop_snapshot_suffix(&mut self, suffix: &str) -> Result<()> {
        let marker = format!("_snapshot_{suffix}");
        let to_drop: Vec<String> = self
            .catalog
            .list_tables()
            .into_iter()
            .filter(|name| name.ends_with(&marker))
            .map(str::to_string)
            .collect();
        for name in to_drop {
            self.drop_table(&name).await?;
        }
        Ok(())
    }

    pub fn snapshot_suffix_exists(&self, table: &str, suffix: &str) -> bool {
        self.table_exists(&snapshot_table_name(table, suffix))
    }

    pub async fn row_count(&self, table: &str) -> Result<usize> {
        let handle = self.table_handle(table)?;
        let t = handle.read().await;
        Ok(t.row_count())
    }

    /// Fork this namespace into an independent copy. The `Catalog` clone is
    /// already O(1) (`Arc`-shared until mutated); each `Table` is cloned
    /// individually so the fork gets its own lock and its own persistent
    /// row map — structurally shared with the original's rows until either
    /// side writes, but never the same `RwLock`.
    pub async fn fork(&self) -> Self {
        let mut tables = HashMap::with_capacity(self.tables.len());
        for (name, handle) in &self.tables {
            let cloned = handle.read().await.clone();
            tables.insert(name.clone(), Arc::new(RwLock::new(cloned)));
        }
        Self {
            catalog: self.catalog.clone(),
            tables,
            schema_version: AtomicU64::new(self.schema_version()),
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}
