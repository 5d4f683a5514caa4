//! Differ (§4.G): the algorithmic heart. Snapshots a namespace's user
//! tables and computes a row-level diff between two snapshots via a full
//! outer join keyed by primary key.

use crate::core::{Result, Row, Value};
use crate::reflector::{SchemaReflector, TableShape};
use crate::store::{Store, is_snapshot_table, snapshot_table_name};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatedRow {
    pub before: Row,
    pub after: Row,
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableDiff {
    pub inserts: Vec<Row>,
    pub deletes: Vec<Row>,
    pub updates: Vec<UpdatedRow>,
    /// Rows present under the same key in both snapshots with no changed
    /// fields — the Assertion Engine's `unchanged` bucket (§4.I).
    pub unchanged: Vec<Row>,
}

/// Full diff across every user table in a namespace, keyed by table name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diff {
    pub tables: HashMap<String, TableDiff>,
}

impl Diff {
    pub fn table(&self, name: &str) -> Option<&TableDiff> {
        self.tables.get(name)
    }
}

pub struct Differ {
    store: Arc<Store>,
    reflector: Arc<SchemaReflector>,
}

impl Differ {
    pub fn new(store: Arc<Store>, reflector: Arc<SchemaReflector>) -> Self {
        Self { store, reflector }
    }

    /// Creates `{T}_snapshot_{suffix}` for every user table. Batched:
    /// if any table fails, every snapshot already created for this suffix
    /// is rolled back so a partial batch never lingers.
    pub async fn snapshot(&self, namespace: &str, suffix: &str) -> Result<()> {
        let shapes = self.reflector.reflect(namespace).await?;
        let handle = self.store.namespace(namespace).await?;

        for shape in shapes.iter() {
            let result = {
                let mut ns = handle.write().await;
                ns.snapshot_table(&shape.name, suffix).await
            };
            if let Err(err) = result {
                let mut ns = handle.write().await;
                let _ = ns.drop_snapshot_suffix(suffix).await;
                return Err(err);
            }
        }

        self.reflector.invalidate_namespace(namespace).await;
        Ok(())
    }

    /// True iff every user table currently reflected in `namespace` has a
    /// side-table under `suffix`. Used by `diff_run` to decide whether an
    /// `after` snapshot can be reused or must be (re)taken.
    pub async fn snapshot_exists(&self, namespace: &str, suffix: &str) -> Result<bool> {
        let shapes = self.reflector.reflect(namespace).await?;
        if shapes.is_empty() {
            return Ok(false);
        }
        let handle = self.store.namespace(namespace).await?;
        let ns = handle.read().await;
        Ok(shapes.iter().all(|shape| ns.snapshot_suffix_exists(&shape.name, suffix)))
    }

    pub async fn drop_snapshot(&self, namespace: &str, suffix: &str) -> Result<()> {
        let handle = self.store.namespace(namespace).await?;
        let mut ns = handle.write().await;
        ns.drop_snapshot_suffix(suffix).await?;
        drop(ns);
        self.reflector.invalidate_namespace(namespace).await;
        Ok(())
    }

    /// Diffs two snapshot suffixes within the same namespace. The table set
    /// is the union of tables currently reflected in the namespace and any
    /// base table name that still has a `{T}_snapshot_{suffix}` side-table
    /// under either suffix — so a table dropped between the two snapshots
    /// is still diffed from its surviving side-table(s) even though current
    /// reflection no longer knows about it (all of its rows surface as
    /// deletes, per the dropped-table edge case).
    pub async fn diff(
        &self,
        namespace: &str,
        before_suffix: &str,
        after_suffix: &str,
        ignore_columns: &[String],
    ) -> Result<Diff> {
        let shapes = self.reflector.reflect(namespace).await?;
        let handle = self.store.namespace(namespace).await?;
        let ns = handle.read().await;

        let before_marker = format!("_snapshot_{before_suffix}");
        let after_marker = format!("_snapshot_{after_suffix}");
        let mut table_names: HashSet<String> = shapes.iter().map(|s| s.name.clone()).collect();
        for name in ns.catalog().list_tables() {
            if let Some(base) = name.strip_suffix(before_marker.as_str()) {
                table_names.insert(base.to_string());
            }
            if let Some(base) = name.strip_suffix(after_marker.as_str()) {
                table_names.insert(base.to_string());
            }
        }

        let shapes_by_name: HashMap<&str, &TableShape> =
            shapes.iter().map(|shape| (shape.name.as_str(), shape)).collect();

        let mut diff = Diff::default();
        for base_name in table_names {
            let before_name = snapshot_table_name(&base_name, before_suffix);
            let after_name = snapshot_table_name(&base_name, after_suffix);

            let before_rows = if ns.table_exists(&before_name) {
                ns.scan_table(&before_name).await?
            } else {
                Vec::new()
            };
            let after_rows = if ns.table_exists(&after_name) {
                ns.scan_table(&after_name).await?
            } else {
                Vec::new()
            };

            let shape = match shapes_by_name.get(base_name.as_str()) {
                Some(shape) => (*shape).clone(),
                None => {
                    // Dropped since these snapshots were taken: recover the
                    // shape from whichever side-table survived.
                    let source = if ns.table_exists(&before_name) { &before_name } else { &after_name };
                    let schema = ns.table_schema(source).await?;
                    TableShape {
                        name: base_name.clone(),
                        columns: schema.schema().columns().to_vec(),
                        primary_key: schema.primary_key_columns().into_iter().map(str::to_string).collect(),
                    }
                }
            };

            let table_diff = diff_table(&shape, &before_rows, &after_rows, ignore_columns);
            diff.tables.insert(base_name, table_diff);
        }
        Ok(diff)
    }
}

fn row_key(shape: &TableShape, row: &Row) -> Vec<Value> {
    if shape.primary_key.is_empty() {
        return vec![Value::Integer(synthetic_hash(row) as i64)];
    }
    shape
        .primary_key
        .iter()
        .filter_map(|pk| shape.columns.iter().position(|c| &c.name == pk).map(|idx| row[idx].clone()))
        .collect()
}

fn synthetic_hash(row: &Row) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for value in row {
        value.hash(&mut hasher);
    }
    hasher.finish()
}

fn diff_table(shape: &TableShape, before_rows: &[Row], after_rows: &[Row], ignore_columns: &[String]) -> TableDiff {
    let has_primary_key = !shape.primary_key.is_empty();
    let ignore: HashSet<&str> = ignore_columns.iter().map(String::as_str).collect();

    let before_by_key: HashMap<Vec<Value>, &Row> =
        before_rows.iter().map(|row| (row_key(shape, row), row)).collect();
    let after_by_key: HashMap<Vec<Value>, &Row> = after_rows.iter().map(|row| (row_key(shape, row), row)).collect();

    let before_keys: HashSet<Vec<Value>> = before_by_key.keys().cloned().collect();
    let after_keys: HashSet<Vec<Value>> = after_by_key.keys().cloned().collect();

    let mut inserts: Vec<(Vec<Value>, Row)> = after_keys
        .difference(&before_keys)
        .map(|key| (key.clone(), (*after_by_key[key]).clone()))
        .collect();
    let mut deletes: Vec<(Vec<Value>, Row)> = before_keys
        .difference(&after_keys)
        .map(|key| (key.clone(), (*before_by_key[key]).clone()))
        .collect();

    let mut updates: Vec<(Vec<Value>, UpdatedRow)> = Vec::new();
    let mut unchanged: Vec<(Vec<Value>, Row)> = Vec::new();
    for key in before_keys.intersection(&after_keys) {
        let before_row = before_by_key[key];
        let after_row = after_by_key[key];
        if has_primary_key {
            let changed_fields = changed_field_names(shape, before_row, after_row, &ignore);
            if !changed_fields.is_empty() {
                updates.push((
                    key.clone(),
                    UpdatedRow {
                        before: before_row.clone(),
                        after: after_row.clone(),
                        changed_fields,
                    },
                ));
                continue;
            }
        }
        // PK-less tables never report updates (§4.G); a key surviving the
        // intersection means its full content hashed identically, so it is
        // unchanged by construction.
        unchanged.push((key.clone(), after_row.clone()));
    }

    inserts.sort_by(|a, b| a.0.cmp(&b.0));
    deletes.sort_by(|a, b| a.0.cmp(&b.0));
    updates.sort_by(|a, b| a.0.cmp(&b.0));
    unchanged.sort_by(|a, b| a.0.cmp(&b.0));

    TableDiff {
        inserts: inserts.into_iter().map(|(_, row)| row).collect(),
        deletes: deletes.into_iter().map(|(_, row)| row).collect(),
        updates: updates.into_iter().map(|(_, row)| row).collect(),
        unchanged: unchanged.into_iter().map(|(_, row)| row).collect(),
    }
}

fn changed_field_names(shape: &TableShape, before: &Row, after: &Row, ignore: &HashSet<&str>) -> Vec<String> {
    let pk: HashSet<&str> = shape.primary_key.iter().map(String::as_str).collect();
    let mut changed = Vec::new();
    for (idx, column) in shape.columns.iter().enumerate() {
        if pk.contains(column.name.as_str()) || ignore.contains(column.name.as_str()) {
            continue;
        }
        // NULL-safe: Value::Null == Value::Null already holds under our PartialEq.
        if before[idx] != after[idx] {
            changed.push(column.name.clone());
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType};
    use crate::store::TableSchema;

    async fn store_with_users() -> (Arc<Store>, Arc<SchemaReflector>) {
        let store = Arc::new(Store::new());
        store.create_namespace("state_abc").await.unwrap();
        let handle = store.namespace("state_abc").await.unwrap();
        {
            let mut ns = handle.write().await;
            ns.create_table(TableSchema::new(
                "users",
                vec![
                    Column::new("id", DataType::Text).primary_key(),
                    Column::new("status", DataType::Text),
                ],
            ))
            .await
            .unwrap();
        }
        let reflector = Arc::new(SchemaReflector::new(Arc::clone(&store), 16));
        (store, reflector)
    }

    #[tokio::test]
    async fn round_trip_diff_of_identical_snapshots_is_empty() {
        let (store, reflector) = store_with_users().await;
        let handle = store.namespace("state_abc").await.unwrap();
        {
            let ns = handle.read().await;
            ns.insert_row("users", vec![Value::Text("u1".into()), Value::Text("active".into())])
                .await
                .unwrap();
        }

        let differ = Differ::new(Arc::clone(&store), reflector);
        differ.snapshot("state_abc", "a").await.unwrap();

        let diff = differ.diff("state_abc", "a", "a", &[]).await.unwrap();
        let table_diff = diff.table("users").unwrap();
        assert!(table_diff.inserts.is_empty());
        assert!(table_diff.updates.is_empty());
        assert!(table_diff.deletes.is_empty());
    }

    #[tokio::test]
    async fn detects_insert_update_and_delete() {
        let (store, reflector) = store_with_users().await;
        let handle = store.namespace("state_abc").await.unwrap();
        {
            let ns = handle.read().await;
            ns.insert_row("users", vec![Value::Text("u1".into()), Value::Text("active".into())])
                .await
                .unwrap();
            ns.insert_row("users", vec![Value::Text("u2".into()), Value::Text("active".into())])
                .await
                .unwrap();
        }

        let differ = Differ::new(Arc::clone(&store), Arc::clone(&reflector));
        differ.snapshot("state_abc", "before").await.unwrap();

        {
            let ns = handle.read().await;
            ns.update_row(
                "users",
                &vec![Value::Text("u1".into())],
                vec![Value::Text("u1".into()), Value::Text("suspended".into())],
            )
            .await
            .unwrap();
            ns.delete_row("users", &vec![Value::Text("u2".into())]).await.unwrap();
            ns.insert_row("users", vec![Value::Text("u3".into()), Value::Text("active".into())])
                .await
                .unwrap();
        }
        differ.snapshot("state_abc", "after").await.unwrap();

        let diff = differ.diff("state_abc", "before", "after", &[]).await.unwrap();
        let table_diff = diff.table("users").unwrap();
        assert_eq!(table_diff.inserts.len(), 1);
        assert_eq!(table_diff.deletes.len(), 1);
        assert_eq!(table_diff.updates.len(), 1);
        assert_eq!(table_diff.updates[0].changed_fields, vec!["status".to_string()]);
    }

    #[tokio::test]
    async fn null_valued_columns_compare_null_safe_in_updates() {
        let store = Arc::new(Store::new());
        store.create_namespace("state_abc").await.unwrap();
        let handle = store.namespace("state_abc").await.unwrap();
        {
            let mut ns = handle.write().await;
            ns.create_table(TableSchema::new(
                "issues",
                vec![
                    Column::new("id", DataType::Text).primary_key(),
                    Column::new("assignee", DataType::Text),
                ],
            ))
            .await
            .unwrap();
        }
        let reflector = Arc::new(SchemaReflector::new(Arc::clone(&store), 16));
        let differ = Differ::new(Arc::clone(&store), Arc::clone(&reflector));

        {
            let ns = handle.read().await;
            ns.insert_row("issues", vec![Value::Text("i1".into()), Value::Null]).await.unwrap();
        }
        differ.snapshot("state_abc", "a").await.unwrap();
        // No-op re-snapshot of the same unchanged NULL: must not register as a change.
        let unchanged = differ.diff("state_abc", "a", "a", &[]).await.unwrap();
        assert!(unchanged.table("issues").unwrap().updates.is_empty());

        {
            let ns = handle.read().await;
            ns.update_row(
                "issues",
                &vec![Value::Text("i1".into())],
                vec![Value::Text("i1".into()), Value::Text("u1".into())],
            )
            .await
            .unwrap();
        }
        differ.snapshot("state_abc", "b").await.unwrap();

        let diff = differ.diff("state_abc", "a", "b", &[]).await.unwrap();
        let table_diff = diff.table("issues").unwrap();
        assert_eq!(table_diff.updates.len(), 1);
        assert_eq!(table_diff.updates[0].changed_fields, vec!["assignee".to_string()]);
        assert_eq!(table_diff.updates[0].before[1], Value::Null);
    }

    #[tokio::test]
    async fn snapshot_exists_reflects_taken_snapshots() {
        let (store, reflector) = store_with_users().await;
        let differ = Differ::new(store, reflector);
        assert!(!differ.snapshot_exists("state_abc", "a").await.unwrap());
        differ.snapshot("state_abc", "a").await.unwrap();
        assert!(differ.snapshot_exists("state_abc", "a").await.unwrap());
        assert!(!differ.snapshot_exists("state_abc", "b").await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_suffix_reuse_is_rejected() {
        let (store, reflector) = store_with_users().await;
        let differ = Differ::new(store, reflector);
        differ.snapshot("state_abc", "dup").await.unwrap();
        assert!(differ.snapshot("state_abc", "dup").await.is_err());
    }

    #[tokio::test]
    async fn composite_primary_key_table_diffs_by_full_key_tuple() {
        let store = Arc::new(Store::new());
        store.create_namespace("state_abc").await.unwrap();
        let handle = store.namespace("state_abc").await.unwrap();
        {
            let mut ns = handle.write().await;
            ns.create_table(TableSchema::new(
                "reactions",
                vec![
                    Column::new("message_id", DataType::Text).primary_key(),
                    Column::new("user_id", DataType::Text).primary_key(),
                    Column::new("emoji", DataType::Text),
                ],
            ))
            .await
            .unwrap();
        }
        let reflector = Arc::new(SchemaReflector::new(Arc::clone(&store), 16));
        let differ = Differ::new(Arc::clone(&store), Arc::clone(&reflector));

        {
            let ns = handle.read().await;
            ns.insert_row(
                "reactions",
                vec![Value::Text("m1".into()), Value::Text("u1".into()), Value::Text("thumbsup".into())],
            )
            .await
            .unwrap();
        }
        differ.snapshot("state_abc", "before").await.unwrap();

        {
            let ns = handle.read().await;
            // Same message, different user: a distinct row under the composite key,
            // not an update of the existing one.
            ns.insert_row(
                "reactions",
                vec![Value::Text("m1".into()), Value::Text("u2".into()), Value::Text("heart".into())],
            )
            .await
            .unwrap();
            ns.update_row(
                "reactions",
                &vec![Value::Text("m1".into()), Value::Text("u1".into())],
                vec![Value::Text("m1".into()), Value::Text("u1".into()), Value::Text("fire".into())],
            )
            .await
            .unwrap();
        }
        differ.snapshot("state_abc", "after").await.unwrap();

        let diff = differ.diff("state_abc", "before", "after", &[]).await.unwrap();
        let table_diff = diff.table("reactions").unwrap();
        assert_eq!(table_diff.inserts.len(), 1);
        assert_eq!(table_diff.updates.len(), 1);
        assert_eq!(table_diff.updates[0].changed_fields, vec!["emoji".to_string()]);
    }

    #[tokio::test]
    async fn table_without_primary_key_reports_inserts_and_deletes_but_no_updates() {
        let store = Arc::new(Store::new());
        store.create_namespace("state_abc").await.unwrap();
        let handle = store.namespace("state_abc").await.unwrap();
        {
            let mut ns = handle.write().await;
            ns.create_table(TableSchema::new("audit_log", vec![Column::new("message", DataType::Text)]))
                .await
                .unwrap();
        }
        let reflector = Arc::new(SchemaReflector::new(Arc::clone(&store), 16));
        let differ = Differ::new(Arc::clone(&store), Arc::clone(&reflector));

        {
            let ns = handle.read().await;
            ns.insert_row("audit_log", vec![Value::Text("created".into())]).await.unwrap();
        }
        differ.snapshot("state_abc", "before").await.unwrap();

        {
            let ns = handle.read().await;
            ns.insert_row("audit_log", vec![Value::Text("updated".into())]).await.unwrap();
        }
        differ.snapshot("state_abc", "after").await.unwrap();

        let diff = differ.diff("state_abc", "before", "after", &[]).await.unwrap();
        let table_diff = diff.table("audit_log").unwrap();
        assert_eq!(table_diff.inserts.len(), 1);
        assert!(table_diff.deletes.is_empty());
        assert!(table_diff.updates.is_empty());
    }

    #[tokio::test]
    async fn table_dropped_between_snapshots_reports_all_rows_as_deletes() {
        let (store, reflector) = store_with_users().await;
        let handle = store.namespace("state_abc").await.unwrap();
        {
            let ns = handle.read().await;
            ns.insert_row("users", vec![Value::Text("u1".into()), Value::Text("active".into())])
                .await
                .unwrap();
        }
        let differ = Differ::new(Arc::clone(&store), Arc::clone(&reflector));
        differ.snapshot("state_abc", "before").await.unwrap();

        {
            let mut ns = handle.write().await;
            ns.drop_table("users").await.unwrap();
        }
        differ.snapshot("state_abc", "after").await.unwrap();

        let diff = differ.diff("state_abc", "before", "after", &[]).await.unwrap();
        let table_diff = diff.table("users").unwrap();
        assert_eq!(table_diff.deletes.len(), 1);
        assert!(table_diff.inserts.is_empty());
        assert!(table_diff.updates.is_empty());
    }

    #[tokio::test]
    async fn masked_column_is_excluded_from_changed_fields() {
        let (store, reflector) = store_with_users().await;
        let handle = store.namespace("state_abc").await.unwrap();
        {
            let ns = handle.read().await;
            ns.insert_row("users", vec![Value::Text("u1".into()), Value::Text("active".into())])
                .await
                .unwrap();
        }
        let differ = Differ::new(Arc::clone(&store), Arc::clone(&reflector));
        differ.snapshot("state_abc", "before").await.unwrap();
        {
            let ns = handle.read().await;
            ns.update_row(
                "users",
                &vec![Value::Text("u1".into())],
                vec![Value::Text("u1".into()), Value::Text("suspended".into())],
            )
            .await
            .unwrap();
        }
        differ.snapshot("state_abc", "after").await.unwrap();

        let diff = differ
            .diff("state_abc", "before", "after", &["status".to_string()])
            .await
            .unwrap();
        assert!(diff.table("users").unwrap().updates.is_empty());
    }
}
