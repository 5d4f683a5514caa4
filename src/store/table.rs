use crate::core::{Column, CoreError, Result, Row, Schema, Value};
use im::{HashMap, OrdMap};
use serde::{Deserialize, Serialize};

/// Table identity: name + schema. Kept distinct from `Table` itself so the
/// Reflector and Template Registry can pass schemas around without the row
/// data attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub schema: Schema,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            schema: Schema::new(columns),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Names of this table's primary-key columns, in declaration order.
    /// Every user table must resolve a non-empty key for the Differ.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.schema.primary_key_columns()
    }
}

/// Composite primary key, built from a row by projecting its PK columns in
/// declaration order. `Value: Ord` gives this a stable total order for free,
/// which `im::OrdMap` relies on. Tables with no declared primary key (a
/// supported boundary case — see the Differ's synthetic-hash fallback) get
/// a single-element synthetic key assigned at insert time instead.
pub type RowKey = Vec<Value>;

/// A single user (or snapshot) table.
///
/// Rows live in a persistent `im::OrdMap` keyed by primary key, so cloning a
/// `Table` — the operation both namespace forking and snapshot-tagging
/// reduce to — is O(1) structural sharing rather than a row-by-row copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    schema: TableSchema,
    rows: OrdMap<RowKey, Row>,
    unique_indexes: HashMap<String, OrdMap<Value, RowKey>>,
    next_synthetic_id: u64,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        let unique_indexes = schema
            .schema()
            .columns()
            .iter()
            .filter(|c| c.unique && !c.primary_key)
            .map(|c| (c.name.clone(), OrdMap::new()))
            .collect();

        Self {
            schema,
            rows: OrdMap::new(),
            unique_indexes,
            next_synthetic_id: 0,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Projects a row's declared primary-key columns, in declaration
    /// order. Returns an empty key for a table with no primary key —
    /// callers decide what that means (insert assigns a synthetic key;
    /// update treats it as "no PK to validate against").
    fn primary_key_of(&self, row: &Row) -> RowKey {
        let columns = self.schema.schema().columns();
        columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|col| {
                let idx = self
                    .schema
                    .schema()
                    .find_column_index(&col.name)
                    .expect("primary key column must exist in its own schema");
                row[idx].clone()
            })
            .collect()
    }

    fn validate_row(&self, row: &Row) -> Result<()> {
        let columns = self.schema.schema().columns();
        if row.len() != columns.len() {
            return Err(CoreError::TypeMismatch(format!(
                "table '{}' expects {} columns, got {}",
                self.schema.name(),
                columns.len(),
                row.len()
            )));
        }
        for (column, value) in columns.iter().zip(row.iter()) {
            column.validate(value)?;
        }
        Ok(())
    }

    fn check_unique_constraints(&self, row: &Row, ignore_key: Option<&RowKey>) -> Result<()> {
        for (col_name, index) in self.unique_indexes.iter() {
            let col_idx = self
                .schema
                .schema()
                .find_column_index(col_name)
                .expect("unique index must track an existing column");
            let value = &row[col_idx];
            if value.is_null() {
                continue;
            }
            if let Some(existing_key) = index.get(value) {
                if Some(existing_key) != ignore_key {
                    return Err(CoreError::ConstraintViolation(format!(
                        "unique constraint violated on column '{col_name}' of table '{}'",
                        self.schema.name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn index_row(&mut self, key: &RowKey, row: &Row) {
        for (col_name, index) in self.unique_indexes.iter_mut() {
            let col_idx = self
                .schema
                .schema()
                .find_column_index(col_name)
                .expect("unique index must track an existing column");
            let value = &row[col_idx];
            if !value.is_null() {
                index.insert(value.clone(), key.clone());
            }
        }
    }

    fn unindex_row(&mut self, row: &Row) {
        for (col_name, index) in self.unique_indexes.iter_mut() {
            let col_idx = self
                .schema
                .schema()
                .find_column_index(col_name)
                .expect("unique index must track an existing column");
            let value = &row[col_idx];
            if !value.is_null() {
                index.remove(value);
            }
        }
    }

    /// Tables with no declared primary key get a monotonically increasing
    /// synthetic key assigned here; it never appears in the row's own
    /// columns, it is purely a storage-layer handle the caller gets back
    /// from `insert` and must keep to address the row later.
    fn next_synthetic_key(&mut self) -> RowKey {
        self.next_synthetic_id += 1;
        vec![Value::Integer(self.next_synthetic_id as i64)]
    }

    pub fn insert(&mut self, row: Row) -> Result<RowKey> {
        self.validate_row(&row)?;
        let declared_key = self.primary_key_of(&row);
        let key = if declared_key.is_empty() {
            self.next_synthetic_key()
        } else {
            if self.rows.contains_key(&declared_key) {
                return Err(CoreError::ConstraintViolation(format!(
                    "primary key already exists in table '{}'",
                    self.schema.name()
                )));
            }
            declared_key
        };
        self.check_unique_constraints(&row, None)?;
        self.index_row(&key, &row);
        self.rows.insert(key.clone(), row);
        Ok(key)
    }

    pub fn update(&mut self, key: &RowKey, new_row: Row) -> Result<()> {
        self.validate_row(&new_row)?;
        if !self.rows.contains_key(key) {
            return Err(CoreError::ConstraintViolation(format!(
                "row with given key not found in table '{}'",
                self.schema.name()
            )));
        }
        let declared_key = self.primary_key_of(&new_row);
        if !declared_key.is_empty() && &declared_key != key {
            return Err(CoreError::ConstraintViolation(
                "primary key may not change on update".into(),
            ));
        }
        self.check_unique_constraints(&new_row, Some(key))?;
        if let Some(old_row) = self.rows.get(key) {
            self.unindex_row(&old_row.clone());
        }
        self.index_row(key, &new_row);
        self.rows.insert(key.clone(), new_row);
        Ok(())
    }

    pub fn delete(&mut self, key: &RowKey) -> Result<bool> {
        if let Some(row) = self.rows.remove(key) {
            self.unindex_row(&row);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn get(&self, key: &RowKey) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Rows in primary-key order, which is what gives seed bundles and
    /// snapshot comparisons deterministic iteration.
    pub fn scan(&self) -> Vec<Row> {
        self.rows.values().cloned().collect()
    }

    pub fn scan_with_keys(&self) -> Vec<(RowKey, Row)> {
        self.rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
