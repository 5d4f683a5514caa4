use super::table::TableSchema;
use crate::core::{CoreError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Table-schema metadata for one namespace. Immutable after construction —
/// every mutation returns a new `Catalog`, sharing the unchanged entries
/// with the old one via `Arc`, so a namespace fork never has to walk every
/// table definition to clone it.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    tables: Arc<HashMap<String, TableSchema>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(HashMap::new()),
        }
    }

    pub fn with_table(self, schema: TableSchema) -> Result<Self> {
        let name = schema.name().to_string();
        if self.tables.contains_key(&name) {
            return Err(CoreError::TableExists(name));
        }

        let mut new_tables = (*self.tables).clone();
        new_tables.insert(name, schema);

        Ok(Self {
            tables: Arc::new(new_tables),
        })
    }

    pub fn without_table(self, name: &str) -> Result<Self> {
        if !self.tables.contains_key(name) {
            return Err(CoreError::TableNotFound(name.to_string()));
        }

        let mut new_tables = (*self.tables).clone();
        new_tables.remove(name);

        Ok(Self {
            tables: Arc::new(new_tables),
        })
    }

    pub fn get_table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| CoreError::TableNotFound(name.to_string()))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn list_tables(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType};

    #[test]
    fn with_table_does_not_mutate_original() {
        let catalog = Catalog::new();
        let schema = TableSchema::new("channels", vec![Column::new("id", DataType::Text).primary_key()]);
        let with_channels = catalog.clone().with_table(schema).unwrap();

        assert!(!catalog.table_exists("channels"));
        assert!(with_channels.table_exists("channels"));
    }

    #[test]
    fn duplicate_table_rejected() {
        let catalog = Catalog::new();
        let schema = TableSchema::new("channels", vec![Column::new("id", DataType::Text).primary_key()]);
        let catalog = catalog.with_table(schema.clone()).unwrap();
        assert!(catalog.with_table(schema).is_err());
    }
}
