//! Template Registry (§4.D): the catalog of `Template` records every
//! environment is cloned from. Templates themselves live as rows in the
//! platform's `meta` namespace (`templates` table), the same way
//! environments, runs, and test suites do — see §6's persisted state
//! layout.

use crate::config::META_NAMESPACE;
use crate::connection::SessionRouter;
use crate::core::{Column, CoreError, DataType, Result, Value};
use crate::store::TableSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Shared,
}

impl Visibility {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Shared => "shared",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Self::Private),
            "shared" => Ok(Self::Shared),
            other => Err(CoreError::Internal(format!("unknown template visibility: {other}"))),
        }
    }
}

/// One table a template's clone must contain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<Column>,
}

/// `structural_definition`: every table a namespace cloned from this
/// template must have, in creation order.
pub type StructuralDefinition = Vec<TableDefinition>;

/// `seed_bundle`: per-table ordered row literals inserted at clone time.
pub type SeedBundle = Vec<(String, Vec<Vec<Value>>)>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub service_name: String,
    pub template_name: String,
    pub version: String,
    pub description: Option<String>,
    pub structural_definition: StructuralDefinition,
    pub seed_bundle: SeedBundle,
    pub visibility: Visibility,
    pub owner: Option<String>,
}

impl Template {
    /// Every declared primary-key column must also be a declared column —
    /// the registration-time check §4.D requires.
    fn validate(&self) -> Result<()> {
        let mut seen_names = std::collections::HashSet::new();
        for table in &self.structural_definition {
            if !seen_names.insert(table.name.clone()) {
                return Err(CoreError::Conflict(format!(
                    "duplicate table name '{}' in template structural definition",
                    table.name
                )));
            }
            for col in table.columns.iter().filter(|c| c.primary_key) {
                if !table.columns.iter().any(|c| c.name == col.name) {
                    return Err(CoreError::Internal(format!(
                        "primary key column '{}' not declared on table '{}'",
                        col.name, table.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn to_row(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.id.clone()),
            Value::Text(self.service_name.clone()),
            Value::Text(self.template_name.clone()),
            Value::Text(self.version.clone()),
            self.description
                .clone()
                .map(Value::Text)
                .unwrap_or(Value::Null),
            Value::Json(serde_json::to_value(&self.structural_definition).map_err(|e| {
                CoreError::Internal(format!("failed to encode structural_definition: {e}"))
            })?),
            Value::Json(
                serde_json::to_value(&self.seed_bundle)
                    .map_err(|e| CoreError::Internal(format!("failed to encode seed_bundle: {e}")))?,
            ),
            Value::Text(self.visibility.as_str().to_string()),
            self.owner.clone().map(Value::Text).unwrap_or(Value::Null),
        ])
    }

    fn from_row(row: &[Value]) -> Result<Self> {
        let text = |v: &Value, field: &str| -> Result<String> {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::Internal(format!("templates row missing '{field}'")))
        };
        let optional_text = |v: &Value| v.as_str().map(str::to_string);

        let structural_definition: StructuralDefinition = match &row[5] {
            Value::Json(j) => serde_json::from_value(j.clone())
                .map_err(|e| CoreError::Internal(format!("corrupt structural_definition: {e}")))?,
            _ => return Err(CoreError::Internal("structural_definition must be json".into())),
        };
        let seed_bundle: SeedBundle = match &row[6] {
            Value::Json(j) => serde_json::from_value(j.clone())
                .map_err(|e| CoreError::Internal(format!("corrupt seed_bundle: {e}")))?,
            _ => return Err(CoreError::Internal("seed_bundle must be json".into())),
        };

        Ok(Self {
            id: text(&row[0], "id")?,
            service_name: text(&row[1], "service_name")?,
            template_name: text(&row[2], "template_name")?,
            version: text(&row[3], "version")?,
            description: optional_text(&row[4]),
            structural_definition,
            seed_bundle,
            visibility: Visibility::parse(&text(&row[7], "visibility")?)?,
            owner: optional_text(&row[8]),
        })
    }
}

pub fn templates_table_schema() -> TableSchema {
    TableSchema::new(
        "templates",
        vec![
            Column::new("id", DataType::Text).primary_key(),
            Column::new("service_name", DataType::Text).not_null(),
            Column::new("template_name", DataType::Text).not_null(),
            Column::new("version", DataType::Text).not_null(),
            Column::new("description", DataType::Text),
            Column::new("structural_definition", DataType::Json).not_null(),
            Column::new("seed_bundle", DataType::Json).not_null(),
            Column::new("visibility", DataType::Text).not_null(),
            Column::new("owner", DataType::Text),
        ],
    )
}

pub struct TemplateRegistry {
    sessions: Arc<SessionRouter>,
}

impl TemplateRegistry {
    pub fn new(sessions: Arc<SessionRouter>) -> Self {
        Self { sessions }
    }

    pub async fn register(&self, mut template: Template) -> Result<Template> {
        template.validate()?;
        if template.id.is_empty() {
            template.id = Uuid::new_v4().to_string();
        }

        if let Some(existing) = self
            .find_by_identity(&template.service_name, &template.template_name, &template.version)
            .await?
        {
            return Err(CoreError::Conflict(format!(
                "template '{}/{}/{}' already exists",
                existing.service_name, existing.template_name, existing.version
            )));
        }

        let session = self.sessions.session_for(META_NAMESPACE).await?;
        session.insert_row("templates", template.to_row()?).await?;
        Ok(template)
    }

    pub async fn get(&self, id: &str) -> Result<Template> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("templates").await?;
        rows.iter()
            .find(|row| row[0].as_str() == Some(id))
            .map(|row| Template::from_row(row))
            .transpose()?
            .ok_or_else(|| CoreError::TemplateNotFound(id.to_string()))
    }

    pub async fn list(&self, caller: Option<&str>) -> Result<Vec<Template>> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("templates").await?;
        let mut templates = Vec::new();
        for row in rows {
            let t = Template::from_row(&row)?;
            let visible = t.visibility == Visibility::Shared || t.owner.as_deref() == caller;
            if visible {
                templates.push(t);
            }
        }
        Ok(templates)
    }

    /// Resolves `{templateService, templateName}` (no explicit id) to the
    /// highest-version matching template, the way `init_env` does when the
    /// caller doesn't pin a specific `templateId`.
    pub async fn find_latest(&self, service_name: &str, template_name: &str) -> Result<Option<Template>> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("templates").await?;
        let mut candidates = Vec::new();
        for row in rows {
            let t = Template::from_row(&row)?;
            if t.service_name == service_name && t.template_name == template_name {
                candidates.push(t);
            }
        }
        candidates.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(candidates.into_iter().next_back())
    }

    async fn find_by_identity(
        &self,
        service_name: &str,
        template_name: &str,
        version: &str,
    ) -> Result<Option<Template>> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("templates").await?;
        for row in rows {
            let t = Template::from_row(&row)?;
            if t.service_name == service_name && t.template_name == template_name && t.version == version {
                return Ok(Some(t));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::time::Duration;

    async fn registry() -> TemplateRegistry {
        let store = Arc::new(Store::new());
        store.create_namespace(META_NAMESPACE).await.unwrap();
        let sessions = Arc::new(SessionRouter::new(Arc::clone(&store), 8, Duration::from_secs(1)));
        let session = sessions.session_for(META_NAMESPACE).await.unwrap();
        session.create_table(templates_table_schema()).await.unwrap();
        TemplateRegistry::new(sessions)
    }

    fn sample_template() -> Template {
        Template {
            id: String::new(),
            service_name: "slack".into(),
            template_name: "default".into(),
            version: "1".into(),
            description: Some("default slack workspace".into()),
            structural_definition: vec![TableDefinition {
                name: "channels".into(),
                columns: vec![Column::new("id", DataType::Text).primary_key()],
            }],
            seed_bundle: vec![("channels".into(), vec![vec![Value::Text("C1".into())]])],
            visibility: Visibility::Shared,
            owner: Some("user-1".into()),
        }
    }

    #[tokio::test]
    async fn register_and_get_round_trip() {
        let registry = registry().await;
        let registered = registry.register(sample_template()).await.unwrap();
        let fetched = registry.get(&registered.id).await.unwrap();
        assert_eq!(fetched.service_name, "slack");
        assert_eq!(fetched.structural_definition.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_identity_rejected() {
        let registry = registry().await;
        registry.register(sample_template()).await.unwrap();
        assert!(registry.register(sample_template()).await.is_err());
    }

    #[tokio::test]
    async fn private_template_hidden_from_other_callers() {
        let registry = registry().await;
        let mut template = sample_template();
        template.visibility = Visibility::Private;
        registry.register(template).await.unwrap();

        let as_owner = registry.list(Some("user-1")).await.unwrap();
        assert_eq!(as_owner.len(), 1);

        let as_other = registry.list(Some("user-2")).await.unwrap();
        assert!(as_other.is_empty());
    }
}
