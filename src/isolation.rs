//! Isolation Engine (§4.E): the lifecycle manager for live environments —
//! create, delete, and time-based expiry. Environment records live in the
//! `meta` namespace the same way templates do.

use crate::config::META_NAMESPACE;
use crate::connection::SessionRouter;
use crate::core::{Column, CoreError, DataType, Result, Value};
use crate::reflector::SchemaReflector;
use crate::store::{Store, TableSchema};
use crate::template::{Template, TemplateRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Ready,
    Deleting,
    Deleted,
}

impl EnvironmentStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(Self::Ready),
            "deleting" => Ok(Self::Deleting),
            "deleted" => Ok(Self::Deleted),
            other => Err(CoreError::Internal(format!("unknown environment status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub environment_id: String,
    pub namespace_name: String,
    pub template_id: String,
    pub owner: Option<String>,
    pub impersonated_identity: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub status: EnvironmentStatus,
}

impl Environment {
    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::Text(self.environment_id.clone()),
            Value::Text(self.namespace_name.clone()),
            Value::Text(self.template_id.clone()),
            self.owner.clone().map(Value::Text).unwrap_or(Value::Null),
            self.impersonated_identity.clone().map(Value::Text).unwrap_or(Value::Null),
            Value::Integer(self.created_at),
            Value::Integer(self.expires_at),
            Value::Text(self.status.as_str().to_string()),
        ]
    }

    fn from_row(row: &[Value]) -> Result<Self> {
        let text = |v: &Value, field: &str| -> Result<String> {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::Internal(format!("environments row missing '{field}'")))
        };
        let int = |v: &Value, field: &str| -> Result<i64> {
            match v {
                Value::Integer(i) => Ok(*i),
                _ => Err(CoreError::Internal(format!("environments row missing '{field}'"))),
            }
        };
        Ok(Self {
            environment_id: text(&row[0], "environment_id")?,
            namespace_name: text(&row[1], "namespace_name")?,
            template_id: text(&row[2], "template_id")?,
            owner: row[3].as_str().map(str::to_string),
            impersonated_identity: row[4].as_str().map(str::to_string),
            created_at: int(&row[5], "created_at")?,
            expires_at: int(&row[6], "expires_at")?,
            status: EnvironmentStatus::parse(&text(&row[7], "status")?)?,
        })
    }
}

pub fn environments_table_schema() -> TableSchema {
    TableSchema::new(
        "environments",
        vec![
            Column::new("environment_id", DataType::Text).primary_key(),
            Column::new("namespace_name", DataType::Text).not_null().unique(),
            Column::new("template_id", DataType::Text).not_null(),
            Column::new("owner", DataType::Text),
            Column::new("impersonated_identity", DataType::Text),
            Column::new("created_at", DataType::Integer).not_null(),
            Column::new("expires_at", DataType::Integer).not_null(),
            Column::new("status", DataType::Text).not_null(),
        ],
    )
}

fn namespace_name_for(environment_id: &str) -> String {
    format!("state_{}", environment_id.replace('-', ""))
}

/// Creates, deletes, and expires environments. Owns no state of its own —
/// everything it touches lives in the `Store` (namespaces) or the `meta`
/// namespace (the `environments` table), so multiple handles to the same
/// underlying store observe each other's changes.
pub struct IsolationEngine {
    store: Arc<Store>,
    sessions: Arc<SessionRouter>,
    templates: Arc<TemplateRegistry>,
    reflector: Arc<SchemaReflector>,
}

impl IsolationEngine {
    pub fn new(
        store: Arc<Store>,
        sessions: Arc<SessionRouter>,
        templates: Arc<TemplateRegistry>,
        reflector: Arc<SchemaReflector>,
    ) -> Self {
        Self {
            store,
            sessions,
            templates,
            reflector,
        }
    }

    pub async fn create_environment(
        &self,
        template_id: &str,
        ttl_seconds: u64,
        owner: Option<&str>,
        impersonate: Option<&str>,
        now: i64,
    ) -> Result<Environment> {
        let template = self.templates.get(template_id).await?;

        let environment_id = Uuid::new_v4().to_string();
        let namespace_name = namespace_name_for(&environment_id);

        if let Err(err) = self.materialize(&namespace_name, &template).await {
            let _ = self.store.drop_namespace(&namespace_name).await;
            return Err(err);
        }

        let environment = Environment {
            environment_id: environment_id.clone(),
            namespace_name,
            template_id: template.id.clone(),
            owner: owner.map(str::to_string),
            impersonated_identity: impersonate.map(str::to_string),
            created_at: now,
            expires_at: now + ttl_seconds as i64,
            status: EnvironmentStatus::Ready,
        };

        if let Err(err) = self.persist(&environment).await {
            let _ = self.store.drop_namespace(&environment.namespace_name).await;
            return Err(err);
        }

        info!(environment_id = %environment.environment_id, template_id = %template.id, "environment created");
        Ok(environment)
    }

    async fn materialize(&self, namespace_name: &str, template: &Template) -> Result<()> {
        self.store.create_namespace(namespace_name).await?;
        let handle = self.store.namespace(namespace_name).await?;

        {
            let mut ns = handle.write().await;
            for table in &template.structural_definition {
                ns.create_table(TableSchema::new(table.name.clone(), table.columns.clone())).await?;
            }
        }

        let ns = handle.read().await;
        for (table_name, rows) in &template.seed_bundle {
            for row in rows {
                ns.insert_row(table_name, row.clone()).await?;
            }
        }
        Ok(())
    }

    async fn persist(&self, environment: &Environment) -> Result<()> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        session.insert_row("environments", environment.to_row()).await?;
        Ok(())
    }

    pub async fn get_environment(&self, environment_id: &str) -> Result<Environment> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("environments").await?;
        rows.iter()
            .find(|row| row[0].as_str() == Some(environment_id))
            .map(|row| Environment::from_row(row))
            .transpose()?
            .ok_or_else(|| CoreError::EnvironmentNotFound(environment_id.to_string()))
    }

    async fn set_status(&self, environment_id: &str, status: EnvironmentStatus) -> Result<()> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let mut env = self.get_environment(environment_id).await?;
        env.status = status;
        session
            .update_row("environments", &vec![Value::Text(environment_id.to_string())], env.to_row())
            .await
    }

    /// Idempotent: an already-deleted id is a success, not an error.
    pub async fn delete_environment(&self, environment_id: &str) -> Result<EnvironmentStatus> {
        let environment = match self.get_environment(environment_id).await {
            Ok(env) => env,
            Err(CoreError::EnvironmentNotFound(_)) => return Ok(EnvironmentStatus::Deleted),
            Err(err) => return Err(err),
        };

        if environment.status == EnvironmentStatus::Deleted {
            return Ok(EnvironmentStatus::Deleted);
        }

        self.set_status(environment_id, EnvironmentStatus::Deleting).await?;
        self.store.drop_namespace(&environment.namespace_name).await?;
        self.reflector.invalidate_namespace(&environment.namespace_name).await;
        self.set_status(environment_id, EnvironmentStatus::Deleted).await?;

        info!(environment_id = %environment_id, "environment deleted");
        Ok(EnvironmentStatus::Deleted)
    }

    /// True once `expires_at` has passed, independent of the reaper's
    /// cadence — the Service Dispatcher checks this before the reaper
    /// would necessarily have run.
    pub async fn is_live(&self, environment_id: &str, now: i64) -> Result<bool> {
        let environment = self.get_environment(environment_id).await?;
        Ok(environment.status == EnvironmentStatus::Ready && environment.expires_at > now)
    }

    /// Scans for expired environments and reaps them, returning the ids
    /// reaped. Safe to call concurrently: `delete_environment` is already
    /// idempotent, so an overlapping pass just finds nothing left to do.
    pub async fn expire_pass(&self, now: i64) -> Result<Vec<String>> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("environments").await?;

        let mut reaped = Vec::new();
        for row in rows {
            let env = Environment::from_row(&row)?;
            if env.status == EnvironmentStatus::Ready && env.expires_at < now {
                self.delete_environment(&env.environment_id).await?;
                reaped.push(env.environment_id);
            }
        }
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "expire pass reaped environments");
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{TableDefinition, Visibility, templates_table_schema};
    use std::time::Duration;

    async fn engine() -> (IsolationEngine, Arc<TemplateRegistry>) {
        let store = Arc::new(Store::new());
        store.create_namespace(META_NAMESPACE).await.unwrap();
        let sessions = Arc::new(SessionRouter::new(Arc::clone(&store), 8, Duration::from_secs(1)));
        let session = sessions.session_for(META_NAMESPACE).await.unwrap();
        session.create_table(templates_table_schema()).await.unwrap();
        session.create_table(environments_table_schema()).await.unwrap();

        let templates = Arc::new(TemplateRegistry::new(Arc::clone(&sessions)));
        let reflector = Arc::new(SchemaReflector::new(Arc::clone(&store), 16));
        let engine = IsolationEngine::new(store, sessions, Arc::clone(&templates), reflector);
        (engine, templates)
    }

    fn sample_template() -> Template {
        Template {
            id: String::new(),
            service_name: "slack".into(),
            template_name: "default".into(),
            version: "1".into(),
            description: None,
            structural_definition: vec![TableDefinition {
                name: "channels".into(),
                columns: vec![Column::new("id", DataType::Text).primary_key()],
            }],
            seed_bundle: vec![("channels".into(), vec![vec![Value::Text("C1".into())]])],
            visibility: Visibility::Shared,
            owner: None,
        }
    }

    #[tokio::test]
    async fn create_environment_materializes_namespace_and_seed() {
        let (engine, templates) = engine().await;
        let template = templates.register(sample_template()).await.unwrap();

        let env = engine
            .create_environment(&template.id, 3600, Some("user-1"), None, 1_000)
            .await
            .unwrap();

        assert_eq!(env.status, EnvironmentStatus::Ready);
        let session = engine.sessions.session_for(&env.namespace_name).await.unwrap();
        let rows = session.scan_table("channels").await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn create_environment_with_missing_template_fails_without_residue() {
        let (engine, _templates) = engine().await;
        assert!(engine
            .create_environment("does-not-exist", 3600, None, None, 1_000)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delete_environment_is_idempotent() {
        let (engine, templates) = engine().await;
        let template = templates.register(sample_template()).await.unwrap();
        let env = engine
            .create_environment(&template.id, 3600, None, None, 1_000)
            .await
            .unwrap();

        let first = engine.delete_environment(&env.environment_id).await.unwrap();
        let second = engine.delete_environment(&env.environment_id).await.unwrap();
        assert_eq!(first, EnvironmentStatus::Deleted);
        assert_eq!(second, EnvironmentStatus::Deleted);
        assert!(!engine.store.namespace_exists(&env.namespace_name).await);
    }

    #[tokio::test]
    async fn expire_pass_reaps_expired_environments_only() {
        let (engine, templates) = engine().await;
        let template = templates.register(sample_template()).await.unwrap();

        let short_lived = engine
            .create_environment(&template.id, 10, None, None, 1_000)
            .await
            .unwrap();

        let reaped = engine.expire_pass(1_000 + 20).await.unwrap();
        assert_eq!(reaped, vec![short_lived.environment_id.clone()]);

        let refreshed = engine.get_environment(&short_lived.environment_id).await.unwrap();
        assert_eq!(refreshed.status, EnvironmentStatus::Deleted);
    }
}
