//! Test suite/test persistence backing `list_test_suites`/`get_test_suite`/
//! `create_test_suite`/`create_tests` (§4.J). Like templates and runs,
//! these live as rows in the `meta` namespace.

use crate::config::META_NAMESPACE;
use crate::connection::SessionRouter;
use crate::core::{Column, CoreError, DataType, Result, Value};
use crate::store::TableSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl TestSuite {
    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::Text(self.id.clone()),
            Value::Text(self.name.clone()),
            self.description.clone().map(Value::Text).unwrap_or(Value::Null),
        ]
    }

    fn from_row(row: &[Value]) -> Result<Self> {
        Ok(Self {
            id: row[0]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::Internal("test_suites row missing 'id'".into()))?,
            name: row[1]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::Internal("test_suites row missing 'name'".into()))?,
            description: row[2].as_str().map(str::to_string),
        })
    }
}

/// A single assertion-spec test, addressable by id and scoped to a suite.
/// `spec` is the raw DSL document (§4.H); it is compiled lazily when a run
/// is evaluated, not at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    pub id: String,
    pub suite_id: String,
    pub name: String,
    pub spec: serde_json::Value,
}

impl Test {
    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::Text(self.id.clone()),
            Value::Text(self.suite_id.clone()),
            Value::Text(self.name.clone()),
            Value::Json(self.spec.clone()),
        ]
    }

    fn from_row(row: &[Value]) -> Result<Self> {
        let spec = match &row[3] {
            Value::Json(j) => j.clone(),
            _ => return Err(CoreError::Internal("tests row missing 'spec'".into())),
        };
        Ok(Self {
            id: row[0]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::Internal("tests row missing 'id'".into()))?,
            suite_id: row[1]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::Internal("tests row missing 'suite_id'".into()))?,
            name: row[2]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::Internal("tests row missing 'name'".into()))?,
            spec,
        })
    }
}

pub fn test_suites_table_schema() -> TableSchema {
    TableSchema::new(
        "test_suites",
        vec![
            Column::new("id", DataType::Text).primary_key(),
            Column::new("name", DataType::Text).not_null(),
            Column::new("description", DataType::Text),
        ],
    )
}

pub fn tests_table_schema() -> TableSchema {
    TableSchema::new(
        "tests",
        vec![
            Column::new("id", DataType::Text).primary_key(),
            Column::new("suite_id", DataType::Text).not_null(),
            Column::new("name", DataType::Text).not_null(),
            Column::new("spec", DataType::Json).not_null(),
        ],
    )
}

pub struct TestSuiteRegistry {
    sessions: Arc<SessionRouter>,
}

impl TestSuiteRegistry {
    pub fn new(sessions: Arc<SessionRouter>) -> Self {
        Self { sessions }
    }

    pub async fn create_suite(&self, name: &str, description: Option<&str>) -> Result<TestSuite> {
        let suite = TestSuite {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
        };
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        session.insert_row("test_suites", suite.to_row()).await?;
        Ok(suite)
    }

    pub async fn list_suites(&self) -> Result<Vec<TestSuite>> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("test_suites").await?;
        rows.iter().map(|row| TestSuite::from_row(row)).collect()
    }

    pub async fn get_suite(&self, id: &str) -> Result<TestSuite> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("test_suites").await?;
        rows.iter()
            .find(|row| row[0].as_str() == Some(id))
            .map(|row| TestSuite::from_row(row))
            .transpose()?
            .ok_or_else(|| CoreError::TestNotFound(id.to_string()))
    }

    pub async fn tests_for_suite(&self, suite_id: &str) -> Result<Vec<Test>> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("tests").await?;
        rows.iter()
            .filter(|row| row[1].as_str() == Some(suite_id))
            .map(|row| Test::from_row(row))
            .collect()
    }

    pub async fn create_tests(&self, suite_id: &str, tests: Vec<(String, serde_json::Value)>) -> Result<Vec<Test>> {
        self.get_suite(suite_id).await?;
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let mut created = Vec::with_capacity(tests.len());
        for (name, spec) in tests {
            let test = Test {
                id: Uuid::new_v4().to_string(),
                suite_id: suite_id.to_string(),
                name,
                spec,
            };
            session.insert_row("tests", test.to_row()).await?;
            created.push(test);
        }
        Ok(created)
    }

    pub async fn get_test(&self, id: &str) -> Result<Test> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("tests").await?;
        rows.iter()
            .find(|row| row[0].as_str() == Some(id))
            .map(|row| Test::from_row(row))
            .transpose()?
            .ok_or_else(|| CoreError::TestNotFound(id.to_string()))
    }
}

// --- §6 handlers: list_test_suites / get_test_suite / create_test_suite / create_tests ---

use super::error::Result as ApiResult;
use super::AppState;
use axum::extract::{Path, State};
use axum::Json;

#[derive(Debug, Serialize)]
pub struct TestSuiteSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ListTestSuitesResponse {
    pub test_suites: Vec<TestSuiteSummary>,
}

pub async fn list_test_suites(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListTestSuitesResponse>> {
    let suites = state.test_suites.list_suites().await?;
    Ok(Json(ListTestSuitesResponse {
        test_suites: suites.into_iter().map(|s| TestSuiteSummary { id: s.id, name: s.name }).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct TestSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct TestSuiteDetailResponse {
    pub id: String,
    pub name: String,
    pub tests: Vec<TestSummary>,
}

pub async fn get_test_suite(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<TestSuiteDetailResponse>> {
    let suite = state.test_suites.get_suite(&id).await?;
    let tests = state.test_suites.tests_for_suite(&id).await?;
    Ok(Json(TestSuiteDetailResponse {
        id: suite.id,
        name: suite.name,
        tests: tests.into_iter().map(|t| TestSummary { id: t.id, name: t.name }).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateTestSuiteRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTestSuiteResponse {
    pub id: String,
    pub name: String,
}

pub async fn create_test_suite(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTestSuiteRequest>,
) -> ApiResult<Json<CreateTestSuiteResponse>> {
    let suite = state.test_suites.create_suite(&body.name, body.description.as_deref()).await?;
    Ok(Json(CreateTestSuiteResponse { id: suite.id, name: suite.name }))
}

#[derive(Debug, Deserialize)]
pub struct NewTest {
    pub name: String,
    pub spec: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateTestsRequest {
    pub tests: Vec<NewTest>,
}

#[derive(Debug, Serialize)]
pub struct CreateTestsResponse {
    pub tests: Vec<TestSummary>,
}

pub async fn create_tests(
    State(state): State<Arc<AppState>>,
    Path(suite_id): Path<String>,
    Json(body): Json<CreateTestsRequest>,
) -> ApiResult<Json<CreateTestsResponse>> {
    let tests = body.tests.into_iter().map(|t| (t.name, t.spec)).collect();
    let created = state.test_suites.create_tests(&suite_id, tests).await?;
    Ok(Json(CreateTestsResponse {
        tests: created.into_iter().map(|t| TestSummary { id: t.id, name: t.name }).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;
    use std::time::Duration;

    async fn registry() -> TestSuiteRegistry {
        let store = Arc::new(Store::new());
        store.create_namespace(META_NAMESPACE).await.unwrap();
        let sessions = Arc::new(SessionRouter::new(Arc::clone(&store), 8, Duration::from_secs(1)));
        let session = sessions.session_for(META_NAMESPACE).await.unwrap();
        session.create_table(test_suites_table_schema()).await.unwrap();
        session.create_table(tests_table_schema()).await.unwrap();
        TestSuiteRegistry::new(sessions)
    }

    #[tokio::test]
    async fn create_and_list_suites() {
        let registry = registry().await;
        registry.create_suite("slack-basics", Some("basic checks")).await.unwrap();
        let suites = registry.list_suites().await.unwrap();
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].name, "slack-basics");
    }

    #[tokio::test]
    async fn create_tests_requires_existing_suite() {
        let registry = registry().await;
        assert!(registry
            .create_tests("does-not-exist", vec![("t1".into(), json!({}))])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn tests_scoped_to_their_suite() {
        let registry = registry().await;
        let suite = registry.create_suite("slack-basics", None).await.unwrap();
        let other = registry.create_suite("linear-basics", None).await.unwrap();

        registry
            .create_tests(&suite.id, vec![("insert-message".into(), json!({"assertions": []}))])
            .await
            .unwrap();
        registry
            .create_tests(&other.id, vec![("insert-issue".into(), json!({"assertions": []}))])
            .await
            .unwrap();

        let suite_tests = registry.tests_for_suite(&suite.id).await.unwrap();
        assert_eq!(suite_tests.len(), 1);
        assert_eq!(suite_tests[0].name, "insert-message");
    }
}
