//! Run persistence backing `start_run`/`diff_run`/`evaluate_run` (§4.J).
//! Runs live in the `meta` namespace the same way environments and
//! templates do.

use crate::config::META_NAMESPACE;
use crate::connection::SessionRouter;
use crate::core::{Column, CoreError, DataType, Result, Value};
use crate::store::TableSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Evaluated,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Evaluated => "evaluated",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "evaluated" => Ok(Self::Evaluated),
            other => Err(CoreError::Internal(format!("unknown run status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub environment_id: String,
    pub test_id: Option<String>,
    pub before_snapshot_suffix: String,
    pub after_snapshot_suffix: Option<String>,
    pub status: RunStatus,
    pub score: Option<f64>,
    pub passed: Option<bool>,
    pub failures: Option<serde_json::Value>,
    pub persisted_diff: Option<serde_json::Value>,
    pub created_at: i64,
}

impl Run {
    fn to_row(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.run_id.clone()),
            Value::Text(self.environment_id.clone()),
            self.test_id.clone().map(Value::Text).unwrap_or(Value::Null),
            Value::Text(self.before_snapshot_suffix.clone()),
            self.after_snapshot_suffix.clone().map(Value::Text).unwrap_or(Value::Null),
            Value::Text(self.status.as_str().to_string()),
            self.score.map(Value::Float).unwrap_or(Value::Null),
            self.passed.map(Value::Boolean).unwrap_or(Value::Null),
            self.failures.clone().map(Value::Json).unwrap_or(Value::Null),
            self.persisted_diff.clone().map(Value::Json).unwrap_or(Value::Null),
            Value::Integer(self.created_at),
        ])
    }

    fn from_row(row: &[Value]) -> Result<Self> {
        let text = |v: &Value, field: &str| -> Result<String> {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::Internal(format!("runs row missing '{field}'")))
        };
        let score = match &row[6] {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        };
        let passed = match &row[7] {
            Value::Boolean(b) => Some(*b),
            _ => None,
        };
        let failures = match &row[8] {
            Value::Json(j) => Some(j.clone()),
            _ => None,
        };
        let persisted_diff = match &row[9] {
            Value::Json(j) => Some(j.clone()),
            _ => None,
        };
        let created_at = match &row[10] {
            Value::Integer(i) => *i,
            _ => 0,
        };

        Ok(Self {
            run_id: text(&row[0], "run_id")?,
            environment_id: text(&row[1], "environment_id")?,
            test_id: row[2].as_str().map(str::to_string),
            before_snapshot_suffix: text(&row[3], "before_snapshot_suffix")?,
            after_snapshot_suffix: row[4].as_str().map(str::to_string),
            status: RunStatus::parse(&text(&row[5], "status")?)?,
            score,
            passed,
            failures,
            persisted_diff,
            created_at,
        })
    }
}

pub fn runs_table_schema() -> TableSchema {
    TableSchema::new(
        "runs",
        vec![
            Column::new("run_id", DataType::Text).primary_key(),
            Column::new("environment_id", DataType::Text).not_null(),
            Column::new("test_id", DataType::Text),
            Column::new("before_snapshot_suffix", DataType::Text).not_null(),
            Column::new("after_snapshot_suffix", DataType::Text),
            Column::new("status", DataType::Text).not_null(),
            Column::new("score", DataType::Float),
            Column::new("passed", DataType::Boolean),
            Column::new("failures", DataType::Json),
            Column::new("persisted_diff", DataType::Json),
            Column::new("created_at", DataType::Integer).not_null(),
        ],
    )
}

pub struct RunRegistry {
    sessions: Arc<SessionRouter>,
}

impl RunRegistry {
    pub fn new(sessions: Arc<SessionRouter>) -> Self {
        Self { sessions }
    }

    /// Starts a run under the caller-supplied `run_id`, so the snapshot
    /// suffix derived from it (`before_{run_id}`) can be taken before this
    /// row is persisted.
    pub async fn start(
        &self,
        run_id: &str,
        environment_id: &str,
        test_id: Option<&str>,
        before_suffix: &str,
        created_at: i64,
    ) -> Result<Run> {
        if let Some(existing) = self.find_running(environment_id).await? {
            return Err(CoreError::PreconditionFailed(format!(
                "environment '{environment_id}' already has a running run '{}'",
                existing.run_id
            )));
        }

        let run = Run {
            run_id: run_id.to_string(),
            environment_id: environment_id.to_string(),
            test_id: test_id.map(str::to_string),
            before_snapshot_suffix: before_suffix.to_string(),
            after_snapshot_suffix: None,
            status: RunStatus::Running,
            score: None,
            passed: None,
            failures: None,
            persisted_diff: None,
            created_at,
        };

        let session = self.sessions.session_for(META_NAMESPACE).await?;
        session.insert_row("runs", run.to_row()?).await?;
        Ok(run)
    }

    async fn find_running(&self, environment_id: &str) -> Result<Option<Run>> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("runs").await?;
        for row in rows {
            let run = Run::from_row(&row)?;
            if run.environment_id == environment_id && run.status == RunStatus::Running {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    pub async fn get(&self, run_id: &str) -> Result<Run> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        let rows = session.scan_table("runs").await?;
        rows.iter()
            .find(|row| row[0].as_str() == Some(run_id))
            .map(|row| Run::from_row(row))
            .transpose()?
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))
    }

    pub async fn save(&self, run: &Run) -> Result<()> {
        let session = self.sessions.session_for(META_NAMESPACE).await?;
        session
            .update_row("runs", &vec![Value::Text(run.run_id.clone())], run.to_row()?)
            .await
    }
}

// --- §6 handlers: start_run / diff_run / evaluate_run / get_results ---

use super::error::{ApiError, Result as ApiResult};
use super::AppState;
use crate::reflector::TableShape;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub env_id: String,
    pub test_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub run_id: String,
    pub status: String,
    pub before_snapshot: String,
}

/// Takes the `before` snapshot and opens a new run in one step, so the
/// snapshot is guaranteed to exist for every persisted run — there is no
/// window where a run row references a snapshot that was never taken.
pub async fn start_run(State(state): State<Arc<AppState>>, Json(body): Json<StartRunRequest>) -> ApiResult<Json<StartRunResponse>> {
    let environment = state.isolation.get_environment(&body.env_id).await?;
    let now = Utc::now().timestamp();
    if !state.isolation.is_live(&body.env_id, now).await? {
        return Err(CoreError::EnvironmentNotFound(body.env_id.clone()).into());
    }

    let run_id = Uuid::new_v4().to_string();
    let before_suffix = format!("before_{run_id}");
    state.differ.snapshot(&environment.namespace_name, &before_suffix).await?;

    let run = state
        .runs
        .start(&run_id, &body.env_id, body.test_id.as_deref(), &before_suffix, now)
        .await?;

    Ok(Json(StartRunResponse {
        run_id: run.run_id,
        status: "running".to_string(),
        before_snapshot: run.before_snapshot_suffix,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiffRunRequest {
    pub recompute: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRunResponse {
    pub before_snapshot: String,
    pub after_snapshot: String,
    pub diff: serde_json::Value,
}

/// Reuses an existing `after` snapshot unless the caller sets
/// `recompute`, in which case the old one is dropped and retaken — the
/// idempotent-by-default behavior §4.G describes.
pub async fn diff_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(body): Json<DiffRunRequest>,
) -> ApiResult<Json<DiffRunResponse>> {
    let mut run = state.runs.get(&run_id).await?;
    let environment = state.isolation.get_environment(&run.environment_id).await?;

    let after_suffix = format!("after_{run_id}");
    let exists = state.differ.snapshot_exists(&environment.namespace_name, &after_suffix).await?;
    if body.recompute && exists {
        state.differ.drop_snapshot(&environment.namespace_name, &after_suffix).await?;
    }
    if body.recompute || !exists {
        state.differ.snapshot(&environment.namespace_name, &after_suffix).await?;
    }

    let diff = state
        .differ
        .diff(&environment.namespace_name, &run.before_snapshot_suffix, &after_suffix, &[])
        .await?;
    let diff_json =
        serde_json::to_value(&diff).map_err(|e| CoreError::Internal(format!("failed to encode diff: {e}")))?;

    run.after_snapshot_suffix = Some(after_suffix.clone());
    run.persisted_diff = Some(diff_json.clone());
    state.runs.save(&run).await?;

    Ok(Json(DiffRunResponse { before_snapshot: run.before_snapshot_suffix, after_snapshot: after_suffix, diff: diff_json }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRunResponse {
    pub run_id: String,
    pub status: String,
    pub passed: bool,
    pub score: f64,
}

/// Ensures an `after` snapshot exists (taking one if `diff_run` was never
/// called), diffs, compiles the run's associated test, and persists the
/// verdict. A DSL compile failure surfaces as `invalid_dsl`, not a
/// semantic assertion failure — those two are kept distinct per §4.H/§4.I.
pub async fn evaluate_run(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> ApiResult<Json<EvaluateRunResponse>> {
    let mut run = state.runs.get(&run_id).await?;
    let environment = state.isolation.get_environment(&run.environment_id).await?;

    let after_suffix = run.after_snapshot_suffix.clone().unwrap_or_else(|| format!("after_{run_id}"));
    if !state.differ.snapshot_exists(&environment.namespace_name, &after_suffix).await? {
        state.differ.snapshot(&environment.namespace_name, &after_suffix).await?;
    }
    let diff = state
        .differ
        .diff(&environment.namespace_name, &run.before_snapshot_suffix, &after_suffix, &[])
        .await?;

    let test_id = run
        .test_id
        .clone()
        .ok_or_else(|| CoreError::PreconditionFailed(format!("run '{run_id}' has no associated test")))?;
    let test = state.test_suites.get_test(&test_id).await?;
    let compiled = crate::dsl::compile(&test.spec).map_err(ApiError::from)?;

    let shapes = state.reflector.reflect(&environment.namespace_name).await?;
    let shape_map: HashMap<String, TableShape> = shapes.iter().map(|s| (s.name.clone(), s.clone())).collect();
    let result = crate::assertion::evaluate(&compiled, &diff, &shape_map);

    run.status = RunStatus::Evaluated;
    run.passed = Some(result.passed);
    run.score = Some(result.score.percent);
    run.failures =
        Some(serde_json::to_value(&result.failures).map_err(|e| CoreError::Internal(format!("failed to encode failures: {e}")))?);
    run.after_snapshot_suffix = Some(after_suffix);
    run.persisted_diff = Some(serde_json::to_value(&diff).map_err(|e| CoreError::Internal(format!("failed to encode diff: {e}")))?);
    state.runs.save(&run).await?;

    Ok(Json(EvaluateRunResponse {
        run_id: run.run_id,
        status: "evaluated".to_string(),
        passed: result.passed,
        score: result.score.percent,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResultsResponse {
    pub run_id: String,
    pub status: String,
    pub passed: Option<bool>,
    pub score: Option<f64>,
    pub failures: Option<serde_json::Value>,
    pub diff: Option<serde_json::Value>,
    pub created_at: i64,
}

pub async fn get_results(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> ApiResult<Json<RunResultsResponse>> {
    let run = state.runs.get(&run_id).await?;
    Ok(Json(RunResultsResponse {
        run_id: run.run_id,
        status: run.status.as_str().to_string(),
        passed: run.passed,
        score: run.score,
        failures: run.failures,
        diff: run.persisted_diff,
        created_at: run.created_at,
    }))
}
