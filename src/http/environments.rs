//! `init_env`/`delete_env` handlers (§6): the Platform Dispatcher's entry
//! point into the Isolation Engine.

use super::AppState;
use super::error::Result;
use crate::core::{CoreError, Result as CoreResult};
use crate::template::Template;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitEnvRequest {
    pub template_service: Option<String>,
    pub template_name: Option<String>,
    pub template_id: Option<String>,
    #[allow(dead_code)]
    pub test_id: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub impersonate_user_id: Option<String>,
    pub impersonate_email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitEnvResponse {
    pub environment_id: String,
    pub environment_url: String,
    pub expires_at: i64,
    pub schema_name: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Resolves a template from either an explicit `templateId` or a
/// `templateService`/`templateName` pair, preferring the former. Neither
/// present is an error rather than "no template" — an environment must
/// always be cloned from something.
async fn resolve_template(state: &AppState, body: &InitEnvRequest) -> CoreResult<Template> {
    if let Some(id) = &body.template_id {
        return state.templates.get(id).await;
    }
    if let (Some(service), Some(name)) = (&body.template_service, &body.template_name) {
        return state
            .templates
            .find_latest(service, name)
            .await?
            .ok_or_else(|| CoreError::TemplateNotFound(format!("{service}/{name}")));
    }
    Err(CoreError::TemplateNotFound(
        "templateId or templateService+templateName is required".into(),
    ))
}

pub async fn init_env(State(state): State<Arc<AppState>>, Json(body): Json<InitEnvRequest>) -> Result<Json<InitEnvResponse>> {
    let template = resolve_template(&state, &body).await?;
    let now = Utc::now().timestamp();
    let ttl = body.ttl_seconds.unwrap_or(state.config.default_ttl_seconds);
    let impersonate = body.impersonate_email.as_deref().or(body.impersonate_user_id.as_deref());

    let environment = state
        .isolation
        .create_environment(&template.id, ttl, None, impersonate, now)
        .await?;

    let token = state
        .tokens
        .issue("agent", &environment.environment_id, impersonate, now, environment.expires_at)?;

    Ok(Json(InitEnvResponse {
        environment_id: environment.environment_id.clone(),
        environment_url: format!("/env/{}", environment.environment_id),
        expires_at: environment.expires_at,
        schema_name: environment.namespace_name,
        service: template.service_name,
        token: Some(token),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEnvResponse {
    pub environment_id: String,
    pub status: String,
}

pub async fn delete_env(State(state): State<Arc<AppState>>, Path(env_id): Path<String>) -> Result<Json<DeleteEnvResponse>> {
    state.isolation.delete_environment(&env_id).await?;
    Ok(Json(DeleteEnvResponse { environment_id: env_id, status: "deleted".into() }))
}
