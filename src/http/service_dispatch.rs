//! Service Dispatcher (§4.K): routes `ANY /env/{envId}/services/{svc}/*rest`
//! agent traffic to a registered [`crate::fake_services::ServiceHandler`],
//! after checking the caller's environment-scoped bearer token names the
//! same environment as the path and that the environment is still live.

use super::error::{ApiError, Result};
use super::AppState;
use crate::core::CoreError;
use crate::fake_services::ServiceRequest;
use axum::body::to_bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use std::sync::Arc;

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::not_authed("missing Authorization bearer token"))
}

pub async fn dispatch_service(
    State(state): State<Arc<AppState>>,
    Path((env_id, svc, rest)): Path<(String, String, String)>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response> {
    let token = bearer_token(&headers)?;
    let claims = state.tokens.verify(token).map_err(ApiError::from)?;
    if claims.environment_id != env_id {
        return Err(ApiError::invalid_environment_path(
            "bearer token's environment does not match the request path",
        ));
    }

    let now = Utc::now().timestamp();
    if !state.isolation.is_live(&env_id, now).await? {
        return Err(CoreError::EnvironmentNotFound(env_id).into());
    }
    let environment = state.isolation.get_environment(&env_id).await?;

    let handler = state.services.get(&svc).ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("no service handler registered for '{svc}'"))
    })?;

    let method = request.method().to_string();
    let body_bytes = to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| CoreError::Internal(format!("failed to read request body: {e}")))?;
    let body = if body_bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(serde_json::Value::Null)
    };

    let session = state.sessions.session_for(&environment.namespace_name).await?;
    let service_request = ServiceRequest { rest_path: rest, method, body, impersonated_identity: claims.impersonated_identity };
    let response = handler.handle(&session, service_request).await?;
    session.close();

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    Ok((status, Json(response.body)).into_response())
}
