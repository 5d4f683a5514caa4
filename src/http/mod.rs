//! HTTP surface (§6): the Platform Dispatcher (`/v1/...` control-plane
//! routes, authenticated with a platform API key) and the Service
//! Dispatcher (`/env/{id}/services/{svc}/*rest`, authenticated with an
//! environment-scoped bearer token). Mirrors the teacher's `web` module's
//! shape: one `AppState`, one `build_router`, handlers grouped by
//! resource into sibling files.

pub mod environments;
pub mod error;
pub mod runs;
pub mod service_dispatch;
pub mod templates;
pub mod test_suites;

use crate::config::ServiceConfig;
use crate::connection::auth::AuthManager;
use crate::connection::SessionRouter;
use crate::differ::Differ;
use crate::fake_services::ServiceRegistry;
use crate::isolation::IsolationEngine;
use crate::reflector::SchemaReflector;
use crate::store::Store;
use crate::template::TemplateRegistry;
use crate::token::TokenService;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{any, delete, get, post};
use axum::Router;
use error::ApiError;
use runs::RunRegistry;
use std::sync::Arc;
use test_suites::TestSuiteRegistry;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Everything a handler needs, shared across every request via `Arc`.
pub struct AppState {
    pub store: Arc<Store>,
    pub sessions: Arc<SessionRouter>,
    pub templates: Arc<TemplateRegistry>,
    pub isolation: Arc<IsolationEngine>,
    pub reflector: Arc<SchemaReflector>,
    pub differ: Arc<Differ>,
    pub tokens: Arc<TokenService>,
    pub auth: Arc<AuthManager>,
    pub test_suites: Arc<TestSuiteRegistry>,
    pub runs: Arc<RunRegistry>,
    pub services: Arc<ServiceRegistry>,
    pub config: ServiceConfig,
}

/// The platform API key that authenticated the current request, attached
/// to request extensions by [`require_api_key`] so downstream handlers
/// (template visibility, environment ownership) can read it without a
/// second auth lookup.
#[derive(Debug, Clone)]
pub struct AuthenticatedKey(pub String);

async fn require_api_key(State(state): State<Arc<AppState>>, mut request: Request, next: Next) -> Result<Response, ApiError> {
    let raw_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .ok_or_else(|| ApiError::not_authed("missing X-API-Key or Authorization bearer header"))?;

    let key_id = state.auth.authenticate(&raw_key).await?;
    request.extensions_mut().insert(AuthenticatedKey(key_id));
    Ok(next.run(request).await)
}

/// Assembles the full router: `/v1/...` platform routes behind the
/// API-key gate, plus the ungated (token-checked inside the handler
/// itself) `/env/...` service-dispatch route.
pub fn build_router(state: Arc<AppState>) -> Router {
    let platform_routes = Router::new()
        .route("/v1/environments", post(environments::init_env))
        .route("/v1/environments/:env_id", delete(environments::delete_env))
        .route("/v1/templates", get(templates::list_templates).post(templates::create_template_from_env))
        .route("/v1/templates/:id", get(templates::get_template))
        .route("/v1/test-suites", get(test_suites::list_test_suites).post(test_suites::create_test_suite))
        .route("/v1/test-suites/:id", get(test_suites::get_test_suite))
        .route("/v1/test-suites/:id/tests", post(test_suites::create_tests))
        .route("/v1/runs", post(runs::start_run))
        .route("/v1/runs/:run_id", get(runs::get_results))
        .route("/v1/runs/:run_id/diff", post(runs::diff_run))
        .route("/v1/runs/:run_id/evaluate", post(runs::evaluate_run))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), require_api_key));

    let service_routes = Router::new().route("/env/:env_id/services/:svc/*rest", any(service_dispatch::dispatch_service));

    Router::new()
        .merge(platform_routes)
        .merge(service_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
