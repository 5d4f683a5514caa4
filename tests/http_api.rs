//! End-to-end coverage of the Platform Dispatcher + Service Dispatcher,
//! driven straight through the axum router rather than against any one
//! module in isolation.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use envforge::config::{ServiceConfig, META_NAMESPACE};
use envforge::connection::auth::AuthManager;
use envforge::connection::SessionRouter;
use envforge::core::{Column, DataType};
use envforge::differ::Differ;
use envforge::fake_services::ServiceRegistry;
use envforge::http::runs::{runs_table_schema, RunRegistry};
use envforge::http::test_suites::{test_suites_table_schema, tests_table_schema, TestSuiteRegistry};
use envforge::http::{build_router, AppState};
use envforge::isolation::{environments_table_schema, IsolationEngine};
use envforge::reflector::SchemaReflector;
use envforge::store::Store;
use envforge::template::{templates_table_schema, TemplateRegistry};
use envforge::token::TokenService;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const BOOTSTRAP_KEY: &str = "efk_test_bootstrap_key";

async fn test_app() -> (axum::Router, Arc<AppState>) {
    let store = Arc::new(Store::new());
    store.create_namespace(META_NAMESPACE).await.unwrap();

    let config = ServiceConfig::new().jwt_secret("test-secret-0123456789abcdefghijk");
    let sessions = Arc::new(SessionRouter::new(Arc::clone(&store), config.max_connections, config.connect_timeout));
    {
        let meta = sessions.session_for(META_NAMESPACE).await.unwrap();
        meta.create_table(templates_table_schema()).await.unwrap();
        meta.create_table(environments_table_schema()).await.unwrap();
        meta.create_table(runs_table_schema()).await.unwrap();
        meta.create_table(test_suites_table_schema()).await.unwrap();
        meta.create_table(tests_table_schema()).await.unwrap();
    }

    let templates = Arc::new(TemplateRegistry::new(Arc::clone(&sessions)));
    let reflector = Arc::new(SchemaReflector::new(Arc::clone(&store), config.reflector_cache_size));
    let isolation = Arc::new(IsolationEngine::new(
        Arc::clone(&store),
        Arc::clone(&sessions),
        Arc::clone(&templates),
        Arc::clone(&reflector),
    ));
    let differ = Arc::new(Differ::new(Arc::clone(&store), Arc::clone(&reflector)));
    let tokens = Arc::new(TokenService::new(config.jwt_secret.as_deref().unwrap()));
    let auth = Arc::new(AuthManager::with_bootstrap_key("bootstrap", BOOTSTRAP_KEY).await.unwrap());
    let test_suites = Arc::new(TestSuiteRegistry::new(Arc::clone(&sessions)));
    let runs = Arc::new(RunRegistry::new(Arc::clone(&sessions)));
    let services = Arc::new(ServiceRegistry::with_builtin());

    let state = Arc::new(AppState {
        store,
        sessions,
        templates,
        isolation,
        reflector,
        differ,
        tokens,
        auth,
        test_suites,
        runs,
        services,
        config,
    });

    let router = build_router(Arc::clone(&state));
    (router, state)
}

fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header("x-api-key", BOOTSTRAP_KEY).header("content-type", "application/json")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Registers a "chat" template with one `messages` table and no seed
/// rows, directly through the `TemplateRegistry` — `create_template_from_env`
/// is exercised separately, against a live environment.
async fn register_chat_template(state: &AppState) -> String {
    use envforge::template::{TableDefinition, Template, Visibility};

    let template = Template {
        id: String::new(),
        service_name: "chat".into(),
        template_name: "default".into(),
        version: "1".into(),
        description: Some("a channel and its messages".into()),
        structural_definition: vec![
            TableDefinition {
                name: "channels".into(),
                columns: vec![Column::new("id", DataType::Text).primary_key(), Column::new("name", DataType::Text).not_null()],
            },
            TableDefinition {
                name: "echo_log".into(),
                columns: vec![
                    Column::new("id", DataType::Text).primary_key(),
                    Column::new("method", DataType::Text),
                    Column::new("path", DataType::Text),
                    Column::new("body", DataType::Json),
                    Column::new("impersonated_identity", DataType::Text),
                ],
            },
        ],
        seed_bundle: vec![(
            "channels".into(),
            vec![vec![envforge::Value::Text("C1".into()), envforge::Value::Text("general".into())]],
        )],
        visibility: Visibility::Shared,
        owner: None,
    };
    let registered = state.templates.register(template).await.unwrap();
    registered.id
}

#[tokio::test]
async fn full_lifecycle_init_service_call_diff_evaluate() {
    let (router, state) = test_app().await;
    let template_id = register_chat_template(&state).await;

    // Create a test suite + test whose assertion expects at least one
    // echo_log insert.
    let suite = state.test_suites.create_suite("chat-basics", None).await.unwrap();
    let test = state
        .test_suites
        .create_tests(
            &suite.id,
            vec![(
                "echo-is-logged".into(),
                json!({"assertions": [{"diff_type": "added", "entity": "echo_log", "expected_count": {"min": 1}}]}),
            )],
        )
        .await
        .unwrap()
        .remove(0);

    // init_env
    let response = router
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri("/v1/environments"))
                .body(Body::from(json!({"templateId": template_id}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let init_body = json_body(response).await;
    let environment_id = init_body["environmentId"].as_str().unwrap().to_string();
    let token = init_body["token"].as_str().unwrap().to_string();

    // start_run
    let response = router
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri("/v1/runs"))
                .body(Body::from(json!({"envId": environment_id, "testId": test.id}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let run_body = json_body(response).await;
    let run_id = run_body["runId"].as_str().unwrap().to_string();
    assert_eq!(run_body["status"], "running");

    // Agent call through the Service Dispatcher
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/env/{environment_id}/services/echo/channels"))
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({"name": "general"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let service_body = json_body(response).await;
    assert_eq!(service_body["service"], "echo");

    // diff_run
    let response = router
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri(format!("/v1/runs/{run_id}/diff")))
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let diff_body = json_body(response).await;
    assert_eq!(diff_body["diff"]["tables"]["echo_log"]["inserts"].as_array().unwrap().len(), 1);

    // evaluate_run
    let response = router
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri(format!("/v1/runs/{run_id}/evaluate")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let eval_body = json_body(response).await;
    assert_eq!(eval_body["passed"], true);

    // get_results
    let response = router
        .clone()
        .oneshot(authed(Request::builder().method("GET").uri(format!("/v1/runs/{run_id}"))).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let results_body = json_body(response).await;
    assert_eq!(results_body["status"], "evaluated");
    assert_eq!(results_body["passed"], true);

    // delete_env
    let response = router
        .clone()
        .oneshot(authed(Request::builder().method("DELETE").uri(format!("/v1/environments/{environment_id}"))).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let delete_body = json_body(response).await;
    assert_eq!(delete_body["status"], "deleted");
}

#[tokio::test]
async fn requests_without_api_key_are_rejected() {
    let (router, _state) = test_app().await;
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/environments")
                .header("content-type", "application/json")
                .body(Body::from(json!({"templateId": "does-not-exist"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn service_dispatch_rejects_token_for_a_different_environment() {
    let (router, state) = test_app().await;
    let template_id = register_chat_template(&state).await;

    let response = router
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri("/v1/environments"))
                .body(Body::from(json!({"templateId": template_id}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let init_body = json_body(response).await;
    let token = init_body["token"].as_str().unwrap().to_string();

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/env/some-other-env-id/services/echo/channels")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_template_from_env_requires_an_existing_environment() {
    let (router, _state) = test_app().await;

    let response = router
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri("/v1/templates"))
                .body(
                    Body::from(
                        json!({
                            "environmentId": "does-not-matter",
                            "service": "chat",
                            "name": "private-one",
                            "visibility": "private"
                        })
                        .to_string(),
                    ),
                )
                .unwrap(),
        )
        .await
        .unwrap();
    // environmentId doesn't resolve to a live environment; this just
    // exercises the auth + routing layer's error path.
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
