//! `echo`: the crate's one illustrative fake-service handler. It is not a
//! template for real service business logic — it exists purely to give the
//! Service Dispatcher a live handler to route to and a namespace-scoped
//! session to mutate.
//!
//! Behavior: returns the request body verbatim under `echoed`, and, if the
//! namespace's template declared an `echo_log` table, appends a row
//! recording the call (so a test can assert against the diff that a
//! service call actually mutated the namespace).

use super::{ServiceHandler, ServiceRequest, ServiceResponse};
use crate::connection::Session;
use crate::core::{Result, Value};
use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

pub struct EchoService;

#[async_trait]
impl ServiceHandler for EchoService {
    async fn handle(&self, session: &Session, request: ServiceRequest) -> Result<ServiceResponse> {
        if session.table_schema("echo_log").await.is_ok() {
            session
                .insert_row(
                    "echo_log",
                    vec![
                        Value::Text(Uuid::new_v4().to_string()),
                        Value::Text(request.method.clone()),
                        Value::Text(request.rest_path.clone()),
                        Value::Json(request.body.clone()),
                        request
                            .impersonated_identity
                            .clone()
                            .map(Value::Text)
                            .unwrap_or(Value::Null),
                    ],
                )
                .await?;
        }

        Ok(ServiceResponse::ok(json!({
            "service": "echo",
            "path": request.rest_path,
            "method": request.method,
            "echoed": request.body,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::META_NAMESPACE;
    use crate::connection::SessionRouter;
    use crate::core::{Column, DataType};
    use crate::store::{Store, TableSchema};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn echoes_body_without_a_log_table() {
        let store = Arc::new(Store::new());
        store.create_namespace("state_abc").await.unwrap();
        let sessions = Arc::new(SessionRouter::new(Arc::clone(&store), 4, Duration::from_secs(1)));
        let session = sessions.session_for("state_abc").await.unwrap();

        let response = EchoService
            .handle(
                &session,
                ServiceRequest {
                    rest_path: "channels".into(),
                    method: "GET".into(),
                    body: json!({}),
                    impersonated_identity: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["path"], "channels");
    }

    #[tokio::test]
    async fn logs_call_when_echo_log_table_exists() {
        let store = Arc::new(Store::new());
        store.create_namespace(META_NAMESPACE).await.unwrap();
        store.create_namespace("state_abc").await.unwrap();
        let sessions = Arc::new(SessionRouter::new(Arc::clone(&store), 4, Duration::from_secs(1)));
        let session = sessions.session_for("state_abc").await.unwrap();
        session
            .create_table(TableSchema::new(
                "echo_log",
                vec![
                    Column::new("id", DataType::Text).primary_key(),
                    Column::new("method", DataType::Text),
                    Column::new("path", DataType::Text),
                    Column::new("body", DataType::Json),
                    Column::new("impersonated_identity", DataType::Text),
                ],
            ))
            .await
            .unwrap();

        EchoService
            .handle(
                &session,
                ServiceRequest {
                    rest_path: "channels".into(),
                    method: "POST".into(),
                    body: json!({"name": "general"}),
                    impersonated_identity: Some("user@example.com".into()),
                },
            )
            .await
            .unwrap();

        let rows = session.scan_table("echo_log").await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
