//! Service handler registry (§4.K, §9's "Suspension in service handlers").
//!
//! The core only knows "a service handler, given a namespace-scoped data
//! store, processes a request and may mutate rows" — real business logic
//! (Slack channel-name validation, Linear issue transitions, …) is
//! explicitly out of scope. This module carries exactly one illustrative
//! handler ([`echo::EchoService`]) so the Service Dispatcher has something
//! concrete to exercise end to end.

pub mod echo;

use crate::connection::Session;
use crate::core::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// One agent request forwarded to a fake service, already stripped of its
/// envelope (token, path prefix) by the Service Dispatcher.
pub struct ServiceRequest {
    pub rest_path: String,
    pub method: String,
    pub body: serde_json::Value,
    pub impersonated_identity: Option<String>,
}

/// A fake service's response, rendered verbatim as the dispatcher's HTTP
/// response body.
pub struct ServiceResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ServiceResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }
}

/// Implemented by every fake service. Handlers receive a namespace-bound
/// [`Session`] scoped to the request; per §9 they must not retain it past
/// the call.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, session: &Session, request: ServiceRequest) -> Result<ServiceResponse>;
}

/// The set of fake services the Service Dispatcher can route to, keyed by
/// the `{name}` path segment in `/env/{id}/services/{name}/…`.
pub struct ServiceRegistry {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(name).cloned()
    }

    /// A registry seeded with every handler this crate ships.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(echo::EchoService));
        registry
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_echo() {
        let registry = ServiceRegistry::with_builtin();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("does-not-exist").is_none());
    }
}
