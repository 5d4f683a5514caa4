use thiserror::Error;

/// Crate-wide error type.
///
/// One variant per failure kind named in the error-handling design, each
/// carrying enough context to render a useful message without a second
/// lookup. HTTP-facing code (`http::error`) maps this into the wire error
/// envelope via `code()`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("authentication required")]
    AuthMissing,

    #[error("invalid credentials")]
    AuthInvalid,

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("test not found: {0}")]
    TestNotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid dsl at {path}: {reason}")]
    DslInvalid { path: String, reason: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("namespace '{0}' already exists")]
    NamespaceExists(String),

    #[error("column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl<T> From<std::sync::PoisonError<T>> for CoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("lock poisoned: {err}"))
    }
}

impl CoreError {
    /// Stable machine-readable code for the HTTP error envelope (§6).
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthMissing | Self::AuthInvalid => "not_authed",
            Self::TemplateNotFound(_) => "template_not_found",
            Self::EnvironmentNotFound(_) | Self::NamespaceNotFound(_) => "environment_not_found",
            Self::RunNotFound(_) => "run_not_found",
            Self::TestNotFound(_) => "not_found",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::Conflict(_) | Self::TableExists(_) | Self::NamespaceExists(_) => "conflict",
            Self::DslInvalid { .. } => "invalid_dsl",
            Self::StoreUnavailable(_) | Self::Timeout(_) => "internal_error",
            Self::TableNotFound(_) | Self::ColumnNotFound(..) => "not_found",
            Self::TypeMismatch(_) | Self::ConstraintViolation(_) => "internal_error",
            Self::Internal(_) => "internal_error",
        }
    }
}
