use crate::core::{CoreError, Result};
use std::time::Duration;

/// Namespace name reserved for platform-owned tables (templates,
/// environments, runs, test suites, api keys). Never a valid
/// `namespace_name` for an Environment.
pub const META_NAMESPACE: &str = "meta";

/// Builder-style runtime configuration, in the same shape as the
/// teacher's `ConnectionConfig`: typed fields with sane defaults, an
/// `from_env()` constructor, and a `validate()` that rejects nonsensical
/// combinations before the server starts.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address the axum server binds to.
    pub bind_addr: String,

    /// HMAC-SHA256 signing secret for environment tokens. `None` means
    /// "generate one at start" (development only, logged as a warning).
    pub jwt_secret: Option<String>,

    /// Default environment TTL applied when `init_env` omits `ttlSeconds`.
    pub default_ttl_seconds: u64,

    /// Maximum concurrent sessions the Session Router will hand out.
    pub max_connections: usize,

    /// Sessions kept warm at start (informational; the embedded Store has
    /// no connection-establishment cost, unlike a real driver).
    pub min_connections: usize,

    /// How long `session_for` waits for a free slot before failing.
    pub connect_timeout: Duration,

    /// Entries kept in the Schema Reflector's `(namespace, schema_version)`
    /// cache.
    pub reflector_cache_size: usize,

    /// Cadence of the Isolation Engine's background expiry pass.
    pub expire_pass_interval: Duration,
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            jwt_secret: None,
            default_ttl_seconds: 3600,
            max_connections: 64,
            min_connections: 1,
            connect_timeout: Duration::from_secs(10),
            reflector_cache_size: 512,
            expire_pass_interval: Duration::from_secs(30),
        }
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    pub fn default_ttl_seconds(mut self, ttl: u64) -> Self {
        self.default_ttl_seconds = ttl;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    pub fn reflector_cache_size(mut self, size: usize) -> Self {
        self.reflector_cache_size = size;
        self
    }

    /// Reads `ENVFORGE_*` environment variables over the defaults. Unset
    /// variables are left at their default; malformed ones are an error
    /// rather than a silent fallback.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Ok(addr) = std::env::var("ENVFORGE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(secret) = std::env::var("ENVFORGE_JWT_SECRET") {
            config.jwt_secret = Some(secret);
        }
        if let Ok(raw) = std::env::var("ENVFORGE_DEFAULT_TTL_SECONDS") {
            config.default_ttl_seconds = raw
                .parse()
                .map_err(|_| CoreError::Internal("ENVFORGE_DEFAULT_TTL_SECONDS must be an integer".into()))?;
        }
        if let Ok(raw) = std::env::var("ENVFORGE_MAX_CONNECTIONS") {
            config.max_connections = raw
                .parse()
                .map_err(|_| CoreError::Internal("ENVFORGE_MAX_CONNECTIONS must be an integer".into()))?;
        }
        if let Ok(raw) = std::env::var("ENVFORGE_MIN_CONNECTIONS") {
            config.min_connections = raw
                .parse()
                .map_err(|_| CoreError::Internal("ENVFORGE_MIN_CONNECTIONS must be an integer".into()))?;
        }
        if let Ok(raw) = std::env::var("ENVFORGE_REFLECTOR_CACHE_SIZE") {
            config.reflector_cache_size = raw
                .parse()
                .map_err(|_| CoreError::Internal("ENVFORGE_REFLECTOR_CACHE_SIZE must be an integer".into()))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(CoreError::Internal("max_connections must be > 0".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(CoreError::Internal(
                "min_connections cannot exceed max_connections".into(),
            ));
        }
        if self.default_ttl_seconds == 0 {
            return Err(CoreError::Internal("default_ttl_seconds must be > 0".into()));
        }
        if self.reflector_cache_size == 0 {
            return Err(CoreError::Internal("reflector_cache_size must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new()
    }
}
