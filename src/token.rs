//! Token Service (§4.F): signs and verifies the bearer tokens the Service
//! Dispatcher trusts to bind an agent request to an environment's
//! namespace without a metadata round trip.

use crate::core::{CoreError, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub environment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impersonated_identity: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies environment-scoped JWTs. Holds the HMAC key in
/// memory only — there is no key rotation endpoint, matching the
/// single-secret model described for the platform's token contract.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Builds a service with a random secret, for development starts where
    /// no secret was configured. Tokens issued this way are only valid for
    /// the lifetime of this process.
    pub fn with_generated_secret() -> Self {
        warn!("no jwt secret configured, generated an ephemeral one for this process");
        let secret = uuid::Uuid::new_v4().to_string() + &uuid::Uuid::new_v4().to_string();
        Self::new(&secret)
    }

    pub fn issue(
        &self,
        subject: &str,
        environment_id: &str,
        impersonated_identity: Option<&str>,
        issued_at: i64,
        expires_at: i64,
    ) -> Result<String> {
        let claims = TokenClaims {
            sub: subject.to_string(),
            environment_id: environment_id.to_string(),
            impersonated_identity: impersonated_identity.map(str::to_string),
            iat: issued_at,
            exp: expires_at,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| CoreError::Internal(format!("failed to sign token: {e}")))
    }

    /// Decodes and validates signature + expiry. `jsonwebtoken` checks
    /// `exp` against the current time as part of `decode`.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["sub", "exp", "iat"]);

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| CoreError::AuthInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> i64 {
        1_700_000_000
    }

    #[test]
    fn issued_token_verifies_with_matching_environment() {
        let service = TokenService::new("test-secret-value-0123456789abcdef");
        let token = service
            .issue("agent", "env-1", None, now(), now() + 3600)
            .unwrap();

        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.environment_id, "env-1");
        assert!(claims.impersonated_identity.is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let service = TokenService::new("test-secret-value-0123456789abcdef");
        let token = service.issue("agent", "env-1", None, now() - 7200, now() - 3600).unwrap();
        assert!(service.verify(&token).is_err());
    }

    #[test]
    fn token_signed_with_different_secret_is_rejected() {
        let a = TokenService::new("secret-a-0123456789abcdef01234567");
        let b = TokenService::new("secret-b-0123456789abcdef01234567");
        let token = a.issue("agent", "env-1", None, now(), now() + 3600).unwrap();
        assert!(b.verify(&token).is_err());
    }

    #[test]
    fn impersonated_identity_round_trips() {
        let service = TokenService::new("test-secret-value-0123456789abcdef");
        let token = service
            .issue("agent", "env-1", Some("user@example.com"), now(), now() + 3600)
            .unwrap();
        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.impersonated_identity.as_deref(), Some("user@example.com"));
    }
}
