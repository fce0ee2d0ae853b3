//! Bearer credential verification
//!
//! Every non-public unit of work carries a signed JWT. Verification failures of
//! any kind (missing, malformed, wrong signature, expired) collapse to the same
//! [`ErrorKind::Unauthorized`](crate::ErrorKind::Unauthorized) outcome; the
//! specific reason is only logged.

use std::str::FromStr;
use std::time::Duration;

use axum::http::{HeaderMap, header};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::AuthConfig;
use crate::routing::path_has_prefix;
use crate::{Error, GatewayError, Result};

/// Claims of a verified credential
pub type Claims = Map<String, Value>;

/// Identity attached to a request or connection after verification
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    subject: String,
    claims: Claims,
    issued_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl Principal {
    /// `sub` claim
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// All claims, registered ones included
    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// `iat` claim, when present
    #[must_use]
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }

    /// `exp` claim
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Credential gate
pub struct AuthGate {
    enabled: bool,
    algorithm: Algorithm,
    decoding: Option<DecodingKey>,
    encoding: Option<EncodingKey>,
    validation: Validation,
    leeway: u64,
    public_paths: Vec<String>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("enabled", &self.enabled)
            .field("algorithm", &self.algorithm)
            .field("public_paths", &self.public_paths)
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    /// Build the gate from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unsupported algorithm or a missing
    /// secret while auth is enabled.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let algorithm = Algorithm::from_str(&config.algorithm)
            .ok()
            .filter(|alg| matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
            .ok_or_else(|| {
                Error::Config(format!(
                    "unsupported auth.algorithm '{}' (expected HS256, HS384 or HS512)",
                    config.algorithm
                ))
            })?;

        let secret = config.resolve_secret();
        if config.enabled && secret.is_none() {
            return Err(Error::Config(
                "auth.jwt_secret is required when auth is enabled".to_string(),
            ));
        }

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.leeway.as_secs();
        validation.set_required_spec_claims(&["exp", "sub"]);
        match &config.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        if let Some(iss) = &config.issuer {
            validation.set_issuer(&[iss]);
        }

        Ok(Self {
            enabled: config.enabled,
            algorithm,
            decoding: secret.as_deref().map(|s| DecodingKey::from_secret(s.as_bytes())),
            encoding: secret.as_deref().map(|s| EncodingKey::from_secret(s.as_bytes())),
            validation,
            leeway: config.leeway.as_secs(),
            public_paths: config.public_paths.clone(),
        })
    }

    /// Whether credentials are enforced
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check if a path bypasses authentication
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path_has_prefix(path, p))
    }

    /// Verify a raw credential
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::unauthorized`] for every verification failure.
    pub fn authenticate(&self, credential: Option<&str>) -> std::result::Result<Principal, GatewayError> {
        let token = credential
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::unauthorized("missing credential"))?;
        let key = self
            .decoding
            .as_ref()
            .ok_or_else(|| GatewayError::unauthorized("no verification key configured"))?;

        let data = jsonwebtoken::decode::<Claims>(token, key, &self.validation)
            .map_err(|e| GatewayError::unauthorized(format!("credential rejected: {e}")))?;
        let claims = data.claims;

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::unauthorized("credential has no subject"))?
            .to_string();

        let exp = claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| GatewayError::unauthorized("credential has no numeric exp"))?;
        // The library accepts exp == now; a credential must expire strictly in the future
        let now = Utc::now().timestamp();
        let leeway = i64::try_from(self.leeway).unwrap_or(i64::MAX);
        if exp.saturating_add(leeway) <= now {
            return Err(GatewayError::unauthorized("credential expired"));
        }
        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| GatewayError::unauthorized("credential exp out of range"))?;
        let issued_at = claims
            .get("iat")
            .and_then(Value::as_i64)
            .and_then(|iat| Utc.timestamp_opt(iat, 0).single());

        debug!(subject = %subject, "Credential verified");
        Ok(Principal {
            subject,
            claims,
            issued_at,
            expires_at,
        })
    }

    /// Verify the `Authorization: Bearer` header
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::unauthorized`] if the header is absent or invalid.
    pub fn authenticate_header(&self, headers: &HeaderMap) -> std::result::Result<Principal, GatewayError> {
        self.authenticate(bearer_token(headers))
    }

    /// Sign a credential for `subject` valid for `ttl`
    ///
    /// # Errors
    ///
    /// Returns an error if no secret is configured or encoding fails.
    pub fn issue(&self, subject: &str, ttl: Duration, extra: Claims) -> Result<String> {
        let key = self
            .encoding
            .as_ref()
            .ok_or_else(|| Error::Config("auth.jwt_secret is not configured".to_string()))?;

        let now = Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let mut claims = extra;
        claims.insert("sub".to_string(), Value::from(subject));
        claims.insert("iat".to_string(), Value::from(now));
        claims.insert("exp".to_string(), Value::from(now.saturating_add(ttl)));

        Ok(jsonwebtoken::encode(&Header::new(self.algorithm), &claims, key)?)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn gate() -> AuthGate {
        AuthGate::from_config(&AuthConfig {
            jwt_secret: Some("unit-test-secret".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_public_path_check() {
        let gate = gate();
        assert!(gate.is_public_path("/health"));
        assert!(gate.is_public_path("/health/liveness"));
        assert!(gate.is_public_path("/api/v1/auth/login"));
        assert!(!gate.is_public_path("/api/v1/authors"));
        assert!(!gate.is_public_path("/api/v1/users"));
        assert!(!gate.is_public_path("/"));
    }

    #[test]
    fn test_issue_then_authenticate() {
        let gate = gate();
        let mut extra = Claims::new();
        extra.insert("role".to_string(), Value::from("admin"));
        let token = gate.issue("user-1", Duration::from_secs(60), extra).unwrap();

        let principal = gate.authenticate(Some(&token)).unwrap();
        assert_eq!(principal.subject(), "user-1");
        assert_eq!(principal.claims()["role"], "admin");
        assert!(principal.expires_at() > Utc::now());
        assert!(principal.issued_at().is_some());
    }

    #[test]
    fn test_expired_token_rejected() {
        let gate = gate();
        let token = gate.issue("user-1", Duration::ZERO, Claims::new()).unwrap();
        let err = gate.authenticate(Some(&token)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Unauthorized);
    }

    #[test]
    fn test_missing_and_garbage_rejected() {
        let gate = gate();
        assert!(gate.authenticate(None).is_err());
        assert!(gate.authenticate(Some("")).is_err());
        assert!(gate.authenticate(Some("not.a.jwt")).is_err());
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_unsupported_algorithm() {
        let err = AuthGate::from_config(&AuthConfig {
            jwt_secret: Some("x".to_string()),
            algorithm: "RS256".to_string(),
            ..Default::default()
        });
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_disabled_gate_needs_no_secret() {
        let gate = AuthGate::from_config(&AuthConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap();
        assert!(!gate.is_enabled());
        assert!(gate.issue("x", Duration::from_secs(1), Claims::new()).is_err());
    }
}
