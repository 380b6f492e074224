//! Access controller for the client-facing transport.
//!
//! Bearer tokens come in three shapes: project API keys (`project_…`), MCP
//! API keys (`mch_…`), and JWTs signed with an HS-family algorithm against
//! `AUTH_SECRET`. `alg=none` tokens are accepted only in explicit dev mode.
//! `DISABLE_AUTH=true` bypasses authentication everywhere.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::Settings;
use crate::error::AuthError;
use crate::store::{ConfigStore, Principal};

/// JWT claims the proxy cares about. Everything else is opaque.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    #[allow(dead_code)]
    exp: Option<u64>,
}

/// Authenticates incoming requests and yields a principal.
pub struct Authenticator {
    store: Arc<dyn ConfigStore>,
    secret: Option<String>,
    disable_auth: bool,
    dev_unsafe_jwt: bool,
}

impl Authenticator {
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, settings: &Settings) -> Self {
        if settings.disable_auth {
            tracing::warn!("authentication is DISABLED (DISABLE_AUTH=true)");
        }
        Self {
            store,
            secret: settings.auth_secret.clone(),
            disable_auth: settings.disable_auth,
            dev_unsafe_jwt: settings.dev_unsafe_jwt,
        }
    }

    /// Authenticate a request against a policy flag.
    ///
    /// Returns the principal, or `None` for an anonymous pass (auth
    /// disabled, or the policy does not require it).
    pub async fn authenticate(
        &self,
        auth_required: bool,
        bearer: Option<&str>,
    ) -> Result<Option<Principal>, AuthError> {
        if self.disable_auth {
            return Ok(None);
        }
        if !auth_required {
            return Ok(None);
        }

        let token = bearer.ok_or(AuthError::MissingCredentials)?;
        self.resolve_token(token).await.map(Some)
    }

    /// Resolve a bearer token to a principal regardless of policy.
    pub async fn resolve_token(&self, token: &str) -> Result<Principal, AuthError> {
        if token.starts_with("project_") || token.starts_with("mch_") {
            return self
                .store
                .resolve_api_key(token)
                .await
                .ok_or(AuthError::InvalidToken);
        }
        self.verify_jwt(token)
    }

    fn verify_jwt(&self, token: &str) -> Result<Principal, AuthError> {
        let algorithm = jwt_algorithm(token)?;

        if algorithm.eq_ignore_ascii_case("none") {
            if !self.dev_unsafe_jwt {
                tracing::debug!("rejecting alg=none token outside dev mode");
                return Err(AuthError::InvalidToken);
            }
            return decode_unverified(token);
        }

        let algorithm = match algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                tracing::debug!(alg = other, "unsupported JWT algorithm");
                return Err(AuthError::InvalidToken);
            }
        };

        let secret = self.secret.as_deref().ok_or(AuthError::InvalidToken)?;
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|err| match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => {
                tracing::debug!(error = %err, "JWT verification failed");
                AuthError::InvalidToken
            }
        })?;

        let subject = data.claims.sub.ok_or(AuthError::InvalidToken)?;
        Ok(Principal { subject, project_id: None })
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("disable_auth", &self.disable_auth)
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

/// Read the `alg` field from a JWT header without verifying anything.
fn jwt_algorithm(token: &str) -> Result<String, AuthError> {
    let header_b64 = token.split('.').next().ok_or(AuthError::InvalidToken)?;
    let header_bytes =
        URL_SAFE_NO_PAD.decode(header_b64).map_err(|_| AuthError::InvalidToken)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| AuthError::InvalidToken)?;
    header
        .get("alg")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or(AuthError::InvalidToken)
}

/// Decode an `alg=none` development token. The expiry claim is still
/// enforced even though the signature is not.
fn decode_unverified(token: &str) -> Result<Principal, AuthError> {
    let mut parts = token.split('.');
    let _header = parts.next().ok_or(AuthError::InvalidToken)?;
    let payload_b64 = parts.next().ok_or(AuthError::InvalidToken)?;

    let payload_bytes =
        URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::InvalidToken)?;
    let claims: Claims =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::InvalidToken)?;

    if let Some(exp) = claims.exp {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if exp < now {
            return Err(AuthError::Expired);
        }
    }

    let subject = claims.sub.ok_or(AuthError::InvalidToken)?;
    tracing::debug!(subject = %subject, "accepted unverified dev token");
    Ok(Principal { subject, project_id: None })
}
