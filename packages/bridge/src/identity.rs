use async_trait::async_trait;
use axum::http::HeaderMap;
use codex_bridge_error::BridgeError;

use crate::config::{Config, SecurityMethod};

pub const DEFAULT_USER_ID: &str = "default";
const USER_ID_HEADER: &str = "x-user-id";

/// Resolves the effective user id for a request: body field, then
/// `X-User-Id` header, then query parameter. With identity enforcement off
/// and overrides disabled, everyone shares the literal `default` id.
pub fn resolve_user_id(
    config: &Config,
    body_user_id: Option<&str>,
    headers: &HeaderMap,
    query_user_id: Option<&str>,
) -> Result<String, BridgeError> {
    let requested = body_user_id
        .or_else(|| {
            headers
                .get(USER_ID_HEADER)
                .and_then(|value| value.to_str().ok())
        })
        .or(query_user_id)
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match config.security_method {
        SecurityMethod::Keycloak => requested.map(ToOwned::to_owned).ok_or_else(|| {
            BridgeError::validation("Missing user id")
        }),
        SecurityMethod::None => {
            if config.allow_user_id_override {
                Ok(requested.unwrap_or(DEFAULT_USER_ID).to_string())
            } else {
                Ok(DEFAULT_USER_ID.to_string())
            }
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(ToOwned::to_owned)
}

/// External identity collaborator: checks that the caller's credential
/// belongs to the requested user. Token introspection itself lives outside
/// this crate; deployments install their own implementation.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(
        &self,
        bearer_token: Option<&str>,
        user_id: &str,
    ) -> Result<(), BridgeError>;
}

/// No identity enforcement (`security_method = none`).
pub struct OpenAccess;

#[async_trait]
impl IdentityVerifier for OpenAccess {
    async fn verify(&self, _bearer_token: Option<&str>, _user_id: &str) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Placeholder for `security_method = keycloak` when no collaborator has
/// been installed: every identity-requiring request is refused.
pub struct Unavailable;

#[async_trait]
impl IdentityVerifier for Unavailable {
    async fn verify(&self, _bearer_token: Option<&str>, _user_id: &str) -> Result<(), BridgeError> {
        Err(BridgeError::AuthorizationUnavailable)
    }
}

pub fn default_verifier(method: SecurityMethod) -> std::sync::Arc<dyn IdentityVerifier> {
    match method {
        SecurityMethod::None => std::sync::Arc::new(OpenAccess),
        SecurityMethod::Keycloak => std::sync::Arc::new(Unavailable),
    }
}
