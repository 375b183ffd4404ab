//! Shared-secret bearer authentication.

use crate::error::AgentError;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Validates the `Authorization: Bearer <token>` credential.
#[derive(Clone)]
pub struct AuthGate {
    token: Arc<[u8]>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}

impl AuthGate {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self {
            token: Arc::from(token.as_ref().as_bytes()),
        }
    }

    /// True only when `presented` is byte-for-byte the configured token.
    pub fn authorize(&self, presented: Option<&[u8]>) -> bool {
        match presented {
            Some(candidate) => constant_time_eq(candidate, &self.token),
            None => false,
        }
    }

    /// Check the bearer credential carried in `headers`.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), AgentError> {
        if self.authorize(bearer_token(headers)) {
            Ok(())
        } else {
            Err(AgentError::Unauthorized)
        }
    }
}

/// Extract the raw token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&[u8]> {
    let value = headers.get(header::AUTHORIZATION)?.as_bytes();
    let (scheme, token) = value.split_at(value.iter().position(|b| *b == b' ')?);
    if !scheme.eq_ignore_ascii_case(b"bearer") {
        return None;
    }
    Some(&token[1..])
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware rejecting any request without the configured credential.
pub async fn require_bearer(
    State(gate): State<AuthGate>,
    request: Request,
    next: Next,
) -> Result<Response, AgentError> {
    if let Err(err) = gate.check(request.headers()) {
        tracing::warn!(
            method = %request.method(),
            uri = %request.uri(),
            "rejected unauthenticated request"
        );
        return Err(err);
    }
    Ok(next.run(request).await)
}
