//! Agent Authentication
//! ====================
//! Token generation and verification. Plaintext tokens exist exactly once,
//! in the register/rotate response; every later comparison is digest to
//! digest.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::error::MeshError;
use crate::store::entities::AgentRecord;
use crate::store::EntityStore;
use axum::http::HeaderMap;
use rand::RngCore;
use ring::digest;

/// Generate a random 32-byte bearer token rendered as 64 hex characters.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 digest of a plaintext token (the stored form).
pub fn hash_token(token: &str) -> String {
    hex::encode(digest::digest(&digest::SHA256, token.as_bytes()).as_ref())
}

/// Extract the bearer token from an Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Validate a Bearer token and return the active agent row, or 401.
pub fn verify_agent_token(
    store: &EntityStore,
    headers: &HeaderMap,
) -> Result<AgentRecord, MeshError> {
    let token = bearer_token(headers).ok_or(MeshError::Unauthorized)?;
    store
        .find_agent_by_digest(&hash_token(token))?
        .ok_or(MeshError::Unauthorized)
}

/// Registration gate: when a server-side secret is configured, the request
/// must present it verbatim.
pub fn registration_allowed(configured: Option<&str>, provided: Option<&str>) -> bool {
    match configured {
        Some(secret) => provided == Some(secret),
        None => true,
    }
}
