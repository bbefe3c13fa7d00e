use std::sync::RwLock;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use log::warn;
use serde::Deserialize;

use crate::error::{ChatError, Result};

/// Supplies the bearer token used for the broker and the history service.
pub trait AuthProvider: Send + Sync {
    fn token(&self) -> Option<String>;
    fn is_authenticated(&self) -> bool;

    /// Called when a backend answered 401 to the current token.
    fn reject(&self) {}
}

/// A token handed over as-is.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl AuthProvider for StaticToken {
    fn token(&self) -> Option<String> {
        let token = self.0.trim();
        (!token.is_empty()).then(|| token.to_string())
    }

    fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn is_expired(&self) -> bool {
        self.exp <= Utc::now().timestamp()
    }
}

/// Reads the claims of a JWT without checking its signature.
pub fn decode_claims(token: &str) -> Result<Claims> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ChatError::Auth("token is not a JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ChatError::Auth(format!("token payload is not base64: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| ChatError::Auth(format!("token claims are invalid: {}", e)))
}

/// Holds the session JWT, as set by login and cleared by logout.
#[derive(Default)]
pub struct JwtAuthProvider {
    token: RwLock<Option<String>>,
}

impl JwtAuthProvider {
    pub fn new(token: impl Into<String>) -> Self {
        let provider = Self::default();
        provider.set_token(token);
        provider
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        let mut slot = self.token.write().unwrap_or_else(|p| p.into_inner());
        *slot = (!token.trim().is_empty()).then(|| token.trim().to_string());
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn claims(&self) -> Option<Claims> {
        let token = self.token.read().unwrap_or_else(|p| p.into_inner()).clone()?;
        match decode_claims(&token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                warn!("Ignoring unreadable session token: {}", e);
                None
            }
        }
    }

    /// The local user id carried in the token.
    pub fn subject(&self) -> Option<String> {
        self.claims().map(|claims| claims.sub)
    }
}

impl AuthProvider for JwtAuthProvider {
    fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn is_authenticated(&self) -> bool {
        self.claims().is_some_and(|claims| !claims.is_expired())
    }

    fn reject(&self) {
        warn!("Session token was rejected, clearing it");
        self.clear();
    }
}
