//! Crate-wide error taxonomy. Callers branch on these classes: only `Auth`
//! and `Sync` tear a session down, `Network` never does.

use std::collections::HashMap;

use thiserror::Error;

use crate::idp::RedirectFlow;

/// Failure classes for session and provider operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable response from the peer; possibly transient.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Rejected input with per-field messages, either by the caller-side
    /// pre-checks or by the backend.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields: HashMap<String, String>,
    },

    /// Credentials or bearer token rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The backend refused an identity the external provider still vouches
    /// for. Both sessions have already been ended when this is returned; the
    /// host should follow `logout` to clear the provider's cookies.
    #[error("identity sync rejected: {reason}")]
    Sync {
        reason: String,
        logout: Box<RedirectFlow>,
    },

    /// Refresh token exhausted; only a fresh interactive login can recover.
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    /// Missing or malformed configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A response arrived but did not match the expected shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Any other HTTP failure, with whatever message the server supplied.
    #[error("request failed ({status}): {message}")]
    Http { status: u16, message: String },
}

impl Error {
    /// Single-field validation failure.
    pub(crate) fn field(name: &str, message: &str) -> Self {
        Self::Validation {
            message: message.to_string(),
            fields: HashMap::from([(name.to_string(), message.to_string())]),
        }
    }
}
