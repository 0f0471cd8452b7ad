//! Gateway Error Types
//!
//! One domain error enum shared by the registry, event store, session
//! channel, and tunnel supervisor. The ingress pipeline never surfaces
//! these to webhook providers; it maps outcomes to HTTP statuses itself.

use thiserror::Error;

/// Errors surfaced by gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A required field is missing or a supplied value is invalid.
    #[error("validation: {0}")]
    Validation(String),

    /// The named record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The target session has never registered a mailbox.
    #[error("unknown session: {0}")]
    SessionNotFound(String),

    /// Tunnel subprocess could not be spawned or is misconfigured.
    #[error("tunnel: {0}")]
    Tunnel(String),

    #[error("storage: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
