//! Error types for the replicant client

use thiserror::Error;

use crate::schema::ValidationFailure;

/// Errors raised by the transport boundary.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,

    #[error("acknowledgement failed: {0}")]
    AckFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the replicant core.
#[derive(Error, Debug)]
pub enum ReplicantError {
    #[error("schema validation failed: {0}")]
    Validation(ValidationFailure),

    #[error("declaration rejected for {ident}: {reason}")]
    DeclarationRejected { ident: String, reason: String },

    #[error("assignment rejected for {ident}: {reason}")]
    AssignmentRejected { ident: String, reason: String },

    #[error("node at {path} is already owned by replicant {owner}")]
    OwnershipViolation { path: String, owner: String },

    #[error("replicant {ident} already exists with different options")]
    OptionsMismatch { ident: String },

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("replicant is not declared yet")]
    NotDeclared,

    #[error("no value at path {0}")]
    NoSuchPath(String),

    #[error("expected an object or array at {0}")]
    NotAContainer(String),

    #[error("expected an array at {0}")]
    NotAnArray(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
