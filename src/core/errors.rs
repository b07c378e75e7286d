// src/core/errors.rs

//! Defines the error types for the fault-tolerance core and its transports.

use crate::core::transport::Capabilities;
use std::sync::Arc;
use thiserror::Error;

/// Failures raised by a transport session or by the wire protocol beneath it.
///
/// `std::io::Error` is not cloneable, so it is wrapped in an `Arc` to keep the
/// whole enum `Clone`; errors are frequently fanned out to several waiters.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session is disconnected")]
    Disconnected,

    #[error("Endpoint '{0}' already exists")]
    AlreadyExists(String),

    #[error("Endpoint '{0}' already exists with incompatible properties")]
    IncompatibleEndpoint(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Broker error: {0}")]
    Broker(String),
}

impl TransportError {
    /// The code prefix used when this error travels as a RESP error reply.
    pub fn wire_code(&self) -> &'static str {
        match self {
            TransportError::AlreadyExists(_) => "EXISTS",
            TransportError::IncompatibleEndpoint(_) => "INCOMPATIBLE",
            TransportError::PermissionDenied(_) => "NOPERM",
            TransportError::UnknownEndpoint(_) => "NOENDPOINT",
            TransportError::Unsupported(_) => "UNSUPPORTED",
            _ => "ERR",
        }
    }

    /// The argument carried by the variant, without the display prefix.
    fn wire_detail(&self) -> String {
        match self {
            TransportError::AlreadyExists(s)
            | TransportError::IncompatibleEndpoint(s)
            | TransportError::PermissionDenied(s)
            | TransportError::UnknownEndpoint(s)
            | TransportError::Unsupported(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Renders the error as the text of a RESP error reply, e.g. `NOENDPOINT orders`.
    pub fn to_wire(&self) -> String {
        format!("{} {}", self.wire_code(), self.wire_detail())
    }

    /// Reconstructs an error from the text of a RESP error reply.
    pub fn from_wire(line: &str) -> Self {
        let (code, detail) = line.split_once(' ').unwrap_or((line, ""));
        let detail = detail.to_string();
        match code {
            "EXISTS" => TransportError::AlreadyExists(detail),
            "INCOMPATIBLE" => TransportError::IncompatibleEndpoint(detail),
            "NOPERM" => TransportError::PermissionDenied(detail),
            "NOENDPOINT" => TransportError::UnknownEndpoint(detail),
            "UNSUPPORTED" => TransportError::Unsupported(detail),
            _ => TransportError::Broker(line.to_string()),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

/// The error type surfaced to applications using the fault-tolerance manager.
#[derive(Error, Debug, Clone)]
pub enum FtError {
    /// The session lacks one or more capabilities required for fault tolerance.
    /// Always fatal to connection construction.
    #[error(
        "Session has insufficient capabilities to support application fault tolerance (missing: {missing:?})"
    )]
    InsufficientCapabilities { missing: Capabilities },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid cluster name '{name}': {reason}")]
    InvalidClusterName { name: String, reason: &'static str },

    #[error("Already bound to cluster '{0}'")]
    AlreadyStarted(String),

    /// Provisioning the cluster queue or opening the flow on it failed.
    #[error("Failed to bind to cluster '{cluster}': {source}")]
    Bind {
        cluster: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
