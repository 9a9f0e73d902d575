//! Error types for the wire protocol client.

use std::io;

use serde_json::Value;
use thiserror::Error;

use super::document::Document;

/// Result type for wire protocol operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while talking to the server.
#[derive(Error, Debug)]
pub enum WireError {
    /// The transport closed or reset while the operation was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    /// Malformed frame or a reply that violates the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server set the query failure flag on its reply.
    #[error("Query failed: {}", render_document(.0))]
    RemoteQuery(Document),

    /// Every pooled connection is disconnected or busy.
    #[error(
        "No available connection (pool size {pool_size}, in use {in_use}, connected {connected})"
    )]
    NoAvailableConnection {
        pool_size: usize,
        in_use: usize,
        connected: usize,
    },

    /// The managed connection has no live transport.
    #[error("Not connected")]
    NotConnected,

    /// Document encoding or decoding failed.
    #[error("Document error: {0}")]
    Document(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Non-transient I/O error while opening the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WireError::ConnectionLost
                | WireError::NotConnected
                | WireError::NoAvailableConnection { .. }
        )
    }

    /// The server-side error message, if this is a remote query failure.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            WireError::RemoteQuery(doc) => doc.get("$err").and_then(Value::as_str),
            _ => None,
        }
    }
}

fn render_document(doc: &Document) -> String {
    Value::Object(doc.clone()).to_string()
}
