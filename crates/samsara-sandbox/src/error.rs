//! Error types for the sandbox host side.

use thiserror::Error;

/// Errors raised by the executor and pool.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Wire protocol violation: oversized data, deadline exceeded, invalid
    /// JSON, missing field, non-UTF-8 bytes, closed connection. Fatal for
    /// the executor that observed it.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failed to launch the guest process.
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// The guest rejected a command (non-ok status on setup/reset/ping).
    #[error("Command failed: {0}")]
    Command(String),
}

/// Errors returned by a sub-LLM handler.
///
/// Neither variant is fatal to the executor: both are relayed to the guest
/// as an `error`-field reply so user code sees a recoverable error.
#[derive(Debug, Error)]
pub enum SubcallError {
    /// User-content error: payload over the configured cap, or no handler.
    #[error("{0}")]
    ContentRejected(String),

    /// The sub-LLM call itself failed (network, backend).
    #[error("LLM query failed: {0}")]
    Failed(String),
}
