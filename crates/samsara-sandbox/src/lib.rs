//! samsara-sandbox: sandboxed code execution for the RLM runtime.
//!
//! This crate provides both sides of the sandbox protocol:
//! - Host side: [`SandboxExecutor`] drives a guest process over a framed,
//!   length-prefixed JSON protocol, brokers sub-LLM callbacks, and enforces
//!   buffer limits and read/send deadlines.
//! - Guest side: [`runner`] holds a persistent namespace for a small
//!   expression language and answers setup/execute/reset/ping commands. The
//!   `samsara-runner` binary wraps it around stdio.
//! - [`ExecutorPool`] leases prewarmed executors with namespace reset between
//!   leases.

pub mod error;
pub mod executor;
pub mod in_process;
pub mod pool;
pub mod protocol;
pub mod runner;
pub mod security;
pub mod transport;

pub use error::{SandboxError, SubcallError};
pub use in_process::{InProcessFactory, InProcessTransport};
pub use executor::{
    ExecStatus, ExecuteOutcome, ExecutionMode, ExecutorFactory, LlmQueryHandler,
    ProcessExecutorFactory, SandboxExecutor, SharedHandler,
};
pub use pool::ExecutorPool;
pub use protocol::{
    DEFAULT_SEND_TIMEOUT, MAX_BATCH_WORKERS, MAX_BUFFER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE,
    MAX_READ_DURATION, encode_message, parse_mux_header,
};
pub use security::SecurityPolicy;
pub use transport::{DuplexTransport, ProcessTransport, Transport};
