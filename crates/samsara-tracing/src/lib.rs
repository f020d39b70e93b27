//! samsara-tracing: query trace data model and JSONL persistence.
//!
//! A query produces one append-only trace: a header record, one record per
//! observable step, and a terminal summary. Traces are written incrementally
//! so a crash mid-query still leaves a readable prefix on disk.

pub mod storage;
pub mod types;
pub mod writer;

pub use storage::{FilesystemTraceStore, SharedTraceStorage, TraceStorage, prune_traces};
pub use types::{
    QueryStatus, StepKind, TokenUsage, Trace, TraceHeader, TraceRecord, TraceStep, TraceSummary,
};
pub use writer::{IncrementalTraceWriter, WriteError};
