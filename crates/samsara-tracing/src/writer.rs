//! Incremental trace writer.
//!
//! Writes one JSONL file per query: a header line, one line per step as it
//! happens, and a summary line on termination. Finalization is idempotent so
//! every exit path can call it without double-writing the summary.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

use crate::storage::{SharedTraceStorage, trace_file_name};
use crate::types::{
    QueryStatus, TokenUsage, TraceHeader, TraceRecord, TraceStep, TraceSummary,
};

/// Error type for trace persistence.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("Writer not started")]
    NotStarted,
}

struct WriterState {
    writer: Option<BufWriter<File>>,
    finalized: bool,
}

/// Appends structured records to a per-query trace file.
///
/// With `suppress_errors` set (the engine default), persistence failures are
/// logged and swallowed: trace I/O must never stall a query.
pub struct IncrementalTraceWriter {
    storage: SharedTraceStorage,
    suppress_errors: bool,
    state: Mutex<WriterState>,
}

impl IncrementalTraceWriter {
    pub fn new(storage: SharedTraceStorage, suppress_errors: bool) -> Self {
        Self {
            storage,
            suppress_errors,
            state: Mutex::new(WriterState {
                writer: None,
                finalized: false,
            }),
        }
    }

    /// Open the trace file and write the header record.
    pub fn start(&self, project_id: &str, header: TraceHeader) -> Result<(), WriteError> {
        let result = self.start_inner(project_id, header);
        self.absorb(result, "start")
    }

    fn start_inner(&self, project_id: &str, header: TraceHeader) -> Result<(), WriteError> {
        let file_name = trace_file_name(&header.trace_id);
        let file = self.storage.create_trace(project_id, &file_name)?;
        let mut state = self.state.lock().unwrap();
        state.writer = Some(BufWriter::new(file));
        Self::write_record(&mut state, &TraceRecord::Header(header))
    }

    /// Append one step record and flush.
    pub fn write_step(&self, step: &TraceStep) -> Result<(), WriteError> {
        let result = {
            let mut state = self.state.lock().unwrap();
            if state.finalized {
                Ok(())
            } else {
                Self::write_record(&mut state, &TraceRecord::Step(step.clone()))
            }
        };
        self.absorb(result, "write_step")
    }

    /// Write the summary record. Idempotent: only the first call writes.
    pub fn finalize(
        &self,
        answer: &str,
        usage: TokenUsage,
        elapsed_s: f64,
        status: QueryStatus,
    ) -> Result<(), WriteError> {
        let result = {
            let mut state = self.state.lock().unwrap();
            if state.finalized {
                Ok(())
            } else {
                state.finalized = true;
                Self::write_record(
                    &mut state,
                    &TraceRecord::Summary(TraceSummary {
                        status,
                        answer: answer.to_string(),
                        tokens: usage.into(),
                        elapsed_s,
                    }),
                )
            }
        };
        self.absorb(result, "finalize")
    }

    /// Whether the summary record has been written.
    pub fn is_finalized(&self) -> bool {
        self.state.lock().unwrap().finalized
    }

    fn write_record(state: &mut WriterState, record: &TraceRecord) -> Result<(), WriteError> {
        let writer = state.writer.as_mut().ok_or(WriteError::NotStarted)?;
        let line = serde_json::to_string(record)?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    fn absorb(&self, result: Result<(), WriteError>, op: &str) -> Result<(), WriteError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if self.suppress_errors => {
                tracing::warn!(operation = op, error = %e, "Trace write failed, continuing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Parse a trace file back into records. Blank lines are skipped.
pub fn read_records(path: &std::path::Path) -> Result<Vec<TraceRecord>, WriteError> {
    let content = std::fs::read_to_string(path)?;
    let records: Result<Vec<TraceRecord>, _> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect();
    Ok(records?)
}
