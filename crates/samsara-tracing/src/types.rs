//! Trace data types.
//!
//! These are the shared shapes for everything a query emits: step records,
//! cumulative token usage, and the terminal summary.

use serde::{Deserialize, Serialize};

/// The kind of event a trace step records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A planner reply (code-bearing or not).
    CodeGenerated,
    /// Captured output of one executed code block.
    CodeOutput,
    /// A sub-LLM call was requested from inside the sandbox.
    SubcallRequest,
    /// A sub-LLM call completed (or was rejected).
    SubcallResponse,
    /// The final answer was produced.
    FinalAnswer,
    /// Mechanical citation verification ran.
    Verification,
    /// Semantic verification ran.
    SemanticVerification,
}

/// One structured record describing a single observable event within a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub kind: StepKind,
    /// 0-based iteration index the step belongs to.
    pub iteration: usize,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

impl TraceStep {
    pub fn new(kind: StepKind, iteration: usize, content: impl Into<String>) -> Self {
        Self {
            kind,
            iteration,
            content: content.into(),
            duration_ms: None,
            tokens_used: None,
        }
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_tokens_used(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// An append-only, ordered sequence of trace steps for one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    pub steps: Vec<TraceStep>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step and return a clone of it for incremental write-through.
    pub fn add_step(&mut self, step: TraceStep) -> TraceStep {
        self.steps.push(step.clone());
        step
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps of a given kind, in trace order.
    pub fn steps_of_kind(&self, kind: StepKind) -> Vec<&TraceStep> {
        self.steps.iter().filter(|s| s.kind == kind).collect()
    }
}

/// Cumulative prompt and completion token counts for one query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, prompt: u64, completion: u64) {
        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
    }
}

/// Terminal status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// A final marker produced the answer.
    Success,
    /// The iteration cap was reached; the answer is a best-effort reply.
    MaxIterations,
    /// The executor died and no pool was available to recover.
    ExecutorDied,
    /// The caller's cancellation signal was asserted.
    Interrupted,
}

/// Header record written as the first line of a trace file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceHeader {
    pub trace_id: String,
    pub question: String,
    pub document_ids: Vec<String>,
    pub model: String,
    pub system_prompt: String,
    pub subcall_prompt: String,
}

/// Summary record written as the last line of a trace file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub status: QueryStatus,
    pub answer: String,
    pub tokens: TokenTotals,
    pub elapsed_s: f64,
}

/// Token totals as persisted in the summary record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenTotals {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl From<TokenUsage> for TokenTotals {
    fn from(usage: TokenUsage) -> Self {
        Self {
            prompt: usage.prompt_tokens,
            completion: usage.completion_tokens,
            total: usage.total(),
        }
    }
}

/// One line of a trace file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceRecord {
    Header(TraceHeader),
    Step(TraceStep),
    Summary(TraceSummary),
}
