//! Per-query shared state and the sub-LLM handler.
//!
//! One mutex covers the trace step list and the cumulative token counters.
//! The handler acquires it around the pre-call request step and around the
//! post-call response step + counter update; the LLM call itself runs
//! outside the lock. Usage snapshots handed to progress callbacks are
//! copies taken while the lock is held, so a reader never observes a torn
//! update.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use samsara_sandbox::{LlmQueryHandler, SubcallError};
use samsara_tracing::{IncrementalTraceWriter, StepKind, TokenUsage, Trace, TraceStep};

use crate::client::{ChatMessage, SharedLlmClient};
use crate::prompts::{PromptLoader, wrap_subcall_content};

/// Progress callback: step kind, iteration, step content, usage snapshot.
pub type ProgressCallback = Arc<dyn Fn(StepKind, usize, &str, TokenUsage) + Send + Sync>;

struct QueryState {
    trace: Trace,
    usage: TokenUsage,
}

/// Trace + token state shared between the engine loop and concurrent
/// sub-LLM handler invocations.
pub(crate) struct QueryShared {
    state: Mutex<QueryState>,
    writer: Option<Arc<IncrementalTraceWriter>>,
    on_progress: Option<ProgressCallback>,
}

impl QueryShared {
    pub(crate) fn new(
        writer: Option<Arc<IncrementalTraceWriter>>,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            state: Mutex::new(QueryState {
                trace: Trace::new(),
                usage: TokenUsage::default(),
            }),
            writer,
            on_progress,
        }
    }

    /// Append a step (and optionally charge tokens) under the lock, then
    /// notify the progress callback outside it with the snapshot taken
    /// inside.
    pub(crate) fn record(&self, step: TraceStep, charge: Option<(u64, u64)>) {
        let (step, snapshot) = {
            let mut state = self.state.lock().unwrap();
            if let Some((prompt, completion)) = charge {
                state.usage.add(prompt, completion);
            }
            let step = state.trace.add_step(step);
            if let Some(ref writer) = self.writer {
                let _ = writer.write_step(&step);
            }
            (step, state.usage)
        };
        if let Some(ref on_progress) = self.on_progress {
            on_progress(step.kind, step.iteration, &step.content, snapshot);
        }
    }

    /// Charge tokens without a step (planner failures record no step).
    pub(crate) fn add_usage(&self, prompt: u64, completion: u64) {
        self.state.lock().unwrap().usage.add(prompt, completion);
    }

    pub(crate) fn usage(&self) -> TokenUsage {
        self.state.lock().unwrap().usage
    }

    pub(crate) fn trace(&self) -> Trace {
        self.state.lock().unwrap().trace.clone()
    }

    pub(crate) fn writer(&self) -> Option<&Arc<IncrementalTraceWriter>> {
        self.writer.as_ref()
    }
}

/// The engine's sub-LLM handler, constructed fresh each iteration with the
/// iteration index frozen by value.
pub(crate) struct SubcallHandler {
    pub(crate) shared: Arc<QueryShared>,
    pub(crate) planner: SharedLlmClient,
    pub(crate) prompts: Arc<PromptLoader>,
    pub(crate) payload_cap: usize,
    pub(crate) iteration: usize,
}

#[async_trait]
impl LlmQueryHandler for SubcallHandler {
    async fn handle(&self, instruction: &str, content: &str) -> Result<String, SubcallError> {
        let summary = format!(
            "instruction: {instruction}\ncontent: [{} chars]",
            content.chars().count()
        );
        self.shared.record(
            TraceStep::new(StepKind::SubcallRequest, self.iteration, summary),
            None,
        );

        // The cap covers the whole payload: single-arg calls carry
        // everything in the instruction with empty content.
        let payload_chars = instruction.chars().count() + content.chars().count();
        if payload_chars > self.payload_cap {
            let message = format!(
                "Payload size ({} chars) exceeds the sub-LLM limit of {} chars. \
                 Please chunk the content into smaller pieces and make multiple llm_query calls.",
                crate::prompts::format_thousands(payload_chars),
                crate::prompts::format_thousands(self.payload_cap),
            );
            self.shared.record(
                TraceStep::new(StepKind::SubcallResponse, self.iteration, message.clone()),
                None,
            );
            return Err(SubcallError::ContentRejected(message));
        }

        // Empty content means the instruction is the whole prompt; wrapped
        // content goes through the subcall template.
        let prompt = if content.is_empty() {
            instruction.to_string()
        } else {
            self.prompts
                .render_subcall_prompt(instruction, &wrap_subcall_content(content))
                .map_err(|e| SubcallError::Failed(e.to_string()))?
        };

        let response = self
            .planner
            .complete(&[ChatMessage::user(prompt)])
            .await
            .map_err(|e| SubcallError::Failed(e.to_string()))?;

        self.shared.record(
            TraceStep::new(
                StepKind::SubcallResponse,
                self.iteration,
                response.content.clone(),
            )
            .with_tokens_used(response.total_tokens()),
            Some((response.prompt_tokens, response.completion_tokens)),
        );
        Ok(response.content)
    }
}
