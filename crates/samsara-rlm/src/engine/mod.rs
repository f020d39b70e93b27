//! The RLM engine: the outer REPL+LLM loop.
//!
//! One query is a single, self-contained drive of one sandbox: the planner
//! produces ```repl blocks, the sandbox executes them (calling back into
//! sub-LLMs), and the loop ends on a final marker, a bare final in planner
//! text, the iteration cap, a dead executor, or cancellation. Every
//! transition emits a trace step.

mod parsing;
mod shared;


pub use parsing::{BareFinal, extract_code_blocks, find_final_answer};
pub use shared::ProgressCallback;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use samsara_sandbox::{
    ExecuteOutcome, ExecutionMode, ExecutorFactory, ExecutorPool, SandboxExecutor, SharedHandler,
};
use samsara_tracing::{
    IncrementalTraceWriter, QueryStatus, SharedTraceStorage, StepKind, TokenUsage, Trace,
    TraceHeader, TraceStep, prune_traces,
};

use crate::client::{ChatMessage, ChatResponse, SharedLlmClient};
use crate::error::Result;
use crate::prompts::{PromptLoader, format_code_echo, truncate_code_output, wrap_subcall_content};
use crate::semantic::{
    ContentKind, SemanticVerificationReport, detect_content_kind, gather_cited_documents,
    parse_verification_response,
};
use crate::verification::{CitationVerifier, QuoteCitationVerifier, VerificationResult};

use shared::{QueryShared, SubcallHandler};

/// Reserved answer when the caller's cancellation signal fired.
pub const INTERRUPTED_ANSWER: &str = "[interrupted]";
/// Reserved answer when the executor died with no pool to recover from.
pub const EXECUTOR_DIED_ANSWER: &str = "[Executor died - cannot continue]";

/// Configuration for the RLM engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Planner model identifier (recorded in trace headers).
    pub model: String,
    /// Iteration budget for the outer loop.
    pub max_iterations: usize,
    /// Per-code-block output cap in characters. The truncation marker is a
    /// forcing function pushing the planner toward sub-LLM calls.
    pub max_output_chars: usize,
    /// Timeout for one sandbox execute round-trip.
    pub execute_timeout: Duration,
    /// Cap on one sub-LLM payload (instruction + content), in characters.
    pub max_subcall_payload_chars: usize,
    /// Concurrent (fast) or sequential (deep) batched sub-LLM dispatch.
    pub execution_mode: ExecutionMode,
    /// Run mechanical citation verification after a final answer.
    pub verify_citations: bool,
    /// Run semantic verification after a final answer.
    pub verify: bool,
    /// Trace files retained per project.
    pub max_traces_per_project: usize,
}

impl EngineConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_iterations: 20,
            max_output_chars: 20_000,
            execute_timeout: Duration::from_secs(30),
            max_subcall_payload_chars: 500_000,
            execution_mode: ExecutionMode::Fast,
            verify_citations: true,
            verify: false,
            max_traces_per_project: 50,
        }
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_output_chars(mut self, n: usize) -> Self {
        self.max_output_chars = n;
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn with_max_subcall_payload_chars(mut self, n: usize) -> Self {
        self.max_subcall_payload_chars = n;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_verify_citations(mut self, enabled: bool) -> Self {
        self.verify_citations = enabled;
        self
    }

    pub fn with_verify(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }

    pub fn with_max_traces_per_project(mut self, n: usize) -> Self {
        self.max_traces_per_project = n;
        self
    }
}

/// Dependencies for the RLM engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub planner: SharedLlmClient,
    pub factory: Arc<dyn ExecutorFactory>,
    pub prompts: Arc<PromptLoader>,
    pub pool: Option<Arc<ExecutorPool>>,
    pub storage: Option<SharedTraceStorage>,
    pub citation_verifier: Arc<dyn CitationVerifier>,
}

impl EngineDeps {
    pub fn new(planner: SharedLlmClient, factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            planner,
            factory,
            prompts: Arc::new(PromptLoader::embedded()),
            pool: None,
            storage: None,
            citation_verifier: Arc::new(QuoteCitationVerifier::new()),
        }
    }

    pub fn with_prompts(mut self, prompts: Arc<PromptLoader>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_pool(mut self, pool: Arc<ExecutorPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_storage(mut self, storage: SharedTraceStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_citation_verifier(mut self, verifier: Arc<dyn CitationVerifier>) -> Self {
        self.citation_verifier = verifier;
        self
    }
}

impl std::fmt::Debug for EngineDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineDeps")
            .field("planner", &self.planner.name())
            .field("pool", &self.pool.is_some())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

/// Cooperative cancellation handle, checked between iterations and before
/// planner calls.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One query's inputs.
#[derive(Clone)]
pub struct QueryRequest {
    pub documents: Vec<String>,
    pub question: String,
    pub doc_names: Option<Vec<String>>,
    pub on_progress: Option<ProgressCallback>,
    pub project_id: Option<String>,
    pub cancel: Option<CancelSignal>,
}

impl QueryRequest {
    pub fn new(documents: Vec<String>, question: impl Into<String>) -> Self {
        Self {
            documents,
            question: question.into(),
            doc_names: None,
            on_progress: None,
            project_id: None,
            cancel: None,
        }
    }

    pub fn with_doc_names(mut self, names: Vec<String>) -> Self {
        self.doc_names = Some(names);
        self
    }

    pub fn with_progress(mut self, on_progress: ProgressCallback) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Terminal result of one query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub answer: String,
    pub status: QueryStatus,
    pub trace: Trace,
    pub token_usage: TokenUsage,
    pub execution_time: f64,
    pub verification: Option<VerificationResult>,
    pub semantic_verification: Option<SemanticVerificationReport>,
}

fn render_output(outcome: &ExecuteOutcome) -> String {
    let mut parts = Vec::new();
    if !outcome.stdout.is_empty() {
        parts.push(outcome.stdout.clone());
    }
    if !outcome.stderr.is_empty() {
        parts.push(format!("STDERR: {}", outcome.stderr));
    }
    if let Some(ref error) = outcome.error {
        parts.push(format!("ERROR: {error}"));
    }
    if parts.is_empty() {
        "(no output)".to_string()
    } else {
        parts.join("\n")
    }
}

/// The RLM engine.
pub struct RlmEngine {
    config: EngineConfig,
    deps: EngineDeps,
}

impl RlmEngine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        Self { config, deps }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one query to completion.
    ///
    /// Always produces a [`QueryResult`] for sandbox-side failures (the
    /// answer is a reserved sentinel); `Err` is reserved for invalid
    /// configuration and fatal planner failures.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResult> {
        let start = Instant::now();
        let documents = request.documents;
        let question = request.question;
        let doc_names = request
            .doc_names
            .unwrap_or_else(|| (0..documents.len()).map(|i| format!("doc_{i}")).collect());

        // Template failures are configuration errors: surface them before
        // anything is spent.
        let system_prompt = self.deps.prompts.render_system_prompt()?;
        let doc_sizes: Vec<usize> = documents.iter().map(|d| d.chars().count()).collect();
        let total_chars: usize = doc_sizes.iter().sum();
        // Always "list": the sandbox binds context as a list regardless of
        // document count.
        let context_metadata = self.deps.prompts.render_context_metadata(
            "list",
            total_chars,
            &format!("{doc_sizes:?}"),
        )?;
        let iteration_zero = self.deps.prompts.render_iteration_zero(&question)?;

        let writer = match (&self.deps.storage, &request.project_id) {
            (Some(storage), Some(project_id)) => {
                let writer = Arc::new(IncrementalTraceWriter::new(storage.clone(), true));
                let header = TraceHeader {
                    trace_id: uuid::Uuid::new_v4().to_string(),
                    question: question.clone(),
                    document_ids: doc_names.clone(),
                    model: self.config.model.clone(),
                    system_prompt: system_prompt.clone(),
                    subcall_prompt: self
                        .deps
                        .prompts
                        .raw_template("subcall.md")
                        .unwrap_or_default()
                        .to_string(),
                };
                let _ = writer.start(project_id, header);
                Some(writer)
            }
            _ => None,
        };

        let shared = Arc::new(QueryShared::new(writer, request.on_progress));

        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::assistant(context_metadata),
            ChatMessage::user(iteration_zero),
        ];

        // Acquire an executor: leased from the pool or created standalone.
        let acquired = match &self.deps.pool {
            Some(pool) => pool.acquire().await.map(|e| (e, false)),
            None => self.deps.factory.create().await.map(|e| (e, true)),
        };
        let (mut executor, owns_executor) = match acquired {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to acquire sandbox executor");
                return Ok(Self::dead_result(&shared, start));
            }
        };
        executor.set_mode(self.config.execution_mode);
        executor.set_handler(self.make_handler(&shared, 0));
        if let Err(e) = executor.setup_context(&documents).await {
            tracing::warn!(error = %e, "Sandbox setup failed");
            executor.stop().await;
            if let Some(pool) = &self.deps.pool {
                pool.discard(executor);
            }
            return Ok(Self::dead_result(&shared, start));
        }

        let mut run = QueryRun {
            engine: self,
            shared: shared.clone(),
            question,
            documents,
            doc_names,
            cancel: request.cancel,
            project_id: request.project_id,
            messages,
            executor,
            owns_executor,
            start,
        };

        let outcome = run.drive().await;
        // Finalization is idempotent: completed paths already wrote their
        // summary, error paths get an interrupted one here.
        if outcome.is_err() {
            run.finalize_trace(INTERRUPTED_ANSWER, QueryStatus::Interrupted);
        }
        run.cleanup().await;
        outcome
    }

    fn make_handler(&self, shared: &Arc<QueryShared>, iteration: usize) -> SharedHandler {
        Arc::new(SubcallHandler {
            shared: shared.clone(),
            planner: self.deps.planner.clone(),
            prompts: self.deps.prompts.clone(),
            payload_cap: self.config.max_subcall_payload_chars,
            iteration,
        })
    }

    fn dead_result(shared: &Arc<QueryShared>, start: Instant) -> QueryResult {
        if let Some(writer) = shared.writer() {
            let _ = writer.finalize(
                EXECUTOR_DIED_ANSWER,
                shared.usage(),
                start.elapsed().as_secs_f64(),
                QueryStatus::ExecutorDied,
            );
        }
        QueryResult {
            answer: EXECUTOR_DIED_ANSWER.to_string(),
            status: QueryStatus::ExecutorDied,
            trace: shared.trace(),
            token_usage: shared.usage(),
            execution_time: start.elapsed().as_secs_f64(),
            verification: None,
            semantic_verification: None,
        }
    }
}

/// Mutable state for one query drive.
struct QueryRun<'a> {
    engine: &'a RlmEngine,
    shared: Arc<QueryShared>,
    question: String,
    documents: Vec<String>,
    doc_names: Vec<String>,
    cancel: Option<CancelSignal>,
    project_id: Option<String>,
    messages: Vec<ChatMessage>,
    executor: SandboxExecutor,
    owns_executor: bool,
    start: Instant,
}

impl QueryRun<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    async fn planner_call(&self) -> Result<ChatResponse> {
        self.engine.deps.planner.complete(&self.messages).await
    }

    async fn drive(&mut self) -> Result<QueryResult> {
        let config = &self.engine.config;

        for iteration in 0..config.max_iterations {
            if self.cancelled() {
                return Ok(self.finish(
                    INTERRUPTED_ANSWER.to_string(),
                    QueryStatus::Interrupted,
                    None,
                    None,
                ));
            }

            // Fresh handler per iteration: the index is frozen by value at
            // construction, never shared through a mutable cell.
            self.executor
                .set_handler(self.engine.make_handler(&self.shared, iteration));

            let response = self.planner_call().await?;
            self.shared.record(
                TraceStep::new(StepKind::CodeGenerated, iteration, response.content.clone())
                    .with_tokens_used(response.total_tokens()),
                Some((response.prompt_tokens, response.completion_tokens)),
            );

            let code_blocks = extract_code_blocks(&response.content);
            let bare_final = find_final_answer(&response.content);

            if code_blocks.is_empty() && bare_final.is_none() {
                self.messages.push(ChatMessage::assistant(response.content.clone()));
                self.messages
                    .push(ChatMessage::user(self.engine.deps.prompts.render_code_required()?));
                continue;
            }

            let mut echoes: Vec<(String, String, Option<BTreeMap<String, String>>)> = Vec::new();
            let mut final_answer: Option<String> = None;
            let mut from_code_block = false;

            for code in &code_blocks {
                let exec_start = Instant::now();
                let outcome = self.executor.execute(code, config.execute_timeout).await;
                let duration_ms = exec_start.elapsed().as_millis() as u64;

                let output =
                    truncate_code_output(&render_output(&outcome), config.max_output_chars);
                self.shared.record(
                    TraceStep::new(StepKind::CodeOutput, iteration, output.clone())
                        .with_duration_ms(duration_ms),
                    None,
                );
                echoes.push((code.clone(), output, outcome.vars.clone()));

                // `Some` catches falsy finals like FINAL(0) and FINAL("").
                if let Some(answer) = outcome.final_answer {
                    self.shared.record(
                        TraceStep::new(StepKind::FinalAnswer, iteration, answer.clone()),
                        None,
                    );
                    final_answer = Some(answer);
                    from_code_block = true;
                    break;
                } else if outcome.final_var.is_some() {
                    let answer = outcome.final_value.unwrap_or_default();
                    self.shared.record(
                        TraceStep::new(StepKind::FinalAnswer, iteration, answer.clone()),
                        None,
                    );
                    final_answer = Some(answer);
                    from_code_block = true;
                    break;
                }
            }

            // Bare finals resolve after the reply's code blocks ran, so a
            // variable defined in the same reply is already bound.
            if final_answer.is_none() {
                match bare_final {
                    Some(BareFinal::Literal(text)) => {
                        self.shared.record(
                            TraceStep::new(StepKind::FinalAnswer, iteration, text.clone()),
                            None,
                        );
                        final_answer = Some(text);
                    }
                    Some(BareFinal::Var(name)) if self.executor.is_alive() => {
                        let outcome = self
                            .executor
                            .execute(&format!("print({name})"), config.execute_timeout)
                            .await;
                        if outcome.is_ok() {
                            let answer = outcome.stdout.trim().to_string();
                            self.shared.record(
                                TraceStep::new(StepKind::FinalAnswer, iteration, answer.clone()),
                                None,
                            );
                            final_answer = Some(answer);
                        }
                        // Lookup failed: never answer with the identifier
                        // text; let the planner recover next iteration.
                    }
                    _ => {}
                }
            }

            if let Some(answer) = final_answer {
                let verification = if from_code_block {
                    self.run_citation_verification(&answer, iteration).await
                } else {
                    None
                };
                let semantic = if from_code_block {
                    self.run_semantic_verification(&answer, iteration).await
                } else {
                    None
                };
                return Ok(self.finish(answer, QueryStatus::Success, verification, semantic));
            }

            // Recover from a dead executor mid-loop.
            if !self.executor.is_alive() {
                if !self.recover_executor(iteration).await {
                    return Ok(self.finish(
                        EXECUTOR_DIED_ANSWER.to_string(),
                        QueryStatus::ExecutorDied,
                        None,
                        None,
                    ));
                }
            }

            self.messages.push(ChatMessage::assistant(response.content.clone()));
            for (code, output, vars) in echoes {
                self.messages.push(ChatMessage::user(format_code_echo(
                    &code,
                    &output,
                    vars.as_ref(),
                    None,
                )));
            }
            self.messages.push(ChatMessage::user(
                self.engine
                    .deps
                    .prompts
                    .render_iteration_continue(&self.question)?,
            ));
        }

        // Iteration cap reached: one last synthetic user message asks for a
        // best-effort answer.
        if self.cancelled() {
            return Ok(self.finish(
                INTERRUPTED_ANSWER.to_string(),
                QueryStatus::Interrupted,
                None,
                None,
            ));
        }
        self.messages.push(ChatMessage::user(
            "Please provide a final answer to the user's question based on the information provided.",
        ));
        let response = self.planner_call().await?;
        self.shared
            .add_usage(response.prompt_tokens, response.completion_tokens);
        self.shared.record(
            TraceStep::new(
                StepKind::FinalAnswer,
                config.max_iterations.saturating_sub(1),
                format!("[max-iter fallback] {}", response.content),
            ),
            None,
        );
        Ok(self.finish(response.content, QueryStatus::MaxIterations, None, None))
    }

    /// Swap in a fresh pooled executor after a death. Returns false when
    /// recovery is impossible (no pool, or the replacement also failed).
    async fn recover_executor(&mut self, iteration: usize) -> bool {
        let Some(pool) = self.engine.deps.pool.clone() else {
            return false;
        };
        tracing::warn!(iteration, "Executor died; recovering from pool");

        let mut fresh = match pool.acquire().await {
            Ok(executor) => executor,
            Err(e) => {
                tracing::warn!(error = %e, "Pool acquire failed during recovery");
                return false;
            }
        };
        fresh.set_mode(self.engine.config.execution_mode);
        fresh.set_handler(self.engine.make_handler(&self.shared, iteration));
        if let Err(e) = fresh.setup_context(&self.documents).await {
            tracing::warn!(error = %e, "Setup failed on replacement executor");
            fresh.stop().await;
            pool.discard(fresh);
            return false;
        }

        let mut dead = std::mem::replace(&mut self.executor, fresh);
        dead.stop().await;
        pool.discard(dead);
        true
    }

    async fn run_citation_verification(
        &mut self,
        answer: &str,
        iteration: usize,
    ) -> Option<VerificationResult> {
        let config = &self.engine.config;
        if !config.verify_citations || !self.executor.is_alive() {
            return None;
        }
        let verifier = self.engine.deps.citation_verifier.clone();
        let plan = verifier.plan(answer)?;

        let outcome = self
            .executor
            .execute(&plan.code, config.execute_timeout)
            .await;
        if outcome.is_ok() && !outcome.stdout.is_empty() {
            match verifier.parse_output(&plan, &outcome.stdout) {
                Ok(result) => {
                    self.shared.record(
                        TraceStep::new(StepKind::Verification, iteration, outcome.stdout.clone()),
                        None,
                    );
                    Some(result)
                }
                Err(e) => {
                    self.shared.record(
                        TraceStep::new(
                            StepKind::Verification,
                            iteration,
                            format!("Verification error: {e}"),
                        ),
                        None,
                    );
                    None
                }
            }
        } else {
            let detail = outcome.error.unwrap_or_else(|| "no output".to_string());
            self.shared.record(
                TraceStep::new(
                    StepKind::Verification,
                    iteration,
                    format!("Verification error: {detail}"),
                ),
                None,
            );
            None
        }
    }

    async fn run_semantic_verification(
        &mut self,
        answer: &str,
        iteration: usize,
    ) -> Option<SemanticVerificationReport> {
        if !self.engine.config.verify {
            return None;
        }
        match self.semantic_verification_inner(answer, iteration).await {
            Ok(report) => report,
            Err(e) => {
                self.shared.record(
                    TraceStep::new(
                        StepKind::SemanticVerification,
                        iteration,
                        format!("Semantic verification error: {e}"),
                    ),
                    None,
                );
                None
            }
        }
    }

    async fn semantic_verification_inner(
        &mut self,
        answer: &str,
        iteration: usize,
    ) -> Result<Option<SemanticVerificationReport>> {
        let config = &self.engine.config;
        let prompts = &self.engine.deps.prompts;

        let Some(cited) = gather_cited_documents(answer, &self.documents, &self.doc_names) else {
            return Ok(None);
        };
        let cited_chars = cited.chars().count();
        if cited_chars > config.max_subcall_payload_chars {
            // Oversized citations skip verification rather than erroring.
            self.shared.record(
                TraceStep::new(
                    StepKind::SemanticVerification,
                    iteration,
                    format!(
                        "Skipping verification: cited documents ({} chars) exceed limit of {} chars",
                        crate::prompts::format_thousands(cited_chars),
                        crate::prompts::format_thousands(config.max_subcall_payload_chars),
                    ),
                ),
                None,
            );
            return Ok(None);
        }
        let wrapped = wrap_subcall_content(&cited);

        // Layer 1: adversarial review, always.
        let prompt = prompts.render_verify_adversarial(answer, &wrapped)?;
        self.shared.record(
            TraceStep::new(
                StepKind::SemanticVerification,
                iteration,
                "Starting adversarial verification (Layer 1)",
            ),
            None,
        );
        let response = self
            .engine
            .deps
            .planner
            .complete(&[ChatMessage::user(prompt)])
            .await?;
        let mut findings = parse_verification_response(&response.content)?;
        self.shared.record(
            TraceStep::new(
                StepKind::SemanticVerification,
                iteration,
                format!("Layer 1 complete: {} findings reviewed", findings.len()),
            )
            .with_tokens_used(response.total_tokens()),
            Some((response.prompt_tokens, response.completion_tokens)),
        );

        // Layer 2: code-specific checks, only for code corpora.
        let content_kind = detect_content_kind(&self.doc_names);
        if content_kind == ContentKind::Code {
            let layer1_json =
                serde_json::to_string_pretty(&serde_json::json!({ "findings": findings }))?;
            let prompt = prompts.render_verify_code(&layer1_json, answer, &wrapped)?;
            self.shared.record(
                TraceStep::new(
                    StepKind::SemanticVerification,
                    iteration,
                    "Starting code-specific verification (Layer 2)",
                ),
                None,
            );
            let response = self
                .engine
                .deps
                .planner
                .complete(&[ChatMessage::user(prompt)])
                .await?;
            findings = parse_verification_response(&response.content)?;
            self.shared.record(
                TraceStep::new(
                    StepKind::SemanticVerification,
                    iteration,
                    format!("Layer 2 complete: {} findings reviewed", findings.len()),
                )
                .with_tokens_used(response.total_tokens()),
                Some((response.prompt_tokens, response.completion_tokens)),
            );
        }

        Ok(Some(SemanticVerificationReport {
            findings,
            content_kind,
        }))
    }

    fn finish(
        &self,
        answer: String,
        status: QueryStatus,
        verification: Option<VerificationResult>,
        semantic_verification: Option<SemanticVerificationReport>,
    ) -> QueryResult {
        self.finalize_trace(&answer, status);
        QueryResult {
            answer,
            status,
            trace: self.shared.trace(),
            token_usage: self.shared.usage(),
            execution_time: self.start.elapsed().as_secs_f64(),
            verification,
            semantic_verification,
        }
    }

    fn finalize_trace(&self, answer: &str, status: QueryStatus) {
        if let Some(writer) = self.shared.writer() {
            let _ = writer.finalize(
                answer,
                self.shared.usage(),
                self.start.elapsed().as_secs_f64(),
                status,
            );
            if status == QueryStatus::Success {
                if let (Some(storage), Some(project_id)) =
                    (&self.engine.deps.storage, &self.project_id)
                {
                    if let Err(e) = prune_traces(
                        storage.as_ref(),
                        project_id,
                        self.engine.config.max_traces_per_project,
                    ) {
                        tracing::warn!(error = %e, "Trace retention pruning failed");
                    }
                }
            }
        }
    }

    /// Release or stop the executor; runs on every exit path.
    async fn cleanup(self) {
        let mut executor = self.executor;
        if self.owns_executor {
            executor.stop().await;
            return;
        }
        let Some(pool) = self.engine.deps.pool.clone() else {
            executor.stop().await;
            return;
        };
        executor.clear_handler();
        match executor.reset_namespace().await {
            Ok(()) => pool.release(executor),
            Err(e) => {
                // A pooled executor that fails reset is broken; never hand
                // it back to the pool.
                tracing::warn!(error = %e, "Namespace reset failed; discarding executor");
                executor.stop().await;
                pool.discard(executor);
            }
        }
    }
}
