//! samsara-rlm: the Recursive Language Model engine.
//!
//! This crate drives the outer REPL+LLM loop: a planner LLM writes code,
//! the sandbox executes it, and the sandbox re-enters the system through
//! sub-LLM callbacks on untrusted content. The crate provides:
//! - The engine loop with message threading, final-answer detection,
//!   iteration budgets, and per-block output truncation
//! - The planner client abstraction (with an OpenAI-compatible backend and
//!   a scripted mock)
//! - The validated prompt-template loader
//! - Post-answer verification: mechanical citation probes and two-layer
//!   semantic review

pub mod client;
pub mod engine;
pub mod error;
pub mod http;
pub mod prompts;
pub mod semantic;
pub mod verification;

pub use client::{
    ChatMessage, ChatResponse, LlmClient, MockLlmClient, Role, SharedLlmClient, is_retryable,
    with_retry,
};
pub use engine::{
    BareFinal, CancelSignal, EXECUTOR_DIED_ANSWER, EngineConfig, EngineDeps, INTERRUPTED_ANSWER,
    ProgressCallback, QueryRequest, QueryResult, RlmEngine, extract_code_blocks,
    find_final_answer,
};
pub use error::{Result, RlmError};
pub use http::{OpenAiCompatClient, OpenAiCompatConfig};
pub use prompts::{
    PromptLoader, UNTRUSTED_CLOSE, UNTRUSTED_OPEN, format_code_echo, truncate_code_output,
    wrap_subcall_content,
};
pub use semantic::{
    ContentKind, FindingVerification, SemanticVerificationReport, detect_content_kind,
    gather_cited_documents, parse_verification_response,
};
pub use verification::{
    Citation, CitationVerifier, QuoteCitationVerifier, VerificationPlan, VerificationResult,
};
