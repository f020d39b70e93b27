//! Cross-crate end-to-end tests.
//!
//! These drive the full stack: the engine, a real executor, and the real
//! guest interpreter running in-process. Only the planner LLM is scripted.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use samsara_rlm::{
    ChatMessage, ChatResponse, EXECUTOR_DIED_ANSWER, EngineConfig, EngineDeps, LlmClient,
    MockLlmClient, QueryRequest, RlmEngine,
};
use samsara_sandbox::in_process::InProcessFactory;
use samsara_sandbox::{ExecutorFactory, SandboxError, SandboxExecutor};
use samsara_tracing::{QueryStatus, StepKind, TokenUsage, TraceStorage};

fn engine_with(planner: Arc<dyn LlmClient>, config: EngineConfig) -> RlmEngine {
    RlmEngine::new(
        EngineDeps::new(planner, Arc::new(InProcessFactory::new())),
        config,
    )
}

/// Scenario 1: a single iteration ending in FINAL.
#[tokio::test]
async fn test_single_iteration_final() {
    let planner = Arc::new(MockLlmClient::with_texts(vec![
        "```repl\nFINAL(\"Hello\")\n```",
    ]));
    let engine = engine_with(planner.clone(), EngineConfig::new("test-model"));

    let result = engine
        .query(QueryRequest::new(
            vec!["Hello world.".to_string()],
            "What is the greeting?",
        ))
        .await
        .unwrap();

    assert_eq!(result.answer, "Hello");
    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(planner.request_count(), 1);
    let kinds: Vec<StepKind> = result.trace.steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StepKind::CodeGenerated,
            StepKind::CodeOutput,
            StepKind::FinalAnswer
        ]
    );
}

/// Scenario 2: a bare FINAL_VAR of an undefined name falls through; the
/// planner recovers with a literal on its second turn.
#[tokio::test]
async fn test_undefined_bare_final_var_recovers() {
    let planner = Arc::new(MockLlmClient::with_texts(vec![
        "FINAL_VAR(undefined)",
        "FINAL(\"fallback\")",
    ]));
    let engine = engine_with(
        planner.clone(),
        EngineConfig::new("test-model").with_max_iterations(5),
    );

    let result = engine
        .query(QueryRequest::new(vec!["x".repeat(100)], "Q"))
        .await
        .unwrap();

    assert_eq!(result.answer, "\"fallback\"");
    assert_eq!(planner.request_count(), 2);
    assert!(!result.answer.contains("undefined"));
}

/// Planner-and-sub-LLM client: planner turns are scripted, sub-LLM calls
/// (single-message requests) are answered after a delay keyed by prompt so
/// completion order differs from input order.
struct OutOfOrderSubClient {
    planner: MockLlmClient,
    delays_ms: Vec<u64>,
    served: Mutex<usize>,
}

#[async_trait]
impl LlmClient for OutOfOrderSubClient {
    async fn complete(&self, messages: &[ChatMessage]) -> samsara_rlm::Result<ChatResponse> {
        if messages.len() > 1 {
            return self.planner.complete(messages).await;
        }
        let index = {
            let mut served = self.served.lock().unwrap();
            let i = *served;
            *served += 1;
            i
        };
        let delay = self.delays_ms[index % self.delays_ms.len()];
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(ChatResponse::new(
            format!("r_{}", messages[0].content),
            10,
            5,
        ))
    }

    fn name(&self) -> &str {
        "out-of-order"
    }
}

/// Scenario 3: batched sub-LLM results come back in input order even when
/// completion order is scrambled.
#[tokio::test]
async fn test_batched_subcalls_ordered_despite_completion_order() {
    let planner = Arc::new(OutOfOrderSubClient {
        planner: MockLlmClient::with_texts(vec![
            "```repl\nresults = llm_query_batched([\"a\", \"b\", \"c\", \"d\"])\nFINAL_VAR(\"results\")\n```",
        ]),
        // First-submitted prompts finish last.
        delays_ms: vec![80, 60, 40, 20],
        served: Mutex::new(0),
    });
    let engine = engine_with(planner, EngineConfig::new("test-model"));

    let result = engine
        .query(QueryRequest::new(
            vec!["doc one".to_string(), "doc two".to_string()],
            "Q",
        ))
        .await
        .unwrap();

    assert_eq!(result.answer, "['r_a', 'r_b', 'r_c', 'r_d']");
}

/// Fast mode runs a batch concurrently: total wall clock tracks the
/// slowest prompt, not the sum.
#[tokio::test]
async fn test_batch_fast_mode_is_concurrent() {
    let planner = Arc::new(OutOfOrderSubClient {
        planner: MockLlmClient::with_texts(vec![
            "```repl\nresults = llm_query_batched([\"a\", \"b\", \"c\", \"d\"])\nFINAL(\"done\")\n```",
        ]),
        delays_ms: vec![200, 200, 200, 200],
        served: Mutex::new(0),
    });
    let engine = engine_with(planner, EngineConfig::new("test-model"));

    let start = Instant::now();
    let result = engine
        .query(QueryRequest::new(vec!["doc".to_string()], "Q"))
        .await
        .unwrap();
    assert_eq!(result.answer, "done");
    // Four 200ms prompts concurrently: well under the 800ms serial cost.
    assert!(start.elapsed() < Duration::from_millis(700));
}

/// Scenario 4: the iteration cap produces a best-effort planner answer.
#[tokio::test]
async fn test_max_iterations_best_effort() {
    let planner = Arc::new(MockLlmClient::with_texts(vec![
        "```repl\nprint(\"explore\")\n```",
        "```repl\nprint(\"explore\")\n```",
        "My best guess is blue.",
    ]));
    let engine = engine_with(
        planner.clone(),
        EngineConfig::new("test-model").with_max_iterations(2),
    );

    let result = engine
        .query(QueryRequest::new(vec!["doc".to_string()], "Q"))
        .await
        .unwrap();

    assert_eq!(result.answer, "My best guess is blue.");
    assert_eq!(result.status, QueryStatus::MaxIterations);
    assert_eq!(planner.request_count(), 3);
    assert_eq!(result.token_usage, TokenUsage::new(300, 150));
}

/// Scenario 5: falsy finals still terminate with the coerced string form.
#[tokio::test]
async fn test_final_zero_terminates() {
    let planner = Arc::new(MockLlmClient::with_texts(vec!["FINAL(0)"]));
    let engine = engine_with(planner.clone(), EngineConfig::new("test-model"));

    let result = engine
        .query(QueryRequest::new(vec!["doc".to_string()], "Q"))
        .await
        .unwrap();

    assert_eq!(result.answer, "0");
    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(planner.request_count(), 1);
}

/// Guest that answers setup then breaks the protocol on the first execute.
struct BrokenAfterSetupFactory;

#[async_trait]
impl ExecutorFactory for BrokenAfterSetupFactory {
    async fn create(&self) -> Result<SandboxExecutor, SandboxError> {
        use samsara_sandbox::protocol::encode_message;
        use samsara_sandbox::transport::DuplexTransport;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (transport, mut far) = DuplexTransport::pair(1 << 20);
        tokio::spawn(async move {
            // Answer the setup command.
            let mut prefix = [0u8; 4];
            far.read_exact(&mut prefix).await.unwrap();
            let mut payload = vec![0u8; u32::from_be_bytes(prefix) as usize];
            far.read_exact(&mut payload).await.unwrap();
            let ok = encode_message(&serde_json::json!({"status": "ok"})).unwrap();
            far.write_all(&ok).await.unwrap();

            // Break on the next command: declare an oversized message.
            far.read_exact(&mut prefix).await.unwrap();
            let mut payload = vec![0u8; u32::from_be_bytes(prefix) as usize];
            far.read_exact(&mut payload).await.unwrap();
            let bogus = ((samsara_sandbox::MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
            let _ = far.write_all(&bogus).await;
            let _ = far.write_all(&[0u8; 8]).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        Ok(SandboxExecutor::new(Box::new(transport)))
    }
}

/// Scenario 6: a protocol error with no pool terminates the query with the
/// reserved dead-executor answer and no further planner calls.
#[tokio::test]
async fn test_executor_death_without_pool() {
    let planner = Arc::new(MockLlmClient::with_texts(vec![
        "```repl\nprint(\"boom\")\n```",
        "never requested",
    ]));
    let deps = EngineDeps::new(planner.clone(), Arc::new(BrokenAfterSetupFactory));
    let engine = RlmEngine::new(deps, EngineConfig::new("test-model").with_max_iterations(5));

    let result = engine
        .query(QueryRequest::new(vec!["doc".to_string()], "Q"))
        .await
        .unwrap();

    assert_eq!(result.answer, EXECUTOR_DIED_ANSWER);
    assert_eq!(result.status, QueryStatus::ExecutorDied);
    assert_eq!(planner.request_count(), 1);
}

/// The full guest round trip over the real protocol: reset restores a
/// pristine builtin namespace.
#[tokio::test]
async fn test_reset_then_callable_law() {
    let factory = InProcessFactory::new();
    let mut executor = factory.create().await.unwrap();

    let outcome = executor
        .execute("x = 5", Duration::from_secs(5))
        .await;
    assert!(outcome.is_ok());

    executor.reset_namespace().await.unwrap();
    let outcome = executor
        .execute(
            "print(callable(FINAL), callable(llm_query))",
            Duration::from_secs(5),
        )
        .await;
    assert!(outcome.is_ok());
    assert_eq!(outcome.stdout, "True True\n");
    assert_eq!(outcome.vars.unwrap().len(), 0);
    executor.stop().await;
}

/// Trace persistence end to end: header, steps, summary, in order.
#[tokio::test]
async fn test_trace_file_round_trip() {
    use samsara_tracing::{FilesystemTraceStore, TraceRecord, writer::read_records};

    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FilesystemTraceStore::new(dir.path()));
    let planner = Arc::new(MockLlmClient::with_texts(vec![
        "```repl\nFINAL(\"traced\")\n```",
    ]));
    let deps = EngineDeps::new(planner, Arc::new(InProcessFactory::new()))
        .with_storage(storage.clone());
    let engine = RlmEngine::new(deps, EngineConfig::new("test-model"));

    let result = engine
        .query(
            QueryRequest::new(vec!["body".to_string()], "Q")
                .with_doc_names(vec!["notes.txt".to_string()])
                .with_project_id("e2e"),
        )
        .await
        .unwrap();
    assert_eq!(result.answer, "traced");

    let files = storage.list_traces("e2e").unwrap();
    let records = read_records(&files[0]).unwrap();
    assert!(matches!(records.first().unwrap(), TraceRecord::Header(_)));
    assert!(matches!(records.last().unwrap(), TraceRecord::Summary(_)));
    let steps = records
        .iter()
        .filter(|r| matches!(r, TraceRecord::Step(_)))
        .count();
    assert_eq!(steps, result.trace.len());
}

/// A multi-iteration exploration over real documents: the namespace
/// persists between planner turns and helpers drive the answer.
#[tokio::test]
async fn test_multi_iteration_exploration() {
    let planner = Arc::new(MockLlmClient::with_texts(vec![
        "```repl\nprint(len(context), len(context[0]))\n```",
        "```repl\nidx = find_in_context(\"serpent\")\nprint(idx)\n```",
        "```repl\nFINAL(\"Found in document \" + str(idx))\n```",
    ]));
    let engine = engine_with(
        planner.clone(),
        EngineConfig::new("test-model").with_max_iterations(5),
    );

    let result = engine
        .query(QueryRequest::new(
            vec![
                "The raven watches.".to_string(),
                "The serpent coils beneath the world.".to_string(),
            ],
            "Which document mentions the serpent?",
        ))
        .await
        .unwrap();

    assert_eq!(result.answer, "Found in document 1");
    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(planner.request_count(), 3);

    // Every non-terminal iteration appended a code echo to the history.
    let requests = planner.requests();
    let last_request = &requests[2];
    let echo_count = last_request
        .iter()
        .filter(|m| m.content.contains("Code executed:"))
        .count();
    assert_eq!(echo_count, 2);
}
