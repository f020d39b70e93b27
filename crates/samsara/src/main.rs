//! samsara: Recursive Language Model runtime.
//!
//! Drives a planner LLM against a sandboxed REPL over a set of documents:
//! the planner writes code, the sandbox runs it and calls back into
//! sub-LLMs for heavy reading, and the loop ends when the sandbox marks a
//! final answer.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use samsara_rlm::{
    EngineConfig, EngineDeps, OpenAiCompatClient, OpenAiCompatConfig, QueryRequest, RlmEngine,
};
use samsara_sandbox::{
    ExecutionMode, ExecutorFactory, ExecutorPool, ProcessExecutorFactory, SecurityPolicy,
};
use samsara_tracing::FilesystemTraceStore;

use config::Config;

/// Recursive Language Model runtime
#[derive(Parser)]
#[command(name = "samsara")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a query over a set of document files
    Query {
        /// The question to answer
        #[arg(short, long)]
        question: String,

        /// Document files to load as context
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Planner model override
        #[arg(short, long)]
        model: Option<String>,

        /// Run batched sub-LLM calls sequentially instead of concurrently
        #[arg(long)]
        deep: bool,

        /// Persist the query trace under this project id
        #[arg(long)]
        project: Option<String>,

        /// Trace directory override
        #[arg(long)]
        trace_dir: Option<PathBuf>,
    },

    /// Spawn a sandbox runner and round-trip a ping
    Ping,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn build_factory(config: &Config) -> Arc<dyn ExecutorFactory> {
    Arc::new(
        ProcessExecutorFactory::new(&config.sandbox.runner).with_policy(SecurityPolicy::default()),
    )
}

async fn run_query(
    config: Config,
    question: String,
    files: Vec<PathBuf>,
    model: Option<String>,
    deep: bool,
    project: Option<String>,
    trace_dir: Option<PathBuf>,
) -> Result<()> {
    let mut documents = Vec::with_capacity(files.len());
    let mut doc_names = Vec::with_capacity(files.len());
    for path in &files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read document: {}", path.display()))?;
        documents.push(content);
        doc_names.push(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        );
    }

    let model = model.unwrap_or_else(|| config.planner.model.clone());
    let mut planner_config = OpenAiCompatConfig::new(&config.planner.base_url, &model);
    if let Some(key) = config.api_key() {
        planner_config = planner_config.with_api_key(key);
    }
    let planner = Arc::new(OpenAiCompatClient::new(planner_config)?);

    let factory = build_factory(&config);
    let mut deps = EngineDeps::new(planner, factory.clone());
    if config.sandbox.pool_size > 0 {
        let pool = Arc::new(ExecutorPool::new(factory));
        pool.warm(config.sandbox.pool_size).await?;
        deps = deps.with_pool(pool);
    }

    let trace_dir = trace_dir.or_else(|| config.traces.dir.clone());
    if let Some(ref dir) = trace_dir {
        deps = deps.with_storage(Arc::new(FilesystemTraceStore::new(dir)));
    }
    if project.is_some() && trace_dir.is_none() {
        bail!("--project requires a trace directory ([traces] dir or --trace-dir)");
    }

    let mode = if deep || config.engine.mode == "deep" {
        ExecutionMode::Deep
    } else {
        ExecutionMode::Fast
    };
    let engine_config = EngineConfig::new(&model)
        .with_max_iterations(config.engine.max_iterations)
        .with_max_output_chars(config.engine.max_output_chars)
        .with_execute_timeout(Duration::from_secs(config.engine.execute_timeout_secs))
        .with_max_subcall_payload_chars(config.engine.max_subcall_payload_chars)
        .with_execution_mode(mode)
        .with_verify_citations(config.engine.verify_citations)
        .with_verify(config.engine.verify)
        .with_max_traces_per_project(config.traces.retention);

    let engine = RlmEngine::new(deps, engine_config);

    let mut request = QueryRequest::new(documents, question).with_doc_names(doc_names);
    if let Some(project) = project {
        request = request.with_project_id(project);
    }

    let result = engine.query(request).await?;

    println!("{}", result.answer);
    tracing::info!(
        status = ?result.status,
        prompt_tokens = result.token_usage.prompt_tokens,
        completion_tokens = result.token_usage.completion_tokens,
        elapsed_s = format!("{:.1}", result.execution_time),
        steps = result.trace.len(),
        "Query complete"
    );
    if let Some(verification) = result.verification {
        tracing::info!(
            citations = verification.citations.len(),
            all_valid = verification.all_valid(),
            "Citation verification"
        );
    }
    Ok(())
}

async fn run_ping(config: Config) -> Result<()> {
    let factory = build_factory(&config);
    let mut executor = factory
        .create()
        .await
        .context("Failed to start sandbox runner")?;
    executor.ping().await.context("Ping failed")?;
    executor.stop().await;
    println!("pong");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = Config::load_or_default();

    match cli.command {
        Command::Query {
            question,
            files,
            model,
            deep,
            project,
            trace_dir,
        } => run_query(config, question, files, model, deep, project, trace_dir).await,
        Command::Ping => run_ping(config).await,
    }
}
