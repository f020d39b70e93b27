//! Host-side sandbox executor.
//!
//! Drives one guest over a framed JSON protocol: sends commands, demuxes the
//! inbound stream, enforces buffer limits and deadlines, and brokers sub-LLM
//! callbacks (serially or as a bounded concurrent batch).
//!
//! Failure isolation: any protocol violation stops the executor (transport
//! dropped, buffers cleared) before the error result is surfaced, so a
//! compromised guest can never be reused. User-content errors in sub-LLM
//! dispatch are relayed to the guest and leave the executor alive.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::error::{SandboxError, SubcallError};
use crate::protocol::{
    DEFAULT_SEND_TIMEOUT, MAX_BATCH_WORKERS, MAX_BUFFER_SIZE, MAX_MESSAGE_SIZE, MAX_READ_DURATION,
    encode_message, parse_mux_header,
};
use crate::security::SecurityPolicy;
use crate::transport::{ProcessTransport, Transport};

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Handler for sub-LLM queries arriving from the guest.
///
/// Invoked concurrently during batched dispatch in fast mode; any shared
/// state the handler touches must be internally synchronized.
#[async_trait]
pub trait LlmQueryHandler: Send + Sync {
    async fn handle(&self, instruction: &str, content: &str) -> Result<String, SubcallError>;
}

/// Thread-safe handler reference.
pub type SharedHandler = Arc<dyn LlmQueryHandler>;

/// Whether batched sub-LLM dispatch runs concurrently or sequentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Fast,
    Deep,
}

/// Status of one guest execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Ok,
    Error,
}

/// Result of executing one code block in the sandbox.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub final_answer: Option<String>,
    pub final_var: Option<String>,
    pub final_value: Option<String>,
    pub vars: Option<BTreeMap<String, String>>,
}

impl ExecuteOutcome {
    /// An error outcome produced host-side (no guest reply involved).
    pub fn host_error(message: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::Error,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(message.into()),
            final_answer: None,
            final_var: None,
            final_value: None,
            vars: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ExecStatus::Ok
    }

    /// Whether the guest marked a final answer during this execution.
    pub fn has_final_marker(&self) -> bool {
        self.final_answer.is_some() || self.final_var.is_some()
    }
}

/// Coerce a guest `final_answer` scalar to the guest language's printed form.
fn coerce_final(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn str_field(msg: &Value, key: &str) -> String {
    msg.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn parse_execute_reply(msg: &Value) -> ExecuteOutcome {
    let status = match msg.get("status").and_then(|s| s.as_str()) {
        Some("ok") => ExecStatus::Ok,
        _ => ExecStatus::Error,
    };
    ExecuteOutcome {
        status,
        stdout: str_field(msg, "stdout"),
        stderr: str_field(msg, "stderr"),
        error: msg
            .get("error")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        final_answer: msg
            .get("final_answer")
            .filter(|v| !v.is_null())
            .map(coerce_final),
        final_var: msg
            .get("final_var")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        final_value: msg
            .get("final_value")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        vars: msg.get("vars").and_then(|v| v.as_object()).map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        }),
    }
}

/// Host-side driver for one sandbox.
///
/// Alive iff a transport is attached; a protocol violation detaches the
/// transport before the error surfaces.
pub struct SandboxExecutor {
    id: u64,
    transport: Option<Box<dyn Transport>>,
    raw_buf: BytesMut,
    content_buf: BytesMut,
    handler: Option<SharedHandler>,
    mode: ExecutionMode,
}

impl SandboxExecutor {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
            transport: Some(transport),
            raw_buf: BytesMut::new(),
            content_buf: BytesMut::new(),
            handler: None,
            mode: ExecutionMode::default(),
        }
    }

    /// Stable identity used by the pool's bookkeeping.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_some()
    }

    pub fn set_handler(&mut self, handler: SharedHandler) {
        self.handler = Some(handler);
    }

    pub fn clear_handler(&mut self) {
        self.handler = None;
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
    }

    /// Tear down the transport and clear protocol state.
    pub async fn stop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await;
            tracing::debug!(executor_id = self.id, "Executor stopped");
        }
        self.raw_buf.clear();
        self.content_buf.clear();
    }

    /// Bind the document sequence in the guest namespace.
    pub async fn setup_context(&mut self, context: &[String]) -> Result<(), SandboxError> {
        self.send_command(&json!({"action": "setup", "context": context}))
            .await
    }

    /// Clear guest bindings back to the pristine builtin set.
    pub async fn reset_namespace(&mut self) -> Result<(), SandboxError> {
        self.send_command(&json!({"action": "reset"})).await
    }

    /// Liveness probe round-trip.
    pub async fn ping(&mut self) -> Result<(), SandboxError> {
        self.send_command(&json!({"action": "ping"})).await
    }

    async fn send_command(&mut self, command: &Value) -> Result<(), SandboxError> {
        let result = self.send_command_inner(command).await;
        if let Err(SandboxError::Protocol(_)) = &result {
            self.stop().await;
        }
        result
    }

    async fn send_command_inner(&mut self, command: &Value) -> Result<(), SandboxError> {
        self.send_message(command, DEFAULT_SEND_TIMEOUT).await?;
        let reply = self.read_message(DEFAULT_SEND_TIMEOUT).await?;
        match reply.get("status").and_then(|s| s.as_str()) {
            Some("ok") => Ok(()),
            _ => Err(SandboxError::Command(
                reply
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("non-ok reply")
                    .to_string(),
            )),
        }
    }

    /// Execute one code block, brokering sub-LLM callbacks until the guest
    /// sends the terminal execute reply.
    ///
    /// Never returns `Err`: protocol violations stop the executor and come
    /// back as an error outcome, matching the engine's recovery contract.
    pub async fn execute(&mut self, code: &str, timeout: Duration) -> ExecuteOutcome {
        if !self.is_alive() {
            return ExecuteOutcome::host_error("Executor stopped: no transport attached");
        }

        if let Err(e) = self
            .send_message(&json!({"action": "execute", "code": code}), DEFAULT_SEND_TIMEOUT)
            .await
        {
            self.stop().await;
            return ExecuteOutcome::host_error(e.to_string());
        }

        loop {
            let msg = match self.read_message(timeout).await {
                Ok(m) => m,
                Err(e) => {
                    self.stop().await;
                    return ExecuteOutcome::host_error(e.to_string());
                }
            };

            match msg.get("action").and_then(|a| a.as_str()) {
                Some("llm_query") => {
                    if let Err(e) = self.dispatch_single(&msg).await {
                        self.stop().await;
                        return ExecuteOutcome::host_error(e.to_string());
                    }
                }
                Some("llm_query_batch") => {
                    if let Err(e) = self.dispatch_batch_request(&msg).await {
                        self.stop().await;
                        return ExecuteOutcome::host_error(e.to_string());
                    }
                }
                _ => return parse_execute_reply(&msg),
            }
        }
    }

    async fn dispatch_single(&mut self, msg: &Value) -> Result<(), SandboxError> {
        let instruction = msg
            .get("instruction")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SandboxError::Protocol("missing required field 'instruction'".to_string())
            })?
            .to_string();
        let content = msg
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SandboxError::Protocol("missing required field 'content'".to_string()))?
            .to_string();

        let reply = match self.handler.clone() {
            None => json!({
                "action": "llm_response",
                "error": "No LLM query handler configured",
            }),
            Some(handler) => match handler.handle(&instruction, &content).await {
                Ok(result) => json!({"action": "llm_response", "result": result}),
                Err(e) => json!({"action": "llm_response", "error": e.to_string()}),
            },
        };
        self.send_message(&reply, DEFAULT_SEND_TIMEOUT).await
    }

    async fn dispatch_batch_request(&mut self, msg: &Value) -> Result<(), SandboxError> {
        let prompts: Vec<String> = msg
            .get("prompts")
            .and_then(|v| v.as_array())
            .ok_or_else(|| SandboxError::Protocol("missing required field 'prompts'".to_string()))?
            .iter()
            .map(|p| p.as_str().unwrap_or_default().to_string())
            .collect();

        let reply = match self.handler.clone() {
            None => json!({
                "action": "llm_batch_response",
                "error": "No LLM query handler configured",
            }),
            Some(handler) => {
                let results = Self::dispatch_batch(handler, prompts, self.mode).await;
                json!({"action": "llm_batch_response", "results": results})
            }
        };
        self.send_message(&reply, DEFAULT_SEND_TIMEOUT).await
    }

    /// Run a batch of prompts through the handler.
    ///
    /// Fast mode fans out on a bounded concurrent stream (input order is
    /// preserved regardless of completion order); deep mode runs serially.
    /// A rejected prompt becomes an `[error: …]` result string rather than
    /// failing the whole batch.
    async fn dispatch_batch(
        handler: SharedHandler,
        prompts: Vec<String>,
        mode: ExecutionMode,
    ) -> Vec<String> {
        if prompts.is_empty() {
            return Vec::new();
        }

        let call_one = |prompt: String| {
            let handler = handler.clone();
            async move {
                match handler.handle(&prompt, "").await {
                    Ok(result) => result,
                    Err(e) => format!("[error: {e}]"),
                }
            }
        };

        match mode {
            ExecutionMode::Deep => {
                let mut results = Vec::with_capacity(prompts.len());
                for prompt in prompts {
                    results.push(call_one(prompt).await);
                }
                results
            }
            ExecutionMode::Fast => {
                let workers = prompts.len().min(MAX_BATCH_WORKERS);
                futures::stream::iter(prompts.into_iter().map(call_one))
                    .buffered(workers)
                    .collect()
                    .await
            }
        }
    }

    /// Send one length-prefixed JSON message.
    ///
    /// The size cap is enforced before any byte reaches the wire; the write
    /// is bounded by `timeout` and emitted as a single call.
    pub async fn send_message(
        &mut self,
        value: &Value,
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        let frame = encode_message(value)?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| SandboxError::Protocol("no transport attached".to_string()))?;
        match tokio::time::timeout(timeout, transport.send_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SandboxError::Protocol(format!("Send failed: {e}"))),
            Err(_) => Err(SandboxError::Protocol(format!(
                "Send timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Read one length-prefixed JSON message, demultiplexing transport
    /// frames as needed.
    ///
    /// Two deadlines apply: the per-message effective deadline
    /// `min(MAX_READ_DURATION, timeout + 10s)` checked on every loop
    /// iteration (including inner frame assembly), and the per-receive
    /// timeout equal to `timeout`.
    pub async fn read_message(&mut self, timeout: Duration) -> Result<Value, SandboxError> {
        if self.transport.is_none() {
            return Err(SandboxError::Protocol("no transport attached".to_string()));
        }

        let effective = MAX_READ_DURATION.min(timeout + Duration::from_secs(10));
        let start = Instant::now();

        loop {
            if start.elapsed() > effective {
                return Err(SandboxError::Protocol(format!(
                    "Read duration exceeded {}s",
                    effective.as_secs()
                )));
            }

            if self.content_buf.len() >= 4 {
                let msg_len = u32::from_be_bytes([
                    self.content_buf[0],
                    self.content_buf[1],
                    self.content_buf[2],
                    self.content_buf[3],
                ]) as usize;
                if msg_len > MAX_MESSAGE_SIZE {
                    return Err(SandboxError::Protocol(format!(
                        "Message size {msg_len} exceeds maximum {MAX_MESSAGE_SIZE}"
                    )));
                }
                if self.content_buf.len() >= 4 + msg_len {
                    self.content_buf.advance(4);
                    let payload = self.content_buf.split_to(msg_len);
                    let text = std::str::from_utf8(&payload).map_err(|e| {
                        SandboxError::Protocol(format!("invalid UTF-8 from sandbox: {e}"))
                    })?;
                    return serde_json::from_str(text).map_err(|e| {
                        SandboxError::Protocol(format!("invalid JSON from sandbox: {e}"))
                    });
                }
            }

            self.demux_frame(start, effective, timeout).await?;
        }
    }

    /// Demux one transport frame from the raw buffer into the content
    /// buffer, receiving more bytes as needed.
    async fn demux_frame(
        &mut self,
        start: Instant,
        effective: Duration,
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        while self.raw_buf.len() < 8 {
            self.fill_raw(start, effective, timeout).await?;
        }

        let mut header = [0u8; 8];
        header.copy_from_slice(&self.raw_buf[..8]);
        if let Some(mux) = parse_mux_header(&header) {
            while self.raw_buf.len() < 8 + mux.payload_len {
                self.fill_raw(start, effective, timeout).await?;
            }
            self.raw_buf.advance(8);
            let payload = self.raw_buf.split_to(mux.payload_len);
            self.content_buf.extend_from_slice(&payload);
        } else {
            // Not a multiplex header: the transport is a plain stream.
            let raw = self.raw_buf.split();
            self.content_buf.extend_from_slice(&raw);
        }

        if self.content_buf.len() > MAX_BUFFER_SIZE {
            return Err(SandboxError::Protocol(format!(
                "Content buffer exceeded {MAX_BUFFER_SIZE} bytes"
            )));
        }
        Ok(())
    }

    async fn fill_raw(
        &mut self,
        start: Instant,
        effective: Duration,
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        if start.elapsed() > effective {
            return Err(SandboxError::Protocol(format!(
                "Read duration exceeded {}s",
                effective.as_secs()
            )));
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| SandboxError::Protocol("no transport attached".to_string()))?;
        let chunk = match tokio::time::timeout(timeout, transport.recv()).await {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) => return Err(SandboxError::Protocol(format!("Receive failed: {e}"))),
            Err(_) => {
                return Err(SandboxError::Protocol(format!(
                    "Read timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };
        if chunk.is_empty() {
            return Err(SandboxError::Protocol(
                "Connection closed before message complete".to_string(),
            ));
        }
        self.raw_buf.extend_from_slice(&chunk);
        if self.raw_buf.len() > MAX_BUFFER_SIZE {
            return Err(SandboxError::Protocol(format!(
                "Raw buffer exceeded {MAX_BUFFER_SIZE} bytes"
            )));
        }
        Ok(())
    }
}

/// Creates started executors. The pool and the engine both go through this
/// seam so tests can substitute in-memory sandboxes.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn create(&self) -> Result<SandboxExecutor, SandboxError>;
}

/// Spawns the guest runner binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessExecutorFactory {
    program: PathBuf,
    args: Vec<String>,
    policy: SecurityPolicy,
}

impl ProcessExecutorFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            policy: SecurityPolicy::default(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl ExecutorFactory for ProcessExecutorFactory {
    async fn create(&self) -> Result<SandboxExecutor, SandboxError> {
        let transport = ProcessTransport::spawn(&self.program, &self.args, &self.policy)?;
        let mut executor = SandboxExecutor::new(Box::new(transport));
        // A failed probe here is a broken runner; surface it before the
        // executor ever reaches the pool.
        if let Err(e) = executor.ping().await {
            executor.stop().await;
            return Err(e);
        }
        Ok(executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mux_frame;
    use crate::transport::DuplexTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const T: Duration = Duration::from_secs(5);

    async fn write_raw(far: &mut DuplexStream, bytes: &[u8]) {
        far.write_all(bytes).await.unwrap();
        far.flush().await.unwrap();
    }

    async fn write_frame(far: &mut DuplexStream, value: &Value) {
        let frame = encode_message(value).unwrap();
        write_raw(far, &frame).await;
    }

    async fn read_frame(far: &mut DuplexStream) -> Value {
        let mut prefix = [0u8; 4];
        far.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        far.read_exact(&mut payload).await.unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    fn executor_pair() -> (SandboxExecutor, DuplexStream) {
        let (transport, far) = DuplexTransport::pair(64 * 1024 * 1024);
        (SandboxExecutor::new(Box::new(transport)), far)
    }

    struct EchoHandler;

    #[async_trait]
    impl LlmQueryHandler for EchoHandler {
        async fn handle(&self, instruction: &str, _content: &str) -> Result<String, SubcallError> {
            Ok(format!("answer_{instruction}"))
        }
    }

    struct SlowHandler(Duration);

    #[async_trait]
    impl LlmQueryHandler for SlowHandler {
        async fn handle(&self, instruction: &str, _content: &str) -> Result<String, SubcallError> {
            tokio::time::sleep(self.0).await;
            Ok(format!("slow_{instruction}"))
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl LlmQueryHandler for RejectingHandler {
        async fn handle(&self, _instruction: &str, _content: &str) -> Result<String, SubcallError> {
            Err(SubcallError::ContentRejected(
                "Payload size exceeds the sub-LLM limit".to_string(),
            ))
        }
    }

    #[tokio::test]
    async fn test_read_message_parses_plain_frame() {
        let (mut executor, mut far) = executor_pair();
        write_frame(&mut far, &json!({"status": "ok"})).await;

        let msg = executor.read_message(T).await.unwrap();
        assert_eq!(msg["status"], "ok");
    }

    #[tokio::test]
    async fn test_read_message_parses_muxed_frame() {
        let (mut executor, mut far) = executor_pair();
        let inner = encode_message(&json!({"status": "ok", "message": "pong"})).unwrap();
        write_raw(&mut far, &mux_frame(1, &inner)).await;

        let msg = executor.read_message(T).await.unwrap();
        assert_eq!(msg["message"], "pong");
    }

    #[tokio::test]
    async fn test_read_message_handles_split_across_mux_frames() {
        let (mut executor, mut far) = executor_pair();
        let inner = encode_message(&json!({"status": "ok", "stdout": "hello"})).unwrap();
        let (a, b) = inner.split_at(inner.len() / 2);
        write_raw(&mut far, &mux_frame(1, a)).await;
        write_raw(&mut far, &mux_frame(1, b)).await;

        let msg = executor.read_message(T).await.unwrap();
        assert_eq!(msg["stdout"], "hello");
    }

    #[tokio::test]
    async fn test_read_message_handles_multiple_messages_in_one_frame() {
        let (mut executor, mut far) = executor_pair();
        let mut combined = encode_message(&json!({"n": 1})).unwrap();
        combined.extend(encode_message(&json!({"n": 2})).unwrap());
        write_raw(&mut far, &mux_frame(1, &combined)).await;

        let first = executor.read_message(T).await.unwrap();
        let second = executor.read_message(T).await.unwrap();
        assert_eq!(first["n"], 1);
        assert_eq!(second["n"], 2);
    }

    #[tokio::test]
    async fn test_read_message_handles_large_payload() {
        let (mut executor, mut far) = executor_pair();
        let big = "y".repeat(1024 * 1024);
        let value = json!({"status": "ok", "stdout": big});
        let frame = encode_message(&value).unwrap();
        let writer = tokio::spawn(async move {
            far.write_all(&frame).await.unwrap();
            far
        });

        let msg = executor.read_message(T).await.unwrap();
        assert_eq!(msg["stdout"].as_str().unwrap().len(), 1024 * 1024);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_declared_length() {
        let (mut executor, mut far) = executor_pair();
        let mut bogus = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes().to_vec();
        bogus.extend_from_slice(&[0u8; 16]);
        write_raw(&mut far, &bogus).await;

        let err = executor.read_message(T).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_boundary_just_under_limit_passes() {
        let (mut executor, mut far) = executor_pair();
        // 9.99 MiB of payload is inside the 10 MiB cap.
        let size = (9.99 * 1024.0 * 1024.0) as usize;
        let value = json!({"status": "ok", "stdout": "z".repeat(size - 32)});
        let frame = encode_message(&value).unwrap();
        assert!(frame.len() - 4 <= MAX_MESSAGE_SIZE);
        let writer = tokio::spawn(async move {
            far.write_all(&frame).await.unwrap();
            far
        });

        let msg = executor.read_message(Duration::from_secs(30)).await.unwrap();
        assert_eq!(msg["status"], "ok");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_message_errors_on_close_before_prefix() {
        let (mut executor, mut far) = executor_pair();
        write_raw(&mut far, &[0, 0]).await;
        drop(far);

        let err = executor.read_message(T).await.unwrap_err();
        assert!(err.to_string().contains("Connection closed"));
    }

    #[tokio::test]
    async fn test_read_message_errors_on_close_mid_payload() {
        let (mut executor, mut far) = executor_pair();
        let frame = encode_message(&json!({"status": "ok", "stdout": "partial"})).unwrap();
        write_raw(&mut far, &frame[..frame.len() - 3]).await;
        drop(far);

        let err = executor.read_message(T).await.unwrap_err();
        assert!(err.to_string().contains("Connection closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_message_enforces_effective_deadline() {
        let (mut executor, _far) = executor_pair();
        // Nothing ever arrives; the per-recv timeout trips first and reads
        // surface as protocol errors either way.
        let err = executor.read_message(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("timed out") || err.to_string().contains("exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_checked_in_inner_frame_loop() {
        let (mut executor, mut far) = executor_pair();
        // A mux header promising more payload than will ever arrive forces
        // the inner assembly loop to hit the deadline.
        let mut frame = mux_frame(1, &[0u8; 16]);
        frame.truncate(12);
        write_raw(&mut far, &frame).await;

        let start = Instant::now();
        let err = executor.read_message(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("timed out") || err.to_string().contains("exceeded"));
        // Bounded by the effective deadline (2s timeout + 10s), not the
        // 300s ceiling.
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_send_message_writes_length_prefix() {
        let (mut executor, mut far) = executor_pair();
        executor
            .send_message(&json!({"action": "ping"}), T)
            .await
            .unwrap();

        let msg = read_frame(&mut far).await;
        assert_eq!(msg["action"], "ping");
    }

    #[tokio::test]
    async fn test_send_message_rejects_oversized_payload_without_writing() {
        let (mut executor, mut far) = executor_pair();
        let big = "x".repeat(crate::protocol::MAX_PAYLOAD_SIZE + 1);
        let err = executor
            .send_message(&json!({"data": big}), T)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));

        // Nothing hit the wire; the executor is still usable.
        assert!(executor.is_alive());
        executor
            .send_message(&json!({"action": "ping"}), T)
            .await
            .unwrap();
        let msg = read_frame(&mut far).await;
        assert_eq!(msg["action"], "ping");
    }

    #[tokio::test]
    async fn test_execute_short_circuits_when_not_alive() {
        let (mut executor, _far) = executor_pair();
        executor.stop().await;

        let outcome = executor.execute("print(1)", T).await;
        assert_eq!(outcome.status, ExecStatus::Error);
        assert!(outcome.error.unwrap().contains("no transport"));
    }

    #[tokio::test]
    async fn test_execute_returns_parsed_reply() {
        let (mut executor, mut far) = executor_pair();
        let guest = tokio::spawn(async move {
            let cmd = read_frame(&mut far).await;
            assert_eq!(cmd["action"], "execute");
            write_frame(
                &mut far,
                &json!({
                    "status": "ok",
                    "stdout": "hello\n",
                    "stderr": "",
                    "vars": {"x": "int"},
                }),
            )
            .await;
            far
        });

        let outcome = executor.execute("print(\"hello\")", T).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.vars.unwrap().get("x").unwrap(), "int");
        assert!(executor.is_alive());
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_stops_executor_on_protocol_error() {
        let (mut executor, mut far) = executor_pair();
        let guest = tokio::spawn(async move {
            let _ = read_frame(&mut far).await;
            // Declare an oversize message.
            let bogus = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes().to_vec();
            write_raw(&mut far, &bogus).await;
            write_raw(&mut far, &[0u8; 32]).await;
            far
        });

        let outcome = executor.execute("print(1)", T).await;
        assert_eq!(outcome.status, ExecStatus::Error);
        assert!(outcome.error.unwrap().contains("Protocol error"));
        assert!(!executor.is_alive());
        guest.await.unwrap();

        // Subsequent execute fails immediately without touching the wire.
        let outcome = executor.execute("print(2)", T).await;
        assert_eq!(outcome.status, ExecStatus::Error);
    }

    #[tokio::test]
    async fn test_execute_treats_invalid_json_as_protocol_error() {
        let (mut executor, mut far) = executor_pair();
        let guest = tokio::spawn(async move {
            let _ = read_frame(&mut far).await;
            let payload = b"not json at all";
            let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
            frame.extend_from_slice(payload);
            write_raw(&mut far, &frame).await;
            far
        });

        let outcome = executor.execute("x", T).await;
        assert!(outcome.error.unwrap().contains("invalid JSON"));
        assert!(!executor.is_alive());
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_treats_non_utf8_as_protocol_error() {
        let (mut executor, mut far) = executor_pair();
        let guest = tokio::spawn(async move {
            let _ = read_frame(&mut far).await;
            let payload = vec![0xff, 0xfe, 0xfd, 0xfc];
            let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
            frame.extend_from_slice(&payload);
            write_raw(&mut far, &frame).await;
            far
        });

        let outcome = executor.execute("x", T).await;
        assert!(outcome.error.unwrap().contains("invalid UTF-8"));
        assert!(!executor.is_alive());
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_treats_missing_field_as_protocol_error() {
        let (mut executor, mut far) = executor_pair();
        executor.set_handler(Arc::new(EchoHandler));
        let guest = tokio::spawn(async move {
            let _ = read_frame(&mut far).await;
            // llm_query without instruction/content.
            write_frame(&mut far, &json!({"action": "llm_query"})).await;
            far
        });

        let outcome = executor.execute("x", T).await;
        assert!(outcome.error.unwrap().contains("missing required field"));
        assert!(!executor.is_alive());
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_brokers_llm_query() {
        let (mut executor, mut far) = executor_pair();
        executor.set_handler(Arc::new(EchoHandler));
        let guest = tokio::spawn(async move {
            let _ = read_frame(&mut far).await;
            write_frame(
                &mut far,
                &json!({"action": "llm_query", "instruction": "summarize", "content": "data"}),
            )
            .await;
            let response = read_frame(&mut far).await;
            assert_eq!(response["action"], "llm_response");
            assert_eq!(response["result"], "answer_summarize");
            write_frame(
                &mut far,
                &json!({"status": "ok", "stdout": "done", "stderr": ""}),
            )
            .await;
            far
        });

        let outcome = executor.execute("llm_query(...)", T).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.stdout, "done");
        assert!(executor.is_alive());
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_handler_sends_error_field_and_stays_alive() {
        let (mut executor, mut far) = executor_pair();
        let guest = tokio::spawn(async move {
            let _ = read_frame(&mut far).await;
            write_frame(
                &mut far,
                &json!({"action": "llm_query", "instruction": "i", "content": ""}),
            )
            .await;
            let response = read_frame(&mut far).await;
            assert_eq!(response["action"], "llm_response");
            assert_eq!(response["error"], "No LLM query handler configured");
            write_frame(&mut far, &json!({"status": "error", "error": "ValueError"})).await;
            far
        });

        let outcome = executor.execute("llm_query(...)", T).await;
        assert_eq!(outcome.status, ExecStatus::Error);
        assert!(executor.is_alive());
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_content_rejection_does_not_stop_executor() {
        let (mut executor, mut far) = executor_pair();
        executor.set_handler(Arc::new(RejectingHandler));
        let guest = tokio::spawn(async move {
            let _ = read_frame(&mut far).await;
            write_frame(
                &mut far,
                &json!({"action": "llm_query", "instruction": "i", "content": "big"}),
            )
            .await;
            let response = read_frame(&mut far).await;
            assert!(
                response["error"]
                    .as_str()
                    .unwrap()
                    .contains("exceeds the sub-LLM limit")
            );
            write_frame(&mut far, &json!({"status": "error", "error": "ValueError"})).await;
            far
        });

        let outcome = executor.execute("llm_query(...)", T).await;
        assert_eq!(outcome.status, ExecStatus::Error);
        assert!(executor.is_alive());
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_preserves_input_order() {
        let (mut executor, mut far) = executor_pair();
        executor.set_handler(Arc::new(EchoHandler));
        let guest = tokio::spawn(async move {
            let _ = read_frame(&mut far).await;
            write_frame(
                &mut far,
                &json!({"action": "llm_query_batch", "prompts": ["q0", "q1", "q2", "q3", "q4"]}),
            )
            .await;
            let response = read_frame(&mut far).await;
            assert_eq!(response["action"], "llm_batch_response");
            let results: Vec<String> = response["results"]
                .as_array()
                .unwrap()
                .iter()
                .map(|r| r.as_str().unwrap().to_string())
                .collect();
            assert_eq!(results, vec!["answer_q0", "answer_q1", "answer_q2", "answer_q3", "answer_q4"]);
            write_frame(&mut far, &json!({"status": "ok", "stdout": "", "stderr": ""})).await;
            far
        });

        let outcome = executor.execute("llm_query_batched(...)", T).await;
        assert!(outcome.is_ok());
        guest.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_fast_mode_runs_concurrently() {
        let handler: SharedHandler = Arc::new(SlowHandler(Duration::from_millis(100)));
        let prompts: Vec<String> = (0..4).map(|i| format!("p{i}")).collect();

        let start = Instant::now();
        let results =
            SandboxExecutor::dispatch_batch(handler, prompts, ExecutionMode::Fast).await;
        // Wall clock ~ max(prompt times), not sum.
        assert!(start.elapsed() < Duration::from_millis(250));
        assert_eq!(results.len(), 4);
        assert_eq!(results[0], "slow_p0");
        assert_eq!(results[3], "slow_p3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_deep_mode_runs_sequentially() {
        let handler: SharedHandler = Arc::new(SlowHandler(Duration::from_millis(100)));
        let prompts: Vec<String> = (0..4).map(|i| format!("p{i}")).collect();

        let start = Instant::now();
        let results =
            SandboxExecutor::dispatch_batch(handler, prompts, ExecutionMode::Deep).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert_eq!(results.len(), 4);
    }

    #[tokio::test]
    async fn test_batch_empty_prompts_returns_empty() {
        let handler: SharedHandler = Arc::new(EchoHandler);
        let results =
            SandboxExecutor::dispatch_batch(handler, Vec::new(), ExecutionMode::Fast).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_batch_rejected_prompt_becomes_error_string() {
        let handler: SharedHandler = Arc::new(RejectingHandler);
        let results = SandboxExecutor::dispatch_batch(
            handler,
            vec!["a".to_string()],
            ExecutionMode::Fast,
        )
        .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].starts_with("[error: "));
    }

    #[tokio::test]
    async fn test_setup_and_reset_round_trip() {
        let (mut executor, mut far) = executor_pair();
        let guest = tokio::spawn(async move {
            let setup = read_frame(&mut far).await;
            assert_eq!(setup["action"], "setup");
            assert_eq!(setup["context"][0], "doc one");
            write_frame(&mut far, &json!({"status": "ok"})).await;

            let reset = read_frame(&mut far).await;
            assert_eq!(reset["action"], "reset");
            write_frame(&mut far, &json!({"status": "ok"})).await;
            far
        });

        executor
            .setup_context(&["doc one".to_string()])
            .await
            .unwrap();
        executor.reset_namespace().await.unwrap();
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_protocol_error_stops_executor() {
        let (mut executor, far) = executor_pair();
        drop(far);

        let err = executor.reset_namespace().await.unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(_)));
        assert!(!executor.is_alive());
    }

    #[tokio::test]
    async fn test_coerce_final_scalars() {
        assert_eq!(coerce_final(&json!("text")), "text");
        assert_eq!(coerce_final(&json!(0)), "0");
        assert_eq!(coerce_final(&json!(false)), "False");
        assert_eq!(coerce_final(&json!(true)), "True");
        assert_eq!(coerce_final(&json!("")), "");
    }

    #[tokio::test]
    async fn test_executor_ids_are_unique() {
        let (a, _fa) = executor_pair();
        let (b, _fb) = executor_pair();
        assert_ne!(a.id(), b.id());
    }
}
