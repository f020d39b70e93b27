//! Transport adapters for sandbox byte streams.
//!
//! The executor only sees a duplex byte stream; whether the other end is a
//! child process, a container attach socket, or an in-memory pipe is the
//! transport's business. Multiplex demultiplexing happens above this layer.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::SandboxError;
use crate::security::SecurityPolicy;

/// Read chunk size for transport receives.
const RECV_CHUNK: usize = 4096;

/// A duplex byte stream to a sandbox.
#[async_trait]
pub trait Transport: Send {
    /// Read one chunk of raw bytes. An empty chunk means the peer closed
    /// the stream.
    async fn recv(&mut self) -> std::io::Result<Vec<u8>>;

    /// Write all bytes to the peer.
    async fn send_all(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Tear the connection down and reclaim resources.
    async fn shutdown(&mut self);
}

/// Transport over a spawned guest process's stdio.
pub struct ProcessTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ProcessTransport {
    /// Spawn a guest process with the given security policy applied.
    ///
    /// The child's environment is cleared; only the policy's variables pass
    /// through. Stderr is inherited so guest diagnostics reach the host log.
    pub fn spawn(
        program: &PathBuf,
        args: &[String],
        policy: &SecurityPolicy,
    ) -> Result<Self, SandboxError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&policy.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(ref dir) = policy.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {e}", program.display())))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("child stdout not captured".to_string()))?;

        tracing::debug!(program = %program.display(), pid = child.id(), "Sandbox process started");
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_CHUNK];
        let n = self.stdout.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn send_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(data).await?;
        self.stdin.flush().await
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Sandbox process already gone");
        }
        let _ = self.child.wait().await;
    }
}

/// In-memory transport over a [`tokio::io::duplex`] pipe, for tests.
pub struct DuplexTransport {
    stream: DuplexStream,
}

impl DuplexTransport {
    /// Create a connected pair: the transport and the far end the test
    /// drives raw bytes through.
    pub fn pair(capacity: usize) -> (Self, DuplexStream) {
        let (near, far) = tokio::io::duplex(capacity);
        (Self { stream: near }, far)
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_CHUNK];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn send_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
