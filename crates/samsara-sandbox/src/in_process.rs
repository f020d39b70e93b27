//! In-process sandbox: the real guest runner on a dedicated thread.
//!
//! Runs the same command loop as the `samsara-runner` binary, connected by
//! channel-backed streams instead of process stdio. Provides no isolation;
//! meant for tests and hosts that embed the runtime without a sandbox
//! boundary.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SandboxError;
use crate::executor::{ExecutorFactory, SandboxExecutor};
use crate::runner::Runner;
use crate::transport::Transport;

/// Sync reader over a byte-chunk channel (guest side).
struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl std::io::Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Sync writer over a byte-chunk channel (guest side).
struct ChannelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "host gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Host-side transport paired with a guest thread.
pub struct InProcessTransport {
    to_guest: Option<mpsc::UnboundedSender<Vec<u8>>>,
    from_guest: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl InProcessTransport {
    /// Spawn the real runner loop on a thread and return the host transport.
    pub fn spawn() -> Self {
        let (host_tx, guest_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (guest_tx, host_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        std::thread::spawn(move || {
            let reader = ChannelReader {
                rx: guest_rx,
                pending: Vec::new(),
            };
            let writer = ChannelWriter { tx: guest_tx };
            let _ = Runner::new(reader, writer).run();
        });

        Self {
            to_guest: Some(host_tx),
            from_guest: host_rx,
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        // A closed channel means the guest thread exited.
        Ok(self.from_guest.recv().await.unwrap_or_default())
    }

    async fn send_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &self.to_guest {
            Some(tx) if tx.send(data.to_vec()).is_ok() => Ok(()),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "guest thread gone",
            )),
        }
    }

    async fn shutdown(&mut self) {
        // Dropping the sender makes the guest's stdin read return EOF,
        // ending its loop.
        self.to_guest = None;
    }
}

/// Factory producing in-process executors.
#[derive(Debug, Default, Clone)]
pub struct InProcessFactory;

impl InProcessFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> Arc<dyn ExecutorFactory> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ExecutorFactory for InProcessFactory {
    async fn create(&self) -> Result<SandboxExecutor, SandboxError> {
        let mut executor = SandboxExecutor::new(Box::new(InProcessTransport::spawn()));
        executor.ping().await?;
        Ok(executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_in_process_ping_and_execute() {
        let factory = InProcessFactory::new();
        let mut executor = factory.create().await.unwrap();

        let outcome = executor.execute("print(2 + 3)", T).await;
        assert!(outcome.is_ok(), "{:?}", outcome.error);
        assert_eq!(outcome.stdout, "5\n");
        executor.stop().await;
    }

    #[tokio::test]
    async fn test_in_process_setup_and_final() {
        let factory = InProcessFactory::new();
        let mut executor = factory.create().await.unwrap();

        executor
            .setup_context(&["Hello world.".to_string()])
            .await
            .unwrap();
        let outcome = executor.execute("FINAL(context[0])", T).await;
        assert_eq!(outcome.final_answer.as_deref(), Some("Hello world."));
        executor.stop().await;
    }

    #[tokio::test]
    async fn test_in_process_namespace_reset() {
        let factory = InProcessFactory::new();
        let mut executor = factory.create().await.unwrap();

        let outcome = executor.execute("x = 7", T).await;
        assert!(outcome.is_ok());
        executor.reset_namespace().await.unwrap();

        let outcome = executor.execute("print(x)", T).await;
        assert!(!outcome.is_ok());
        assert!(outcome.error.unwrap().contains("undefined name"));
        executor.stop().await;
    }
}
