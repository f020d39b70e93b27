//! Lease pool of prewarmed executors.
//!
//! The engine's contract: on normal completion the caller clears the
//! executor's handler, resets its namespace, and releases it. An executor
//! that fails reset must be stopped and discarded, never released.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::SandboxError;
use crate::executor::{ExecutorFactory, SandboxExecutor};

struct PoolState {
    idle: Vec<SandboxExecutor>,
    in_use: HashSet<u64>,
}

/// A pool of started, pristine executors.
pub struct ExecutorPool {
    factory: Arc<dyn ExecutorFactory>,
    state: Mutex<PoolState>,
}

impl ExecutorPool {
    pub fn new(factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                in_use: HashSet::new(),
            }),
        }
    }

    /// Prewarm the pool with `count` started executors.
    pub async fn warm(&self, count: usize) -> Result<(), SandboxError> {
        for _ in 0..count {
            let executor = self.factory.create().await?;
            self.state.lock().unwrap().idle.push(executor);
        }
        Ok(())
    }

    /// Lease a started executor, creating one when the idle set is empty.
    pub async fn acquire(&self) -> Result<SandboxExecutor, SandboxError> {
        let idle = {
            let mut state = self.state.lock().unwrap();
            let executor = state.idle.pop();
            if let Some(ref e) = executor {
                state.in_use.insert(e.id());
            }
            executor
        };
        if let Some(executor) = idle {
            return Ok(executor);
        }

        // Creation happens outside the lock; only bookkeeping is locked.
        let executor = self.factory.create().await?;
        self.state.lock().unwrap().in_use.insert(executor.id());
        Ok(executor)
    }

    /// Return a leased executor to the idle set.
    ///
    /// The caller must have reset its namespace first.
    pub fn release(&self, executor: SandboxExecutor) {
        let mut state = self.state.lock().unwrap();
        state.in_use.remove(&executor.id());
        state.idle.push(executor);
    }

    /// Forget a leased executor without reusing it.
    ///
    /// Safe for executors the pool does not know: the executor is dropped
    /// either way (its transport kills the guest process on drop).
    pub fn discard(&self, executor: SandboxExecutor) {
        let mut state = self.state.lock().unwrap();
        state.in_use.remove(&executor.id());
        drop(executor);
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.state.lock().unwrap().in_use.len()
    }
}
