//! Sandbox security policy.
//!
//! The policy is an input applied at guest-process creation. The bundled
//! process launcher applies what a plain child process supports (clean
//! environment, working directory); container-based launchers translate the
//! remaining knobs into their runtime's options.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Resource and isolation limits for a sandbox process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Memory limit, e.g. "512m".
    pub memory_limit: String,
    /// CPU count available to the sandbox.
    pub cpu_count: u32,
    /// Mount the root filesystem read-only.
    pub read_only_root: bool,
    /// Disallow privilege escalation.
    pub no_new_privileges: bool,
    /// Capabilities to drop ("ALL" drops everything).
    pub cap_drop: Vec<String>,
    /// Disable network access entirely.
    pub network_disabled: bool,
    /// Working directory for the guest process.
    pub working_dir: Option<PathBuf>,
    /// Environment variables passed through to the guest. The environment
    /// is cleared first; only these reach the sandbox.
    pub env: HashMap<String, String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            memory_limit: "512m".to_string(),
            cpu_count: 1,
            read_only_root: true,
            no_new_privileges: true,
            cap_drop: vec!["ALL".to_string()],
            network_disabled: true,
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

impl SecurityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = limit.into();
        self
    }

    pub fn with_cpu_count(mut self, count: u32) -> Self {
        self.cpu_count = count;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_disabled = !enabled;
        self
    }
}
