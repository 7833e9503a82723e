// SPDX-License-Identifier: MIT OR Apache-2.0
//! Spawn configuration and lifecycle status for the supervised child process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for spawning and talking to the supervised runtime process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Executable command to run.
    pub command: String,
    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Additional environment variables to set.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the process. Inherits the supervisor's own if
    /// unset.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Where to persist the child's stderr, line by line. If unset, stderr
    /// is only forwarded to the tracing log.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Default per-call timeout for [`crate::Supervisor::call`], used when a
    /// call site does not supply its own. Per §5, 120000ms.
    #[serde(with = "abp_serde_duration::duration_millis", default = "default_rpc_timeout")]
    pub rpc_timeout: Duration,
    /// How long [`crate::Supervisor::stop`] waits for the child to exit on
    /// its own (stdin closed) before a forced kill. Per §5, 2000ms.
    #[serde(with = "abp_serde_duration::duration_millis", default = "default_stop_grace")]
    pub stop_grace: Duration,
    /// If set, `start()` performs an `initialize`/`initialized` handshake
    /// with this client info before returning, per §4.3.
    #[serde(default)]
    pub handshake: Option<HandshakeConfig>,
}

/// Client info/capabilities sent as the `initialize` request's params, and
/// the timeout that request is bounded by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// `clientInfo.name` sent in the `initialize` request.
    pub client_name: String,
    /// `clientInfo.version` sent in the `initialize` request.
    pub client_version: String,
    /// Capabilities object sent in the `initialize` request.
    #[serde(default)]
    pub capabilities: serde_json::Value,
    /// Timeout for the `initialize` call itself.
    #[serde(with = "abp_serde_duration::duration_millis", default = "default_handshake_timeout")]
    pub timeout: Duration,
}

fn default_rpc_timeout() -> Duration {
    Duration::from_millis(120_000)
}

fn default_stop_grace() -> Duration {
    Duration::from_millis(2_000)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_millis(30_000)
}

impl SupervisorConfig {
    /// Create a config with the given command and otherwise-default
    /// timeouts/environment.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            log_path: None,
            rpc_timeout: default_rpc_timeout(),
            stop_grace: default_stop_grace(),
            handshake: None,
        }
    }
}

/// Why the child process last stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastExit {
    /// OS exit code, if the platform reported one.
    pub code: Option<i32>,
    /// Signal that terminated the process, if applicable (unix only).
    pub signal: Option<i32>,
    /// When the exit was observed.
    pub at: DateTime<Utc>,
}

/// Full status snapshot returned by [`crate::Supervisor::full_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    /// Whether the child is currently running.
    pub running: bool,
    /// OS process id, if running.
    pub pid: Option<u32>,
    /// Whether the `initialize`/`initialized` handshake has completed.
    pub initialized: bool,
    /// Details of the most recent exit, if the child has ever stopped.
    pub last_exit: Option<LastExit>,
}

/// Runtime status of the supervised process, mirrored by
/// [`crate::Supervisor::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessStatus {
    /// `start` has not been called yet.
    NotStarted,
    /// The process is running and able to accept calls/notifications.
    Running {
        /// OS process identifier.
        pid: u32,
    },
    /// `stop` was called and completed, whether by graceful exit or kill.
    Stopped,
    /// The process exited on its own (crash or unexpected termination).
    Crashed {
        /// Exit code, if the OS reported one.
        code: Option<i32>,
    },
}

impl ProcessStatus {
    /// Returns `true` if calls/notifications can currently be sent.
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running { .. })
    }
}
