// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the orchestration core.
//!
//! This crate provides [`OrchestratorConfig`] — the top-level runtime
//! settings loaded from `orchestrator.toml` — together with helpers for
//! loading from a file, merging overlays, and producing advisory
//! [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

impl From<ConfigError> for abp_error::AbpError {
    fn from(err: ConfigError) -> Self {
        let kind = match &err {
            ConfigError::FileNotFound { .. } => "file_not_found",
            ConfigError::ParseError { .. } => "parse_error",
            ConfigError::ValidationError { .. } => "validation_error",
        };
        let message = err.to_string();
        abp_error::AbpError::new(abp_error::ErrorCode::ConfigInvalid, message)
            .with_context("kind", kind)
    }
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A backend/supervisor/handler timeout is unusually large.
    LargeTimeout {
        /// The setting name (e.g. `"supervisor.rpc_timeout_ms"`).
        field: String,
        /// Timeout value in milliseconds.
        ms: u64,
    },
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeTimeout { field, ms } => {
                write!(f, "'{field}' has an unusually large timeout ({ms}ms)")
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the orchestration core, loaded from
/// `orchestrator.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`). Consumed by
    /// the daemon's `tracing-subscriber` init, not by this crate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Job Queue/Scheduler settings (§4.1).
    pub queue: QueueSettings,
    /// Runtime-Process Supervisor settings (§4.3).
    pub supervisor: SupervisorSettings,
    /// Agent Events Runtime settings (§4.2).
    pub agent_events: AgentEventsSettings,
    /// Extension Reload Audit Store settings (§4.4).
    pub audit: AuditSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".into()),
            queue: QueueSettings::default(),
            supervisor: SupervisorSettings::default(),
            agent_events: AgentEventsSettings::default(),
            audit: AuditSettings::default(),
        }
    }
}

/// Capacity limits, concurrency, timeouts, and the snapshot path for the
/// job queue/scheduler.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum number of jobs the scheduler runs concurrently across every
    /// project.
    pub global_concurrency: u32,
    /// Maximum non-terminal jobs allowed per project.
    pub max_per_project: u32,
    /// Maximum non-terminal jobs allowed globally.
    pub max_global: u32,
    /// Default per-job timeout in milliseconds, used when a job definition
    /// does not set its own.
    pub default_job_timeout_ms: u64,
    /// Background-priority anti-starvation aging window in milliseconds.
    pub background_aging_ms: u64,
    /// Maximum consecutive interactive-priority dispatches before a
    /// sufficiently aged background job is allowed to preempt.
    pub max_interactive_burst: u32,
    /// How long `Stop` waits for running jobs to drain before returning, in
    /// milliseconds.
    pub stop_drain_ms: u64,
    /// Path to the queue's snapshot file.
    pub snapshot_path: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            global_concurrency: 8,
            max_per_project: 100,
            max_global: 10_000,
            default_job_timeout_ms: 60_000,
            background_aging_ms: 15_000,
            max_interactive_burst: 3,
            stop_drain_ms: 2_000,
            snapshot_path: "orchestrator-jobs.json".into(),
        }
    }
}

/// The supervised runtime process's spawn command and RPC/handshake
/// timeouts.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Executable command to spawn. Empty means no child process is
    /// supervised (a degenerate but valid deployment for testing the queue
    /// and agent-events runtime alone).
    pub command: String,
    /// Arguments passed to the command.
    pub args: Vec<String>,
    /// Default per-call RPC timeout in milliseconds, per §5 (120000ms).
    pub rpc_timeout_ms: u64,
    /// How long `Stop` waits for the child to exit on its own before a
    /// forced kill, in milliseconds.
    pub stop_grace_ms: u64,
    /// Timeout for the `initialize` handshake call, in milliseconds.
    pub handshake_timeout_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            rpc_timeout_ms: 120_000,
            stop_grace_ms: 2_000,
            handshake_timeout_ms: 30_000,
        }
    }
}

/// Which trust policy governs extension loading, mirrored here (rather
/// than depending on `abp-agent-events` for it) so this crate's wire shape
/// stays independent of the runtime crate's internal enum; `abp-daemon`
/// converts at the boundary.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustModeSetting {
    /// No capability checks are performed.
    Disabled,
    /// Violations are recorded as warnings; the module still loads.
    Warn,
    /// Violations are recorded as errors; the module is denied.
    Enforced,
}

impl Default for TrustModeSetting {
    fn default() -> Self {
        Self::Enforced
    }
}

/// Where extension modules are discovered and under which trust policy.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct AgentEventsSettings {
    /// Root directory extension modules are installed under.
    pub agents_root: String,
    /// Additional extension source directories scanned alongside
    /// `agents_root`.
    pub extension_sources: Vec<String>,
    /// The active trust/capability gate policy.
    pub trust_mode: TrustModeSetting,
    /// Default per-handler timeout in milliseconds, used when a
    /// subscription does not set its own.
    pub default_handler_timeout_ms: u64,
}

impl Default for AgentEventsSettings {
    fn default() -> Self {
        Self {
            agents_root: "agents".into(),
            extension_sources: Vec::new(),
            trust_mode: TrustModeSetting::default(),
            default_handler_timeout_ms: 30_000,
        }
    }
}

/// Where the extension reload audit log is persisted.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct AuditSettings {
    /// Path to the append-only audit log file.
    pub audit_path: String,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            audit_path: "orchestrator-audit.log".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum allowed timeout in milliseconds (24 hours), applied to every
/// `*_timeout_ms`/`*_ms` setting.
const MAX_TIMEOUT_MS: u64 = 86_400_000;

/// Threshold above which a timeout generates a warning rather than an
/// error.
const LARGE_TIMEOUT_THRESHOLD_MS: u64 = 3_600_000;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load an [`OrchestratorConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`OrchestratorConfig::default()`].
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig, ConfigError> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)
        }
        None => Ok(OrchestratorConfig::default()),
    }
}

/// Parse a TOML string into an [`OrchestratorConfig`].
pub fn parse_toml(content: &str) -> Result<OrchestratorConfig, ConfigError> {
    toml::from_str::<OrchestratorConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (zero/out-of-range capacities or timeouts, an empty
/// `agents_root`) are returned as a [`ConfigError::ValidationError`]; soft
/// issues (unusually large timeouts, an unsupervised command) come back as
/// warnings.
pub fn validate_config(config: &OrchestratorConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(level) = &config.log_level {
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            errors.push(format!("invalid log_level '{level}'"));
        }
    }

    let q = &config.queue;
    if q.global_concurrency == 0 {
        errors.push("queue.global_concurrency must be at least 1".into());
    }
    if q.max_per_project == 0 {
        errors.push("queue.max_per_project must be at least 1".into());
    }
    if q.max_global == 0 {
        errors.push("queue.max_global must be at least 1".into());
    }
    if q.max_per_project > q.max_global {
        errors.push("queue.max_per_project must not exceed queue.max_global".into());
    }
    if q.snapshot_path.trim().is_empty() {
        errors.push("queue.snapshot_path must not be empty".into());
    }
    check_timeout(&mut errors, &mut warnings, "queue.default_job_timeout_ms", q.default_job_timeout_ms);
    check_timeout(&mut errors, &mut warnings, "queue.stop_drain_ms", q.stop_drain_ms);

    let s = &config.supervisor;
    if !s.command.trim().is_empty() {
        check_timeout(&mut errors, &mut warnings, "supervisor.rpc_timeout_ms", s.rpc_timeout_ms);
        check_timeout(&mut errors, &mut warnings, "supervisor.stop_grace_ms", s.stop_grace_ms);
        check_timeout(&mut errors, &mut warnings, "supervisor.handshake_timeout_ms", s.handshake_timeout_ms);
    } else {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "supervisor.command".into(),
            hint: "no runtime process will be supervised; agent handlers still run".into(),
        });
    }

    let ae = &config.agent_events;
    if ae.agents_root.trim().is_empty() {
        errors.push("agent_events.agents_root must not be empty".into());
    }
    check_timeout(
        &mut errors,
        &mut warnings,
        "agent_events.default_handler_timeout_ms",
        ae.default_handler_timeout_ms,
    );

    if config.audit.audit_path.trim().is_empty() {
        errors.push("audit.audit_path must not be empty".into());
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

fn check_timeout(errors: &mut Vec<String>, warnings: &mut Vec<ConfigWarning>, field: &str, ms: u64) {
    if ms == 0 || ms > MAX_TIMEOUT_MS {
        errors.push(format!(
            "{field} {ms}ms out of range (1..{MAX_TIMEOUT_MS})"
        ));
    } else if ms > LARGE_TIMEOUT_THRESHOLD_MS {
        warnings.push(ConfigWarning::LargeTimeout {
            field: field.to_string(),
            ms,
        });
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Non-default values in `overlay` take
/// precedence over `base`.
///
/// Since every field has a default, "non-default" is the merge signal:
/// an overlay that did not set a field (so it parsed to that field's
/// default) never clobbers a base value. This mirrors how `orchestrator.toml`
/// overlays (e.g. a per-environment file layered on a base file) are
/// expected to only specify what they override.
#[must_use]
pub fn merge_configs(base: OrchestratorConfig, overlay: OrchestratorConfig) -> OrchestratorConfig {
    let defaults = OrchestratorConfig::default();
    OrchestratorConfig {
        log_level: overlay.log_level.or(base.log_level),
        queue: QueueSettings {
            global_concurrency: pick(overlay.queue.global_concurrency, base.queue.global_concurrency, defaults.queue.global_concurrency),
            max_per_project: pick(overlay.queue.max_per_project, base.queue.max_per_project, defaults.queue.max_per_project),
            max_global: pick(overlay.queue.max_global, base.queue.max_global, defaults.queue.max_global),
            default_job_timeout_ms: pick(overlay.queue.default_job_timeout_ms, base.queue.default_job_timeout_ms, defaults.queue.default_job_timeout_ms),
            background_aging_ms: pick(overlay.queue.background_aging_ms, base.queue.background_aging_ms, defaults.queue.background_aging_ms),
            max_interactive_burst: pick(overlay.queue.max_interactive_burst, base.queue.max_interactive_burst, defaults.queue.max_interactive_burst),
            stop_drain_ms: pick(overlay.queue.stop_drain_ms, base.queue.stop_drain_ms, defaults.queue.stop_drain_ms),
            snapshot_path: pick_string(overlay.queue.snapshot_path, base.queue.snapshot_path, &defaults.queue.snapshot_path),
        },
        supervisor: SupervisorSettings {
            command: pick_string(overlay.supervisor.command, base.supervisor.command, &defaults.supervisor.command),
            args: if overlay.supervisor.args.is_empty() { base.supervisor.args } else { overlay.supervisor.args },
            rpc_timeout_ms: pick(overlay.supervisor.rpc_timeout_ms, base.supervisor.rpc_timeout_ms, defaults.supervisor.rpc_timeout_ms),
            stop_grace_ms: pick(overlay.supervisor.stop_grace_ms, base.supervisor.stop_grace_ms, defaults.supervisor.stop_grace_ms),
            handshake_timeout_ms: pick(overlay.supervisor.handshake_timeout_ms, base.supervisor.handshake_timeout_ms, defaults.supervisor.handshake_timeout_ms),
        },
        agent_events: AgentEventsSettings {
            agents_root: pick_string(overlay.agent_events.agents_root, base.agent_events.agents_root, &defaults.agent_events.agents_root),
            extension_sources: if overlay.agent_events.extension_sources.is_empty() {
                base.agent_events.extension_sources
            } else {
                overlay.agent_events.extension_sources
            },
            trust_mode: if overlay.agent_events.trust_mode == defaults.agent_events.trust_mode {
                base.agent_events.trust_mode
            } else {
                overlay.agent_events.trust_mode
            },
            default_handler_timeout_ms: pick(
                overlay.agent_events.default_handler_timeout_ms,
                base.agent_events.default_handler_timeout_ms,
                defaults.agent_events.default_handler_timeout_ms,
            ),
        },
        audit: AuditSettings {
            audit_path: pick_string(overlay.audit.audit_path, base.audit.audit_path, &defaults.audit.audit_path),
        },
    }
}

fn pick<T: PartialEq>(overlay: T, base: T, default: T) -> T {
    if overlay == default { base } else { overlay }
}

fn pick_string(overlay: String, base: String, default: &str) -> String {
    if overlay == default { base } else { overlay }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
