// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job definitions: the registered, per-`type` policy the scheduler executes
//! jobs against. See spec §3 ("Job Definition") and §4.1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use abp_cancel::CancellationToken;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::job::{Priority, RunningContext};

/// How a job's retry classifier categorizes a run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The run may be retried, subject to `maxAttempts`.
    Retryable,
    /// The run must not be retried; the job terminalizes as `failed`.
    Fatal,
}

/// Dedupe policy applied when an `Enqueue` collides with an existing
/// non-terminal job sharing `(type, dedupeKey)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeMode {
    /// Return the existing job; never create a second one.
    SingleFlight,
    /// Same observable behavior as `SingleFlight` at the `Enqueue` boundary;
    /// kept distinct because some definitions want to log the two cases
    /// differently.
    DropDuplicate,
    /// Like `SingleFlight`, but if the existing job is still `queued`, call
    /// `merge` and store its result as the job's new payload.
    MergeDuplicate,
    /// Dedupe is disabled; every `Enqueue` creates a new job.
    None,
}

/// Progress update emitted by a running job via [`RunContext::emit_progress`].
pub type Progress = Value;

/// Signals delivered out-of-band from a running job back to the scheduler.
#[derive(Debug, Clone)]
pub enum RunSignal {
    /// The job has learned its `(threadId, turnId)`; stored on the `Job`
    /// record so `interrupt_turn` cancellation can target it.
    RunningContext(RunningContext),
    /// A progress payload to surface via `orchestrator_job_progress`.
    Progress(Progress),
}

/// Context handed to [`JobRunner::run`] for a single attempt.
///
/// Carries identity, the cancellation signal, and narrow channels back to
/// the scheduler for `setRunningContext`/`emitProgress` side effects — `run`
/// never touches scheduler state directly.
#[derive(Clone)]
pub struct RunContext {
    /// The job's stable id.
    pub job_id: String,
    /// The job's `projectId`.
    pub project_id: String,
    /// The job's `sourceSessionId`, if any.
    pub source_session_id: Option<String>,
    /// 1-based attempt number this invocation represents.
    pub attempt: u32,
    /// Fires when the job is canceled, times out, or the scheduler stops.
    pub signal: CancellationToken,
    signal_tx: mpsc::UnboundedSender<RunSignal>,
}

impl RunContext {
    pub(crate) fn new(
        job_id: String,
        project_id: String,
        source_session_id: Option<String>,
        attempt: u32,
        signal: CancellationToken,
        signal_tx: mpsc::UnboundedSender<RunSignal>,
    ) -> Self {
        Self {
            job_id,
            project_id,
            source_session_id,
            attempt,
            signal,
            signal_tx,
        }
    }

    /// Record `(threadId, turnId)` on the job, for `interrupt_turn`
    /// cancellation. Safe to call multiple times; the latest call wins.
    pub fn set_running_context(&self, thread_id: impl Into<String>, turn_id: impl Into<String>) {
        let _ = self.signal_tx.send(RunSignal::RunningContext(RunningContext {
            thread_id: Some(thread_id.into()),
            turn_id: Some(turn_id.into()),
        }));
    }

    /// Emit a progress payload, surfaced as `orchestrator_job_progress`.
    pub fn emit_progress(&self, progress: impl Into<Progress>) {
        let _ = self.signal_tx.send(RunSignal::Progress(progress.into()));
    }
}

/// The unit of work a [`JobDefinition`] executes. Implemented for any async
/// closure of matching shape via the blanket impl below.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Execute one attempt. Errors are plain strings, per spec §7 ("any
    /// string returned by a handler's run error, preserved verbatim").
    async fn run(&self, ctx: RunContext, payload: Value) -> Result<Value, String>;
}

#[async_trait]
impl<F, Fut> JobRunner for F
where
    F: Fn(RunContext, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
{
    async fn run(&self, ctx: RunContext, payload: Value) -> Result<Value, String> {
        (self)(ctx, payload).await
    }
}

/// Dedupe configuration for a [`JobDefinition`].
pub struct DedupeConfig {
    /// Computes the dedupe key for a payload, or `None` if this payload
    /// should never be deduped.
    pub key: Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>,
    /// Which policy applies when a collision is found.
    pub mode: DedupeMode,
    /// Required when `mode == MergeDuplicate`: combines the existing job's
    /// stored payload with the incoming one.
    pub merge: Option<Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>>,
}

impl DedupeConfig {
    /// Dedupe disabled: every enqueue creates a new job.
    pub fn disabled() -> Self {
        Self {
            key: Arc::new(|_| None),
            mode: DedupeMode::None,
            merge: None,
        }
    }
}

/// Retry configuration for a [`JobDefinition`].
pub struct RetryConfig {
    /// Maximum attempts (first attempt counts as attempt 1).
    pub max_attempts: u32,
    /// Classifies a run error as retryable or fatal.
    pub classify: Arc<dyn Fn(&str) -> Classification + Send + Sync>,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Ceiling applied to the computed backoff delay.
    pub max_delay: Duration,
    /// Whether to jitter the computed delay uniformly in `[0.5, 1.5)`.
    pub jitter: bool,
    /// Overrides the exponential-backoff formula with a custom function of
    /// the 1-based attempt number just completed.
    pub delay_for_attempt: Option<Arc<dyn Fn(u32) -> Duration + Send + Sync>>,
}

impl RetryConfig {
    /// A single attempt with no retries; any error is effectively fatal.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            classify: Arc::new(|_| Classification::Fatal),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: false,
            delay_for_attempt: None,
        }
    }

    /// Computes the backoff delay after `attempts` completed attempts,
    /// per spec §4.1: `delayForAttempt` if provided, else
    /// `min(maxDelayMs, baseDelayMs * 2^(attempts-1))`, optionally jittered.
    pub fn delay_after(&self, attempts: u32, jitter_sample: f64) -> Duration {
        let base = if let Some(f) = &self.delay_for_attempt {
            f(attempts)
        } else {
            let exp = attempts.saturating_sub(1).min(32) as i32;
            let factor = 2f64.powi(exp);
            let scaled = self.base_delay.as_secs_f64() * factor;
            Duration::from_secs_f64(scaled).min(self.max_delay)
        };
        if self.jitter {
            let factor = 0.5 + jitter_sample.clamp(0.0, 1.0);
            Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
        } else {
            base
        }
    }
}

/// Cancellation strategy for a [`JobDefinition`]'s running jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStrategy {
    /// Signal the cancellation token and additionally invoke the
    /// `InterruptTurn` hook using the job's recorded `runningContext`.
    InterruptTurn,
    /// Signal the cancellation token only; rely on `run` to observe it.
    MarkCanceled,
}

/// Cancellation configuration for a [`JobDefinition`].
#[derive(Debug, Clone, Copy)]
pub struct CancelConfig {
    /// Which strategy `Cancel` uses for running jobs of this type.
    pub strategy: CancelStrategy,
    /// How long the scheduler waits for cooperative completion before
    /// force-marking the job canceled.
    pub graceful_wait: Duration,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            strategy: CancelStrategy::MarkCanceled,
            graceful_wait: Duration::from_millis(2_000),
        }
    }
}

/// Optional lifecycle callbacks a [`JobDefinition`] may supply.
#[derive(Default)]
pub struct LifecycleHooks {
    pub on_queued: Option<Arc<dyn Fn(&crate::job::Job) + Send + Sync>>,
    pub on_started: Option<Arc<dyn Fn(&crate::job::Job) + Send + Sync>>,
    pub on_completed: Option<Arc<dyn Fn(&crate::job::Job) + Send + Sync>>,
    pub on_failed: Option<Arc<dyn Fn(&crate::job::Job) + Send + Sync>>,
    pub on_canceled: Option<Arc<dyn Fn(&crate::job::Job) + Send + Sync>>,
}

/// A registered job type's full policy: schemas, dedupe, retry, cancel,
/// timeout, and the runner itself. See spec §3.
pub struct JobDefinition {
    /// The `type` this definition is registered under.
    pub type_name: String,
    /// Policy version; stamped onto every `Job` created from it.
    pub version: u32,
    /// Default scheduling priority for jobs of this type.
    pub priority: Priority,
    /// Structural validator for `payload`, if any.
    pub payload_schema: Option<Value>,
    /// Structural validator for `result`, if any.
    pub result_schema: Option<Value>,
    /// Dedupe policy.
    pub dedupe: DedupeConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Per-attempt wall-clock timeout, if any.
    pub timeout: Option<Duration>,
    /// Cancellation policy.
    pub cancel: CancelConfig,
    /// The work itself.
    pub runner: Arc<dyn JobRunner>,
    /// Optional lifecycle callbacks.
    pub hooks: LifecycleHooks,
}

impl JobDefinition {
    /// Validate a payload against `payload_schema`, if one is set.
    pub fn validate_payload(&self, payload: &Value) -> Result<(), String> {
        validate_against(&self.payload_schema, payload)
    }

    /// Validate a result against `result_schema`, if one is set.
    pub fn validate_result(&self, result: &Value) -> Result<(), String> {
        validate_against(&self.result_schema, result)
    }
}

fn validate_against(schema: &Option<Value>, instance: &Value) -> Result<(), String> {
    let Some(schema) = schema else {
        return Ok(());
    };
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    let errors: Vec<String> = validator.iter_errors(instance).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Registry of [`JobDefinition`]s keyed by `type`. Only one version — the
/// latest registered — is active for dispatch at a time, per SPEC_FULL.md.
#[derive(Default)]
pub struct JobDefinitionRegistry {
    definitions: HashMap<String, Arc<JobDefinition>>,
}

impl JobDefinitionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the definition for `definition.type_name`.
    pub fn register(&mut self, definition: JobDefinition) {
        self.definitions
            .insert(definition.type_name.clone(), Arc::new(definition));
    }

    /// Look up the active definition for a job type.
    pub fn get(&self, type_name: &str) -> Option<Arc<JobDefinition>> {
        self.definitions.get(type_name).cloned()
    }

    /// All registered type names.
    pub fn type_names(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_until_capped() {
        let cfg = RetryConfig {
            max_attempts: 10,
            classify: Arc::new(|_| Classification::Retryable),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: false,
            delay_for_attempt: None,
        };
        assert_eq!(cfg.delay_after(1, 0.0), Duration::from_millis(100));
        assert_eq!(cfg.delay_after(2, 0.0), Duration::from_millis(200));
        assert_eq!(cfg.delay_after(3, 0.0), Duration::from_millis(400));
        assert_eq!(cfg.delay_after(10, 0.0), Duration::from_millis(1000));
    }

    #[test]
    fn retry_delay_custom_override_wins() {
        let cfg = RetryConfig {
            max_attempts: 5,
            classify: Arc::new(|_| Classification::Retryable),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: false,
            delay_for_attempt: Some(Arc::new(|attempt| Duration::from_millis(attempt as u64 * 10))),
        };
        assert_eq!(cfg.delay_after(3, 0.0), Duration::from_millis(30));
    }

    #[test]
    fn retry_delay_jitter_stays_in_bounds() {
        let cfg = RetryConfig {
            max_attempts: 5,
            classify: Arc::new(|_| Classification::Retryable),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: true,
            delay_for_attempt: None,
        };
        let low = cfg.delay_after(1, 0.0);
        let high = cfg.delay_after(1, 1.0);
        assert!(low >= Duration::from_millis(50));
        assert!(high <= Duration::from_millis(150));
    }

    #[test]
    fn payload_schema_rejects_invalid_instance() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["key"],
            "properties": { "key": { "type": "string" } }
        });
        let def = JobDefinition {
            type_name: "t".into(),
            version: 1,
            priority: Priority::Interactive,
            payload_schema: Some(schema),
            result_schema: None,
            dedupe: DedupeConfig::disabled(),
            retry: RetryConfig::none(),
            timeout: None,
            cancel: CancelConfig::default(),
            runner: Arc::new(|_ctx: RunContext, _payload: Value| async { Ok(Value::Null) }),
            hooks: LifecycleHooks::default(),
        };
        assert!(def.validate_payload(&serde_json::json!({"key": "x"})).is_ok());
        assert!(def.validate_payload(&serde_json::json!({})).is_err());
    }
}
