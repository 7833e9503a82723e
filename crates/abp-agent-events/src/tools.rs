// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `tools` interface handlers are invoked with, per spec §6
//! ("Tools interface consumed by Agent-Event handlers") and §9's
//! "per-invocation context object whose lifetime ends at handler
//! settlement" design note.

use std::sync::Arc;

use abp_cancel::CancellationToken;
use abp_queue::{EnqueueOutcome, EnqueueRequest, Job, QueueResult};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::event::{EnqueueResult, EnqueueResultStatus};

/// Input to [`EnqueueJob::enqueue_job`], mirroring
/// `abp_queue::EnqueueRequest`.
#[derive(Debug, Clone)]
pub struct EnqueueJobInput {
    /// Names a registered job definition.
    pub job_type: String,
    /// Tenant/partition key.
    pub project_id: String,
    /// Optional origin session.
    pub source_session_id: Option<String>,
    /// Validated against the definition's payload schema.
    pub payload: Value,
}

impl From<EnqueueJobInput> for EnqueueRequest {
    fn from(input: EnqueueJobInput) -> Self {
        Self {
            job_type: input.job_type,
            project_id: input.project_id,
            source_session_id: input.source_session_id,
            payload: input.payload,
        }
    }
}

/// The `enqueueJob` capability injected into handlers, delegating to the
/// scheduler's `Enqueue`. Implemented directly by `abp_queue::Scheduler`
/// via the blanket impl below; tests may supply a fake.
#[async_trait]
pub trait EnqueueJob: Send + Sync {
    /// Enqueue a job on behalf of a handler. `guard` is the handler's
    /// post-timeout cancellation token; implementations that delegate to a
    /// durable commit should check it immediately before admitting the job,
    /// so a guard that fires mid-call still prevents the side effect.
    async fn enqueue_job(
        &self,
        input: EnqueueJobInput,
        guard: &CancellationToken,
    ) -> Result<EnqueueOutcome, String>;
}

#[async_trait]
impl EnqueueJob for abp_queue::Scheduler {
    async fn enqueue_job(
        &self,
        input: EnqueueJobInput,
        guard: &CancellationToken,
    ) -> Result<EnqueueOutcome, String> {
        let result: QueueResult<EnqueueOutcome> =
            self.enqueue_cancelable(input.into(), Some(guard)).await;
        result.map_err(|e| e.to_string())
    }
}

/// `logger.{debug,info,warn,error}`, per spec §6. The default
/// [`TracingLogger`] forwards to `tracing` under the `abp.agent_events`
/// target, matching every other crate's logging convention.
pub trait Logger: Send + Sync {
    /// Log at debug level.
    fn debug(&self, message: &str, fields: &Value);
    /// Log at info level.
    fn info(&self, message: &str, fields: &Value);
    /// Log at warn level.
    fn warn(&self, message: &str, fields: &Value);
    /// Log at error level.
    fn error(&self, message: &str, fields: &Value);
}

/// Default [`Logger`] forwarding to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str, fields: &Value) {
        debug!(target: "abp.agent_events", %fields, "{message}");
    }

    fn info(&self, message: &str, fields: &Value) {
        info!(target: "abp.agent_events", %fields, "{message}");
    }

    fn warn(&self, message: &str, fields: &Value) {
        warn!(target: "abp.agent_events", %fields, "{message}");
    }

    fn error(&self, message: &str, fields: &Value) {
        error!(target: "abp.agent_events", %fields, "{message}");
    }
}

/// The error message every `tools` call returns once its handler's guard
/// has fired — spec §4.2 step 2's "injected forbidden-after-timeout error".
pub const FORBIDDEN_AFTER_TIMEOUT: &str = "forbidden-after-timeout";

/// `tools` as handed to one handler invocation: `enqueueJob` + `logger`,
/// wrapped with a post-timeout guard per spec §9.
///
/// Cheaply cloneable — every clone shares the same guard, so cancelling
/// the guard (fired by the runtime the instant this handler's timeout
/// elapses) is observed by every outstanding clone, including one held by
/// a detached, still-running handler task.
#[derive(Clone)]
pub struct Tools {
    enqueue: Arc<dyn EnqueueJob>,
    logger: Arc<dyn Logger>,
    guard: CancellationToken,
    module_name: Arc<str>,
}

impl Tools {
    /// Construct a `tools` bundle guarded by `guard`. The runtime cancels
    /// `guard` exactly when this handler's effective timeout elapses.
    /// `module_name` is stamped onto every [`EnqueueResult`] this bundle
    /// produces.
    pub fn new(
        enqueue: Arc<dyn EnqueueJob>,
        logger: Arc<dyn Logger>,
        guard: CancellationToken,
        module_name: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            enqueue,
            logger,
            guard,
            module_name: module_name.into(),
        }
    }

    /// Build a `tools` bundle with the default [`TracingLogger`].
    pub fn with_default_logger(
        enqueue: Arc<dyn EnqueueJob>,
        guard: CancellationToken,
        module_name: impl Into<Arc<str>>,
    ) -> Self {
        Self::new(enqueue, Arc::new(TracingLogger), guard, module_name)
    }

    /// Enqueue a job, per spec's `enqueueJob(input) → {status, job}`.
    ///
    /// Returns `Err(FORBIDDEN_AFTER_TIMEOUT)` without enqueueing anything
    /// if this handler's timeout has already fired, or fires while this
    /// call is in flight — the capability-denied guard described in spec
    /// §4.2 step 2 and §9. The delegate call is raced against the guard
    /// with `select!` rather than checked only before and after, since the
    /// guard can flip while the delegate is suspended (e.g. during the
    /// scheduler's snapshot persistence); the delegate itself also checks
    /// the guard immediately before its commit point, so losing the race
    /// here still leaves the commit covered.
    pub async fn enqueue_job(&self, input: EnqueueJobInput) -> Result<EnqueueResult, String> {
        if self.guard.is_cancelled() {
            return Err(FORBIDDEN_AFTER_TIMEOUT.to_string());
        }
        let outcome = tokio::select! {
            biased;
            _ = self.guard.cancelled() => return Err(FORBIDDEN_AFTER_TIMEOUT.to_string()),
            result = self.enqueue.enqueue_job(input, &self.guard) => result?,
        };
        Ok(self.enqueue_result_of(outcome))
    }

    /// Access the injected logger.
    #[must_use]
    pub fn logger(&self) -> &dyn Logger {
        self.logger.as_ref()
    }

    /// The name of the module this `tools` instance was handed to.
    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    fn enqueue_result_of(&self, outcome: EnqueueOutcome) -> EnqueueResult {
        let status = match outcome.status {
            abp_queue::EnqueueStatus::Enqueued => EnqueueResultStatus::Enqueued,
            abp_queue::EnqueueStatus::AlreadyQueued => EnqueueResultStatus::AlreadyQueued,
        };
        EnqueueResult {
            module_name: self.module_name.to_string(),
            status,
            job: outcome.job,
        }
    }
}

/// Unused directly; kept so `Job` stays a visible, intentional re-export
/// surface for handler implementations that want to inspect the returned
/// job without importing `abp-queue` themselves.
pub type EnqueuedJob = Job;
