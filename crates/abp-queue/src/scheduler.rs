// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Scheduler: the single-writer job table, its dispatch loop, and its
//! public contract, per spec §4.1 and §5.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use abp_cancel::CancellationToken;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::definition::{
    CancelStrategy, Classification, DedupeMode, JobDefinition, JobDefinitionRegistry, RunContext,
    RunSignal,
};
use crate::error::{QueueError, QueueResult};
use crate::hooks::{Hooks, OrchestratorEvent, OrchestratorEventType};
use crate::job::{Job, JobState, Priority, RunningContext};
use crate::persist::{self, QueueSnapshot};

/// Tunable limits and timeouts for a [`Scheduler`], per spec §5.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Where the job table is persisted.
    pub snapshot_path: PathBuf,
    /// Maximum non-terminal jobs dispatched (running) at once.
    pub global_concurrency: usize,
    /// Maximum non-terminal jobs per `projectId`.
    pub max_per_project: usize,
    /// Maximum non-terminal jobs across all projects.
    pub max_global: usize,
    /// Default per-job timeout when a definition does not set one.
    pub default_job_timeout: Duration,
    /// How old (by `createdAt`) a queued background job must be before the
    /// anti-starvation policy prefers it over further interactive dispatch.
    pub background_aging: Duration,
    /// How many consecutive interactive dispatches are allowed before the
    /// next dispatch must prefer the oldest eligible background job.
    pub max_interactive_burst: u32,
    /// Default drain window for `Stop`.
    pub stop_drain: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("orchestrator-jobs.json"),
            global_concurrency: 8,
            max_per_project: 100,
            max_global: 10_000,
            default_job_timeout: Duration::from_millis(60_000),
            background_aging: Duration::from_millis(15_000),
            max_interactive_burst: 3,
            stop_drain: Duration::from_millis(2_000),
        }
    }
}

/// A request to enqueue one job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Names a registered [`JobDefinition`].
    pub job_type: String,
    /// Tenant/partition key.
    pub project_id: String,
    /// Optional origin session.
    pub source_session_id: Option<String>,
    /// Validated against the definition's payload schema.
    pub payload: Value,
}

/// Whether `Enqueue` created a new job or found an existing dedupe peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueStatus {
    Enqueued,
    AlreadyQueued,
}

/// Result of [`Scheduler::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    /// Whether a new job was created or an existing dedupe peer was found.
    pub status: EnqueueStatus,
    /// The job: freshly created, or the existing dedupe peer.
    pub job: Job,
}

/// Result of [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    Canceled,
    AlreadyTerminal,
    NotFound,
}

/// Result of [`Scheduler::cancel`].
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// The outcome classification.
    pub status: CancelStatus,
    /// The job's state after the cancel attempt, if it was found.
    pub job: Option<Job>,
}

/// Pure-read statistics, per spec §4.1.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Jobs currently `queued`.
    pub queued: u64,
    /// Jobs currently `running`.
    pub running: u64,
    /// Count of jobs in each state.
    pub total_by_state: HashMap<JobState, u64>,
    /// Count of jobs per registered job type.
    pub by_type: HashMap<String, u64>,
}

struct JobEntry {
    job: Job,
    seq: u64,
}

struct RunningHandle {
    cancel: CancellationToken,
    definition_type: String,
}

struct Inner {
    jobs: HashMap<String, JobEntry>,
    dedupe_index: HashMap<(String, String), String>,
    running: HashMap<String, RunningHandle>,
    consecutive_interactive: u32,
    accepting: bool,
    /// The reason string passed to `Cancel` for a job still `running`;
    /// consumed by `settle` so a cooperative exit still terminalizes as
    /// `canceled` rather than running the normal retry/fail classification.
    cancel_reasons: HashMap<String, String>,
}

impl Inner {
    fn non_terminal_count(&self) -> usize {
        self.jobs.values().filter(|e| e.job.is_active()).count()
    }

    fn non_terminal_count_for_project(&self, project_id: &str) -> usize {
        self.jobs
            .values()
            .filter(|e| e.job.is_active() && e.job.project_id == project_id)
            .count()
    }
}

/// A scheduling candidate: the subset of a queued [`Job`] the selection
/// algorithm needs. Kept separate from `Job` so the algorithm is a pure,
/// independently testable function.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub id: String,
    pub priority: Priority,
    pub seq: u64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Selects the next job id to dispatch, applying the priority/fairness and
/// anti-starvation aging policy of spec §4.1. Returns `None` if nothing is
/// currently eligible.
///
/// The aging threshold is compared with strict `>`, not `≥`: a
/// `background_aging` of zero relies on the consecutive-burst cap to avoid
/// starving interactive work at the very instant a background job is
/// created, rather than preferring background unconditionally from tick
/// one. See `DESIGN.md` for the worked scenario this resolves.
pub(crate) fn select_next(
    candidates: &[Candidate],
    consecutive_interactive: u32,
    background_aging: Duration,
    max_interactive_burst: u32,
    now: DateTime<Utc>,
) -> Option<String> {
    let eligible = |c: &&Candidate| c.next_attempt_at.is_none_or(|t| t <= now);

    let mut backgrounds: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.priority == Priority::Background)
        .filter(eligible)
        .collect();
    backgrounds.sort_by_key(|c| c.seq);

    let mut interactives: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.priority == Priority::Interactive)
        .filter(eligible)
        .collect();
    interactives.sort_by_key(|c| c.seq);

    let oldest_background = backgrounds.first().copied();

    let aging_exceeded = oldest_background.is_some_and(|bg| {
        let age = now.signed_duration_since(bg.created_at);
        age > chrono::Duration::from_std(background_aging).unwrap_or(chrono::Duration::zero())
    });
    let burst_exhausted = consecutive_interactive >= max_interactive_burst;

    if (aging_exceeded || burst_exhausted) && oldest_background.is_some() {
        return oldest_background.map(|c| c.id.clone());
    }

    if let Some(it) = interactives.first() {
        return Some(it.id.clone());
    }

    oldest_background.map(|c| c.id.clone())
}

/// Owns the in-memory job table and the snapshot file. The sole mutator of
/// job state; every other component reads via returned values only.
pub struct Scheduler {
    state: Mutex<Inner>,
    definitions: Arc<JobDefinitionRegistry>,
    hooks: Arc<dyn Hooks>,
    config: SchedulerConfig,
    dispatch_notify: Notify,
    terminal_notify: Notify,
    seq_next: AtomicU64,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Construct a scheduler. Does not touch disk or begin dispatching
    /// until [`start`](Self::start) is called.
    pub fn new(
        definitions: JobDefinitionRegistry,
        hooks: Arc<dyn Hooks>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Inner {
                jobs: HashMap::new(),
                dedupe_index: HashMap::new(),
                running: HashMap::new(),
                consecutive_interactive: 0,
                accepting: true,
                cancel_reasons: HashMap::new(),
            }),
            definitions: Arc::new(definitions),
            hooks,
            config,
            dispatch_notify: Notify::new(),
            terminal_notify: Notify::new(),
            seq_next: AtomicU64::new(0),
            dispatch_task: Mutex::new(None),
        })
    }

    /// Performs crash recovery over the persisted snapshot, then begins the
    /// dispatch loop. Per spec §4.1: any job found `running` is reset to
    /// `queued` (if attempts remain) or `failed` with
    /// `"recovery_max_attempts_exceeded"` (otherwise); `runningContext` is
    /// cleared.
    pub async fn start(self: &Arc<Self>) -> QueueResult<()> {
        let snapshot = persist::load(&self.config.snapshot_path)
            .await
            .map_err(QueueError::SnapshotIo)?;

        {
            let mut inner = self.state.lock().await;
            for mut job in snapshot.jobs {
                if job.state == JobState::Running {
                    job.running_context = None;
                    if job.attempts < job.max_attempts {
                        job.state = JobState::Queued;
                        job.started_at = None;
                    } else {
                        job.state = JobState::Failed;
                        job.error = Some("recovery_max_attempts_exceeded".to_string());
                        job.completed_at = Some(Utc::now());
                    }
                }
                let seq = self.seq_next.fetch_add(1, Ordering::SeqCst);
                if let Some(key) = job.dedupe_key.clone() {
                    if job.is_active() {
                        self_index_insert(&mut inner.dedupe_index, &job.job_type, &key, &job.id);
                    }
                }
                inner.jobs.insert(job.id.clone(), JobEntry { job, seq });
            }
            inner.accepting = true;
            self.persist_locked(&inner).await;
        }

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.dispatch_loop().await });
        *self.dispatch_task.lock().await = Some(handle);
        self.dispatch_notify.notify_one();
        Ok(())
    }

    /// `Enqueue` per spec §4.1.
    pub async fn enqueue(&self, req: EnqueueRequest) -> QueueResult<EnqueueOutcome> {
        self.enqueue_cancelable(req, None).await
    }

    /// Same as [`Self::enqueue`], but checks `guard` immediately before the
    /// commit point (in-memory admission of the job, ahead of the persist
    /// that follows) so a caller racing its own cancellation against this
    /// call can stop the enqueue side effect, not just discard the result
    /// it gets back. Used by `abp-agent-events`' `tools.enqueueJob`, whose
    /// guard fires the instant a handler's timeout elapses.
    pub async fn enqueue_cancelable(
        &self,
        req: EnqueueRequest,
        guard: Option<&CancellationToken>,
    ) -> QueueResult<EnqueueOutcome> {
        let definition = self.definitions.get(&req.job_type).ok_or_else(|| {
            QueueError::InvalidPayload(format!("unknown job type '{}'", req.job_type))
        })?;
        definition
            .validate_payload(&req.payload)
            .map_err(QueueError::InvalidPayload)?;

        let dedupe_key = if definition.dedupe.mode == DedupeMode::None {
            None
        } else {
            (definition.dedupe.key)(&req.payload)
        };

        let mut inner = self.state.lock().await;
        if !inner.accepting {
            return Err(QueueError::QueueFull(
                "scheduler is stopped and not accepting new work".to_string(),
            ));
        }
        if guard.is_some_and(CancellationToken::is_cancelled) {
            return Err(QueueError::Cancelled(
                "caller's guard was cancelled before the job was admitted".to_string(),
            ));
        }

        if let Some(key) = &dedupe_key {
            let index_key = (req.job_type.clone(), key.clone());
            if let Some(existing_id) = inner.dedupe_index.get(&index_key).cloned() {
                let still_active = inner
                    .jobs
                    .get(&existing_id)
                    .map(|e| e.job.is_active())
                    .unwrap_or(false);
                if still_active {
                    if definition.dedupe.mode == DedupeMode::MergeDuplicate {
                        if let Some(merge) = &definition.dedupe.merge {
                            let mut merged_payload = None;
                            if let Some(entry) = inner.jobs.get(&existing_id) {
                                if entry.job.state == JobState::Queued {
                                    merged_payload =
                                        Some(merge(&entry.job.payload, &req.payload));
                                }
                            }
                            if let Some(payload) = merged_payload {
                                if let Some(entry) = inner.jobs.get_mut(&existing_id) {
                                    entry.job.payload = payload;
                                }
                            }
                        }
                    }
                    let job = inner.jobs.get(&existing_id).unwrap().job.clone();
                    self.persist_locked(&inner).await;
                    return Ok(EnqueueOutcome {
                        status: EnqueueStatus::AlreadyQueued,
                        job,
                    });
                }
                inner.dedupe_index.remove(&index_key);
            }
        }

        let global_count = inner.non_terminal_count();
        if global_count + 1 > self.config.max_global {
            return Err(QueueError::QueueFull(
                "global capacity exceeded".to_string(),
            ));
        }
        let project_count = inner.non_terminal_count_for_project(&req.project_id);
        if project_count + 1 > self.config.max_per_project {
            return Err(QueueError::QueueFull(
                "project capacity exceeded".to_string(),
            ));
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type: req.job_type.clone(),
            version: definition.version,
            project_id: req.project_id.clone(),
            source_session_id: req.source_session_id.clone(),
            priority: definition.priority,
            state: JobState::Queued,
            dedupe_key: dedupe_key.clone(),
            payload: req.payload.clone(),
            result: None,
            error: None,
            attempts: 0,
            max_attempts: definition.retry.max_attempts,
            created_at: now,
            started_at: None,
            completed_at: None,
            cancel_requested_at: None,
            next_attempt_at: None,
            last_attempt_at: None,
            running_context: None,
        };

        let seq = self.seq_next.fetch_add(1, Ordering::SeqCst);
        if let Some(key) = &dedupe_key {
            inner
                .dedupe_index
                .insert((req.job_type.clone(), key.clone()), job.id.clone());
        }
        inner.jobs.insert(
            job.id.clone(),
            JobEntry {
                job: job.clone(),
                seq,
            },
        );
        self.persist_locked(&inner).await;
        drop(inner);

        if let Some(cb) = &definition.hooks.on_queued {
            cb(&job);
        }
        self.hooks
            .emit_event(OrchestratorEvent {
                event_type: OrchestratorEventType::OrchestratorJobQueued,
                thread_id: None,
                payload: serde_json::json!({ "jobId": job.id, "type": job.job_type }),
            })
            .await;
        self.dispatch_notify.notify_one();

        Ok(EnqueueOutcome {
            status: EnqueueStatus::Enqueued,
            job,
        })
    }

    /// `Get` per spec §4.1: pure read.
    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.state.lock().await.jobs.get(job_id).map(|e| e.job.clone())
    }

    /// `ListByProject` per spec §4.1: pure read, ordered by `createdAt`
    /// ascending.
    pub async fn list_by_project(
        &self,
        project_id: &str,
        state_filter: Option<JobState>,
    ) -> Vec<Job> {
        let inner = self.state.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|e| e.job.project_id == project_id)
            .filter(|e| state_filter.is_none_or(|s| e.job.state == s))
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// `Stats` per spec §4.1: pure read.
    pub async fn stats(&self) -> QueueStats {
        let inner = self.state.lock().await;
        let mut total_by_state = HashMap::new();
        let mut by_type = HashMap::new();
        let mut queued = 0u64;
        let mut running = 0u64;
        for entry in inner.jobs.values() {
            *total_by_state.entry(entry.job.state).or_insert(0u64) += 1;
            *by_type.entry(entry.job.job_type.clone()).or_insert(0u64) += 1;
            match entry.job.state {
                JobState::Queued => queued += 1,
                JobState::Running => running += 1,
                _ => {}
            }
        }
        QueueStats {
            queued,
            running,
            total_by_state,
            by_type,
        }
    }

    /// `WaitForTerminal` per spec §4.1.
    pub async fn wait_for_terminal(&self, job_id: &str, timeout: Duration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.terminal_notify.notified();
            {
                let inner = self.state.lock().await;
                match inner.jobs.get(job_id) {
                    Some(entry) if entry.job.state.is_terminal() => return Some(entry.job.clone()),
                    None => return None,
                    _ => {}
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    /// `Cancel` per spec §4.1.
    pub async fn cancel(&self, job_id: &str, reason: &str) -> CancelOutcome {
        let (definition, running_cancel, running_context, graceful_wait) = {
            let mut inner = self.state.lock().await;
            let Some(entry) = inner.jobs.get_mut(job_id) else {
                return CancelOutcome {
                    status: CancelStatus::NotFound,
                    job: None,
                };
            };
            if entry.job.state.is_terminal() {
                return CancelOutcome {
                    status: CancelStatus::AlreadyTerminal,
                    job: Some(entry.job.clone()),
                };
            }
            entry.job.cancel_requested_at = Some(Utc::now());

            if entry.job.state == JobState::Queued {
                entry.job.state = JobState::Canceled;
                entry.job.error = Some(reason.to_string());
                entry.job.completed_at = Some(Utc::now());
                if let Some(key) = entry.job.dedupe_key.clone() {
                    inner
                        .dedupe_index
                        .remove(&(entry.job.job_type.clone(), key));
                }
                let job = entry.job.clone();
                let definition = self.definitions.get(&job.job_type);
                self.persist_locked(&inner).await;
                self.terminal_notify.notify_waiters();
                drop(inner);
                if let Some(def) = &definition {
                    if let Some(cb) = &def.hooks.on_canceled {
                        cb(&job);
                    }
                }
                self.hooks
                    .emit_event(OrchestratorEvent {
                        event_type: OrchestratorEventType::OrchestratorJobCanceled,
                        thread_id: None,
                        payload: serde_json::json!({ "jobId": job.id, "error": job.error }),
                    })
                    .await;
                self.dispatch_notify.notify_one();
                return CancelOutcome {
                    status: CancelStatus::Canceled,
                    job: Some(job),
                };
            }

            let definition = self.definitions.get(&entry.job.job_type);
            let running_cancel = inner.running.get(job_id).map(|h| h.cancel.clone());
            let running_context = entry.job.running_context.clone();
            let graceful_wait = definition
                .as_ref()
                .map(|d| d.cancel.graceful_wait)
                .unwrap_or_else(|| Duration::from_millis(2_000));
            inner
                .cancel_reasons
                .insert(job_id.to_string(), reason.to_string());
            (definition, running_cancel, running_context, graceful_wait)
        };

        if let Some(cancel_token) = &running_cancel {
            cancel_token.cancel();
        }
        if let (Some(def), Some(ctx)) = (&definition, &running_context) {
            if def.cancel.strategy == CancelStrategy::InterruptTurn {
                if let (Some(thread_id), Some(turn_id)) = (&ctx.thread_id, &ctx.turn_id) {
                    if let Err(e) = self.hooks.interrupt_turn(thread_id, turn_id).await {
                        warn!(target: "abp.queue", job_id, error = %e, "interrupt_turn hook failed");
                    }
                }
            }
        }

        let settled = self.wait_until_terminal(job_id, graceful_wait).await;
        if settled {
            let job = self.get(job_id).await;
            return CancelOutcome {
                status: CancelStatus::Canceled,
                job,
            };
        }

        let job = self
            .force_cancel(job_id, "interrupt_timeout")
            .await;
        CancelOutcome {
            status: CancelStatus::Canceled,
            job,
        }
    }

    /// `Stop` per spec §4.1.
    pub async fn stop(&self, drain: Duration) {
        {
            let mut inner = self.state.lock().await;
            inner.accepting = false;
        }

        let deadline = tokio::time::Instant::now() + drain;
        loop {
            let running_ids: Vec<String> = {
                let inner = self.state.lock().await;
                inner.running.keys().cloned().collect()
            };
            if running_ids.is_empty() {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let notified = self.terminal_notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let remaining: Vec<String> = {
            let inner = self.state.lock().await;
            inner.running.keys().cloned().collect()
        };

        let settles = remaining.into_iter().map(|job_id| async move {
            let (cancel_token, graceful_wait) = {
                let mut inner = self.state.lock().await;
                let graceful_wait = inner
                    .jobs
                    .get(&job_id)
                    .and_then(|entry| self.definitions.get(&entry.job.job_type))
                    .map(|d| d.cancel.graceful_wait)
                    .unwrap_or_else(|| Duration::from_millis(2_000));
                if let Some(entry) = inner.jobs.get_mut(&job_id) {
                    entry.job.cancel_requested_at = Some(Utc::now());
                }
                inner
                    .cancel_reasons
                    .insert(job_id.clone(), "shutdown".to_string());
                let cancel_token = inner.running.get(&job_id).map(|h| h.cancel.clone());
                (cancel_token, graceful_wait)
            };
            if let Some(cancel_token) = cancel_token {
                cancel_token.cancel();
            }
            let settled = self.wait_until_terminal(&job_id, graceful_wait).await;
            if !settled {
                self.force_cancel(&job_id, "shutdown_timeout").await;
            }
        });
        futures::future::join_all(settles).await;

        if let Some(handle) = self.dispatch_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn wait_until_terminal(&self, job_id: &str, timeout: Duration) -> bool {
        self.wait_for_terminal(job_id, timeout).await.is_some()
    }

    /// Force-marks a job canceled regardless of what its run task is doing;
    /// the run task's eventual output (if any) is discarded, per spec §4.1.
    async fn force_cancel(&self, job_id: &str, error: &str) -> Option<Job> {
        let mut inner = self.state.lock().await;
        let entry = inner.jobs.get_mut(job_id)?;
        if entry.job.state.is_terminal() {
            return Some(entry.job.clone());
        }
        entry.job.state = JobState::Canceled;
        entry.job.error = Some(error.to_string());
        entry.job.completed_at = Some(Utc::now());
        entry.job.running_context = None;
        if let Some(key) = entry.job.dedupe_key.clone() {
            inner
                .dedupe_index
                .remove(&(entry.job.job_type.clone(), key));
        }
        inner.running.remove(job_id);
        let job = entry.job.clone();
        let definition = self.definitions.get(&job.job_type);
        self.persist_locked(&inner).await;
        self.terminal_notify.notify_waiters();
        drop(inner);
        if let Some(def) = &definition {
            if let Some(cb) = &def.hooks.on_canceled {
                cb(&job);
            }
        }
        self.hooks
            .emit_event(OrchestratorEvent {
                event_type: OrchestratorEventType::OrchestratorJobCanceled,
                thread_id: None,
                payload: serde_json::json!({ "jobId": job.id, "error": job.error }),
            })
            .await;
        self.dispatch_notify.notify_one();
        Some(job)
    }

    async fn persist_locked(&self, inner: &Inner) {
        let jobs: Vec<Job> = inner.jobs.values().map(|e| e.job.clone()).collect();
        let snapshot = QueueSnapshot::new(jobs);
        if let Err(e) = persist::save(&self.config.snapshot_path, &snapshot).await {
            warn!(
                target: "abp.queue",
                path = %self.config.snapshot_path.display(),
                error = %e,
                "failed to persist queue snapshot, keeping in-memory state",
            );
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = self.dispatch_notify.notified() => {}
                _ = ticker.tick() => {}
            }
            self.dispatch_tick().await;
        }
    }

    async fn dispatch_tick(self: &Arc<Self>) {
        loop {
            let dispatched = {
                let mut inner = self.state.lock().await;
                if !inner.accepting || inner.running.len() >= self.config.global_concurrency {
                    None
                } else {
                    let now = Utc::now();
                    let candidates: Vec<Candidate> = inner
                        .jobs
                        .values()
                        .filter(|e| e.job.state == JobState::Queued)
                        .map(|e| Candidate {
                            id: e.job.id.clone(),
                            priority: e.job.priority,
                            seq: e.seq,
                            next_attempt_at: e.job.next_attempt_at,
                            created_at: e.job.created_at,
                        })
                        .collect();
                    match select_next(
                        &candidates,
                        inner.consecutive_interactive,
                        self.config.background_aging,
                        self.config.max_interactive_burst,
                        now,
                    ) {
                        Some(job_id) => {
                            let Some(definition) =
                                inner.jobs.get(&job_id).and_then(|e| self.definitions.get(&e.job.job_type))
                            else {
                                continue;
                            };
                            let priority = definition.priority;
                            if priority == Priority::Interactive {
                                inner.consecutive_interactive += 1;
                            } else {
                                inner.consecutive_interactive = 0;
                            }

                            let entry = inner.jobs.get_mut(&job_id).unwrap();
                            entry.job.state = JobState::Running;
                            entry.job.started_at = Some(now);
                            entry.job.last_attempt_at = Some(now);
                            entry.job.attempts += 1;

                            let cancel = CancellationToken::new();
                            inner.running.insert(
                                job_id.clone(),
                                RunningHandle {
                                    cancel: cancel.clone(),
                                    definition_type: entry.job.job_type.clone(),
                                },
                            );
                            let job = entry.job.clone();
                            self.persist_locked(&inner).await;
                            Some((job, definition, cancel))
                        }
                        None => None,
                    }
                }
            };

            match dispatched {
                Some((job, definition, cancel)) => {
                    if let Some(cb) = &definition.hooks.on_started {
                        cb(&job);
                    }
                    self.hooks
                        .emit_event(OrchestratorEvent {
                            event_type: OrchestratorEventType::OrchestratorJobStarted,
                            thread_id: None,
                            payload: serde_json::json!({ "jobId": job.id, "attempt": job.attempts }),
                        })
                        .await;
                    self.spawn_execution(job, definition, cancel);
                }
                None => break,
            }
        }
    }

    fn spawn_execution(self: &Arc<Self>, job: Job, definition: Arc<JobDefinition>, cancel: CancellationToken) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.execute(job, definition, cancel).await;
        });
    }

    async fn execute(self: Arc<Self>, job: Job, definition: Arc<JobDefinition>, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RunSignal>();
        let ctx = RunContext::new(
            job.id.clone(),
            job.project_id.clone(),
            job.source_session_id.clone(),
            job.attempts,
            cancel.clone(),
            tx,
        );
        let timeout = definition.timeout.unwrap_or(self.config.default_job_timeout);
        let run_fut = definition.runner.run(ctx, job.payload.clone());
        tokio::pin!(run_fut);
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        let outcome: Result<Value, String> = loop {
            tokio::select! {
                res = &mut run_fut => break res,
                _ = &mut sleep => {
                    cancel.cancel();
                    break Err("timeout".to_string());
                }
                signal = rx.recv() => {
                    match signal {
                        Some(s) => { self.apply_run_signal(&job.id, s).await; }
                        None => {}
                    }
                }
            }
        };

        while let Ok(signal) = rx.try_recv() {
            self.apply_run_signal(&job.id, signal).await;
        }

        self.settle(job, definition, outcome).await;
    }

    async fn apply_run_signal(&self, job_id: &str, signal: RunSignal) {
        let mut inner = self.state.lock().await;
        let Some(entry) = inner.jobs.get_mut(job_id) else {
            return;
        };
        match signal {
            RunSignal::RunningContext(ctx) => {
                entry.job.running_context = Some(RunningContext {
                    thread_id: ctx.thread_id,
                    turn_id: ctx.turn_id,
                });
            }
            RunSignal::Progress(progress) => {
                drop(inner);
                self.hooks
                    .emit_event(OrchestratorEvent {
                        event_type: OrchestratorEventType::OrchestratorJobProgress,
                        thread_id: None,
                        payload: serde_json::json!({ "jobId": job_id, "progress": progress }),
                    })
                    .await;
                return;
            }
        }
    }

    async fn settle(&self, job: Job, definition: Arc<JobDefinition>, outcome: Result<Value, String>) {
        let mut inner = self.state.lock().await;
        inner.running.remove(&job.id);
        let Some(entry) = inner.jobs.get_mut(&job.id) else {
            return;
        };
        if entry.job.state.is_terminal() {
            // A concurrent Cancel/Stop already force-terminalized this job;
            // the late outcome is discarded per spec §4.1.
            return;
        }

        if entry.job.cancel_requested_at.is_some() {
            // Cancel() is waiting on this job to settle cooperatively; a
            // run() that returns Ok or Err here still terminalizes as
            // canceled, not completed/failed, per the spec's state machine.
            let reason = inner
                .cancel_reasons
                .remove(&job.id)
                .unwrap_or_else(|| "canceled".to_string());
            let entry = inner.jobs.get_mut(&job.id).expect("checked above");
            entry.job.state = JobState::Canceled;
            entry.job.error = Some(reason);
            entry.job.completed_at = Some(Utc::now());
            entry.job.running_context = None;
            if let Some(key) = entry.job.dedupe_key.clone() {
                inner.dedupe_index.remove(&(entry.job.job_type.clone(), key));
            }
            let job = inner.jobs.get(&job.id).unwrap().job.clone();
            self.persist_locked(&inner).await;
            self.terminal_notify.notify_waiters();
            drop(inner);
            if let Some(cb) = &definition.hooks.on_canceled {
                cb(&job);
            }
            self.hooks
                .emit_event(OrchestratorEvent {
                    event_type: OrchestratorEventType::OrchestratorJobCanceled,
                    thread_id: None,
                    payload: serde_json::json!({ "jobId": job.id, "error": job.error }),
                })
                .await;
            self.dispatch_notify.notify_one();
            return;
        }

        match outcome {
            Ok(result) => {
                if let Err(e) = definition.validate_result(&result) {
                    entry.job.state = JobState::Failed;
                    entry.job.error = Some(format!("invalid result: {e}"));
                    entry.job.completed_at = Some(Utc::now());
                    entry.job.running_context = None;
                    if let Some(key) = entry.job.dedupe_key.clone() {
                        inner.dedupe_index.remove(&(entry.job.job_type.clone(), key));
                    }
                    let job = entry.job.clone();
                    self.persist_locked(&inner).await;
                    self.terminal_notify.notify_waiters();
                    drop(inner);
                    if let Some(cb) = &definition.hooks.on_failed {
                        cb(&job);
                    }
                    self.hooks
                        .emit_event(OrchestratorEvent {
                            event_type: OrchestratorEventType::OrchestratorJobFailed,
                            thread_id: None,
                            payload: serde_json::json!({ "jobId": job.id, "error": job.error }),
                        })
                        .await;
                    self.dispatch_notify.notify_one();
                    return;
                }
                entry.job.state = JobState::Completed;
                entry.job.result = Some(result);
                entry.job.completed_at = Some(Utc::now());
                entry.job.running_context = None;
                if let Some(key) = entry.job.dedupe_key.clone() {
                    inner.dedupe_index.remove(&(entry.job.job_type.clone(), key));
                }
                let job = entry.job.clone();
                self.persist_locked(&inner).await;
                self.terminal_notify.notify_waiters();
                drop(inner);
                if let Some(cb) = &definition.hooks.on_completed {
                    cb(&job);
                }
                self.hooks
                    .emit_event(OrchestratorEvent {
                        event_type: OrchestratorEventType::OrchestratorJobCompleted,
                        thread_id: None,
                        payload: serde_json::json!({ "jobId": job.id }),
                    })
                    .await;
                self.dispatch_notify.notify_one();
            }
            Err(error) => {
                let trimmed = error.trim();
                let error_string = if trimmed.is_empty() {
                    "unknown error".to_string()
                } else {
                    trimmed.to_string()
                };
                let classification = (definition.retry.classify)(&error_string);
                let retryable = classification == Classification::Retryable
                    && entry.job.attempts < entry.job.max_attempts;

                if retryable {
                    let delay = definition
                        .retry
                        .delay_after(entry.job.attempts, jitter_sample());
                    entry.job.state = JobState::Queued;
                    entry.job.next_attempt_at = Some(Utc::now() + delay);
                    entry.job.running_context = None;
                    let job = entry.job.clone();
                    self.persist_locked(&inner).await;
                    drop(inner);
                    info!(target: "abp.queue", job_id = %job.id, attempts = job.attempts, "job requeued for retry");
                    self.dispatch_notify.notify_one();
                } else {
                    entry.job.state = JobState::Failed;
                    entry.job.error = Some(error_string);
                    entry.job.completed_at = Some(Utc::now());
                    entry.job.running_context = None;
                    if let Some(key) = entry.job.dedupe_key.clone() {
                        inner.dedupe_index.remove(&(entry.job.job_type.clone(), key));
                    }
                    let job = entry.job.clone();
                    self.persist_locked(&inner).await;
                    self.terminal_notify.notify_waiters();
                    drop(inner);
                    if let Some(cb) = &definition.hooks.on_failed {
                        cb(&job);
                    }
                    self.hooks
                        .emit_event(OrchestratorEvent {
                            event_type: OrchestratorEventType::OrchestratorJobFailed,
                            thread_id: None,
                            payload: serde_json::json!({ "jobId": job.id, "error": job.error }),
                        })
                        .await;
                    self.dispatch_notify.notify_one();
                }
            }
        }
    }
}

fn self_index_insert(
    index: &mut HashMap<(String, String), String>,
    job_type: &str,
    key: &str,
    job_id: &str,
) {
    index.insert((job_type.to_string(), key.to_string()), job_id.to_string());
}

/// Deterministic-enough jitter sample in `[0,1)` from the system clock,
/// matching the workspace's no-`rand`-dependency convention (see
/// `abp-host::retry::compute_delay`).
fn jitter_sample() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1_000_000) as f64 / 1_000_000.0
}
