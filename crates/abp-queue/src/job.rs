// SPDX-License-Identifier: MIT OR Apache-2.0
//! The [`Job`] record and its state machine, per spec §3 and §4.1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority class a job is scheduled under.
///
/// Interactive jobs are preferred; background jobs are admitted via the
/// anti-starvation aging policy (see `scheduler::select_next`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// User-facing work that should run as soon as capacity allows.
    Interactive,
    /// Non-urgent work, admitted via aging so it is never starved outright.
    Background,
}

/// A job's current lifecycle state. Terminal states (`Completed`, `Failed`,
/// `Canceled`) have no outgoing transitions — see spec §4.1's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be dispatched.
    Queued,
    /// Currently executing `definition.run`.
    Running,
    /// Finished successfully; `result` is set.
    Completed,
    /// Finished unsuccessfully; `error` is set.
    Failed,
    /// Canceled before or during execution; `error` is set.
    Canceled,
}

impl JobState {
    /// Returns `true` for the three states with no outgoing transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Thread/turn identifiers set on a job only while it is running, used by
/// the `interrupt_turn` cancel strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningContext {
    /// Identifier of the conversation thread the job is acting on behalf of.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Identifier of the specific turn within that thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

/// One scheduled unit of work. See spec §3 for the full field-by-field
/// contract and invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Stable identifier, assigned at enqueue time.
    pub id: String,
    /// Names a registered [`crate::definition::JobDefinition`].
    #[serde(rename = "type")]
    pub job_type: String,
    /// The definition's version at the time this job was enqueued.
    pub version: u32,
    /// Tenant/partition key.
    pub project_id: String,
    /// Optional origin session, if this job was enqueued on behalf of one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_session_id: Option<String>,
    /// Scheduling priority class.
    pub priority: Priority,
    /// Current lifecycle state.
    pub state: JobState,
    /// Dedupe key, non-empty iff the definition's dedupe mode is not `none`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Opaque payload, validated against the definition's payload schema.
    pub payload: serde_json::Value,
    /// Present only when `state == Completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Present only on `Failed`/`Canceled`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of attempts made so far (monotonic, never decreases).
    pub attempts: u32,
    /// Maximum attempts allowed for this job.
    pub max_attempts: u32,
    /// When the job was created via `Enqueue`.
    pub created_at: DateTime<Utc>,
    /// When the job most recently transitioned to `Running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When `Cancel` was first called for this job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Earliest time the next retry attempt may be dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the most recent attempt began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Set only while `state == Running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_context: Option<RunningContext>,
}

impl Job {
    /// Returns `true` if `state` is non-terminal (`Queued` or `Running`).
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}
