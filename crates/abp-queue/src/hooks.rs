// SPDX-License-Identifier: MIT OR Apache-2.0
//! The hooks interface the outer system supplies to the Scheduler, per
//! spec §6.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// The `type` field of an event emitted via [`Hooks::emit_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorEventType {
    OrchestratorJobQueued,
    OrchestratorJobStarted,
    OrchestratorJobProgress,
    OrchestratorJobCompleted,
    OrchestratorJobFailed,
    OrchestratorJobCanceled,
}

/// One lifecycle event fired by the scheduler for a given job.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorEvent {
    #[serde(rename = "type")]
    pub event_type: OrchestratorEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub payload: Value,
}

/// Side-effect hooks the Scheduler invokes; supplied by the surrounding
/// system and never called by anything else in this crate.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Fire a lifecycle event. Must not block the scheduler indefinitely;
    /// implementations that forward to a slow sink should buffer internally.
    async fn emit_event(&self, event: OrchestratorEvent);

    /// Invoked during `Cancel`/`Stop` for jobs whose cancel strategy is
    /// `interrupt_turn`, using the job's recorded `runningContext`. Errors
    /// are logged by the caller and never block the cancel transition past
    /// `gracefulWaitMs`.
    async fn interrupt_turn(&self, thread_id: &str, turn_id: &str) -> Result<(), String>;
}

/// A [`Hooks`] implementation that drops every event and treats every
/// interrupt as a no-op success. Useful for tests and standalone use of the
/// scheduler without an outer system attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

#[async_trait]
impl Hooks for NullHooks {
    async fn emit_event(&self, _event: OrchestratorEvent) {}

    async fn interrupt_turn(&self, _thread_id: &str, _turn_id: &str) -> Result<(), String> {
        Ok(())
    }
}
