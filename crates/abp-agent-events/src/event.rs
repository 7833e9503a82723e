// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent events, handler outcomes, and emit results, per spec §3 ("Agent
//! Event") and §4.2.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::tools::Tools;

/// `{type, payload}`, fanned out to every subscribed handler by `Emit`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    /// Event type name, matched against handler subscriptions.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque event payload.
    pub payload: Value,
}

impl AgentEvent {
    /// Construct an event with the given type and payload.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Whether `Enqueue` (via the injected `enqueueJob` capability) created a
/// new job or found an existing dedupe peer, mirrored from
/// `abp_queue::EnqueueStatus` so this crate does not leak the queue's own
/// type into the handler-facing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueResultStatus {
    /// A fresh job was created.
    Enqueued,
    /// An existing non-terminal dedupe peer was returned instead.
    AlreadyQueued,
}

/// An `enqueue_result` emit result: a handler called `tools.enqueueJob`.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResult {
    /// The module whose handler produced this result.
    pub module_name: String,
    /// Whether the enqueue created a new job or found a dedupe peer.
    pub status: EnqueueResultStatus,
    /// The resulting job, as created or found by the queue.
    pub job: abp_queue::Job,
}

/// Outcome of a handler's attempt to perform a domain action (e.g. apply a
/// file-change approval). The action itself is executed by the handler
/// (or by the caller, via the reconciled winner) — this crate only
/// classifies and reconciles the *result* a handler reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResultStatus {
    /// The action fired and this handler is the primary success.
    Performed,
    /// The action's effect was already in place; consistent with the
    /// world, but this handler did not itself fire it.
    AlreadyResolved,
    /// This handler determined the action does not apply.
    NotEligible,
    /// This handler's attempt conflicted with concurrent state.
    Conflict,
    /// The trust gate (or the handler itself) forbade the action.
    Forbidden,
    /// The action request was structurally invalid.
    Invalid,
    /// The action attempt failed for another reason.
    Failed,
}

impl ActionResultStatus {
    /// `true` for the two "did not fire, but the world is still
    /// consistent" statuses the reconciliation plan treats as non-fatal.
    #[must_use]
    pub fn is_reconciled(&self) -> bool {
        matches!(
            self,
            Self::AlreadyResolved | Self::NotEligible | Self::Conflict
        )
    }

    /// `true` for the three statuses the reconciliation plan treats as a
    /// failed attempt.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Forbidden | Self::Invalid | Self::Failed)
    }
}

/// An `action_result` emit result.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    /// The module whose handler produced this result.
    pub module_name: String,
    /// The domain action type this result is about.
    pub action_type: String,
    /// The classification.
    pub status: ActionResultStatus,
}

/// Stable identifiers for why a handler produced a `handler_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorCode {
    /// The handler did not return within its effective timeout.
    HandlerTimeout,
    /// The handler returned an error (or panicked).
    HandlerException,
    /// The trust gate rejected an action this handler attempted.
    CapabilityDenied,
}

/// A `handler_error` emit result.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerError {
    /// The module whose handler produced this error.
    pub module_name: String,
    /// The stable error code.
    pub code: HandlerErrorCode,
    /// A short human-readable message.
    pub message: String,
}

/// One handler's contribution to a single `Emit`, per spec §3.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum EmitResult {
    /// `enqueue_result`.
    #[serde(rename = "enqueue_result")]
    Enqueue(EnqueueResult),
    /// `action_result`.
    #[serde(rename = "action_result")]
    Action(ActionResult),
    /// `handler_error`.
    #[serde(rename = "handler_error")]
    HandlerError(HandlerError),
}

impl EmitResult {
    /// The module this result belongs to, regardless of variant.
    #[must_use]
    pub fn module_name(&self) -> &str {
        match self {
            Self::Enqueue(e) => &e.module_name,
            Self::Action(a) => &a.module_name,
            Self::HandlerError(h) => &h.module_name,
        }
    }
}

/// What a handler invocation produced, before it is wrapped into an
/// [`EmitResult`] by the runtime.
///
/// `Ignored` models spec §4.2's "a plain value (ignored)" case: the handler
/// ran successfully but didn't enqueue or report an action. It contributes
/// no [`EmitResult`] entry — there is nothing to reconcile or surface.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// The handler called `tools.enqueueJob` and is reporting its result.
    Enqueue(EnqueueResult),
    /// The handler is reporting the outcome of a domain action attempt.
    Action(ActionResult),
    /// The handler ran to completion but has nothing to report.
    Ignored,
}

/// One module's subscription callback for a given event type.
///
/// Modeled as a trait object (spec §9: "a per-invocation context object",
/// not closure captures) so both [`crate::module::StaticModuleProvider`]
/// test fixtures and any future native-loaded module can implement it
/// uniformly.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Returning `Err` is the "throw" case in spec §4.2
    /// step 4 and becomes a `handler_error` with
    /// [`HandlerErrorCode::HandlerException`].
    async fn handle(&self, event: &AgentEvent, tools: &Tools) -> Result<HandlerOutcome, String>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(AgentEvent, Tools) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<HandlerOutcome, String>> + Send + 'static,
{
    async fn handle(&self, event: &AgentEvent, tools: &Tools) -> Result<HandlerOutcome, String> {
        (self)(event.clone(), tools.clone()).await
    }
}
