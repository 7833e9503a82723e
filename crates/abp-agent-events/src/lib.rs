// SPDX-License-Identifier: MIT OR Apache-2.0
//! Multi-subscriber agent extension event bus for the orchestration core.
//!
//! [`runtime::AgentEventsRuntime`] loads extension modules discovered by a
//! [`module::ModuleProvider`] through the trust gate in [`trust`], then fans
//! [`event::AgentEvent`]s out to every subscribed handler with per-handler
//! timeout isolation, reconciling the results deterministically per
//! [`reconcile`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod event;
pub mod manifest;
pub mod module;
pub mod reconcile;
pub mod registry;
pub mod runtime;
pub mod tools;
pub mod trust;

pub use error::{AgentEventsError, AgentEventsResult};
pub use event::{
    ActionResult, ActionResultStatus, AgentEvent, EmitResult, EnqueueResult, EnqueueResultStatus,
    EventHandler, HandlerError, HandlerErrorCode, HandlerOutcome,
};
pub use manifest::{
    Capabilities, CompatibilitySummary, Entrypoints, ExtensionManifest, ProfileRequirement,
    RuntimeIdentity, RuntimeRequirement, VersionConstraint, evaluate_compatibility,
};
pub use module::{
    DEFAULT_EVENTS_ENTRYPOINT, FsModuleProvider, LoadedModuleSource, ModuleCandidate,
    ModuleProvider, RegisterFn, StaticModuleProvider,
};
pub use reconcile::{ActionExecutionPlan, select_action_execution_plan, select_enqueue_winner};
pub use registry::{EventRegistry, EventSubscriptionOptions};
pub use runtime::{
    AgentEventsRuntime, DEFAULT_HANDLER_TIMEOUT_MS, EmitOutcome, ModuleLoadOutcome,
};
pub use tools::{
    EnqueueJob, EnqueueJobInput, EnqueuedJob, FORBIDDEN_AFTER_TIMEOUT, Logger, Tools, TracingLogger,
};
pub use trust::{
    TrustEvaluation, TrustMode, TrustStatus, check_action_capability, evaluate_event_capabilities,
};
