// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Agent Events Runtime, per spec §4.2: loads modules through the
//! trust gate, then fans an [`AgentEvent`] out to every matching handler
//! with per-handler timeout isolation and deterministic reconciliation.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use abp_cancel::CancellationToken;

use crate::error::{AgentEventsError, AgentEventsResult};
use crate::event::{
    AgentEvent, EmitResult, HandlerError, HandlerErrorCode, HandlerOutcome,
};
use crate::manifest::{evaluate_compatibility, Capabilities, CompatibilitySummary, RuntimeIdentity};
use crate::module::{ModuleCandidate, ModuleProvider};
use crate::reconcile::{self, ActionExecutionPlan};
use crate::registry::Subscription;
use crate::tools::{EnqueueJob, Logger, Tools, TracingLogger};
use crate::trust::{check_action_capability, evaluate_event_capabilities, TrustEvaluation, TrustMode};

/// Default handler timeout, per SPEC_FULL.md §7.3's open-question decision.
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 30_000;

/// One module's subscriptions after successfully clearing compatibility
/// and trust checks at load time.
struct LoadedModule {
    name: Arc<str>,
    capabilities: Capabilities,
    subscriptions: Vec<Subscription>,
}

/// Per-module outcome of a `load`/`reload` pass, for callers that want to
/// surface discovery/trust diagnostics (e.g. an admin listing).
#[derive(Debug, Clone)]
pub struct ModuleLoadOutcome {
    /// The candidate's directory/registration name.
    pub name: String,
    /// Runtime/profile compatibility against this core's identity.
    pub compatibility: CompatibilitySummary,
    /// Event-capability trust evaluation, if compatibility passed and the
    /// module loaded far enough to produce a subscription list.
    pub trust: Option<TrustEvaluation>,
    /// Whether this module's subscriptions were ultimately registered.
    pub loaded: bool,
}

/// The outcome of one `Emit`: every [`EmitResult`] produced, plus the
/// deterministic reconciliation of them, per spec §4.2.
#[derive(Debug, Clone)]
pub struct EmitOutcome {
    /// Every result, in subscriber dispatch order.
    pub results: Vec<EmitResult>,
    /// The reconciled enqueue winner, if any handler enqueued a job.
    pub enqueue_winner: Option<crate::event::EnqueueResult>,
    /// The reconciled action execution plan.
    pub action_plan: ActionExecutionPlan,
}

/// Loads extension modules through the trust gate and dispatches
/// [`AgentEvent`]s to their registered handlers.
///
/// Module state is held behind an `RwLock<Arc<[LoadedModule]>>` so `reload`
/// can atomically swap in a freshly built table without blocking `emit`
/// calls already in flight against the old one.
pub struct AgentEventsRuntime {
    provider: Arc<dyn ModuleProvider>,
    enqueue: Arc<dyn EnqueueJob>,
    logger: Arc<dyn Logger>,
    identity: RuntimeIdentity,
    trust_mode: TrustMode,
    default_timeout_ms: u64,
    modules: RwLock<Arc<Vec<LoadedModule>>>,
}

impl AgentEventsRuntime {
    /// Construct a runtime with no modules loaded yet; call [`Self::load`]
    /// before the first `emit`.
    pub fn new(
        provider: Arc<dyn ModuleProvider>,
        enqueue: Arc<dyn EnqueueJob>,
        identity: RuntimeIdentity,
        trust_mode: TrustMode,
    ) -> Self {
        Self {
            provider,
            enqueue,
            logger: Arc::new(TracingLogger),
            identity,
            trust_mode,
            default_timeout_ms: DEFAULT_HANDLER_TIMEOUT_MS,
            modules: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Override the default per-handler timeout (30s).
    #[must_use]
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Override the injected logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Discover, compatibility-check, load, and trust-evaluate every
    /// candidate, then atomically replace the dispatch table.
    ///
    /// Equivalent to spec's `reload` — there is no incremental variant;
    /// discovery always re-scans from scratch and the result is swapped in
    /// all at once so `emit` never observes a partially rebuilt table.
    pub async fn load(&self) -> AgentEventsResult<Vec<ModuleLoadOutcome>> {
        let candidates = self.provider.discover().await?;
        let mut table = Vec::with_capacity(candidates.len());
        let mut report = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let (outcome, loaded) = self.load_one(&candidate).await?;
            if let Some(loaded) = loaded {
                table.push(loaded);
            }
            report.push(outcome);
        }

        *self
            .modules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(table);
        Ok(report)
    }

    async fn load_one(
        &self,
        candidate: &ModuleCandidate,
    ) -> AgentEventsResult<(ModuleLoadOutcome, Option<LoadedModule>)> {
        let compatibility = match &candidate.manifest {
            Some(manifest) => evaluate_compatibility(manifest, &self.identity),
            None => CompatibilitySummary::unconstrained(),
        };

        if !compatibility.compatible {
            warn!(
                target: "abp.agent_events",
                module = %candidate.name,
                reasons = ?compatibility.reasons,
                "module runtime incompatible, skipping load",
            );
            return Ok((
                ModuleLoadOutcome {
                    name: candidate.name.clone(),
                    compatibility,
                    trust: None,
                    loaded: false,
                },
                None,
            ));
        }

        let source = match self.provider.load(candidate).await {
            Ok(source) => source,
            Err(err) => {
                warn!(
                    target: "abp.agent_events",
                    module = %candidate.name,
                    error = %err,
                    "module failed to load",
                );
                return Err(err);
            }
        };

        let capabilities = candidate.capabilities();
        let subscribed = source.registry.subscribed_event_types();
        let trust = evaluate_event_capabilities(
            &candidate.name,
            &subscribed,
            &capabilities,
            self.trust_mode,
        );

        for warning in &trust.warnings {
            warn!(target: "abp.agent_events", module = %candidate.name, "{warning}");
        }

        if !trust.loads() {
            return Ok((
                ModuleLoadOutcome {
                    name: candidate.name.clone(),
                    compatibility,
                    trust: Some(trust),
                    loaded: false,
                },
                None,
            ));
        }

        info!(
            target: "abp.agent_events",
            module = %candidate.name,
            subscriptions = source.registry.subscriptions.len(),
            "module loaded",
        );

        let loaded = LoadedModule {
            name: Arc::from(candidate.name.as_str()),
            capabilities,
            subscriptions: source.registry.subscriptions,
        };

        Ok((
            ModuleLoadOutcome {
                name: candidate.name.clone(),
                compatibility,
                trust: Some(trust),
                loaded: true,
            },
            Some(loaded),
        ))
    }

    /// Fan `event` out to every handler subscribed to its type, in
    /// `(priority, registration order)` order, each isolated by its own
    /// effective timeout, then reconcile the results per spec §4.2.
    pub async fn emit(&self, event: AgentEvent) -> EmitOutcome {
        let modules = Arc::clone(
            &self
                .modules
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        let mut entries: Vec<DispatchEntry> = Vec::new();
        for (module_order, module) in modules.iter().enumerate() {
            for sub in &module.subscriptions {
                if sub.event_type != event.event_type {
                    continue;
                }
                entries.push(DispatchEntry {
                    priority: sub.options.priority,
                    module_order,
                    registration_index: sub.registration_index,
                    module_name: Arc::clone(&module.name),
                    capabilities: module.capabilities.clone(),
                    handler: Arc::clone(&sub.handler),
                    timeout_ms: sub.options.timeout_ms.unwrap_or(self.default_timeout_ms),
                });
            }
        }
        entries.sort_by_key(|e| (e.priority, e.module_order, e.registration_index));

        let futures = entries.into_iter().map(|entry| {
            let event = event.clone();
            async move { self.dispatch_one(entry, event).await }
        });
        let results: Vec<EmitResult> = futures::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect();

        let enqueue_winner = reconcile::select_enqueue_winner(&results);
        let action_plan = reconcile::select_action_execution_plan(&results);

        EmitOutcome {
            results,
            enqueue_winner,
            action_plan,
        }
    }

    async fn dispatch_one(&self, entry: DispatchEntry, event: AgentEvent) -> Option<EmitResult> {
        let guard = CancellationToken::new();
        let tools = Tools::with_default_logger(
            Arc::clone(&self.enqueue),
            guard.clone(),
            Arc::clone(&entry.module_name),
        );
        let handler = entry.handler;
        let task_event = event.clone();
        let task_tools = tools.clone();
        let task = tokio::spawn(async move { handler.handle(&task_event, &task_tools).await });
        tokio::pin!(task);
        let sleep = tokio::time::sleep(Duration::from_millis(entry.timeout_ms));
        tokio::pin!(sleep);

        let outcome = tokio::select! {
            joined = &mut task => {
                match joined {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(message)) => Err(HandlerError {
                        module_name: entry.module_name.to_string(),
                        code: HandlerErrorCode::HandlerException,
                        message,
                    }),
                    Err(join_err) => Err(HandlerError {
                        module_name: entry.module_name.to_string(),
                        code: HandlerErrorCode::HandlerException,
                        message: join_err.to_string(),
                    }),
                }
            }
            () = &mut sleep => {
                guard.cancel();
                warn!(
                    target: "abp.agent_events",
                    module = %entry.module_name,
                    timeout_ms = entry.timeout_ms,
                    "handler timed out, detaching",
                );
                Err(HandlerError {
                    module_name: entry.module_name.to_string(),
                    code: HandlerErrorCode::HandlerTimeout,
                    message: format!("handler exceeded {}ms timeout", entry.timeout_ms),
                })
            }
        };

        match outcome {
            Ok(handler_outcome) => {
                self.outcome_to_result(&entry.module_name, &entry.capabilities, handler_outcome)
            }
            Err(handler_error) => Some(EmitResult::HandlerError(handler_error)),
        }
    }

    fn outcome_to_result(
        &self,
        module_name: &str,
        capabilities: &Capabilities,
        outcome: HandlerOutcome,
    ) -> Option<EmitResult> {
        match outcome {
            HandlerOutcome::Ignored => None,
            HandlerOutcome::Enqueue(result) => Some(EmitResult::Enqueue(result)),
            HandlerOutcome::Action(result) => {
                let eval = check_action_capability(
                    module_name,
                    &result.action_type,
                    capabilities,
                    self.trust_mode,
                );
                for warning in &eval.warnings {
                    warn!(target: "abp.agent_events", module = %module_name, "{warning}");
                }
                if eval.loads() {
                    Some(EmitResult::Action(result))
                } else {
                    Some(EmitResult::HandlerError(HandlerError {
                        module_name: module_name.to_string(),
                        code: HandlerErrorCode::CapabilityDenied,
                        message: eval.errors.join("; "),
                    }))
                }
            }
        }
    }
}

struct DispatchEntry {
    priority: i32,
    module_order: usize,
    registration_index: usize,
    module_name: Arc<str>,
    capabilities: Capabilities,
    handler: Arc<dyn crate::event::EventHandler>,
    timeout_ms: u64,
}
