// SPDX-License-Identifier: MIT OR Apache-2.0
//! The registry a module's `registerAgentEvents` entrypoint populates, per
//! spec §3 ("registered event subscriptions `(eventType, handler,
//! {priority, timeoutMs})`").

use std::sync::Arc;

use crate::event::EventHandler;

/// Per-subscription tuning, per spec §3 and the default-timeout open
/// question resolved in SPEC_FULL.md §7.3.
#[derive(Debug, Clone, Copy)]
pub struct EventSubscriptionOptions {
    /// Dispatch order among handlers subscribed to the same event type
    /// (ascending; ties broken by registration order).
    pub priority: i32,
    /// Overrides the default handler timeout (30s) for this subscription.
    pub timeout_ms: Option<u64>,
}

impl Default for EventSubscriptionOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            timeout_ms: None,
        }
    }
}

/// One registered `(eventType, handler, options)` tuple.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub event_type: String,
    pub handler: Arc<dyn EventHandler>,
    pub options: EventSubscriptionOptions,
    /// Registration order within the owning module, used as the stable
    /// tie-breaker spec §4.2 step 1 calls for.
    pub registration_index: usize,
}

/// Passed to a module's `registerAgentEvents` entrypoint so it can
/// subscribe handlers to event types. Collected into the module's loaded
/// state, not retained beyond load/reload time.
#[derive(Default)]
pub struct EventRegistry {
    pub(crate) subscriptions: Vec<Subscription>,
}

impl EventRegistry {
    /// A registry with no subscriptions yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `event_type` with default options (priority
    /// 0, default timeout).
    pub fn on(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.on_with_options(event_type, handler, EventSubscriptionOptions::default());
    }

    /// Subscribe `handler` to `event_type` with explicit options.
    pub fn on_with_options(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: EventSubscriptionOptions,
    ) {
        let registration_index = self.subscriptions.len();
        self.subscriptions.push(Subscription {
            event_type: event_type.into(),
            handler,
            options,
            registration_index,
        });
    }

    /// The distinct event types this registry has at least one
    /// subscription for, in first-registered order. Used by the trust
    /// gate's load-time event capability check.
    #[must_use]
    pub fn subscribed_event_types(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for sub in &self.subscriptions {
            if seen.insert(sub.event_type.clone()) {
                out.push(sub.event_type.clone());
            }
        }
        out
    }
}
