// SPDX-License-Identifier: MIT OR Apache-2.0
//! The trust/capability gate, per spec §4.2.1.
//!
//! `disabled` accepts everything unconditionally. `warn` and `enforced`
//! require every event type a module subscribes to, and every action type
//! a module attempts, to appear in its manifest's declared capabilities
//! (or be covered by a `"*"` wildcard). Violations become warnings in
//! `warn` mode and errors (denying the module) in `enforced` mode.

use serde::Serialize;

use crate::manifest::Capabilities;

/// Which trust policy is in effect for extension loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// No capability checks are performed.
    Disabled,
    /// Violations are recorded as warnings; the module still loads.
    Warn,
    /// Violations are recorded as errors; the module is denied.
    Enforced,
}

/// Whether a module's subscriptions were ultimately registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustStatus {
    /// No violations found (or trust is disabled).
    Accepted,
    /// Violations found under `warn` mode; module still loads.
    AcceptedWithWarnings,
    /// Violations found under `enforced` mode; subscriptions discarded.
    Denied,
}

/// The result of evaluating one module's declared event subscriptions
/// against its manifest capabilities, under the active [`TrustMode`].
#[derive(Debug, Clone, Serialize)]
pub struct TrustEvaluation {
    /// The mode this evaluation was performed under.
    pub mode: TrustMode,
    /// The resulting status.
    pub status: TrustStatus,
    /// Human-readable violation messages recorded as warnings.
    pub warnings: Vec<String>,
    /// Human-readable violation messages recorded as errors.
    pub errors: Vec<String>,
}

impl TrustEvaluation {
    /// `true` unless the module was denied.
    #[must_use]
    pub fn loads(&self) -> bool {
        !matches!(self.status, TrustStatus::Denied)
    }
}

/// Evaluate `subscribed_event_types` (the event types a module's
/// `registerAgentEvents` call subscribed to) against its declared
/// `capabilities`, under `mode`.
#[must_use]
pub fn evaluate_event_capabilities(
    module_name: &str,
    subscribed_event_types: &[String],
    capabilities: &Capabilities,
    mode: TrustMode,
) -> TrustEvaluation {
    if mode == TrustMode::Disabled {
        return TrustEvaluation {
            mode,
            status: TrustStatus::Accepted,
            warnings: Vec::new(),
            errors: Vec::new(),
        };
    }

    let mut violations = Vec::new();
    for event_type in subscribed_event_types {
        if !capabilities.declares_event(event_type) {
            violations.push(format!(
                "extension {module_name} registered undeclared event capability: {event_type}"
            ));
        }
    }

    finalize(mode, violations)
}

/// Evaluate a single attempted action type against `capabilities`, under
/// `mode`. Called at `Emit` time for each `action_result` a handler
/// returns, since the set of actions a module attempts is data-driven and
/// not knowable at load time.
#[must_use]
pub fn check_action_capability(
    module_name: &str,
    action_type: &str,
    capabilities: &Capabilities,
    mode: TrustMode,
) -> TrustEvaluation {
    if mode == TrustMode::Disabled || capabilities.declares_action(action_type) {
        return TrustEvaluation {
            mode,
            status: TrustStatus::Accepted,
            warnings: Vec::new(),
            errors: Vec::new(),
        };
    }

    let violation =
        format!("extension {module_name} attempted undeclared action capability: {action_type}");
    finalize(mode, vec![violation])
}

fn finalize(mode: TrustMode, violations: Vec<String>) -> TrustEvaluation {
    if violations.is_empty() {
        return TrustEvaluation {
            mode,
            status: TrustStatus::Accepted,
            warnings: Vec::new(),
            errors: Vec::new(),
        };
    }
    match mode {
        TrustMode::Disabled => unreachable!("disabled mode never produces violations"),
        TrustMode::Warn => TrustEvaluation {
            mode,
            status: TrustStatus::AcceptedWithWarnings,
            warnings: violations,
            errors: Vec::new(),
        },
        TrustMode::Enforced => TrustEvaluation {
            mode,
            status: TrustStatus::Denied,
            warnings: Vec::new(),
            errors: violations,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(events: &[&str], actions: &[&str]) -> Capabilities {
        Capabilities {
            events: events.iter().map(|s| s.to_string()).collect(),
            actions: actions.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn disabled_mode_always_accepts() {
        let eval = evaluate_event_capabilities(
            "ext",
            &["undeclared.event".to_string()],
            &caps(&[], &[]),
            TrustMode::Disabled,
        );
        assert_eq!(eval.status, TrustStatus::Accepted);
        assert!(eval.loads());
    }

    #[test]
    fn warn_mode_accepts_with_warnings_on_violation() {
        let eval = evaluate_event_capabilities(
            "ext",
            &["undeclared.event".to_string()],
            &caps(&[], &[]),
            TrustMode::Warn,
        );
        assert_eq!(eval.status, TrustStatus::AcceptedWithWarnings);
        assert_eq!(eval.warnings.len(), 1);
        assert!(eval.loads());
        assert!(eval.warnings[0].contains("undeclared event capability"));
    }

    #[test]
    fn enforced_mode_denies_on_violation() {
        let eval = evaluate_event_capabilities(
            "ext",
            &["undeclared.event".to_string()],
            &caps(&[], &[]),
            TrustMode::Enforced,
        );
        assert_eq!(eval.status, TrustStatus::Denied);
        assert!(!eval.loads());
        assert_eq!(eval.errors.len(), 1);
    }

    #[test]
    fn wildcard_capability_satisfies_any_event() {
        let eval = evaluate_event_capabilities(
            "ext",
            &["anything.happened".to_string()],
            &caps(&["*"], &[]),
            TrustMode::Enforced,
        );
        assert_eq!(eval.status, TrustStatus::Accepted);
    }

    #[test]
    fn declared_action_passes_enforced_check() {
        let eval =
            check_action_capability("ext", "do_thing", &caps(&[], &["do_thing"]), TrustMode::Enforced);
        assert_eq!(eval.status, TrustStatus::Accepted);
    }

    #[test]
    fn undeclared_action_is_denied_under_enforced() {
        let eval = check_action_capability("ext", "do_thing", &caps(&[], &[]), TrustMode::Enforced);
        assert_eq!(eval.status, TrustStatus::Denied);
    }
}
