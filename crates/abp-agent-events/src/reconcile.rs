// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic reconciliation of an `Emit`'s results into at most one
//! enqueue winner and one action execution plan, per spec §4.2
//! ("Reconciliation").

use crate::event::{ActionResult, EmitResult, EnqueueResult, EnqueueResultStatus};

/// `selectEnqueueWinner`: the first freshly-`enqueued` result in
/// subscriber-priority order, falling back to the first `already_queued`
/// result, else `None`.
#[must_use]
pub fn select_enqueue_winner(results: &[EmitResult]) -> Option<EnqueueResult> {
    let fresh = results.iter().find_map(|r| match r {
        EmitResult::Enqueue(e) if e.status == EnqueueResultStatus::Enqueued => Some(e.clone()),
        _ => None,
    });
    fresh.or_else(|| {
        results.iter().find_map(|r| match r {
            EmitResult::Enqueue(e) if e.status == EnqueueResultStatus::AlreadyQueued => {
                Some(e.clone())
            }
            _ => None,
        })
    })
}

/// The deterministic outcome of reconciling every `action_result` emitted
/// by one `Emit`, per spec §4.2 ("Action execution plan").
#[derive(Debug, Clone, Default)]
pub struct ActionExecutionPlan {
    /// The first `performed` result in priority order, if any. This is
    /// the action the caller should treat as having actually fired.
    pub winner: Option<ActionResult>,
    /// Non-fatal results that did not fire but are consistent with the
    /// world (`already_resolved`, `not_eligible`, `conflict`), plus any
    /// `performed` result after the first (the world cannot have two
    /// primary successes, so later ones are reconciled rather than
    /// discarded outright).
    pub reconciled: Vec<ActionResult>,
    /// Results classified as failed (`forbidden`, `invalid`, `failed`).
    pub failed: Vec<ActionResult>,
}

/// `selectActionExecutionPlan`: classify every `action_result` emit result
/// by status and select the first `performed` entry (in priority order) as
/// the winner.
#[must_use]
pub fn select_action_execution_plan(results: &[EmitResult]) -> ActionExecutionPlan {
    let mut plan = ActionExecutionPlan::default();
    for result in results {
        let EmitResult::Action(action) = result else {
            continue;
        };
        if action.status.is_failed() {
            plan.failed.push(action.clone());
        } else if action.status.is_reconciled() {
            plan.reconciled.push(action.clone());
        } else if plan.winner.is_none() {
            plan.winner = Some(action.clone());
        } else {
            // A second `performed` result: the plan already has a winner,
            // so this one is reconciled rather than silently dropped.
            plan.reconciled.push(action.clone());
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ActionResultStatus;

    fn job() -> abp_queue::Job {
        abp_queue::Job {
            id: "j1".into(),
            job_type: "suggest_reply".into(),
            version: 1,
            project_id: "p1".into(),
            source_session_id: None,
            priority: abp_queue::Priority::Interactive,
            state: abp_queue::JobState::Queued,
            dedupe_key: None,
            payload: serde_json::json!({}),
            result: None,
            error: None,
            attempts: 0,
            max_attempts: 1,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            cancel_requested_at: None,
            next_attempt_at: None,
            last_attempt_at: None,
            running_context: None,
        }
    }

    #[test]
    fn enqueue_winner_prefers_fresh_over_already_queued() {
        let results = vec![
            EmitResult::Enqueue(EnqueueResult {
                module_name: "a".into(),
                status: EnqueueResultStatus::AlreadyQueued,
                job: job(),
            }),
            EmitResult::Enqueue(EnqueueResult {
                module_name: "b".into(),
                status: EnqueueResultStatus::Enqueued,
                job: job(),
            }),
        ];
        let winner = select_enqueue_winner(&results).unwrap();
        assert_eq!(winner.module_name, "b");
    }

    #[test]
    fn enqueue_winner_falls_back_to_already_queued() {
        let results = vec![EmitResult::Enqueue(EnqueueResult {
            module_name: "a".into(),
            status: EnqueueResultStatus::AlreadyQueued,
            job: job(),
        })];
        assert_eq!(select_enqueue_winner(&results).unwrap().module_name, "a");
    }

    #[test]
    fn enqueue_winner_none_when_no_enqueue_results() {
        assert!(select_enqueue_winner(&[]).is_none());
    }

    #[test]
    fn action_plan_classifies_by_status() {
        let results = vec![
            EmitResult::Action(ActionResult {
                module_name: "a".into(),
                action_type: "approve".into(),
                status: ActionResultStatus::NotEligible,
            }),
            EmitResult::Action(ActionResult {
                module_name: "b".into(),
                action_type: "approve".into(),
                status: ActionResultStatus::Performed,
            }),
            EmitResult::Action(ActionResult {
                module_name: "c".into(),
                action_type: "approve".into(),
                status: ActionResultStatus::Forbidden,
            }),
        ];
        let plan = select_action_execution_plan(&results);
        assert_eq!(plan.winner.unwrap().module_name, "b");
        assert_eq!(plan.reconciled.len(), 1);
        assert_eq!(plan.failed.len(), 1);
    }

    #[test]
    fn second_performed_result_is_reconciled_not_dropped() {
        let results = vec![
            EmitResult::Action(ActionResult {
                module_name: "a".into(),
                action_type: "approve".into(),
                status: ActionResultStatus::Performed,
            }),
            EmitResult::Action(ActionResult {
                module_name: "b".into(),
                action_type: "approve".into(),
                status: ActionResultStatus::Performed,
            }),
        ];
        let plan = select_action_execution_plan(&results);
        assert_eq!(plan.winner.unwrap().module_name, "a");
        assert_eq!(plan.reconciled.len(), 1);
        assert_eq!(plan.reconciled[0].module_name, "b");
    }
}
