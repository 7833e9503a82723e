// SPDX-License-Identifier: MIT OR Apache-2.0
//! Composition root for the orchestration core.
//!
//! [`build_components`] wires an [`abp_config::OrchestratorConfig`] into the
//! four core components — the job queue/scheduler, the agent events
//! runtime, the runtime-process supervisor, and the extension reload audit
//! store — and [`build_app`] exposes the thin `axum` health/readiness
//! surface the daemon binary serves. Everything outside that surface
//! (transcript/session/project CRUD, auth, the full external API) is out of
//! scope per spec.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use abp_agent_events::{AgentEventsRuntime, FsModuleProvider, RegisterFn, RuntimeIdentity, TrustMode};
use abp_audit_store::AuditStore;
use abp_config::{OrchestratorConfig, TrustModeSetting};
use abp_queue::{JobDefinitionRegistry, NullHooks, Scheduler, SchedulerConfig};
use abp_supervisor::{HandshakeConfig, Supervisor, SupervisorConfig};
use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use serde_json::json;
use tracing::info;

/// Version string this core's manifest-compatibility checks compare against,
/// per spec §4.2 ("this core's own API version").
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client info this daemon presents during the supervised process's
/// `initialize` handshake, per spec §4.3.
const SUPERVISOR_CLIENT_NAME: &str = "abp-daemon";

/// Every long-lived component the daemon owns, shared behind `Arc`s so the
/// thin API surface and the main loop can both hold references.
#[derive(Clone)]
pub struct Components {
    /// Job queue/scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Agent events runtime.
    pub agent_events: Arc<AgentEventsRuntime>,
    /// Runtime-process supervisor, present only if `supervisor.command` is
    /// configured.
    pub supervisor: Option<Arc<Supervisor>>,
    /// Extension reload audit store.
    pub audit: Arc<AuditStore>,
}

/// Build every component from `config`, without starting any of them.
///
/// Starting the scheduler's dispatch loop, the agent events runtime's first
/// `load`, and (if configured) the supervised process is the caller's
/// responsibility — kept separate so tests can inspect a freshly built,
/// not-yet-running set of components.
pub fn build_components(config: &OrchestratorConfig) -> Components {
    let scheduler = Scheduler::new(
        JobDefinitionRegistry::new(),
        Arc::new(NullHooks),
        scheduler_config(config),
    );

    let identity = RuntimeIdentity {
        core_version: CORE_VERSION.to_string(),
        profile_id: None,
        profile_version: None,
    };
    let mut roots = vec![PathBuf::from(&config.agent_events.agents_root)];
    roots.extend(config.agent_events.extension_sources.iter().map(PathBuf::from));
    let factories: HashMap<String, RegisterFn> = HashMap::new();
    let provider = Arc::new(FsModuleProvider::new(roots, factories));
    let agent_events = Arc::new(AgentEventsRuntime::with_default_timeout_ms(
        provider,
        scheduler.clone(),
        identity,
        trust_mode(config.agent_events.trust_mode),
        config.agent_events.default_handler_timeout_ms,
    ));

    let supervisor = if config.supervisor.command.trim().is_empty() {
        None
    } else {
        Some(Arc::new(Supervisor::new(supervisor_config(config))))
    };

    let audit = Arc::new(AuditStore::new(PathBuf::from(&config.audit.audit_path)));

    Components {
        scheduler,
        agent_events,
        supervisor,
        audit,
    }
}

fn scheduler_config(config: &OrchestratorConfig) -> SchedulerConfig {
    let q = &config.queue;
    SchedulerConfig {
        snapshot_path: PathBuf::from(&q.snapshot_path),
        global_concurrency: q.global_concurrency as usize,
        max_per_project: q.max_per_project as usize,
        max_global: q.max_global as usize,
        default_job_timeout: Duration::from_millis(q.default_job_timeout_ms),
        background_aging: Duration::from_millis(q.background_aging_ms),
        max_interactive_burst: q.max_interactive_burst,
        stop_drain: Duration::from_millis(q.stop_drain_ms),
    }
}

fn supervisor_config(config: &OrchestratorConfig) -> SupervisorConfig {
    let s = &config.supervisor;
    let mut sup = SupervisorConfig::new(s.command.clone());
    sup.args = s.args.clone();
    sup.rpc_timeout = Duration::from_millis(s.rpc_timeout_ms);
    sup.stop_grace = Duration::from_millis(s.stop_grace_ms);
    sup.handshake = Some(HandshakeConfig {
        client_name: SUPERVISOR_CLIENT_NAME.to_string(),
        client_version: CORE_VERSION.to_string(),
        capabilities: json!({}),
        timeout: Duration::from_millis(s.handshake_timeout_ms),
    });
    sup
}

fn trust_mode(setting: TrustModeSetting) -> TrustMode {
    match setting {
        TrustModeSetting::Disabled => TrustMode::Disabled,
        TrustModeSetting::Warn => TrustMode::Warn,
        TrustModeSetting::Enforced => TrustMode::Enforced,
    }
}

/// Shared state for the thin health/readiness API.
#[derive(Clone)]
pub struct AppState {
    /// The running components the health surface reports on.
    pub components: Components,
}

/// Build the `axum` router the daemon binary serves: `/health` (always
/// `200`, liveness only) and `/ready` (reports each component's status;
/// `503` if the supervisor is configured but not running).
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "core_version": CORE_VERSION }))
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue_stats = state.components.scheduler.stats().await;
    let supervisor_status = match &state.components.supervisor {
        Some(sup) => Some(sup.full_status().await),
        None => None,
    };
    let ready = supervisor_status.as_ref().is_none_or(|s| s.running);

    let body = json!({
        "ready": ready,
        "queue": { "total": queue_stats.total, "by_state": queue_stats.by_state },
        "supervisor": supervisor_status,
    });
    let status = if ready {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Start the scheduler's dispatch loop, load the agent events runtime's
/// extension modules, and (if configured) spawn the supervised process.
/// Logs, but does not fail startup on, an agent-events load or supervisor
/// start error — both are reload-able/restart-able after the daemon is up.
pub async fn start_components(components: &Components) -> anyhow::Result<()> {
    components.scheduler.start().await?;

    match components.agent_events.load().await {
        Ok(outcomes) => {
            for outcome in &outcomes {
                info!(
                    target: "abp.agent_events",
                    module = %outcome.name,
                    loaded = outcome.loaded,
                    "extension module discovery"
                );
            }
        }
        Err(e) => {
            tracing::warn!(target: "abp.agent_events", error = %e, "initial module load failed");
        }
    }

    if let Some(supervisor) = &components.supervisor {
        if let Err(e) = supervisor.start().await {
            tracing::warn!(target: "abp.supervisor", error = %e, "failed to start supervised process");
        }
    }

    Ok(())
}

/// Stop the supervised process (if running) and let the scheduler's
/// dispatch loop drain in place; the scheduler itself has no explicit
/// `shutdown` beyond dropping its `Arc`, since its dispatch loop is driven
/// by `Notify`, not an owned task the caller must join.
pub async fn stop_components(components: &Components) {
    if let Some(supervisor) = &components.supervisor {
        if let Err(e) = supervisor.stop().await {
            tracing::warn!(target: "abp.supervisor", error = %e, "error stopping supervised process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.queue.snapshot_path = dir.join("jobs.json").to_string_lossy().into_owned();
        config.audit.audit_path = dir.join("audit.json").to_string_lossy().into_owned();
        config.agent_events.agents_root = dir.join("agents").to_string_lossy().into_owned();
        config
    }

    #[test]
    fn build_components_without_supervisor_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let components = build_components(&config);
        assert!(components.supervisor.is_none());
    }

    #[test]
    fn build_components_with_supervisor_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.supervisor.command = "true".into();
        let components = build_components(&config);
        assert!(components.supervisor.is_some());
    }

    #[tokio::test]
    async fn health_endpoint_is_always_ok() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let components = build_components(&config);
        components.scheduler.start().await.unwrap();
        let state = Arc::new(AppState { components });
        let app = build_app(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_endpoint_ok_without_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let components = build_components(&config);
        components.scheduler.start().await.unwrap();
        let state = Arc::new(AppState { components });
        let app = build_app(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ready")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_endpoint_unavailable_when_supervisor_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.supervisor.command = "sleep".into();
        config.supervisor.args = vec!["5".into()];
        let components = build_components(&config);
        components.scheduler.start().await.unwrap();
        // Deliberately not starting the supervisor.
        let state = Arc::new(AppState { components });
        let app = build_app(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ready")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    use tower::ServiceExt as _;
}
