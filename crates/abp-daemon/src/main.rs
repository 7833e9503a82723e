// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use std::path::PathBuf;
use std::sync::Arc;

use abp_config::{ConfigWarning, load_config, validate_config};
use abp_daemon::{AppState, build_app, build_components, start_components, stop_components};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "abp-daemon", version, about = "Agent orchestration core daemon")]
struct Args {
    /// Path to `orchestrator.toml`. Falls back to built-in defaults if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address for the health/readiness surface.
    #[arg(long, default_value = "127.0.0.1:8088")]
    bind: String,

    /// Enable debug-level logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("abp_daemon=debug,abp_queue=debug,abp_agent_events=debug,abp_supervisor=debug,abp_audit_store=debug,info")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(args.config.as_deref()).with_context(|| {
        format!(
            "load config {}",
            args.config.as_deref().map_or_else(|| "<default>".into(), |p| p.display().to_string())
        )
    })?;
    let warnings = validate_config(&config).context("validate config")?;
    for w in &warnings {
        warn_config(w);
    }

    let components = build_components(&config);
    start_components(&components)
        .await
        .context("start orchestration components")?;

    let state = Arc::new(AppState { components });
    let app = build_app(state.clone());

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "abp-daemon listening");

    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => result.context("serve")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    stop_components(&state.components).await;
    Ok(())
}

fn warn_config(w: &ConfigWarning) {
    warn!(target: "abp.config", "{}", w);
}
