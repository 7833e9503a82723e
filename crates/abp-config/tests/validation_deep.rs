// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deep validation tests for `abp-config`.

use abp_config::{
    AgentEventsSettings, AuditSettings, ConfigError, ConfigWarning, OrchestratorConfig,
    QueueSettings, SupervisorSettings, TrustModeSetting, merge_configs, parse_toml,
    validate_config,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fully-specified config with no validation warnings.
fn fully_valid_config() -> OrchestratorConfig {
    OrchestratorConfig {
        log_level: Some("info".into()),
        queue: QueueSettings {
            global_concurrency: 8,
            max_per_project: 100,
            max_global: 10_000,
            default_job_timeout_ms: 60_000,
            background_aging_ms: 15_000,
            max_interactive_burst: 3,
            stop_drain_ms: 2_000,
            snapshot_path: "orchestrator-jobs.json".into(),
        },
        supervisor: SupervisorSettings {
            command: "node".into(),
            args: vec!["host.js".into()],
            rpc_timeout_ms: 120_000,
            stop_grace_ms: 2_000,
            handshake_timeout_ms: 30_000,
        },
        agent_events: AgentEventsSettings {
            agents_root: "agents".into(),
            extension_sources: vec![],
            trust_mode: TrustModeSetting::Enforced,
            default_handler_timeout_ms: 30_000,
        },
        audit: AuditSettings {
            audit_path: "orchestrator-audit.log".into(),
        },
    }
}

/// Extract error reasons from a `ConfigError::ValidationError`.
fn validation_reasons(err: ConfigError) -> Vec<String> {
    match err {
        ConfigError::ValidationError { reasons } => reasons,
        other => panic!("expected ValidationError, got {other:?}"),
    }
}

// ===========================================================================
// 1. Valid configs pass validation with no warnings
// ===========================================================================

#[test]
fn fully_specified_config_has_no_warnings() {
    let warnings = validate_config(&fully_valid_config()).unwrap();
    assert!(warnings.is_empty(), "expected zero warnings: {warnings:?}");
}

#[test]
fn valid_config_all_log_levels() {
    for level in &["error", "warn", "info", "debug", "trace"] {
        let cfg = OrchestratorConfig {
            log_level: Some((*level).into()),
            ..fully_valid_config()
        };
        validate_config(&cfg).unwrap_or_else(|e| panic!("log_level '{level}' should be valid: {e}"));
    }
}

#[test]
fn valid_at_boundary_timeout_1ms() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.rpc_timeout_ms = 1;
    validate_config(&cfg).unwrap();
}

#[test]
fn valid_at_boundary_timeout_max() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.rpc_timeout_ms = 86_400_000;
    // Should pass but will warn about a large timeout.
    validate_config(&cfg).unwrap();
}

// ===========================================================================
// 2. Empty supervisor command skips timeout checks and only warns
// ===========================================================================

#[test]
fn empty_supervisor_command_is_a_warning_not_an_error() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.command = String::new();
    let warnings = validate_config(&cfg).unwrap();
    assert!(warnings.iter().any(|w| matches!(
        w,
        ConfigWarning::MissingOptionalField { field, .. } if field == "supervisor.command"
    )));
}

#[test]
fn whitespace_only_supervisor_command_is_treated_as_empty() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.command = "   \t  ".into();
    let warnings = validate_config(&cfg).unwrap();
    assert!(warnings.iter().any(|w| matches!(
        w,
        ConfigWarning::MissingOptionalField { field, .. } if field == "supervisor.command"
    )));
}

// ===========================================================================
// 3. Out-of-range timeouts are hard errors
// ===========================================================================

#[test]
fn timeout_exceeds_max_is_error() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.rpc_timeout_ms = 86_400_001;
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("out of range")));
}

#[test]
fn timeout_way_over_max_is_error() {
    let mut cfg = fully_valid_config();
    cfg.queue.default_job_timeout_ms = u64::MAX;
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("out of range")));
}

#[test]
fn zero_timeout_is_error() {
    let mut cfg = fully_valid_config();
    cfg.queue.default_job_timeout_ms = 0;
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("out of range")));
}

#[test]
fn zero_stop_drain_is_error() {
    let mut cfg = fully_valid_config();
    cfg.queue.stop_drain_ms = 0;
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("stop_drain_ms")));
}

// ===========================================================================
// 4. Invalid log levels generate errors
// ===========================================================================

#[test]
fn invalid_log_level_verbose() {
    let cfg = OrchestratorConfig {
        log_level: Some("verbose".into()),
        ..fully_valid_config()
    };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("invalid log_level")));
}

#[test]
fn invalid_log_level_uppercase() {
    let cfg = OrchestratorConfig {
        log_level: Some("INFO".into()),
        ..fully_valid_config()
    };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("invalid log_level")));
}

#[test]
fn invalid_log_level_empty_string() {
    let cfg = OrchestratorConfig {
        log_level: Some(String::new()),
        ..fully_valid_config()
    };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("invalid log_level")));
}

#[test]
fn none_log_level_is_valid() {
    let cfg = OrchestratorConfig {
        log_level: None,
        ..fully_valid_config()
    };
    validate_config(&cfg).unwrap();
}

// ===========================================================================
// 5. Multiple validation errors can be collected
// ===========================================================================

#[test]
fn multiple_errors_collected() {
    let mut cfg = fully_valid_config();
    cfg.log_level = Some("bad_level".into());
    cfg.queue.global_concurrency = 0;
    cfg.queue.default_job_timeout_ms = 0;
    cfg.agent_events.agents_root = String::new();
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(
        reasons.len() >= 4,
        "expected >= 4 errors, got {}: {reasons:?}",
        reasons.len()
    );
}

#[test]
fn max_per_project_exceeds_max_global_is_error() {
    let mut cfg = fully_valid_config();
    cfg.queue.max_per_project = 50_000;
    cfg.queue.max_global = 100;
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("max_per_project")));
}

#[test]
fn empty_agents_root_is_error() {
    let mut cfg = fully_valid_config();
    cfg.agent_events.agents_root = "   ".into();
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("agents_root")));
}

#[test]
fn empty_audit_path_is_error() {
    let mut cfg = fully_valid_config();
    cfg.audit.audit_path = String::new();
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("audit_path")));
}

#[test]
fn empty_snapshot_path_is_error() {
    let mut cfg = fully_valid_config();
    cfg.queue.snapshot_path = String::new();
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("snapshot_path")));
}

// ===========================================================================
// 6. Validation warnings for non-critical issues
// ===========================================================================

#[test]
fn large_timeout_warning_threshold() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.rpc_timeout_ms = 3_600_001; // just above 1hr
    let warnings = validate_config(&cfg).unwrap();
    assert!(warnings.iter().any(|w| matches!(
        w,
        ConfigWarning::LargeTimeout { field, ms } if field == "supervisor.rpc_timeout_ms" && *ms == 3_600_001
    )));
}

#[test]
fn exactly_at_threshold_no_large_timeout_warning() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.rpc_timeout_ms = 3_600_000;
    let warnings = validate_config(&cfg).unwrap();
    assert!(!warnings.iter().any(|w| matches!(w, ConfigWarning::LargeTimeout { .. })));
}

#[test]
fn just_below_threshold_no_large_timeout_warning() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.rpc_timeout_ms = 3_599_999;
    let warnings = validate_config(&cfg).unwrap();
    assert!(!warnings.iter().any(|w| matches!(w, ConfigWarning::LargeTimeout { .. })));
}

#[test]
fn multiple_large_timeouts_produce_multiple_warnings() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.rpc_timeout_ms = 7_200_000;
    cfg.agent_events.default_handler_timeout_ms = 43_200_000;
    let warnings = validate_config(&cfg).unwrap();
    let lt_count = warnings
        .iter()
        .filter(|w| matches!(w, ConfigWarning::LargeTimeout { .. }))
        .count();
    assert_eq!(lt_count, 2);
}

// ===========================================================================
// 7. Merged config validation
// ===========================================================================

#[test]
fn merged_valid_configs_still_valid() {
    let base = fully_valid_config();
    let overlay = OrchestratorConfig {
        log_level: Some("debug".into()),
        ..Default::default()
    };
    let merged = merge_configs(base, overlay);
    validate_config(&merged).unwrap();
}

#[test]
fn merge_introduces_invalid_log_level() {
    let base = fully_valid_config();
    let overlay = OrchestratorConfig {
        log_level: Some("banana".into()),
        ..Default::default()
    };
    let merged = merge_configs(base, overlay);
    let reasons = validation_reasons(validate_config(&merged).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("invalid log_level")));
}

#[test]
fn merge_overlay_fixes_base_timeout() {
    let mut base = fully_valid_config();
    base.queue.default_job_timeout_ms = 0;
    // base alone would fail validation; overlay repairs it.
    let mut overlay = OrchestratorConfig::default();
    overlay.queue.default_job_timeout_ms = 5_000;
    let merged = merge_configs(base, overlay);
    validate_config(&merged).unwrap();
}

#[test]
fn merged_config_accumulates_warnings() {
    let base = OrchestratorConfig::default();
    let mut overlay = OrchestratorConfig::default();
    overlay.supervisor.command = "node".into();
    overlay.supervisor.rpc_timeout_ms = 7_200_000;
    overlay.agent_events.default_handler_timeout_ms = 43_200_000;
    let merged = merge_configs(base, overlay);
    let warnings = validate_config(&merged).unwrap();
    // At least: large rpc timeout + large handler timeout.
    assert!(warnings.len() >= 2, "expected >= 2 warnings: {warnings:?}");
}

// ===========================================================================
// 8. Edge cases: very long strings, special characters
// ===========================================================================

#[test]
fn very_long_snapshot_path() {
    let mut cfg = fully_valid_config();
    cfg.queue.snapshot_path = "a".repeat(10_000);
    validate_config(&cfg).unwrap();
}

#[test]
fn very_long_supervisor_command() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.command = "x".repeat(100_000);
    validate_config(&cfg).unwrap();
}

#[test]
fn special_characters_in_paths() {
    let mut cfg = fully_valid_config();
    cfg.queue.snapshot_path = "/tmp/agent (copy)/work dir!/@#$/jobs.json".into();
    cfg.audit.audit_path = "/tmp/日本語/audit.log".into();
    validate_config(&cfg).unwrap();
}

#[test]
fn unicode_in_command_args() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.args = vec!["—flag".into(), "日本語".into()];
    validate_config(&cfg).unwrap();
}

#[test]
fn very_long_log_level_is_invalid() {
    let cfg = OrchestratorConfig {
        log_level: Some("x".repeat(1_000)),
        ..fully_valid_config()
    };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("invalid log_level")));
}

#[test]
fn many_extension_sources_all_valid() {
    let mut cfg = fully_valid_config();
    cfg.agent_events.extension_sources = (0..100).map(|i| format!("source_{i}")).collect();
    validate_config(&cfg).unwrap();
}

// ===========================================================================
// 9. Schema conformance after validation
// ===========================================================================

#[test]
fn valid_config_serializes_to_json() {
    let cfg = fully_valid_config();
    validate_config(&cfg).unwrap();
    let json = serde_json::to_string_pretty(&cfg).unwrap();
    assert!(json.contains("\"queue\""));
    assert!(json.contains("\"agent_events\""));
}

#[test]
fn valid_config_roundtrips_via_json() {
    let cfg = fully_valid_config();
    validate_config(&cfg).unwrap();
    let json = serde_json::to_string(&cfg).unwrap();
    let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(cfg, back);
}

#[test]
fn default_config_roundtrips_via_json() {
    let cfg = OrchestratorConfig::default();
    let json = serde_json::to_string(&cfg).unwrap();
    let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(cfg, back);
}

#[test]
fn toml_roundtrip_preserves_validity() {
    let cfg = fully_valid_config();
    validate_config(&cfg).unwrap();
    let toml_str = toml::to_string(&cfg).unwrap();
    let back = parse_toml(&toml_str).unwrap();
    let warnings = validate_config(&back).unwrap();
    assert!(warnings.is_empty());
}

#[test]
fn json_schema_can_be_generated() {
    let schema = schemars::schema_for!(OrchestratorConfig);
    let json = serde_json::to_string_pretty(&schema).unwrap();
    assert!(json.contains("OrchestratorConfig"));
}

// ===========================================================================
// 10. Validation idempotency (validate twice = same result)
// ===========================================================================

#[test]
fn idempotent_valid_config() {
    let cfg = fully_valid_config();
    let w1 = validate_config(&cfg).unwrap();
    let w2 = validate_config(&cfg).unwrap();
    assert_eq!(w1, w2);
}

#[test]
fn idempotent_default_config() {
    let cfg = OrchestratorConfig::default();
    let w1 = validate_config(&cfg).unwrap();
    let w2 = validate_config(&cfg).unwrap();
    assert_eq!(w1, w2);
}

#[test]
fn idempotent_invalid_config() {
    let cfg = OrchestratorConfig {
        log_level: Some("bad".into()),
        ..fully_valid_config()
    };
    let e1 = validate_config(&cfg).unwrap_err();
    let e2 = validate_config(&cfg).unwrap_err();
    let r1 = validation_reasons(e1);
    let r2 = validation_reasons(e2);
    assert_eq!(r1, r2);
}

#[test]
fn idempotent_multiple_errors() {
    let mut cfg = fully_valid_config();
    cfg.log_level = Some("nope".into());
    cfg.queue.global_concurrency = 0;
    let r1 = validation_reasons(validate_config(&cfg).unwrap_err());
    let r2 = validation_reasons(validate_config(&cfg).unwrap_err());
    assert_eq!(r1, r2);
}

// ===========================================================================
// Additional edge-case tests
// ===========================================================================

#[test]
fn config_with_no_extension_sources_is_valid() {
    let mut cfg = fully_valid_config();
    cfg.agent_events.extension_sources = Vec::new();
    validate_config(&cfg).unwrap();
}

#[test]
fn supervisor_command_with_leading_spaces_is_valid() {
    let mut cfg = fully_valid_config();
    cfg.supervisor.command = "  node".into(); // non-empty after trim
    validate_config(&cfg).unwrap();
}

#[test]
fn parse_toml_unknown_trust_mode_fails() {
    let toml_str = r#"
        [agent_events]
        trust_mode = "paranoid"
    "#;
    assert!(parse_toml(toml_str).is_err());
}

#[test]
fn config_warning_display_for_missing_optional() {
    let w = ConfigWarning::MissingOptionalField {
        field: "supervisor.command".into(),
        hint: "no runtime process will be supervised".into(),
    };
    let s = w.to_string();
    assert!(s.contains("supervisor.command"));
    assert!(s.contains("supervised"));
}

#[test]
fn validation_error_display_contains_all_reasons() {
    let err = ConfigError::ValidationError {
        reasons: vec!["reason one".into(), "reason two".into()],
    };
    let s = err.to_string();
    assert!(s.contains("reason one"));
    assert!(s.contains("reason two"));
}
