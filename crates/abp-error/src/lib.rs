// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the orchestration core.
//!
//! Every error raised by the queue, the agent events runtime, the supervisor,
//! or the audit store carries an [`ErrorCode`] (a machine-readable, stable
//! string tag — the same strings a `Job.error` field or an RPC rejection
//! message is built from), a human-readable message, an optional cause
//! chain, and arbitrary key-value context. Use the builder returned by
//! [`AbpError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Enqueue admission errors (`invalid_payload`, `queue_full`, `job_conflict`).
    Enqueue,
    /// Job execution errors (`timeout`, `shutdown`, run failures).
    Execution,
    /// Runtime-process supervisor RPC errors.
    Rpc,
    /// Agent events runtime errors (handler, manifest, trust).
    AgentEvents,
    /// Extension trust-gate violations.
    Trust,
    /// Configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Enqueue => "enqueue",
            Self::Execution => "execution",
            Self::Rpc => "rpc",
            Self::AgentEvents => "agent_events",
            Self::Trust => "trust",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant's [`ErrorCode::as_str`] is the literal string used on the
/// wire — as a `Job.error` value, an emit-result `handler_error.code`, or
/// embedded in a formatted RPC rejection message. These strings are
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // -- Enqueue --
    /// `type` is unknown or `payload` failed the definition's schema.
    InvalidPayload,
    /// Per-project or global capacity would be exceeded.
    QueueFull,
    /// A conflicting job already occupies the dedupe slot.
    JobConflict,

    // -- Execution --
    /// The job's `timeoutMs` elapsed before `run` returned.
    Timeout,
    /// The job was canceled because the scheduler is stopping.
    Shutdown,
    /// `Stop` force-canceled a job that did not settle within `drainMs`.
    ShutdownTimeout,
    /// `Cancel` force-canceled a job that did not settle within `gracefulWaitMs`.
    InterruptTimeout,
    /// Crash recovery found a `running` job already at `maxAttempts`.
    RecoveryMaxAttemptsExceeded,

    // -- RPC --
    /// The child replied with a JSON-RPC `error` object.
    RpcError,
    /// A `Call` did not receive a matching response before its timeout.
    RpcTimeout,
    /// `Call`/`Notify` invoked before `Start` completed (or after `Stop`).
    RpcNotRunning,
    /// The child process exited while a request was still pending.
    RpcExitedBeforeResponding,
    /// The supervisor has been stopped; pending requests were rejected.
    RpcStopped,

    // -- Agent events --
    /// A handler did not return within its effective timeout.
    HandlerTimeout,
    /// A handler threw/returned an error.
    HandlerException,
    /// A handler call was rejected by the post-timeout capability guard.
    CapabilityDenied,
    /// An extension's manifest failed structural validation.
    ManifestInvalid,
    /// An extension declared no resolvable events entrypoint.
    EntrypointMissing,
    /// An extension's declared runtime/profile compatibility check failed.
    RuntimeIncompatible,

    // -- Trust --
    /// An extension registered or attempted an undeclared capability.
    TrustViolation,

    // -- Config --
    /// Configuration file or value is invalid.
    ConfigInvalid,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPayload | Self::QueueFull | Self::JobConflict => ErrorCategory::Enqueue,

            Self::Timeout
            | Self::Shutdown
            | Self::ShutdownTimeout
            | Self::InterruptTimeout
            | Self::RecoveryMaxAttemptsExceeded => ErrorCategory::Execution,

            Self::RpcError
            | Self::RpcTimeout
            | Self::RpcNotRunning
            | Self::RpcExitedBeforeResponding
            | Self::RpcStopped => ErrorCategory::Rpc,

            Self::HandlerTimeout
            | Self::HandlerException
            | Self::CapabilityDenied
            | Self::ManifestInvalid
            | Self::EntrypointMissing
            | Self::RuntimeIncompatible => ErrorCategory::AgentEvents,

            Self::TrustViolation => ErrorCategory::Trust,

            Self::ConfigInvalid => ErrorCategory::Config,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` wire representation (e.g. `"queue_full"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::QueueFull => "queue_full",
            Self::JobConflict => "job_conflict",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
            Self::ShutdownTimeout => "shutdown_timeout",
            Self::InterruptTimeout => "interrupt_timeout",
            Self::RecoveryMaxAttemptsExceeded => "recovery_max_attempts_exceeded",
            Self::RpcError => "rpc_error",
            Self::RpcTimeout => "rpc_timeout",
            Self::RpcNotRunning => "rpc_not_running",
            Self::RpcExitedBeforeResponding => "rpc_exited_before_responding",
            Self::RpcStopped => "rpc_stopped",
            Self::HandlerTimeout => "handler_timeout",
            Self::HandlerException => "handler_exception",
            Self::CapabilityDenied => "capability_denied",
            Self::ManifestInvalid => "manifest_invalid",
            Self::EntrypointMissing => "entrypoint_missing",
            Self::RuntimeIncompatible => "runtime_incompatible",
            Self::TrustViolation => "trust_violation",
            Self::ConfigInvalid => "config_invalid",
            Self::Internal => "internal",
        }
    }

    /// HTTP-style status code for enqueue-admission errors; `None` for codes
    /// that are not surfaced across an HTTP-like boundary.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::InvalidPayload => Some(400),
            Self::QueueFull => Some(429),
            Self::JobConflict => Some(409),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AbpError
// ---------------------------------------------------------------------------

/// Unified orchestration-core error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use abp_error::{AbpError, ErrorCode};
///
/// let err = AbpError::new(ErrorCode::QueueFull, "project capacity exceeded")
///     .with_context("project_id", "p1")
///     .with_context("max_per_project", 4);
/// ```
pub struct AbpError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl AbpError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// The `Job.error` / wire string this error reduces to: the message if
    /// non-empty (trimmed), else the code's stable identifier, matching the
    /// "preserved verbatim, trimmed; empty ⇒ unknown error" propagation rule.
    pub fn wire_message(&self) -> String {
        let trimmed = self.message.trim();
        if trimmed.is_empty() {
            "unknown error".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

impl fmt::Debug for AbpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AbpError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for AbpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AbpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of an [`AbpError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbpErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&AbpError> for AbpErrorDto {
    fn from(err: &AbpError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<AbpErrorDto> for AbpError {
    fn from(dto: AbpErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    /// All error codes for exhaustive iteration in tests.
    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::InvalidPayload,
        ErrorCode::QueueFull,
        ErrorCode::JobConflict,
        ErrorCode::Timeout,
        ErrorCode::Shutdown,
        ErrorCode::ShutdownTimeout,
        ErrorCode::InterruptTimeout,
        ErrorCode::RecoveryMaxAttemptsExceeded,
        ErrorCode::RpcError,
        ErrorCode::RpcTimeout,
        ErrorCode::RpcNotRunning,
        ErrorCode::RpcExitedBeforeResponding,
        ErrorCode::RpcStopped,
        ErrorCode::HandlerTimeout,
        ErrorCode::HandlerException,
        ErrorCode::CapabilityDenied,
        ErrorCode::ManifestInvalid,
        ErrorCode::EntrypointMissing,
        ErrorCode::RuntimeIncompatible,
        ErrorCode::TrustViolation,
        ErrorCode::ConfigInvalid,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = AbpError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = AbpError::new(ErrorCode::QueueFull, "project capacity exceeded");
        assert_eq!(err.to_string(), "[queue_full] project capacity exceeded");
    }

    #[test]
    fn display_with_context() {
        let err = AbpError::new(ErrorCode::Timeout, "timed out").with_context("timeout_ms", 5000);
        let s = err.to_string();
        assert!(s.starts_with("[timeout] timed out"));
        assert!(s.contains("timeout_ms"));
        assert!(s.contains("5000"));
    }

    #[test]
    fn wire_message_trims_and_defaults() {
        let err = AbpError::new(ErrorCode::Internal, "  ");
        assert_eq!(err.wire_message(), "unknown error");
        let err = AbpError::new(ErrorCode::Internal, "  boom  ");
        assert_eq!(err.wire_message(), "boom");
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = AbpError::new(ErrorCode::ConfigInvalid, "init failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn enqueue_codes_categorised_and_have_status() {
        for (code, status) in [
            (ErrorCode::InvalidPayload, 400),
            (ErrorCode::QueueFull, 429),
            (ErrorCode::JobConflict, 409),
        ] {
            assert_eq!(code.category(), ErrorCategory::Enqueue);
            assert_eq!(code.status_code(), Some(status));
        }
    }

    #[test]
    fn execution_codes_categorised() {
        for code in [
            ErrorCode::Timeout,
            ErrorCode::Shutdown,
            ErrorCode::ShutdownTimeout,
            ErrorCode::InterruptTimeout,
            ErrorCode::RecoveryMaxAttemptsExceeded,
        ] {
            assert_eq!(code.category(), ErrorCategory::Execution);
            assert_eq!(code.status_code(), None);
        }
    }

    #[test]
    fn rpc_codes_categorised() {
        for code in [
            ErrorCode::RpcError,
            ErrorCode::RpcTimeout,
            ErrorCode::RpcNotRunning,
            ErrorCode::RpcExitedBeforeResponding,
            ErrorCode::RpcStopped,
        ] {
            assert_eq!(code.category(), ErrorCategory::Rpc);
        }
    }

    #[test]
    fn agent_events_codes_categorised() {
        for code in [
            ErrorCode::HandlerTimeout,
            ErrorCode::HandlerException,
            ErrorCode::CapabilityDenied,
            ErrorCode::ManifestInvalid,
            ErrorCode::EntrypointMissing,
            ErrorCode::RuntimeIncompatible,
        ] {
            assert_eq!(code.category(), ErrorCategory::AgentEvents);
        }
    }

    #[test]
    fn trust_and_config_and_internal_categorised() {
        assert_eq!(ErrorCode::TrustViolation.category(), ErrorCategory::Trust);
        assert_eq!(ErrorCode::ConfigInvalid.category(), ErrorCategory::Config);
        assert_eq!(ErrorCode::Internal.category(), ErrorCategory::Internal);
    }

    #[test]
    fn builder_with_context_multiple_keys() {
        let err = AbpError::new(ErrorCode::Timeout, "timeout")
            .with_context("job_id", "abc")
            .with_context("timeout_ms", 30_000)
            .with_context("attempt", 3);
        assert_eq!(err.context.len(), 3);
        assert_eq!(err.context["job_id"], serde_json::json!("abc"));
        assert_eq!(err.context["timeout_ms"], serde_json::json!(30_000));
        assert_eq!(err.context["attempt"], serde_json::json!(3));
    }

    #[test]
    fn builder_with_source() {
        let src = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = AbpError::new(ErrorCode::TrustViolation, "denied").with_source(src);
        assert!(err.source.is_some());
        let displayed = err.source.as_ref().unwrap().to_string();
        assert_eq!(displayed, "access denied");
    }

    #[test]
    fn category_shorthand() {
        let err = AbpError::new(ErrorCode::RuntimeIncompatible, "incompatible profile");
        assert_eq!(err.category(), ErrorCategory::AgentEvents);
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::QueueFull;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""queue_full""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn error_category_serde_roundtrip() {
        let cat = ErrorCategory::Rpc;
        let json = serde_json::to_string(&cat).unwrap();
        assert_eq!(json, r#""rpc""#);
        let back: ErrorCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cat);
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = AbpError::new(ErrorCode::ManifestInvalid, "bad manifest")
            .with_context("module", "suggest-reply");
        let dto: AbpErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: AbpErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = AbpError::new(ErrorCode::RpcExitedBeforeResponding, "crash").with_source(src);
        let dto: AbpErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("pipe broke"));
        let json = serde_json::to_string(&dto).unwrap();
        assert!(json.contains("pipe broke"));
    }

    #[test]
    fn dto_to_abp_error() {
        let dto = AbpErrorDto {
            code: ErrorCode::ConfigInvalid,
            message: "bad".into(),
            context: BTreeMap::new(),
            source_message: Some("inner".into()),
        };
        let err: AbpError = dto.into();
        assert_eq!(err.code, ErrorCode::ConfigInvalid);
        // Source is lost in DTO → AbpError conversion (opaque type).
        assert!(err.source.is_none());
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = AbpError::new(ErrorCode::EntrypointMissing, "staging").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn std_error_source_none_by_default() {
        let err = AbpError::new(ErrorCode::Internal, "oops");
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            let s = code.as_str();
            assert!(seen.insert(s), "duplicate as_str value: {s}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn error_code_count() {
        // Ensure we don't silently drop a variant from ALL_CODES.
        assert_eq!(ALL_CODES.len(), 22);
    }

    #[test]
    fn all_codes_serialize_to_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let expected = format!(r#""{}""#, code.as_str());
            assert_eq!(json, expected, "mismatch for {code:?}");
        }
    }

    #[test]
    fn context_with_nested_json() {
        let err = AbpError::new(ErrorCode::Internal, "nested")
            .with_context("details", serde_json::json!({"a": 1, "b": [2, 3]}));
        assert_eq!(
            err.context["details"],
            serde_json::json!({"a": 1, "b": [2, 3]})
        );
    }
}
