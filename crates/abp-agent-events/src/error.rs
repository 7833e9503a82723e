// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent-events-local error enum, converted to [`abp_error::AbpError`] at
//! the crate boundary per the workspace's shared error taxonomy.

use abp_error::{AbpError, ErrorCode};
use thiserror::Error;

/// Errors returned by discovery, loading, and reload operations.
#[derive(Debug, Error)]
pub enum AgentEventsError {
    /// A module's `extension.manifest.json` failed structural validation.
    #[error("manifest invalid for module {module}: {reason}")]
    ManifestInvalid {
        /// The offending module's directory name.
        module: String,
        /// Human-readable validation failure.
        reason: String,
    },

    /// A module declared or defaulted to an events entrypoint that could
    /// not be resolved.
    #[error("entrypoint missing for module {module}: {reason}")]
    EntrypointMissing {
        /// The offending module's directory name.
        module: String,
        /// Human-readable resolution failure.
        reason: String,
    },

    /// A module's declared runtime/profile requirements are incompatible
    /// with this core's runtime.
    #[error("runtime incompatible for module {module}: {reason}")]
    RuntimeIncompatible {
        /// The offending module's directory name.
        module: String,
        /// Human-readable incompatibility reason.
        reason: String,
    },

    /// Discovery could not scan a configured root.
    #[error("discovery io error at {path}: {source}")]
    DiscoveryIo {
        /// The root or candidate path being scanned.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<AgentEventsError> for AbpError {
    fn from(err: AgentEventsError) -> Self {
        let code = match err {
            AgentEventsError::ManifestInvalid { .. } => ErrorCode::ManifestInvalid,
            AgentEventsError::EntrypointMissing { .. } => ErrorCode::EntrypointMissing,
            AgentEventsError::RuntimeIncompatible { .. } => ErrorCode::RuntimeIncompatible,
            AgentEventsError::DiscoveryIo { .. } => ErrorCode::Internal,
        };
        let message = err.to_string();
        AbpError::new(code, message).with_source(err)
    }
}

/// Result alias for this crate's fallible operations.
pub type AgentEventsResult<T> = Result<T, AgentEventsError>;
