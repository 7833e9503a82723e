// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only persistence for extension reload audit records.
//!
//! `AuditStore::append` is the "serialized write queue" the orchestration
//! core asks for: a [`tokio::sync::Mutex`] held for the whole
//! read-modify-write cycle gives FIFO ordering across concurrent callers
//! without a separate actor or channel — a request that arrives mid-append
//! simply waits on the mutex and is guaranteed to see the prior request's
//! write before performing its own.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

/// Who requested a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// A human operator acting through an admin surface.
    Admin,
    /// The system itself (e.g. a startup or watch-triggered reload).
    System,
}

/// Where a reload request originated, if known.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestOrigin {
    /// Caller's IP address, if recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Caller's user agent, if recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Outcome of a reload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadResult {
    /// The new module table swapped in successfully.
    Success,
    /// The reload failed (e.g. an I/O or manifest error before any swap).
    Failed,
    /// The reload was rejected (e.g. an `enforced`-mode violation).
    Forbidden,
}

/// One recorded reload attempt.
///
/// `snapshot_before`/`snapshot_after` are opaque JSON values: the audit
/// store does not know the shape of the agent events runtime's loaded-module
/// table, it only durably records whatever the caller captured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReloadAuditRecord {
    /// Identifier for this reload attempt.
    pub reload_id: String,
    /// When the attempt was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Who requested the reload.
    pub actor_role: ActorRole,
    /// Identifier of the actor, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// Request origin metadata.
    #[serde(default)]
    pub request_origin: RequestOrigin,
    /// Outcome of the attempt.
    pub result: ReloadResult,
    /// Snapshot of the loaded-module table before the attempt.
    pub snapshot_before: serde_json::Value,
    /// Snapshot of the loaded-module table after a successful swap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_after: Option<serde_json::Value>,
    /// Trust mode in effect at the time of the attempt.
    pub trust_mode: String,
    /// Human-readable error summary, present on `failed`/`forbidden`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    /// Names of extensions whose loaded state changed (or would have).
    #[serde(default)]
    pub impacted_extensions: Vec<String>,
}

/// On-disk shape of the audit file: `{"version": 1, "records": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuditFile {
    version: u32,
    records: Vec<ReloadAuditRecord>,
}

impl AuditFile {
    fn new(records: Vec<ReloadAuditRecord>) -> Self {
        Self {
            version: 1,
            records,
        }
    }
}

/// Single-file, append-only audit record store.
pub struct AuditStore {
    path: PathBuf,
    // Guards the whole read-modify-write cycle of `append`, and is taken
    // (briefly) by `list` so it always observes a fully flushed file.
    write_queue: Mutex<()>,
}

impl AuditStore {
    /// Create a store backed by the audit file at `path`. Does not touch
    /// disk until the first [`append`](Self::append) or [`list`](Self::list).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_queue: Mutex::new(()),
        }
    }

    /// Append `record`, serializing against any other in-flight append.
    ///
    /// Reads the current file (treating missing or structurally invalid
    /// content as empty, per the file-shape contract), pushes `record`,
    /// atomically rewrites the whole file, and fsyncs.
    pub async fn append(&self, record: ReloadAuditRecord) -> anyhow::Result<()> {
        let _guard = self.write_queue.lock().await;
        let mut file = self.read_unlocked().await?;
        file.records.push(record);
        self.write_unlocked(&file).await
    }

    /// Return a copy of all records, waiting for any in-flight append to
    /// drain first so the read observes a consistent, fully-flushed file.
    pub async fn list(&self) -> anyhow::Result<Vec<ReloadAuditRecord>> {
        let _guard = self.write_queue.lock().await;
        Ok(self.read_unlocked().await?.records)
    }

    async fn read_unlocked(&self) -> anyhow::Result<AuditFile> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AuditFile::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("read audit file {}", self.path.display()));
            }
        };
        match serde_json::from_slice::<AuditFile>(&bytes) {
            Ok(f) => Ok(f),
            Err(e) => {
                warn!(
                    target: "abp.audit",
                    path = %self.path.display(),
                    error = %e,
                    "audit file is structurally invalid, treating as empty",
                );
                Ok(AuditFile::default())
            }
        }
    }

    async fn write_unlocked(&self, file: &AuditFile) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create audit dir {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(file).context("serialize audit file")?;
        atomic_write(&self.path, json.as_bytes())
            .await
            .with_context(|| format!("write audit file {}", self.path.display()))
    }
}

/// Write `contents` to `path` via a temp-sibling-then-rename, fsyncing both
/// the file and its parent directory. Mirrors the queue snapshot's
/// durability discipline (see `abp-queue::persist`).
async fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));

    {
        let mut f = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        f.write_all(contents).await?;
        f.sync_all().await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;

    if let Ok(dir) = tokio::fs::File::open(parent).await {
        // Best-effort directory fsync; not all platforms support it.
        let _ = dir.sync_all().await;
    }
    Ok(())
}
