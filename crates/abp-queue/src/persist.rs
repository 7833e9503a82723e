// SPDX-License-Identifier: MIT OR Apache-2.0
//! Atomic snapshot persistence for the job table, per spec §3 and §6.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::job::Job;

/// On-disk shape of the snapshot file: `{"version": 1, "jobs": [...]}`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub jobs: Vec<Job>,
}

impl QueueSnapshot {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self { version: 1, jobs: normalize(jobs) }
    }
}

/// De-duplicates jobs by `id`, keeping the last occurrence (last-write-wins
/// within a single save), per spec §3.
fn normalize(jobs: Vec<Job>) -> Vec<Job> {
    let mut by_id: std::collections::HashMap<String, Job> = std::collections::HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for job in jobs {
        if !by_id.contains_key(&job.id) {
            order.push(job.id.clone());
        }
        by_id.insert(job.id.clone(), job);
    }
    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

/// Load the snapshot at `path`. A missing file is an empty snapshot. A
/// structurally invalid file is quarantined (renamed to
/// `<name>.corrupt-<unix_ms>`) and treated as empty; if even the quarantine
/// rename fails, the file is best-effort overwritten with an empty snapshot
/// on the next save.
pub async fn load(path: &Path) -> std::io::Result<QueueSnapshot> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(QueueSnapshot::default()),
        Err(e) => return Err(e),
    };

    match serde_json::from_slice::<QueueSnapshot>(&bytes) {
        Ok(mut snap) => {
            snap.jobs = normalize(snap.jobs);
            Ok(snap)
        }
        Err(e) => {
            warn!(
                target: "abp.queue",
                path = %path.display(),
                error = %e,
                "snapshot file is structurally invalid, quarantining",
            );
            quarantine(path).await;
            Ok(QueueSnapshot::default())
        }
    }
}

async fn quarantine(path: &Path) {
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let quarantined = path.with_file_name(format!("{file_name}.corrupt-{unix_ms}"));
    if let Err(e) = tokio::fs::rename(path, &quarantined).await {
        warn!(
            target: "abp.queue",
            path = %path.display(),
            error = %e,
            "failed to quarantine corrupt snapshot, will overwrite on next save",
        );
    }
}

/// Atomically persist `snapshot` to `path`: serialize canonically (pretty,
/// trailing newline), write to a temp sibling, fsync, rename over the
/// target, then best-effort fsync the parent directory.
pub async fn save(path: &Path, snapshot: &QueueSnapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut json = serde_json::to_string_pretty(snapshot)?;
    json.push('\n');
    atomic_write(path, json.as_bytes()).await
}

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
        let _ = dir.sync_all().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, Priority};
    use tempfile::tempdir;

    fn job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            job_type: "t".to_string(),
            version: 1,
            project_id: "p".to_string(),
            source_session_id: None,
            priority: Priority::Interactive,
            state: JobState::Queued,
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

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let snap = load(&dir.path().join("missing.json")).await.unwrap();
        assert!(snap.jobs.is_empty());
        assert_eq!(snap.version, 0);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orchestrator-jobs.json");
        let snap = QueueSnapshot::new(vec![job("a"), job("b")]);
        save(&path, &snap).await.unwrap();

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.jobs.len(), 2);
    }

    #[tokio::test]
    async fn normalize_dedupes_by_id_last_write_wins() {
        let mut a = job("a");
        a.attempts = 1;
        let mut a2 = job("a");
        a2.attempts = 2;
        let snap = QueueSnapshot::new(vec![a, job("b"), a2]);
        assert_eq!(snap.jobs.len(), 2);
        let found = snap.jobs.iter().find(|j| j.id == "a").unwrap();
        assert_eq!(found.attempts, 2);
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_and_loads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orchestrator-jobs.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let snap = load(&path).await.unwrap();
        assert!(snap.jobs.is_empty());
        assert!(!tokio::fs::try_exists(&path).await.unwrap());

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut found_quarantine = false;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains("corrupt-") {
                found_quarantine = true;
            }
        }
        assert!(found_quarantine);
    }
}
