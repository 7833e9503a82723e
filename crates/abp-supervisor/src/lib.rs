// SPDX-License-Identifier: MIT OR Apache-2.0
//! Crash-tolerant supervisor for the long-lived external runtime process.
//!
//! [`Supervisor`] spawns the child once, speaks newline-delimited JSON-RPC
//! over its stdin/stdout, and multiplexes concurrent [`Supervisor::call`]s
//! against a single pending-request table keyed by a monotonically
//! increasing id. Notifications and server-initiated requests the child
//! sends are fanned out to any number of listeners via broadcast channels,
//! so a slow or absent listener never blocks the stdout reader loop.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod process;
mod protocol;

use abp_error::{AbpError, ErrorCode};
use chrono::Utc;
pub use process::{HandshakeConfig, LastExit, ProcessStatus, SupervisorConfig, SupervisorStatus};
pub use protocol::{Incoming, NotificationOut, RequestOut, ResponseOut, RpcErrorObject};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, RwLock, broadcast, oneshot};
use tracing::{debug, warn};

/// A notification the child sent us, unmatched to any pending call.
#[derive(Debug, Clone)]
pub struct ServerNotification {
    /// The JSON-RPC method name.
    pub method: String,
    /// Method parameters, if any.
    pub params: Option<serde_json::Value>,
}

/// A request the child initiated toward us, awaiting a [`Supervisor::respond`]
/// or [`Supervisor::respond_error`].
#[derive(Debug, Clone)]
pub struct ServerRequest {
    /// The JSON-RPC method name.
    pub method: String,
    /// The id the caller must echo back in its response.
    pub id: serde_json::Value,
    /// Method parameters, if any.
    pub params: Option<serde_json::Value>,
}

/// What a pending call resolves to once its response (or the child's exit)
/// is observed.
enum CallOutcome {
    Ok(serde_json::Value),
    RpcError(RpcErrorObject),
    Exited,
    Stopped,
}

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<CallOutcome>>>;

/// Crash-tolerant, single-child JSON-RPC supervisor.
///
/// Clone-free: callers share one `Supervisor` behind an `Arc` (or simply
/// hold `&Supervisor`, since every method takes `&self`).
pub struct Supervisor {
    config: SupervisorConfig,
    status: Arc<RwLock<ProcessStatus>>,
    initialized: RwLock<bool>,
    last_exit: Arc<RwLock<Option<LastExit>>>,
    restart_count: AtomicU64,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    notifications: broadcast::Sender<ServerNotification>,
    server_requests: broadcast::Sender<ServerRequest>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stderr_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor for `config`. Does not spawn the child; call
    /// [`start`](Self::start) to do that.
    pub fn new(config: SupervisorConfig) -> Self {
        let (notifications, _) = broadcast::channel(256);
        let (server_requests, _) = broadcast::channel(256);
        Self {
            config,
            status: Arc::new(RwLock::new(ProcessStatus::NotStarted)),
            initialized: RwLock::new(false),
            last_exit: Arc::new(RwLock::new(None)),
            restart_count: AtomicU64::new(0),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            notifications,
            server_requests,
            reader_task: Mutex::new(None),
            stderr_task: Mutex::new(None),
        }
    }

    /// Current lifecycle status of the supervised process.
    pub async fn status(&self) -> ProcessStatus {
        *self.status.read().await
    }

    /// Full status snapshot: running/pid, handshake completion, and the
    /// most recent exit, per §4.3's `Status()` contract.
    pub async fn full_status(&self) -> SupervisorStatus {
        let status = self.status().await;
        let (running, pid) = match status {
            ProcessStatus::Running { pid } => (true, Some(pid)),
            _ => (false, None),
        };
        SupervisorStatus {
            running,
            pid,
            initialized: *self.initialized.read().await,
            last_exit: *self.last_exit.read().await,
        }
    }

    /// Number of times this supervisor has spawned a child (including the
    /// first `start()`). An outer restart loop can use this to detect churn;
    /// this crate does not auto-restart on its own.
    pub fn restart_count(&self) -> u64 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Subscribe to notifications the child sends us.
    pub fn on_notification(&self) -> broadcast::Receiver<ServerNotification> {
        self.notifications.subscribe()
    }

    /// Subscribe to server-initiated requests the child sends us.
    pub fn on_server_request(&self) -> broadcast::Receiver<ServerRequest> {
        self.server_requests.subscribe()
    }

    /// Spawn the child process and start its stdout dispatch loop.
    ///
    /// Idempotent only in the sense that calling `start` twice spawns two
    /// processes; callers are expected to call it exactly once per
    /// `Supervisor`.
    pub async fn start(&self) -> Result<(), AbpError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AbpError::new(ErrorCode::RpcNotRunning, format!("failed to spawn runtime process: {e}"))
                .with_source(e)
        })?;

        let pid = child.id().unwrap_or_default();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AbpError::new(ErrorCode::Internal, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AbpError::new(ErrorCode::Internal, "child stdout unavailable"))?;
        let stderr = child.stderr.take();

        *self.status.write().await = ProcessStatus::Running { pid };
        *self.initialized.write().await = false;
        self.restart_count.fetch_add(1, Ordering::Relaxed);
        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);

        if let Some(stderr) = stderr {
            let log_path = self.config.log_path.clone();
            let task = tokio::spawn(Self::drain_stderr(stderr, log_path));
            *self.stderr_task.lock().await = Some(task);
        }

        let pending = self.pending.clone();
        let notifications = self.notifications.clone();
        let server_requests = self.server_requests.clone();
        let status = self.status.clone();
        let last_exit = self.last_exit.clone();
        let task = tokio::spawn(Self::read_stdout(
            stdout,
            pending,
            notifications,
            server_requests,
            status,
            last_exit,
        ));
        *self.reader_task.lock().await = Some(task);

        if let Some(handshake) = self.config.handshake.clone() {
            let params = serde_json::json!({
                "clientInfo": {
                    "name": handshake.client_name,
                    "version": handshake.client_version,
                },
                "capabilities": handshake.capabilities,
            });
            let result = self
                .call_with_timeout::<serde_json::Value>("initialize", Some(params), handshake.timeout)
                .await;
            if let Err(e) = result {
                let _ = self.stop().await;
                return Err(e);
            }
            if let Err(e) = self.notify("initialized", None).await {
                let _ = self.stop().await;
                return Err(e);
            }
            *self.initialized.write().await = true;
        }

        Ok(())
    }

    async fn drain_stderr(stderr: tokio::process::ChildStderr, log_path: Option<std::path::PathBuf>) {
        let mut log_file = match &log_path {
            Some(path) => match open_append(path).await {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(target: "abp.supervisor", error = %e, "failed to open supervisor log file");
                    None
                }
            },
            None => None,
        };

        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = line.trim_end();
                    if text.is_empty() {
                        continue;
                    }
                    warn!(target: "abp.supervisor.stderr", "{text}");
                    if let Some(f) = log_file.as_mut() {
                        let _ = f.write_all(text.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                    }
                }
                Err(_) => break,
            }
        }
    }

    async fn read_stdout(
        stdout: tokio::process::ChildStdout,
        pending: Arc<PendingTable>,
        notifications: broadcast::Sender<ServerNotification>,
        server_requests: broadcast::Sender<ServerRequest>,
        status: Arc<RwLock<ProcessStatus>>,
        last_exit: Arc<RwLock<Option<LastExit>>>,
    ) {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            let n = match reader.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(target: "abp.supervisor", error = %e, "error reading child stdout");
                    break;
                }
            };
            if n == 0 {
                break;
            }
            let text = line.trim_end();
            if text.is_empty() {
                continue;
            }

            match Incoming::classify(text) {
                Ok(Some(Incoming::Response { id, result, error })) => {
                    let key = id_to_u64(&id);
                    let mut table = pending.lock().await;
                    if let Some(tx) = key.and_then(|k| table.remove(&k)) {
                        let outcome = match error {
                            Some(err) => CallOutcome::RpcError(err),
                            None => CallOutcome::Ok(result.unwrap_or(serde_json::Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    } else {
                        warn!(target: "abp.supervisor", id = %id, "response for unknown or already-resolved request id");
                    }
                }
                Ok(Some(Incoming::Notification { method, params })) => {
                    let _ = notifications.send(ServerNotification { method, params });
                }
                Ok(Some(Incoming::ServerRequest { method, id, params })) => {
                    let _ = server_requests.send(ServerRequest { method, id, params });
                }
                Ok(None) => {
                    warn!(target: "abp.supervisor", line = %text, "dropping line with neither method nor id");
                }
                Err(e) => {
                    warn!(target: "abp.supervisor", line = %text, error = %e, "dropping unparsable line");
                }
            }
        }

        // The child went away on its own (EOF on stdout without a prior
        // `stop()`). Record it as crashed unless we were already stopped.
        {
            let mut s = status.write().await;
            if !matches!(*s, ProcessStatus::Stopped) {
                *s = ProcessStatus::Crashed { code: None };
                *last_exit.write().await = Some(LastExit {
                    code: None,
                    signal: None,
                    at: Utc::now(),
                });
            }
        }

        // Reject every still-pending call: the child is gone.
        let mut table = pending.lock().await;
        for (_, tx) in table.drain() {
            let _ = tx.send(CallOutcome::Exited);
        }
    }

    /// Send a request and wait for its matching response, using the
    /// supervisor's configured default timeout.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Result<T, AbpError> {
        self.call_with_timeout(method, params, self.config.rpc_timeout).await
    }

    /// Send a request and wait for its matching response, with an explicit
    /// per-call timeout overriding the supervisor's default.
    pub async fn call_with_timeout<T: DeserializeOwned>(
        &self,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        timeout: std::time::Duration,
    ) -> Result<T, AbpError> {
        if !self.status().await.is_running() {
            return Err(AbpError::new(ErrorCode::RpcNotRunning, "codex app-server is not running"));
        }

        let method = method.into();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = RequestOut {
            method: method.clone(),
            id: serde_json::json!(id),
            params,
        };
        if let Err(e) = self.write_line(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(CallOutcome::Ok(value))) => serde_json::from_value(value).map_err(|e| {
                AbpError::new(ErrorCode::Internal, format!("failed to decode {method} response: {e}"))
            }),
            Ok(Ok(CallOutcome::RpcError(rpc_err))) => Err(AbpError::new(
                ErrorCode::RpcError,
                format!("codex rpc error {}: {}", rpc_err.code, rpc_err.message),
            )
            .with_context("method", &method)),
            Ok(Ok(CallOutcome::Exited)) => Err(AbpError::new(
                ErrorCode::RpcExitedBeforeResponding,
                "codex app-server exited before responding",
            )),
            Ok(Ok(CallOutcome::Stopped)) => {
                Err(AbpError::new(ErrorCode::RpcStopped, "codex app-server stopped"))
            }
            Ok(Err(_)) => {
                // Sender dropped without sending: only happens if `stop()`'s
                // cleanup raced us and already rejected this id.
                Err(AbpError::new(ErrorCode::RpcStopped, "codex app-server stopped"))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AbpError::new(ErrorCode::RpcTimeout, format!("codex request timed out: {method}")))
            }
        }
    }

    /// Send a fire-and-forget notification. Does not wait for any response.
    pub async fn notify(&self, method: impl Into<String>, params: Option<serde_json::Value>) -> Result<(), AbpError> {
        if !self.status().await.is_running() {
            return Err(AbpError::new(ErrorCode::RpcNotRunning, "runtime process is not running"));
        }
        let notification = NotificationOut {
            method: method.into(),
            params,
        };
        self.write_line(&notification).await
    }

    /// Respond to a server-initiated request with a success result.
    pub async fn respond(&self, id: serde_json::Value, result: serde_json::Value) -> Result<(), AbpError> {
        let response = ResponseOut {
            id,
            result: Some(result),
            error: None,
        };
        self.write_line(&response).await
    }

    /// Respond to a server-initiated request with an error.
    pub async fn respond_error(&self, id: serde_json::Value, error: RpcErrorObject) -> Result<(), AbpError> {
        let response = ResponseOut {
            id,
            result: None,
            error: Some(error),
        };
        self.write_line(&response).await
    }

    async fn write_line<T: Serialize>(&self, value: &T) -> Result<(), AbpError> {
        let mut json = serde_json::to_string(value)
            .map_err(|e| AbpError::new(ErrorCode::Internal, format!("failed to encode rpc message: {e}")))?;
        json.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| AbpError::new(ErrorCode::RpcNotRunning, "runtime process is not running"))?;
        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| AbpError::new(ErrorCode::RpcNotRunning, format!("failed to write to runtime stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| AbpError::new(ErrorCode::RpcNotRunning, format!("failed to flush runtime stdin: {e}")))
    }

    /// Gracefully stop the child: close stdin (EOF, the cooperative shutdown
    /// signal since sending a raw OS signal would require `unsafe`), wait up
    /// to the configured grace period, then forcibly kill if still alive.
    pub async fn stop(&self) -> Result<(), AbpError> {
        if !self.status().await.is_running() {
            return Ok(());
        }

        // Reject any call still awaiting a response before we tear anything
        // down, so callers see "stopped" rather than a spurious exit error.
        {
            let mut table = self.pending.lock().await;
            for (_, tx) in table.drain() {
                let _ = tx.send(CallOutcome::Stopped);
            }
        }

        // Dropping stdin closes the write end the child reads from, giving
        // it EOF — a safe-Rust equivalent of SIGTERM for a well-behaved
        // line-oriented child.
        self.stdin.lock().await.take();

        let mut child_guard = self.child.lock().await;
        let Some(child) = child_guard.as_mut() else {
            *self.status.write().await = ProcessStatus::Stopped;
            return Ok(());
        };

        let exited = tokio::time::timeout(self.config.stop_grace, child.wait()).await;
        let exit_code = match exited {
            Ok(Ok(exit_status)) => {
                *self.status.write().await = ProcessStatus::Stopped;
                exit_status.code()
            }
            Ok(Err(e)) => {
                warn!(target: "abp.supervisor", error = %e, "error waiting for runtime process to exit");
                *self.status.write().await = ProcessStatus::Stopped;
                None
            }
            Err(_) => {
                debug!(target: "abp.supervisor", "runtime process did not exit within grace period, killing");
                let _ = child.kill().await;
                let exit_status = child.wait().await.ok();
                *self.status.write().await = ProcessStatus::Stopped;
                exit_status.and_then(|s| s.code())
            }
        };
        *self.last_exit.write().await = Some(LastExit {
            code: exit_code,
            signal: None,
            at: Utc::now(),
        });

        if let Some(task) = self.reader_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.lock().await.take() {
            let _ = task.await;
        }

        Ok(())
    }
}

fn id_to_u64(id: &serde_json::Value) -> Option<u64> {
    id.as_u64()
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn echo_config(script: &str) -> SupervisorConfig {
        let mut config = SupervisorConfig::new("sh");
        config.args = vec!["-c".to_string(), script.to_string()];
        config.rpc_timeout = Duration::from_millis(2_000);
        config.stop_grace = Duration::from_millis(500);
        config
    }

    #[tokio::test]
    async fn call_receives_matching_response() {
        // Reads one line, echoes back a response with the same id.
        let script = r#"
            read line
            id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            echo "{\"id\":$id,\"result\":{\"ok\":true}}"
            cat > /dev/null
        "#;
        let supervisor = Supervisor::new(echo_config(script));
        supervisor.start().await.unwrap();

        let result: serde_json::Value = supervisor.call("ping", None).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn call_times_out_when_child_never_responds() {
        let supervisor = Supervisor::new(echo_config("sleep 5"));
        supervisor.start().await.unwrap();

        let err = supervisor
            .call_with_timeout::<serde_json::Value>("ping", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RpcTimeout);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pending_calls_rejected_when_child_exits() {
        let supervisor = Supervisor::new(echo_config("exit 1"));
        supervisor.start().await.unwrap();

        let err = supervisor
            .call_with_timeout::<serde_json::Value>("ping", None, Duration::from_millis(2_000))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RpcExitedBeforeResponding);
    }

    #[tokio::test]
    async fn notify_does_not_wait_for_response() {
        let supervisor = Supervisor::new(echo_config("cat > /dev/null"));
        supervisor.start().await.unwrap();
        supervisor.notify("progress", Some(serde_json::json!({"pct": 50}))).await.unwrap();
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn notification_from_child_is_broadcast() {
        let script = r#"echo '{"method":"tokenCount","params":{"n":5}}'; cat > /dev/null"#;
        let supervisor = Supervisor::new(echo_config(script));
        let mut rx = supervisor.on_notification();
        supervisor.start().await.unwrap();

        let notification = tokio::time::timeout(Duration::from_millis(1_000), rx.recv())
            .await
            .expect("did not receive notification in time")
            .unwrap();
        assert_eq!(notification.method, "tokenCount");

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn status_reflects_lifecycle() {
        let supervisor = Supervisor::new(echo_config("cat > /dev/null"));
        assert_eq!(supervisor.status().await, ProcessStatus::NotStarted);
        supervisor.start().await.unwrap();
        assert!(supervisor.status().await.is_running());
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.status().await, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn call_before_start_fails_without_running_process() {
        let supervisor = Supervisor::new(echo_config("cat > /dev/null"));
        let err = supervisor
            .call::<serde_json::Value>("ping", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RpcNotRunning);
    }

    #[tokio::test]
    async fn handshake_completes_before_start_returns() {
        let script = r#"
            read line
            id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            echo "{\"id\":$id,\"result\":{}}"
            cat > /dev/null
        "#;
        let mut config = echo_config(script);
        config.handshake = Some(process::HandshakeConfig {
            client_name: "abp-daemon".to_string(),
            client_version: "0.1.0".to_string(),
            capabilities: serde_json::json!({}),
            timeout: Duration::from_millis(2_000),
        });
        let supervisor = Supervisor::new(config);
        supervisor.start().await.unwrap();
        assert!(supervisor.full_status().await.initialized);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn handshake_failure_stops_the_child_and_propagates() {
        let mut config = echo_config("exit 1");
        config.handshake = Some(process::HandshakeConfig {
            client_name: "abp-daemon".to_string(),
            client_version: "0.1.0".to_string(),
            capabilities: serde_json::json!({}),
            timeout: Duration::from_millis(500),
        });
        let supervisor = Supervisor::new(config);
        // The child exits almost immediately, so the handshake's `initialize`
        // call fails one way or another (write error or exited-before-responding)
        // and `start` must propagate that failure rather than report success.
        assert!(supervisor.start().await.is_err());
        assert!(!supervisor.status().await.is_running());
    }

    #[tokio::test]
    async fn pending_calls_rejected_with_stopped_error_on_stop() {
        let supervisor = Arc::new(Supervisor::new(echo_config("sleep 5")));
        supervisor.start().await.unwrap();

        let sup = supervisor.clone();
        let call = tokio::spawn(async move {
            sup.call_with_timeout::<serde_json::Value>("ping", None, Duration::from_secs(10))
                .await
        });

        // Give the call a moment to register in the pending table.
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.stop().await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::RpcStopped);
    }

    #[tokio::test]
    async fn full_status_reports_restart_count_and_last_exit() {
        let supervisor = Supervisor::new(echo_config("cat > /dev/null"));
        assert_eq!(supervisor.restart_count(), 0);
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.restart_count(), 1);
        supervisor.stop().await.unwrap();
        let status = supervisor.full_status().await;
        assert!(!status.running);
        assert!(status.last_exit.is_some());
    }

    #[tokio::test]
    async fn crash_without_explicit_stop_is_recorded() {
        let supervisor = Supervisor::new(echo_config("exit 3"));
        supervisor.start().await.unwrap();
        // Let the child exit and the reader loop observe EOF.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = supervisor.full_status().await;
        assert!(!status.running);
    }
}
