//! Subprocess-backed SDK adapter.
//!
//! Shells out to the agent CLI and speaks its streaming JSON-lines
//! protocol: typed messages arrive one JSON object per stdout line,
//! user messages and control requests are written to stdin. Tool
//! permission checks arrive as `control_request` lines and are answered
//! inline after consulting the [`PermissionHook`].

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{LegionError, Result};
use crate::session::PermissionMode;

use super::{
    AgentSdk, PermissionContext, PermissionHook, SdkErrorKind, SdkEvent, SdkFactory,
    SdkSessionSpec,
};

/// Default executable name of the agent CLI.
const DEFAULT_AGENT_BIN: &str = "claude";

/// SDK adapter that runs the agent CLI as a child process.
pub struct ProcessSdk {
    spec: SdkSessionSpec,
    agent_bin: String,
    events: mpsc::Sender<SdkEvent>,
    permissions: Arc<dyn PermissionHook>,
    child: Mutex<Option<Child>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    running: Arc<AtomicBool>,
}

impl ProcessSdk {
    pub fn new(
        spec: SdkSessionSpec,
        agent_bin: String,
        events: mpsc::Sender<SdkEvent>,
        permissions: Arc<dyn PermissionHook>,
    ) -> Self {
        Self {
            spec,
            agent_bin,
            events,
            permissions,
            child: Mutex::new(None),
            stdin: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.agent_bin);
        cmd.current_dir(&self.spec.working_directory)
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--permission-mode")
            .arg(self.spec.permission_mode.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(model) = &self.spec.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(token) = &self.spec.resume_token {
            cmd.arg("--resume").arg(token);
        }
        if let Some(prompt) = &self.spec.system_prompt {
            if self.spec.override_system_prompt {
                cmd.arg("--system-prompt").arg(prompt);
            } else {
                cmd.arg("--append-system-prompt").arg(prompt);
            }
        }
        if !self.spec.allowed_tools.is_empty() {
            cmd.arg("--allowed-tools")
                .arg(self.spec.allowed_tools.join(","));
        }
        if !self.spec.disallowed_tools.is_empty() {
            cmd.arg("--disallowed-tools")
                .arg(self.spec.disallowed_tools.join(","));
        }
        if !self.spec.setting_sources.is_empty() {
            cmd.arg("--setting-sources")
                .arg(self.spec.setting_sources.join(","));
        }
        cmd
    }

    /// Answer a `control_request` line (tool permission check) and
    /// write the response back to the subprocess.
    async fn handle_control_request(
        session_id: &str,
        request: &Value,
        permissions: &Arc<dyn PermissionHook>,
        stdin: &Arc<Mutex<Option<ChildStdin>>>,
    ) {
        let request_id = request.get("request_id").cloned().unwrap_or(Value::Null);
        let body = request.get("request").cloned().unwrap_or(Value::Null);
        let tool_name = body
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let input = body.get("input").cloned().unwrap_or(json!({}));
        let suggestions = body
            .get("permission_suggestions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let decision = permissions
            .can_use_tool(
                session_id,
                &tool_name,
                &input,
                PermissionContext { suggestions },
            )
            .await;

        let response = json!({
            "type": "control_response",
            "request_id": request_id,
            "response": serde_json::to_value(&decision).unwrap_or(Value::Null),
        });
        if let Err(e) = Self::write_line(stdin, &response).await {
            error!(target: "sdk", "failed to answer control request for {}: {}", session_id, e);
        }
    }

    async fn write_line(stdin: &Arc<Mutex<Option<ChildStdin>>>, value: &Value) -> Result<()> {
        let mut guard = stdin.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| LegionError::storage("SDK stdin is closed"))?;
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AgentSdk for ProcessSdk {
    async fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.spec.working_directory.exists() {
            return Err(LegionError::sdk(
                &self.spec.session_id,
                format!(
                    "working directory does not exist: {}",
                    self.spec.working_directory.display()
                ),
            ));
        }

        let mut child = self.build_command().spawn().map_err(|e| LegionError::Sdk {
            session_id: self.spec.session_id.clone(),
            message: format!("failed to launch agent CLI '{}'", self.agent_bin),
            source: Some(Box::new(e)),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LegionError::sdk(&self.spec.session_id, "agent CLI stdout missing"))?;
        *self.stdin.lock().await = child.stdin.take();
        *self.child.lock().await = Some(child);
        self.running.store(true, Ordering::SeqCst);

        let events = self.events.clone();
        let permissions = Arc::clone(&self.permissions);
        let stdin = Arc::clone(&self.stdin);
        let running = Arc::clone(&self.running);
        let session_id = self.spec.session_id.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_any_output = false;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        saw_any_output = true;
                        let value: Value = match serde_json::from_str(line) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(target: "sdk", "unparseable SDK line for {}: {}", session_id, e);
                                continue;
                            }
                        };
                        if value.get("type").and_then(Value::as_str) == Some("control_request") {
                            Self::handle_control_request(
                                &session_id,
                                &value,
                                &permissions,
                                &stdin,
                            )
                            .await;
                            continue;
                        }
                        if events.send(SdkEvent::Message(value)).await.is_err() {
                            debug!(target: "sdk", "event receiver dropped for {}", session_id);
                            break;
                        }
                    }
                    Ok(None) => {
                        // Stream closed. An immediate EOF with no output
                        // means the CLI died right after launch.
                        if running.load(Ordering::SeqCst) {
                            if !saw_any_output {
                                let _ = events
                                    .send(SdkEvent::Error {
                                        kind: SdkErrorKind::ImmediateCliFailure,
                                        message: "agent CLI exited before producing output"
                                            .to_string(),
                                    })
                                    .await;
                            }
                            let _ = events.send(SdkEvent::Closed).await;
                        }
                        break;
                    }
                    Err(e) => {
                        let _ = events
                            .send(SdkEvent::Error {
                                kind: SdkErrorKind::Stream,
                                message: format!("error reading agent stream: {}", e),
                            })
                            .await;
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        info!(target: "sdk", "launched agent CLI for session {} in {}", self.spec.session_id, self.spec.working_directory.display());
        Ok(())
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LegionError::sdk(&self.spec.session_id, "SDK is not running"));
        }
        let message = json!({
            "type": "user",
            "message": {"role": "user", "content": text},
        });
        Self::write_line(&self.stdin, &message).await
    }

    async fn interrupt(&self) -> Result<()> {
        let request = json!({
            "type": "control_request",
            "request": {"subtype": "interrupt"},
        });
        Self::write_line(&self.stdin, &request).await
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        let request = json!({
            "type": "control_request",
            "request": {"subtype": "set_permission_mode", "mode": mode.as_str()},
        });
        Self::write_line(&self.stdin, &request).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        *self.stdin.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(target: "sdk", "failed to kill agent CLI for {}: {}", self.spec.session_id, e);
            }
        }
        info!(target: "sdk", "disconnected agent CLI for session {}", self.spec.session_id);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Factory producing [`ProcessSdk`] handles.
pub struct ProcessSdkFactory {
    agent_bin: String,
}

impl ProcessSdkFactory {
    pub fn new() -> Self {
        Self {
            agent_bin: DEFAULT_AGENT_BIN.to_string(),
        }
    }

    pub fn with_binary(agent_bin: impl Into<String>) -> Self {
        Self {
            agent_bin: agent_bin.into(),
        }
    }
}

impl Default for ProcessSdkFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SdkFactory for ProcessSdkFactory {
    async fn create(
        &self,
        spec: SdkSessionSpec,
        events: mpsc::Sender<SdkEvent>,
        permissions: Arc<dyn PermissionHook>,
    ) -> Result<Arc<dyn AgentSdk>> {
        Ok(Arc::new(ProcessSdk::new(
            spec,
            self.agent_bin.clone(),
            events,
            permissions,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowAll;

    #[async_trait]
    impl PermissionHook for AllowAll {
        async fn can_use_tool(
            &self,
            _session_id: &str,
            _tool_name: &str,
            _input: &Value,
            _context: PermissionContext,
        ) -> super::super::PermissionDecision {
            super::super::PermissionDecision::allow()
        }
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_working_directory() {
        let (tx, _rx) = mpsc::channel(8);
        let spec = SdkSessionSpec {
            session_id: "s1".to_string(),
            working_directory: "/definitely/not/a/real/path".into(),
            ..SdkSessionSpec::default()
        };
        let sdk = ProcessSdk::new(spec, "true".to_string(), tx, Arc::new(AllowAll));
        let err = sdk.start().await.unwrap_err();
        assert!(err.to_string().contains("working directory"));
        assert!(!sdk.is_running());
    }

    #[tokio::test]
    async fn test_send_before_start_is_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let spec = SdkSessionSpec {
            session_id: "s1".to_string(),
            working_directory: "/tmp".into(),
            ..SdkSessionSpec::default()
        };
        let sdk = ProcessSdk::new(spec, "true".to_string(), tx, Arc::new(AllowAll));
        assert!(sdk.send_message("hello").await.is_err());
    }
}
