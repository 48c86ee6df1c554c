//! Scripted in-process SDK for deterministic testing.
//!
//! Replays configured turns through the full pipeline (echo →
//! assistant/tool events → result) without an agent subprocess, and
//! drives the permission hook exactly like the real adapter: a turn
//! that carries a tool use blocks on `can_use_tool` and converts the
//! decision into a matching `tool_result`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::{LegionError, Result};
use crate::session::PermissionMode;

use super::{
    AgentSdk, PermissionContext, PermissionDecision, PermissionHook, SdkEvent, SdkFactory,
    SdkSessionSpec,
};

/// A scripted tool invocation within a mock turn.
#[derive(Debug, Clone)]
pub struct MockToolUse {
    pub tool_name: String,
    pub input: Value,
    /// Suggestions offered alongside the permission request
    pub suggestions: Vec<Value>,
    /// tool_result content emitted when the tool is allowed
    pub result_content: String,
}

/// One scripted SDK turn, played in response to a user message.
#[derive(Debug, Clone, Default)]
pub struct MockTurn {
    pub assistant_text: Option<String>,
    pub tool_use: Option<MockToolUse>,
}

impl MockTurn {
    /// Plain assistant reply.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            assistant_text: Some(text.into()),
            tool_use: None,
        }
    }

    /// A turn that requests one tool invocation.
    pub fn tool(tool: MockToolUse) -> Self {
        Self {
            assistant_text: None,
            tool_use: Some(tool),
        }
    }
}

/// Scripted SDK handle for one session.
pub struct MockSdk {
    spec: SdkSessionSpec,
    events: mpsc::Sender<SdkEvent>,
    permissions: Arc<dyn PermissionHook>,
    /// Shared with the factory's `scripts` map so turns pushed via
    /// `push_turn` after this handle was created (but before
    /// `send_message`) are still picked up.
    turns: Arc<Mutex<HashMap<String, VecDeque<MockTurn>>>>,
    running: AtomicBool,
    interrupted: Arc<AtomicBool>,
    tool_counter: Arc<AtomicU64>,
    /// Permission modes pushed via set_permission_mode, for assertions
    pub mode_changes: Mutex<Vec<PermissionMode>>,
    /// Messages delivered via send_message, for assertions
    pub sent_messages: Mutex<Vec<String>>,
}

impl MockSdk {
    /// The launch spec this handle was created with.
    pub fn spec(&self) -> &SdkSessionSpec {
        &self.spec
    }

    fn init_message(&self) -> Value {
        json!({
            "type": "system",
            "subtype": "init",
            "session_id": self.spec.session_id,
            "data": {
                "session_id": format!("mock-resume-{}", self.spec.session_id),
                "model": self.spec.model.clone().unwrap_or_else(|| "mock".to_string()),
                "permission_mode": self.spec.permission_mode.as_str(),
                "resumed": self.spec.resume_token.is_some(),
            },
        })
    }

    /// The resume token this mock hands out in its init message.
    pub fn resume_token_value(session_id: &str) -> String {
        format!("mock-resume-{}", session_id)
    }

    async fn play_turn(
        session_id: String,
        text: String,
        turn: MockTurn,
        events: mpsc::Sender<SdkEvent>,
        permissions: Arc<dyn PermissionHook>,
        interrupted: Arc<AtomicBool>,
        tool_counter: Arc<AtomicU64>,
    ) {
        // Echo the user message the way the real stream does.
        let _ = events
            .send(SdkEvent::Message(json!({
                "type": "user",
                "message": {"role": "user", "content": text},
            })))
            .await;

        if let Some(tool) = turn.tool_use {
            let tool_use_id = format!("toolu_{}", tool_counter.fetch_add(1, Ordering::SeqCst));
            let mut content = Vec::new();
            if let Some(assistant_text) = &turn.assistant_text {
                content.push(json!({"type": "text", "text": assistant_text}));
            }
            content.push(json!({
                "type": "tool_use",
                "id": tool_use_id,
                "name": tool.tool_name,
                "input": tool.input,
            }));
            let _ = events
                .send(SdkEvent::Message(json!({
                    "type": "assistant",
                    "message": {"content": content},
                })))
                .await;

            let decision = permissions
                .can_use_tool(
                    &session_id,
                    &tool.tool_name,
                    &tool.input,
                    PermissionContext {
                        suggestions: tool.suggestions.clone(),
                    },
                )
                .await;

            let (result_content, is_error) = match &decision {
                PermissionDecision::Allow { .. } => (tool.result_content.clone(), false),
                PermissionDecision::Deny { message, .. } => (message.clone(), true),
            };
            let _ = events
                .send(SdkEvent::Message(json!({
                    "type": "user",
                    "message": {
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": result_content,
                            "is_error": is_error,
                        }],
                    },
                })))
                .await;
        } else {
            let reply = turn
                .assistant_text
                .unwrap_or_else(|| "ok".to_string());
            let _ = events
                .send(SdkEvent::Message(json!({
                    "type": "assistant",
                    "message": {"content": [{"type": "text", "text": reply}]},
                })))
                .await;
        }

        let subtype = if interrupted.swap(false, Ordering::SeqCst) {
            "interrupted"
        } else {
            "success"
        };
        let _ = events
            .send(SdkEvent::Message(json!({
                "type": "result",
                "subtype": subtype,
                "duration_ms": 1,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            })))
            .await;
    }
}

#[async_trait]
impl AgentSdk for MockSdk {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.events
            .send(SdkEvent::Message(self.init_message()))
            .await
            .map_err(|_| LegionError::sdk(&self.spec.session_id, "event channel closed"))?;
        Ok(())
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LegionError::sdk(&self.spec.session_id, "SDK is not running"));
        }
        self.sent_messages.lock().await.push(text.to_string());

        let turn = self
            .turns
            .lock()
            .await
            .get_mut(&self.spec.session_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| MockTurn::text("ok"));

        tokio::spawn(Self::play_turn(
            self.spec.session_id.clone(),
            text.to_string(),
            turn,
            self.events.clone(),
            Arc::clone(&self.permissions),
            Arc::clone(&self.interrupted),
            Arc::clone(&self.tool_counter),
        ));
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.interrupted.store(true, Ordering::SeqCst);
        self.events
            .send(SdkEvent::Message(json!({
                "type": "system",
                "subtype": "interrupt_success",
                "content": "Processing interrupted",
            })))
            .await
            .map_err(|_| LegionError::sdk(&self.spec.session_id, "event channel closed"))?;
        Ok(())
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        self.mode_changes.lock().await.push(mode);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        debug!(target: "sdk", "mock SDK disconnected for {}", self.spec.session_id);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Factory for scripted mock SDKs. Tests queue turns per session and
/// inspect the created handles afterwards.
#[derive(Default)]
pub struct MockSdkFactory {
    scripts: Arc<Mutex<HashMap<String, VecDeque<MockTurn>>>>,
    fail_start: Mutex<HashMap<String, String>>,
    handles: Mutex<HashMap<String, Arc<MockSdk>>>,
}

impl MockSdkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted turn for the given session.
    pub async fn push_turn(&self, session_id: &str, turn: MockTurn) {
        self.scripts
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push_back(turn);
    }

    /// Make the next `start()` for this session fail with the message.
    pub async fn fail_next_start(&self, session_id: &str, message: &str) {
        self.fail_start
            .lock()
            .await
            .insert(session_id.to_string(), message.to_string());
    }

    /// The most recent handle created for a session.
    pub async fn handle(&self, session_id: &str) -> Option<Arc<MockSdk>> {
        self.handles.lock().await.get(session_id).cloned()
    }
}

/// Mock handle wrapper that injects a start failure once.
struct FailingStart {
    inner: Arc<MockSdk>,
    message: String,
}

#[async_trait]
impl AgentSdk for FailingStart {
    async fn start(&self) -> Result<()> {
        Err(LegionError::sdk(
            &self.inner.spec.session_id,
            self.message.clone(),
        ))
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        self.inner.send_message(text).await
    }

    async fn interrupt(&self) -> Result<()> {
        self.inner.interrupt().await
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        self.inner.set_permission_mode(mode).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    fn is_running(&self) -> bool {
        false
    }
}

#[async_trait]
impl SdkFactory for MockSdkFactory {
    async fn create(
        &self,
        spec: SdkSessionSpec,
        events: mpsc::Sender<SdkEvent>,
        permissions: Arc<dyn PermissionHook>,
    ) -> Result<Arc<dyn AgentSdk>> {
        let session_id = spec.session_id.clone();

        let sdk = Arc::new(MockSdk {
            spec,
            events,
            permissions,
            turns: Arc::clone(&self.scripts),
            running: AtomicBool::new(false),
            interrupted: Arc::new(AtomicBool::new(false)),
            tool_counter: Arc::new(AtomicU64::new(1)),
            mode_changes: Mutex::new(Vec::new()),
            sent_messages: Mutex::new(Vec::new()),
        });
        self.handles
            .lock()
            .await
            .insert(session_id.clone(), Arc::clone(&sdk));

        if let Some(message) = self.fail_start.lock().await.remove(&session_id) {
            return Ok(Arc::new(FailingStart {
                inner: sdk,
                message,
            }));
        }
        Ok(sdk)
    }
}
