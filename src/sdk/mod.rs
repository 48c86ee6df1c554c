//! The agent-SDK seam.
//!
//! The orchestrator treats the coding-agent runtime as an opaque
//! provider of a bidirectional typed-message stream plus a can-use-tool
//! hook. [`AgentSdk`] is the per-session handle, [`SdkFactory`] creates
//! handles (the coordinator never constructs a concrete SDK directly,
//! which is what lets tests swap in the scripted mock), and
//! [`PermissionHook`] is the callback contract the SDK invokes before
//! running a tool.

pub mod mock;
pub mod process;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::session::PermissionMode;

/// Classification of SDK-side failures, mirrored into session state by
/// the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkErrorKind {
    /// The subprocess failed to initialize
    Startup,
    /// A failure inside the streaming loop mid-conversation
    Stream,
    /// The CLI exited immediately after launch
    ImmediateCliFailure,
    /// Interrupt delivery failed
    Interrupt,
}

/// One item produced by an SDK handle on its event channel.
#[derive(Debug, Clone)]
pub enum SdkEvent {
    /// A typed message from the agent stream (raw JSON, classified by
    /// the message pipeline)
    Message(Value),
    /// A failure surfaced by the adapter
    Error { kind: SdkErrorKind, message: String },
    /// The stream ended; no further events will arrive
    Closed,
}

/// Suggestion context passed along with a can-use-tool invocation.
#[derive(Debug, Clone, Default)]
pub struct PermissionContext {
    /// Rule-addition / mode-change suggestions offered by the SDK
    pub suggestions: Vec<Value>,
}

/// Decision returned to the SDK from the permission hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow {
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        updated_permissions: Vec<Value>,
    },
    Deny {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupt: Option<bool>,
    },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
            updated_permissions: Vec::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: None,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Asynchronous tool-permission gate. The broker implements this; SDK
/// adapters call it and block the tool until a decision arrives.
#[async_trait]
pub trait PermissionHook: Send + Sync {
    async fn can_use_tool(
        &self,
        session_id: &str,
        tool_name: &str,
        input: &Value,
        context: PermissionContext,
    ) -> PermissionDecision;
}

/// Everything an SDK needs to launch one session's subprocess.
#[derive(Debug, Clone, Default)]
pub struct SdkSessionSpec {
    pub session_id: String,
    pub working_directory: PathBuf,
    pub permission_mode: PermissionMode,
    pub system_prompt: Option<String>,
    /// When true the prompt replaces the SDK's built-in preset instead
    /// of being appended to it
    pub override_system_prompt: bool,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub model: Option<String>,
    /// Opaque token from a previous init; instructs the SDK to resume
    /// that logical conversation
    pub resume_token: Option<String>,
    pub sandbox: Option<Value>,
    pub setting_sources: Vec<String>,
}

/// Handle to one live agent-SDK instance.
#[async_trait]
pub trait AgentSdk: Send + Sync {
    /// Launch the underlying stream. Emits messages on the event
    /// channel supplied at creation until disconnected.
    async fn start(&self) -> Result<()>;

    /// Hand one user message to the SDK. The SDK echoes it back on the
    /// stream followed by assistant output and a result terminator.
    async fn send_message(&self, text: &str) -> Result<()>;

    /// Cancel the in-flight turn.
    async fn interrupt(&self) -> Result<()>;

    /// Switch the SDK's internal permission mode.
    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()>;

    /// Graceful shutdown of the subprocess/stream.
    async fn disconnect(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Creates SDK handles; injected into the coordinator.
#[async_trait]
pub trait SdkFactory: Send + Sync {
    async fn create(
        &self,
        spec: SdkSessionSpec,
        events: mpsc::Sender<SdkEvent>,
        permissions: Arc<dyn PermissionHook>,
    ) -> Result<Arc<dyn AgentSdk>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_decision_serialization() {
        let allow = PermissionDecision::allow();
        let json = serde_json::to_value(&allow).unwrap();
        assert_eq!(json["behavior"], "allow");

        let deny = PermissionDecision::Deny {
            message: "User denied permission".to_string(),
            interrupt: Some(false),
        };
        let json = serde_json::to_value(&deny).unwrap();
        assert_eq!(json["behavior"], "deny");
        assert_eq!(json["message"], "User denied permission");
        assert_eq!(json["interrupt"], false);
    }

    #[test]
    fn test_decision_round_trip() {
        let decision = PermissionDecision::Allow {
            updated_input: Some(serde_json::json!({"answer": "yes"})),
            updated_permissions: vec![serde_json::json!({"type": "setMode", "mode": "acceptEdits"})],
        };
        let json = serde_json::to_string(&decision).unwrap();
        let back: PermissionDecision = serde_json::from_str(&json).unwrap();
        assert!(back.is_allow());
    }
}
