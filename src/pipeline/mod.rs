//! Message pipeline: parsing, classification, and projections.
//!
//! Every message that enters the system (streamed from an SDK,
//! synthesized by the coordinator, or read back from disk) flows
//! through [`MessageProcessor`] so storage and transport always see the
//! same shape: `{type, content, timestamp, session_id, metadata}`. The
//! metadata map carries classified sub-fields (tool uses, tool results,
//! init data, permission artifacts) extracted once at parse time.
//!
//! [`ToolCallTracker`] derives the first-class tool-call lifecycle from
//! the stream: a `tool_use` block opens a call, permission artifacts
//! move it through `awaiting_permission`, and the matching
//! `tool_result` closes it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::utils::unix_timestamp;

/// Classified message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    Assistant,
    User,
    Result,
    PermissionRequest,
    PermissionResponse,
    ToolCall,
    Error,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::System => "system",
            MessageKind::Assistant => "assistant",
            MessageKind::User => "user",
            MessageKind::Result => "result",
            MessageKind::PermissionRequest => "permission_request",
            MessageKind::PermissionResponse => "permission_response",
            MessageKind::ToolCall => "tool_call",
            MessageKind::Error => "error",
            MessageKind::Unknown => "unknown",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "system" => MessageKind::System,
            "assistant" => MessageKind::Assistant,
            "user" => MessageKind::User,
            "result" => MessageKind::Result,
            "permission_request" => MessageKind::PermissionRequest,
            "permission_response" => MessageKind::PermissionResponse,
            "tool_call" => MessageKind::ToolCall,
            "error" => MessageKind::Error,
            _ => MessageKind::Unknown,
        }
    }
}

/// A tool_use block extracted from an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseRef {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// A tool_result entry extracted from a user-shaped transport message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultRef {
    pub tool_use_id: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub content: Value,
}

/// Uniform parsed form of any message.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: f64,
    pub session_id: Option<String>,
    pub metadata: Map<String, Value>,
}

impl ParsedMessage {
    pub fn subtype(&self) -> Option<&str> {
        self.metadata.get("subtype").and_then(Value::as_str)
    }

    pub fn tool_uses(&self) -> Vec<ToolUseRef> {
        self.metadata
            .get("tool_uses")
            .and_then(Value::as_array)
            .map(|uses| {
                uses.iter()
                    .filter_map(|u| serde_json::from_value(u.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tool_results(&self) -> Vec<ToolResultRef> {
        self.metadata
            .get("tool_results")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| serde_json::from_value(r.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parses raw messages into [`ParsedMessage`] and produces the storage
/// and transport projections.
#[derive(Debug, Default, Clone)]
pub struct MessageProcessor;

impl MessageProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Classify a raw message (from the SDK stream or synthesized).
    pub fn process(&self, raw: &Value, session_id: &str) -> ParsedMessage {
        let kind_str = raw.get("type").and_then(Value::as_str).unwrap_or("unknown");
        let kind = MessageKind::from_str(kind_str);

        let timestamp = raw
            .get("timestamp")
            .and_then(Value::as_f64)
            .unwrap_or_else(unix_timestamp);

        let mut metadata = Map::new();
        let content = match kind {
            MessageKind::Assistant => self.parse_assistant(raw, &mut metadata),
            MessageKind::User => self.parse_user(raw, &mut metadata),
            MessageKind::System => self.parse_system(raw, &mut metadata),
            MessageKind::Result => self.parse_result(raw, &mut metadata),
            MessageKind::PermissionRequest | MessageKind::PermissionResponse => {
                self.parse_permission(raw, &mut metadata)
            }
            MessageKind::Error | MessageKind::ToolCall | MessageKind::Unknown => raw
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };

        // Carry the error flag through for error-shaped records.
        if let Some(flag) = raw.get("error").and_then(Value::as_bool) {
            metadata.insert("error".to_string(), Value::from(flag));
        }

        let sid = raw
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(session_id.to_string()));

        ParsedMessage {
            kind,
            content,
            timestamp,
            session_id: sid,
            metadata,
        }
    }

    /// Re-hydrate a stored record. Records that already carry classified
    /// metadata are reused without re-parsing; everything else flows
    /// through [`Self::process`] for consistency.
    pub fn process_stored(&self, raw: &Value, session_id: &str) -> ParsedMessage {
        let has_metadata = raw.get("metadata").map(Value::is_object).unwrap_or(false);
        let has_type = raw.get("type").and_then(Value::as_str).is_some();
        let has_content = raw.get("content").is_some();

        if has_metadata && has_type && has_content {
            let metadata = raw["metadata"].as_object().cloned().unwrap_or_default();
            return ParsedMessage {
                kind: MessageKind::from_str(raw["type"].as_str().unwrap_or("unknown")),
                content: raw["content"].as_str().unwrap_or_default().to_string(),
                timestamp: raw
                    .get("timestamp")
                    .and_then(Value::as_f64)
                    .unwrap_or_else(unix_timestamp),
                session_id: raw
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| Some(session_id.to_string())),
                metadata,
            };
        }
        self.process(raw, session_id)
    }

    /// Storage projection: a flat JSON record.
    pub fn prepare_for_storage(&self, message: &ParsedMessage) -> Value {
        json!({
            "type": message.kind.as_str(),
            "content": message.content,
            "timestamp": message.timestamp,
            "session_id": message.session_id,
            "metadata": Value::Object(message.metadata.clone()),
        })
    }

    /// Transport projection: identical to storage, with the subtype
    /// mirrored at the root for consumers that key on it.
    pub fn prepare_for_transport(&self, message: &ParsedMessage) -> Value {
        let mut value = self.prepare_for_storage(message);
        if let Some(subtype) = message.subtype() {
            value["subtype"] = Value::from(subtype);
        }
        value
    }

    fn parse_assistant(&self, raw: &Value, metadata: &mut Map<String, Value>) -> String {
        let content = raw.pointer("/message/content");
        let mut text_parts = Vec::new();
        let mut tool_uses = Vec::new();

        if let Some(blocks) = content.and_then(Value::as_array) {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        tool_uses.push(json!({
                            "id": block.get("id").cloned().unwrap_or_default(),
                            "name": block.get("name").cloned().unwrap_or_default(),
                            "input": block.get("input").cloned().unwrap_or(json!({})),
                        }));
                    }
                    _ => {}
                }
            }
        } else if let Some(text) = content.and_then(Value::as_str) {
            text_parts.push(text.to_string());
        }

        if !tool_uses.is_empty() {
            metadata.insert("tool_uses".to_string(), Value::Array(tool_uses));
            metadata.insert("has_tool_uses".to_string(), Value::Bool(true));
        }
        text_parts.join(" ")
    }

    fn parse_user(&self, raw: &Value, metadata: &mut Map<String, Value>) -> String {
        let content = raw
            .pointer("/message/content")
            .or_else(|| raw.get("content"));

        match content {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(blocks)) => {
                let mut text_parts = Vec::new();
                let mut tool_results = Vec::new();
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("tool_result") => {
                            tool_results.push(json!({
                                "tool_use_id": block.get("tool_use_id").cloned().unwrap_or_default(),
                                "is_error": block.get("is_error").cloned().unwrap_or(Value::Bool(false)),
                                "content": block.get("content").cloned().unwrap_or_default(),
                            }));
                        }
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                text_parts.push(text.to_string());
                            }
                        }
                        _ => {}
                    }
                }
                if !tool_results.is_empty() {
                    metadata.insert("tool_results".to_string(), Value::Array(tool_results));
                    metadata.insert("has_tool_results".to_string(), Value::Bool(true));
                }
                text_parts.join(" ")
            }
            _ => String::new(),
        }
    }

    fn parse_system(&self, raw: &Value, metadata: &mut Map<String, Value>) -> String {
        if let Some(subtype) = raw.get("subtype").and_then(Value::as_str) {
            metadata.insert("subtype".to_string(), Value::from(subtype));
            if subtype == "init" {
                if let Some(data) = raw.get("data") {
                    metadata.insert("init_data".to_string(), data.clone());
                }
            }
        }
        if let Some(details) = raw.get("error_details").and_then(Value::as_str) {
            metadata.insert("error_details".to_string(), Value::from(details));
        }
        raw.get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn parse_result(&self, raw: &Value, metadata: &mut Map<String, Value>) -> String {
        for key in ["subtype", "duration_ms", "duration_api_ms", "num_turns"] {
            if let Some(value) = raw.get(key) {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        if let Some(usage) = raw.get("usage") {
            metadata.insert("usage".to_string(), usage.clone());
        }
        raw.get("result")
            .or_else(|| raw.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn parse_permission(&self, raw: &Value, metadata: &mut Map<String, Value>) -> String {
        for key in [
            "request_id",
            "tool_name",
            "input_params",
            "suggestions",
            "decision",
            "reasoning",
            "applied_updates",
            "clarification_message",
            "interrupt",
            "updated_input",
            "response_time_ms",
        ] {
            if let Some(value) = raw.get(key) {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        raw.get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// Lifecycle state of a derived tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    AwaitingPermission,
    Running,
    Denied,
    Completed,
    Failed,
}

/// Derived entity covering one tool invocation over its life cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub is_error: bool,
    pub created_at: f64,
}

impl ToolCall {
    /// Transport record for UI consumers (`type: "tool_call"`).
    pub fn to_transport(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        value["type"] = Value::from("tool_call");
        value
    }
}

/// Per-session tracking of recent tool invocations.
pub struct ToolCallTracker {
    calls: Mutex<HashMap<String, HashMap<String, ToolCall>>>,
}

impl Default for ToolCallTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Open a pending call for every tool_use in an assistant message.
    pub async fn record_tool_uses(&self, session_id: &str, uses: &[ToolUseRef]) -> Vec<ToolCall> {
        let mut calls = self.calls.lock().await;
        let session_calls = calls.entry(session_id.to_string()).or_default();
        let mut created = Vec::new();
        for tool_use in uses {
            let call = ToolCall {
                tool_use_id: tool_use.id.clone(),
                tool_name: tool_use.name.clone(),
                input: tool_use.input.clone(),
                status: ToolCallStatus::Pending,
                permission: None,
                result: None,
                is_error: false,
                created_at: unix_timestamp(),
            };
            session_calls.insert(tool_use.id.clone(), call.clone());
            created.push(call);
        }
        created
    }

    /// Name of the tool behind a tracked tool_use id.
    pub async fn tool_name(&self, session_id: &str, tool_use_id: &str) -> Option<String> {
        self.calls
            .lock()
            .await
            .get(session_id)
            .and_then(|calls| calls.get(tool_use_id))
            .map(|call| call.tool_name.clone())
    }

    /// Match the most recent pending call with this name/input signature
    /// and move it to awaiting_permission.
    pub async fn mark_awaiting_permission(
        &self,
        session_id: &str,
        tool_name: &str,
        input: &Value,
        permission: Value,
    ) -> Option<ToolCall> {
        let mut calls = self.calls.lock().await;
        let session_calls = calls.get_mut(session_id)?;
        let call = session_calls
            .values_mut()
            .filter(|c| {
                c.status == ToolCallStatus::Pending && c.tool_name == tool_name && &c.input == input
            })
            .max_by(|a, b| a.created_at.total_cmp(&b.created_at))?;
        call.status = ToolCallStatus::AwaitingPermission;
        call.permission = Some(permission);
        Some(call.clone())
    }

    /// Apply the user's decision to the call awaiting permission.
    pub async fn mark_permission_decided(
        &self,
        session_id: &str,
        tool_name: &str,
        input: &Value,
        granted: bool,
    ) -> Option<ToolCall> {
        let mut calls = self.calls.lock().await;
        let session_calls = calls.get_mut(session_id)?;
        let call = session_calls
            .values_mut()
            .filter(|c| {
                c.status == ToolCallStatus::AwaitingPermission
                    && c.tool_name == tool_name
                    && &c.input == input
            })
            .max_by(|a, b| a.created_at.total_cmp(&b.created_at))?;
        call.status = if granted {
            ToolCallStatus::Running
        } else {
            ToolCallStatus::Denied
        };
        Some(call.clone())
    }

    /// Close a call with its tool_result, removing it from tracking.
    pub async fn complete(
        &self,
        session_id: &str,
        tool_result: &ToolResultRef,
    ) -> Option<ToolCall> {
        let mut calls = self.calls.lock().await;
        let session_calls = calls.get_mut(session_id)?;
        let mut call = session_calls.remove(&tool_result.tool_use_id)?;
        call.status = if tool_result.is_error {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Completed
        };
        call.is_error = tool_result.is_error;
        call.result = Some(tool_result.content.clone());
        Some(call)
    }

    /// Drop all tracked calls for a session.
    pub async fn clear_session(&self, session_id: &str) {
        self.calls.lock().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_assistant_text_and_tool_uses() {
        let processor = MessageProcessor::new();
        let raw = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "ls"}},
            ]},
        });
        let parsed = processor.process(&raw, "s1");
        assert_eq!(parsed.kind, MessageKind::Assistant);
        assert_eq!(parsed.content, "Let me check.");
        let uses = parsed.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].name, "Bash");
        assert_eq!(uses[0].id, "toolu_1");
    }

    #[test]
    fn test_user_echo_and_tool_results() {
        let processor = MessageProcessor::new();

        let echo = json!({"type": "user", "message": {"role": "user", "content": "hello"}});
        let parsed = processor.process(&echo, "s1");
        assert_eq!(parsed.kind, MessageKind::User);
        assert_eq!(parsed.content, "hello");
        assert!(parsed.tool_results().is_empty());

        let shell = json!({
            "type": "user",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "ok", "is_error": false},
            ]},
        });
        let parsed = processor.process(&shell, "s1");
        let results = parsed.tool_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_use_id, "toolu_1");
        assert!(!results[0].is_error);
    }

    #[test]
    fn test_system_init_extracts_data() {
        let processor = MessageProcessor::new();
        let raw = json!({
            "type": "system",
            "subtype": "init",
            "data": {"session_id": "resume-token", "model": "mock"},
        });
        let parsed = processor.process(&raw, "s1");
        assert_eq!(parsed.subtype(), Some("init"));
        assert_eq!(parsed.metadata["init_data"]["session_id"], "resume-token");
    }

    #[test]
    fn test_result_metadata() {
        let processor = MessageProcessor::new();
        let raw = json!({
            "type": "result",
            "subtype": "success",
            "duration_ms": 1200,
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let parsed = processor.process(&raw, "s1");
        assert_eq!(parsed.kind, MessageKind::Result);
        assert_eq!(parsed.metadata["duration_ms"], 1200);
        assert_eq!(parsed.metadata["usage"]["output_tokens"], 5);
    }

    #[test]
    fn test_storage_projection_shape() {
        let processor = MessageProcessor::new();
        let raw = json!({"type": "user", "message": {"role": "user", "content": "hi"}});
        let parsed = processor.process(&raw, "s1");
        let stored = processor.prepare_for_storage(&parsed);
        assert_eq!(stored["type"], "user");
        assert_eq!(stored["content"], "hi");
        assert_eq!(stored["session_id"], "s1");
        assert!(stored["timestamp"].as_f64().is_some());
        assert!(stored["metadata"].is_object());
    }

    #[test]
    fn test_stored_records_with_metadata_skip_reparse() {
        let processor = MessageProcessor::new();
        let stored = json!({
            "type": "system",
            "content": "Claude Code Launched",
            "timestamp": 123.0,
            "session_id": "s1",
            "metadata": {"subtype": "client_launched"},
        });
        let parsed = processor.process_stored(&stored, "s1");
        assert_eq!(parsed.kind, MessageKind::System);
        assert_eq!(parsed.subtype(), Some("client_launched"));
        assert_eq!(parsed.timestamp, 123.0);
    }

    #[test]
    fn test_transport_mirrors_subtype() {
        let processor = MessageProcessor::new();
        let raw = json!({"type": "system", "subtype": "interrupt", "content": "x"});
        let parsed = processor.process(&raw, "s1");
        let transport = processor.prepare_for_transport(&parsed);
        assert_eq!(transport["subtype"], "interrupt");
    }

    #[tokio::test]
    async fn test_tool_call_lifecycle() {
        let tracker = ToolCallTracker::new();
        let uses = vec![ToolUseRef {
            id: "toolu_1".to_string(),
            name: "Bash".to_string(),
            input: json!({"command": "ls"}),
        }];
        let created = tracker.record_tool_uses("s1", &uses).await;
        assert_eq!(created[0].status, ToolCallStatus::Pending);

        let call = tracker
            .mark_awaiting_permission("s1", "Bash", &json!({"command": "ls"}), json!({}))
            .await
            .unwrap();
        assert_eq!(call.status, ToolCallStatus::AwaitingPermission);

        let call = tracker
            .mark_permission_decided("s1", "Bash", &json!({"command": "ls"}), true)
            .await
            .unwrap();
        assert_eq!(call.status, ToolCallStatus::Running);

        let done = tracker
            .complete(
                "s1",
                &ToolResultRef {
                    tool_use_id: "toolu_1".to_string(),
                    is_error: false,
                    content: json!("listing"),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, ToolCallStatus::Completed);
        // Closed calls leave the tracker.
        assert!(tracker.tool_name("s1", "toolu_1").await.is_none());
    }

    #[tokio::test]
    async fn test_denied_tool_call() {
        let tracker = ToolCallTracker::new();
        tracker
            .record_tool_uses(
                "s1",
                &[ToolUseRef {
                    id: "toolu_9".to_string(),
                    name: "Write".to_string(),
                    input: json!({"path": "/etc/passwd"}),
                }],
            )
            .await;
        tracker
            .mark_awaiting_permission("s1", "Write", &json!({"path": "/etc/passwd"}), json!({}))
            .await
            .unwrap();
        let call = tracker
            .mark_permission_decided("s1", "Write", &json!({"path": "/etc/passwd"}), false)
            .await
            .unwrap();
        assert_eq!(call.status, ToolCallStatus::Denied);
    }
}
