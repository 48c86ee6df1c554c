//! Permission broker.
//!
//! Correlates tool-permission requests coming from SDK adapters with
//! asynchronous user decisions arriving over the transport. Each
//! request gets a fresh `request_id` and a one-shot rendezvous in a
//! concurrent table; the SDK-side hook blocks on the rendezvous with no
//! timeout. Session interrupt or termination drains the table,
//! resolving every pending entry with deny.
//!
//! Applying an allow decision can mutate session policy mid-flight:
//! `setMode` suggestions update the stored permission mode immediately
//! (the SDK switches its internal mode atomically), and `addRules`
//! allow rules are persisted into the session's allowed-tools set as
//! `Tool(rule)` literals so later launches of the same minion inherit
//! them.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use async_trait::async_trait;

use crate::error::{LegionError, Result};
use crate::pipeline::{MessageProcessor, ToolCallTracker};
use crate::sdk::{PermissionContext, PermissionDecision, PermissionHook};
use crate::session::{PermissionMode, SessionManager, SessionState};
use crate::storage::SessionStorage;
use crate::transport::Broadcaster;
use crate::utils::unix_timestamp;

/// Decision payload from the client, correlated by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPermissionResponse {
    pub request_id: String,
    /// "allow" or "deny"
    pub decision: String,
    /// Answers typed in the UI for interactive tools
    #[serde(default)]
    pub updated_input: Option<Value>,
    /// Apply the full suggestion list when no subset is given
    #[serde(default)]
    pub apply_suggestions: Option<bool>,
    /// Explicit subset of suggestions the user accepted
    #[serde(default)]
    pub selected_suggestions: Option<Vec<Value>>,
    /// Deny-with-guidance text; lets the SDK continue instead of abort
    #[serde(default)]
    pub clarification_message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

struct PendingEntry {
    session_id: String,
    tx: oneshot::Sender<UserPermissionResponse>,
}

/// Asynchronous broker between SDK tool hooks and user decisions.
pub struct PermissionBroker {
    sessions: Arc<SessionManager>,
    processor: MessageProcessor,
    broadcaster: Broadcaster,
    tool_calls: Arc<ToolCallTracker>,
    pending: DashMap<String, PendingEntry>,
    /// session_id -> uploaded file paths auto-approved for Read
    uploaded_files: DashMap<String, DashSet<String>>,
    /// Sessions whose latest ExitPlanMode approval applied a setMode
    /// suggestion (suppresses the automatic reset to default)
    exitplan_setmode: DashMap<String, bool>,
}

impl PermissionBroker {
    pub fn new(
        sessions: Arc<SessionManager>,
        broadcaster: Broadcaster,
        tool_calls: Arc<ToolCallTracker>,
    ) -> Self {
        Self {
            sessions,
            processor: MessageProcessor::new(),
            broadcaster,
            tool_calls,
            pending: DashMap::new(),
            uploaded_files: DashMap::new(),
            exitplan_setmode: DashMap::new(),
        }
    }

    /// Register a file uploaded for a session; subsequent `Read`
    /// requests against it are auto-approved.
    pub fn mark_uploaded_file(&self, session_id: &str, path: &str) {
        self.uploaded_files
            .entry(session_id.to_string())
            .or_default()
            .insert(path.to_string());
    }

    pub fn is_uploaded_file(&self, session_id: &str, path: &str) -> bool {
        self.uploaded_files
            .get(session_id)
            .map(|files| files.contains(path))
            .unwrap_or(false)
    }

    /// Number of requests currently awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Consume the ExitPlanMode setMode marker for a session. Returns
    /// true when the last ExitPlanMode approval applied a setMode
    /// suggestion (so the tool_result handler must not reset the mode).
    pub fn take_exitplan_setmode(&self, session_id: &str) -> bool {
        self.exitplan_setmode.remove(session_id).is_some()
    }

    /// Resolve a pending request with the user's decision.
    pub fn resolve(&self, response: UserPermissionResponse) -> Result<()> {
        if response.decision != "allow" && response.decision != "deny" {
            return Err(LegionError::validation(format!(
                "invalid permission decision: {}",
                response.decision
            )));
        }
        match self.pending.remove(&response.request_id) {
            Some((request_id, entry)) => {
                if entry.tx.send(response).is_err() {
                    warn!(target: "permission", "rendezvous for {} was already gone", request_id);
                }
                Ok(())
            }
            None => Err(LegionError::validation(format!(
                "no pending permission for request_id {}",
                response.request_id
            ))),
        }
    }

    /// Auto-deny every pending request owned by a session. Called on
    /// interrupt and termination.
    pub fn deny_all_for_session(&self, session_id: &str, reason: &str) -> usize {
        let request_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut denied = 0;
        for request_id in request_ids {
            if let Some((_, entry)) = self.pending.remove(&request_id) {
                let response = UserPermissionResponse {
                    request_id: request_id.clone(),
                    decision: "deny".to_string(),
                    updated_input: None,
                    apply_suggestions: None,
                    selected_suggestions: None,
                    clarification_message: None,
                    reason: Some(reason.to_string()),
                };
                if entry.tx.send(response).is_ok() {
                    denied += 1;
                }
                info!(target: "permission", "auto-denied pending permission {} for session {}", request_id, session_id);
            }
        }
        denied
    }

    /// Drain every pending rendezvous (shutdown path).
    pub fn deny_all(&self, reason: &str) -> usize {
        let session_ids: Vec<String> = self
            .pending
            .iter()
            .map(|entry| entry.value().session_id.clone())
            .collect();
        let mut denied = 0;
        for session_id in session_ids {
            denied += self.deny_all_for_session(&session_id, reason);
        }
        denied
    }

    fn storage_for(&self, session_id: &str) -> SessionStorage {
        SessionStorage::new(self.sessions.session_directory(session_id))
    }

    async fn store_and_broadcast(&self, session_id: &str, record: Value) {
        let parsed = self.processor.process(&record, session_id);
        let storage_record = self.processor.prepare_for_storage(&parsed);
        if let Err(e) = self
            .storage_for(session_id)
            .append_message(storage_record)
            .await
        {
            error!(target: "permission", "failed to store permission record for {}: {}", session_id, e);
        }
        let transport = self.processor.prepare_for_transport(&parsed);
        self.broadcaster.broadcast_message(session_id, transport);
    }

    /// Build the rule-update list from the suggestions the user
    /// accepted, applying side effects (mode change, rule persistence).
    async fn apply_suggestions(
        &self,
        session_id: &str,
        tool_name: &str,
        accepted: &[Value],
    ) -> (Vec<Value>, Vec<Value>) {
        let mut updates = Vec::new();
        let mut applied_for_storage = Vec::new();
        let mut tools_to_persist = Vec::new();

        for suggestion in accepted {
            let mut normalized = suggestion.clone();
            if let Some(obj) = normalized.as_object_mut() {
                obj.insert("destination".to_string(), Value::from("session"));
            }

            let kind = normalized
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match kind {
                "setMode" => {
                    if let Some(mode_str) = normalized.get("mode").and_then(Value::as_str) {
                        match mode_str.parse::<PermissionMode>() {
                            Ok(mode) => {
                                if let Err(e) =
                                    self.sessions.update_permission_mode(session_id, mode).await
                                {
                                    error!(target: "permission", "failed to update mode for {}: {}", session_id, e);
                                } else {
                                    info!(target: "permission", "updated session {} permission mode to {}", session_id, mode);
                                }
                                if tool_name == "ExitPlanMode" {
                                    self.exitplan_setmode.insert(session_id.to_string(), true);
                                }
                            }
                            Err(e) => {
                                warn!(target: "permission", "ignoring setMode suggestion with bad mode: {}", e)
                            }
                        }
                    }
                }
                "addRules" => {
                    let behavior = normalized
                        .get("behavior")
                        .and_then(Value::as_str)
                        .unwrap_or("allow");
                    if behavior == "allow" {
                        if let Some(rules) = normalized.get("rules").and_then(Value::as_array) {
                            for rule in rules {
                                let tool = rule
                                    .get("toolName")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default();
                                let rule_content =
                                    rule.get("ruleContent").and_then(Value::as_str);
                                if tool.is_empty() {
                                    continue;
                                }
                                let literal = match rule_content {
                                    Some(content) if !content.is_empty() => {
                                        format!("{}({})", tool, content)
                                    }
                                    _ => tool.to_string(),
                                };
                                tools_to_persist.push(literal);
                            }
                        }
                    }
                }
                _ => {}
            }

            applied_for_storage.push(normalized.clone());
            updates.push(normalized);
        }

        if !tools_to_persist.is_empty() {
            if let Err(e) = self
                .sessions
                .add_allowed_tools(session_id, tools_to_persist.clone())
                .await
            {
                error!(target: "permission", "failed to persist allowed tools for {}: {}", session_id, e);
            } else {
                info!(target: "permission", "persisted {} approved tool rules for session {}", tools_to_persist.len(), session_id);
            }
        }

        (updates, applied_for_storage)
    }
}

#[async_trait]
impl PermissionHook for PermissionBroker {
    async fn can_use_tool(
        &self,
        session_id: &str,
        tool_name: &str,
        input: &Value,
        context: PermissionContext,
    ) -> PermissionDecision {
        let request_id = Uuid::new_v4().to_string();
        let request_time = unix_timestamp();
        info!(target: "permission", "permission requested for tool {} (session {}, request {})", tool_name, session_id, request_id);

        // Reads of files the user uploaded for this session skip the
        // round-trip entirely.
        if tool_name == "Read" {
            if let Some(path) = input.get("file_path").and_then(Value::as_str) {
                if self.is_uploaded_file(session_id, path) {
                    info!(target: "permission", "auto-approving Read of uploaded file {}", path);
                    return PermissionDecision::allow();
                }
            }
        }

        let mut suggestions = context.suggestions.clone();

        // ExitPlanMode while in plan mode gets a setMode suggestion at
        // the head so the UI offers the acceptEdits transition first.
        if tool_name == "ExitPlanMode" {
            if let Some(info) = self.sessions.get_session(session_id).await {
                if info.permission_mode == PermissionMode::Plan {
                    suggestions.insert(
                        0,
                        json!({
                            "type": "setMode",
                            "mode": "acceptEdits",
                            "destination": "session",
                        }),
                    );
                    debug!(target: "permission", "injected setMode suggestion for ExitPlanMode in session {}", session_id);
                }
            }
        }

        // The rendezvous is registered before the request is announced
        // so a response can never arrive for an unknown request id.
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            PendingEntry {
                session_id: session_id.to_string(),
                tx,
            },
        );

        self.store_and_broadcast(
            session_id,
            json!({
                "type": "permission_request",
                "content": format!("Permission requested for tool: {}", tool_name),
                "session_id": session_id,
                "timestamp": request_time,
                "request_id": request_id.clone(),
                "tool_name": tool_name,
                "input_params": input,
                "suggestions": suggestions.clone(),
            }),
        )
        .await;

        if let Some(call) = self
            .tool_calls
            .mark_awaiting_permission(
                session_id,
                tool_name,
                input,
                json!({"request_id": request_id.clone(), "suggestions": suggestions.clone()}),
            )
            .await
        {
            self.broadcaster
                .broadcast_message(session_id, call.to_transport());
        }

        if let Err(e) = self.sessions.pause_session(session_id).await {
            debug!(target: "permission", "could not pause session {} for permission wait: {}", session_id, e);
        }
        self.broadcaster.broadcast_control(
            "state_change",
            json!({"session_id": session_id, "new_state": "paused", "timestamp": unix_timestamp()}),
        );

        // Wait indefinitely; the rendezvous resolves on user decision,
        // interrupt, or termination. A dropped sender counts as deny.
        let response = match rx.await {
            Ok(response) => response,
            Err(_) => UserPermissionResponse {
                request_id: request_id.clone(),
                decision: "deny".to_string(),
                updated_input: None,
                apply_suggestions: None,
                selected_suggestions: None,
                clarification_message: None,
                reason: Some("Permission rendezvous dropped".to_string()),
            },
        };
        self.pending.remove(&request_id);

        // Restore the session after the decision; the SDK handle is not
        // recreated, this is a state-only transition.
        if let Some(info) = self.sessions.get_session(session_id).await {
            if info.state == SessionState::Paused {
                if let Err(e) = self.sessions.resume_session(session_id).await {
                    warn!(target: "permission", "failed to restore session {} after permission: {}", session_id, e);
                } else {
                    self.broadcaster.broadcast_control(
                        "state_change",
                        json!({"session_id": session_id, "new_state": "active", "timestamp": unix_timestamp()}),
                    );
                }
            }
        }

        let decision_time = unix_timestamp();
        let allowed = response.decision == "allow";

        let (decision, applied_updates, clarification) = if allowed {
            let mut applied_updates = Vec::new();
            let mut updated_permissions = Vec::new();

            let accepted: Option<Vec<Value>> = match (
                &response.selected_suggestions,
                response.apply_suggestions.unwrap_or(false),
            ) {
                (Some(selected), _) => Some(selected.clone()),
                (None, true) if !suggestions.is_empty() => Some(suggestions.clone()),
                _ => None,
            };
            if let Some(accepted) = accepted {
                let (updates, for_storage) = self
                    .apply_suggestions(session_id, tool_name, &accepted)
                    .await;
                updated_permissions = updates;
                applied_updates = for_storage;
            }

            (
                PermissionDecision::Allow {
                    updated_input: response.updated_input.clone(),
                    updated_permissions,
                },
                applied_updates,
                None,
            )
        } else if let Some(clarification) = response.clarification_message.clone() {
            (
                PermissionDecision::Deny {
                    message: clarification.clone(),
                    interrupt: Some(false),
                },
                Vec::new(),
                Some(clarification),
            )
        } else {
            (
                PermissionDecision::deny(
                    response
                        .reason
                        .clone()
                        .unwrap_or_else(|| "User denied permission".to_string()),
                ),
                Vec::new(),
                None,
            )
        };

        // Record and broadcast the response.
        let mut record = json!({
            "type": "permission_response",
            "content": format!("Permission {} for tool: {}", if allowed { "allowed" } else { "denied" }, tool_name),
            "session_id": session_id,
            "timestamp": decision_time,
            "request_id": request_id.clone(),
            "decision": if allowed { "allow" } else { "deny" },
            "reasoning": format!("User {}", if allowed { "allowed permission" } else { "denied permission" }),
            "tool_name": tool_name,
            "response_time_ms": ((decision_time - request_time) * 1000.0) as i64,
        });
        if !applied_updates.is_empty() {
            record["applied_updates"] = Value::Array(applied_updates);
        }
        if let Some(clarification) = &clarification {
            record["clarification_message"] = Value::from(clarification.clone());
            record["interrupt"] = Value::Bool(false);
        }
        if let Some(updated_input) = &response.updated_input {
            record["updated_input"] = updated_input.clone();
        }
        self.store_and_broadcast(session_id, record).await;

        if let Some(call) = self
            .tool_calls
            .mark_permission_decided(session_id, tool_name, input, allowed)
            .await
        {
            self.broadcaster
                .broadcast_message(session_id, call.to_transport());
        }

        info!(target: "permission", "permission request {} resolved: {}", request_id, response.decision);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CreateSessionParams;
    use std::path::Path;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (Arc<PermissionBroker>, Arc<SessionManager>, String) {
        let sessions = Arc::new(SessionManager::new(dir.path()));
        sessions.initialize().await.unwrap();
        let info = sessions
            .create_session(
                "p1",
                Path::new("/tmp/p1"),
                0,
                CreateSessionParams::default(),
            )
            .await
            .unwrap();
        sessions.mark_starting(&info.session_id).await.unwrap();
        sessions.mark_active(&info.session_id).await.unwrap();

        let broker = Arc::new(PermissionBroker::new(
            Arc::clone(&sessions),
            Broadcaster::default(),
            Arc::new(ToolCallTracker::new()),
        ));
        (broker, sessions, info.session_id)
    }

    #[tokio::test]
    async fn test_allow_with_rule_persistence() {
        let dir = TempDir::new().unwrap();
        let (broker, sessions, sid) = setup(&dir).await;

        let suggestions = vec![json!({
            "type": "addRules",
            "behavior": "allow",
            "rules": [{"toolName": "Bash", "ruleContent": "gh issue view:*"}],
        })];

        let hook = Arc::clone(&broker);
        let sid_clone = sid.clone();
        let task = tokio::spawn(async move {
            hook.can_use_tool(
                &sid_clone,
                "Bash",
                &json!({"command": "gh issue view 1"}),
                PermissionContext { suggestions },
            )
            .await
        });

        // Wait until the request is registered, then answer it.
        let request_id = loop {
            if let Some(entry) = broker.pending.iter().next() {
                break entry.key().clone();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        broker
            .resolve(UserPermissionResponse {
                request_id,
                decision: "allow".to_string(),
                updated_input: None,
                apply_suggestions: Some(true),
                selected_suggestions: None,
                clarification_message: None,
                reason: None,
            })
            .unwrap();

        let decision = task.await.unwrap();
        assert!(decision.is_allow());

        let info = sessions.get_session(&sid).await.unwrap();
        assert!(info
            .allowed_tools
            .contains(&"Bash(gh issue view:*)".to_string()));
        // Session restored to active after the decision.
        assert_eq!(info.state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_deny_with_clarification_does_not_interrupt() {
        let dir = TempDir::new().unwrap();
        let (broker, _sessions, sid) = setup(&dir).await;

        let hook = Arc::clone(&broker);
        let sid_clone = sid.clone();
        let task = tokio::spawn(async move {
            hook.can_use_tool(
                &sid_clone,
                "Write",
                &json!({"file_path": "/tmp/x"}),
                PermissionContext::default(),
            )
            .await
        });

        let request_id = loop {
            if let Some(entry) = broker.pending.iter().next() {
                break entry.key().clone();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        broker
            .resolve(UserPermissionResponse {
                request_id,
                decision: "deny".to_string(),
                updated_input: None,
                apply_suggestions: None,
                selected_suggestions: None,
                clarification_message: Some("Use /tmp/y instead".to_string()),
                reason: None,
            })
            .unwrap();

        match task.await.unwrap() {
            PermissionDecision::Deny { message, interrupt } => {
                assert_eq!(message, "Use /tmp/y instead");
                assert_eq!(interrupt, Some(false));
            }
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_uploaded_file_auto_approval() {
        let dir = TempDir::new().unwrap();
        let (broker, _sessions, sid) = setup(&dir).await;
        broker.mark_uploaded_file(&sid, "/tmp/upload.pdf");

        let decision = broker
            .can_use_tool(
                &sid,
                "Read",
                &json!({"file_path": "/tmp/upload.pdf"}),
                PermissionContext::default(),
            )
            .await;
        assert!(decision.is_allow());
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_deny_all_for_session() {
        let dir = TempDir::new().unwrap();
        let (broker, _sessions, sid) = setup(&dir).await;

        let hook = Arc::clone(&broker);
        let sid_clone = sid.clone();
        let task = tokio::spawn(async move {
            hook.can_use_tool(
                &sid_clone,
                "Bash",
                &json!({"command": "rm -rf /"}),
                PermissionContext::default(),
            )
            .await
        });

        while broker.pending_count() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let denied = broker.deny_all_for_session(&sid, "session interrupted");
        assert_eq!(denied, 1);

        match task.await.unwrap() {
            PermissionDecision::Deny { message, .. } => {
                assert_eq!(message, "session interrupted");
            }
            other => panic!("expected deny, got {:?}", other),
        }
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_unknown_request_errors() {
        let dir = TempDir::new().unwrap();
        let (broker, _sessions, _sid) = setup(&dir).await;
        let err = broker.resolve(UserPermissionResponse {
            request_id: "nope".to_string(),
            decision: "allow".to_string(),
            updated_input: None,
            apply_suggestions: None,
            selected_suggestions: None,
            clarification_message: None,
            reason: None,
        });
        assert!(err.is_err());
    }
}
