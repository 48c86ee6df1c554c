//! Session coordinator.
//!
//! Ties the whole core together: session lifecycle against the SDK
//! seam, the message pump (parse → store → fan out, in stream order),
//! synthetic system messages, the queue delivery loop, cascading
//! deletion with archival, and startup validation. The coordinator
//! owns the process-wide registry of live SDK handles; persistence is
//! authoritative and everything else re-materializes from disk.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::LegionConfig;
use crate::error::{LegionError, Result};
use crate::legion::archive::ArchiveManager;
use crate::legion::capabilities::CapabilityRegistry;
use crate::legion::channels::ChannelManager;
use crate::legion::overseer::HordeStore;
use crate::legion::prompts::build_minion_system_prompt;
use crate::permission::{PermissionBroker, UserPermissionResponse};
use crate::pipeline::{MessageKind, MessageProcessor, ParsedMessage, ToolCallTracker};
use crate::project::{ProjectInfo, ProjectManager};
use crate::queue::{QueueItem, QueueManager};
use crate::scheduler::ScheduleStore;
use crate::sdk::{AgentSdk, SdkErrorKind, SdkEvent, SdkFactory, SdkSessionSpec};
use crate::session::{
    CreateSessionParams, PermissionMode, SessionInfo, SessionManager, SessionState,
};
use crate::storage::SessionStorage;
use crate::transport::{Broadcaster, ObserverRegistry, SessionObserver, TransportObserver};
use crate::utils::unix_timestamp;

/// Buffer size of each session's SDK event channel.
const SDK_EVENT_BUFFER: usize = 256;

/// Orchestrates sessions, storage, the SDK seam, and fan-out.
pub struct SessionCoordinator {
    config: LegionConfig,
    sessions: Arc<SessionManager>,
    projects: Arc<ProjectManager>,
    queues: Arc<QueueManager>,
    processor: MessageProcessor,
    tool_calls: Arc<ToolCallTracker>,
    broker: Arc<PermissionBroker>,
    observers: Arc<ObserverRegistry>,
    broadcaster: Broadcaster,
    sdk_factory: Arc<dyn SdkFactory>,
    active_sdks: DashMap<String, Arc<dyn AgentSdk>>,
    channels: Arc<ChannelManager>,
    capabilities: Arc<CapabilityRegistry>,
    archive: Arc<ArchiveManager>,
    schedules: Arc<ScheduleStore>,
    hordes: Arc<HordeStore>,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionCoordinator {
    /// Wire up the coordinator and its owned components over one data
    /// directory.
    pub fn new(config: LegionConfig, sdk_factory: Arc<dyn SdkFactory>) -> Arc<Self> {
        let data_dir = config.data_dir.clone();
        let sessions = Arc::new(SessionManager::new(&data_dir));
        let projects = Arc::new(ProjectManager::new(&data_dir));
        let broadcaster = Broadcaster::default();
        let tool_calls = Arc::new(ToolCallTracker::new());
        let broker = Arc::new(PermissionBroker::new(
            Arc::clone(&sessions),
            broadcaster.clone(),
            Arc::clone(&tool_calls),
        ));
        let channels = Arc::new(ChannelManager::new(&data_dir, Arc::clone(&sessions)));
        let archive = Arc::new(ArchiveManager::new(&data_dir, Arc::clone(&sessions)));
        let schedules = Arc::new(ScheduleStore::new(&data_dir));
        let hordes = Arc::new(HordeStore::new(&data_dir));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            sessions,
            projects,
            queues: Arc::new(QueueManager::new()),
            processor: MessageProcessor::new(),
            tool_calls,
            broker,
            observers: Arc::new(ObserverRegistry::new()),
            broadcaster,
            sdk_factory,
            active_sdks: DashMap::new(),
            channels,
            capabilities: Arc::new(CapabilityRegistry::new()),
            archive,
            schedules,
            hordes,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &LegionConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn projects(&self) -> &Arc<ProjectManager> {
        &self.projects
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn broker(&self) -> &Arc<PermissionBroker> {
        &self.broker
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    pub fn archive(&self) -> &Arc<ArchiveManager> {
        &self.archive
    }

    pub fn schedules(&self) -> &Arc<ScheduleStore> {
        &self.schedules
    }

    pub fn hordes(&self) -> &Arc<HordeStore> {
        &self.hordes
    }

    pub async fn register_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.register(observer).await;
    }

    /// Initialize from disk: load registries, replay queues, validate
    /// cross-references, and normalize states left over from a crash.
    pub async fn initialize(&self) -> Result<()> {
        self.projects.initialize().await?;
        self.sessions.initialize().await?;

        for session in self.sessions.list_sessions().await {
            let session_dir = self.sessions.session_directory(&session.session_id);
            SessionStorage::new(&session_dir).initialize().await?;
            self.queues
                .load_queue(&session.session_id, &session_dir)
                .await?;

            // A session persisted as live has no SDK after a restart;
            // normalize so the lifecycle can start it cleanly.
            if matches!(
                session.state,
                SessionState::Starting | SessionState::Active | SessionState::Paused
            ) {
                self.sessions
                    .terminate_session(&session.session_id)
                    .await?;
            }
        }

        self.channels.load_all().await?;
        self.hordes.load_all().await?;
        self.schedules
            .load_all(self.config.scheduler_catch_up)
            .await?;

        self.validate_and_cleanup().await?;

        self.observers
            .register(Arc::new(TransportObserver::new(self.broadcaster.clone())))
            .await;

        info!(target: "coordinator", "session coordinator initialized");
        Ok(())
    }

    /// Remove dangling session references from projects and dangling
    /// child references from overseers. Empty projects are kept.
    async fn validate_and_cleanup(&self) -> Result<()> {
        let mut removed_refs = 0usize;
        for project in self.projects.list_projects().await {
            let mut valid = Vec::new();
            for session_id in &project.session_ids {
                if self.sessions.get_session(session_id).await.is_some() {
                    valid.push(session_id.clone());
                } else {
                    warn!(target: "coordinator", "removing orphaned session reference '{}' from project {}", session_id, project.project_id);
                    removed_refs += 1;
                }
            }
            if valid.len() != project.session_ids.len() {
                self.projects
                    .replace_session_ids(&project.project_id, valid)
                    .await?;
            }
        }

        let mut removed_children = 0usize;
        for session in self.sessions.list_sessions().await {
            if !session.is_overseer || session.child_minion_ids.is_empty() {
                continue;
            }
            let mut valid = Vec::new();
            for child_id in &session.child_minion_ids {
                if self.sessions.get_session(child_id).await.is_some() {
                    valid.push(child_id.clone());
                } else {
                    warn!(target: "coordinator", "removing orphaned child reference '{}' from overseer {}", child_id, session.session_id);
                    removed_children += 1;
                }
            }
            if valid.len() != session.child_minion_ids.len() {
                self.sessions
                    .modify(&session.session_id, |s| {
                        s.child_minion_ids = valid;
                        if s.child_minion_ids.is_empty() {
                            s.is_overseer = false;
                        }
                    })
                    .await?;
            }
        }

        if removed_refs > 0 || removed_children > 0 {
            info!(target: "coordinator", "startup cleanup removed {} orphaned project reference(s), {} orphaned child reference(s)", removed_refs, removed_children);
        }
        Ok(())
    }

    /// Create a project with the configured minion cap.
    pub async fn create_project(&self, name: &str, working_directory: &Path) -> Result<ProjectInfo> {
        self.projects
            .create_project(name, working_directory, self.config.max_concurrent_minions)
            .await
    }

    /// Create a session inside a project. The session's directory and
    /// queue are initialized; the SDK is created on start.
    pub async fn create_session(
        &self,
        project_id: &str,
        params: CreateSessionParams,
    ) -> Result<SessionInfo> {
        let project = self
            .projects
            .get_project(project_id)
            .await
            .ok_or_else(|| LegionError::validation(format!("project {} not found", project_id)))?;

        let order = project.session_ids.len();
        let info = self
            .sessions
            .create_session(project_id, &project.working_directory, order, params)
            .await?;

        self.projects
            .add_session_to_project(project_id, &info.session_id)
            .await?;

        let session_dir = self.sessions.session_directory(&info.session_id);
        SessionStorage::new(&session_dir).initialize().await?;
        self.queues.load_queue(&info.session_id, &session_dir).await?;

        self.notify_state_change(&info.session_id, "created").await;
        Ok(info)
    }

    /// Start (or resume) a session's SDK.
    pub async fn start_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        if let Some(existing) = self.active_sdks.get(session_id) {
            if existing.is_running() {
                debug!(target: "coordinator", "session {} is already running", session_id);
                return Ok(());
            }
        }

        let info = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or_else(|| LegionError::session(session_id, "session not found"))?;
        self.sessions.mark_starting(session_id).await?;
        self.notify_state_change(session_id, "starting").await;

        let spec = SdkSessionSpec {
            session_id: session_id.to_string(),
            working_directory: info.working_directory.clone(),
            permission_mode: info.permission_mode,
            system_prompt: Some(build_minion_system_prompt(info.system_prompt.as_deref())),
            override_system_prompt: info.override_system_prompt,
            allowed_tools: info.allowed_tools.clone(),
            disallowed_tools: info.disallowed_tools.clone(),
            model: info.model.clone(),
            resume_token: info.resume_token.clone(),
            sandbox: info.sandbox.clone(),
            setting_sources: info.setting_sources.clone(),
        };

        let (events_tx, events_rx) = mpsc::channel(SDK_EVENT_BUFFER);
        let permissions: Arc<dyn crate::sdk::PermissionHook> = Arc::clone(&self.broker) as _;
        let sdk = self.sdk_factory.create(spec, events_tx, permissions).await?;
        self.active_sdks
            .insert(session_id.to_string(), Arc::clone(&sdk));
        self.spawn_pump(session_id.to_string(), events_rx);

        // The launch marker goes into the stream before the SDK's own
        // init so replays show the lifecycle in order.
        self.emit_synthetic(session_id, "client_launched", "Claude Code Launched", None)
            .await;

        if let Err(e) = sdk.start().await {
            let friendly = extract_cli_error(&e.to_string());
            error!(target: "coordinator", "failed to start SDK for session {}: {}", session_id, friendly);
            self.sessions.mark_error(session_id, &friendly).await?;
            self.notify_state_change(session_id, "error").await;
            self.emit_synthetic(
                session_id,
                "session_failed",
                &format!("Session failed to start: {}", friendly),
                Some(json!({"error_details": friendly.clone()})),
            )
            .await;
            self.active_sdks.remove(session_id);
            return Err(LegionError::sdk(session_id, friendly));
        }

        self.sessions.mark_active(session_id).await?;
        self.notify_state_change(session_id, "active").await;
        info!(target: "coordinator", "session {} started", session_id);
        Ok(())
    }

    /// Send one user message into the session's SDK turn.
    ///
    /// Precondition: the session is active and idle. The processing
    /// flag flips on here and off when the stream's result message (or
    /// an interrupt/error) arrives.
    pub async fn send_message(&self, session_id: &str, message: &str) -> Result<()> {
        let sdk = self
            .active_sdks
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| LegionError::session(session_id, "no active SDK for session"))?;

        let info = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or_else(|| LegionError::session(session_id, "session not found"))?;
        if info.state != SessionState::Active {
            return Err(LegionError::session(
                session_id,
                format!("session not active (state: {})", info.state),
            ));
        }
        if info.is_processing {
            return Err(LegionError::session(
                session_id,
                "session is already processing a message",
            ));
        }

        self.sessions.set_processing(session_id, true).await?;
        if let Err(e) = sdk.send_message(message).await {
            self.sessions.set_processing(session_id, false).await.ok();
            return Err(e);
        }
        Ok(())
    }

    /// Interrupt the in-flight turn: cancel at the SDK, auto-deny every
    /// pending permission, and record the interruption in the stream.
    pub async fn interrupt_session(&self, session_id: &str) -> Result<()> {
        let sdk = self
            .active_sdks
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| LegionError::session(session_id, "no active SDK for session"))?;

        let info = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or_else(|| LegionError::session(session_id, "session not found"))?;
        if !info.is_interruptible() {
            return Err(LegionError::session(
                session_id,
                format!(
                    "session not in interruptible state (state: {}, processing: {})",
                    info.state, info.is_processing
                ),
            ));
        }

        sdk.interrupt().await?;
        let denied = self
            .broker
            .deny_all_for_session(session_id, "Session interrupted - auto-denying pending permission");
        if denied > 0 {
            info!(target: "coordinator", "auto-denied {} pending permission(s) for interrupted session {}", denied, session_id);
        }
        self.emit_synthetic(session_id, "interrupt", "User Interrupted Processing", None)
            .await;
        info!(target: "coordinator", "session {} interrupted", session_id);
        Ok(())
    }

    /// Explicitly pause an active session.
    pub async fn pause_session(&self, session_id: &str) -> Result<()> {
        self.sessions.pause_session(session_id).await?;
        self.notify_state_change(session_id, "paused").await;
        Ok(())
    }

    /// Resume an explicitly paused session. State-only; the SDK handle
    /// is untouched.
    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        self.sessions.resume_session(session_id).await?;
        self.notify_state_change(session_id, "active").await;
        Ok(())
    }

    /// Rename a session's display name.
    pub async fn update_session_name(&self, session_id: &str, name: &str) -> Result<()> {
        let info = self.sessions.update_name(session_id, name).await?;
        self.notify_state_change(session_id, &info.state.to_string())
            .await;
        info!(target: "coordinator", "updated session {} name to '{}'", session_id, name);
        Ok(())
    }

    /// Change the session's permission mode (validated by type).
    pub async fn set_permission_mode(&self, session_id: &str, mode: PermissionMode) -> Result<()> {
        let sdk = self
            .active_sdks
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| LegionError::session(session_id, "no active SDK for session"))?;

        let info = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or_else(|| LegionError::session(session_id, "session not found"))?;
        if info.state != SessionState::Active {
            return Err(LegionError::session(
                session_id,
                format!("session not active (state: {})", info.state),
            ));
        }

        sdk.set_permission_mode(mode).await?;
        self.sessions.update_permission_mode(session_id, mode).await?;
        info!(target: "coordinator", "permission mode set to '{}' for session {}", mode, session_id);
        Ok(())
    }

    /// Graceful SDK restart; conversation and queue survive through the
    /// resume token.
    pub async fn restart_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        info!(target: "coordinator", "restarting session {}", session_id);
        self.shutdown_sdk(session_id).await;
        self.sessions.terminate_session(session_id).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.start_session(session_id).await
    }

    /// Reset: clear the resume token and truncate the message log so
    /// the next start opens a brand-new conversation. Tools, model, and
    /// prompt are preserved.
    pub async fn reset_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        info!(target: "coordinator", "resetting session {}", session_id);
        self.shutdown_sdk(session_id).await;
        self.sessions.terminate_session(session_id).await?;
        self.sessions.set_resume_token(session_id, None).await?;
        SessionStorage::new(self.sessions.session_directory(session_id))
            .clear_messages()
            .await?;
        self.tool_calls.clear_session(session_id).await;
        self.start_session(session_id).await
    }

    /// Terminate the session. Queued items stay on disk for replay.
    pub async fn terminate_session(&self, session_id: &str) -> Result<()> {
        self.shutdown_sdk(session_id).await;
        self.broker
            .deny_all_for_session(session_id, "Session terminated - auto-denying pending permission");
        self.sessions.terminate_session(session_id).await?;
        self.notify_state_change(session_id, "terminated").await;
        info!(target: "coordinator", "session {} terminated", session_id);
        Ok(())
    }

    /// Cascading delete initiated by the user. Returns the number of
    /// descendants disposed.
    pub async fn delete_session(self: &Arc<Self>, session_id: &str) -> Result<usize> {
        self.delete_session_with_reason(session_id, "user_deleted")
            .await
    }

    /// Cascading delete with an explicit disposal reason. Children are
    /// removed depth-first before the session itself; each level is
    /// archived with its own descendants count.
    pub fn delete_session_with_reason<'a>(
        self: &'a Arc<Self>,
        session_id: &'a str,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<usize>> {
        async move {
            let Some(info) = self.sessions.get_session(session_id).await else {
                // Dangling references are tolerated during cascades.
                warn!(target: "coordinator", "delete requested for unknown session {} - skipping", session_id);
                return Ok(0);
            };

            let mut descendants = 0usize;
            for child_id in info.child_minion_ids.clone() {
                descendants += 1 + self
                    .delete_session_with_reason(&child_id, "cascade_disposal")
                    .await?;
            }

            self.shutdown_sdk(session_id).await;
            self.broker
                .deny_all_for_session(session_id, "Session deleted - auto-denying pending permission");

            let parent_name = match &info.parent_overseer_id {
                Some(parent_id) => self
                    .sessions
                    .get_session(parent_id)
                    .await
                    .map(|p| p.display_name()),
                None => None,
            };
            self.archive
                .archive_minion(
                    session_id,
                    reason,
                    info.parent_overseer_id.as_deref(),
                    parent_name.as_deref(),
                    descendants,
                )
                .await?;

            // Remove from the project; an emptied project deletes itself.
            let (_, project_deleted) = self
                .projects
                .remove_session_from_project(&info.project_id, session_id)
                .await?;
            if project_deleted {
                self.broadcaster.broadcast_control(
                    "project_deleted",
                    json!({"project_id": info.project_id}),
                );
            } else if let Some(project) = self.projects.get_project(&info.project_id).await {
                self.broadcaster.broadcast_control(
                    "project_updated",
                    json!({"project": serde_json::to_value(&project)?}),
                );
            }

            // Unlink from the parent.
            if let Some(parent_id) = &info.parent_overseer_id {
                match self.sessions.remove_child(parent_id, session_id).await {
                    Ok(_) => {
                        debug!(target: "coordinator", "removed minion {} from parent {}", session_id, parent_id)
                    }
                    Err(e) => {
                        warn!(target: "coordinator", "parent {} not updated for deleted minion {}: {}", parent_id, session_id, e)
                    }
                }
            }

            self.capabilities.unregister(session_id);
            self.schedules.cancel_schedules_for_minion(session_id).await?;
            self.channels
                .remove_from_all_channels(&info.project_id, session_id)
                .await?;
            self.hordes.remove_member(session_id).await?;

            self.queues.remove_session(session_id).await;
            self.tool_calls.clear_session(session_id).await;
            self.sessions.delete_session(session_id).await?;
            self.notify_state_change(session_id, "deleted").await;

            info!(target: "coordinator", "session {} deleted ({} descendants)", session_id, descendants);
            Ok(descendants)
        }
        .boxed()
    }

    /// Enqueue an outbound message for later delivery.
    pub async fn enqueue_message(
        &self,
        session_id: &str,
        content: &str,
        reset_session: bool,
        metadata: Option<Value>,
    ) -> Result<QueueItem> {
        if self.sessions.get_session(session_id).await.is_none() {
            return Err(LegionError::session(session_id, "session not found"));
        }
        self.queues
            .enqueue(
                session_id,
                &self.sessions.session_directory(session_id),
                content,
                reset_session,
                metadata,
                self.config.max_queue_size,
            )
            .await
    }

    /// Forward a client permission decision to the broker.
    pub fn resolve_permission(&self, response: UserPermissionResponse) -> Result<()> {
        self.broker.resolve(response)
    }

    /// Historical messages in transport shape, with the total count.
    pub async fn get_session_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<(Vec<Value>, usize)> {
        let storage = SessionStorage::new(self.sessions.session_directory(session_id));
        let total = storage.message_count().await?;
        let raw_messages = storage.read_messages(limit, offset).await?;
        let messages = raw_messages
            .iter()
            .map(|raw| {
                let parsed = self.processor.process_stored(raw, session_id);
                self.processor.prepare_for_transport(&parsed)
            })
            .collect();
        Ok((messages, total))
    }

    /// Spawn the queue delivery loop: whenever a session is active and
    /// idle, its lowest-position pending item is handed to the SDK.
    pub fn start_delivery_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let poll = Duration::from_millis(self.config.delivery_poll_ms.max(10));
        tokio::spawn(async move {
            info!(target: "coordinator", "queue delivery loop started");
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.deliver_pending().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(target: "coordinator", "queue delivery loop stopped");
        })
    }

    async fn deliver_pending(self: &Arc<Self>) {
        for session in self.sessions.list_sessions().await {
            if session.state != SessionState::Active || session.is_processing {
                continue;
            }
            if !self.active_sdks.contains_key(&session.session_id) {
                continue;
            }
            let Some(item) = self.queues.peek_next(&session.session_id).await else {
                continue;
            };
            let session_dir = self.sessions.session_directory(&session.session_id);

            if item.reset_session {
                if let Err(e) = self.reset_session(&session.session_id).await {
                    error!(target: "coordinator", "reset before delivery failed for {}: {}", session.session_id, e);
                    self.queues
                        .mark_failed(&session.session_id, &session_dir, &item.queue_id, &e.to_string())
                        .await
                        .ok();
                    continue;
                }
            }

            match self.send_message(&session.session_id, &item.content).await {
                Ok(()) => {
                    self.queues
                        .mark_sent(&session.session_id, &session_dir, &item.queue_id)
                        .await
                        .ok();
                }
                Err(e) => {
                    warn!(target: "coordinator", "queue delivery failed for {}: {}", session.session_id, e);
                    self.queues
                        .mark_failed(&session.session_id, &session_dir, &item.queue_id, &e.to_string())
                        .await
                        .ok();
                }
            }
        }
    }

    /// Shut everything down: pending permissions denied, SDKs
    /// disconnected, background loops released.
    pub async fn shutdown(&self) {
        self.broadcaster
            .broadcast_control("server_restarting", json!({}));
        self.broker.deny_all("Server shutting down");
        let session_ids: Vec<String> = self
            .active_sdks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in session_ids {
            self.shutdown_sdk(&session_id).await;
            self.sessions.terminate_session(&session_id).await.ok();
        }
        let _ = self.shutdown_tx.send(true);
        info!(target: "coordinator", "session coordinator shut down");
    }

    async fn shutdown_sdk(&self, session_id: &str) {
        if let Some((_, sdk)) = self.active_sdks.remove(session_id) {
            if let Err(e) = sdk.disconnect().await {
                warn!(target: "coordinator", "error disconnecting SDK for {}: {}", session_id, e);
            }
        }
    }

    fn spawn_pump(self: &Arc<Self>, session_id: String, mut events: mpsc::Receiver<SdkEvent>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SdkEvent::Message(raw) => {
                        coordinator.handle_sdk_message(&session_id, raw).await;
                    }
                    SdkEvent::Error { kind, message } => {
                        coordinator.handle_sdk_error(&session_id, kind, &message).await;
                    }
                    SdkEvent::Closed => {
                        debug!(target: "coordinator", "SDK stream closed for session {}", session_id);
                    }
                }
            }
            debug!(target: "coordinator", "message pump ended for session {}", session_id);
        });
    }

    /// Process one streamed message: classify, apply side effects,
    /// store, then fan out. Per-session ordering is the pump's loop.
    async fn handle_sdk_message(&self, session_id: &str, raw: Value) {
        let parsed = self.processor.process(&raw, session_id);

        match parsed.kind {
            MessageKind::Assistant => {
                let uses = parsed.tool_uses();
                if !uses.is_empty() {
                    for call in self.tool_calls.record_tool_uses(session_id, &uses).await {
                        self.broadcaster
                            .broadcast_message(session_id, call.to_transport());
                    }
                }
            }
            MessageKind::User => {
                for tool_result in parsed.tool_results() {
                    self.handle_tool_result(session_id, &tool_result).await;
                }
            }
            MessageKind::System => match parsed.subtype() {
                Some("init") => {
                    if let Some(token) = parsed
                        .metadata
                        .get("init_data")
                        .and_then(|d| d.get("session_id"))
                        .and_then(Value::as_str)
                    {
                        if let Err(e) = self
                            .sessions
                            .set_resume_token(session_id, Some(token.to_string()))
                            .await
                        {
                            warn!(target: "coordinator", "failed to record resume token for {}: {}", session_id, e);
                        }
                    }
                }
                Some("interrupt_success") => {
                    if let Err(e) = self.sessions.set_processing(session_id, false).await {
                        error!(target: "coordinator", "failed to reset processing after interrupt for {}: {}", session_id, e);
                    }
                }
                _ => {}
            },
            MessageKind::Result => {
                if let Err(e) = self.sessions.set_processing(session_id, false).await {
                    error!(target: "coordinator", "failed to reset processing for {}: {}", session_id, e);
                }
            }
            _ => {}
        }

        self.store_and_emit(session_id, &parsed).await;
    }

    async fn handle_tool_result(&self, session_id: &str, tool_result: &crate::pipeline::ToolResultRef) {
        // ExitPlanMode completion conditionally restores the default
        // mode: only when the session is still in plan mode and no
        // setMode suggestion was applied with the approval.
        if !tool_result.is_error {
            if let Some(tool_name) = self
                .tool_calls
                .tool_name(session_id, &tool_result.tool_use_id)
                .await
            {
                if tool_name == "ExitPlanMode" {
                    let skip_reset = self.broker.take_exitplan_setmode(session_id);
                    if skip_reset {
                        info!(target: "coordinator", "ExitPlanMode completed for {} with setMode applied - keeping mode", session_id);
                    } else if let Some(info) = self.sessions.get_session(session_id).await {
                        if info.permission_mode == PermissionMode::Plan {
                            if let Err(e) = self
                                .sessions
                                .update_permission_mode(session_id, PermissionMode::Default)
                                .await
                            {
                                error!(target: "coordinator", "failed to reset mode after ExitPlanMode for {}: {}", session_id, e);
                            } else {
                                info!(target: "coordinator", "permission mode reset to default after ExitPlanMode for {}", session_id);
                            }
                        }
                    }
                }
            }
        }

        if let Some(call) = self.tool_calls.complete(session_id, tool_result).await {
            self.broadcaster
                .broadcast_message(session_id, call.to_transport());
        }
    }

    async fn handle_sdk_error(&self, session_id: &str, kind: SdkErrorKind, message: &str) {
        error!(target: "coordinator", "SDK error in session {}: {:?} - {}", session_id, kind, message);

        if let Err(e) = self.sessions.set_processing(session_id, false).await {
            debug!(target: "coordinator", "could not reset processing for {}: {}", session_id, e);
        }

        let error_data = json!({
            "session_id": session_id,
            "error_type": format!("{:?}", kind),
            "error": message,
            "timestamp": unix_timestamp(),
        });

        if matches!(
            kind,
            SdkErrorKind::Startup | SdkErrorKind::Stream | SdkErrorKind::ImmediateCliFailure
        ) {
            let friendly = extract_cli_error(message);
            if let Err(e) = self.sessions.mark_error(session_id, &friendly).await {
                error!(target: "coordinator", "failed to move session {} to error state: {}", session_id, e);
            }
            self.notify_state_change(session_id, "error").await;
            self.emit_synthetic(
                session_id,
                "session_failed",
                &format!("Session failed to start: {}", friendly),
                Some(json!({"error_details": friendly})),
            )
            .await;
            self.shutdown_sdk(session_id).await;
        }

        self.observers.emit_error(session_id, &error_data).await;
    }

    /// Inject a synthetic system message through the same storage and
    /// fan-out path SDK messages take.
    async fn emit_synthetic(
        &self,
        session_id: &str,
        subtype: &str,
        content: &str,
        extra: Option<Value>,
    ) {
        let mut raw = json!({
            "type": "system",
            "subtype": subtype,
            "content": content,
            "session_id": session_id,
            "timestamp": unix_timestamp(),
        });
        if let Some(Value::Object(extra)) = extra {
            if let Some(obj) = raw.as_object_mut() {
                for (key, value) in extra {
                    obj.insert(key, value);
                }
            }
        }
        let parsed = self.processor.process(&raw, session_id);
        self.store_and_emit(session_id, &parsed).await;
    }

    /// Storage first, then observer fan-out (transport second).
    async fn store_and_emit(&self, session_id: &str, parsed: &ParsedMessage) {
        let storage_record = self.processor.prepare_for_storage(parsed);
        let storage = SessionStorage::new(self.sessions.session_directory(session_id));
        if let Err(e) = storage.append_message(storage_record).await {
            error!(target: "coordinator", "failed to store message for session {}: {}", session_id, e);
        }
        let transport = self.processor.prepare_for_transport(parsed);
        self.observers
            .emit_message(session_id, parsed, &transport)
            .await;
    }

    async fn notify_state_change(&self, session_id: &str, new_state: &str) {
        let event = json!({
            "session_id": session_id,
            "new_state": new_state,
            "timestamp": unix_timestamp(),
        });
        self.observers.emit_state_change(session_id, &event).await;
    }
}

/// Map raw agent-CLI error output to a short human sentence.
fn extract_cli_error(error_message: &str) -> String {
    let error_str = error_message.trim();

    if error_str.contains("not a valid UUID") {
        let uuid_pattern = regex::Regex::new(r#"Provided value "([^"]+)""#).expect("static regex");
        if let Some(capture) = uuid_pattern.captures(error_str) {
            return format!(
                "Invalid session ID format: '{}' is not a valid UUID",
                &capture[1]
            );
        }
        return "Invalid session ID format".to_string();
    }
    if error_str.contains("--resume requires a valid session ID") {
        return "Session resume failed: Invalid or missing resume token. The session may have been corrupted or manually modified.".to_string();
    }

    let patterns = [
        ("Command failed with exit code 1", "Agent CLI command failed"),
        ("Fatal error in message reader", "Agent CLI failed during startup"),
        ("Check stderr output for details", "See error details above"),
    ];
    for (pattern, friendly) in patterns {
        if error_str.contains(pattern) {
            return friendly.to_string();
        }
    }

    let cleaned = error_str
        .replace("Error output: Check stderr output for details", "")
        .trim()
        .to_string();
    if cleaned.is_empty() {
        "Unknown agent CLI error occurred".to_string()
    } else {
        cleaned
    }
}
