//! Comm routing between user, minions, and channels.
//!
//! Every comm is validated (exactly one source, one destination),
//! persisted to the legion timeline plus the relevant per-minion and
//! per-channel logs, broadcast on the transport, and then delivered. A
//! channel broadcast expands into per-recipient copies that share the
//! original `comm_id` but carry direct minion routing; the sender never
//! receives its own broadcast. Delivery failures come back to the
//! sender as system error comms instead of vanishing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::coordinator::SessionCoordinator;
use crate::error::Result;
use crate::legion::channels::ChannelManager;
use crate::legion::comms::{Comm, CommType, InterruptPriority};
use crate::session::{SessionState, SYSTEM_SENDER_ID, SYSTEM_SENDER_NAME};
use crate::storage;

/// Metadata key marking a per-recipient copy of a channel broadcast.
const BROADCAST_FROM_CHANNEL: &str = "broadcast_from_channel";

/// Routes communications between minions, channels, and the user.
pub struct CommRouter {
    coordinator: Arc<SessionCoordinator>,
    channels: Arc<ChannelManager>,
    data_dir: PathBuf,
    auto_start_timeout: Duration,
    poll_interval: Duration,
}

impl CommRouter {
    pub fn new(coordinator: Arc<SessionCoordinator>, channels: Arc<ChannelManager>) -> Self {
        let config = coordinator.config().clone();
        Self {
            data_dir: config.data_dir.clone(),
            auto_start_timeout: Duration::from_secs(config.auto_start_timeout_secs),
            poll_interval: Duration::from_millis(500),
            coordinator,
            channels,
        }
    }

    /// Route a comm to its destination. Returns whether delivery
    /// succeeded (persistence happens regardless).
    pub async fn route_comm(&self, comm: Comm) -> Result<bool> {
        comm.validate()?;
        debug!(target: "legion", "routing comm {}: to_minion={:?}, to_channel={:?}, to_user={}", comm.comm_id, comm.to_minion_id, comm.to_channel_id, comm.to_user);

        // Explicit #name tags in the body are classified for logging
        // only; the destination fields drive routing.
        let (minion_tags, channel_tags) = crate::legion::comms::extract_tags(&comm.content);
        if !minion_tags.is_empty() || !channel_tags.is_empty() {
            debug!(target: "legion", "comm {} references minions {:?}, channels {:?}", comm.comm_id, minion_tags, channel_tags);
        }

        self.persist_comm(&comm).await?;

        if comm.to_minion_id.is_some() {
            let delivered = self.deliver_to_minion(&comm).await;
            info!(target: "legion", "comm {} routed to minion {:?}: {}", comm.comm_id, comm.to_minion_id, if delivered { "success" } else { "failed" });
            Ok(delivered)
        } else if comm.to_channel_id.is_some() {
            let delivered = self.broadcast_to_channel(&comm).await;
            info!(target: "legion", "comm {} broadcast to channel {:?}: {}", comm.comm_id, comm.to_channel_id, if delivered { "success" } else { "failed" });
            Ok(delivered)
        } else {
            // To the user: the transport broadcast in persist_comm is
            // the delivery; no SDK involvement.
            Ok(true)
        }
    }

    /// Format a comm as the user-facing text injected into the
    /// recipient's SDK session.
    fn format_for_recipient(comm: &Comm) -> String {
        let from_name = if comm.from_user {
            "Minion #user".to_string()
        } else {
            format!(
                "Minion #{}",
                comm.from_minion_name.as_deref().unwrap_or("unknown")
            )
        };

        let base = format!(
            "**{} from {}:** {}\n\n{}",
            comm.comm_type.delivery_prefix(),
            from_name,
            comm.header_summary(),
            comm.content
        );

        if comm.from_user {
            format!(
                "{}\n\n---\n**Please respond using the `send_comm` tool to send your reply back to {}.**",
                base, from_name
            )
        } else {
            base
        }
    }

    async fn deliver_to_minion(&self, comm: &Comm) -> bool {
        let recipient_id = match &comm.to_minion_id {
            Some(id) => id.clone(),
            None => return false,
        };

        let target = match self.coordinator.sessions().get_session(&recipient_id).await {
            Some(info) => info,
            None => {
                error!(target: "legion", "target minion {} not found", recipient_id);
                self.send_system_error_comm(
                    comm,
                    "Failed to deliver message: Target minion not found",
                )
                .await;
                return false;
            }
        };

        // Auto-start inactive recipients, then poll for readiness.
        if target.state != SessionState::Active {
            info!(target: "legion", "target minion {} is in {} state - auto-starting", recipient_id, target.state);
            if target.state != SessionState::Starting {
                if let Err(e) = self.coordinator.start_session(&recipient_id).await {
                    error!(target: "legion", "failed to auto-start minion {}: {}", recipient_id, e);
                    self.send_system_error_comm(
                        comm,
                        &format!(
                            "Failed to deliver message: Could not auto-start target minion (state: {})",
                            target.state
                        ),
                    )
                    .await;
                    return false;
                }
            }
            if !self.wait_until_ready(&recipient_id).await {
                warn!(target: "legion", "minion {} did not become active within {:?}", recipient_id, self.auto_start_timeout);
                self.send_system_error_comm(
                    comm,
                    &format!(
                        "Failed to deliver message: Target minion did not start within {} seconds",
                        self.auto_start_timeout.as_secs()
                    ),
                )
                .await;
                return false;
            }
        } else if target.is_processing && !self.wait_until_ready(&recipient_id).await {
            self.send_system_error_comm(
                comm,
                "Failed to deliver message: Target minion stayed busy",
            )
            .await;
            return false;
        }

        let formatted = Self::format_for_recipient(comm);
        match self
            .coordinator
            .send_message(&recipient_id, &formatted)
            .await
        {
            Ok(()) => {
                info!(target: "legion", "delivered comm {} to minion {}", comm.comm_id, recipient_id);
                true
            }
            Err(e) => {
                error!(target: "legion", "failed to deliver comm {} to minion {}: {}", comm.comm_id, recipient_id, e);
                self.send_system_error_comm(comm, &format!("Failed to deliver message: {}", e))
                    .await;
                false
            }
        }
    }

    /// Poll until the recipient is active and idle, bounded by the
    /// auto-start timeout.
    async fn wait_until_ready(&self, session_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.auto_start_timeout;
        loop {
            if let Some(info) = self.coordinator.sessions().get_session(session_id).await {
                if info.state == SessionState::Active && !info.is_processing {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn broadcast_to_channel(&self, comm: &Comm) -> bool {
        let channel_id = match &comm.to_channel_id {
            Some(id) => id.clone(),
            None => return false,
        };
        let channel = match self.channels.get_channel(&channel_id).await {
            Some(channel) => channel,
            None => {
                error!(target: "legion", "channel {} not found for broadcast", channel_id);
                self.send_system_error_comm(comm, "Failed to broadcast: Channel not found")
                    .await;
                return false;
            }
        };

        let recipients: Vec<String> = channel
            .member_minion_ids
            .iter()
            .filter(|member| comm.from_minion_id.as_deref() != Some(member.as_str()))
            .cloned()
            .collect();
        info!(target: "legion", "broadcasting comm {} to channel '{}' ({} recipients)", comm.comm_id, channel.name, recipients.len());

        let mut delivered = 0usize;
        for recipient_id in &recipients {
            let mut recipient_comm = comm.clone();
            recipient_comm.to_minion_id = Some(recipient_id.clone());
            recipient_comm.to_channel_id = None;
            recipient_comm.to_channel_name = Some(channel.name.clone());
            recipient_comm
                .metadata
                .insert(BROADCAST_FROM_CHANNEL.to_string(), Value::from(channel_id.clone()));

            // Each copy is persisted (recipient log + timeline) and
            // delivered like a direct comm.
            if let Err(e) = self.persist_comm(&recipient_comm).await {
                warn!(target: "legion", "failed to persist broadcast copy for {}: {}", recipient_id, e);
                continue;
            }
            if self.deliver_to_minion(&recipient_comm).await {
                delivered += 1;
            } else {
                warn!(target: "legion", "failed to deliver channel broadcast to minion {}", recipient_id);
            }
        }
        info!(target: "legion", "channel broadcast delivered to {}/{} recipients", delivered, recipients.len());

        // An empty channel (or sender-only membership) still counts as
        // a successful broadcast.
        true
    }

    /// Send a system-generated error comm back to the failed comm's
    /// sender. Only delivered into the SDK when the sender is already
    /// active; never auto-starts (avoids error loops).
    async fn send_system_error_comm(&self, failed: &Comm, error_message: &str) {
        let sender_id = match &failed.from_minion_id {
            Some(id) => id.clone(),
            // User-originated failures surface through the transport.
            None => return,
        };

        let error_comm = Comm {
            from_minion_id: Some(SYSTEM_SENDER_ID.to_string()),
            from_minion_name: Some(SYSTEM_SENDER_NAME.to_string()),
            from_user: false,
            to_minion_id: Some(sender_id.clone()),
            content: error_message.to_string(),
            summary: "Delivery failed".to_string(),
            comm_type: CommType::System,
            interrupt_priority: InterruptPriority::Routine,
            in_reply_to: Some(failed.comm_id.clone()),
            visible_to_user: true,
            ..Comm::default()
        };

        if let Err(e) = self.persist_comm(&error_comm).await {
            error!(target: "legion", "failed to persist system error comm: {}", e);
        }

        let formatted = format!(
            "**🚨 System Error:**\n\n{}\n\n_(Original comm ID: {})_",
            error_message, failed.comm_id
        );
        match self.coordinator.sessions().get_session(&sender_id).await {
            Some(info) if info.state == SessionState::Active && !info.is_processing => {
                if let Err(e) = self.coordinator.send_message(&sender_id, &formatted).await {
                    error!(target: "legion", "failed to send system error comm to {}: {}", sender_id, e);
                } else {
                    info!(target: "legion", "sent system error comm to minion {}", sender_id);
                }
            }
            _ => {
                info!(target: "legion", "system error comm persisted for minion {} (not active)", sender_id);
            }
        }
    }

    /// Resolve the legion a comm belongs to.
    async fn legion_id_for(&self, comm: &Comm) -> Option<String> {
        if let Some(sender) = &comm.from_minion_id {
            if let Some(info) = self.coordinator.sessions().get_session(sender).await {
                return Some(info.project_id);
            }
        }
        if let Some(recipient) = &comm.to_minion_id {
            if let Some(info) = self.coordinator.sessions().get_session(recipient).await {
                return Some(info.project_id);
            }
        }
        if let Some(channel_id) = &comm.to_channel_id {
            if let Some(channel) = self.channels.get_channel(channel_id).await {
                return Some(channel.legion_id);
            }
        }
        None
    }

    /// Persist a comm to its logs and broadcast it on the transport.
    ///
    /// Locations: the legion timeline (always), the sender's minion log
    /// (skipped for per-recipient broadcast copies, since the channel copy
    /// already recorded the send), the recipient's minion log, and the
    /// channel log.
    async fn persist_comm(&self, comm: &Comm) -> Result<()> {
        let Some(legion_id) = self.legion_id_for(comm).await else {
            warn!(target: "legion", "comm {} has no resolvable legion; skipping persistence", comm.comm_id);
            return Ok(());
        };
        let legion_dir = self.data_dir.join("legions").join(&legion_id);
        let record = comm.to_value();

        let is_broadcast_copy = comm.metadata.contains_key(BROADCAST_FROM_CHANNEL);
        if let Some(sender) = &comm.from_minion_id {
            if !is_broadcast_copy && sender != SYSTEM_SENDER_ID {
                storage::append_jsonl(
                    &legion_dir.join("minions").join(sender).join("comms.jsonl"),
                    &record,
                )
                .await?;
            }
        }
        if let Some(recipient) = &comm.to_minion_id {
            storage::append_jsonl(
                &legion_dir.join("minions").join(recipient).join("comms.jsonl"),
                &record,
            )
            .await?;
        }
        if let Some(channel_id) = &comm.to_channel_id {
            storage::append_jsonl(
                &legion_dir
                    .join("channels")
                    .join(channel_id)
                    .join("comms.jsonl"),
                &record,
            )
            .await?;
        }
        storage::append_jsonl(&legion_dir.join("timeline.jsonl"), &record).await?;

        self.coordinator.broadcaster().broadcast_comm(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_for_recipient_from_minion() {
        let comm = Comm {
            from_minion_id: Some("m1".to_string()),
            from_minion_name: Some("Scout".to_string()),
            to_minion_id: Some("m2".to_string()),
            summary: "review this".to_string(),
            content: "please review the diff".to_string(),
            comm_type: CommType::Task,
            ..Comm::default()
        };
        let formatted = CommRouter::format_for_recipient(&comm);
        assert!(formatted.starts_with("**📋 Task from Minion #Scout:** review this"));
        assert!(formatted.contains("please review the diff"));
        assert!(!formatted.contains("send_comm"));
    }

    #[test]
    fn test_format_for_recipient_from_user_appends_reply_instruction() {
        let comm = Comm {
            from_user: true,
            to_minion_id: Some("m2".to_string()),
            content: "ship it".to_string(),
            comm_type: CommType::Info,
            ..Comm::default()
        };
        let formatted = CommRouter::format_for_recipient(&comm);
        assert!(formatted.starts_with("**💡 Info from Minion #user:**"));
        assert!(formatted.contains("Please respond using the `send_comm` tool"));
    }
}
