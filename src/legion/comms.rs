//! Comm model: high-level messages between user, minions, and channels.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{LegionError, Result};
use crate::utils::unix_timestamp;

/// Kind of communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommType {
    /// Assign work
    Task,
    /// Request information
    Question,
    /// Provide findings
    Report,
    /// Non-interrupting information
    Info,
    /// Stop and wait
    Halt,
    /// Stop, clear, redirect
    Pivot,
    /// Minion self-talk
    Thought,
    /// Minion created
    Spawn,
    /// Minion terminated
    Dispose,
    /// System notification
    #[default]
    System,
}

impl CommType {
    /// Emoji-tagged prefix used when formatting a comm for delivery.
    pub fn delivery_prefix(&self) -> &'static str {
        match self {
            CommType::Task => "📋 Task",
            CommType::Question => "❓ Question",
            CommType::Report => "📊 Report",
            CommType::Info => "💡 Info",
            _ => "💬 Message",
        }
    }
}

/// Priority level for interrupt handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterruptPriority {
    #[default]
    Routine,
    Important,
    Pivot,
    Critical,
}

/// A single high-level message with exactly one source and exactly one
/// destination. Sender/recipient names are captured at send time so
/// history survives later renames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Comm {
    pub comm_id: String,

    // Source (exactly one of from_minion_id / from_user)
    pub from_minion_id: Option<String>,
    pub from_user: bool,
    pub from_minion_name: Option<String>,

    // Destination (exactly one of to_minion_id / to_channel_id / to_user)
    pub to_minion_id: Option<String>,
    pub to_channel_id: Option<String>,
    pub to_user: bool,
    pub to_minion_name: Option<String>,
    pub to_channel_name: Option<String>,

    /// Brief one-line description shown collapsed
    pub summary: String,
    /// Full message body (markdown)
    pub content: String,
    pub comm_type: CommType,
    pub interrupt_priority: InterruptPriority,

    pub in_reply_to: Option<String>,
    pub related_task_id: Option<String>,
    pub metadata: HashMap<String, Value>,

    /// Whether the UI timeline shows this comm
    pub visible_to_user: bool,
    pub timestamp: f64,
}

impl Default for Comm {
    fn default() -> Self {
        Self {
            comm_id: Uuid::new_v4().to_string(),
            from_minion_id: None,
            from_user: false,
            from_minion_name: None,
            to_minion_id: None,
            to_channel_id: None,
            to_user: false,
            to_minion_name: None,
            to_channel_name: None,
            summary: String::new(),
            content: String::new(),
            comm_type: CommType::System,
            interrupt_priority: InterruptPriority::Routine,
            in_reply_to: None,
            related_task_id: None,
            metadata: HashMap::new(),
            visible_to_user: true,
            timestamp: unix_timestamp(),
        }
    }
}

impl Comm {
    /// Ensure the comm has exactly one source and one destination.
    pub fn validate(&self) -> Result<()> {
        let destinations = [
            self.to_minion_id.is_some(),
            self.to_channel_id.is_some(),
            self.to_user,
        ]
        .iter()
        .filter(|d| **d)
        .count();
        if destinations != 1 {
            return Err(LegionError::validation(
                "comm must have exactly one destination",
            ));
        }

        let sources = [self.from_minion_id.is_some(), self.from_user]
            .iter()
            .filter(|s| **s)
            .count();
        if sources != 1 {
            return Err(LegionError::validation("comm must have exactly one source"));
        }
        Ok(())
    }

    /// Header line used when delivering into a recipient's SDK: the
    /// summary, or the content truncated to 50 chars.
    pub fn header_summary(&self) -> String {
        if !self.summary.is_empty() {
            return self.summary.clone();
        }
        if self.content.chars().count() > 50 {
            let truncated: String = self.content.chars().take(50).collect();
            format!("{}...", truncated)
        } else {
            self.content.clone()
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Split `#name` tags from comm content into likely minion names
/// (mixed-case) and likely channel names (lowercase). Heuristic only;
/// routing is always driven by the explicit destination fields.
pub fn extract_tags(content: &str) -> (Vec<String>, Vec<String>) {
    let pattern = regex::Regex::new(r"#([\w-]+)").expect("static regex");
    let mut minion_names = Vec::new();
    let mut channel_names = Vec::new();
    for capture in pattern.captures_iter(content) {
        let tag = capture[1].to_string();
        if tag.chars().any(|c| c.is_uppercase()) {
            minion_names.push(tag);
        } else {
            channel_names.push(tag);
        }
    }
    (minion_names, channel_names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_requires_single_destination() {
        let mut comm = Comm {
            from_user: true,
            to_user: true,
            ..Comm::default()
        };
        assert!(comm.validate().is_ok());

        comm.to_minion_id = Some("m1".to_string());
        assert!(comm.validate().is_err());

        comm.to_user = false;
        assert!(comm.validate().is_ok());

        comm.to_minion_id = None;
        assert!(comm.validate().is_err());
    }

    #[test]
    fn test_validation_requires_single_source() {
        let comm = Comm {
            from_user: true,
            from_minion_id: Some("m1".to_string()),
            to_user: true,
            ..Comm::default()
        };
        assert!(comm.validate().is_err());

        let comm = Comm {
            to_user: true,
            ..Comm::default()
        };
        assert!(comm.validate().is_err());
    }

    #[test]
    fn test_header_summary_truncation() {
        let comm = Comm {
            content: "x".repeat(80),
            ..Comm::default()
        };
        let header = comm.header_summary();
        assert_eq!(header.chars().count(), 53);
        assert!(header.ends_with("..."));

        let comm = Comm {
            summary: "short".to_string(),
            content: "x".repeat(80),
            ..Comm::default()
        };
        assert_eq!(comm.header_summary(), "short");
    }

    #[test]
    fn test_extract_tags_heuristic() {
        let (minions, channels) =
            extract_tags("Check with #Alice and #Bob in #coordination please");
        assert_eq!(minions, vec!["Alice", "Bob"]);
        assert_eq!(channels, vec!["coordination"]);
    }

    #[test]
    fn test_round_trip() {
        let comm = Comm {
            from_user: true,
            to_minion_id: Some("m1".to_string()),
            summary: "do it".to_string(),
            content: "please do the thing".to_string(),
            comm_type: CommType::Task,
            ..Comm::default()
        };
        let json = serde_json::to_string(&comm).unwrap();
        let back: Comm = serde_json::from_str(&json).unwrap();
        assert_eq!(back.comm_id, comm.comm_id);
        assert_eq!(back.comm_type, CommType::Task);
        assert!(back.validate().is_ok());
    }
}
