//! Minion system-prompt assembly.
//!
//! Every minion gets the tool guide prepended to its stored prompt so
//! it knows how to participate in the legion (reply routing, spawning,
//! channels) without the UI having to teach it. The guide is bounded
//! because it travels on the SDK command line.

/// Upper bound on the guide text spliced into the system prompt.
pub const MAX_GUIDE_SIZE: usize = 4000;

/// Tool guide prepended to every minion's system prompt.
pub const LEGION_TOOL_GUIDE: &str = "\
# Working in a legion

You are a minion: one agent session in a multi-agent legion. Other \
minions and the user communicate with you through comms, and you have \
tools to answer, delegate, and coordinate.

## Communication

- `send_comm`: send a message to another minion by name or to the \
user. Set `comm_type` to one of task, question, report, or info, give \
a one-line `summary`, and put the full message in `content`.
- `send_comm_to_channel`: broadcast to every member of a channel. \
Reference channels by name (the leading `#` is optional).
- When a message arrives tagged from `Minion #user`, reply with \
`send_comm` addressed to the user rather than answering inline.

## Hierarchy

- `spawn_minion`: create a child minion under your authority. Give \
it a unique name, a role description, a focused system prompt, and \
capability keywords so others can discover it.
- `dispose_minion`: terminate a child you spawned (by name). Its \
descendants are disposed with it and their work is archived.
- You can only dispose your own children.

## Discovery and channels

- `search_capability`: find minions by capability keyword.
- `list_minions` / `get_minion_info`: inspect the fleet.
- `join_channel`, `create_channel`, `list_channels`: manage channel \
membership for multicast coordination.

Keep comms short: put the one-line gist in `summary` and details in \
`content`.";

/// Build the effective system prompt for a minion: the guide, then the
/// stored prompt (when present) separated by a divider.
pub fn build_minion_system_prompt(stored_prompt: Option<&str>) -> String {
    let mut guide = LEGION_TOOL_GUIDE.to_string();
    if guide.len() > MAX_GUIDE_SIZE {
        // Truncate at the last full line under the cap.
        let cut = guide[..MAX_GUIDE_SIZE].rfind('\n').unwrap_or(MAX_GUIDE_SIZE);
        guide.truncate(cut);
    }
    match stored_prompt {
        Some(prompt) if !prompt.is_empty() => format!("{}\n\n---\n\n{}", guide, prompt),
        _ => guide,
    }
}
