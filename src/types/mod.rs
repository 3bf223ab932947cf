// src/types/mod.rs - Message, outcome and policy event types shared by the engine

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Core message type that flows through the command engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub platform: String,
    pub channel: String,
    /// Stable chatter id used for group lookup and usage tracking
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub user_badges: Vec<String>,
    /// Logins mentioned in the message, without the leading '@'
    pub mentions: Vec<String>,
    pub is_mod: bool,
    pub is_subscriber: bool,
}

impl ChatMessage {
    /// Build a message for `user_id`, deriving mentions from `@login` words in the content
    pub fn new(
        platform: &str,
        channel: &str,
        user_id: &str,
        username: &str,
        content: &str,
    ) -> Self {
        let mentions = content
            .split_whitespace()
            .filter_map(|word| word.strip_prefix('@'))
            .map(|login| login.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_'))
            .filter(|login| !login.is_empty())
            .map(|login| login.to_lowercase())
            .collect();

        Self {
            platform: platform.to_string(),
            channel: channel.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            display_name: None,
            content: content.to_string(),
            timestamp: chrono::Utc::now(),
            user_badges: Vec::new(),
            mentions,
            is_mod: false,
            is_subscriber: false,
        }
    }

    pub fn is_broadcaster(&self) -> bool {
        self.user_badges.iter().any(|b| b == "broadcaster")
    }
}

/// A chat reply produced by a command handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotResponse {
    pub platform: String,
    pub channel: String,
    pub message: String,
}

/// Outbound handle passed untouched into command handlers
pub type ResponseSender = mpsc::Sender<BotResponse>;

/// Result of running one chat line through the command engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Unrecognized,
    Forbidden,
    BadSyntax,
    RateLimited,
    ExecutionFailed,
    Success,
}

impl std::fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandOutcome::Unrecognized => "unrecognized",
            CommandOutcome::Forbidden => "forbidden",
            CommandOutcome::BadSyntax => "bad syntax",
            CommandOutcome::RateLimited => "rate limited",
            CommandOutcome::ExecutionFailed => "execution failed",
            CommandOutcome::Success => "success",
        };
        f.write_str(name)
    }
}

// =================================================================
// POLICY EVENTS
// =================================================================

/// Explicit permission rule for one group, relative to the group name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub group_id: String,
    pub path: String,
    #[serde(default)]
    pub allow: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: String,
    pub name: String,
}

/// Rate limit for one group: `count` uses per `window_millis`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePolicyEntry {
    pub group_id: String,
    pub path: String,
    pub count: usize,
    pub window_millis: u64,
}

/// Complete projection of the external policy store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    #[serde(default)]
    pub permissions: Vec<PermissionEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    #[serde(default)]
    pub policies: Vec<UsagePolicyEntry>,
}

/// Events emitted by the external policy source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyEvent {
    FullSnapshot(PolicySnapshot),
    SinglePolicyUpdate(UsagePolicyEntry),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_are_extracted_from_content() {
        let content = "!voice Brian @Bob, @carol_99";
        let message = ChatMessage::new("twitch", "chan", "42", "alice", content);
        assert_eq!(message.mentions, vec!["bob".to_string(), "carol_99".to_string()]);
    }

    #[test]
    fn test_policy_event_deserializes_from_json() {
        let raw = r#"{
            "type": "single_policy_update",
            "group_id": "g1",
            "path": "tts",
            "count": 3,
            "window_millis": 10000
        }"#;
        let event: PolicyEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            PolicyEvent::SinglePolicyUpdate(UsagePolicyEntry {
                group_id: "g1".to_string(),
                path: "tts".to_string(),
                count: 3,
                window_millis: 10000,
            })
        );
    }
}
