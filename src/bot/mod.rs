use log::info;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::EngineConfiguration;
use crate::types::{ChatMessage, CommandOutcome, PolicyEvent, ResponseSender};

pub mod commands;
pub mod grammar;
pub mod groups;
pub mod parameters;
pub mod permissions;
pub mod policy_sync;
pub mod selector;
pub mod tts_commands;
pub mod usage;

use commands::CommandSystem;
use grammar::{BuildError, CommandDefinition, CommandTree};
use groups::GroupResolver;
use permissions::PermissionManager;
use policy_sync::PolicySynchronizer;
use usage::UsagePolicyManager;

/// Command engine: grammar, permission and usage trees, and the policy feed that updates them
pub struct ChatBot {
    command_system: CommandSystem,
    tree: Arc<CommandTree>,
    policy_sync: Arc<PolicySynchronizer>,
}

impl ChatBot {
    /// Build the grammar from `definitions`; fails on the first invalid definition
    pub fn new(
        definitions: &[Box<dyn CommandDefinition>],
        groups: Arc<dyn GroupResolver>,
        config: &EngineConfiguration,
    ) -> Result<Self, BuildError> {
        let tree = Arc::new(CommandTree::build(definitions)?);
        let permissions = Arc::new(PermissionManager::new());
        let usage = Arc::new(UsagePolicyManager::new());
        let policy_sync = Arc::new(PolicySynchronizer::new(permissions.clone(), usage.clone()));

        let mut command_system = CommandSystem::new(tree.clone(), groups, permissions, usage);
        command_system.set_command_prefix(config.command_prefix.clone());
        command_system.set_owners(config.owner_ids.iter().cloned());
        command_system.set_usage_enforcement(config.enforce_usage_policies);

        info!("Registered commands: {}", tree.command_names().join(", "));

        Ok(Self {
            command_system,
            tree,
            policy_sync,
        })
    }

    pub async fn execute(
        &self,
        line: &str,
        chatter_id: &str,
        message: &ChatMessage,
        response_sender: &ResponseSender,
    ) -> CommandOutcome {
        self.command_system
            .execute(line, chatter_id, message, response_sender)
            .await
    }

    pub async fn process_message(
        &self,
        message: &ChatMessage,
        response_sender: &ResponseSender,
    ) -> CommandOutcome {
        self.command_system
            .process_message(message, response_sender)
            .await
    }

    pub async fn apply_policy_event(&self, event: &PolicyEvent) {
        self.policy_sync.apply(event).await;
    }

    /// Apply policy events from `receiver` in the background
    pub fn listen_for_policy_events(
        &self,
        receiver: broadcast::Receiver<PolicyEvent>,
    ) -> JoinHandle<()> {
        self.policy_sync.clone().spawn_listener(receiver)
    }

    pub fn command_names(&self) -> Vec<String> {
        self.tree.command_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::groups::GroupRegistry;
    use crate::bot::tts_commands::{TtsCommands, TtsState};
    use crate::types::{GroupEntry, PermissionEntry, PolicySnapshot, UsagePolicyEntry};
    use tokio::sync::mpsc;

    fn bot(config: &EngineConfiguration) -> (ChatBot, Arc<GroupRegistry>) {
        let state = Arc::new(TtsState::new(["Brian", "Amy"]));
        let definitions: Vec<Box<dyn CommandDefinition>> = vec![Box::new(TtsCommands::new(state))];
        let groups = Arc::new(GroupRegistry::new());
        (ChatBot::new(&definitions, groups.clone(), config).unwrap(), groups)
    }

    fn snapshot() -> PolicySnapshot {
        PolicySnapshot {
            permissions: vec![PermissionEntry {
                group_id: "1".to_string(),
                path: "tts.add".to_string(),
                allow: Some(true),
            }],
            groups: vec![
                GroupEntry {
                    id: "0".to_string(),
                    name: "everyone".to_string(),
                },
                GroupEntry {
                    id: "1".to_string(),
                    name: "helpers".to_string(),
                },
            ],
            policies: vec![UsagePolicyEntry {
                group_id: "0".to_string(),
                path: "voice".to_string(),
                count: 1,
                window_millis: 60_000,
            }],
        }
    }

    #[tokio::test]
    async fn test_snapshot_grants_group_permission() {
        let (bot, groups) = bot(&EngineConfiguration::default());
        let (tx, _rx) = mpsc::channel(8);
        let line = "!tts add Brian";
        let message = ChatMessage::new("twitch", "chan", "55", "dave", line);

        assert_eq!(bot.execute(line, "55", &message, &tx).await, CommandOutcome::Forbidden);

        bot.apply_policy_event(&PolicyEvent::FullSnapshot(snapshot())).await;
        groups.add_member("helpers", "55").await;
        assert_eq!(bot.execute(line, "55", &message, &tx).await, CommandOutcome::Success);
    }

    #[tokio::test]
    async fn test_configured_usage_enforcement() {
        let config = EngineConfiguration {
            enforce_usage_policies: true,
            owner_ids: vec!["owner".to_string()],
            ..Default::default()
        };
        let (bot, _groups) = bot(&config);
        let (tx, _rx) = mpsc::channel(8);
        bot.apply_policy_event(&PolicyEvent::FullSnapshot(snapshot())).await;

        let line = "!voice amy";
        let message = ChatMessage::new("twitch", "chan", "55", "dave", line);
        assert_eq!(bot.execute(line, "55", &message, &tx).await, CommandOutcome::Success);
        assert_eq!(bot.execute(line, "55", &message, &tx).await, CommandOutcome::RateLimited);

        // Owners are not rate limited
        let message = ChatMessage::new("twitch", "chan", "owner", "streamer", line);
        for _ in 0..3 {
            assert_eq!(bot.execute(line, "owner", &message, &tx).await, CommandOutcome::Success);
        }
    }

    #[tokio::test]
    async fn test_builtin_command_names() {
        let (bot, _groups) = bot(&EngineConfiguration::default());
        let mut names = bot.command_names();
        names.sort();
        assert_eq!(names, vec!["skip", "tts", "voice"]);
    }
}
