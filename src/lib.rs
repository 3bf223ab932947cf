//! # Command Authorization & Rate-Limiting Engine
//!
//! Routes chat lines such as `!tts add brian` through a declarative command
//! grammar, decides whether the chatter may run the selected command, and
//! enforces sliding-window usage limits per group.
//!
//! ## Features
//!
//! - **Command Grammar**: Keywords, aliases and validated parameters from a scoped builder
//! - **Hierarchical Permissions**: Dotted paths with inheritance, multi-group permit bias
//! - **Usage Policies**: Sliding-window limits that escalate to the nearest configured ancestor
//! - **Hot-Reload Policies**: `policies.yaml` changes are applied without a restart
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use commandgate::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let state = Arc::new(TtsState::new(["brian", "amy"]));
//!     let definitions: Vec<Box<dyn CommandDefinition>> = vec![Box::new(TtsCommands::new(state))];
//!     let groups = Arc::new(GroupRegistry::new());
//!     let bot = ChatBot::new(&definitions, groups, &EngineConfiguration::default())?;
//!
//!     let (tx, _rx) = tokio::sync::mpsc::channel(16);
//!     let message = ChatMessage::new("twitch", "channel", "42", "viewer", "!voice amy");
//!     let outcome = bot.process_message(&message, &tx).await;
//!     println!("{}", outcome);
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::commands::CommandSystem;
    pub use crate::bot::grammar::{
        BuildError, CommandDefinition, CommandHandler, CommandTree, GrammarBuilder,
    };
    pub use crate::bot::groups::{GroupRegistry, GroupResolver, EVERYONE};
    pub use crate::bot::parameters::{NameRegistry, NameSet, ParameterKind, ParameterSpec};
    pub use crate::bot::permissions::PermissionManager;
    pub use crate::bot::selector::{CommandSelection, CommandSelector};
    pub use crate::bot::tts_commands::{TtsCommands, TtsState};
    pub use crate::bot::usage::{UsageLimit, UsagePolicyManager};
    pub use crate::bot::ChatBot;
    pub use crate::config::{ConfigurationManager, EngineConfiguration};
    pub use crate::types::{
        BotResponse, ChatMessage, CommandOutcome, PolicyEvent, PolicySnapshot, ResponseSender,
    };
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
