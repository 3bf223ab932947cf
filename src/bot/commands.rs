use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::grammar::CommandTree;
use super::groups::GroupResolver;
use super::permissions::PermissionManager;
use super::selector::CommandSelector;
use super::usage::UsagePolicyManager;
use crate::types::{ChatMessage, CommandOutcome, ResponseSender};

/// Runs chat lines through grammar matching, permission and usage checks, then the handler
pub struct CommandSystem {
    selector: CommandSelector,
    permissions: Arc<PermissionManager>,
    usage: Arc<UsagePolicyManager<String>>,
    groups: Arc<dyn GroupResolver>,
    owner_ids: HashSet<String>,
    enforce_usage_policies: bool,
    pub command_prefix: String,
}

impl CommandSystem {
    pub fn new(
        tree: Arc<CommandTree>,
        groups: Arc<dyn GroupResolver>,
        permissions: Arc<PermissionManager>,
        usage: Arc<UsagePolicyManager<String>>,
    ) -> Self {
        Self {
            selector: CommandSelector::new(tree),
            permissions,
            usage,
            groups,
            owner_ids: HashSet::new(),
            enforce_usage_policies: false,
            command_prefix: "!".to_string(),
        }
    }

    /// Set the command prefix (default is "!")
    pub fn set_command_prefix(&mut self, prefix: String) {
        self.command_prefix = prefix;
        info!("Command prefix set to: {}", self.command_prefix);
    }

    /// Chatters that bypass permission and usage checks
    pub fn set_owners<I: IntoIterator<Item = String>>(&mut self, owner_ids: I) {
        self.owner_ids = owner_ids.into_iter().collect();
    }

    pub fn set_usage_enforcement(&mut self, enabled: bool) {
        self.enforce_usage_policies = enabled;
        info!("Usage policy enforcement {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_owner(&self, chatter_id: &str) -> bool {
        self.owner_ids.contains(chatter_id)
    }

    /// Process a chat message, using its content and sender id
    pub async fn process_message(
        &self,
        message: &ChatMessage,
        response_sender: &ResponseSender,
    ) -> CommandOutcome {
        self.execute(&message.content, &message.user_id, message, response_sender)
            .await
    }

    /// Run one line for `chatter_id`. Every outcome, handler faults included,
    /// is returned as a value.
    pub async fn execute(
        &self,
        line: &str,
        chatter_id: &str,
        message: &ChatMessage,
        response_sender: &ResponseSender,
    ) -> CommandOutcome {
        let Some(content) = line.trim_start().strip_prefix(self.command_prefix.as_str()) else {
            return CommandOutcome::Unrecognized;
        };
        let tokens = tokenize(content);
        if tokens.is_empty() {
            return CommandOutcome::Unrecognized;
        }

        debug!("Processing command '{}' from user '{}' in #{}",
               tokens[0], message.username, message.channel);

        let groups = self.groups.groups_of(chatter_id).await;

        let selection = self.selector.select(&tokens, message);
        let Some(handler) = selection.handler.clone() else {
            debug!("Unknown command: {}", tokens[0]);
            return CommandOutcome::Unrecognized;
        };
        let path = selection.path.as_str();
        let is_owner = self.is_owner(chatter_id);

        if !is_owner {
            let mut verdict = self.permissions.check_groups(&groups, path).await;
            if verdict.is_none()
                && handler.accepts_custom_permission()
                && !selection.permissions.is_empty()
            {
                let suffixes: Vec<String> = selection.permissions.iter().cloned().collect();
                verdict = self.permissions.check_groups_any(&groups, &suffixes).await;
            }

            let allowed = match verdict {
                Some(allowed) => allowed,
                None => handler.default_permission(message),
            };
            if !allowed {
                debug!("User '{}' is not allowed to use '{}'", message.username, path);
                return CommandOutcome::Forbidden;
            }
        }

        let arguments = match self.selector.extract_arguments(&tokens, path) {
            Ok(arguments) => arguments,
            Err(e) => {
                error!("Argument extraction failed for '{}': {:#}", path, e);
                return CommandOutcome::BadSyntax;
            }
        };
        if let Some(invalid) = arguments.iter().find(|a| !a.spec.validate(a.value, Some(message))) {
            debug!(
                "Invalid value '{}' for parameter '{}' of '{}'",
                invalid.value, invalid.name, path
            );
            return CommandOutcome::BadSyntax;
        }

        if self.enforce_usage_policies
            && !is_owner
            && !self.usage.try_use_groups(&chatter_id.to_string(), &groups, path).await
        {
            debug!("Command '{}' is rate limited for user '{}'", path, message.username);
            return CommandOutcome::RateLimited;
        }

        info!(
            "Executing command '{}' for user '{}' in #{}",
            path, message.username, message.channel
        );

        let args = CommandSelector::arguments_by_name(&arguments);
        let result = AssertUnwindSafe(handler.execute(&args, message, response_sender))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => CommandOutcome::Success,
            Ok(Err(e)) => {
                error!("Command '{}' failed for user '{}': {:#}", path, message.username, e);
                CommandOutcome::ExecutionFailed
            }
            Err(panic) => {
                error!(
                    "Command '{}' panicked for user '{}': {}",
                    path,
                    message.username,
                    panic_message(&*panic)
                );
                CommandOutcome::ExecutionFailed
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        warn!("Command panicked with a non-string payload");
        "unknown panic".to_string()
    }
}

/// Split on whitespace; a double-quoted span is one token with the quotes removed
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }

    tokens
}
