// src/bot/selector.rs - Walks the command grammar against tokenized chat input

use anyhow::{anyhow, Result};
use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::grammar::{Branches, CommandHandler, CommandTree, ROOT};
use super::parameters::ParameterSpec;
use crate::types::ChatMessage;

/// Best match for one line of input
#[derive(Clone)]
pub struct CommandSelection {
    pub handler: Option<Arc<dyn CommandHandler>>,
    /// Dotted path of the walk, `*` at dynamic slots
    pub path: String,
    pub permissions: BTreeSet<String>,
}

/// Raw token captured at a dynamic slot, with the parameter that must accept it
pub struct ExtractedArgument<'a> {
    pub name: &'a str,
    pub value: &'a str,
    pub spec: &'a ParameterSpec,
}

pub struct CommandSelector {
    tree: Arc<CommandTree>,
}

impl CommandSelector {
    pub fn new(tree: Arc<CommandTree>) -> Self {
        Self { tree }
    }

    /// Single forward pass: every step consumes one token or stops
    pub fn select(&self, tokens: &[String], message: &ChatMessage) -> CommandSelection {
        let mut current = ROOT;
        let mut best: Option<Arc<dyn CommandHandler>> = None;
        let mut segments: Vec<&str> = Vec::new();
        let mut permissions = BTreeSet::new();
        let mut index = 0;

        loop {
            let node = self.tree.node(current);
            if let Branches::Leaf = node.branches {
                if let Some(handler) = &node.handler {
                    best = Some(Arc::clone(handler));
                }
                break;
            }
            let Some(token) = tokens.get(index) else {
                break;
            };

            match &node.branches {
                Branches::Leaf => break,
                Branches::Static(edges) => {
                    let matched = edges.iter().find(|e| e.literal.eq_ignore_ascii_case(token));
                    let Some(edge) = matched else {
                        debug!("No static match for '{}' after '{}'", token, segments.join("."));
                        break;
                    };
                    let child = self.tree.node(edge.node);
                    segments.push(child.segment());
                    permissions.extend(child.permissions.iter().cloned());
                    if let Some(handler) = &child.handler {
                        best = Some(Arc::clone(handler));
                    }
                    current = edge.node;
                    index += 1;
                }
                Branches::Dynamic(child_id) => {
                    let child = self.tree.node(*child_id);
                    let valid = child.parameter.validate(token, Some(message));

                    if !valid && child.parameter.optional {
                        break;
                    }
                    segments.push("*");
                    index += 1;
                    if !valid {
                        // Required slot rejected the token; argument checks report it later
                        break;
                    }
                    if child.handler.is_none() && !child.parameter.optional {
                        // Required slot with no command of its own; its subtree is not entered
                        break;
                    }
                    permissions.extend(child.permissions.iter().cloned());
                    if let Some(handler) = &child.handler {
                        best = Some(Arc::clone(handler));
                    }
                    current = *child_id;
                }
            }
        }

        CommandSelection {
            handler: best,
            path: segments.join("."),
            permissions,
        }
    }

    /// Replay `path` over `tokens`, collecting the token at each `*`
    pub fn extract_arguments<'a>(
        &'a self,
        tokens: &'a [String],
        path: &str,
    ) -> Result<Vec<ExtractedArgument<'a>>> {
        let mut arguments = Vec::new();
        if path.is_empty() {
            return Ok(arguments);
        }

        let segments: Vec<&str> = path.split('.').collect();
        if segments.len() > tokens.len() {
            return Err(anyhow!(
                "path '{}' has {} segments but only {} tokens were given",
                path,
                segments.len(),
                tokens.len()
            ));
        }

        let mut current = ROOT;
        for (segment, token) in segments.iter().zip(tokens) {
            current = match (&self.tree.node(current).branches, *segment) {
                (Branches::Dynamic(child_id), "*") => {
                    let spec = &self.tree.node(*child_id).parameter;
                    arguments.push(ExtractedArgument {
                        name: spec.name.as_str(),
                        value: token.as_str(),
                        spec,
                    });
                    *child_id
                }
                (Branches::Static(edges), literal) => edges
                    .iter()
                    .find(|e| e.literal == literal)
                    .map(|e| e.node)
                    .ok_or_else(|| anyhow!("path '{}' leaves the grammar at '{}'", path, literal))?,
                _ => {
                    return Err(anyhow!(
                        "path '{}' does not fit the grammar at '{}'",
                        path,
                        segment
                    ))
                }
            };
        }

        Ok(arguments)
    }

    /// Argument map handed to command handlers
    pub fn arguments_by_name(arguments: &[ExtractedArgument<'_>]) -> HashMap<String, String> {
        arguments
            .iter()
            .map(|a| (a.name.to_string(), a.value.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::grammar::{BuildError, CommandDefinition, GrammarBuilder};
    use crate::bot::parameters::NameSet;
    use crate::types::ResponseSender;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl CommandHandler for Named {
        fn default_permission(&self, _message: &ChatMessage) -> bool {
            true
        }

        async fn execute(
            &self,
            _args: &HashMap<String, String>,
            _message: &ChatMessage,
            _response_sender: &ResponseSender,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Handlers {
        tts: Arc<dyn CommandHandler>,
        add: Arc<dyn CommandHandler>,
        delete: Arc<dyn CommandHandler>,
        voice: Arc<dyn CommandHandler>,
        voice_for: Arc<dyn CommandHandler>,
    }

    struct TestCommands {
        handlers: Handlers,
        voices: Arc<NameSet>,
    }

    impl CommandDefinition for TestCommands {
        fn name(&self) -> &str {
            "test"
        }

        fn build(&self, builder: &mut GrammarBuilder) -> Result<(), BuildError> {
            let h = &self.handlers;
            builder
                .command("tts")?
                .add_permission("tts")
                .set_handler(h.tts.clone())?
                .scope(|b| {
                    b.add_static("add")?
                        .add_permission("tts.voice.add")
                        .add_parameter(ParameterSpec::unvalidated("voiceName", false))?
                        .set_handler(h.add.clone())?;
                    Ok(())
                })?
                .scope(|b| {
                    b.add_static("delete")?
                        .add_parameter(ParameterSpec::registered(
                            "voiceName",
                            self.voices.clone(),
                            false,
                        ))?
                        .set_handler(h.delete.clone())?;
                    Ok(())
                })?
                .add_alias("del", "delete")?;

            builder
                .command("voice")?
                .add_parameter(ParameterSpec::registered("voiceName", self.voices.clone(), false))?
                .set_handler(h.voice.clone())?
                .add_parameter(ParameterSpec::mention("target", true))?
                .set_handler(h.voice_for.clone())?;
            Ok(())
        }
    }

    fn handlers() -> Handlers {
        Handlers {
            tts: Arc::new(Named("tts")),
            add: Arc::new(Named("add")),
            delete: Arc::new(Named("delete")),
            voice: Arc::new(Named("voice")),
            voice_for: Arc::new(Named("voice_for")),
        }
    }

    fn selector(handlers: Handlers) -> CommandSelector {
        let definitions: Vec<Box<dyn CommandDefinition>> = vec![Box::new(TestCommands {
            handlers,
            voices: Arc::new(NameSet::new(["Brian", "Amy"])),
        })];
        CommandSelector::new(Arc::new(CommandTree::build(&definitions).unwrap()))
    }

    fn tokens(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    fn message(content: &str) -> ChatMessage {
        ChatMessage::new("twitch", "chan", "1", "alice", content)
    }

    fn same(a: &Option<Arc<dyn CommandHandler>>, b: &Arc<dyn CommandHandler>) -> bool {
        a.as_ref().map(|a| Arc::ptr_eq(a, b)).unwrap_or(false)
    }

    #[test]
    fn test_dynamic_slot_becomes_wildcard() {
        let h = handlers();
        let add = h.add.clone();
        let selector = selector(h);

        let input = tokens("tts add Brian");
        let selection = selector.select(&input, &message("!tts add Brian"));
        assert!(same(&selection.handler, &add));
        assert_eq!(selection.path, "tts.add.*");
        let expected: BTreeSet<String> =
            ["tts", "tts.voice.add"].iter().map(|s| s.to_string()).collect();
        assert_eq!(selection.permissions, expected);

        let args = selector.extract_arguments(&input, &selection.path).unwrap();
        let args = CommandSelector::arguments_by_name(&args);
        assert_eq!(args.get("voiceName").map(String::as_str), Some("Brian"));
    }

    #[test]
    fn test_mid_path_command_and_hard_stop() {
        let h = handlers();
        let tts = h.tts.clone();
        let selector = selector(h);

        let selection = selector.select(&tokens("TTS"), &message("!TTS"));
        assert!(same(&selection.handler, &tts));
        assert_eq!(selection.path, "tts");

        // Unknown literal stops the walk, the earlier command still wins
        let selection = selector.select(&tokens("tts bogus Brian"), &message("!tts bogus Brian"));
        assert!(same(&selection.handler, &tts));
        assert_eq!(selection.path, "tts");

        let selection = selector.select(&tokens("nothing here"), &message("!nothing here"));
        assert!(selection.handler.is_none());
        assert_eq!(selection.path, "");
    }

    #[test]
    fn test_alias_resolves_to_same_command() {
        let h = handlers();
        let delete = h.delete.clone();
        let selector = selector(h);

        let long = selector.select(&tokens("tts delete Brian"), &message("!tts delete Brian"));
        let short = selector.select(&tokens("tts del Brian"), &message("!tts del Brian"));
        assert!(same(&long.handler, &delete));
        assert!(same(&short.handler, &delete));
        assert_eq!(long.permissions, short.permissions);
        assert_eq!(long.path, short.path);
    }

    #[test]
    fn test_required_invalid_consumes_token_and_stops() {
        let h = handlers();
        let tts = h.tts.clone();
        let selector = selector(h);

        let input = tokens("tts delete Joey");
        let selection = selector.select(&input, &message("!tts delete Joey"));
        assert!(same(&selection.handler, &tts));
        assert_eq!(selection.path, "tts.delete.*");

        let args = selector.extract_arguments(&input, &selection.path).unwrap();
        assert_eq!(args.len(), 1);
        assert!(!args[0].spec.validate(args[0].value, None));
    }

    #[test]
    fn test_optional_invalid_stops_without_consuming() {
        let h = handlers();
        let voice = h.voice.clone();
        let voice_for = h.voice_for.clone();
        let selector = selector(h);

        let selection = selector.select(&tokens("voice amy @bob"), &message("!voice amy @bob"));
        assert!(same(&selection.handler, &voice_for));
        assert_eq!(selection.path, "voice.*.*");

        let selection = selector.select(&tokens("voice amy @bob"), &message("!voice amy"));
        assert!(same(&selection.handler, &voice));
        assert_eq!(selection.path, "voice.*");
    }

    #[test]
    fn test_matching_is_deterministic_across_rebuilds() {
        let first = selector(handlers());
        let second = selector(handlers());
        let input = tokens("tts del Amy extra tokens");
        let msg = message("!tts del Amy extra tokens");

        let a = first.select(&input, &msg);
        let b = second.select(&input, &msg);
        assert_eq!(a.path, b.path);
        assert_eq!(a.permissions, b.permissions);
        assert_eq!(a.handler.is_some(), b.handler.is_some());
        assert!(a.path.split('.').count() <= input.len());
    }

    struct ChainedCommands {
        tts: Arc<dyn CommandHandler>,
        state: Arc<dyn CommandHandler>,
    }

    impl CommandDefinition for ChainedCommands {
        fn name(&self) -> &str {
            "chained"
        }

        fn build(&self, builder: &mut GrammarBuilder) -> Result<(), BuildError> {
            builder
                .command("tts")?
                .set_handler(self.tts.clone())?
                .add_static("voice")?
                .add_parameter(ParameterSpec::unvalidated("voiceName", false))?
                .add_parameter(ParameterSpec::state_toggle("state", false))?
                .set_handler(self.state.clone())?;
            Ok(())
        }
    }

    #[test]
    fn test_required_slot_without_command_stops_walk() {
        let tts: Arc<dyn CommandHandler> = Arc::new(Named("tts"));
        let state: Arc<dyn CommandHandler> = Arc::new(Named("state"));
        let definitions: Vec<Box<dyn CommandDefinition>> = vec![Box::new(ChainedCommands {
            tts: tts.clone(),
            state: state.clone(),
        })];
        let selector = CommandSelector::new(Arc::new(CommandTree::build(&definitions).unwrap()));

        let input = tokens("tts voice brian on");
        let selection = selector.select(&input, &message("!tts voice brian on"));
        assert!(same(&selection.handler, &tts));
        assert!(!same(&selection.handler, &state));
        assert_eq!(selection.path, "tts.voice.*");

        let args = selector.extract_arguments(&input, &selection.path).unwrap();
        let args = CommandSelector::arguments_by_name(&args);
        assert_eq!(args.get("voiceName").map(String::as_str), Some("brian"));
        assert!(!args.contains_key("state"));
    }

    #[test]
    fn test_extract_rejects_path_longer_than_tokens() {
        let selector = selector(handlers());
        assert!(selector.extract_arguments(&tokens("tts"), "tts.add.*").is_err());
    }
}
