// src/bot/grammar.rs - Command grammar trie and its scope-stacked builder

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

use super::parameters::{ParameterKind, ParameterSpec};
use crate::types::{ChatMessage, ResponseSender};

pub(crate) type NodeId = usize;

pub(crate) const ROOT: NodeId = 0;

/// Executable command attached to a grammar node
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Whether permission paths annotated on the grammar may grant this command
    fn accepts_custom_permission(&self) -> bool {
        false
    }

    /// Decision used when no permission rule applies to the chatter
    fn default_permission(&self, message: &ChatMessage) -> bool;

    async fn execute(
        &self,
        args: &HashMap<String, String>,
        message: &ChatMessage,
        response_sender: &ResponseSender,
    ) -> Result<()>;
}

/// A set of commands registered against the builder at startup
pub trait CommandDefinition: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, builder: &mut GrammarBuilder) -> Result<(), BuildError>;
}

/// Grammar construction failures; these abort command loading
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("command name must not be empty")]
    EmptyCommandName,
    #[error("invalid literal '{literal}' (must be non-empty without dots or spaces)")]
    InvalidLiteral { literal: String },
    #[error("cannot mix static and dynamic parameters under '{at}'")]
    MixedChildren { at: String },
    #[error("'{at}' already has dynamic parameter '{existing}', cannot add '{parameter}'")]
    DuplicateDynamic {
        at: String,
        existing: String,
        parameter: String,
    },
    #[error("optional parameter '{parameter}' under '{at}' needs a command on '{at}'")]
    OptionalWithoutFallback { at: String, parameter: String },
    #[error("a command is already registered at '{at}'")]
    HandlerAlreadySet { at: String },
    #[error("alias '{alias}' is already used under '{at}'")]
    AliasTaken { alias: String, at: String },
    #[error("alias target '{target}' is not a static parameter under '{at}'")]
    AliasTargetMissing { target: String, at: String },
}

#[derive(Debug, Clone)]
pub(crate) struct StaticEdge {
    pub literal: String,
    pub node: NodeId,
}

#[derive(Debug, Clone)]
pub(crate) enum Branches {
    Leaf,
    Static(Vec<StaticEdge>),
    Dynamic(NodeId),
}

pub(crate) struct GrammarNode {
    pub parameter: ParameterSpec,
    pub handler: Option<Arc<dyn CommandHandler>>,
    pub permissions: BTreeSet<String>,
    pub branches: Branches,
}

impl GrammarNode {
    fn new(parameter: ParameterSpec) -> Self {
        Self {
            parameter,
            handler: None,
            permissions: BTreeSet::new(),
            branches: Branches::Leaf,
        }
    }

    /// Canonical path segment of this node
    pub fn segment(&self) -> &str {
        match &self.parameter.kind {
            ParameterKind::Static(value) => value,
            _ => "*",
        }
    }
}

/// Immutable command grammar, shared between workers once built
pub struct CommandTree {
    nodes: Vec<GrammarNode>,
}

impl CommandTree {
    /// Run every definition once against a fresh builder
    pub fn build(definitions: &[Box<dyn CommandDefinition>]) -> Result<Self, BuildError> {
        let mut builder = GrammarBuilder::new();
        for definition in definitions {
            debug!("Building command definition '{}'", definition.name());
            builder.reset();
            definition.build(&mut builder)?;
        }
        let tree = builder.build();
        info!(
            "Command grammar built with {} nodes from {} definitions",
            tree.nodes.len(),
            definitions.len()
        );
        Ok(tree)
    }

    pub(crate) fn node(&self, id: NodeId) -> &GrammarNode {
        &self.nodes[id]
    }

    /// Top-level command literals, aliases included
    pub fn command_names(&self) -> Vec<String> {
        match &self.nodes[ROOT].branches {
            Branches::Static(edges) => edges.iter().map(|e| e.literal.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

/// Depth-first builder for [`CommandTree`]. Every add call extends the node under
/// the cursor and moves the cursor onto the new node.
pub struct GrammarBuilder {
    nodes: Vec<GrammarNode>,
    cursor: NodeId,
    trail: Vec<String>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![GrammarNode::new(ParameterSpec::literal(""))],
            cursor: ROOT,
            trail: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.cursor = ROOT;
        self.trail.clear();
    }

    fn at(&self) -> String {
        if self.trail.is_empty() {
            "<root>".to_string()
        } else {
            self.trail.join(".")
        }
    }

    fn current(&mut self) -> &mut GrammarNode {
        &mut self.nodes[self.cursor]
    }

    fn push(&mut self, parameter: ParameterSpec) -> NodeId {
        self.nodes.push(GrammarNode::new(parameter));
        self.nodes.len() - 1
    }

    /// Start a top-level command, reusing it if another definition already created it
    pub fn command(&mut self, name: &str) -> Result<&mut Self, BuildError> {
        if name.trim().is_empty() {
            return Err(BuildError::EmptyCommandName);
        }
        self.reset();
        self.add_static(name)
    }

    pub fn add_static(&mut self, literal: &str) -> Result<&mut Self, BuildError> {
        check_literal(literal)?;
        let literal = literal.to_lowercase();

        let existing = match &self.nodes[self.cursor].branches {
            Branches::Dynamic(_) => return Err(BuildError::MixedChildren { at: self.at() }),
            Branches::Static(edges) => edges.iter().find(|e| e.literal == literal).map(|e| e.node),
            Branches::Leaf => None,
        };

        let node = match existing {
            Some(node) => node,
            None => {
                let node = self.push(ParameterSpec::literal(&literal));
                let edge = StaticEdge {
                    literal: literal.clone(),
                    node,
                };
                match &mut self.current().branches {
                    Branches::Static(edges) => edges.push(edge),
                    branches => *branches = Branches::Static(vec![edge]),
                }
                node
            }
        };

        self.cursor = node;
        let segment = self.nodes[node].segment().to_string();
        self.trail.push(segment);
        Ok(self)
    }

    /// Append any parameter; static specs behave like [`GrammarBuilder::add_static`].
    /// An existing dynamic child is reused only for an identical slot.
    pub fn add_parameter(&mut self, parameter: ParameterSpec) -> Result<&mut Self, BuildError> {
        if let ParameterKind::Static(value) = &parameter.kind {
            let value = value.clone();
            return self.add_static(&value);
        }

        let node = match &self.nodes[self.cursor].branches {
            Branches::Static(_) => return Err(BuildError::MixedChildren { at: self.at() }),
            Branches::Dynamic(existing) => {
                let current = &self.nodes[*existing].parameter;
                if !current.same_slot(&parameter) {
                    return Err(BuildError::DuplicateDynamic {
                        at: self.at(),
                        existing: current.name.clone(),
                        parameter: parameter.name,
                    });
                }
                *existing
            }
            Branches::Leaf => {
                if parameter.optional && self.nodes[self.cursor].handler.is_none() {
                    return Err(BuildError::OptionalWithoutFallback {
                        at: self.at(),
                        parameter: parameter.name,
                    });
                }
                let node = self.push(parameter);
                self.current().branches = Branches::Dynamic(node);
                node
            }
        };

        self.cursor = node;
        self.trail.push("*".to_string());
        Ok(self)
    }

    /// Register `alias` as a second name for the static child `target` of the current node
    pub fn add_alias(&mut self, alias: &str, target: &str) -> Result<&mut Self, BuildError> {
        check_literal(alias)?;
        let alias = alias.to_lowercase();
        let target = target.to_lowercase();
        let at = self.at();

        let edges = match &mut self.nodes[self.cursor].branches {
            Branches::Static(edges) => edges,
            _ => return Err(BuildError::AliasTargetMissing { target, at }),
        };
        if edges.iter().any(|e| e.literal == alias) {
            return Err(BuildError::AliasTaken { alias, at });
        }
        let Some(node) = edges.iter().find(|e| e.literal == target).map(|e| e.node) else {
            return Err(BuildError::AliasTargetMissing { target, at });
        };

        edges.push(StaticEdge { literal: alias, node });
        Ok(self)
    }

    /// Annotate the current node with a permission path suffix
    pub fn add_permission(&mut self, suffix: &str) -> &mut Self {
        self.current().permissions.insert(suffix.to_lowercase());
        self
    }

    pub fn set_handler(
        &mut self,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<&mut Self, BuildError> {
        if self.nodes[self.cursor].handler.is_some() {
            return Err(BuildError::HandlerAlreadySet { at: self.at() });
        }
        self.current().handler = Some(handler);
        Ok(self)
    }

    /// Build a subtree below the current node, then return the cursor here
    pub fn scope<F>(&mut self, build: F) -> Result<&mut Self, BuildError>
    where
        F: FnOnce(&mut Self) -> Result<(), BuildError>,
    {
        let cursor = self.cursor;
        let depth = self.trail.len();

        let result = build(self);

        self.cursor = cursor;
        self.trail.truncate(depth);
        result.map(|_| self)
    }

    pub fn build(self) -> CommandTree {
        CommandTree { nodes: self.nodes }
    }
}

impl Default for GrammarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn check_literal(literal: &str) -> Result<(), BuildError> {
    if literal.is_empty() || literal.contains('.') || literal.chars().any(char::is_whitespace) {
        return Err(BuildError::InvalidLiteral {
            literal: literal.to_string(),
        });
    }
    Ok(())
}
