// src/bot/parameters.rs - Typed validators for command parameter slots

use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::types::ChatMessage;

const TOGGLE_ON: &[&str] = &["on", "true", "enable", "enabled", "yes"];
const TOGGLE_OFF: &[&str] = &["off", "false", "disable", "disabled", "no"];

/// Source of names for registry-backed parameters (e.g. enabled voices)
pub trait NameRegistry: Send + Sync {
    fn contains(&self, name: &str) -> bool;
}

/// In-memory, case-insensitive name set usable as a [`NameRegistry`]
#[derive(Debug, Default)]
pub struct NameSet {
    names: RwLock<BTreeSet<String>>,
}

impl NameSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: RwLock::new(names.into_iter().map(|n| n.as_ref().to_lowercase()).collect()),
        }
    }

    /// Returns false if the name was already present
    pub fn insert(&self, name: &str) -> bool {
        match self.names.write() {
            Ok(mut names) => names.insert(name.to_lowercase()),
            Err(poisoned) => poisoned.into_inner().insert(name.to_lowercase()),
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        match self.names.write() {
            Ok(mut names) => names.remove(&name.to_lowercase()),
            Err(poisoned) => poisoned.into_inner().remove(&name.to_lowercase()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        match self.names.read() {
            Ok(names) => names.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

impl NameRegistry for NameSet {
    fn contains(&self, name: &str) -> bool {
        match self.names.read() {
            Ok(names) => names.contains(&name.to_lowercase()),
            Err(poisoned) => poisoned.into_inner().contains(&name.to_lowercase()),
        }
    }
}

/// What a parameter slot accepts
#[derive(Clone)]
pub enum ParameterKind {
    /// Literal keyword, matched case-insensitively
    Static(String),
    /// Any token
    Unvalidated,
    /// A login that the message actually mentions
    Mention,
    /// on/off style switch
    StateToggle,
    /// One of a fixed set of literals (stored lowercase)
    EnumLiteral(HashSet<String>),
    /// A name currently present in a registry
    RegistryMembership(Arc<dyn NameRegistry>),
}

impl fmt::Debug for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKind::Static(value) => f.debug_tuple("Static").field(value).finish(),
            ParameterKind::Unvalidated => f.write_str("Unvalidated"),
            ParameterKind::Mention => f.write_str("Mention"),
            ParameterKind::StateToggle => f.write_str("StateToggle"),
            ParameterKind::EnumLiteral(values) => {
                f.debug_tuple("EnumLiteral").field(values).finish()
            }
            ParameterKind::RegistryMembership(_) => f.write_str("RegistryMembership"),
        }
    }
}

/// One slot in the command grammar
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub optional: bool,
    pub kind: ParameterKind,
}

impl ParameterSpec {
    pub fn literal(value: &str) -> Self {
        Self {
            name: value.to_lowercase(),
            optional: false,
            kind: ParameterKind::Static(value.to_lowercase()),
        }
    }

    pub fn unvalidated(name: &str, optional: bool) -> Self {
        Self::dynamic(name, optional, ParameterKind::Unvalidated)
    }

    pub fn mention(name: &str, optional: bool) -> Self {
        Self::dynamic(name, optional, ParameterKind::Mention)
    }

    pub fn state_toggle(name: &str, optional: bool) -> Self {
        Self::dynamic(name, optional, ParameterKind::StateToggle)
    }

    pub fn one_of<I, S>(name: &str, values: I, optional: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = values.into_iter().map(|v| v.as_ref().to_lowercase()).collect();
        Self::dynamic(name, optional, ParameterKind::EnumLiteral(values))
    }

    pub fn registered(name: &str, registry: Arc<dyn NameRegistry>, optional: bool) -> Self {
        Self::dynamic(name, optional, ParameterKind::RegistryMembership(registry))
    }

    fn dynamic(name: &str, optional: bool, kind: ParameterKind) -> Self {
        Self {
            name: name.to_string(),
            optional,
            kind,
        }
    }

    /// Same name, kind and optionality; registries compare by identity
    pub fn same_slot(&self, other: &ParameterSpec) -> bool {
        let same_kind = match (&self.kind, &other.kind) {
            (ParameterKind::Static(a), ParameterKind::Static(b)) => a == b,
            (ParameterKind::Unvalidated, ParameterKind::Unvalidated)
            | (ParameterKind::Mention, ParameterKind::Mention)
            | (ParameterKind::StateToggle, ParameterKind::StateToggle) => true,
            (ParameterKind::EnumLiteral(a), ParameterKind::EnumLiteral(b)) => a == b,
            (ParameterKind::RegistryMembership(a), ParameterKind::RegistryMembership(b)) => {
                Arc::ptr_eq(a, b)
            }
            _ => false,
        };
        same_kind && self.name == other.name && self.optional == other.optional
    }

    /// Check one raw token; `message` is only consulted by mention slots
    pub fn validate(&self, token: &str, message: Option<&ChatMessage>) -> bool {
        match &self.kind {
            ParameterKind::Static(value) => token.eq_ignore_ascii_case(value),
            ParameterKind::Unvalidated => true,
            ParameterKind::Mention => match message {
                Some(message) => is_mention_of(token, message),
                None => false,
            },
            ParameterKind::StateToggle => parse_toggle(token).is_some(),
            ParameterKind::EnumLiteral(values) => values.contains(&token.to_lowercase()),
            ParameterKind::RegistryMembership(registry) => registry.contains(token),
        }
    }
}

/// Interpret a state toggle token
pub fn parse_toggle(token: &str) -> Option<bool> {
    let token = token.to_lowercase();
    if TOGGLE_ON.contains(&token.as_str()) {
        Some(true)
    } else if TOGGLE_OFF.contains(&token.as_str()) {
        Some(false)
    } else {
        None
    }
}

fn login_pattern() -> Option<&'static Regex> {
    static LOGIN: OnceLock<Option<Regex>> = OnceLock::new();
    LOGIN
        .get_or_init(|| Regex::new(r"^@?([A-Za-z0-9_]{1,25})$").ok())
        .as_ref()
}

fn is_mention_of(token: &str, message: &ChatMessage) -> bool {
    let Some(captures) = login_pattern().and_then(|pattern| pattern.captures(token)) else {
        return false;
    };
    let login = captures[1].to_lowercase();
    message.mentions.iter().any(|m| m.eq_ignore_ascii_case(&login))
}
