// src/bot/groups.rs - Chatter group membership as seen by the command engine

use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Implicit group every chatter belongs to
pub const EVERYONE: &str = "everyone";

/// External source of group membership
#[async_trait]
pub trait GroupResolver: Send + Sync {
    /// Groups of `chatter_id`; implementations must include [`EVERYONE`]
    async fn groups_of(&self, chatter_id: &str) -> HashSet<String>;

    /// Highest priority among `groups`, used for scheduling outside the engine
    async fn priority_of(&self, groups: &HashSet<String>) -> i32;
}

/// In-memory group registry
pub struct GroupRegistry {
    members: RwLock<HashMap<String, HashSet<String>>>,
    priorities: RwLock<HashMap<String, i32>>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            priorities: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_member(&self, group: &str, chatter_id: &str) {
        self.members
            .write()
            .await
            .entry(group.to_lowercase())
            .or_default()
            .insert(chatter_id.to_string());
        debug!("Added chatter '{}' to group '{}'", chatter_id, group);
    }

    pub async fn remove_member(&self, group: &str, chatter_id: &str) -> bool {
        match self.members.write().await.get_mut(&group.to_lowercase()) {
            Some(members) => members.remove(chatter_id),
            None => false,
        }
    }

    pub async fn set_priority(&self, group: &str, priority: i32) {
        self.priorities.write().await.insert(group.to_lowercase(), priority);
    }
}

#[async_trait]
impl GroupResolver for GroupRegistry {
    async fn groups_of(&self, chatter_id: &str) -> HashSet<String> {
        let mut groups: HashSet<String> = self
            .members
            .read()
            .await
            .iter()
            .filter(|(_, members)| members.contains(chatter_id))
            .map(|(group, _)| group.clone())
            .collect();
        groups.insert(EVERYONE.to_string());
        groups
    }

    async fn priority_of(&self, groups: &HashSet<String>) -> i32 {
        let priorities = self.priorities.read().await;
        groups
            .iter()
            .filter_map(|g| priorities.get(g).copied())
            .max()
            .unwrap_or(0)
    }
}
