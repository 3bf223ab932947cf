// src/bot/permissions.rs - Hierarchical allow/deny rules addressed by dotted paths

use log::{debug, info};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// One node of the permission tree. `explicit` is `None` when no rule is set here.
#[derive(Debug, Default, Clone)]
struct PermissionNode {
    explicit: Option<bool>,
    children: HashMap<String, PermissionNode>,
}

impl PermissionNode {
    fn rule_count(&self) -> usize {
        usize::from(self.explicit.is_some())
            + self
                .children
                .values()
                .map(PermissionNode::rule_count)
                .sum::<usize>()
    }
}

/// Plain permission tree; see [`PermissionManager`] for the shared, locked form
#[derive(Debug, Clone)]
pub struct PermissionTree {
    root: PermissionNode,
}

impl Default for PermissionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionTree {
    pub fn new() -> Self {
        Self {
            root: PermissionNode::default(),
        }
    }

    /// Set or clear (`None`) the rule at `path`, creating nodes as needed
    pub fn set(&mut self, path: &str, allow: Option<bool>) {
        let mut node = &mut self.root;
        for segment in segments(path) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.explicit = allow;
    }

    /// Detach the node at `path` together with its subtree
    pub fn remove(&mut self, path: &str) -> bool {
        let parts: Vec<&str> = segments(path).collect();
        let Some((last, parents)) = parts.split_last() else {
            return false;
        };

        let mut node = &mut self.root;
        for segment in parents {
            match node.children.get_mut(*segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.children.remove(*last).is_some()
    }

    /// Most specific explicit rule on the way to `path`, or `None` if no ancestor has one
    pub fn check(&self, path: &str) -> Option<bool> {
        let mut node = &self.root;
        let mut nearest = node.explicit;
        for segment in segments(path) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if node.explicit.is_some() {
                        nearest = node.explicit;
                    }
                }
                None => break,
            }
        }
        nearest
    }

    /// Permit-biased combination of `<group>.<suffix>` over every group
    pub fn check_groups<'a, I>(&self, groups: I, suffix: &str) -> Option<bool>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut result = None;
        for group in groups {
            match self.check(&format!("{}.{}", group, suffix)) {
                Some(true) => return Some(true),
                Some(false) => result = Some(false),
                None => {}
            }
        }
        result
    }

    pub fn clear(&mut self) {
        self.root = PermissionNode::default();
    }

    /// Number of explicit rules held
    pub fn len(&self) -> usize {
        self.root.rule_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Permission tree shared between message workers and the policy source
pub struct PermissionManager {
    tree: RwLock<PermissionTree>,
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionManager {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(PermissionTree::new()),
        }
    }

    pub async fn set(&self, path: &str, allow: Option<bool>) {
        debug!("Permission '{}' set to {:?}", path, allow);
        self.tree.write().await.set(path, allow);
    }

    pub async fn remove(&self, path: &str) -> bool {
        let removed = self.tree.write().await.remove(path);
        debug!("Permission '{}' removed: {}", path, removed);
        removed
    }

    pub async fn check(&self, path: &str) -> Option<bool> {
        self.tree.read().await.check(path)
    }

    pub async fn check_groups(&self, groups: &HashSet<String>, suffix: &str) -> Option<bool> {
        self.tree.read().await.check_groups(groups, suffix)
    }

    /// Check several suffixes at once under a single read lock, with the same permit bias
    pub async fn check_groups_any(
        &self,
        groups: &HashSet<String>,
        suffixes: &[String],
    ) -> Option<bool> {
        let tree = self.tree.read().await;
        let mut result = None;
        for suffix in suffixes {
            match tree.check_groups(groups, suffix) {
                Some(true) => return Some(true),
                Some(false) => result = Some(false),
                None => {}
            }
        }
        result
    }

    /// Replace every rule; readers see either the old or the new tree
    pub async fn rebuild<I>(&self, rules: I)
    where
        I: IntoIterator<Item = (String, Option<bool>)>,
    {
        let mut fresh = PermissionTree::new();
        for (path, allow) in rules {
            fresh.set(&path, allow);
        }
        let count = fresh.len();
        *self.tree.write().await = fresh;
        info!("Permission tree rebuilt with {} rules", count);
    }

    pub async fn clear(&self) {
        self.tree.write().await.clear();
    }

    pub async fn rule_count(&self) -> usize {
        self.tree.read().await.len()
    }
}
