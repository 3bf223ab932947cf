// src/bot/usage.rs - Sliding-window usage policies with escalation to parent policies

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::RwLock;

/// Ledger size that first triggers pruning of idle keys
const PRUNE_THRESHOLD: usize = 64;

/// `count` uses are admitted within any `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageLimit {
    pub count: usize,
    pub window: Duration,
}

/// Most recent usage instants of one key. Grows up to the policy count,
/// then overwrites circularly with `cursor` on the oldest entry.
#[derive(Debug, Clone, Default)]
struct UsageBuffer {
    slots: Vec<DateTime<Utc>>,
    cursor: usize,
}

impl UsageBuffer {
    /// Resize to `count`, keeping the most recent entries
    fn reconcile(&mut self, count: usize) {
        let len = self.slots.len();
        if len == count || (len < count && self.cursor == 0) {
            return;
        }

        self.slots.rotate_left(self.cursor);
        self.cursor = 0;
        if len > count {
            self.slots.drain(..len - count);
        }
    }

    fn try_admit(&mut self, now: DateTime<Utc>, limit: UsageLimit) -> bool {
        if limit.count == 0 {
            return false;
        }
        if self.slots.len() < limit.count {
            self.slots.push(now);
            return true;
        }

        let oldest = self.slots[self.cursor];
        if now.signed_duration_since(oldest) < limit.window {
            return false;
        }
        self.slots[self.cursor] = now;
        self.cursor = (self.cursor + 1) % self.slots.len();
        true
    }

    fn newest(&self) -> Option<DateTime<Utc>> {
        let len = self.slots.len();
        (len > 0).then(|| self.slots[(self.cursor + len - 1) % len])
    }

    /// Every recorded use has left the window
    fn is_idle(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.newest()
            .map_or(true, |newest| now.signed_duration_since(newest) >= window)
    }
}

struct UsageLedger<K> {
    buffers: HashMap<K, UsageBuffer>,
    prune_at: usize,
}

impl<K: Eq + Hash + Clone> UsageLedger<K> {
    fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            prune_at: PRUNE_THRESHOLD,
        }
    }

    /// Drop idle keys once the ledger doubles past its last pruned size
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        if self.buffers.len() < self.prune_at {
            return;
        }
        let before = self.buffers.len();
        self.buffers.retain(|_, buffer| !buffer.is_idle(now, window));
        self.prune_at = (self.buffers.len() * 2).max(PRUNE_THRESHOLD);
        debug!("Pruned {} idle usage buffers", before - self.buffers.len());
    }
}

struct UsagePolicyNode<K> {
    name: String,
    limit: Option<UsageLimit>,
    children: HashMap<String, UsagePolicyNode<K>>,
    usage: Mutex<UsageLedger<K>>,
}

impl<K: Eq + Hash + Clone> UsagePolicyNode<K> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            limit: None,
            children: HashMap::new(),
            usage: Mutex::new(UsageLedger::new()),
        }
    }

    /// Only this node's lock is held, and it is released on return
    fn admit(&self, key: &K, limit: UsageLimit, now: DateTime<Utc>) -> bool {
        let mut ledger = match self.usage.lock() {
            Ok(ledger) => ledger,
            Err(poisoned) => poisoned.into_inner(),
        };
        ledger.prune(now, limit.window);
        let buffer = ledger.buffers.entry(key.clone()).or_default();
        buffer.reconcile(limit.count);
        buffer.try_admit(now, limit)
    }

    fn policy_count(&self) -> usize {
        usize::from(self.limit.is_some())
            + self
                .children
                .values()
                .map(UsagePolicyNode::policy_count)
                .sum::<usize>()
    }
}

/// Dotted-path tree of usage limits keyed per `K` (usually a chatter id)
pub struct UsagePolicyTree<K> {
    root: UsagePolicyNode<K>,
}

impl<K: Eq + Hash + Clone> Default for UsagePolicyTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> UsagePolicyTree<K> {
    pub fn new() -> Self {
        Self {
            root: UsagePolicyNode::new(""),
        }
    }

    /// Configure `path`; existing per-key history is resized on its next use.
    /// The root itself never carries a limit.
    pub fn set(&mut self, path: &str, count: usize, window: Duration) -> bool {
        let mut node = &mut self.root;
        let mut depth = 0;
        for segment in segments(path) {
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(|| UsagePolicyNode::new(segment));
            depth += 1;
        }
        if depth == 0 {
            return false;
        }
        node.limit = Some(UsageLimit { count, window });
        true
    }

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

    /// Existing nodes along `path`, root excluded, outermost first
    fn chain(&self, path: &str) -> Vec<&UsagePolicyNode<K>> {
        let mut chain = Vec::new();
        let mut node = &self.root;
        for segment in segments(path) {
            match node.children.get(segment) {
                Some(child) => {
                    chain.push(child);
                    node = child;
                }
                None => break,
            }
        }
        chain
    }

    /// Limit that governs `path`: the nearest configured node at or above it
    pub fn limit_for(&self, path: &str) -> Option<UsageLimit> {
        self.chain(path).iter().rev().find_map(|node| node.limit)
    }

    /// Admit one use of `path` by `key` at `now`, escalating to broader policies
    /// whenever a narrower one is exhausted
    pub fn try_use_at(&self, key: &K, path: &str, now: DateTime<Utc>) -> bool {
        for node in self.chain(path).iter().rev() {
            let Some(limit) = node.limit else {
                continue;
            };
            if node.admit(key, limit, now) {
                return true;
            }
            debug!("Usage policy '{}' exhausted for '{}', escalating", node.name, path);
        }
        false
    }

    /// Admit through the first group whose `<group>.<suffix>` policy permits it
    pub fn try_use_groups_at(
        &self,
        key: &K,
        groups: &HashSet<String>,
        suffix: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let mut ordered: Vec<&String> = groups.iter().collect();
        ordered.sort();
        for group in ordered {
            if self.try_use_at(key, &format!("{}.{}", group, suffix), now) {
                return true;
            }
        }
        false
    }

    pub fn clear(&mut self) {
        self.root = UsagePolicyNode::new("");
    }

    pub fn len(&self) -> usize {
        self.root.policy_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Usage policy tree shared between message workers and the policy source
pub struct UsagePolicyManager<K> {
    tree: RwLock<UsagePolicyTree<K>>,
}

impl<K: Eq + Hash + Clone> Default for UsagePolicyManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> UsagePolicyManager<K> {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(UsagePolicyTree::new()),
        }
    }

    pub async fn set(&self, path: &str, count: usize, window: Duration) -> bool {
        let applied = self.tree.write().await.set(path, count, window);
        if applied {
            debug!(
                "Usage policy '{}' set to {} per {}ms",
                path,
                count,
                window.num_milliseconds()
            );
        }
        applied
    }

    pub async fn remove(&self, path: &str) -> bool {
        self.tree.write().await.remove(path)
    }

    pub async fn limit_for(&self, path: &str) -> Option<UsageLimit> {
        self.tree.read().await.limit_for(path)
    }

    pub async fn try_use(&self, key: &K, path: &str) -> bool {
        self.tree.read().await.try_use_at(key, path, Utc::now())
    }

    pub async fn try_use_groups(
        &self,
        key: &K,
        groups: &HashSet<String>,
        suffix: &str,
    ) -> bool {
        self.tree
            .read()
            .await
            .try_use_groups_at(key, groups, suffix, Utc::now())
    }

    /// Replace every policy; usage history is dropped with the old tree
    pub async fn rebuild<I>(&self, policies: I)
    where
        I: IntoIterator<Item = (String, usize, Duration)>,
    {
        let mut fresh = UsagePolicyTree::new();
        for (path, count, window) in policies {
            fresh.set(&path, count, window);
        }
        let count = fresh.len();
        *self.tree.write().await = fresh;
        info!("Usage policy tree rebuilt with {} policies", count);
    }

    pub async fn clear(&self) {
        self.tree.write().await.clear();
    }

    pub async fn policy_count(&self) -> usize {
        self.tree.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    /// Keys holding history on the node at exactly `path`
    fn tracked_keys(tree: &UsagePolicyTree<String>, path: &str) -> usize {
        let chain = tree.chain(path);
        match chain.last() {
            Some(node) if chain.len() == segments(path).count() => {
                node.usage.lock().unwrap().buffers.len()
            }
            _ => 0,
        }
    }

    #[test]
    fn test_sliding_window_admits_count_per_window() {
        let mut tree = UsagePolicyTree::new();
        tree.set("everyone.tts", 2, Duration::seconds(10));
        let key = "chatter".to_string();

        assert!(tree.try_use_at(&key, "everyone.tts", at(0)));
        assert!(tree.try_use_at(&key, "everyone.tts", at(3)));
        assert!(!tree.try_use_at(&key, "everyone.tts", at(9)));
        // Ten seconds after the first use its slot frees up
        assert!(tree.try_use_at(&key, "everyone.tts", at(10)));
        assert!(!tree.try_use_at(&key, "everyone.tts", at(12)));
        assert!(tree.try_use_at(&key, "everyone.tts", at(13)));
    }

    #[test]
    fn test_keys_are_tracked_independently() {
        let mut tree = UsagePolicyTree::new();
        tree.set("everyone.tts", 1, Duration::seconds(10));

        assert!(tree.try_use_at(&"a".to_string(), "everyone.tts", at(0)));
        assert!(tree.try_use_at(&"b".to_string(), "everyone.tts", at(0)));
        assert!(!tree.try_use_at(&"a".to_string(), "everyone.tts", at(1)));
    }

    #[test]
    fn test_exhausted_child_escalates_to_parent() {
        let mut tree = UsagePolicyTree::new();
        tree.set("everyone.tts", 5, Duration::seconds(60));
        tree.set("everyone.tts.add", 1, Duration::seconds(60));
        let key = "chatter".to_string();

        assert!(tree.try_use_at(&key, "everyone.tts.add", at(0)));
        // Child is exhausted, parent still has room
        assert!(tree.try_use_at(&key, "everyone.tts.add", at(1)));
        assert_eq!(tree.limit_for("everyone.tts.add.*").map(|l| l.count), Some(1));
    }

    #[test]
    fn test_unconfigured_paths_use_nearest_configured_ancestor() {
        let mut tree = UsagePolicyTree::new();
        tree.set("everyone", 1, Duration::seconds(60));
        let key = "chatter".to_string();

        assert!(tree.try_use_at(&key, "everyone.tts.add.*", at(0)));
        assert!(!tree.try_use_at(&key, "everyone.obs", at(1)));
        // Nothing configured at all
        assert!(!tree.try_use_at(&key, "mods.tts", at(2)));
        assert!(!tree.set("", 1, Duration::seconds(1)));
    }

    #[test]
    fn test_multi_group_uses_first_permitting_group() {
        let mut tree = UsagePolicyTree::new();
        tree.set("everyone.tts", 1, Duration::seconds(60));
        tree.set("vips.tts", 1, Duration::seconds(60));
        let groups: HashSet<String> = ["everyone", "vips"].iter().map(|s| s.to_string()).collect();
        let key = "chatter".to_string();

        assert!(tree.try_use_groups_at(&key, &groups, "tts", at(0)));
        assert!(tree.try_use_groups_at(&key, &groups, "tts", at(1)));
        assert!(!tree.try_use_groups_at(&key, &groups, "tts", at(2)));
    }

    #[test]
    fn test_resize_keeps_most_recent_history() {
        let mut tree = UsagePolicyTree::new();
        tree.set("everyone.tts", 3, Duration::seconds(10));
        let key = "chatter".to_string();
        for second in [0, 1, 2] {
            assert!(tree.try_use_at(&key, "everyone.tts", at(second)));
        }

        // Shrinking keeps the uses at 1s and 2s
        tree.set("everyone.tts", 2, Duration::seconds(10));
        assert!(!tree.try_use_at(&key, "everyone.tts", at(10)));
        assert!(tree.try_use_at(&key, "everyone.tts", at(11)));

        // Growing adds free slots
        tree.set("everyone.tts", 4, Duration::seconds(10));
        assert!(tree.try_use_at(&key, "everyone.tts", at(11)));
        assert!(tree.try_use_at(&key, "everyone.tts", at(11)));
        assert!(!tree.try_use_at(&key, "everyone.tts", at(11)));
    }

    #[test]
    fn test_buffer_reconcile_orders_by_cursor() {
        let mut buffer = UsageBuffer::default();
        let limit = UsageLimit {
            count: 3,
            window: Duration::seconds(100),
        };
        assert!(buffer.try_admit(at(0), limit));
        assert!(buffer.try_admit(at(1), limit));
        assert!(buffer.try_admit(at(2), limit));
        assert!(buffer.try_admit(at(100), limit));
        assert_eq!(buffer.cursor, 1);

        buffer.reconcile(2);
        assert_eq!(buffer.slots, vec![at(2), at(100)]);
        assert_eq!(buffer.cursor, 0);
        assert_eq!(buffer.newest(), Some(at(100)));
    }

    #[test]
    fn test_huge_count_grows_with_use() {
        let mut tree = UsagePolicyTree::new();
        tree.set("everyone.tts", usize::MAX, Duration::seconds(10));
        let key = "chatter".to_string();

        for second in 0..5 {
            assert!(tree.try_use_at(&key, "everyone.tts", at(second)));
        }
        let chain = tree.chain("everyone.tts");
        let ledger = chain[1].usage.lock().unwrap();
        assert_eq!(ledger.buffers[&key].slots.len(), 5);
    }

    #[test]
    fn test_idle_keys_are_pruned() {
        let mut tree = UsagePolicyTree::new();
        tree.set("everyone.tts", 1, Duration::seconds(10));

        for chatter in 0..PRUNE_THRESHOLD {
            assert!(tree.try_use_at(&chatter.to_string(), "everyone.tts", at(0)));
        }
        assert_eq!(tracked_keys(&tree, "everyone.tts"), PRUNE_THRESHOLD);

        // Everything above has left the window by now
        assert!(tree.try_use_at(&"late".to_string(), "everyone.tts", at(30)));
        assert_eq!(tracked_keys(&tree, "everyone.tts"), 1);
        assert!(!tree.try_use_at(&"late".to_string(), "everyone.tts", at(31)));
        assert_eq!(tracked_keys(&tree, "everyone"), 0);
    }

    #[tokio::test]
    async fn test_manager_rebuild_and_remove() {
        let manager: UsagePolicyManager<String> = UsagePolicyManager::new();
        manager
            .rebuild(vec![("everyone.tts".to_string(), 1, Duration::seconds(60))])
            .await;
        assert_eq!(manager.policy_count().await, 1);

        let key = "chatter".to_string();
        assert!(manager.try_use(&key, "everyone.tts").await);
        assert!(!manager.try_use(&key, "everyone.tts").await);

        assert!(manager.remove("everyone.tts").await);
        assert!(!manager.try_use(&key, "everyone.tts").await);
        assert_eq!(manager.policy_count().await, 0);
    }

    fn policy_set(count: usize) -> Vec<(String, usize, Duration)> {
        ["everyone.tts", "everyone.obs", "mods.tts"]
            .iter()
            .map(|path| (path.to_string(), count, Duration::seconds(60)))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_observe_partial_rebuild() {
        let manager: Arc<UsagePolicyManager<String>> = Arc::new(UsagePolicyManager::new());
        manager.rebuild(policy_set(1_000)).await;

        let writer = {
            let manager = manager.clone();
            tokio::spawn(async move {
                for round in 0..200 {
                    let count = if round % 2 == 0 { 2_000 } else { 1_000 };
                    manager.rebuild(policy_set(count)).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let groups: HashSet<String> = ["everyone", "mods"].iter().map(|s| s.to_string()).collect();
        let readers: Vec<_> = (0..4)
            .map(|reader| {
                let manager = manager.clone();
                let groups = groups.clone();
                tokio::spawn(async move {
                    let key = format!("chatter-{}", reader);
                    for _ in 0..500 {
                        {
                            let tree = manager.tree.read().await;
                            let tts = tree.limit_for("everyone.tts.add");
                            assert!(tts.is_some());
                            assert_eq!(tree.limit_for("everyone.obs"), tts);
                            assert_eq!(tree.limit_for("mods.tts"), tts);
                            assert_eq!(tree.len(), 3);
                        }
                        assert!(manager.try_use_groups(&key, &groups, "tts.add").await);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
