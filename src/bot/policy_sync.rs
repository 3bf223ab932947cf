// src/bot/policy_sync.rs - Applies external policy events to the permission and usage trees

use chrono::Duration;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use super::permissions::PermissionManager;
use super::usage::UsagePolicyManager;
use crate::types::{PolicyEvent, PolicySnapshot, UsagePolicyEntry};

/// Keeps the in-memory policy trees in step with the external policy source
pub struct PolicySynchronizer {
    permissions: Arc<PermissionManager>,
    usage: Arc<UsagePolicyManager<String>>,
    /// Group id -> group name, from the last full snapshot
    group_names: RwLock<HashMap<String, String>>,
}

impl PolicySynchronizer {
    pub fn new(
        permissions: Arc<PermissionManager>,
        usage: Arc<UsagePolicyManager<String>>,
    ) -> Self {
        Self {
            permissions,
            usage,
            group_names: RwLock::new(HashMap::new()),
        }
    }

    pub async fn apply(&self, event: &PolicyEvent) {
        match event {
            PolicyEvent::FullSnapshot(snapshot) => self.apply_snapshot(snapshot).await,
            PolicyEvent::SinglePolicyUpdate(update) => {
                self.apply_update(update).await;
            }
        }
    }

    /// Rebuild both trees from scratch
    pub async fn apply_snapshot(&self, snapshot: &PolicySnapshot) {
        let names: HashMap<String, String> = snapshot
            .groups
            .iter()
            .map(|g| (g.id.clone(), g.name.to_lowercase()))
            .collect();

        let rules: Vec<(String, Option<bool>)> = snapshot
            .permissions
            .iter()
            .filter_map(|entry| match names.get(&entry.group_id) {
                Some(group) => Some((
                    format!("{}.{}", group, entry.path.to_lowercase()),
                    entry.allow,
                )),
                None => {
                    warn!(
                        "Skipping permission '{}' for unknown group id '{}'",
                        entry.path, entry.group_id
                    );
                    None
                }
            })
            .collect();

        let policies: Vec<(String, usize, Duration)> = snapshot
            .policies
            .iter()
            .filter_map(|entry| match names.get(&entry.group_id) {
                Some(group) => Some((
                    format!("{}.{}", group, entry.path.to_lowercase()),
                    entry.count,
                    window(entry),
                )),
                None => {
                    warn!(
                        "Skipping usage policy '{}' for unknown group id '{}'",
                        entry.path, entry.group_id
                    );
                    None
                }
            })
            .collect();

        *self.group_names.write().await = names;
        self.permissions.rebuild(rules).await;
        self.usage.rebuild(policies).await;
        info!(
            "Applied policy snapshot: {} groups, {} permissions, {} usage policies",
            snapshot.groups.len(),
            snapshot.permissions.len(),
            snapshot.policies.len()
        );
    }

    /// Upsert one usage policy; returns false when the group is unknown
    pub async fn apply_update(&self, update: &UsagePolicyEntry) -> bool {
        let group = match self.group_names.read().await.get(&update.group_id) {
            Some(group) => group.clone(),
            None => {
                warn!("Ignoring usage policy update for unknown group id '{}'", update.group_id);
                return false;
            }
        };

        let path = format!("{}.{}", group, update.path.to_lowercase());
        let applied = self.usage.set(&path, update.count, window(update)).await;
        debug!("Usage policy update for '{}' applied: {}", path, applied);
        applied
    }

    /// Apply events from `receiver` until the channel closes
    pub fn spawn_listener(
        self: Arc<Self>,
        mut receiver: broadcast::Receiver<PolicyEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => self.apply(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        error!("Policy listener lagged, {} events were dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Policy event channel closed, stopping listener");
                        break;
                    }
                }
            }
        })
    }
}

fn window(entry: &UsagePolicyEntry) -> Duration {
    Duration::milliseconds(i64::try_from(entry.window_millis).unwrap_or(i64::MAX))
}
