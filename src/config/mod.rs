// src/config/mod.rs - Engine configuration and policy snapshot files with hot-reload

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Duration;

use crate::types::{PolicyEvent, PolicySnapshot};

pub const ENGINE_CONFIG_FILE: &str = "engine.yaml";
pub const POLICY_SNAPSHOT_FILE: &str = "policies.yaml";

/// Settings for the command engine, read from `engine.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfiguration {
    pub command_prefix: String,
    /// Chatter ids that bypass permission and usage checks
    pub owner_ids: Vec<String>,
    pub enforce_usage_policies: bool,
    /// Chatter id used for lines typed into the console
    pub console_chatter: String,
    /// Voices enabled at startup
    pub voices: Vec<String>,
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            command_prefix: "!".to_string(),
            owner_ids: Vec::new(),
            enforce_usage_policies: false,
            console_chatter: "console".to_string(),
            voices: vec!["brian".to_string(), "amy".to_string(), "emma".to_string()],
        }
    }
}

impl EngineConfiguration {
    /// Apply `COMMANDGATE_*` overrides using `lookup` to read variables
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup("COMMANDGATE_PREFIX").filter(|p| !p.trim().is_empty()) {
            self.command_prefix = prefix.trim().to_string();
        }

        if let Some(owners) = lookup("COMMANDGATE_OWNERS") {
            self.owner_ids = owners
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(enforce) = lookup("COMMANDGATE_ENFORCE_USAGE") {
            match enforce.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.enforce_usage_policies = true,
                "0" | "false" | "no" | "off" => self.enforce_usage_policies = false,
                other => warn!("Ignoring invalid COMMANDGATE_ENFORCE_USAGE value: {}", other),
            }
        }
    }
}

/// Loads engine settings and policy snapshots, and watches the snapshot for changes
#[derive(Clone)]
pub struct ConfigurationManager {
    config_dir: PathBuf,
    engine_config: Arc<RwLock<EngineConfiguration>>,

    /// File watchers for hot-reloading
    watchers: Arc<RwLock<Vec<RecommendedWatcher>>>,

    /// Policy events produced by snapshot reloads
    policy_notifier: broadcast::Sender<PolicyEvent>,

    last_reload: Arc<RwLock<std::time::Instant>>,
}

impl ConfigurationManager {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        let (tx, _) = broadcast::channel(100);

        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            engine_config: Arc::new(RwLock::new(EngineConfiguration::default())),
            watchers: Arc::new(RwLock::new(Vec::new())),
            policy_notifier: tx,
            last_reload: Arc::new(RwLock::new(std::time::Instant::now())),
        }
    }

    /// Load `engine.yaml` (defaults when missing) and apply environment overrides
    pub async fn initialize(&self) -> Result<()> {
        let path = self.config_dir.join(ENGINE_CONFIG_FILE);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read engine config: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse engine config: {}", path.display()))?
        } else {
            warn!("Engine config not found at {}, using defaults", path.display());
            EngineConfiguration::default()
        };

        config.apply_overrides(|name| std::env::var(name).ok());
        if config.command_prefix.is_empty() {
            warn!("Empty command prefix configured, falling back to '!'");
            config.command_prefix = "!".to_string();
        }

        info!(
            "Engine configuration loaded: prefix '{}', {} owners, usage enforcement {}",
            config.command_prefix,
            config.owner_ids.len(),
            config.enforce_usage_policies
        );
        *self.engine_config.write().await = config;
        Ok(())
    }

    pub async fn get_engine_config(&self) -> EngineConfiguration {
        self.engine_config.read().await.clone()
    }

    pub fn policy_snapshot_path(&self) -> PathBuf {
        self.config_dir.join(POLICY_SNAPSHOT_FILE)
    }

    /// Read `policies.yaml`; `None` when the file does not exist
    pub async fn load_policy_snapshot(&self) -> Result<Option<PolicySnapshot>> {
        let path = self.policy_snapshot_path();
        if !path.exists() {
            debug!("No policy snapshot at {}", path.display());
            return Ok(None);
        }
        Self::read_snapshot(&path).await.map(Some)
    }

    async fn read_snapshot(path: &Path) -> Result<PolicySnapshot> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read policy snapshot: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse policy snapshot: {}", path.display()))
    }

    /// Subscribe to policy events produced by snapshot reloads
    pub fn subscribe_to_policy_events(&self) -> broadcast::Receiver<PolicyEvent> {
        self.policy_notifier.subscribe()
    }

    /// Re-publish `policies.yaml` as a full snapshot whenever it changes
    pub async fn watch_policies(&self) -> Result<()> {
        let config_dir = self.config_dir.clone();
        let notifier = self.policy_notifier.clone();
        let last_reload = self.last_reload.clone();

        let (tx, mut rx) = tokio::sync::mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if let Err(e) = tx.blocking_send(event) {
                    error!("Failed to send file watch event: {}", e);
                }
            }
        })?;

        watcher
            .watch(&config_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", config_dir.display()))?;

        // Store watcher to prevent it from being dropped
        self.watchers.write().await.push(watcher);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                let Some(path) = event.paths.into_iter().find(|p| is_snapshot_file(p)) else {
                    continue;
                };

                // Debounce rapid file changes
                {
                    let now = std::time::Instant::now();
                    let last = *last_reload.read().await;
                    if now.duration_since(last) < Duration::from_millis(500) {
                        continue;
                    }
                    *last_reload.write().await = now;
                }

                info!("Policy snapshot changed, reloading...");
                match Self::read_snapshot(&path).await {
                    Ok(snapshot) => {
                        if notifier.send(PolicyEvent::FullSnapshot(snapshot)).is_err() {
                            warn!("Policy snapshot reloaded but nobody is listening");
                        }
                    }
                    Err(e) => error!("Failed to reload policy snapshot: {:#}", e),
                }
            }
        });

        info!("Watching {} for policy changes", self.policy_snapshot_path().display());
        Ok(())
    }
}

fn is_snapshot_file(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some("policies.yaml") | Some("policies.yml")
    )
}
