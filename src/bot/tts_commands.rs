use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::grammar::{BuildError, CommandDefinition, CommandHandler, GrammarBuilder};
use super::parameters::{parse_toggle, NameRegistry, NameSet, ParameterSpec};
use crate::types::{BotResponse, ChatMessage, ResponseSender};

/// Voice selection and playback switches the TTS commands operate on
pub struct TtsState {
    /// Every voice the speech backend offers
    pub available: Arc<NameSet>,
    /// Voices chatters may currently pick
    pub enabled: Arc<NameSet>,
    selected: RwLock<HashMap<String, String>>,
    active: AtomicBool,
    skip_requests: AtomicU64,
}

impl TtsState {
    pub fn new<I, S>(voices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let voices: Vec<String> = voices.into_iter().map(|v| v.as_ref().to_string()).collect();
        Self {
            available: Arc::new(NameSet::new(&voices)),
            enabled: Arc::new(NameSet::new(&voices)),
            selected: RwLock::new(HashMap::new()),
            active: AtomicBool::new(true),
            skip_requests: AtomicU64::new(0),
        }
    }

    pub async fn voice_of(&self, login: &str) -> Option<String> {
        self.selected.read().await.get(&login.to_lowercase()).cloned()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn skip_requests(&self) -> u64 {
        self.skip_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TtsAction {
    Status,
    EnableVoice,
    DisableVoice,
    SetState,
    CurrentVoice,
    SelectVoice,
    SelectVoiceFor,
    Skip,
    SkipAll,
}

struct TtsHandler {
    state: Arc<TtsState>,
    action: TtsAction,
}

impl TtsHandler {
    fn new(state: &Arc<TtsState>, action: TtsAction) -> Arc<dyn CommandHandler> {
        Arc::new(Self {
            state: Arc::clone(state),
            action,
        })
    }

    async fn send_response(
        &self,
        response: String,
        message: &ChatMessage,
        response_sender: &ResponseSender,
    ) -> Result<()> {
        response_sender
            .send(BotResponse {
                platform: message.platform.clone(),
                channel: message.channel.clone(),
                message: response,
            })
            .await
            .context("Failed to send TTS command response")
    }
}

#[async_trait]
impl CommandHandler for TtsHandler {
    fn accepts_custom_permission(&self) -> bool {
        matches!(self.action, TtsAction::Skip | TtsAction::SkipAll)
    }

    fn default_permission(&self, message: &ChatMessage) -> bool {
        match self.action {
            TtsAction::Status | TtsAction::CurrentVoice | TtsAction::SelectVoice => true,
            _ => message.is_mod || message.is_broadcaster(),
        }
    }

    async fn execute(
        &self,
        args: &HashMap<String, String>,
        message: &ChatMessage,
        response_sender: &ResponseSender,
    ) -> Result<()> {
        let voice = args.get("voiceName").map(|v| v.to_lowercase());

        let response = match (self.action, voice) {
            (TtsAction::Status, _) => format!(
                "TTS is {} with {} voices enabled",
                if self.state.is_active() { "on" } else { "off" },
                self.state.enabled.names().len()
            ),
            (TtsAction::EnableVoice, Some(voice)) => {
                if self.state.enabled.insert(&voice) {
                    info!("Voice '{}' enabled by {}", voice, message.username);
                    format!("Enabled voice {}", voice)
                } else {
                    format!("Voice {} is already enabled", voice)
                }
            }
            (TtsAction::DisableVoice, Some(voice)) => {
                self.state.enabled.remove(&voice);
                info!("Voice '{}' disabled by {}", voice, message.username);
                format!("Disabled voice {}", voice)
            }
            (TtsAction::SetState, _) => {
                let active = args
                    .get("state")
                    .and_then(|s| parse_toggle(s))
                    .context("State toggle argument missing")?;
                self.state.active.store(active, Ordering::Relaxed);
                format!("TTS turned {}", if active { "on" } else { "off" })
            }
            (TtsAction::CurrentVoice, _) => match self.state.voice_of(&message.username).await {
                Some(voice) => format!("@{} your voice is {}", message.username, voice),
                None => format!("@{} you are using the default voice", message.username),
            },
            (TtsAction::SelectVoice, Some(voice)) => {
                self.state
                    .selected
                    .write()
                    .await
                    .insert(message.username.to_lowercase(), voice.clone());
                format!("@{} your voice is now {}", message.username, voice)
            }
            (TtsAction::SelectVoiceFor, Some(voice)) => {
                let target = args
                    .get("target")
                    .map(|t| t.trim_start_matches('@').to_lowercase())
                    .context("Mention argument missing")?;
                self.state.selected.write().await.insert(target.clone(), voice.clone());
                format!("@{} voice is now {}", target, voice)
            }
            (TtsAction::Skip, _) => {
                self.state.skip_requests.fetch_add(1, Ordering::Relaxed);
                "Skipped the current message".to_string()
            }
            (TtsAction::SkipAll, _) => {
                self.state.skip_requests.fetch_add(1, Ordering::Relaxed);
                "Skipped all queued messages".to_string()
            }
            (action, None) => anyhow::bail!("{:?} requires a voice name", action),
        };

        self.send_response(response, message, response_sender).await
    }
}

/// Built-in `!tts`, `!voice` and `!skip` commands
pub struct TtsCommands {
    state: Arc<TtsState>,
}

impl TtsCommands {
    pub fn new(state: Arc<TtsState>) -> Self {
        Self { state }
    }
}

impl CommandDefinition for TtsCommands {
    fn name(&self) -> &str {
        "tts"
    }

    fn build(&self, builder: &mut GrammarBuilder) -> Result<(), BuildError> {
        let state = &self.state;
        let available: Arc<dyn NameRegistry> = state.available.clone();
        let enabled: Arc<dyn NameRegistry> = state.enabled.clone();

        builder
            .command("tts")?
            .add_permission("tts")
            .set_handler(TtsHandler::new(state, TtsAction::Status))?
            .scope(|b| {
                b.add_static("add")?
                    .add_permission("tts.voice.add")
                    .add_parameter(ParameterSpec::registered(
                        "voiceName",
                        available.clone(),
                        false,
                    ))?
                    .set_handler(TtsHandler::new(state, TtsAction::EnableVoice))?;
                Ok(())
            })?
            .scope(|b| {
                b.add_static("delete")?
                    .add_permission("tts.voice.delete")
                    .add_parameter(ParameterSpec::registered("voiceName", enabled.clone(), false))?
                    .set_handler(TtsHandler::new(state, TtsAction::DisableVoice))?;
                Ok(())
            })?
            .add_alias("del", "delete")?
            .scope(|b| {
                b.add_static("state")?
                    .add_parameter(ParameterSpec::state_toggle("state", false))?
                    .set_handler(TtsHandler::new(state, TtsAction::SetState))?;
                Ok(())
            })?;

        builder
            .command("voice")?
            .set_handler(TtsHandler::new(state, TtsAction::CurrentVoice))?
            .add_parameter(ParameterSpec::registered("voiceName", enabled.clone(), false))?
            .set_handler(TtsHandler::new(state, TtsAction::SelectVoice))?
            .add_parameter(ParameterSpec::mention("target", true))?
            .add_permission("tts.voice.others")
            .set_handler(TtsHandler::new(state, TtsAction::SelectVoiceFor))?;

        builder
            .command("skip")?
            .add_permission("tts.skip")
            .set_handler(TtsHandler::new(state, TtsAction::Skip))?
            .add_parameter(ParameterSpec::one_of("scope", ["all"], true))?
            .set_handler(TtsHandler::new(state, TtsAction::SkipAll))?;

        Ok(())
    }
}
