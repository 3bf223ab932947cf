use anyhow::{Context, Result};
use log::{error, info, warn};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use commandgate::prelude::*;
use commandgate::VERSION;

const POLICY_COMMAND: &str = "/policy ";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting commandgate v{}", VERSION);

    let config_dir = env::var("COMMANDGATE_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let config_manager = Arc::new(ConfigurationManager::new(&config_dir));

    if let Err(e) = config_manager.initialize().await {
        error!("Failed to initialize configuration system: {:#}", e);
        return Err(e);
    }
    let config = config_manager.get_engine_config().await;

    let tts_state = Arc::new(TtsState::new(&config.voices));
    let definitions: Vec<Box<dyn CommandDefinition>> =
        vec![Box::new(TtsCommands::new(tts_state.clone()))];
    let groups = Arc::new(GroupRegistry::new());
    let bot = ChatBot::new(&definitions, groups, &config)
        .context("Failed to build command grammar")?;

    match config_manager.load_policy_snapshot().await {
        Ok(Some(snapshot)) => bot.apply_policy_event(&PolicyEvent::FullSnapshot(snapshot)).await,
        Ok(None) => info!("Starting without policies, handler defaults apply"),
        Err(e) => warn!("Ignoring unreadable policy snapshot: {:#}", e),
    }

    let listener = bot.listen_for_policy_events(config_manager.subscribe_to_policy_events());
    if let Err(e) = config_manager.watch_policies().await {
        warn!("Policy hot-reload disabled: {:#}", e);
    }

    let (response_tx, mut response_rx) = mpsc::channel::<BotResponse>(100);
    let printer = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            println!("[{}#{}] {}", response.platform, response.channel, response.message);
        }
    });

    info!(
        "Type chat lines as '{}' (prefix '{}'), or '{}<json>' for a policy event. Ctrl+C exits.",
        config.console_chatter, config.command_prefix, POLICY_COMMAND
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                if let Some(raw) = line.strip_prefix(POLICY_COMMAND) {
                    match serde_json::from_str::<PolicyEvent>(raw) {
                        Ok(event) => bot.apply_policy_event(&event).await,
                        Err(e) => warn!("Invalid policy event: {}", e),
                    }
                    continue;
                }

                let message = console_message(&config.console_chatter, line);
                let outcome = bot.process_message(&message, &response_tx).await;
                if outcome != CommandOutcome::Success {
                    println!("-> {}", outcome);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    listener.abort();
    drop(bot);
    drop(response_tx);
    if let Err(e) = printer.await {
        warn!("Response printer stopped abnormally: {}", e);
    }

    info!("commandgate stopped, {} skip requests handled", tts_state.skip_requests());
    Ok(())
}

/// Lines typed into the console come from the channel owner
fn console_message(chatter: &str, line: &str) -> ChatMessage {
    let mut message = ChatMessage::new("console", "local", chatter, chatter, line);
    message.user_badges.push("broadcaster".to_string());
    message.is_mod = true;
    message
}
