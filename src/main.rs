//! chat-sync-tail
//!
//! Terminal client for the chat sync core: selects one conversation, prints
//! its timeline as it changes, and optionally sends a message.
//!
//! ```text
//! chat-sync-tail list
//! chat-sync-tail <support|peer|project> <conversation-id> [message]
//! ```
//!
//! Reads `CHAT_TOKEN` and `CHAT_SELF_ID` plus the `CHAT_*` settings
//! documented on `Config`.

use anyhow::{anyhow, Context};
use marketplace_chat_sync::chat::{
    ChannelSessionManager, ConversationDirectory, ConversationKind, ConversationRef, Credential,
    CredentialStore, Message, OutgoingMessage, TimelineSnapshot,
};
use marketplace_chat_sync::transport::{HttpChatApi, HttpCredentialRefresher, SseTransport};
use marketplace_chat_sync::Config;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    config.validate()?;
    info!("Configuration loaded: {:?}", config);

    let token = env::var("CHAT_TOKEN").context("CHAT_TOKEN is not set")?;
    let self_id = env::var("CHAT_SELF_ID").unwrap_or_default();
    let credentials = CredentialStore::with_credential(Credential::new(token));
    let api = Arc::new(HttpChatApi::new(&config)?);

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("list") => list_conversations(api, credentials).await,
        Some(kind) => {
            let kind: ConversationKind = kind.parse().map_err(|e: String| anyhow!(e))?;
            let id = args
                .get(1)
                .ok_or_else(|| anyhow!("missing conversation id"))?;
            let message = (args.len() > 2).then(|| args[2..].join(" "));
            let manager = ChannelSessionManager::new(
                api,
                Arc::new(SseTransport::new(&config)?),
                Arc::new(HttpCredentialRefresher::new(&config)?),
                credentials,
                self_id,
                &config,
            );
            tail(manager, ConversationRef::new(kind, id.as_str()), message).await
        }
        None => Err(anyhow!(
            "usage: chat-sync-tail list | chat-sync-tail <kind> <conversation-id> [message]"
        )),
    }
}

async fn list_conversations(
    api: Arc<HttpChatApi>,
    credentials: CredentialStore,
) -> anyhow::Result<()> {
    let mut directory = ConversationDirectory::new(api, credentials);
    let refreshed = directory.refresh().await?;
    if refreshed == 0 {
        warn!("No conversation kind could be listed");
    }
    for entry in directory.entries() {
        println!(
            "{:<24} {:>3} unread  {}",
            entry.conversation.to_string(),
            entry.unread_count,
            entry.title
        );
    }
    println!("total unread: {}", directory.total_unread());
    Ok(())
}

async fn tail(
    manager: ChannelSessionManager,
    conversation: ConversationRef,
    message: Option<String>,
) -> anyhow::Result<()> {
    let mut updates = manager.subscribe();
    manager.select(conversation).await?;
    if let Some(message) = message {
        let temp_id = manager.send(OutgoingMessage::text(message)).await?;
        info!(temp_id = %temp_id, "Message queued");
    }

    let mut printed: HashMap<String, String> = HashMap::new();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        print_changes(&snapshot, &mut printed);
        if snapshot.session_expired {
            warn!("Session expired; set a fresh CHAT_TOKEN and restart");
            break;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    manager.close().await;
    Ok(())
}

/// Print messages that are new or whose delivery status changed
fn print_changes(snapshot: &TimelineSnapshot, printed: &mut HashMap<String, String>) {
    for message in &snapshot.messages {
        let line = render(message);
        if printed.get(&message.id) != Some(&line) {
            println!("{}", line);
            printed.insert(message.id.clone(), line);
        }
    }
}

fn render(message: &Message) -> String {
    let time = message
        .timestamp
        .millis()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "????-??-?? ??:??:??".to_string());
    let status = message
        .delivery_status
        .map(|s| format!(" [{}]", s))
        .unwrap_or_default();
    format!("{} {}: {}{}", time, message.sender_id, message.content, status)
}
