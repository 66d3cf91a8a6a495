//! Server-Sent Events live transport
//!
//! Opens `GET {base}/{namespace}/{id}/events` and turns the event stream
//! into `TransportEvent`s. Drops are retried with bounded exponential
//! backoff; a 401/403 stops the channel and is reported as `AuthRejected`
//! so the session manager can refresh the credential.

use crate::chat::credentials::CredentialStore;
use crate::chat::models::{
    value_to_id, ConversationKind, ConversationRef, ConversationStatus, DeliveryStatus,
    RawMessage,
};
use crate::config::{Config, ReconnectConfig};
use crate::error::{SyncError, SyncResult};
use crate::transport::http::authorize;
use crate::transport::{ChannelEvent, LiveSubscription, LiveTransport, TransportEvent};
use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", alias = "event")]
    kind: String,
    #[serde(alias = "payload")]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryPayload {
    Wrapped { messages: Vec<RawMessage> },
    Bare(Vec<RawMessage>),
}

#[derive(Debug, Deserialize)]
struct ReceiptPayload {
    #[serde(alias = "messageId", alias = "message_id")]
    id: Value,
    #[serde(default)]
    status: Option<DeliveryStatus>,
}

/// Decode an SSE event into a channel event
///
/// Events either carry their name in `event:` or wrap the payload in a
/// `{ "type": ..., "data": ... }` envelope. Heartbeats and unknown events
/// decode to `None`.
pub fn decode_event(event: &Event) -> SyncResult<Option<ChannelEvent>> {
    let mut name = if event.event.is_empty() {
        "message".to_string()
    } else {
        event.event.clone()
    };
    let mut payload: Value = serde_json::from_str(&event.data)?;

    if name == "message" {
        if let Ok(envelope) = serde_json::from_value::<Envelope>(payload.clone()) {
            name = envelope.kind;
            payload = envelope.data;
        }
    }

    let event = match name.as_str() {
        "history" => {
            let messages = match serde_json::from_value(payload)? {
                HistoryPayload::Wrapped { messages } => messages,
                HistoryPayload::Bare(messages) => messages,
            };
            ChannelEvent::History(messages)
        }
        "message" | "new_message" | "newMessage" => {
            ChannelEvent::Message(serde_json::from_value(payload)?)
        }
        "status" | "conversation_status" => {
            ChannelEvent::Status(serde_json::from_value::<ConversationStatus>(payload)?)
        }
        "receipt" | "delivered" | "read" => {
            let receipt: ReceiptPayload = serde_json::from_value(payload)?;
            let message_id = value_to_id(&receipt.id)
                .ok_or_else(|| SyncError::Decode("receipt without message id".to_string()))?;
            let status = match (receipt.status, name.as_str()) {
                (Some(status), _) => status,
                (None, "read") => DeliveryStatus::Read,
                (None, _) => DeliveryStatus::Delivered,
            };
            ChannelEvent::Receipt { message_id, status }
        }
        "ping" | "heartbeat" => return Ok(None),
        other => {
            debug!(event = %other, "Ignoring unknown live event");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// How one connection attempt ended
enum Outcome {
    /// Stream closed or failed; worth retrying
    Dropped { reason: String, was_connected: bool },
    /// Credential refused; retrying would not help
    Rejected(String),
    /// Nobody is listening any more
    ReceiverGone,
}

/// Live transport over SSE
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: Client,
    base_url: String,
    reconnect: ReconnectConfig,
    buffer: usize,
}

impl SseTransport {
    /// Build a transport from the configuration
    ///
    /// Only the connect phase is bounded by the request timeout; an open
    /// stream may stay idle indefinitely.
    pub fn new(config: &Config) -> SyncResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            reconnect: config.reconnect.clone(),
            buffer: config.merge.event_buffer,
        })
    }
}

#[async_trait]
impl LiveTransport for SseTransport {
    async fn subscribe(
        &self,
        conversation: &ConversationRef,
        credentials: &CredentialStore,
    ) -> SyncResult<LiveSubscription> {
        let (events, receiver) = mpsc::channel(self.buffer);
        let channel = SseChannel {
            client: self.client.clone(),
            url: format!(
                "{}/{}/{}/events",
                self.base_url,
                conversation.kind.descriptor().namespace,
                conversation.id
            ),
            kind: conversation.kind,
            label: conversation.to_string(),
            credentials: credentials.clone(),
            reconnect: self.reconnect.clone(),
            events,
        };
        let task = tokio::spawn(channel.run());
        Ok(LiveSubscription::new(receiver, Some(task)))
    }
}

struct SseChannel {
    client: Client,
    url: String,
    kind: ConversationKind,
    label: String,
    credentials: CredentialStore,
    reconnect: ReconnectConfig,
    events: mpsc::Sender<TransportEvent>,
}

impl SseChannel {
    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            match self.stream_once().await {
                Outcome::ReceiverGone => return,
                Outcome::Rejected(reason) => {
                    warn!(conversation = %self.label, reason = %reason, "Live channel rejected");
                    self.emit(TransportEvent::AuthRejected { reason }).await;
                    return;
                }
                Outcome::Dropped {
                    reason,
                    was_connected,
                } => {
                    if was_connected {
                        attempt = 0;
                    }
                    debug!(conversation = %self.label, reason = %reason, "Live channel dropped");
                    if !self.emit(TransportEvent::Disconnected { reason }).await {
                        return;
                    }
                }
            }

            attempt += 1;
            if attempt > self.reconnect.max_attempts {
                warn!(
                    conversation = %self.label,
                    attempts = self.reconnect.max_attempts,
                    "Live channel retry budget spent"
                );
                self.emit(TransportEvent::Exhausted).await;
                return;
            }
            if !self.emit(TransportEvent::Reconnecting { attempt }).await {
                return;
            }
            tokio::time::sleep(self.reconnect.backoff_for(attempt)).await;
        }
    }

    async fn stream_once(&self) -> Outcome {
        // Always the latest credential; it may have been refreshed since the last attempt
        let Some(credential) = self.credentials.current().await else {
            return Outcome::Rejected("no credential".to_string());
        };
        let request = authorize(
            self.client.get(&self.url).header(ACCEPT, "text/event-stream"),
            self.kind,
            &credential.credential,
        );

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Outcome::Dropped {
                    reason: e.to_string(),
                    was_connected: false,
                }
            }
        };

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            let body = response.text().await.unwrap_or_default();
            let reason = if body.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                body
            };
            return Outcome::Rejected(reason);
        }
        if !response.status().is_success() {
            return Outcome::Dropped {
                reason: format!("HTTP {}", status),
                was_connected: false,
            };
        }

        info!(conversation = %self.label, "Live channel open");
        if !self.emit(TransportEvent::Connected).await {
            return Outcome::ReceiverGone;
        }

        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    return Outcome::Dropped {
                        reason: e.to_string(),
                        was_connected: true,
                    }
                }
            };
            match decode_event(&event) {
                Ok(Some(event)) => {
                    if !self.emit(TransportEvent::Channel(event)).await {
                        return Outcome::ReceiverGone;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        conversation = %self.label,
                        event = %event.event,
                        error = %e,
                        "Skipping undecodable live event"
                    );
                }
            }
        }

        Outcome::Dropped {
            reason: "stream ended".to_string(),
            was_connected: true,
        }
    }
}
