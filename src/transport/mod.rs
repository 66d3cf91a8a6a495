//! Transport seams
//!
//! The sync core talks to the backend through three traits: request/response
//! calls (`ChatApi`), the live push channel (`LiveTransport`) and credential
//! refresh (`CredentialRefresher`). The HTTP and SSE adapters live in the
//! submodules; tests plug in in-memory fakes.

pub mod http;
pub mod sse;

use crate::chat::credentials::{Credential, CredentialStore};
use crate::chat::models::{
    ConversationKind, ConversationRef, ConversationStatus, DeliveryStatus, OutgoingMessage,
    RawConversationSummary, RawMessage, SendAck,
};
use crate::error::SyncResult;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use http::{HttpChatApi, HttpCredentialRefresher};
pub use sse::SseTransport;

/// Request/response operations against the chat backend
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Fetch the complete message history of a conversation
    async fn get_messages(
        &self,
        conversation: &ConversationRef,
        credential: &Credential,
    ) -> SyncResult<Vec<RawMessage>>;

    /// Send one message
    ///
    /// A rejected send may come back either as `Ok` with `ok == false` or as
    /// an error, depending on the backend.
    async fn send(
        &self,
        conversation: &ConversationRef,
        credential: &Credential,
        draft: &OutgoingMessage,
    ) -> SyncResult<SendAck>;

    /// Mark the conversation as read for the local user
    async fn mark_read(
        &self,
        conversation: &ConversationRef,
        credential: &Credential,
    ) -> SyncResult<()>;

    /// List the local user's conversations of one kind
    async fn list_conversations(
        &self,
        kind: ConversationKind,
        credential: &Credential,
    ) -> SyncResult<Vec<RawConversationSummary>>;
}

/// Exchanges an expired credential for a fresh one
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Obtain a fresh credential
    async fn refresh(&self, current: Option<&Credential>) -> SyncResult<Credential>;
}

/// Opens live push channels
///
/// Implementations own retry with bounded backoff and report their progress
/// as `TransportEvent`s. They read the credential from the store on every
/// (re)connect attempt.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Start a subscription to one conversation's channel
    async fn subscribe(
        &self,
        conversation: &ConversationRef,
        credentials: &CredentialStore,
    ) -> SyncResult<LiveSubscription>;
}

/// Payload pushed by the server on a conversation channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Batch of history, sent on join
    History(Vec<RawMessage>),
    /// A single new message
    Message(RawMessage),
    /// Conversation status change
    Status(ConversationStatus),
    /// Delivered/read receipt for a message
    Receipt {
        /// Confirmed message id
        message_id: String,
        /// `delivered` or `read`
        status: DeliveryStatus,
    },
}

/// Everything a live subscription can report
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Channel is (re)established
    Connected,
    /// Retrying after a drop
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Channel dropped; the transport will retry on its own
    Disconnected {
        /// Cause reported by the transport
        reason: String,
    },
    /// Server refused the credential; the transport stopped
    AuthRejected {
        /// Cause reported by the server
        reason: String,
    },
    /// Retry budget spent; the transport stopped
    Exhausted,
    /// Server payload
    Channel(ChannelEvent),
}

/// Receiving side of a live subscription
#[derive(Debug)]
pub struct LiveSubscription {
    events: mpsc::Receiver<TransportEvent>,
    task: Option<JoinHandle<()>>,
}

impl LiveSubscription {
    /// Wrap a receiver and the task feeding it
    pub fn new(events: mpsc::Receiver<TransportEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { events, task }
    }

    /// Split into the event receiver and the feeding task
    pub fn into_parts(self) -> (mpsc::Receiver<TransportEvent>, Option<JoinHandle<()>>) {
        (self.events, self.task)
    }

    /// Stop the feeding task and drop the receiver
    pub fn cancel(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}
