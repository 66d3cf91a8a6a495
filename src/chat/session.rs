//! Channel Session
//!
//! One live subscription to one conversation. The session owns the task that
//! pumps transport events into the manager and the transport's own feeding
//! task, and tears both down when it is closed or dropped.

use crate::chat::models::{ConversationRef, ConversationStatus, Message};
use crate::transport::TransportEvent;
use serde::Serialize;
use std::fmt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Identity stamped on every async completion
///
/// `selection` changes each time a conversation is selected, `session` each
/// time a live channel is opened (selection or reconnect). Timeline writes
/// check the selection; live events check the exact session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTag {
    /// Conversation the work belongs to
    pub conversation: ConversationRef,
    /// Selection generation
    pub selection: u64,
    /// Live channel generation
    pub session: u64,
}

impl SessionTag {
    /// Whether both tags come from the same selection of the same conversation
    pub fn same_selection(&self, other: &SessionTag) -> bool {
        self.conversation == other.conversation && self.selection == other.selection
    }

    /// Tag for a new channel within the same selection
    pub fn reopened(&self, session: u64) -> SessionTag {
        SessionTag {
            conversation: self.conversation.clone(),
            selection: self.selection,
            session,
        }
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.conversation, self.selection, self.session)
    }
}

/// Live channel state as shown to the UI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Nothing selected
    #[default]
    Idle,
    /// Opening or retrying the channel
    Connecting,
    /// Live updates flowing
    Connected,
    /// Channel down; history stays rendered and sends still go over HTTP
    Degraded,
    /// Session ended (deselected or expired)
    Closed,
}

impl ConnectionState {
    /// Whether a channel for the conversation is open or being opened
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// State after a transport lifecycle event; payload events keep the state
    pub fn after(self, event: &TransportEvent) -> ConnectionState {
        match event {
            TransportEvent::Connected => ConnectionState::Connected,
            TransportEvent::Reconnecting { .. } => ConnectionState::Connecting,
            TransportEvent::Disconnected { .. }
            | TransportEvent::AuthRejected { .. }
            | TransportEvent::Exhausted => ConnectionState::Degraded,
            TransportEvent::Channel(_) => self,
        }
    }
}

/// Immutable view of the active conversation published to subscribers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineSnapshot {
    /// Selected conversation
    pub conversation: Option<ConversationRef>,
    /// Rendered messages in timeline order
    pub messages: Vec<Message>,
    /// Live channel state
    pub connection: ConnectionState,
    /// Latest status pushed by the server
    pub status: Option<ConversationStatus>,
    /// Credential refresh failed; the user must sign in again
    pub session_expired: bool,
}

/// Handle to the tasks backing one live channel
pub struct ChannelSession {
    tag: SessionTag,
    pump: Option<JoinHandle<()>>,
    feeder: Option<JoinHandle<()>>,
}

impl ChannelSession {
    /// Create a session with no tasks attached yet
    pub fn new(tag: SessionTag) -> Self {
        Self {
            tag,
            pump: None,
            feeder: None,
        }
    }

    /// Tag this session was created with
    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    /// Attach the event pump and the transport task
    pub fn attach(&mut self, pump: JoinHandle<()>, feeder: Option<JoinHandle<()>>) {
        debug!(session = %self.tag, "Live channel attached");
        self.abort_tasks();
        self.pump = Some(pump);
        self.feeder = feeder;
    }

    /// Whether the pump is attached and still running
    pub fn is_running(&self) -> bool {
        self.pump.as_ref().is_some_and(|pump| !pump.is_finished())
    }

    /// Tear down the channel
    pub fn close(&mut self) {
        if self.pump.is_some() || self.feeder.is_some() {
            info!(session = %self.tag, "Closing live channel");
        }
        self.abort_tasks();
    }

    fn abort_tasks(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        // Can't await in Drop; abort is synchronous
        self.abort_tasks();
    }
}
