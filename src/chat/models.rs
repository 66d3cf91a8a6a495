//! Chat data models
//!
//! Canonical message and conversation types, plus the loosely-typed wire
//! forms they are decoded from.

use crate::chat::timestamp::{normalize, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The three conversation families served by the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Buyer or seller talking to marketplace support
    Support,
    /// Direct chat between two users
    Peer,
    /// Group chat attached to a collaboration project
    Project,
}

/// How a conversation kind's endpoints expect the credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthShape {
    /// `Authorization: Bearer <token>` header
    Bearer,
    /// `?token=<token>` query parameter (used by the support widget)
    QueryToken,
}

/// Endpoint parameters for one conversation kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationDescriptor {
    /// Path segment the kind's endpoints live under
    pub namespace: &'static str,
    /// Credential placement
    pub auth: AuthShape,
}

impl ConversationKind {
    /// All kinds, in directory order
    pub const ALL: [ConversationKind; 3] = [
        ConversationKind::Support,
        ConversationKind::Peer,
        ConversationKind::Project,
    ];

    /// Endpoint namespace and auth shape for this kind
    pub fn descriptor(&self) -> ConversationDescriptor {
        match self {
            ConversationKind::Support => ConversationDescriptor {
                namespace: "support",
                auth: AuthShape::QueryToken,
            },
            ConversationKind::Peer => ConversationDescriptor {
                namespace: "p2p",
                auth: AuthShape::Bearer,
            },
            ConversationKind::Project => ConversationDescriptor {
                namespace: "projects",
                auth: AuthShape::Bearer,
            },
        }
    }

    /// Convert the kind to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Support => "support",
            ConversationKind::Peer => "peer",
            ConversationKind::Project => "project",
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "support" => Ok(ConversationKind::Support),
            "peer" | "p2p" => Ok(ConversationKind::Peer),
            "project" | "projects" => Ok(ConversationKind::Project),
            other => Err(format!("unknown conversation kind: {}", other)),
        }
    }
}

/// A conversation identified by kind and server id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationRef {
    /// Conversation family
    pub kind: ConversationKind,
    /// Server-side conversation id
    pub id: String,
}

impl ConversationRef {
    /// Create a new conversation reference
    pub fn new(kind: ConversationKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    /// Marketplace user (buyer, seller or collaborator)
    User,
    /// Support staff
    Support,
    /// Administrator
    Admin,
    /// Server-generated notice
    System,
    /// Role not recognized by this client
    #[serde(other)]
    Unknown,
}

/// Content kind of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// File or image attachment message
    File,
    /// System notice
    System,
    /// Plain text (also the fallback for unrecognized kinds)
    #[serde(other)]
    Text,
}

/// Delivery lifecycle of a locally authored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Placeholder shown, send in flight
    Sending,
    /// Confirmed by the server
    Sent,
    /// Reached the other participant
    Delivered,
    /// Seen by the other participant
    Read,
    /// Send failed; retained for retry or removal
    Failed,
}

impl DeliveryStatus {
    /// Convert the status to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server id, or the temp id while this is an unresolved placeholder
    pub id: String,
    /// Conversation this message belongs to
    pub conversation_id: String,
    /// Author id (user id or wallet address)
    pub sender_id: String,
    /// Author role
    pub sender_role: SenderRole,
    /// Message body
    pub content: String,
    /// Content kind
    pub kind: MessageKind,
    /// Attachment URIs, in order
    pub attachments: Vec<String>,
    /// Id of the message this one replies to
    pub reply_to: Option<String>,
    /// Canonical epoch-ms time
    pub timestamp: Timestamp,
    /// Delivery status (local author only)
    pub delivery_status: Option<DeliveryStatus>,
    /// Local temp id, present only on an unresolved optimistic placeholder
    pub temp_id: Option<String>,
}

impl Message {
    /// Whether this entry is an optimistic placeholder awaiting confirmation
    pub fn is_placeholder(&self) -> bool {
        self.temp_id.is_some()
    }

    /// Sort key: timestamp ascending (invalid last), id as tie-break
    pub fn order_key(&self) -> (Timestamp, &str) {
        (self.timestamp, self.id.as_str())
    }
}

/// Message payload submitted by the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Message body
    pub content: String,
    /// Content kind
    pub kind: MessageKind,
    /// Attachment URIs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Id of the message being replied to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl OutgoingMessage {
    /// Plain text message
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Text,
            attachments: Vec::new(),
            reply_to: None,
        }
    }

    /// Attach file URIs; the kind becomes `file`
    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        if !attachments.is_empty() {
            self.kind = MessageKind::File;
        }
        self.attachments = attachments;
        self
    }

    /// Mark this message as a reply
    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// Acknowledgement returned by the send operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    /// Whether the server accepted the message
    #[serde(default, alias = "success")]
    pub ok: bool,
    /// Server id assigned to the message
    #[serde(default, alias = "messageId")]
    pub id: Option<String>,
    /// Failure reason
    #[serde(default, alias = "message")]
    pub error: Option<String>,
}

/// Open/resolved state of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    /// Accepting messages
    Open,
    /// Closed by support or the owner
    #[serde(alias = "closed")]
    Resolved,
}

/// Conversation-level metadata pushed on the live channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStatus {
    /// Open/resolved state
    #[serde(alias = "status")]
    pub state: ConversationState,
    /// Unread messages for the local user
    #[serde(default, alias = "unread", alias = "unread_count")]
    pub unread_count: u32,
}

/// Message as received from history or the live channel
///
/// Servers disagree on field names and value types, so everything is
/// optional and loosely typed until `into_message` normalizes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    /// Server id (string or number)
    #[serde(default, alias = "_id")]
    pub id: Option<Value>,
    /// Conversation id
    #[serde(default, alias = "conversation_id", alias = "chatId")]
    pub conversation_id: Option<String>,
    /// Author id (string or number)
    #[serde(default, alias = "sender_id", alias = "sender")]
    pub sender_id: Option<Value>,
    /// Author role
    #[serde(default, alias = "sender_role", alias = "role")]
    pub sender_role: Option<SenderRole>,
    /// Message body
    #[serde(default, alias = "message")]
    pub content: Option<String>,
    /// Content kind
    #[serde(default, alias = "type")]
    pub kind: Option<MessageKind>,
    /// Attachment URIs or `{ "url": ... }` objects
    #[serde(default)]
    pub attachments: Vec<Value>,
    /// Replied-to message id
    #[serde(default, alias = "reply_to")]
    pub reply_to: Option<Value>,
    /// Primary time field
    #[serde(default, alias = "ts")]
    pub timestamp: Option<Value>,
    /// Fallback time field
    #[serde(default, alias = "created_at", alias = "sentAt")]
    pub created_at: Option<Value>,
}

impl RawMessage {
    /// Normalize into a canonical message
    ///
    /// `conversation_id` is used when the payload omits it. Messages from
    /// `self_id` get a `sent` delivery status.
    pub fn into_message(self, conversation_id: &str, self_id: &str) -> Message {
        let timestamp = normalize(
            self.timestamp.as_ref().unwrap_or(&Value::Null),
            self.created_at.as_ref(),
        );
        let sender_id = self
            .sender_id
            .as_ref()
            .and_then(value_to_id)
            .unwrap_or_default();
        let content = self.content.unwrap_or_default();
        let id = self
            .id
            .as_ref()
            .and_then(value_to_id)
            .unwrap_or_else(|| {
                synthetic_id(
                    &sender_id,
                    &content,
                    self.timestamp.as_ref().or(self.created_at.as_ref()),
                )
            });
        let delivery_status = (!self_id.is_empty() && sender_id == self_id)
            .then_some(DeliveryStatus::Sent);

        Message {
            id,
            conversation_id: self
                .conversation_id
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| conversation_id.to_string()),
            sender_id,
            sender_role: self.sender_role.unwrap_or(SenderRole::User),
            content,
            kind: self.kind.unwrap_or(MessageKind::Text),
            attachments: self.attachments.iter().filter_map(attachment_uri).collect(),
            reply_to: self.reply_to.as_ref().and_then(value_to_id),
            timestamp,
            delivery_status,
            temp_id: None,
        }
    }
}

/// Conversation listing entry as returned by the directory endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConversationSummary {
    /// Conversation id (string or number)
    #[serde(default, alias = "_id")]
    pub id: Option<Value>,
    /// Display title (counterpart name, project name or ticket subject)
    #[serde(default, alias = "name", alias = "subject")]
    pub title: Option<String>,
    /// Preview of the latest message
    #[serde(default, alias = "last_message")]
    pub last_message: Option<String>,
    /// Time of the latest activity
    #[serde(default, alias = "last_message_at", alias = "updatedAt")]
    pub last_message_at: Option<Value>,
    /// Unread counter
    #[serde(default, alias = "unread", alias = "unread_count")]
    pub unread_count: u32,
    /// Open/resolved state, when the kind has one
    #[serde(default, alias = "status")]
    pub state: Option<ConversationState>,
}

/// Render a string or numeric JSON id as a string
pub(crate) fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn attachment_uri(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ["url", "uri", "href"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// Deterministic id for payloads that arrive without one
fn synthetic_id(sender_id: &str, content: &str, raw_time: Option<&Value>) -> String {
    let mut hasher = DefaultHasher::new();
    sender_id.hash(&mut hasher);
    content.hash(&mut hasher);
    raw_time.map(Value::to_string).hash(&mut hasher);
    format!("syn-{:016x}", hasher.finish())
}
