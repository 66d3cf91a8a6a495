//! Chat module
//!
//! Conversation timelines, optimistic sends, live sessions and the
//! conversation directory.

pub mod credentials;
pub mod directory;
pub mod models;
pub mod optimistic;
pub mod reconnect;
pub mod session;
pub mod session_manager;
pub mod timeline;
pub mod timestamp;

pub use credentials::{Credential, CredentialStore};
pub use directory::{ConversationDirectory, ConversationSummary};
pub use models::{
    ConversationKind, ConversationRef, ConversationState, ConversationStatus, DeliveryStatus,
    Message, OutgoingMessage,
};
pub use reconnect::{ReconnectController, RefreshOutcome};
pub use session::{ConnectionState, SessionTag, TimelineSnapshot};
pub use session_manager::{ChannelSessionManager, EventDisposition};
pub use timeline::{MergeOutcome, Timeline};
pub use timestamp::Timestamp;
