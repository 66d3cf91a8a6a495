//! Marketplace Chat Sync
//!
//! Live chat synchronization core for the marketplace: history/live merge,
//! optimistic sends, per-conversation live sessions and credential
//! recovery. UI layers subscribe to `TimelineSnapshot`s and call into the
//! `ChannelSessionManager`.

pub mod chat;
pub mod config;
pub mod error;
/// Backend adapters (REST and SSE) and the traits they implement
pub mod transport;

pub use chat::{ChannelSessionManager, ConversationDirectory, TimelineSnapshot};
pub use config::Config;
pub use error::{SyncError, SyncResult};
