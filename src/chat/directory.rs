//! Conversation directory
//!
//! Lists the user's conversations across every kind, newest activity first.
//! Selecting an entry is the session manager's job; the directory only
//! keeps the sidebar data current.

use crate::chat::credentials::CredentialStore;
use crate::chat::models::{
    value_to_id, ConversationKind, ConversationRef, ConversationState, ConversationStatus,
    RawConversationSummary,
};
use crate::chat::timestamp::{normalize, Timestamp};
use crate::error::{SyncError, SyncResult};
use crate::transport::ChatApi;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// One row of the conversation list
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Kind and id
    pub conversation: ConversationRef,
    /// Display title
    pub title: String,
    /// Preview of the latest message
    pub last_message: Option<String>,
    /// Time of the latest activity
    pub last_activity: Timestamp,
    /// Unread messages for the local user
    pub unread_count: u32,
    /// Open/resolved state, when the kind has one
    pub state: Option<ConversationState>,
}

impl ConversationSummary {
    /// Normalize a listing entry; entries without an id are dropped
    pub fn from_raw(kind: ConversationKind, raw: RawConversationSummary) -> Option<Self> {
        let id = raw.id.as_ref().and_then(value_to_id)?;
        let last_activity = normalize(raw.last_message_at.as_ref().unwrap_or(&Value::Null), None);
        Some(Self {
            title: raw
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("{} {}", kind.as_str(), id)),
            conversation: ConversationRef::new(kind, id),
            last_message: raw.last_message,
            last_activity,
            unread_count: raw.unread_count,
            state: raw.state,
        })
    }
}

/// Conversation list for the signed-in user
pub struct ConversationDirectory {
    api: Arc<dyn ChatApi>,
    credentials: CredentialStore,
    entries: Vec<ConversationSummary>,
}

impl ConversationDirectory {
    /// Create an empty directory
    pub fn new(api: Arc<dyn ChatApi>, credentials: CredentialStore) -> Self {
        Self {
            api,
            credentials,
            entries: Vec::new(),
        }
    }

    /// Current entries, newest activity first
    pub fn entries(&self) -> &[ConversationSummary] {
        &self.entries
    }

    /// Reload every kind
    ///
    /// A kind whose listing fails keeps its previous entries, so one broken
    /// endpoint does not empty the sidebar.
    ///
    /// # Returns
    /// * `Ok(usize)` - Number of kinds that refreshed successfully
    /// * `Err(SyncError::SessionExpired)` - No credential is available
    pub async fn refresh(&mut self) -> SyncResult<usize> {
        let credential = self
            .credentials
            .current()
            .await
            .ok_or(SyncError::SessionExpired)?;

        let mut refreshed = 0;
        for kind in ConversationKind::ALL {
            match self.api.list_conversations(kind, &credential.credential).await {
                Ok(raw) => {
                    let fresh: Vec<ConversationSummary> = raw
                        .into_iter()
                        .filter_map(|entry| ConversationSummary::from_raw(kind, entry))
                        .collect();
                    debug!(kind = %kind.as_str(), count = fresh.len(), "Conversations listed");
                    self.entries.retain(|e| e.conversation.kind != kind);
                    self.entries.extend(fresh);
                    refreshed += 1;
                }
                Err(e) => {
                    warn!(
                        kind = %kind.as_str(),
                        error = %e,
                        "Conversation listing failed; keeping previous entries"
                    );
                }
            }
        }

        self.sort();
        Ok(refreshed)
    }

    /// Apply a status pushed for one conversation
    ///
    /// Returns whether an entry was updated.
    pub fn apply_status(
        &mut self,
        conversation: &ConversationRef,
        status: &ConversationStatus,
    ) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.conversation == *conversation)
        {
            Some(entry) => {
                entry.state = Some(status.state);
                entry.unread_count = status.unread_count;
                true
            }
            None => false,
        }
    }

    /// Sum of unread counters across all entries
    pub fn total_unread(&self) -> u32 {
        self.entries.iter().map(|e| e.unread_count).sum()
    }

    fn sort(&mut self) {
        // Newest first; entries without a valid time go last
        self.entries.sort_by(|a, b| match (a.last_activity, b.last_activity) {
            (Timestamp::At(x), Timestamp::At(y)) => y.cmp(&x),
            (x, y) => x.cmp(&y),
        });
    }
}
