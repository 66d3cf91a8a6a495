//! Optimistic send tracking
//!
//! Every message the local user submits gets a placeholder with a temp id
//! before any network call. The tracker remembers what was sent so the
//! server echo (live or via history) can be recognized and the placeholder
//! promoted in place.
//!
//! Lifecycle: `sending -> {sent | failed}`, `sent -> delivered -> read`,
//! `failed -> sending` only through an explicit retry.

use crate::chat::models::{DeliveryStatus, Message, OutgoingMessage};
use crate::chat::timestamp::Timestamp;
use crate::error::SyncError;
use uuid::Uuid;

/// Prefix that keeps temp ids disjoint from server ids
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Inputs that move a message through its delivery lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoEvent {
    /// Server echo matched the placeholder
    Confirmed,
    /// Send acknowledgement reported an error
    Failed,
    /// Delivery receipt
    Delivered,
    /// Read receipt
    Read,
    /// User asked to resend a failed message
    Retry,
}

/// Apply an event to a delivery status
///
/// Receipts are monotonic: a late `delivered` after `read` leaves the status
/// at `read`. Duplicate confirmations are accepted as no-ops.
pub fn advance(from: DeliveryStatus, event: EchoEvent) -> Result<DeliveryStatus, SyncError> {
    use DeliveryStatus::*;

    let next = match (from, event) {
        (Sending, EchoEvent::Confirmed) => Sent,
        (Sending, EchoEvent::Failed) => Failed,
        (Sent | Delivered | Read, EchoEvent::Confirmed) => from,
        (Sent, EchoEvent::Delivered) => Delivered,
        (Sent | Delivered, EchoEvent::Read) => Read,
        (Delivered | Read, EchoEvent::Delivered) => from,
        (Read, EchoEvent::Read) => Read,
        (Failed, EchoEvent::Retry) => Sending,
        (Failed, EchoEvent::Failed) => Failed,
        (_, event) => {
            return Err(SyncError::InvalidTransition {
                from: from.to_string(),
                to: format!("{:?}", event).to_lowercase(),
            })
        }
    };
    Ok(next)
}

/// Where an unresolved send stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingPhase {
    /// Request in flight or acknowledged, echo not yet seen
    InFlight,
    /// Rejected for an expired credential; waiting for the reconnect controller
    AwaitingReconnect,
    /// Terminal until the user retries or discards
    Failed {
        /// Reason reported by the server or transport
        reason: String,
    },
}

/// One locally submitted message awaiting its server echo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    /// Current temp id (changes on retry)
    pub temp_id: String,
    /// What the user submitted
    pub draft: OutgoingMessage,
    /// Local time of the latest attempt
    pub attempted_at: Timestamp,
    /// Server id from a successful acknowledgement
    pub acked_id: Option<String>,
    /// Lifecycle phase
    pub phase: PendingPhase,
    /// Whether the one automatic post-reconnect retry has been spent
    pub auto_retried: bool,
    /// Furthest receipt reported for `acked_id` before the echo arrived
    pub receipt: Option<DeliveryStatus>,
}

impl PendingSend {
    fn matches(&self, message: &Message, self_id: &str, window_ms: i64) -> bool {
        if self.phase != PendingPhase::InFlight {
            return false;
        }
        if self.acked_id.as_deref() == Some(message.id.as_str()) {
            return true;
        }
        message.sender_id == self_id
            && message.content == self.draft.content
            && message.timestamp.within(&self.attempted_at, window_ms)
    }
}

/// Tracks unresolved optimistic sends for one conversation, oldest first
#[derive(Debug, Default, Clone)]
pub struct EchoTracker {
    pending: Vec<PendingSend>,
}

/// Generate a fresh temp id
pub fn new_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
}

impl EchoTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new send and return its temp id
    pub fn begin(&mut self, draft: OutgoingMessage, now: Timestamp) -> String {
        let temp_id = new_temp_id();
        self.pending.push(PendingSend {
            temp_id: temp_id.clone(),
            draft,
            attempted_at: now,
            acked_id: None,
            phase: PendingPhase::InFlight,
            auto_retried: false,
            receipt: None,
        });
        temp_id
    }

    /// Look up a pending send
    pub fn get(&self, temp_id: &str) -> Option<&PendingSend> {
        self.pending.iter().find(|p| p.temp_id == temp_id)
    }

    fn get_mut(&mut self, temp_id: &str) -> Result<&mut PendingSend, SyncError> {
        self.pending
            .iter_mut()
            .find(|p| p.temp_id == temp_id)
            .ok_or_else(|| SyncError::UnknownPlaceholder(temp_id.to_string()))
    }

    /// Number of unresolved sends
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remember the server id from a successful acknowledgement
    pub fn record_ack(
        &mut self,
        temp_id: &str,
        server_id: Option<String>,
    ) -> Result<(), SyncError> {
        let pending = self.get_mut(temp_id)?;
        if server_id.is_some() {
            pending.acked_id = server_id;
        }
        Ok(())
    }

    /// Hold a receipt for an acknowledged send whose echo is still missing
    ///
    /// Returns whether a pending send was acknowledged as `server_id`.
    pub fn record_receipt(&mut self, server_id: &str, event: EchoEvent) -> Result<bool, SyncError> {
        let Some(pending) = self
            .pending
            .iter_mut()
            .find(|p| p.acked_id.as_deref() == Some(server_id))
        else {
            return Ok(false);
        };
        let current = pending.receipt.unwrap_or(DeliveryStatus::Sent);
        pending.receipt = Some(advance(current, event)?);
        Ok(true)
    }

    /// Mark a send as failed
    pub fn fail(&mut self, temp_id: &str, reason: impl Into<String>) -> Result<(), SyncError> {
        let pending = self.get_mut(temp_id)?;
        pending.phase = PendingPhase::Failed {
            reason: reason.into(),
        };
        Ok(())
    }

    /// Park a send rejected for an expired credential
    ///
    /// Returns `false` (and fails the send) when its automatic retry has
    /// already been used.
    pub fn await_reconnect(&mut self, temp_id: &str, reason: &str) -> Result<bool, SyncError> {
        let pending = self.get_mut(temp_id)?;
        if pending.auto_retried {
            pending.phase = PendingPhase::Failed {
                reason: reason.to_string(),
            };
            return Ok(false);
        }
        pending.phase = PendingPhase::AwaitingReconnect;
        Ok(true)
    }

    /// Oldest in-flight send the message confirms
    pub fn find_match(&self, message: &Message, self_id: &str, window_ms: i64) -> Option<&str> {
        self.pending
            .iter()
            .find(|p| p.matches(message, self_id, window_ms))
            .map(|p| p.temp_id.as_str())
    }

    /// Remove a send once its placeholder has been promoted
    pub fn resolve(&mut self, temp_id: &str) -> Option<PendingSend> {
        let idx = self.pending.iter().position(|p| p.temp_id == temp_id)?;
        Some(self.pending.remove(idx))
    }

    /// Re-key a failed send for another attempt
    ///
    /// Returns the new temp id. `automatic` spends the post-reconnect retry.
    pub fn retry(
        &mut self,
        temp_id: &str,
        now: Timestamp,
        automatic: bool,
    ) -> Result<String, SyncError> {
        let pending = self.get_mut(temp_id)?;
        match pending.phase {
            PendingPhase::Failed { .. } | PendingPhase::AwaitingReconnect => {}
            PendingPhase::InFlight => {
                return Err(SyncError::InvalidTransition {
                    from: DeliveryStatus::Sending.to_string(),
                    to: DeliveryStatus::Sending.to_string(),
                })
            }
        }
        let fresh = new_temp_id();
        pending.temp_id = fresh.clone();
        pending.attempted_at = now;
        pending.acked_id = None;
        pending.receipt = None;
        pending.phase = PendingPhase::InFlight;
        if automatic {
            pending.auto_retried = true;
        }
        Ok(fresh)
    }

    /// Oldest send parked for reconnect that has not used its automatic retry
    pub fn next_reconnect_retry(&self) -> Option<&str> {
        self.pending
            .iter()
            .find(|p| p.phase == PendingPhase::AwaitingReconnect && !p.auto_retried)
            .map(|p| p.temp_id.as_str())
    }

    /// Fail every send still parked for reconnect; returns their temp ids
    pub fn fail_awaiting(&mut self, reason: &str) -> Vec<String> {
        self.pending
            .iter_mut()
            .filter(|p| p.phase == PendingPhase::AwaitingReconnect)
            .map(|p| {
                p.phase = PendingPhase::Failed {
                    reason: reason.to_string(),
                };
                p.temp_id.clone()
            })
            .collect()
    }
}
