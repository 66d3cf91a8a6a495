//! Timeline merge engine
//!
//! Owns the rendered message list of one conversation and is its only
//! writer. Two sources feed it: the baseline from the paginated history
//! call and batches pushed by the live channel. Local sends enter as
//! optimistic placeholders and are promoted when their echo shows up from
//! either source.
//!
//! Invariants kept after every operation:
//! - entries are ordered by `(timestamp, id)`, invalid timestamps last
//! - no two entries share an id
//! - at most one placeholder per pending send

use crate::chat::models::{DeliveryStatus, Message, OutgoingMessage, SenderRole};
use crate::chat::optimistic::{advance, EchoEvent, EchoTracker, PendingSend};
use crate::chat::timestamp::Timestamp;
use crate::error::SyncError;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Counts describing what a merge did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// New entries inserted
    pub admitted: usize,
    /// Placeholders replaced by their confirmed message
    pub promoted: usize,
    /// Dropped because the id is already present
    pub duplicates: usize,
    /// Dropped as already represented by the baseline
    pub stale: usize,
    /// Dropped because they belong to another conversation
    pub foreign: usize,
}

impl MergeOutcome {
    /// Whether the rendered list changed
    pub fn changed(&self) -> bool {
        self.admitted > 0 || self.promoted > 0
    }
}

/// Progress order of confirmed statuses; `Failed` never outranks anything
fn progress(status: DeliveryStatus) -> u8 {
    match status {
        DeliveryStatus::Failed => 0,
        DeliveryStatus::Sending => 1,
        DeliveryStatus::Sent => 2,
        DeliveryStatus::Delivered => 3,
        DeliveryStatus::Read => 4,
    }
}

fn furthest(a: Option<DeliveryStatus>, b: Option<DeliveryStatus>) -> Option<DeliveryStatus> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if progress(a) >= progress(b) { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Ordered, deduplicated message list for one conversation
#[derive(Debug, Clone)]
pub struct Timeline {
    conversation_id: String,
    self_id: String,
    coalescing_window_ms: i64,
    entries: Vec<Message>,
    echoes: EchoTracker,
    baseline_loaded: bool,
}

impl Timeline {
    /// Create an empty timeline
    pub fn new(
        conversation_id: impl Into<String>,
        self_id: impl Into<String>,
        coalescing_window_ms: i64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            self_id: self_id.into(),
            coalescing_window_ms,
            entries: Vec::new(),
            echoes: EchoTracker::new(),
            baseline_loaded: false,
        }
    }

    /// Conversation this timeline renders
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Rendered entries in display order
    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    /// Whether a history load has been applied
    pub fn baseline_loaded(&self) -> bool {
        self.baseline_loaded
    }

    /// Unresolved optimistic send, by temp id
    pub fn pending(&self, temp_id: &str) -> Option<&PendingSend> {
        self.echoes.get(temp_id)
    }

    /// Number of unresolved optimistic sends
    pub fn pending_count(&self) -> usize {
        self.echoes.len()
    }

    /// Latest valid timestamp currently rendered
    pub fn high_water_mark(&self) -> Option<i64> {
        self.entries
            .iter()
            .filter_map(|m| m.timestamp.millis())
            .max()
    }

    fn contains_id(&self, id: &str) -> bool {
        self.entries.iter().any(|m| m.id == id)
    }

    fn position_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.id == id)
    }

    fn is_foreign(&self, message: &Message) -> bool {
        !message.conversation_id.is_empty() && message.conversation_id != self.conversation_id
    }

    fn insert_sorted(&mut self, message: Message) {
        let idx = self
            .entries
            .partition_point(|e| e.order_key() <= message.order_key());
        self.entries.insert(idx, message);
    }

    /// Re-seat the entry at `idx` if its neighbours no longer bracket it
    fn reposition(&mut self, idx: usize) {
        let key_ok = {
            let entry = &self.entries[idx];
            let after_prev = idx == 0 || self.entries[idx - 1].order_key() <= entry.order_key();
            let before_next = idx + 1 >= self.entries.len()
                || entry.order_key() <= self.entries[idx + 1].order_key();
            after_prev && before_next
        };
        if !key_ok {
            let entry = self.entries.remove(idx);
            self.insert_sorted(entry);
        }
    }

    /// Confirmed entry from the same sender with the same content, near in time
    fn has_coalescing_twin(&self, incoming: &Message) -> bool {
        self.entries.iter().any(|existing| {
            !existing.is_placeholder()
                && existing.sender_id == incoming.sender_id
                && existing.content == incoming.content
                && existing
                    .timestamp
                    .within(&incoming.timestamp, self.coalescing_window_ms)
        })
    }

    /// Replace a placeholder by its confirmed message, keeping its slot
    fn promote(&mut self, temp_id: &str, mut confirmed: Message) {
        let held = self.echoes.resolve(temp_id).and_then(|p| p.receipt);
        let status = furthest(
            furthest(
                advance(DeliveryStatus::Sending, EchoEvent::Confirmed).ok(),
                confirmed.delivery_status,
            ),
            held,
        );
        confirmed.delivery_status = status;
        confirmed.temp_id = None;

        debug!(
            conversation_id = %self.conversation_id,
            temp_id = %temp_id,
            message_id = %confirmed.id,
            "Optimistic message confirmed"
        );

        match self.position_of(temp_id) {
            Some(idx) => {
                self.entries[idx] = confirmed;
                self.reposition(idx);
            }
            None => self.insert_sorted(confirmed),
        }
    }

    /// Apply a history load
    ///
    /// The baseline is authoritative for the messages it contains. Entries it
    /// does not mention (live arrivals, placeholders) are kept, and
    /// placeholders it confirms are promoted.
    pub fn apply_baseline(&mut self, baseline: Vec<Message>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let previous_ids: HashSet<String> = self
            .entries
            .iter()
            .filter(|m| !m.is_placeholder())
            .map(|m| m.id.clone())
            .collect();

        let mut seen = HashSet::new();
        let mut fresh: Vec<Message> = Vec::with_capacity(baseline.len() + self.entries.len());
        for mut message in baseline {
            if self.is_foreign(&message) {
                outcome.foreign += 1;
                continue;
            }
            if !seen.insert(message.id.clone()) {
                outcome.duplicates += 1;
                continue;
            }
            if !message.timestamp.is_valid() {
                warn!(
                    conversation_id = %self.conversation_id,
                    message_id = %message.id,
                    "History message has unparseable timestamp; rendering it last"
                );
            }
            if previous_ids.contains(&message.id) {
                if let Some(existing) = self.entries.iter().find(|e| e.id == message.id) {
                    message.delivery_status =
                        furthest(existing.delivery_status, message.delivery_status);
                }
            } else if let Some(temp_id) = self
                .echoes
                .find_match(&message, &self.self_id, self.coalescing_window_ms)
                .map(str::to_string)
            {
                let held = self.echoes.resolve(&temp_id).and_then(|p| p.receipt);
                message.delivery_status = furthest(
                    furthest(Some(DeliveryStatus::Sent), message.delivery_status),
                    held,
                );
                outcome.promoted += 1;
            } else {
                outcome.admitted += 1;
            }
            fresh.push(message);
        }

        for entry in self.entries.drain(..) {
            match &entry.temp_id {
                Some(temp_id) if self.echoes.get(temp_id).is_none() => {
                    // Promoted above
                }
                Some(_) => fresh.push(entry),
                None if seen.contains(&entry.id) => {}
                None => fresh.push(entry),
            }
        }

        fresh.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        self.entries = fresh;
        self.baseline_loaded = true;

        debug!(
            conversation_id = %self.conversation_id,
            total = self.entries.len(),
            admitted = outcome.admitted,
            promoted = outcome.promoted,
            duplicates = outcome.duplicates,
            "Applied history baseline"
        );
        outcome
    }

    /// Merge a batch of live messages
    ///
    /// Idempotent: merging the same batch again changes nothing.
    pub fn merge_live(&mut self, batch: Vec<Message>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        if batch.is_empty() {
            return outcome;
        }

        let high_water_mark = self.high_water_mark();
        if !self.entries.is_empty() && high_water_mark.is_none() {
            warn!(
                conversation_id = %self.conversation_id,
                batch = batch.len(),
                "Timeline has no valid timestamps; discarding live batch"
            );
            outcome.stale = batch.len();
            return outcome;
        }

        let mut batch = batch;
        batch.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        for incoming in batch {
            if self.is_foreign(&incoming) {
                outcome.foreign += 1;
                continue;
            }
            if self.contains_id(&incoming.id) {
                outcome.duplicates += 1;
                continue;
            }
            if let Some(temp_id) = self
                .echoes
                .find_match(&incoming, &self.self_id, self.coalescing_window_ms)
                .map(str::to_string)
            {
                self.promote(&temp_id, incoming);
                outcome.promoted += 1;
                continue;
            }
            if let (Some(mark), Some(ts)) = (high_water_mark, incoming.timestamp.millis()) {
                if ts < mark && self.has_coalescing_twin(&incoming) {
                    outcome.stale += 1;
                    continue;
                }
            }
            if !incoming.timestamp.is_valid() {
                warn!(
                    conversation_id = %self.conversation_id,
                    message_id = %incoming.id,
                    "Live message has unparseable timestamp; rendering it last"
                );
            }
            self.insert_sorted(incoming);
            outcome.admitted += 1;
        }

        if outcome.duplicates > 0 || outcome.stale > 0 || outcome.foreign > 0 {
            debug!(
                conversation_id = %self.conversation_id,
                admitted = outcome.admitted,
                promoted = outcome.promoted,
                duplicates = outcome.duplicates,
                stale = outcome.stale,
                foreign = outcome.foreign,
                "Filtered live batch"
            );
        }
        outcome
    }

    /// Insert the local echo for a new send and return its temp id
    pub fn begin_send(&mut self, draft: OutgoingMessage, now: Timestamp) -> String {
        let temp_id = self.echoes.begin(draft.clone(), now);
        let placeholder = Message {
            id: temp_id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.self_id.clone(),
            sender_role: SenderRole::User,
            content: draft.content,
            kind: draft.kind,
            attachments: draft.attachments,
            reply_to: draft.reply_to,
            timestamp: now,
            delivery_status: Some(DeliveryStatus::Sending),
            temp_id: Some(temp_id.clone()),
        };
        self.insert_sorted(placeholder);
        temp_id
    }

    /// Record a successful acknowledgement
    ///
    /// If the confirmed message is already rendered (its echo beat the ack
    /// or did not match by content), the placeholder is folded into it.
    pub fn record_ack(
        &mut self,
        temp_id: &str,
        server_id: Option<String>,
    ) -> Result<(), SyncError> {
        self.echoes.record_ack(temp_id, server_id.clone())?;
        let Some(server_id) = server_id else {
            return Ok(());
        };
        if !self.contains_id(&server_id) {
            return Ok(());
        }
        let held = self.echoes.resolve(temp_id).and_then(|p| p.receipt);
        self.entries.retain(|m| m.id != temp_id);
        if let Some(entry) = self.entries.iter_mut().find(|m| m.id == server_id) {
            entry.delivery_status = furthest(
                furthest(Some(DeliveryStatus::Sent), entry.delivery_status),
                held,
            );
        }
        Ok(())
    }

    fn set_placeholder_status(&mut self, temp_id: &str, status: DeliveryStatus) {
        if let Some(entry) = self.entries.iter_mut().find(|m| m.id == temp_id) {
            entry.delivery_status = Some(status);
        }
    }

    /// Mark a send as failed (non-authorization error)
    pub fn mark_failed(&mut self, temp_id: &str, reason: &str) -> Result<(), SyncError> {
        self.echoes.fail(temp_id, reason)?;
        let status = advance(DeliveryStatus::Sending, EchoEvent::Failed)?;
        self.set_placeholder_status(temp_id, status);
        Ok(())
    }

    /// Keep a send rejected for an expired credential until reconnect
    ///
    /// Returns `false` when the send already used its automatic retry and
    /// was failed instead.
    pub fn park_for_reconnect(&mut self, temp_id: &str, reason: &str) -> Result<bool, SyncError> {
        let parked = self.echoes.await_reconnect(temp_id, reason)?;
        if !parked {
            self.set_placeholder_status(temp_id, DeliveryStatus::Failed);
        }
        Ok(parked)
    }

    fn rekey(
        &mut self,
        temp_id: &str,
        now: Timestamp,
        automatic: bool,
    ) -> Result<(String, OutgoingMessage), SyncError> {
        let fresh = self.echoes.retry(temp_id, now, automatic)?;
        let draft = self
            .echoes
            .get(&fresh)
            .map(|p| p.draft.clone())
            .ok_or_else(|| SyncError::UnknownPlaceholder(fresh.clone()))?;
        if let Some(idx) = self.position_of(temp_id) {
            let entry = &mut self.entries[idx];
            entry.id = fresh.clone();
            entry.temp_id = Some(fresh.clone());
            entry.timestamp = now;
            entry.delivery_status = Some(DeliveryStatus::Sending);
            self.reposition(idx);
        }
        Ok((fresh, draft))
    }

    /// User-initiated resend of a failed message
    pub fn retry(
        &mut self,
        temp_id: &str,
        now: Timestamp,
    ) -> Result<(String, OutgoingMessage), SyncError> {
        let current = self
            .entries
            .iter()
            .find(|m| m.id == temp_id)
            .and_then(|m| m.delivery_status)
            .unwrap_or(DeliveryStatus::Failed);
        advance(current, EchoEvent::Retry)?;
        self.rekey(temp_id, now, false)
    }

    /// Re-key the one send that gets retried after a successful reconnect
    pub fn take_reconnect_retry(&mut self, now: Timestamp) -> Option<(String, OutgoingMessage)> {
        let temp_id = self.echoes.next_reconnect_retry()?.to_string();
        match self.rekey(&temp_id, now, true) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    temp_id = %temp_id,
                    error = %e,
                    "Could not re-key parked send"
                );
                None
            }
        }
    }

    /// Fail every send still parked for reconnect
    pub fn fail_parked(&mut self, reason: &str) -> usize {
        let failed = self.echoes.fail_awaiting(reason);
        for temp_id in &failed {
            self.set_placeholder_status(temp_id, DeliveryStatus::Failed);
        }
        failed.len()
    }

    /// Remove a failed placeholder at the user's request
    pub fn discard(&mut self, temp_id: &str) -> Result<(), SyncError> {
        let status = self
            .entries
            .iter()
            .find(|m| m.id == temp_id && m.is_placeholder())
            .and_then(|m| m.delivery_status)
            .ok_or_else(|| SyncError::UnknownPlaceholder(temp_id.to_string()))?;
        if status != DeliveryStatus::Failed {
            return Err(SyncError::InvalidTransition {
                from: status.to_string(),
                to: "discarded".to_string(),
            });
        }
        self.echoes.resolve(temp_id);
        self.entries.retain(|m| m.id != temp_id);
        Ok(())
    }

    /// Apply a delivered/read receipt to a confirmed local message
    ///
    /// Returns whether the entry changed or the receipt was held for an
    /// acknowledged send whose echo has not arrived. Receipts for unknown ids
    /// or for other people's messages are ignored.
    pub fn apply_receipt(
        &mut self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool, SyncError> {
        let event = match status {
            DeliveryStatus::Delivered => EchoEvent::Delivered,
            DeliveryStatus::Read => EchoEvent::Read,
            other => {
                return Err(SyncError::InvalidTransition {
                    from: "receipt".to_string(),
                    to: other.to_string(),
                })
            }
        };
        let self_id = self.self_id.clone();
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|m| m.id == message_id && !m.is_placeholder())
        else {
            return self.echoes.record_receipt(message_id, event);
        };
        if entry.sender_id != self_id {
            return Ok(false);
        }
        let current = entry.delivery_status.unwrap_or(DeliveryStatus::Sent);
        let next = advance(current, event)?;
        entry.delivery_status = Some(next);
        Ok(next != current)
    }
}
