//! Channel Session Manager
//!
//! Owns the single active conversation: its timeline, its live channel and
//! the sends in flight for it. Every async completion (history load, send
//! acknowledgement, live event, credential refresh) carries the
//! `SessionTag` it was started under and is dropped when that tag no
//! longer matches, so a slow response for a conversation the user already
//! left can never leak into the one on screen.
//!
//! The state lock is never held across a network call.

use crate::chat::credentials::CredentialStore;
use crate::chat::models::{
    ConversationRef, ConversationStatus, Message, OutgoingMessage, RawMessage, SendAck,
};
use crate::chat::reconnect::{ReconnectController, RefreshOutcome};
use crate::chat::session::{ChannelSession, ConnectionState, SessionTag, TimelineSnapshot};
use crate::chat::timeline::Timeline;
use crate::chat::timestamp::Timestamp;
use crate::config::Config;
use crate::error::{is_authorization_reason, SyncError, SyncResult};
use crate::transport::{
    ChannelEvent, ChatApi, CredentialRefresher, LiveSubscription, LiveTransport, TransportEvent,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// What happened to an event handed to the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// The event belonged to the active session and was applied
    Applied,
    /// The event came from a superseded session and was discarded
    Stale,
}

/// Request to refresh the credential after a rejection
#[derive(Debug)]
struct RecoveryRequest {
    tag: SessionTag,
    failed_version: u64,
}

/// State of the selected conversation
struct ActiveConversation {
    tag: SessionTag,
    connection: ConnectionState,
    timeline: Timeline,
    session: ChannelSession,
    status: Option<ConversationStatus>,
    session_expired: bool,
    mark_read_sent: bool,
    /// Credential version the current channel was opened with
    opened_with: u64,
    /// Credential version a recovery already produced for this selection
    recovered_with: Option<u64>,
}

impl ActiveConversation {
    fn new(tag: SessionTag, timeline: Timeline) -> Self {
        Self {
            session: ChannelSession::new(tag.clone()),
            tag,
            connection: ConnectionState::Connecting,
            timeline,
            status: None,
            session_expired: false,
            mark_read_sent: false,
            opened_with: 0,
            recovered_with: None,
        }
    }

    fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            conversation: Some(self.tag.conversation.clone()),
            messages: self.timeline.messages().to_vec(),
            connection: self.connection,
            status: self.status.clone(),
            session_expired: self.session_expired,
        }
    }

    fn normalize(&self, raw: Vec<RawMessage>, self_id: &str) -> Vec<Message> {
        raw.into_iter()
            .map(|m| m.into_message(&self.tag.conversation.id, self_id))
            .collect()
    }
}

struct ManagerInner {
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn LiveTransport>,
    reconnect: ReconnectController,
    self_id: String,
    coalescing_window_ms: i64,
    generation: AtomicU64,
    active: RwLock<Option<ActiveConversation>>,
    updates: watch::Sender<TimelineSnapshot>,
    recovery: mpsc::UnboundedSender<RecoveryRequest>,
}

/// Manages the live session of the selected conversation
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct ChannelSessionManager {
    inner: Arc<ManagerInner>,
}

impl ChannelSessionManager {
    /// Create a manager
    ///
    /// # Arguments
    /// * `api` - Request/response backend calls
    /// * `transport` - Live channel factory
    /// * `refresher` - Credential refresh call
    /// * `credentials` - Shared credential slot (also written by the login flow)
    /// * `self_id` - Id of the signed-in user
    /// * `config` - Sync configuration
    ///
    /// Must be called inside a tokio runtime: the credential recovery worker
    /// is spawned here.
    pub fn new(
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn LiveTransport>,
        refresher: Arc<dyn CredentialRefresher>,
        credentials: CredentialStore,
        self_id: impl Into<String>,
        config: &Config,
    ) -> Self {
        let (updates, _) = watch::channel(TimelineSnapshot::default());
        let (recovery, requests) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            api,
            transport,
            reconnect: ReconnectController::new(refresher, credentials),
            self_id: self_id.into(),
            coalescing_window_ms: config.merge.coalescing_window_ms,
            generation: AtomicU64::new(0),
            active: RwLock::new(None),
            updates,
            recovery,
        });
        tokio::spawn(recovery_worker(Arc::downgrade(&inner), requests));
        Self { inner }
    }

    /// Select a conversation
    ///
    /// Closes the previous session, renders an empty timeline immediately,
    /// then loads history and opens the live channel concurrently. Selecting
    /// the conversation that is already active does nothing.
    ///
    /// # Returns
    /// * `Err(SyncError::SessionExpired)` - No credential is available
    /// * `Ok(())` - Otherwise; history and channel failures degrade the
    ///   session instead of failing the call
    pub async fn select(&self, conversation: ConversationRef) -> SyncResult<()> {
        let tag = {
            let mut active = self.inner.active.write().await;
            if let Some(current) = active.as_ref() {
                let channel_alive = current.connection.is_live()
                    || (current.connection == ConnectionState::Degraded
                        && current.session.is_running());
                if current.tag.conversation == conversation && channel_alive {
                    debug!(
                        conversation = %conversation,
                        "Conversation already active; keeping session"
                    );
                    return Ok(());
                }
            }

            if let Some(mut previous) = active.take() {
                previous.session.close();
                info!(
                    conversation = %previous.tag.conversation,
                    "Conversation deselected"
                );
            }

            let generation = self.inner.next_generation();
            let tag = SessionTag {
                conversation: conversation.clone(),
                selection: generation,
                session: generation,
            };
            let timeline = Timeline::new(
                conversation.id.clone(),
                self.inner.self_id.clone(),
                self.inner.coalescing_window_ms,
            );
            let fresh = ActiveConversation::new(tag.clone(), timeline);
            self.inner.updates.send_replace(fresh.snapshot());
            *active = Some(fresh);
            tag
        };

        info!(conversation = %conversation, session = %tag, "Conversation selected");
        self.inner.open(tag).await
    }

    /// Send a message in the active conversation
    ///
    /// The local echo is rendered before this returns; delivery continues in
    /// the background.
    ///
    /// # Returns
    /// * `Result<String, SyncError>` - Temp id of the placeholder
    pub async fn send(&self, draft: OutgoingMessage) -> SyncResult<String> {
        let (tag, temp_id) = {
            let mut active = self.inner.active.write().await;
            let conv = active.as_mut().ok_or(SyncError::NoActiveConversation)?;
            if conv.session_expired {
                return Err(SyncError::SessionExpired);
            }
            let temp_id = conv.timeline.begin_send(draft.clone(), Timestamp::now());
            self.inner.after_mutation(conv);
            (conv.tag.clone(), temp_id)
        };

        debug!(session = %tag, temp_id = %temp_id, "Optimistic message rendered");
        self.inner.spawn_dispatch(tag, temp_id.clone(), draft);
        Ok(temp_id)
    }

    /// Resend a failed message; returns the new temp id
    pub async fn retry(&self, temp_id: &str) -> SyncResult<String> {
        let (tag, fresh, draft) = {
            let mut active = self.inner.active.write().await;
            let conv = active.as_mut().ok_or(SyncError::NoActiveConversation)?;
            if conv.session_expired {
                return Err(SyncError::SessionExpired);
            }
            let (fresh, draft) = conv.timeline.retry(temp_id, Timestamp::now())?;
            self.inner.after_mutation(conv);
            (conv.tag.clone(), fresh, draft)
        };

        info!(session = %tag, temp_id = %fresh, "Retrying failed message");
        self.inner.spawn_dispatch(tag, fresh.clone(), draft);
        Ok(fresh)
    }

    /// Remove a failed placeholder
    pub async fn discard(&self, temp_id: &str) -> SyncResult<()> {
        let mut active = self.inner.active.write().await;
        let conv = active.as_mut().ok_or(SyncError::NoActiveConversation)?;
        conv.timeline.discard(temp_id)?;
        self.inner.after_mutation(conv);
        Ok(())
    }

    /// Close the active session (conversation deselected or view torn down)
    pub async fn close(&self) {
        let mut active = self.inner.active.write().await;
        if let Some(mut previous) = active.take() {
            previous.session.close();
            info!(conversation = %previous.tag.conversation, "Session closed");
        }
        self.inner.updates.send_replace(TimelineSnapshot::default());
    }

    /// Hand a transport event to the manager as if it came from `tag`'s channel
    ///
    /// The event pump uses this; it is public so embedders driving their own
    /// transport loop get the same stale-session filtering.
    pub async fn deliver(&self, tag: &SessionTag, event: TransportEvent) -> EventDisposition {
        self.inner.handle_event(tag, event).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> TimelineSnapshot {
        self.inner.updates.borrow().clone()
    }

    /// Receive a snapshot after every change
    pub fn subscribe(&self) -> watch::Receiver<TimelineSnapshot> {
        self.inner.updates.subscribe()
    }

    /// Tag of the active session
    pub async fn active_tag(&self) -> Option<SessionTag> {
        let active = self.inner.active.read().await;
        active.as_ref().map(|conv| conv.tag.clone())
    }

    /// Shared credential store (for the login flow)
    pub fn credentials(&self) -> &CredentialStore {
        self.inner.reconnect.store()
    }
}

impl ManagerInner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn credentials(&self) -> &CredentialStore {
        self.reconnect.store()
    }

    /// Publish the new state and fire the one-time read receipt
    fn after_mutation(self: &Arc<Self>, conv: &mut ActiveConversation) {
        self.updates.send_replace(conv.snapshot());
        if !conv.mark_read_sent
            && !conv.session_expired
            && conv.timeline.baseline_loaded()
            && !conv.timeline.messages().is_empty()
        {
            conv.mark_read_sent = true;
            self.spawn_mark_read(conv.tag.clone());
        }
    }

    fn request_recovery(&self, tag: SessionTag, failed_version: u64) {
        if self
            .recovery
            .send(RecoveryRequest {
                tag,
                failed_version,
            })
            .is_err()
        {
            debug!("Recovery worker stopped; ignoring request");
        }
    }

    /// Load history and open the live channel for `tag`
    async fn open(self: &Arc<Self>, tag: SessionTag) -> SyncResult<()> {
        let Some(credential) = self.credentials().current().await else {
            warn!(session = %tag, "No credential available");
            self.expire(&tag).await;
            return Err(SyncError::SessionExpired);
        };

        {
            let mut active = self.active.write().await;
            match active.as_mut().filter(|conv| conv.tag == tag) {
                Some(conv) => conv.opened_with = credential.version,
                None => return Ok(()),
            }
        }

        let (history, subscription) = tokio::join!(
            self.api.get_messages(&tag.conversation, &credential.credential),
            self.transport.subscribe(&tag.conversation, self.credentials()),
        );

        self.apply_history(&tag, history, credential.version).await;
        self.attach(&tag, subscription, credential.version).await;
        Ok(())
    }

    async fn apply_history(
        self: &Arc<Self>,
        tag: &SessionTag,
        history: SyncResult<Vec<RawMessage>>,
        version: u64,
    ) {
        match history {
            Ok(raw) => {
                let mut active = self.active.write().await;
                let Some(conv) = active.as_mut().filter(|conv| conv.tag.same_selection(tag)) else {
                    debug!(
                        session = %tag,
                        "Discarding history for a conversation no longer selected"
                    );
                    return;
                };
                let baseline = conv.normalize(raw, &self.self_id);
                let outcome = conv.timeline.apply_baseline(baseline);
                debug!(
                    session = %tag,
                    admitted = outcome.admitted,
                    promoted = outcome.promoted,
                    "History loaded"
                );
                self.after_mutation(conv);
            }
            Err(e) if e.is_authorization_failure() => {
                warn!(session = %tag, error = %e, "History rejected for credential");
                let mut active = self.active.write().await;
                if let Some(conv) = active.as_mut().filter(|conv| conv.tag.same_selection(tag)) {
                    self.channel_auth_failure(conv, version);
                }
            }
            Err(e) => {
                warn!(
                    session = %tag,
                    error = %e,
                    "History load failed; keeping rendered messages"
                );
            }
        }
    }

    async fn attach(
        self: &Arc<Self>,
        tag: &SessionTag,
        subscription: SyncResult<LiveSubscription>,
        version: u64,
    ) {
        let mut active = self.active.write().await;
        let Some(conv) = active
            .as_mut()
            .filter(|conv| conv.tag == *tag && !conv.session_expired)
        else {
            debug!(session = %tag, "Session superseded before its channel opened");
            if let Ok(subscription) = subscription {
                subscription.cancel();
            }
            return;
        };

        match subscription {
            Ok(subscription) => {
                let (events, feeder) = subscription.into_parts();
                let pump = tokio::spawn(pump_events(Arc::downgrade(self), tag.clone(), events));
                conv.session.attach(pump, feeder);
            }
            Err(e) => {
                conv.connection = ConnectionState::Degraded;
                if e.is_authorization_failure() {
                    warn!(session = %tag, error = %e, "Live channel rejected credential");
                    self.channel_auth_failure(conv, version);
                } else {
                    warn!(
                        session = %tag,
                        error = %e,
                        "Live channel unavailable; continuing without live updates"
                    );
                }
                self.after_mutation(conv);
            }
        }
    }

    async fn handle_event(
        self: &Arc<Self>,
        tag: &SessionTag,
        event: TransportEvent,
    ) -> EventDisposition {
        let mut active = self.active.write().await;
        let Some(conv) = active
            .as_mut()
            .filter(|conv| conv.tag == *tag && conv.connection != ConnectionState::Closed)
        else {
            debug!(session = %tag, "Discarding event from superseded session");
            return EventDisposition::Stale;
        };

        conv.connection = conv.connection.after(&event);
        match event {
            TransportEvent::Connected => {
                info!(session = %tag, "Live channel connected");
            }
            TransportEvent::Reconnecting { attempt } => {
                debug!(session = %tag, attempt, "Live channel reconnecting");
            }
            TransportEvent::Disconnected { reason } => {
                warn!(
                    session = %tag,
                    reason = %reason,
                    "Live channel dropped; history stays rendered"
                );
            }
            TransportEvent::Exhausted => {
                warn!(session = %tag, "Live channel gave up reconnecting");
                conv.session.close();
            }
            TransportEvent::AuthRejected { reason } => {
                warn!(session = %tag, reason = %reason, "Live channel rejected credential");
                let version = conv.opened_with;
                self.channel_auth_failure(conv, version);
            }
            TransportEvent::Channel(payload) => self.apply_payload(conv, payload),
        }

        self.after_mutation(conv);
        EventDisposition::Applied
    }

    fn apply_payload(&self, conv: &mut ActiveConversation, payload: ChannelEvent) {
        match payload {
            ChannelEvent::History(raw) => {
                let batch = conv.normalize(raw, &self.self_id);
                conv.timeline.merge_live(batch);
            }
            ChannelEvent::Message(raw) => {
                let batch = conv.normalize(vec![raw], &self.self_id);
                conv.timeline.merge_live(batch);
            }
            ChannelEvent::Status(status) => {
                debug!(session = %conv.tag, state = ?status.state, "Conversation status updated");
                conv.status = Some(status);
            }
            ChannelEvent::Receipt { message_id, status } => {
                if let Err(e) = conv.timeline.apply_receipt(&message_id, status) {
                    debug!(
                        session = %conv.tag,
                        message_id = %message_id,
                        error = %e,
                        "Ignoring receipt"
                    );
                }
            }
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, tag: SessionTag, temp_id: String, draft: OutgoingMessage) {
        let inner = self.clone();
        tokio::spawn(async move { inner.dispatch(tag, temp_id, draft).await });
    }

    async fn dispatch(self: &Arc<Self>, tag: SessionTag, temp_id: String, draft: OutgoingMessage) {
        let (result, version) = match self.credentials().current().await {
            Some(credential) => (
                self.api
                    .send(&tag.conversation, &credential.credential, &draft)
                    .await,
                credential.version,
            ),
            None => (
                Err(SyncError::Unauthorized("no credential".to_string())),
                self.credentials().version().await,
            ),
        };
        self.on_send_result(&tag, &temp_id, result, version).await;
    }

    async fn on_send_result(
        self: &Arc<Self>,
        tag: &SessionTag,
        temp_id: &str,
        result: SyncResult<SendAck>,
        version: u64,
    ) {
        let mut active = self.active.write().await;
        let Some(conv) = active.as_mut().filter(|conv| conv.tag.same_selection(tag)) else {
            debug!(
                session = %tag,
                temp_id = %temp_id,
                "Dropping send result for a conversation no longer selected"
            );
            return;
        };

        match result {
            Ok(ack) if ack.ok => {
                if let Err(e) = conv.timeline.record_ack(temp_id, ack.id.clone()) {
                    debug!(temp_id = %temp_id, error = %e, "Acknowledged placeholder is gone");
                }
                info!(
                    session = %tag,
                    temp_id = %temp_id,
                    message_id = ?ack.id,
                    "Message sent"
                );
                self.after_mutation(conv);
                self.spawn_reconcile(conv.tag.clone());
            }
            Ok(ack) => {
                let reason = ack.error.unwrap_or_else(|| "send rejected".to_string());
                let auth = is_authorization_reason(&reason);
                self.fail_send(conv, temp_id, &reason, auth, version);
            }
            Err(e) => {
                let auth = e.is_authorization_failure();
                self.fail_send(conv, temp_id, &e.to_string(), auth, version);
            }
        }
    }

    fn fail_send(
        self: &Arc<Self>,
        conv: &mut ActiveConversation,
        temp_id: &str,
        reason: &str,
        authorization: bool,
        version: u64,
    ) {
        if authorization {
            match conv.timeline.park_for_reconnect(temp_id, reason) {
                Ok(true) => {
                    info!(
                        session = %conv.tag,
                        temp_id = %temp_id,
                        "Send rejected for credential; waiting for refresh"
                    );
                    self.request_recovery(conv.tag.clone(), version);
                }
                Ok(false) => {
                    warn!(
                        session = %conv.tag,
                        temp_id = %temp_id,
                        reason = %reason,
                        "Send rejected again after refresh; giving up"
                    );
                }
                Err(e) => debug!(temp_id = %temp_id, error = %e, "Cannot park send"),
            }
        } else {
            match conv.timeline.mark_failed(temp_id, reason) {
                Ok(()) => warn!(
                    session = %conv.tag,
                    temp_id = %temp_id,
                    reason = %reason,
                    "Send failed"
                ),
                Err(e) => debug!(temp_id = %temp_id, error = %e, "Cannot mark send failed"),
            }
        }
        self.after_mutation(conv);
    }

    /// Re-fetch history after an acknowledged send
    fn spawn_reconcile(self: &Arc<Self>, tag: SessionTag) {
        let inner = self.clone();
        tokio::spawn(async move {
            let Some(credential) = inner.credentials().current().await else {
                return;
            };
            let history = inner
                .api
                .get_messages(&tag.conversation, &credential.credential)
                .await;
            inner.apply_history(&tag, history, credential.version).await;
        });
    }

    fn spawn_mark_read(self: &Arc<Self>, tag: SessionTag) {
        let inner = self.clone();
        tokio::spawn(async move {
            let Some(credential) = inner.credentials().current().await else {
                return;
            };
            match inner.api.mark_read(&tag.conversation, &credential.credential).await {
                Ok(()) => debug!(session = %tag, "Conversation marked read"),
                Err(e) => debug!(session = %tag, error = %e, "Mark-read failed; not retried"),
            }
        });
    }

    /// Refresh the credential, reopen the channel and retry one parked send
    async fn recover(self: &Arc<Self>, tag: SessionTag, failed_version: u64) {
        let credential = match self.reconnect.refresh_after_failure(failed_version).await {
            RefreshOutcome::Refreshed(credential) => credential,
            RefreshOutcome::Expired => {
                self.expire(&tag).await;
                return;
            }
        };

        let (reopen, retry, current) = {
            let mut active = self.active.write().await;
            let Some(conv) = active
                .as_mut()
                .filter(|conv| conv.tag.same_selection(&tag) && !conv.session_expired)
            else {
                return;
            };

            conv.recovered_with = Some(credential.version);
            let reopen = if conv.opened_with < credential.version {
                let next = conv.tag.reopened(self.next_generation());
                conv.session.close();
                conv.session = ChannelSession::new(next.clone());
                conv.tag = next.clone();
                conv.connection = ConnectionState::Connecting;
                Some(next)
            } else {
                None
            };
            let retry = conv.timeline.take_reconnect_retry(Timestamp::now());
            self.after_mutation(conv);
            (reopen, retry, conv.tag.clone())
        };

        if let Some(next) = reopen {
            info!(session = %next, "Reopening session with refreshed credential");
            if let Err(e) = self.open(next).await {
                warn!(error = %e, "Reopen after refresh failed");
                return;
            }
        }
        if let Some((temp_id, draft)) = retry {
            info!(session = %current, temp_id = %temp_id, "Retrying send after reconnect");
            self.dispatch(current, temp_id, draft).await;
        }
    }

    /// Terminal state after a failed refresh
    async fn expire(self: &Arc<Self>, tag: &SessionTag) {
        let mut active = self.active.write().await;
        if let Some(conv) = active.as_mut().filter(|conv| conv.tag.same_selection(tag)) {
            self.expire_conversation(conv);
        }
    }

    /// Refresh on a channel-level rejection, unless the rejected credential
    /// is the one this selection already recovered with
    fn channel_auth_failure(self: &Arc<Self>, conv: &mut ActiveConversation, version: u64) {
        if conv.session_expired {
            return;
        }
        if conv.recovered_with == Some(version) {
            warn!(
                session = %conv.tag,
                credential_version = version,
                "Refreshed credential rejected again; not refreshing"
            );
            self.expire_conversation(conv);
            return;
        }
        self.request_recovery(conv.tag.clone(), version);
    }

    fn expire_conversation(self: &Arc<Self>, conv: &mut ActiveConversation) {
        conv.session.close();
        conv.connection = ConnectionState::Closed;
        conv.session_expired = true;
        let failed = conv.timeline.fail_parked("session expired");
        warn!(
            conversation = %conv.tag.conversation,
            failed_sends = failed,
            "Session expired; sign-in required"
        );
        self.after_mutation(conv);
    }
}

/// Forward live events into the manager until the channel or manager goes away
async fn pump_events(
    inner: Weak<ManagerInner>,
    tag: SessionTag,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.handle_event(&tag, event).await == EventDisposition::Stale {
            break;
        }
    }
    debug!(session = %tag, "Live event pump stopped");
}

/// Runs credential recoveries one at a time
async fn recovery_worker(
    inner: Weak<ManagerInner>,
    mut requests: mpsc::UnboundedReceiver<RecoveryRequest>,
) {
    while let Some(request) = requests.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.recover(request.tag, request.failed_version).await;
    }
}
