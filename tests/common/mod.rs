//! In-memory fakes for the transport traits

#![allow(dead_code)]

use async_trait::async_trait;
use marketplace_chat_sync::chat::models::{
    ConversationKind, ConversationRef, OutgoingMessage, RawConversationSummary, RawMessage,
    SendAck,
};
use marketplace_chat_sync::chat::{
    ChannelSessionManager, Credential, CredentialStore, TimelineSnapshot,
};
use marketplace_chat_sync::transport::{
    ChatApi, CredentialRefresher, LiveSubscription, LiveTransport, TransportEvent,
};
use marketplace_chat_sync::{Config, SyncError, SyncResult};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const SELF_ID: &str = "me";

/// Scripted outcome of one send call
#[derive(Debug, Clone)]
pub enum SendScript {
    /// Accept and append to history
    Accept,
    /// `ok: false` with a reason
    Reject(String),
    /// Transport error
    Fail(String),
}

#[derive(Default)]
pub struct FakeApi {
    history: Mutex<HashMap<String, Vec<RawMessage>>>,
    history_delay: Mutex<HashMap<String, Duration>>,
    send_delay: Mutex<Duration>,
    scripts: Mutex<VecDeque<SendScript>>,
    valid_token: Mutex<Option<String>>,
    next_id: AtomicUsize,
    pub sent_tokens: Mutex<Vec<String>>,
    pub history_calls: AtomicUsize,
    pub mark_read_calls: AtomicUsize,
    listings: Mutex<HashMap<ConversationKind, Vec<RawConversationSummary>>>,
    failing_kinds: Mutex<Vec<ConversationKind>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_history(&self, conversation_id: &str, messages: Vec<RawMessage>) {
        self.history
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), messages);
    }

    pub fn delay_history(&self, conversation_id: &str, delay: Duration) {
        self.history_delay
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), delay);
    }

    pub fn delay_sends(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn script(&self, outcome: SendScript) {
        self.scripts.lock().unwrap().push_back(outcome);
    }

    /// Only this token is accepted from now on
    pub fn accept_only(&self, token: &str) {
        *self.valid_token.lock().unwrap() = Some(token.to_string());
    }

    pub fn set_listing(&self, kind: ConversationKind, entries: Vec<RawConversationSummary>) {
        self.listings.lock().unwrap().insert(kind, entries);
    }

    pub fn fail_listing(&self, kind: ConversationKind) {
        self.failing_kinds.lock().unwrap().push(kind);
    }

    fn check(&self, credential: &Credential) -> SyncResult<()> {
        match self.valid_token.lock().unwrap().as_deref() {
            Some(valid) if valid != credential.token() => {
                Err(SyncError::Unauthorized("token expired".to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn get_messages(
        &self,
        conversation: &ConversationRef,
        credential: &Credential,
    ) -> SyncResult<Vec<RawMessage>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .history_delay
            .lock()
            .unwrap()
            .get(&conversation.id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(credential)?;
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&conversation.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send(
        &self,
        conversation: &ConversationRef,
        credential: &Credential,
        draft: &OutgoingMessage,
    ) -> SyncResult<SendAck> {
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.sent_tokens
            .lock()
            .unwrap()
            .push(credential.token().to_string());
        self.check(credential)?;

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendScript::Accept);
        match script {
            SendScript::Accept => {
                let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                let stored = server_message(&id, SELF_ID, &draft.content, now_ms());
                self.history
                    .lock()
                    .unwrap()
                    .entry(conversation.id.clone())
                    .or_default()
                    .push(stored);
                Ok(SendAck {
                    ok: true,
                    id: Some(id),
                    error: None,
                })
            }
            SendScript::Reject(reason) => Ok(SendAck {
                ok: false,
                id: None,
                error: Some(reason),
            }),
            SendScript::Fail(reason) => Err(SyncError::Transport(reason)),
        }
    }

    async fn mark_read(
        &self,
        _conversation: &ConversationRef,
        _credential: &Credential,
    ) -> SyncResult<()> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_conversations(
        &self,
        kind: ConversationKind,
        credential: &Credential,
    ) -> SyncResult<Vec<RawConversationSummary>> {
        self.check(credential)?;
        if self.failing_kinds.lock().unwrap().contains(&kind) {
            return Err(SyncError::Http {
                status: 500,
                body: "listing unavailable".to_string(),
            });
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }
}

/// Hands out channels whose sending side the test controls
#[derive(Default)]
pub struct FakeTransport {
    channels: Mutex<Vec<(ConversationRef, mpsc::Sender<TransportEvent>)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscriptions(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Sender of the most recent subscription
    pub fn latest(&self) -> mpsc::Sender<TransportEvent> {
        self.channels
            .lock()
            .unwrap()
            .last()
            .map(|(_, tx)| tx.clone())
            .expect("no subscription yet")
    }

    /// Sender of the `index`-th subscription
    pub fn channel(&self, index: usize) -> mpsc::Sender<TransportEvent> {
        self.channels.lock().unwrap()[index].1.clone()
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn subscribe(
        &self,
        conversation: &ConversationRef,
        _credentials: &CredentialStore,
    ) -> SyncResult<LiveSubscription> {
        let (tx, rx) = mpsc::channel(64);
        self.channels
            .lock()
            .unwrap()
            .push((conversation.clone(), tx));
        Ok(LiveSubscription::new(rx, None))
    }
}

pub struct FakeRefresher {
    result: Result<String, String>,
    pub calls: AtomicUsize,
}

impl FakeRefresher {
    pub fn succeeding(token: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(token.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            result: Err("refresh token revoked".to_string()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CredentialRefresher for FakeRefresher {
    async fn refresh(&self, _current: Option<&Credential>) -> SyncResult<Credential> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.result
            .clone()
            .map(Credential::new)
            .map_err(SyncError::Unauthorized)
    }
}

pub struct Harness {
    pub api: Arc<FakeApi>,
    pub transport: Arc<FakeTransport>,
    pub refresher: Arc<FakeRefresher>,
    pub credentials: CredentialStore,
    pub manager: Arc<ChannelSessionManager>,
}

impl Harness {
    pub fn new(refresher: Arc<FakeRefresher>) -> Self {
        let api = FakeApi::new();
        let transport = FakeTransport::new();
        let credentials = CredentialStore::with_credential(Credential::new("stale"));
        let manager = Arc::new(ChannelSessionManager::new(
            api.clone(),
            transport.clone(),
            refresher.clone(),
            credentials.clone(),
            SELF_ID,
            &Config::default(),
        ));
        Self {
            api,
            transport,
            refresher,
            credentials,
            manager,
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn server_message(id: &str, sender: &str, content: &str, at_ms: i64) -> RawMessage {
    serde_json::from_value(json!({
        "id": id,
        "senderId": sender,
        "content": content,
        "timestamp": at_ms,
    }))
    .expect("valid raw message")
}

/// Wait until a published snapshot satisfies `condition`
pub async fn wait_for<F>(
    updates: &mut watch::Receiver<TimelineSnapshot>,
    mut condition: F,
) -> TimelineSnapshot
where
    F: FnMut(&TimelineSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let snapshot = updates.borrow_and_update().clone();
            if condition(&snapshot) {
                return snapshot;
            }
            updates.changed().await.expect("manager dropped");
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Let spawned tasks run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
