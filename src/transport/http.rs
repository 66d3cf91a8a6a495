//! HTTP chat API client
//!
//! `ChatApi` and `CredentialRefresher` over the marketplace REST endpoints.
//! Every kind lives under its own namespace (`/support`, `/p2p`,
//! `/projects`) and takes the credential either as a bearer header or as a
//! `token` query parameter.

use crate::chat::credentials::Credential;
use crate::chat::models::{
    value_to_id, AuthShape, ConversationKind, ConversationRef, OutgoingMessage,
    RawConversationSummary, RawMessage, SendAck,
};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::transport::{ChatApi, CredentialRefresher};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

/// History response: either a cursor page or a bare array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryBody {
    Page {
        messages: Vec<RawMessage>,
        #[serde(default, alias = "nextCursor", alias = "next_cursor")]
        cursor: Option<Value>,
    },
    Bare(Vec<RawMessage>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingBody {
    Wrapped {
        conversations: Vec<RawConversationSummary>,
    },
    Bare(Vec<RawConversationSummary>),
}

/// Send response; backends differ in how they spell success
#[derive(Debug, Default, Deserialize)]
struct AckBody {
    #[serde(default, alias = "success")]
    ok: Option<bool>,
    #[serde(default, alias = "messageId", alias = "_id")]
    id: Option<Value>,
    #[serde(default, alias = "reason")]
    error: Option<String>,
}

impl AckBody {
    fn into_ack(self) -> SendAck {
        let id = self.id.as_ref().and_then(value_to_id);
        SendAck {
            // A bare created-message body counts as success
            ok: self.ok.unwrap_or(id.is_some() && self.error.is_none()),
            id,
            error: self.error,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(alias = "accessToken", alias = "access_token")]
    token: String,
}

/// Place the credential the way `kind`'s endpoints expect it
pub(crate) fn authorize(
    request: RequestBuilder,
    kind: ConversationKind,
    credential: &Credential,
) -> RequestBuilder {
    match kind.descriptor().auth {
        AuthShape::Bearer => request.bearer_auth(credential.token()),
        AuthShape::QueryToken => request.query(&[("token", credential.token())]),
    }
}

/// Map a non-success status to an error, keeping the body for diagnosis
async fn check_status(response: Response, what: &str) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let status_code = status.as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error body".to_string());

    error!(
        status_code = status_code,
        error_body = %body,
        "{} returned error status",
        what
    );

    if status_code == 401 || status_code == 403 {
        return Err(SyncError::Unauthorized(body));
    }
    Err(SyncError::Http {
        status: status_code,
        body,
    })
}

/// REST client for the chat endpoints
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    page_limit: usize,
    max_pages: usize,
}

impl HttpChatApi {
    /// Build a client from the API configuration
    pub fn new(config: &Config) -> SyncResult<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self::with_client(client, config))
    }

    /// Build on an existing `reqwest::Client` (shares its connection pool)
    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            page_limit: config.api.history_page_limit,
            max_pages: config.api.history_max_pages,
        }
    }

    fn conversation_url(&self, conversation: &ConversationRef, tail: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url,
            conversation.kind.descriptor().namespace,
            conversation.id,
            tail
        )
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn get_messages(
        &self,
        conversation: &ConversationRef,
        credential: &Credential,
    ) -> SyncResult<Vec<RawMessage>> {
        let url = self.conversation_url(conversation, "messages");
        let limit = self.page_limit.to_string();
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 1..=self.max_pages {
            let mut request = self.client.get(&url).query(&[("limit", limit.as_str())]);
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor.as_str())]);
            }
            let request = authorize(request, conversation.kind, credential);

            debug!(conversation = %conversation, page, "Fetching history page");
            let response = check_status(request.send().await?, "History endpoint").await?;
            let body: HistoryBody = response.json().await?;

            match body {
                HistoryBody::Page {
                    messages: batch,
                    cursor: next,
                } => {
                    messages.extend(batch);
                    cursor = next.as_ref().and_then(value_to_id);
                    if cursor.is_none() {
                        break;
                    }
                }
                HistoryBody::Bare(batch) => {
                    messages.extend(batch);
                    break;
                }
            }
        }

        debug!(
            conversation = %conversation,
            count = messages.len(),
            truncated = cursor.is_some(),
            "History fetched"
        );
        Ok(messages)
    }

    async fn send(
        &self,
        conversation: &ConversationRef,
        credential: &Credential,
        draft: &OutgoingMessage,
    ) -> SyncResult<SendAck> {
        let url = self.conversation_url(conversation, "messages");
        let request = authorize(
            self.client.post(&url).json(draft),
            conversation.kind,
            credential,
        );

        debug!(
            conversation = %conversation,
            content_len = draft.content.len(),
            attachments = draft.attachments.len(),
            "Sending message"
        );
        let response = check_status(request.send().await?, "Send endpoint").await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(SendAck {
                ok: true,
                id: None,
                error: None,
            });
        }
        let body: AckBody = serde_json::from_str(&text)?;
        Ok(body.into_ack())
    }

    async fn mark_read(
        &self,
        conversation: &ConversationRef,
        credential: &Credential,
    ) -> SyncResult<()> {
        let url = self.conversation_url(conversation, "read");
        let request = authorize(self.client.post(&url), conversation.kind, credential);
        check_status(request.send().await?, "Mark-read endpoint").await?;
        Ok(())
    }

    async fn list_conversations(
        &self,
        kind: ConversationKind,
        credential: &Credential,
    ) -> SyncResult<Vec<RawConversationSummary>> {
        let url = format!("{}/{}/conversations", self.base_url, kind.descriptor().namespace);
        let request = authorize(self.client.get(&url), kind, credential);
        let response = check_status(request.send().await?, "Conversation listing").await?;
        let body: ListingBody = response.json().await?;
        Ok(match body {
            ListingBody::Wrapped { conversations } => conversations,
            ListingBody::Bare(conversations) => conversations,
        })
    }
}

/// Refreshes the credential against `POST {base}/auth/refresh`
#[derive(Debug, Clone)]
pub struct HttpCredentialRefresher {
    client: Client,
    url: String,
}

impl HttpCredentialRefresher {
    /// Build a refresher from the API configuration
    pub fn new(config: &Config) -> SyncResult<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            url: format!("{}/auth/refresh", config.api.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl CredentialRefresher for HttpCredentialRefresher {
    async fn refresh(&self, current: Option<&Credential>) -> SyncResult<Credential> {
        let mut request = self.client.post(&self.url);
        if let Some(current) = current {
            request = request.bearer_auth(current.token());
        }
        let response = check_status(request.send().await?, "Refresh endpoint").await?;
        let body: TokenBody = response.json().await?;
        if body.token.trim().is_empty() {
            return Err(SyncError::Unauthorized(
                "refresh returned an empty token".to_string(),
            ));
        }
        Ok(Credential::new(body.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serial_test::serial;

    fn config_for(base_url: &str, page_limit: usize) -> Config {
        let mut config = Config::default();
        config.api.base_url = base_url.to_string();
        config.api.history_page_limit = page_limit;
        config
    }

    #[tokio::test]
    #[serial]
    async fn test_history_follows_cursor() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/p2p/42/messages")
            .match_query(Matcher::Exact("limit=2".to_string()))
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_body(
                r#"{"messages":[{"id":"m1","content":"a","timestamp":1730361600},
                                {"id":"m2","content":"b","timestamp":1730361601}],
                    "nextCursor":"abc"}"#,
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", "/p2p/42/messages")
            .match_query(Matcher::Exact("limit=2&cursor=abc".to_string()))
            .with_status(200)
            .with_body(r#"{"messages":[{"id":"m0","content":"z","timestamp":1730361500}]}"#)
            .create_async()
            .await;

        let api = HttpChatApi::new(&config_for(&server.url(), 2)).unwrap();
        let conversation = ConversationRef::new(ConversationKind::Peer, "42");
        let messages = api
            .get_messages(&conversation, &Credential::new("tok"))
            .await
            .unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    #[serial]
    async fn test_support_uses_query_token_and_bare_array() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/support/7/messages")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("token".into(), "tok".into()),
                Matcher::UrlEncoded("limit".into(), "50".into()),
            ]))
            .with_status(200)
            .with_body(r#"[{"_id":1,"message":"hi","createdAt":"2024-10-31T08:00:00Z"}]"#)
            .create_async()
            .await;

        let api = HttpChatApi::new(&config_for(&server.url(), 50)).unwrap();
        let conversation = ConversationRef::new(ConversationKind::Support, "7");
        let messages = api
            .get_messages(&conversation, &Credential::new("tok"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(messages.len(), 1);
        let message = messages[0].clone().into_message("7", "me");
        assert_eq!(message.id, "1");
        assert_eq!(message.content, "hi");
    }

    #[tokio::test]
    #[serial]
    async fn test_unauthorized_status_maps_to_auth_failure() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/projects/9/messages")
            .with_status(401)
            .with_body("jwt expired")
            .create_async()
            .await;

        let api = HttpChatApi::new(&config_for(&server.url(), 50)).unwrap();
        let conversation = ConversationRef::new(ConversationKind::Project, "9");
        let result = api
            .send(&conversation, &Credential::new("old"), &OutgoingMessage::text("hi"))
            .await;

        let err = result.unwrap_err();
        assert!(err.is_authorization_failure());
    }

    #[tokio::test]
    #[serial]
    async fn test_send_ack_shapes() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/p2p/42/messages")
            .match_body(Matcher::PartialJson(serde_json::json!({"content": "hello"})))
            .with_status(201)
            .with_body(r#"{"_id": 981, "content": "hello"}"#)
            .create_async()
            .await;

        let api = HttpChatApi::new(&config_for(&server.url(), 50)).unwrap();
        let conversation = ConversationRef::new(ConversationKind::Peer, "42");
        let ack = api
            .send(&conversation, &Credential::new("tok"), &OutgoingMessage::text("hello"))
            .await
            .unwrap();

        assert!(ack.ok);
        assert_eq!(ack.id.as_deref(), Some("981"));
    }

    #[test]
    fn test_rejected_ack_keeps_reason() {
        let body: AckBody =
            serde_json::from_str(r#"{"success": false, "error": "Token expired"}"#).unwrap();
        let ack = body.into_ack();
        assert!(!ack.ok);
        assert_eq!(ack.error.as_deref(), Some("Token expired"));
    }

    #[tokio::test]
    #[serial]
    async fn test_list_conversations_wrapped() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/projects/conversations")
            .with_status(200)
            .with_body(r#"{"conversations":[{"id":"p1","name":"Logo redesign","unread":2}]}"#)
            .create_async()
            .await;

        let api = HttpChatApi::new(&config_for(&server.url(), 50)).unwrap();
        let listed = api
            .list_conversations(ConversationKind::Project, &Credential::new("tok"))
            .await
            .unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title.as_deref(), Some("Logo redesign"));
        assert_eq!(listed[0].unread_count, 2);
    }

    #[tokio::test]
    #[serial]
    async fn test_refresher_reads_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .match_header("authorization", "Bearer old")
            .with_status(200)
            .with_body(r#"{"accessToken":"new"}"#)
            .create_async()
            .await;

        let refresher = HttpCredentialRefresher::new(&config_for(&server.url(), 50)).unwrap();
        let fresh = refresher.refresh(Some(&Credential::new("old"))).await.unwrap();

        mock.assert_async().await;
        assert_eq!(fresh.token(), "new");
    }
}
