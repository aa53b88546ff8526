//! REST collaborator client.
//!
//! The durable persistence API is the source of truth for conversations and
//! history; the sync coordinator replays it on every reconnect to repair
//! drift. All calls are plain request/response — retry policy lives with the
//! caller.

use std::future::Future;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use parley_types::api::{CreateConversationRequest, EditMessageRequest, MessagePage};
use parley_types::models::Conversation;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The slice of the REST contract the sync coordinator depends on.
/// A trait seam so the coordinator can be driven against a stub in tests.
pub trait ConversationApi: Clone + Send + Sync + 'static {
    fn get_conversations(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Conversation>, RestError>> + Send;

    fn create_conversation(
        &self,
        req: CreateConversationRequest,
    ) -> impl Future<Output = Result<Conversation, RestError>> + Send;

    fn get_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<MessagePage, RestError>> + Send;
}

impl ConversationApi for RestClient {
    async fn get_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, RestError> {
        RestClient::get_conversations(self, user_id).await
    }

    async fn create_conversation(
        &self,
        req: CreateConversationRequest,
    ) -> Result<Conversation, RestError> {
        RestClient::create_conversation(self, &req).await
    }

    async fn get_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, RestError> {
        RestClient::get_messages(self, conversation_id, user_id, page, page_size).await
    }
}

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn get_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, RestError> {
        let url = format!("{}/conversations", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("userId", user_id.to_string())])
            .send()
            .await?;
        let body = Self::require_ok(resp).await?;
        debug!(user_id = %user_id, "fetched conversation snapshot");
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn create_conversation(
        &self,
        req: &CreateConversationRequest,
    ) -> Result<Conversation, RestError> {
        let url = format!("{}/conversations", self.base_url);
        let resp = self.http.post(&url).json(req).send().await?;
        let body = Self::require_ok(resp).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Fetch one page of history, newest-last.
    pub async fn get_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, RestError> {
        let url = format!("{}/conversations/{}/messages", self.base_url, conversation_id);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("userId", user_id.to_string()),
                ("page", page.to_string()),
                ("pageSize", page_size.to_string()),
            ])
            .send()
            .await?;
        let body = Self::require_ok(resp).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> Result<(), RestError> {
        let url = format!("{}/messages/{}/read", self.base_url, message_id);
        let resp = self
            .http
            .post(&url)
            .query(&[("userId", user_id.to_string())])
            .send()
            .await?;
        Self::require_ok(resp).await?;
        Ok(())
    }

    pub async fn edit_message(&self, message_id: Uuid, content: String) -> Result<(), RestError> {
        let url = format!("{}/messages/{}", self.base_url, message_id);
        let resp = self
            .http
            .put(&url)
            .json(&EditMessageRequest { content })
            .send()
            .await?;
        Self::require_ok(resp).await?;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Result<(), RestError> {
        let url = format!("{}/messages/{}", self.base_url, message_id);
        let resp = self.http.delete(&url).send().await?;
        Self::require_ok(resp).await?;
        Ok(())
    }

    async fn require_ok(resp: reqwest::Response) -> Result<String, RestError> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RestError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        Ok(body)
    }
}
