use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use shared::{
    domain::ConversationId,
    error::{ApiError, ApiException},
    protocol::{
        AttachmentUploadRequest, AttachmentUploadResponse, Conversation, Message,
        MessagesResponse, SendMessageRequest, StartConversationRequest,
        StartConversationResponse, TeamMember,
    },
};
use tracing::debug;

use crate::config::ClientSettings;

/// Remote collaborator consumed by the stores, uploader and composer.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<MessagesResponse>;
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<Message>;
    async fn start_conversation(
        &self,
        request: StartConversationRequest,
    ) -> Result<StartConversationResponse>;
    async fn upload_attachment(
        &self,
        request: AttachmentUploadRequest,
    ) -> Result<AttachmentUploadResponse>;
    async fn list_team_members(&self) -> Result<Vec<TeamMember>>;
}

/// The attachments endpoint answers 200 with either a stored file or an error body.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UploadReply {
    Stored(AttachmentUploadResponse),
    Failed(ApiError),
}

pub struct HttpMessagingApi {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpMessagingApi {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let base_url = settings.normalized_base_url()?;
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            token: settings.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let exception = match serde_json::from_str::<ApiError>(&body) {
                Ok(payload) => ApiException::from(payload),
                Err(_) => ApiException::new(
                    ApiError::from_status(status.as_u16()),
                    format!("{what} failed with status {status}"),
                ),
            };
            return Err(anyhow!(exception));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("invalid {what} response body"))
    }
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let response = self
            .authorized(self.http.get(format!("{}/conversations", self.base_url)))
            .send()
            .await
            .context("failed to fetch conversations")?;
        Self::read_json(response, "conversation list").await
    }

    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<MessagesResponse> {
        let response = self
            .authorized(self.http.get(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id
            )))
            .send()
            .await
            .with_context(|| format!("failed to fetch messages for {conversation_id}"))?;
        Self::read_json(response, "message list").await
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<Message> {
        debug!(
            conversation_id = %conversation_id,
            message_type = ?request.message_type,
            "api: posting message"
        );
        let response = self
            .authorized(self.http.post(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id
            )))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to send message to {conversation_id}"))?;
        Self::read_json(response, "send message").await
    }

    async fn start_conversation(
        &self,
        request: StartConversationRequest,
    ) -> Result<StartConversationResponse> {
        let response = self
            .authorized(self.http.post(format!("{}/conversations", self.base_url)))
            .json(&request)
            .send()
            .await
            .context("failed to start conversation")?;
        Self::read_json(response, "start conversation").await
    }

    async fn upload_attachment(
        &self,
        request: AttachmentUploadRequest,
    ) -> Result<AttachmentUploadResponse> {
        let file_name = request.file_name.clone();
        let response = self
            .authorized(self.http.post(format!("{}/attachments", self.base_url)))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to upload {file_name}"))?;
        match Self::read_json::<UploadReply>(response, "attachment upload").await? {
            UploadReply::Stored(stored) => Ok(stored),
            UploadReply::Failed(payload) => Err(anyhow!(ApiException::from(payload))),
        }
    }

    async fn list_team_members(&self) -> Result<Vec<TeamMember>> {
        let response = self
            .authorized(self.http.get(format!("{}/team-members", self.base_url)))
            .send()
            .await
            .context("failed to fetch team members")?;
        Self::read_json(response, "team member list").await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
