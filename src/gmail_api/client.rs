use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::engine::Engine;
use tracing::debug;

use crate::config::GMAIL_API_BASE_URL;
use crate::error::ApiError;
use crate::types::{
    Message, MessageFormat, MessageList, MessageQuery, MessagesResponse, SendAs,
    SendAsListResponse,
};

// Define a trait for the Gmail REST calls to allow mocking
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailApi: Send + Sync {
    async fn list_messages(&self, query: &MessageQuery) -> Result<MessageList, ApiError>;
    async fn get_message(&self, id: &str, format: MessageFormat) -> Result<Message, ApiError>;
    /// Sends an RFC 5322 message and returns the stored message.
    async fn send_message(&self, raw: &[u8]) -> Result<Message, ApiError>;
    /// Returns the alias for `address`, or the default alias when `None`.
    async fn get_send_as(&self, address: Option<String>) -> Result<SendAs, ApiError>;
}

pub struct GmailClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
    user_id: String,
}

impl GmailClient {
    pub fn new(client: reqwest::Client, token: impl Into<String>) -> Self {
        Self::with_base_url(client, token, GMAIL_API_BASE_URL)
    }

    // Used by tests to point at a mock server.
    pub fn with_base_url(
        client: reqwest::Client,
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: "me".to_string(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/gmail/v1/users/{}/{}", self.base_url, self.user_id, path)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Picks the alias for `address`, or the default one.
pub fn select_send_as(aliases: Vec<SendAs>, address: Option<&str>) -> Result<SendAs, ApiError> {
    match address {
        None => aliases
            .into_iter()
            .rev()
            .find(|alias| alias.is_default)
            .ok_or(ApiError::NoDefaultSendAs),
        Some(address) => aliases
            .into_iter()
            .rev()
            .find(|alias| alias.send_as_email == address)
            .ok_or_else(|| ApiError::SendAsNotFound(address.to_string())),
    }
}

#[async_trait]
impl MailApi for GmailClient {
    async fn list_messages(&self, query: &MessageQuery) -> Result<MessageList, ApiError> {
        let mut params: Vec<(&str, String)> = vec![
            ("q", query.query.clone()),
            ("maxResults", query.max_results.to_string()),
            ("includeSpamTrash", query.include_spam_trash.to_string()),
        ];
        if let Some(page_token) = query.page_token.as_ref().filter(|t| !t.is_empty()) {
            params.push(("pageToken", page_token.clone()));
        }
        for label_id in &query.label_ids {
            params.push(("labelIds", label_id.clone()));
        }

        debug!("Listing messages matching {:?}", query.query);
        let response = self
            .client
            .get(self.url("messages"))
            .bearer_auth(&self.token)
            .query(&params)
            .send()
            .await?;
        let messages: MessagesResponse = check(response).await?.json().await?;
        Ok(messages.into())
    }

    async fn get_message(&self, id: &str, format: MessageFormat) -> Result<Message, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("messages/{}", id)))
            .bearer_auth(&self.token)
            .query(&[("format", format.as_str())])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn send_message(&self, raw: &[u8]) -> Result<Message, ApiError> {
        let request_body = serde_json::json!({
            "raw": URL_SAFE.encode(raw)
        });

        let response = self
            .client
            .post(self.url("messages/send"))
            .bearer_auth(&self.token)
            .json(&request_body)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn get_send_as(&self, address: Option<String>) -> Result<SendAs, ApiError> {
        let response = self
            .client
            .get(self.url("settings/sendAs"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let aliases: SendAsListResponse = check(response).await?.json().await?;
        select_send_as(aliases.send_as, address.as_deref())
    }
}
