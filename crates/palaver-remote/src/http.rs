//! Reqwest implementation of the backend contract.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use palaver_types::{ChatInfo, Message, MessageId, Participant};

use crate::api::ChatApi;
use crate::error::{RemoteError, RemoteResult};

/// Body for `POST /messages/new`.
#[derive(Debug, Serialize)]
struct NewMessageBody<'a> {
    text: &'a str,
}

/// HTTP client for the chat backend.
#[derive(Clone)]
pub struct HttpChatClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpChatClient {
    /// Create a client for the given base URL (e.g. `https://chat.example.com`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Create a client with a per-request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> RemoteResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, http_client))
    }

    fn with_client(base_url: impl Into<String>, http_client: reqwest::Client) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http_client,
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET a JSON payload, mapping non-success statuses and body decode
    /// failures to their own error variants.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        let response = self.http_client.get(self.url(path)).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> RemoteResult<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ChatApi for HttpChatClient {
    async fn info(&self) -> RemoteResult<ChatInfo> {
        debug!("Fetching chat info");
        self.get_json("/info").await
    }

    async fn all_messages(&self, page: u32) -> RemoteResult<Vec<Message>> {
        debug!(page, "Fetching message page");
        self.get_json(&format!("/messages/all?page={}", page)).await
    }

    async fn latest_messages(&self) -> RemoteResult<Vec<Message>> {
        debug!("Fetching latest messages");
        self.get_json("/messages/latest").await
    }

    async fn older_messages(&self, before: &MessageId) -> RemoteResult<Vec<Message>> {
        debug!(before = %before, "Fetching older messages");
        self.get_json(&format!("/messages/older/{}", before)).await
    }

    async fn message_updates(&self, since_ms: i64) -> RemoteResult<Vec<Message>> {
        debug!(since_ms, "Fetching message updates");
        self.get_json(&format!("/messages/updates/{}", since_ms))
            .await
    }

    async fn all_participants(&self) -> RemoteResult<Vec<Participant>> {
        debug!("Fetching participants");
        self.get_json("/participants/all").await
    }

    async fn participant_updates(&self, since_ms: i64) -> RemoteResult<Vec<Participant>> {
        debug!(since_ms, "Fetching participant updates");
        self.get_json(&format!("/participants/updates/{}", since_ms))
            .await
    }

    async fn post_message(&self, text: &str) -> RemoteResult<Message> {
        debug!(len = text.len(), "Posting new message");
        let response = self
            .http_client
            .post(self.url("/messages/new"))
            .json(&NewMessageBody { text })
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slashes_are_trimmed() {
        let client = HttpChatClient::new("https://chat.example.com///");
        assert_eq!(client.base_url, "https://chat.example.com");
        assert_eq!(client.url("/info"), "https://chat.example.com/info");
    }

    #[test]
    fn update_paths_embed_the_watermark() {
        let client = HttpChatClient::new("http://localhost:8080");
        assert_eq!(
            client.url(&format!("/messages/updates/{}", 1700000000000i64)),
            "http://localhost:8080/messages/updates/1700000000000"
        );
    }

    #[test]
    fn new_message_body_serializes_text_only() {
        let body = NewMessageBody { text: "hi there" };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"text":"hi there"}"#);
    }

    #[tokio::test]
    async fn unreachable_backend_maps_to_network_error() {
        // Port 9 (discard) is a safe "nothing listening" target.
        let client =
            HttpChatClient::with_timeout("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = client.info().await.unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));
    }
}
