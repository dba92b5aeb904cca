//! Remote message-center API client.
//!
//! [`InboxRemote`] is the seam the sync engine talks through; the engine is
//! tested against an in-memory fake and production wires up
//! [`InboxApiClient`]. The client is stateless request shaping only: non-2xx
//! statuses are returned for the engine to interpret (304, 401, ...), never
//! mapped to errors.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::InboxConfig;
use crate::credentials::UserCredentials;
use crate::error::{Error, Result};

const ACCEPT_HEADER: &str = "application/vnd.urbanairship+json; version=3;";
const CHANNEL_HEADER: &str = "X-UA-Channel-ID";

/// Response of a message listing request.
#[derive(Debug, Clone)]
pub struct MessageListResponse {
    pub status: u16,
    /// Raw listing entries; empty unless the status is a 2xx.
    pub messages: Vec<Value>,
    /// `Last-Modified` echo, recorded as the next fetch watermark.
    pub last_modified: Option<String>,
}

/// The five message-center API operations.
#[async_trait]
pub trait InboxRemote: Send + Sync {
    /// GET the user's message listing, conditional on the watermark.
    async fn fetch_messages(
        &self,
        credentials: &UserCredentials,
        channel_id: &str,
        if_modified_since: Option<&str>,
    ) -> Result<MessageListResponse>;

    /// POST locally-read reporting payloads. Returns the response status.
    async fn sync_read_state(
        &self,
        credentials: &UserCredentials,
        channel_id: &str,
        reportings: &[Value],
    ) -> Result<u16>;

    /// POST locally-deleted reporting payloads. Returns the response status.
    async fn sync_deleted_state(
        &self,
        credentials: &UserCredentials,
        channel_id: &str,
        reportings: &[Value],
    ) -> Result<u16>;

    /// Create a new user bound to the given channel. `None` means the server
    /// declined; transport failures surface as errors.
    async fn create_user(&self, channel_id: &str) -> Result<Option<UserCredentials>>;

    /// Associate the current channel with an existing user. Returns the
    /// response status (200 success, 401 identity revoked, ...).
    async fn update_user(&self, credentials: &UserCredentials, channel_id: &str) -> Result<u16>;
}

/// `reqwest`-backed [`InboxRemote`] implementation.
pub struct InboxApiClient {
    client: reqwest::Client,
    base_url: Url,
    app_key: String,
    app_secret: String,
    platform: String,
}

impl InboxApiClient {
    pub fn new(config: &InboxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidState(format!("Invalid base URL: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            app_key: config.app_key.clone(),
            app_secret: config.app_secret.clone(),
            platform: config.platform.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidState(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn channels_key(&self) -> String {
        format!("{}_channels", self.platform)
    }

    async fn post_reportings(
        &self,
        path: &str,
        payload_key: &str,
        credentials: &UserCredentials,
        channel_id: &str,
        reportings: &[Value],
    ) -> Result<u16> {
        let url = self.endpoint(path)?;
        let body = json!({ payload_key: reportings });
        debug!(%url, count = reportings.len(), "Pushing message state");

        let response = self
            .client
            .post(url)
            .basic_auth(&credentials.user_id, Some(&credentials.token))
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .header(CHANNEL_HEADER, channel_id)
            .json(&body)
            .send()
            .await?;

        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl InboxRemote for InboxApiClient {
    async fn fetch_messages(
        &self,
        credentials: &UserCredentials,
        channel_id: &str,
        if_modified_since: Option<&str>,
    ) -> Result<MessageListResponse> {
        let url = self.endpoint(&format!("api/user/{}/messages/", credentials.user_id))?;
        debug!(%url, "Fetching inbox messages");

        let mut request = self
            .client
            .get(url)
            .basic_auth(&credentials.user_id, Some(&credentials.token))
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .header(CHANNEL_HEADER, channel_id);
        if let Some(watermark) = if_modified_since {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, watermark);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let messages = if response.status().is_success() {
            let body: Value = response.json().await?;
            body.get("messages")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| Error::Parse("Message listing missing 'messages'".to_string()))?
        } else {
            Vec::new()
        };

        Ok(MessageListResponse {
            status,
            messages,
            last_modified,
        })
    }

    async fn sync_read_state(
        &self,
        credentials: &UserCredentials,
        channel_id: &str,
        reportings: &[Value],
    ) -> Result<u16> {
        self.post_reportings(
            &format!("api/user/{}/messages/unread/", credentials.user_id),
            "mark_as_read",
            credentials,
            channel_id,
            reportings,
        )
        .await
    }

    async fn sync_deleted_state(
        &self,
        credentials: &UserCredentials,
        channel_id: &str,
        reportings: &[Value],
    ) -> Result<u16> {
        self.post_reportings(
            &format!("api/user/{}/messages/delete/", credentials.user_id),
            "delete",
            credentials,
            channel_id,
            reportings,
        )
        .await
    }

    async fn create_user(&self, channel_id: &str) -> Result<Option<UserCredentials>> {
        let url = self.endpoint("api/user/")?;
        let body = json!({ self.channels_key(): [channel_id] });
        debug!(%url, "Creating message-center user");

        let response = self
            .client
            .post(url)
            .basic_auth(&self.app_key, Some(&self.app_secret))
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .header(CHANNEL_HEADER, channel_id)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            debug!(status = response.status().as_u16(), "User creation declined");
            return Ok(None);
        }

        let body: Value = response.json().await?;
        let user_id = body
            .get("user_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Parse("User payload missing 'user_id'".to_string()))?;
        let token = body
            .get("password")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Parse("User payload missing 'password'".to_string()))?;

        Ok(Some(UserCredentials {
            user_id: user_id.to_string(),
            token: token.to_string(),
        }))
    }

    async fn update_user(&self, credentials: &UserCredentials, channel_id: &str) -> Result<u16> {
        let url = self.endpoint(&format!("api/user/{}/", credentials.user_id))?;
        let body = json!({ self.channels_key(): { "add": [channel_id] } });
        debug!(%url, "Updating message-center user");

        let response = self
            .client
            .post(url)
            .basic_auth(&credentials.user_id, Some(&credentials.token))
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .header(CHANNEL_HEADER, channel_id)
            .json(&body)
            .send()
            .await?;

        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> InboxApiClient {
        InboxApiClient::new(&InboxConfig {
            base_url: "https://device-api.example.com/".to_string(),
            app_key: "app_key".to_string(),
            app_secret: "app_secret".to_string(),
            platform: "android".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_joining() {
        let client = client();
        assert_eq!(
            client
                .endpoint("api/user/some_user_id/messages/")
                .unwrap()
                .as_str(),
            "https://device-api.example.com/api/user/some_user_id/messages/"
        );
        assert_eq!(
            client.endpoint("api/user/").unwrap().as_str(),
            "https://device-api.example.com/api/user/"
        );
    }

    #[test]
    fn test_channels_key_follows_platform() {
        let mut config = InboxConfig::default();
        config.base_url = "https://device-api.example.com/".to_string();
        config.platform = "ios".to_string();
        let client = InboxApiClient::new(&config).unwrap();
        assert_eq!(client.channels_key(), "ios_channels");
    }
}
