//! Inbox configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the inbox and its sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Base URL of the message-center API.
    pub base_url: String,
    /// Application key, used as the basic-auth user for user creation.
    pub app_key: String,
    /// Application secret, used as the basic-auth password for user creation.
    pub app_secret: String,
    /// Platform key embedded in user payloads (`<platform>_channels`).
    pub platform: String,
    /// Database file path.
    pub db_path: PathBuf,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            base_url: "https://device-api.urbanairship.com/".to_string(),
            app_key: String::new(),
            app_secret: String::new(),
            platform: "android".to_string(),
            db_path: PathBuf::from("message_center.db"),
        }
    }
}
