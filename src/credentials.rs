//! User credential storage.
//!
//! The message-center user is an anonymous per-install identity: a server
//! issued `(user_id, token)` pair. The token never sits on disk in clear
//! text; it is XORed against the user id and hex-encoded. That is light
//! obfuscation against casual inspection of the database file, not
//! cryptographic protection.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::MessageStore;

const USER_ID_KEY: &str = "user.id";
const USER_TOKEN_KEY: &str = "user.token";
const LEGACY_TOKEN_KEY: &str = "user.password";
const REGISTERED_CHANNEL_KEY: &str = "user.registered_channel";
const LAST_UPDATE_KEY: &str = "user.last_update_ms";

/// How long an identity stays fresh before the next non-forceful update.
pub const USER_UPDATE_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

/// The user id and clear-text token, decoded in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentials {
    pub user_id: String,
    pub token: String,
}

/// Persistent credential accessors, backed by the store's preference table.
pub struct CredentialStore {
    store: Arc<MessageStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }

    /// Returns the current credentials, or `None` when the user has not been
    /// created yet (or the stored token fails to decode).
    pub fn credentials(&self) -> Result<Option<UserCredentials>> {
        self.migrate_legacy_token()?;

        let user_id = match self.store.get_pref(USER_ID_KEY)? {
            Some(id) if !id.is_empty() => id,
            _ => return Ok(None),
        };
        let encoded = match self.store.get_pref(USER_TOKEN_KEY)? {
            Some(token) => token,
            None => return Ok(None),
        };

        match decode_token(&encoded, &user_id) {
            Some(token) => Ok(Some(UserCredentials { user_id, token })),
            None => {
                warn!("Stored user token failed to decode; treating user as absent");
                Ok(None)
            }
        }
    }

    /// The current user id, when a user exists.
    pub fn user_id(&self) -> Result<Option<String>> {
        Ok(self.credentials()?.map(|c| c.user_id))
    }

    /// The channel id the user was last registered against.
    pub fn registered_channel_id(&self) -> Result<Option<String>> {
        self.store.get_pref(REGISTERED_CHANNEL_KEY)
    }

    /// Whether a non-forceful update should contact the server: true when the
    /// refresh interval has elapsed or the device channel has changed.
    pub fn requires_update(&self, channel_id: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.registered_channel_id()?.as_deref() != Some(channel_id) {
            return Ok(true);
        }

        let last_update = self
            .store
            .get_pref(LAST_UPDATE_KEY)?
            .and_then(|ms| ms.parse::<i64>().ok())
            .unwrap_or(0);
        let now_ms = now.timestamp_millis();

        Ok(last_update > now_ms || last_update + USER_UPDATE_INTERVAL_MS < now_ms)
    }

    /// Records a freshly created identity. The previous identity, if any, is
    /// replaced outright.
    pub fn on_created(&self, user_id: &str, token: &str, channel_id: &str) -> Result<()> {
        debug!(user_id, "Created message-center user");
        self.store.set_pref(USER_ID_KEY, user_id)?;
        self.store.set_pref(USER_TOKEN_KEY, &encode_token(token, user_id))?;
        self.store.remove_pref(LEGACY_TOKEN_KEY)?;
        self.store.set_pref(REGISTERED_CHANNEL_KEY, channel_id)?;
        self.touch_update_clock()
    }

    /// Records a successful identity update.
    pub fn on_updated(&self, channel_id: &str) -> Result<()> {
        self.store.set_pref(REGISTERED_CHANNEL_KEY, channel_id)?;
        self.touch_update_clock()
    }

    /// Forces the next non-forceful update to contact the server.
    pub fn reset_update_clock(&self) -> Result<()> {
        self.store.set_pref(LAST_UPDATE_KEY, "0")
    }

    fn touch_update_clock(&self) -> Result<()> {
        self.store
            .set_pref(LAST_UPDATE_KEY, &Utc::now().timestamp_millis().to_string())
    }

    /// One-shot migration of a legacy clear-text token. Repeated loads after
    /// the migration are no-ops.
    fn migrate_legacy_token(&self) -> Result<()> {
        let plain = match self.store.get_pref(LEGACY_TOKEN_KEY)? {
            Some(plain) => plain,
            None => return Ok(()),
        };

        if let Some(user_id) = self.store.get_pref(USER_ID_KEY)? {
            if !user_id.is_empty() {
                debug!("Obfuscating legacy clear-text user token");
                self.store
                    .set_pref(USER_TOKEN_KEY, &encode_token(&plain, &user_id))?;
            }
        }
        self.store.remove_pref(LEGACY_TOKEN_KEY)
    }
}

/// Obfuscates a token for storage: hex of the token XORed byte-wise against
/// the user id, with the key cycled to the token's length.
pub(crate) fn encode_token(token: &str, user_id: &str) -> String {
    hex::encode(xor_cycle(token.as_bytes(), user_id.as_bytes()))
}

/// Reverses [`encode_token`]. Fails closed: odd-length hex, a non-hex
/// character, or a non-UTF-8 result all yield `None` rather than partial
/// output.
pub(crate) fn decode_token(encoded: &str, user_id: &str) -> Option<String> {
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(xor_cycle(&bytes, user_id.as_bytes())).ok()
}

fn xor_cycle(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(key.iter().cycle())
        .map(|(byte, key_byte)| byte ^ key_byte)
        .collect()
}
