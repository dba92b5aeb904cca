//! Message model.
//!
//! A [`Message`] is an immutable snapshot of one server message plus the two
//! locally-owned flags (`unread`, `deleted`). Instances are built either from
//! a server listing entry or from a stored row; mutation happens through the
//! inbox, never on the snapshot itself.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

// Listing entry JSON keys.
pub(crate) const MESSAGE_ID_KEY: &str = "message_id";
pub(crate) const MESSAGE_URL_KEY: &str = "message_url";
pub(crate) const MESSAGE_BODY_URL_KEY: &str = "message_body_url";
pub(crate) const MESSAGE_READ_URL_KEY: &str = "message_read_url";
pub(crate) const MESSAGE_SENT_KEY: &str = "message_sent";
pub(crate) const MESSAGE_EXPIRY_KEY: &str = "message_expiry";
pub(crate) const MESSAGE_REPORTING_KEY: &str = "message_reporting";
pub(crate) const TITLE_KEY: &str = "title";
pub(crate) const UNREAD_KEY: &str = "unread";
pub(crate) const EXTRA_KEY: &str = "extra";

/// One inbox message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Globally unique message id.
    pub id: String,
    /// Message title.
    pub title: String,
    /// URL of the message body.
    pub body_url: String,
    /// URL used to mark the message read on the server.
    pub read_url: String,
    /// Canonical message URL, when the server supplied one.
    pub message_url: Option<String>,
    /// When the message was sent.
    pub sent: DateTime<Utc>,
    /// When the message expires, if ever.
    pub expiry: Option<DateTime<Utc>>,
    /// String-valued extras attached by the sender.
    pub extras: BTreeMap<String, String>,
    /// Opaque reporting payload, echoed verbatim in read/delete pushes.
    pub reporting: Option<Value>,
    /// The raw listing entry, kept for fields not otherwise modeled.
    pub raw: Value,
    /// Client-side read state. May diverge from the server until synced.
    pub unread: bool,
    /// Tombstone flag; the row survives until the server confirms deletion.
    pub deleted: bool,
}

impl Message {
    /// Builds a message from a server listing entry.
    ///
    /// Returns `None` when the entry is missing its id, body URL or read URL;
    /// callers drop the entry and continue with the rest of the listing.
    pub fn from_payload(payload: &Value) -> Option<Message> {
        let map = payload.as_object()?;

        let id = map.get(MESSAGE_ID_KEY)?.as_str()?.to_string();
        let body_url = map.get(MESSAGE_BODY_URL_KEY)?.as_str()?.to_string();
        let read_url = map.get(MESSAGE_READ_URL_KEY)?.as_str()?.to_string();

        let title = map
            .get(TITLE_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message_url = map
            .get(MESSAGE_URL_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);

        let sent = map
            .get(MESSAGE_SENT_KEY)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        let expiry = map
            .get(MESSAGE_EXPIRY_KEY)
            .and_then(Value::as_str)
            .and_then(parse_timestamp);

        let mut extras = BTreeMap::new();
        if let Some(extra) = map.get(EXTRA_KEY).and_then(Value::as_object) {
            for (key, value) in extra {
                match value.as_str() {
                    Some(s) => {
                        extras.insert(key.clone(), s.to_string());
                    }
                    None => debug!(key, "Dropping non-string extra"),
                }
            }
        }

        // The server's read flag seeds the client flag; a stale echo never
        // overwrites local state after that (the store merge keeps local flags).
        let unread = map.get(UNREAD_KEY).and_then(Value::as_bool).unwrap_or(true);

        Some(Message {
            id,
            title,
            body_url,
            read_url,
            message_url,
            sent,
            expiry,
            extras,
            reporting: map.get(MESSAGE_REPORTING_KEY).cloned(),
            raw: payload.clone(),
            unread,
            deleted: false,
        })
    }

    /// Whether the message has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }
}

/// Display order: descending sent time, ascending id on ties.
///
/// The id tie-break makes the order total, so repeated queries over messages
/// with identical timestamps always agree.
pub fn display_order(a: &Message, b: &Message) -> Ordering {
    b.sent.cmp(&a.sent).then_with(|| a.id.cmp(&b.id))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
