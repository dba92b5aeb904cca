//! Local message-inbox synchronization engine.
//!
//! Keeps an on-device cache of server-delivered messages consistent with a
//! remote message-center store. The inbox holds a thread-safe in-memory
//! projection (unread/read partitions plus tombstones) over a durable SQLite
//! store; a background sync engine reconciles local read/delete state against
//! the server in three idempotent passes and manages the anonymous per-install
//! user identity.
//!
//! ```no_run
//! use std::sync::Arc;
//! use message_center::{ChannelSource, Inbox, InboxConfig};
//!
//! struct Channel;
//! impl ChannelSource for Channel {
//!     fn channel_id(&self) -> Option<String> {
//!         Some("channel-id".to_string())
//!     }
//! }
//!
//! # async fn open() -> message_center::Result<()> {
//! let config = InboxConfig {
//!     app_key: "app_key".into(),
//!     app_secret: "app_secret".into(),
//!     ..Default::default()
//! };
//! let inbox = Inbox::open(config, Arc::new(Channel))?;
//!
//! inbox.add_listener(|| println!("inbox updated"));
//! inbox.fetch_messages(|success| println!("refresh finished: {success}"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod inbox;
pub mod message;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::InboxConfig;
pub use credentials::UserCredentials;
pub use error::{Error, Result};
pub use inbox::fetch::{FetchCoordinator, FetchHandle};
pub use inbox::{AppEvent, Inbox, ListenerId};
pub use message::Message;
pub use remote::{InboxApiClient, InboxRemote, MessageListResponse};
pub use store::{MessageRecord, MessageStore};
pub use sync::engine::{ChannelSource, SyncEngine};
pub use sync::jobs::{ConflictPolicy, JobDispatcher, JobKind, JobRunner};
