//! The inbox: live in-memory projection of the message store.
//!
//! Readers see two partitions (`unread`, `read`) plus a tombstone set, all
//! guarded by a single mutex. Mutations apply optimistically in memory, then
//! flow to the durable store on a serialized write lane; the sync engine
//! reads the store, never this cache, to decide what to push. Listener
//! notification is asynchronous and coalesced on a dedicated notifier task.

pub mod fetch;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

use crate::config::InboxConfig;
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::inbox::fetch::{FetchCoordinator, FetchHandle};
use crate::message::{display_order, Message};
use crate::remote::{InboxApiClient, InboxRemote};
use crate::store::MessageStore;
use crate::sync::engine::{ChannelSource, SyncEngine};
use crate::sync::jobs::{ConflictPolicy, JobDispatcher, JobKind};

/// Lifecycle events delivered by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    Foreground,
    Background,
}

/// Handle for a registered inbox listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type InboxListener = Arc<dyn Fn() + Send + Sync>;

enum StoreWrite {
    MarkRead(Vec<String>),
    MarkUnread(Vec<String>),
    MarkDeleted(Vec<String>),
    #[cfg(test)]
    Flush(tokio::sync::oneshot::Sender<()>),
}

#[derive(Default)]
struct CacheState {
    unread: HashMap<String, Message>,
    read: HashMap<String, Message>,
    deleted_ids: HashSet<String>,
    /// Body URL to message id.
    url_index: HashMap<String, String>,
}

/// The device's local inbox.
pub struct Inbox {
    store: Arc<MessageStore>,
    credentials: Arc<CredentialStore>,
    dispatcher: JobDispatcher,
    coordinator: Arc<FetchCoordinator>,
    state: Mutex<CacheState>,
    listeners: Mutex<HashMap<u64, InboxListener>>,
    next_listener_id: AtomicU64,
    notify_tx: flume::Sender<()>,
    write_tx: flume::Sender<StoreWrite>,
}

impl Inbox {
    /// Opens an inbox against the production API client and spawns its sync
    /// worker. Call from within a tokio runtime.
    pub fn open(config: InboxConfig, channel: Arc<dyn ChannelSource>) -> Result<Arc<Inbox>> {
        let store = Arc::new(MessageStore::new(&config.db_path)?);
        let remote: Arc<dyn InboxRemote> = Arc::new(InboxApiClient::new(&config)?);
        Self::open_with_remote(store, remote, channel)
    }

    /// Opens an inbox with an injected remote (testing, alternate transports).
    pub fn open_with_remote(
        store: Arc<MessageStore>,
        remote: Arc<dyn InboxRemote>,
        channel: Arc<dyn ChannelSource>,
    ) -> Result<Arc<Inbox>> {
        let credentials = Arc::new(CredentialStore::new(store.clone()));
        let (dispatcher, runner) = JobDispatcher::new();
        let coordinator = Arc::new(FetchCoordinator::new(dispatcher.clone()));

        let inbox = Inbox::new(
            store.clone(),
            credentials.clone(),
            dispatcher.clone(),
            coordinator.clone(),
        );
        inbox.refresh(false)?;

        let engine = Arc::new(SyncEngine::new(
            store,
            credentials,
            remote,
            channel,
            inbox.clone(),
            coordinator,
            dispatcher,
        ));
        let _ = runner.spawn(engine);

        Ok(inbox)
    }

    /// Builds the inbox and spawns its write lane and notifier tasks.
    pub(crate) fn new(
        store: Arc<MessageStore>,
        credentials: Arc<CredentialStore>,
        dispatcher: JobDispatcher,
        coordinator: Arc<FetchCoordinator>,
    ) -> Arc<Inbox> {
        let (notify_tx, notify_rx) = flume::unbounded();
        let (write_tx, write_rx) = flume::unbounded();

        let inbox = Arc::new(Inbox {
            store: store.clone(),
            credentials,
            dispatcher,
            coordinator,
            state: Mutex::new(CacheState::default()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            notify_tx,
            write_tx,
        });

        // Serialized store-write lane for cache mutations.
        tokio::spawn(async move {
            while let Ok(write) = write_rx.recv_async().await {
                let result = match write {
                    StoreWrite::MarkRead(ids) => store.set_unread(&ids, false),
                    StoreWrite::MarkUnread(ids) => store.set_unread(&ids, true),
                    StoreWrite::MarkDeleted(ids) => store.set_deleted(&ids, true),
                    #[cfg(test)]
                    StoreWrite::Flush(done) => {
                        let _ = done.send(());
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    error!("Inbox store write failed: {}", e);
                }
            }
        });

        // Notifier task: coalesces bursts into one delivery per listener.
        let weak = Arc::downgrade(&inbox);
        tokio::spawn(async move {
            while notify_rx.recv_async().await.is_ok() {
                while notify_rx.try_recv().is_ok() {}
                let Some(inbox) = weak.upgrade() else { break };
                let listeners: Vec<InboxListener> = {
                    let listeners = inbox.listeners.lock().expect("listener lock poisoned");
                    listeners.values().cloned().collect()
                };
                for listener in listeners {
                    listener();
                }
            }
        });

        inbox
    }

    // ========== Queries ==========

    /// All messages, display-sorted.
    pub fn messages(&self) -> Vec<Message> {
        self.messages_where(|_| true)
    }

    /// Messages matching the predicate, display-sorted.
    pub fn messages_where(&self, predicate: impl Fn(&Message) -> bool) -> Vec<Message> {
        let now = Utc::now();
        let state = self.state.lock().expect("inbox lock poisoned");
        let mut messages: Vec<Message> = state
            .unread
            .values()
            .chain(state.read.values())
            .filter(|m| !m.is_expired(now) && predicate(m))
            .cloned()
            .collect();
        drop(state);
        messages.sort_by(display_order);
        messages
    }

    /// Unread messages, display-sorted.
    pub fn unread_messages(&self) -> Vec<Message> {
        self.unread_messages_where(|_| true)
    }

    pub fn unread_messages_where(&self, predicate: impl Fn(&Message) -> bool) -> Vec<Message> {
        self.partition_where(true, predicate)
    }

    /// Read messages, display-sorted.
    pub fn read_messages(&self) -> Vec<Message> {
        self.read_messages_where(|_| true)
    }

    pub fn read_messages_where(&self, predicate: impl Fn(&Message) -> bool) -> Vec<Message> {
        self.partition_where(false, predicate)
    }

    fn partition_where(
        &self,
        unread: bool,
        predicate: impl Fn(&Message) -> bool,
    ) -> Vec<Message> {
        let now = Utc::now();
        let state = self.state.lock().expect("inbox lock poisoned");
        let partition = if unread { &state.unread } else { &state.read };
        let mut messages: Vec<Message> = partition
            .values()
            .filter(|m| !m.is_expired(now) && predicate(m))
            .cloned()
            .collect();
        drop(state);
        messages.sort_by(display_order);
        messages
    }

    /// One message by id, or `None` if unknown or tombstoned.
    pub fn message(&self, message_id: &str) -> Option<Message> {
        let state = self.state.lock().expect("inbox lock poisoned");
        state
            .unread
            .get(message_id)
            .or_else(|| state.read.get(message_id))
            .cloned()
    }

    /// One message by body URL.
    pub fn message_by_body_url(&self, body_url: &str) -> Option<Message> {
        let state = self.state.lock().expect("inbox lock poisoned");
        let id = state.url_index.get(body_url)?;
        state
            .unread
            .get(id)
            .or_else(|| state.read.get(id))
            .cloned()
    }

    /// Ids of every non-tombstoned message.
    pub fn message_ids(&self) -> Vec<String> {
        let state = self.state.lock().expect("inbox lock poisoned");
        state
            .unread
            .keys()
            .chain(state.read.keys())
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        let state = self.state.lock().expect("inbox lock poisoned");
        state.unread.len() + state.read.len()
    }

    pub fn unread_count(&self) -> usize {
        self.state.lock().expect("inbox lock poisoned").unread.len()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().expect("inbox lock poisoned").read.len()
    }

    // ========== Mutations ==========

    /// Mark messages read. Unknown ids are skipped; one notification per call.
    pub fn mark_read(&self, message_ids: &[String]) {
        if message_ids.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock().expect("inbox lock poisoned");
            for id in message_ids {
                if let Some(mut message) = state.unread.remove(id) {
                    message.unread = false;
                    state.read.insert(id.clone(), message);
                }
            }
        }

        self.submit_write(StoreWrite::MarkRead(message_ids.to_vec()));
        self.schedule_notification();
    }

    /// Mark messages unread.
    pub fn mark_unread(&self, message_ids: &[String]) {
        if message_ids.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock().expect("inbox lock poisoned");
            for id in message_ids {
                if let Some(mut message) = state.read.remove(id) {
                    message.unread = true;
                    state.unread.insert(id.clone(), message);
                }
            }
        }

        self.submit_write(StoreWrite::MarkUnread(message_ids.to_vec()));
        self.schedule_notification();
    }

    /// Tombstone messages. They disappear from queries immediately; the rows
    /// stay in the store until the server confirms the deletion.
    pub fn delete(&self, message_ids: &[String]) {
        if message_ids.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock().expect("inbox lock poisoned");
            for id in message_ids {
                let mut message = state.unread.remove(id);
                if message.is_none() {
                    message = state.read.remove(id);
                }
                if let Some(message) = message {
                    state.url_index.remove(&message.body_url);
                    state.deleted_ids.insert(id.clone());
                }
            }
        }

        self.submit_write(StoreWrite::MarkDeleted(message_ids.to_vec()));
        self.schedule_notification();
    }

    // ========== Reprojection ==========

    /// Rebuild the partitions from the store's active rows.
    ///
    /// Local mutations that raced ahead of the last store write win: ids the
    /// cache already considered unread, read or deleted keep that state even
    /// when the freshly read row disagrees.
    pub fn refresh(&self, notify: bool) -> Result<()> {
        // Store IO happens before the lock is taken.
        let records = self.store.get_active(Utc::now())?;

        {
            let mut state = self.state.lock().expect("inbox lock poisoned");

            let previous_unread: HashSet<String> = state.unread.keys().cloned().collect();
            let previous_read: HashSet<String> = state.read.keys().cloned().collect();

            state.unread.clear();
            state.read.clear();
            state.url_index.clear();

            for record in records {
                let Some(mut message) = record.to_message() else {
                    warn!(message_id = %record.message_id, "Dropping undecodable stored row");
                    continue;
                };

                if message.deleted || state.deleted_ids.contains(&message.id) {
                    state.deleted_ids.insert(message.id);
                    continue;
                }

                state
                    .url_index
                    .insert(message.body_url.clone(), message.id.clone());

                // Pending local mark read/unread still in flight to the store.
                if previous_unread.contains(&message.id) {
                    message.unread = true;
                    state.unread.insert(message.id.clone(), message);
                } else if previous_read.contains(&message.id) {
                    message.unread = false;
                    state.read.insert(message.id.clone(), message);
                } else if message.unread {
                    state.unread.insert(message.id.clone(), message);
                } else {
                    state.read.insert(message.id.clone(), message);
                }
            }
        }

        if notify {
            self.schedule_notification();
        }
        Ok(())
    }

    // ========== Listeners ==========

    /// Subscribe to inbox-updated notifications.
    pub fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .insert(id, Arc::new(listener));
        ListenerId(id)
    }

    /// Unsubscribe a listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .remove(&id.0);
    }

    fn schedule_notification(&self) {
        let _ = self.notify_tx.send(());
    }

    // ========== Fetch & lifecycle ==========

    /// Request a refresh from the server. Concurrent requests coalesce into
    /// one sync; the callback receives that sync's outcome.
    pub fn fetch_messages(&self, callback: impl FnOnce(bool) + Send + 'static) -> FetchHandle {
        self.coordinator.request_fetch(callback)
    }

    /// The current message-center user id, for hosts that inject it into
    /// channel-registration payloads.
    pub fn user_id(&self) -> Result<Option<String>> {
        self.credentials.user_id()
    }

    /// App entered the foreground: refresh the message list.
    pub fn handle_foreground(&self) {
        self.dispatcher
            .dispatch(JobKind::UpdateMessages, ConflictPolicy::Keep);
    }

    /// App entered the background: push local read/delete state.
    pub fn handle_background(&self) {
        self.dispatcher
            .dispatch(JobKind::SyncMessageState, ConflictPolicy::Keep);
    }

    /// The device channel was created: associate the user with it.
    pub fn handle_channel_created(&self) {
        debug!("Channel created, updating user");
        self.dispatcher
            .dispatch(JobKind::UpdateUser { forcefully: true }, ConflictPolicy::Replace);
    }

    /// Spawn a task mapping host lifecycle events to sync jobs.
    pub fn attach_lifecycle(self: &Arc<Self>, events: flume::Receiver<AppEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let Some(inbox) = weak.upgrade() else { break };
                match event {
                    AppEvent::Foreground => inbox.handle_foreground(),
                    AppEvent::Background => inbox.handle_background(),
                }
            }
        });
    }

    fn submit_write(&self, write: StoreWrite) {
        if self.write_tx.send(write).is_err() {
            error!("Inbox write lane is gone");
        }
    }

    /// Wait for every queued store write to land (test hook).
    #[cfg(test)]
    pub(crate) async fn flush_writes(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit_write(StoreWrite::Flush(tx));
        let _ = rx.await;
    }
}
