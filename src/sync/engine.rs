//! Sync engine.
//!
//! Reconciles the local store against the server in three independently
//! retriable passes: list-and-merge, push local reads, push local deletes.
//! Also owns the user identity lifecycle (create, 24 h refresh, 401
//! self-heal). Every pass collapses to a boolean at this boundary; callers
//! only learn whether the refresh they asked for succeeded.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialStore, UserCredentials};
use crate::error::Result;
use crate::inbox::fetch::FetchCoordinator;
use crate::inbox::Inbox;
use crate::message::Message;
use crate::remote::InboxRemote;
use crate::store::{MessageRecord, MessageStore};
use crate::sync::jobs::{ConflictPolicy, JobDispatcher, JobKind};

/// Provider of the current device channel id.
pub trait ChannelSource: Send + Sync {
    /// The current channel id; `None` (or empty) until registration finishes.
    fn channel_id(&self) -> Option<String>;
}

const LAST_MESSAGE_REFRESH_KEY: &str = "messages.last_refresh";

/// One sync engine instance per process, constructed at startup and threaded
/// through to the components that need it.
pub struct SyncEngine {
    store: Arc<MessageStore>,
    credentials: Arc<CredentialStore>,
    remote: Arc<dyn InboxRemote>,
    channel: Arc<dyn ChannelSource>,
    inbox: Arc<Inbox>,
    coordinator: Arc<FetchCoordinator>,
    dispatcher: JobDispatcher,
}

impl SyncEngine {
    pub fn new(
        store: Arc<MessageStore>,
        credentials: Arc<CredentialStore>,
        remote: Arc<dyn InboxRemote>,
        channel: Arc<dyn ChannelSource>,
        inbox: Arc<Inbox>,
        coordinator: Arc<FetchCoordinator>,
        dispatcher: JobDispatcher,
    ) -> Self {
        Self {
            store,
            credentials,
            remote,
            channel,
            inbox,
            coordinator,
            dispatcher,
        }
    }

    /// Run one dispatched job.
    pub async fn perform(&self, job: JobKind) {
        match job {
            JobKind::UpdateMessages => self.on_update_messages().await,
            JobKind::SyncMessageState => self.on_sync_message_state().await,
            JobKind::UpdateUser { forcefully } => {
                self.on_update_user(forcefully).await;
            }
        }
    }

    /// Full refresh: ensure the user exists, list-and-merge, reproject the
    /// inbox, complete pending fetch callbacks, then push local state.
    async fn on_update_messages(&self) {
        let credentials = match self.current_or_created_user().await {
            Some(credentials) => credentials,
            None => {
                debug!("User has not been created, canceling messages update");
                self.coordinator.complete(false);
                return;
            }
        };

        let success = self.update_messages(&credentials).await;

        if let Err(e) = self.inbox.refresh(true) {
            warn!("Inbox reprojection failed: {}", e);
        }
        self.coordinator.complete(success);

        self.sync_read_state(&credentials).await;
        self.sync_deleted_state(&credentials).await;
    }

    /// Push-only sync, run on app background.
    async fn on_sync_message_state(&self) {
        let credentials = match self.credentials.credentials() {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                debug!("User has not been created, canceling state sync");
                return;
            }
            Err(e) => {
                warn!("Failed to load credentials: {}", e);
                return;
            }
        };

        self.sync_read_state(&credentials).await;
        self.sync_deleted_state(&credentials).await;
    }

    /// Create or refresh the user identity.
    pub(crate) async fn on_update_user(&self, forcefully: bool) -> bool {
        if !forcefully {
            let channel_id = self.channel_id().unwrap_or_default();
            match self.credentials.requires_update(&channel_id, Utc::now()) {
                Ok(false) => {
                    debug!("User already up to date");
                    return true;
                }
                Ok(true) => {}
                Err(e) => warn!("Failed to check user freshness: {}", e),
            }
        }

        let success = match self.credentials.credentials() {
            Ok(None) => self.create_user().await,
            Ok(Some(credentials)) => self.update_user(&credentials).await,
            Err(e) => {
                warn!("Failed to load credentials: {}", e);
                false
            }
        };

        // A fresh identity has messages to fetch.
        if success {
            self.dispatcher
                .dispatch(JobKind::UpdateMessages, ConflictPolicy::Replace);
        }

        success
    }

    // ========== Pass A: list & merge ==========

    /// Fetch the message listing and merge it into the store.
    pub(crate) async fn update_messages(&self, credentials: &UserCredentials) -> bool {
        info!("Refreshing inbox messages");

        let Some(channel_id) = self.channel_id() else {
            debug!("The channel ID does not exist");
            return false;
        };

        let watermark = match self.store.get_pref(LAST_MESSAGE_REFRESH_KEY) {
            Ok(watermark) => watermark,
            Err(e) => {
                warn!("Failed to read fetch watermark: {}", e);
                None
            }
        };

        let response = match self
            .remote
            .fetch_messages(credentials, &channel_id, watermark.as_deref())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("Update messages failed: {}", e);
                return false;
            }
        };

        match response.status {
            304 => {
                debug!("Inbox messages already up to date");
                true
            }
            200..=299 => {
                info!(count = response.messages.len(), "Received inbox messages");
                if let Err(e) = self.merge_listing(&response.messages) {
                    warn!("Failed to merge message listing: {}", e);
                    return false;
                }
                // The watermark advances only on a merged listing.
                if let Some(last_modified) = &response.last_modified {
                    if let Err(e) = self.store.set_pref(LAST_MESSAGE_REFRESH_KEY, last_modified) {
                        warn!("Failed to record fetch watermark: {}", e);
                    }
                }
                true
            }
            status => {
                debug!(status, "Unable to update inbox messages");
                false
            }
        }
    }

    /// Upsert listed messages and prune stored ids the server no longer
    /// lists. Entries missing required fields are dropped individually.
    fn merge_listing(&self, entries: &[Value]) -> Result<()> {
        let mut records = Vec::with_capacity(entries.len());
        let mut server_ids = HashSet::new();

        for entry in entries {
            match Message::from_payload(entry) {
                Some(message) => {
                    server_ids.insert(message.id.clone());
                    records.push(MessageRecord::from_message(&message));
                }
                None => warn!(%entry, "Invalid message payload, dropping entry"),
            }
        }

        self.store.upsert_messages(&records)?;

        let absent: Vec<String> = self
            .store
            .get_ids()?
            .into_iter()
            .filter(|id| !server_ids.contains(id))
            .collect();
        self.store.delete_messages(&absent)?;

        Ok(())
    }

    // ========== Pass B: push local reads ==========

    /// Push locally-read messages to the server. Flags flip only on an
    /// explicit 200; anything else leaves the rows pending for retry.
    pub(crate) async fn sync_read_state(&self, credentials: &UserCredentials) -> bool {
        let Some(channel_id) = self.channel_id() else {
            return false;
        };

        let rows = match self.store.get_locally_read() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to query locally read messages: {}", e);
                return false;
            }
        };

        let (ids, reportings) = reportable(rows);
        if ids.is_empty() {
            return true;
        }

        debug!(count = ids.len(), "Found messages to mark read");

        match self
            .remote
            .sync_read_state(credentials, &channel_id, &reportings)
            .await
        {
            Ok(200) => match self.store.set_unread_orig(&ids, false) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to record read confirmations: {}", e);
                    false
                }
            },
            Ok(status) => {
                debug!(status, "Mark messages read declined");
                false
            }
            Err(e) => {
                debug!("Read message state synchronize failed: {}", e);
                false
            }
        }
    }

    // ========== Pass C: push local deletes ==========

    /// Push tombstoned messages to the server. Rows are physically removed
    /// only on an explicit 200; otherwise the tombstones stay (and stay
    /// excluded from queries) until the next attempt.
    pub(crate) async fn sync_deleted_state(&self, credentials: &UserCredentials) -> bool {
        let Some(channel_id) = self.channel_id() else {
            return false;
        };

        let rows = match self.store.get_locally_deleted() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to query locally deleted messages: {}", e);
                return false;
            }
        };

        let (ids, reportings) = reportable(rows);
        if ids.is_empty() {
            return true;
        }

        debug!(count = ids.len(), "Found messages to delete");

        match self
            .remote
            .sync_deleted_state(credentials, &channel_id, &reportings)
            .await
        {
            Ok(200) => match self.store.delete_messages(&ids) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to remove confirmed deletions: {}", e);
                    false
                }
            },
            Ok(status) => {
                debug!(status, "Delete messages declined");
                false
            }
            Err(e) => {
                debug!("Deleted message state synchronize failed: {}", e);
                false
            }
        }
    }

    // ========== Identity ==========

    /// Create a new user bound to the current channel. A new identity starts
    /// with a clean listing history, so the fetch watermark is reset.
    pub(crate) async fn create_user(&self) -> bool {
        let Some(channel_id) = self.channel_id() else {
            debug!("No channel. User will be created after channel registration finishes");
            return false;
        };

        let user = match self.remote.create_user(&channel_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!("User creation declined by server");
                return false;
            }
            Err(e) => {
                debug!("User creation failed: {}", e);
                return false;
            }
        };

        info!(user_id = %user.user_id, "Created message-center user");

        if let Err(e) = self.store.remove_pref(LAST_MESSAGE_REFRESH_KEY) {
            warn!("Failed to reset fetch watermark: {}", e);
        }
        match self
            .credentials
            .on_created(&user.user_id, &user.token, &channel_id)
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist new user: {}", e);
                false
            }
        }
    }

    /// Associate the current channel with the existing user. A 401 means the
    /// identity was revoked; self-heal by creating a fresh one in the same
    /// operation.
    pub(crate) async fn update_user(&self, credentials: &UserCredentials) -> bool {
        let Some(channel_id) = self.channel_id() else {
            debug!("No channel. Skipping user update");
            return false;
        };

        match self.remote.update_user(credentials, &channel_id).await {
            Ok(200) => {
                info!("Message-center user updated");
                match self.credentials.on_updated(&channel_id) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Failed to record user update: {}", e);
                        false
                    }
                }
            }
            Ok(401) => {
                debug!("User no longer authorized, re-creating");
                if let Err(e) = self.credentials.reset_update_clock() {
                    warn!("Failed to reset user update clock: {}", e);
                }
                self.create_user().await
            }
            Ok(status) => {
                debug!(status, "User update declined");
                if let Err(e) = self.credentials.reset_update_clock() {
                    warn!("Failed to reset user update clock: {}", e);
                }
                false
            }
            Err(e) => {
                debug!("User update failed: {}", e);
                false
            }
        }
    }

    async fn current_or_created_user(&self) -> Option<UserCredentials> {
        match self.credentials.credentials() {
            Ok(Some(credentials)) => return Some(credentials),
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to load credentials: {}", e);
                return None;
            }
        }

        if !self.create_user().await {
            return None;
        }
        self.credentials.credentials().ok().flatten()
    }

    fn channel_id(&self) -> Option<String> {
        self.channel.channel_id().filter(|id| !id.is_empty())
    }
}

/// Splits rows into pushable ids and their reporting payloads. Rows without
/// a reporting payload cannot be confirmed through the current API and stay
/// pending locally.
fn reportable(rows: Vec<MessageRecord>) -> (Vec<String>, Vec<Value>) {
    let mut ids = Vec::with_capacity(rows.len());
    let mut reportings = Vec::with_capacity(rows.len());
    for row in rows {
        match row.reporting {
            Some(reporting) => {
                ids.push(row.message_id);
                reportings.push(reporting);
            }
            None => debug!(message_id = %row.message_id, "Row has no reporting payload, skipping"),
        }
    }
    (ids, reportings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::remote::MessageListResponse;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedChannel(Option<String>);

    impl ChannelSource for FixedChannel {
        fn channel_id(&self) -> Option<String> {
            self.0.clone()
        }
    }

    /// Scripted in-memory remote.
    #[derive(Default)]
    struct FakeRemote {
        listings: Mutex<VecDeque<Result<MessageListResponse>>>,
        list_calls: AtomicUsize,
        read_status: Mutex<Option<Result<u16>>>,
        read_calls: AtomicUsize,
        read_payloads: Mutex<Vec<Vec<Value>>>,
        delete_status: Mutex<Option<Result<u16>>>,
        delete_calls: AtomicUsize,
        create_result: Mutex<Option<UserCredentials>>,
        create_calls: AtomicUsize,
        update_status: Mutex<Option<Result<u16>>>,
        update_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl InboxRemote for FakeRemote {
        async fn fetch_messages(
            &self,
            _credentials: &UserCredentials,
            _channel_id: &str,
            _if_modified_since: Option<&str>,
        ) -> Result<MessageListResponse> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.listings
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(Error::Network("no scripted listing".to_string())))
        }

        async fn sync_read_state(
            &self,
            _credentials: &UserCredentials,
            _channel_id: &str,
            reportings: &[Value],
        ) -> Result<u16> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            self.read_payloads.lock().unwrap().push(reportings.to_vec());
            self.read_status.lock().unwrap().clone().unwrap_or(Ok(200))
        }

        async fn sync_deleted_state(
            &self,
            _credentials: &UserCredentials,
            _channel_id: &str,
            _reportings: &[Value],
        ) -> Result<u16> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            self.delete_status.lock().unwrap().clone().unwrap_or(Ok(200))
        }

        async fn create_user(&self, _channel_id: &str) -> Result<Option<UserCredentials>> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.create_result.lock().unwrap().clone())
        }

        async fn update_user(
            &self,
            _credentials: &UserCredentials,
            _channel_id: &str,
        ) -> Result<u16> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            self.update_status.lock().unwrap().clone().unwrap_or(Ok(200))
        }
    }

    struct Harness {
        engine: SyncEngine,
        store: Arc<MessageStore>,
        credentials: Arc<CredentialStore>,
        remote: Arc<FakeRemote>,
        runner: crate::sync::jobs::JobRunner,
    }

    fn harness(channel: Option<&str>) -> Harness {
        let store = Arc::new(MessageStore::in_memory().unwrap());
        let credentials = Arc::new(CredentialStore::new(store.clone()));
        let remote = Arc::new(FakeRemote::default());
        let (dispatcher, runner) = JobDispatcher::new();
        let coordinator = Arc::new(FetchCoordinator::new(dispatcher.clone()));
        let inbox = Inbox::new(
            store.clone(),
            credentials.clone(),
            dispatcher.clone(),
            coordinator.clone(),
        );
        let engine = SyncEngine::new(
            store.clone(),
            credentials.clone(),
            remote.clone(),
            Arc::new(FixedChannel(channel.map(str::to_string))),
            inbox,
            coordinator,
            dispatcher,
        );
        Harness {
            engine,
            store,
            credentials,
            remote,
            runner,
        }
    }

    fn entry(id: &str) -> Value {
        json!({
            "message_id": id,
            "message_body_url": format!("https://example.com/{id}/body/"),
            "message_read_url": format!("https://example.com/{id}/read/"),
            "message_sent": "2024-03-01T10:00:00Z",
            "title": id,
            "unread": true,
            "message_reporting": { "sent_id": id }
        })
    }

    fn listing(entries: Vec<Value>, last_modified: &str) -> Result<MessageListResponse> {
        Ok(MessageListResponse {
            status: 200,
            messages: entries,
            last_modified: Some(last_modified.to_string()),
        })
    }

    fn user() -> UserCredentials {
        UserCredentials {
            user_id: "some_user_id".to_string(),
            token: "token".to_string(),
        }
    }

    fn seed_user(h: &Harness) {
        h.credentials
            .on_created("some_user_id", "token", "channel")
            .unwrap();
    }

    fn stored_ids(store: &MessageStore) -> Vec<String> {
        let mut ids = store.get_ids().unwrap();
        ids.sort();
        ids
    }

    // ----- Pass A -----

    #[tokio::test]
    async fn test_update_messages_merges_and_prunes() {
        let h = harness(Some("channel"));
        seed_user(&h);

        // m_old is no longer listed by the server.
        h.store
            .upsert_messages(&[MessageRecord::from_message(
                &Message::from_payload(&entry("m_old")).unwrap(),
            )])
            .unwrap();

        h.remote
            .listings
            .lock()
            .unwrap()
            .push_back(listing(vec![entry("m1"), entry("m2")], "lm-1"));

        assert!(h.engine.update_messages(&user()).await);
        assert_eq!(stored_ids(&h.store), ["m1", "m2"]);
        assert_eq!(
            h.store.get_pref(LAST_MESSAGE_REFRESH_KEY).unwrap().as_deref(),
            Some("lm-1")
        );
    }

    #[tokio::test]
    async fn test_update_messages_merge_is_idempotent() {
        let h = harness(Some("channel"));
        seed_user(&h);

        for _ in 0..2 {
            h.remote
                .listings
                .lock()
                .unwrap()
                .push_back(listing(vec![entry("m1"), entry("m2")], "lm-1"));
            assert!(h.engine.update_messages(&user()).await);
        }
        assert_eq!(stored_ids(&h.store), ["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_update_messages_preserves_local_state() {
        let h = harness(Some("channel"));
        seed_user(&h);

        h.remote
            .listings
            .lock()
            .unwrap()
            .push_back(listing(vec![entry("m1")], "lm-1"));
        assert!(h.engine.update_messages(&user()).await);

        h.store.set_unread(&["m1".to_string()], false).unwrap();

        // The next listing still echoes m1 as unread; the local flag wins.
        h.remote
            .listings
            .lock()
            .unwrap()
            .push_back(listing(vec![entry("m1")], "lm-2"));
        assert!(h.engine.update_messages(&user()).await);

        let m1 = h.store.get("m1").unwrap().unwrap();
        assert!(!m1.unread);
        assert!(m1.unread_orig);
    }

    #[tokio::test]
    async fn test_update_messages_drops_invalid_entries() {
        let h = harness(Some("channel"));
        seed_user(&h);

        let missing_id = json!({
            "message_body_url": "https://example.com/x/body/",
            "message_read_url": "https://example.com/x/read/",
        });
        h.remote
            .listings
            .lock()
            .unwrap()
            .push_back(listing(vec![missing_id, entry("m1")], "lm-1"));

        assert!(h.engine.update_messages(&user()).await);
        assert_eq!(stored_ids(&h.store), ["m1"]);
    }

    #[tokio::test]
    async fn test_update_messages_not_modified() {
        let h = harness(Some("channel"));
        seed_user(&h);
        h.store.set_pref(LAST_MESSAGE_REFRESH_KEY, "lm-1").unwrap();
        h.store
            .upsert_messages(&[MessageRecord::from_message(
                &Message::from_payload(&entry("m1")).unwrap(),
            )])
            .unwrap();

        h.remote.listings.lock().unwrap().push_back(Ok(MessageListResponse {
            status: 304,
            messages: vec![],
            last_modified: None,
        }));

        assert!(h.engine.update_messages(&user()).await);
        // No mutation, watermark untouched.
        assert_eq!(stored_ids(&h.store), ["m1"]);
        assert_eq!(
            h.store.get_pref(LAST_MESSAGE_REFRESH_KEY).unwrap().as_deref(),
            Some("lm-1")
        );
    }

    #[tokio::test]
    async fn test_update_messages_transport_failure_changes_nothing() {
        let h = harness(Some("channel"));
        seed_user(&h);
        h.store.set_pref(LAST_MESSAGE_REFRESH_KEY, "lm-1").unwrap();
        h.store
            .upsert_messages(&[MessageRecord::from_message(
                &Message::from_payload(&entry("m1")).unwrap(),
            )])
            .unwrap();

        h.remote
            .listings
            .lock()
            .unwrap()
            .push_back(Err(Error::Network("unreachable".to_string())));

        assert!(!h.engine.update_messages(&user()).await);
        assert_eq!(stored_ids(&h.store), ["m1"]);
        assert_eq!(
            h.store.get_pref(LAST_MESSAGE_REFRESH_KEY).unwrap().as_deref(),
            Some("lm-1")
        );
    }

    #[tokio::test]
    async fn test_update_messages_requires_channel() {
        let h = harness(None);
        seed_user(&h);

        assert!(!h.engine.update_messages(&user()).await);
        assert_eq!(h.remote.list_calls.load(Ordering::SeqCst), 0);
    }

    // ----- Pass B -----

    #[tokio::test]
    async fn test_sync_read_state_pushes_reportings() {
        let h = harness(Some("channel"));
        seed_user(&h);
        h.store
            .upsert_messages(&[
                MessageRecord::from_message(&Message::from_payload(&entry("m1")).unwrap()),
                MessageRecord::from_message(&Message::from_payload(&entry("m2")).unwrap()),
            ])
            .unwrap();
        h.store
            .set_unread(&["m1".to_string(), "m2".to_string()], false)
            .unwrap();

        assert!(h.engine.sync_read_state(&user()).await);

        // The batch carried the reporting payloads, not the ids.
        let payloads = h.remote.read_payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains(&json!({ "sent_id": "m1" })));
        assert!(payloads[0].contains(&json!({ "sent_id": "m2" })));
        drop(payloads);

        // Confirmed rows stop matching the pending query.
        assert!(h.store.get_locally_read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_read_state_noop_without_pending_rows() {
        let h = harness(Some("channel"));
        seed_user(&h);

        assert!(h.engine.sync_read_state(&user()).await);
        assert_eq!(h.remote.read_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sync_read_state_failure_leaves_rows_pending() {
        let h = harness(Some("channel"));
        seed_user(&h);
        h.store
            .upsert_messages(&[MessageRecord::from_message(
                &Message::from_payload(&entry("m1")).unwrap(),
            )])
            .unwrap();
        h.store.set_unread(&["m1".to_string()], false).unwrap();

        *h.remote.read_status.lock().unwrap() = Some(Ok(500));
        assert!(!h.engine.sync_read_state(&user()).await);
        assert_eq!(h.store.get_locally_read().unwrap().len(), 1);

        // Retried on the next pass once the server recovers.
        *h.remote.read_status.lock().unwrap() = Some(Ok(200));
        assert!(h.engine.sync_read_state(&user()).await);
        assert!(h.store.get_locally_read().unwrap().is_empty());
    }

    // ----- Pass C -----

    #[tokio::test]
    async fn test_sync_deleted_state_removes_confirmed_rows() {
        let h = harness(Some("channel"));
        seed_user(&h);
        let records: Vec<MessageRecord> = ["m1", "m2", "m3"]
            .iter()
            .map(|id| MessageRecord::from_message(&Message::from_payload(&entry(id)).unwrap()))
            .collect();
        h.store.upsert_messages(&records).unwrap();
        h.store
            .set_deleted(
                &["m1".to_string(), "m2".to_string(), "m3".to_string()],
                true,
            )
            .unwrap();

        assert!(h.engine.sync_deleted_state(&user()).await);
        assert!(stored_ids(&h.store).is_empty());
    }

    #[tokio::test]
    async fn test_sync_deleted_state_failure_keeps_tombstones() {
        let h = harness(Some("channel"));
        seed_user(&h);
        let records: Vec<MessageRecord> = ["m1", "m2", "m3"]
            .iter()
            .map(|id| MessageRecord::from_message(&Message::from_payload(&entry(id)).unwrap()))
            .collect();
        h.store.upsert_messages(&records).unwrap();
        h.store
            .set_deleted(
                &["m1".to_string(), "m2".to_string(), "m3".to_string()],
                true,
            )
            .unwrap();

        *h.remote.delete_status.lock().unwrap() = Some(Err(Error::Network("down".to_string())));
        assert!(!h.engine.sync_deleted_state(&user()).await);

        // Rows remain, still tombstoned and excluded from the active set.
        assert_eq!(stored_ids(&h.store).len(), 3);
        assert!(h.store.get_active(Utc::now()).unwrap().is_empty());
    }

    // ----- Identity -----

    #[tokio::test]
    async fn test_create_user_persists_identity_and_resets_watermark() {
        let h = harness(Some("channel"));
        h.store.set_pref(LAST_MESSAGE_REFRESH_KEY, "stale").unwrap();
        *h.remote.create_result.lock().unwrap() = Some(user());

        assert!(h.engine.create_user().await);

        let stored = h.credentials.credentials().unwrap().unwrap();
        assert_eq!(stored, user());
        assert_eq!(
            h.credentials.registered_channel_id().unwrap().as_deref(),
            Some("channel")
        );
        assert!(h.store.get_pref(LAST_MESSAGE_REFRESH_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_user_requires_channel() {
        let h = harness(None);
        assert!(!h.engine.create_user().await);
        assert_eq!(h.remote.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_update_user_unauthorized_self_heals() {
        let h = harness(Some("channel"));
        seed_user(&h);
        *h.remote.update_status.lock().unwrap() = Some(Ok(401));
        *h.remote.create_result.lock().unwrap() = Some(UserCredentials {
            user_id: "new_user_id".to_string(),
            token: "new_token".to_string(),
        });

        assert!(h.engine.update_user(&user()).await);

        // Exactly one create, and the identity was replaced outright.
        assert_eq!(h.remote.create_calls.load(Ordering::SeqCst), 1);
        let stored = h.credentials.credentials().unwrap().unwrap();
        assert_eq!(stored.user_id, "new_user_id");
    }

    #[tokio::test]
    async fn test_update_user_failure_keeps_identity_and_resets_clock() {
        let h = harness(Some("channel"));
        seed_user(&h);
        *h.remote.update_status.lock().unwrap() = Some(Ok(500));

        assert!(!h.engine.update_user(&user()).await);
        assert_eq!(h.remote.create_calls.load(Ordering::SeqCst), 0);
        assert!(h.credentials.credentials().unwrap().is_some());
        // The reset clock forces a retry on the next trigger.
        assert!(h.credentials.requires_update("channel", Utc::now()).unwrap());
    }

    #[tokio::test]
    async fn test_on_update_user_skips_fresh_identity() {
        let h = harness(Some("channel"));
        seed_user(&h);

        assert!(h.engine.on_update_user(false).await);
        assert_eq!(h.remote.update_calls.load(Ordering::SeqCst), 0);

        // Forceful bypasses the clock.
        assert!(h.engine.on_update_user(true).await);
        assert_eq!(h.remote.update_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_user_update_dispatches_message_fetch() {
        let h = harness(Some("channel"));
        seed_user(&h);

        assert!(h.engine.on_update_user(true).await);
        assert_eq!(h.runner.drain(), vec![JobKind::UpdateMessages]);
    }

    #[tokio::test]
    async fn test_update_messages_job_runs_all_passes_in_order() {
        let h = harness(Some("channel"));
        seed_user(&h);

        // One row pending read push, one pending delete push.
        h.store
            .upsert_messages(&[
                MessageRecord::from_message(&Message::from_payload(&entry("m1")).unwrap()),
                MessageRecord::from_message(&Message::from_payload(&entry("m2")).unwrap()),
            ])
            .unwrap();
        h.store.set_unread(&["m1".to_string()], false).unwrap();
        h.store.set_deleted(&["m2".to_string()], true).unwrap();

        h.remote
            .listings
            .lock()
            .unwrap()
            .push_back(listing(vec![entry("m1"), entry("m2")], "lm-1"));

        h.engine.perform(JobKind::UpdateMessages).await;

        assert_eq!(h.remote.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.remote.read_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.remote.delete_calls.load(Ordering::SeqCst), 1);
        // The delete push succeeded, so m2 is gone.
        assert_eq!(stored_ids(&h.store), ["m1"]);
    }
}

