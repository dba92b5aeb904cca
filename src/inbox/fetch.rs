//! Refresh-request coalescing.
//!
//! Concurrent "refresh now" requests collapse into one underlying sync. Every
//! caller's callback is registered against whichever sync is in flight,
//! including callers that arrive after the sync started, and each is invoked
//! exactly once with that sync's outcome. Cancelling a handle suppresses only
//! that caller's callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::jobs::{ConflictPolicy, JobDispatcher, JobKind};

type FetchCallback = Box<dyn FnOnce(bool) + Send>;

/// Cancellation handle for one registered fetch callback.
///
/// Cancelling never affects the underlying sync or other callers.
#[derive(Clone)]
pub struct FetchHandle {
    cancelled: Arc<AtomicBool>,
}

impl FetchHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

struct PendingCallback {
    cancelled: Arc<AtomicBool>,
    callback: FetchCallback,
}

#[derive(Default)]
struct CoordinatorState {
    is_fetching: bool,
    pending: Vec<PendingCallback>,
}

/// Single-flight fetch coordinator.
pub struct FetchCoordinator {
    dispatcher: JobDispatcher,
    state: Mutex<CoordinatorState>,
}

impl FetchCoordinator {
    pub fn new(dispatcher: JobDispatcher) -> Self {
        Self {
            dispatcher,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Register a completion callback and start a sync unless one is already
    /// in flight.
    pub fn request_fetch(&self, callback: impl FnOnce(bool) + Send + 'static) -> FetchHandle {
        let cancelled = Arc::new(AtomicBool::new(false));

        let should_dispatch = {
            let mut state = self.state.lock().expect("fetch state lock poisoned");
            state.pending.push(PendingCallback {
                cancelled: cancelled.clone(),
                callback: Box::new(callback),
            });
            let should_dispatch = !state.is_fetching;
            state.is_fetching = true;
            should_dispatch
        };

        if should_dispatch {
            self.dispatcher
                .dispatch(JobKind::UpdateMessages, ConflictPolicy::Replace);
        }

        FetchHandle { cancelled }
    }

    /// Complete the in-flight fetch, fanning the outcome out to every
    /// registered callback. Callbacks run outside the coordinator lock.
    pub fn complete(&self, success: bool) {
        let pending = {
            let mut state = self.state.lock().expect("fetch state lock poisoned");
            state.is_fetching = false;
            std::mem::take(&mut state.pending)
        };

        for entry in pending {
            if !entry.cancelled.load(Ordering::Relaxed) {
                (entry.callback)(success);
            }
        }
    }
}
