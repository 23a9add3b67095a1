use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use taskmaster_core::{EntityKind, GatewayError};
use time::OffsetDateTime;

use super::action_log::ActionRecord;
use super::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Replay,
    Pull,
    Push,
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncErrorEntry {
    pub phase: SyncPhase,
    pub entity: Option<EntityKind>,
    pub entity_id: Option<String>,
    pub action_id: Option<String>,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl SyncErrorEntry {
    pub(crate) fn for_action(phase: SyncPhase, action: &ActionRecord, err: &GatewayError) -> Self {
        Self {
            phase,
            entity: Some(action.entity),
            entity_id: Some(action.entity_id.clone()),
            action_id: Some(action.id.clone()),
            message: err.to_string(),
            at: OffsetDateTime::now_utc(),
        }
    }

    pub(crate) fn for_collection(kind: EntityKind, err: &GatewayError) -> Self {
        Self {
            phase: SyncPhase::Pull,
            entity: Some(kind),
            entity_id: None,
            action_id: None,
            message: err.to_string(),
            at: OffsetDateTime::now_utc(),
        }
    }

    pub(crate) fn for_store(err: &StoreError) -> Self {
        Self {
            phase: SyncPhase::Store,
            entity: None,
            entity_id: None,
            action_id: None,
            message: err.to_string(),
            at: OffsetDateTime::now_utc(),
        }
    }
}

/// Process-wide reconciliation state. Rebuilt on start, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync_time: Option<OffsetDateTime>,
    pub pending_changes: u64,
    pub errors: Vec<SyncErrorEntry>,
}

/// Indicator states a UI renders from a status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Offline,
    Syncing,
    Error,
    Pending(u64),
    Synced,
}

impl SyncStatus {
    pub fn indicator(&self) -> Indicator {
        if self.is_syncing {
            Indicator::Syncing
        } else if !self.is_online {
            Indicator::Offline
        } else if !self.errors.is_empty() {
            Indicator::Error
        } else if self.pending_changes > 0 {
            Indicator::Pending(self.pending_changes)
        } else {
            Indicator::Synced
        }
    }
}

type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

/// Owns the status and fans every mutation out to subscribers.
pub struct StatusHub {
    state: Mutex<SyncStatus>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    // Serializes deliveries so the last one always carries the latest state.
    dispatch: Mutex<()>,
    next_listener_id: AtomicU64,
}

impl StatusHub {
    pub(crate) fn new(initial: SyncStatus) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
            dispatch: Mutex::new(()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    pub fn snapshot(&self) -> SyncStatus {
        lock(&self.state).clone()
    }

    pub(crate) fn update<R>(&self, mutate: impl FnOnce(&mut SyncStatus) -> R) -> R {
        let result = mutate(&mut lock(&self.state));
        self.notify();
        result
    }

    /// Applies `mutate` and notifies only when it reports a change.
    pub(crate) fn update_if(&self, mutate: impl FnOnce(&mut SyncStatus) -> bool) -> bool {
        if !mutate(&mut lock(&self.state)) {
            return false;
        }
        self.notify();
        true
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(listener)));
        Subscription {
            hub: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        lock(&self.listeners).retain(|(listener_id, _)| *listener_id != id);
    }

    // The snapshot is read after taking the dispatch lock, so a delivery never
    // carries an older state than one already delivered. Listeners run outside
    // the state and listener locks: they may read status or unsubscribe, but
    // must not mutate it.
    fn notify(&self) {
        let _dispatch = lock(&self.dispatch);
        let snapshot = self.snapshot();
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

/// Keeps a listener registered until dropped or explicitly unsubscribed.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    hub: Weak<StatusHub>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
