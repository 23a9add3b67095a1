use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use taskmaster_core::{EntityKind, GatewayError, TaskmasterClient, entity_id};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::action_log::{ActionLog, ActionRecord, ActionType};
use super::status::{StatusHub, Subscription, SyncErrorEntry, SyncPhase, SyncStatus};
use super::store::{LocalStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub replayed: usize,
    pub pushed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pulled: usize,
    pub errors: Vec<SyncErrorEntry>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Finished(SyncReport),
    /// Another cycle holds the single-flight lock. Not an error.
    AlreadyInProgress,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Finished(report) if report.is_success())
    }

    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Finished(report) => Some(report),
            SyncOutcome::AlreadyInProgress => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    Unchanged,
    CameOnline,
    WentOffline,
}

type EntityKey = (EntityKind, String);

#[derive(Default)]
struct CycleState {
    attempted: HashSet<String>,
    // Entities with a failed action this cycle; their later actions wait for the next one.
    blocked: HashSet<EntityKey>,
    rekeyed: HashMap<EntityKey, String>,
}

/// Reconciles the local store with the server: replay, then pull, then push.
pub struct SyncManager {
    client: TaskmasterClient,
    store: LocalStore,
    actions: ActionLog,
    status: Arc<StatusHub>,
}

impl SyncManager {
    /// Builds the manager with `pending_changes` recomputed from the action log.
    pub async fn load(client: TaskmasterClient, store: LocalStore) -> Result<Self, StoreError> {
        let actions = ActionLog::new(store.pool().clone());
        let pending_changes = actions.pending_count().await?;
        let status = StatusHub::new(SyncStatus {
            pending_changes,
            ..SyncStatus::default()
        });
        Ok(Self {
            client,
            store,
            actions,
            status,
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn actions(&self) -> &ActionLog {
        &self.actions
    }

    pub fn client(&self) -> &TaskmasterClient {
        &self.client
    }

    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.status.subscribe(listener)
    }

    pub fn set_online(&self, online: bool) -> ConnectivityChange {
        let mut change = ConnectivityChange::Unchanged;
        self.status.update_if(|status| {
            if status.is_online == online {
                return false;
            }
            status.is_online = online;
            change = if online {
                ConnectivityChange::CameOnline
            } else {
                ConnectivityChange::WentOffline
            };
            true
        });
        change
    }

    /// Recomputes `pending_changes` after a local mutation.
    pub async fn refresh_pending(&self) -> Result<u64, StoreError> {
        let pending = self.actions.pending_count().await?;
        self.status.update_if(|status| {
            if status.pending_changes == pending {
                return false;
            }
            status.pending_changes = pending;
            true
        });
        Ok(pending)
    }

    /// Runs one reconciliation cycle. Never fails: errors land in the report and status.
    pub async fn sync(&self) -> SyncOutcome {
        let acquired = self.status.update_if(|status| {
            if status.is_syncing {
                return false;
            }
            status.is_syncing = true;
            status.errors.clear();
            true
        });
        if !acquired {
            debug!("sync requested while a cycle is running");
            return SyncOutcome::AlreadyInProgress;
        }
        let mut guard = SyncingGuard {
            hub: &self.status,
            armed: true,
        };

        let mut report = SyncReport::default();
        if let Err(err) = self.run_cycle(&mut report).await {
            warn!(error = %err, "sync cycle aborted");
            report.errors.push(SyncErrorEntry::for_store(&err));
        }
        let pending = match self.actions.pending_count().await {
            Ok(pending) => Some(pending),
            Err(err) => {
                warn!(error = %err, "failed to count pending actions");
                report.errors.push(SyncErrorEntry::for_store(&err));
                None
            }
        };

        let errors = report.errors.clone();
        self.status.update(|status| {
            status.is_syncing = false;
            if let Some(pending) = pending {
                status.pending_changes = pending;
            }
            if errors.is_empty() {
                status.last_sync_time = Some(OffsetDateTime::now_utc());
            }
            status.errors = errors;
        });
        guard.armed = false;

        if report.is_success() {
            info!(
                replayed = report.replayed,
                pulled = report.pulled,
                pushed = report.pushed,
                "sync cycle completed"
            );
        } else {
            warn!(
                replayed = report.replayed,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors.len(),
                "sync cycle finished with errors"
            );
        }
        SyncOutcome::Finished(report)
    }

    async fn run_cycle(&self, report: &mut SyncReport) -> Result<(), StoreError> {
        let mut cycle = CycleState::default();

        let queued = self.actions.list_unsynced().await?;
        report.replayed = self
            .replay(queued, SyncPhase::Replay, &mut cycle, report)
            .await?;

        self.pull(report).await?;

        let remaining: Vec<ActionRecord> = self
            .actions
            .list_unsynced()
            .await?
            .into_iter()
            .filter(|action| !cycle.attempted.contains(&action.id))
            .collect();
        report.pushed = self
            .replay(remaining, SyncPhase::Push, &mut cycle, report)
            .await?;
        Ok(())
    }

    async fn replay(
        &self,
        actions: Vec<ActionRecord>,
        phase: SyncPhase,
        cycle: &mut CycleState,
        report: &mut SyncReport,
    ) -> Result<usize, StoreError> {
        let mut applied = 0;
        for action in actions {
            cycle.attempted.insert(action.id.clone());
            let action = apply_rekey(action, &cycle.rekeyed);
            let key = (action.entity, action.entity_id.clone());
            if cycle.blocked.contains(&key) {
                debug!(action = %action.id, entity = %action.entity, id = %action.entity_id, "skipping action behind a failed one");
                report.skipped += 1;
                continue;
            }
            match self.send_action(&action).await {
                Ok(echo) => {
                    self.settle(&action, echo, cycle).await?;
                    applied += 1;
                }
                Err(err) => {
                    warn!(
                        action = %action.id,
                        entity = %action.entity,
                        id = %action.entity_id,
                        error = %err,
                        "failed to push local action"
                    );
                    report.failed += 1;
                    report
                        .errors
                        .push(SyncErrorEntry::for_action(phase, &action, &err));
                    cycle.blocked.insert(key);
                }
            }
        }
        Ok(applied)
    }

    async fn send_action(&self, action: &ActionRecord) -> Result<Option<Value>, GatewayError> {
        match action.action_type {
            ActionType::Create => self
                .client
                .create(action.entity, &action.data, Some(&action.id))
                .await
                .map(Some),
            ActionType::Update => self
                .client
                .update(action.entity, &action.entity_id, &action.data)
                .await
                .map(Some),
            ActionType::Delete => self
                .client
                .delete(action.entity, &action.entity_id)
                .await
                .map(|()| None),
        }
    }

    async fn settle(
        &self,
        action: &ActionRecord,
        echo: Option<Value>,
        cycle: &mut CycleState,
    ) -> Result<(), StoreError> {
        let kind = action.entity;
        let mut local_id = action.entity_id.clone();
        let server_id = echo.as_ref().and_then(entity_id);

        if action.action_type == ActionType::Create
            && let Some(server_id) = server_id.as_ref()
            && *server_id != local_id
        {
            info!(entity = %kind, local = %local_id, server = %server_id, "server assigned a new id");
            self.store.rekey(kind, &local_id, server_id).await?;
            self.actions
                .rewrite_entity_id(kind, &local_id, server_id)
                .await?;
            cycle
                .rekeyed
                .insert((kind, local_id.clone()), server_id.clone());
            local_id = server_id.clone();
        }

        self.actions.mark_synced(&action.id).await?;

        match action.action_type {
            ActionType::Delete => {
                self.store.remove_settled(kind, &local_id).await?;
            }
            ActionType::Create | ActionType::Update => {
                // Only an echo that names this entity replaces the cached copy.
                let server_copy = echo.filter(|_| server_id.as_deref() == Some(local_id.as_str()));
                self.store
                    .settle(kind, &local_id, server_copy.as_ref())
                    .await?;
            }
        }
        Ok(())
    }

    async fn pull(&self, report: &mut SyncReport) -> Result<(), StoreError> {
        for kind in EntityKind::ALL {
            let items = match self.client.fetch_all(kind).await {
                Ok(items) => items,
                Err(err) => {
                    warn!(entity = %kind, error = %err, "failed to pull collection");
                    report.errors.push(SyncErrorEntry::for_collection(kind, &err));
                    continue;
                }
            };
            let outcome = self.store.bulk_put(kind, &items).await?;
            let keep: Vec<String> = items.iter().filter_map(entity_id).collect();
            let pruned = self.store.prune_synced(kind, &keep).await?;
            debug!(
                entity = %kind,
                written = outcome.written,
                kept_pending = outcome.skipped_pending,
                pruned,
                "pulled collection"
            );
            report.pulled += outcome.written;
        }
        Ok(())
    }
}

fn apply_rekey(mut action: ActionRecord, rekeyed: &HashMap<EntityKey, String>) -> ActionRecord {
    if let Some(server_id) = rekeyed.get(&(action.entity, action.entity_id.clone())) {
        action.entity_id = server_id.clone();
        if let Some(object) = action.data.as_object_mut()
            && object.contains_key("id")
        {
            object.insert("id".into(), Value::String(server_id.clone()));
        }
    }
    action
}

// Releases the single-flight lock if the cycle future is dropped mid-flight.
struct SyncingGuard<'a> {
    hub: &'a StatusHub,
    armed: bool,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.hub.update(|status| status.is_syncing = false);
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
