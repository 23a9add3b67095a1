use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::manager::{ConnectivityChange, SyncManager, SyncOutcome};
use super::status::{Subscription, SyncStatus};
use super::triggers::{SyncTrigger, should_run};

const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(15);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub sync_interval: Duration,
    /// Health probe period; `None` leaves connectivity to `set_online`.
    pub probe_interval: Option<Duration>,
    /// Age after which synced action records are purged; `None` keeps them.
    pub action_retention: Option<Duration>,
    pub retry_base: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5 * 60),
            probe_interval: Some(Duration::from_secs(15)),
            action_retention: Some(Duration::from_secs(30 * 24 * 60 * 60)),
            retry_base: DEFAULT_RETRY_BASE,
        }
    }
}

/// Spawns the background tasks that decide when a cycle runs.
pub struct SyncRuntime;

impl SyncRuntime {
    pub fn start(manager: Arc<SyncManager>, options: RuntimeOptions) -> SyncHandle {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(trigger_worker(
            Arc::clone(&manager),
            trigger_rx,
            options.sync_interval,
            Backoff::new(options.retry_base, options.sync_interval),
        )));
        if let Some(interval) = options.probe_interval {
            tasks.push(tokio::spawn(connectivity_probe(
                Arc::clone(&manager),
                trigger_tx.clone(),
                interval,
            )));
        }
        if let Some(retention) = options.action_retention {
            tasks.push(tokio::spawn(retention_sweeper(
                Arc::clone(&manager),
                retention,
            )));
        }

        SyncHandle {
            manager,
            triggers: trigger_tx,
            tasks,
        }
    }
}

pub struct SyncHandle {
    manager: Arc<SyncManager>,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    /// Queues a trigger for the worker. Returns false once the runtime is gone.
    pub fn request_sync(&self, trigger: SyncTrigger) -> bool {
        self.triggers.send(trigger).is_ok()
    }

    /// Runs a manual cycle on the caller's task and returns its outcome.
    pub async fn sync_now(&self) -> SyncOutcome {
        self.manager.sync().await
    }

    pub fn foreground(&self) -> bool {
        self.request_sync(SyncTrigger::Foreground)
    }

    pub fn set_online(&self, online: bool) -> ConnectivityChange {
        let change = self.manager.set_online(online);
        if change == ConnectivityChange::CameOnline {
            self.request_sync(SyncTrigger::CameOnline);
        }
        change
    }

    pub fn status(&self) -> SyncStatus {
        self.manager.status()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.manager.subscribe(listener)
    }

    /// Stops the background tasks. A cycle already running on them is cancelled.
    pub fn shutdown(self) {
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn trigger_worker(
    manager: Arc<SyncManager>,
    mut triggers: mpsc::UnboundedReceiver<SyncTrigger>,
    interval: Duration,
    backoff: Backoff,
) {
    let mut failures = 0u32;
    let mut next_periodic = Instant::now() + interval;
    loop {
        let first = tokio::select! {
            received = triggers.recv() => match received {
                Some(trigger) => trigger,
                None => break,
            },
            _ = tokio::time::sleep_until(next_periodic) => SyncTrigger::Periodic,
        };
        let mut batch = vec![first];
        while let Ok(trigger) = triggers.try_recv() {
            if !batch.contains(&trigger) {
                batch.push(trigger);
            }
        }

        let status = manager.status();
        let Some(trigger) = batch
            .iter()
            .copied()
            .find(|trigger| should_run(*trigger, &status))
        else {
            debug!(?batch, online = status.is_online, "sync trigger ignored");
            if batch.contains(&SyncTrigger::Periodic) {
                next_periodic = Instant::now() + interval;
            }
            continue;
        };

        debug!(%trigger, coalesced = batch.len(), "starting sync cycle");
        match manager.sync().await {
            SyncOutcome::Finished(report) if report.is_success() => failures = 0,
            SyncOutcome::Finished(_) => failures = failures.saturating_add(1),
            SyncOutcome::AlreadyInProgress => {}
        }
        let wait = if failures == 0 {
            interval
        } else {
            backoff.delay(failures)
        };
        if failures > 0 {
            info!(failures, retry_in = ?wait, "sync failed, retry scheduled");
        }
        next_periodic = Instant::now() + wait;
    }
}

async fn connectivity_probe(
    manager: Arc<SyncManager>,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let online = match manager.client().health().await {
            Ok(status) => !status.is_server_error(),
            Err(err) => {
                debug!(error = %err, "health probe failed");
                false
            }
        };
        match manager.set_online(online) {
            ConnectivityChange::CameOnline => {
                info!("connectivity restored");
                if triggers.send(SyncTrigger::CameOnline).is_err() {
                    break;
                }
            }
            ConnectivityChange::WentOffline => warn!("connectivity lost"),
            ConnectivityChange::Unchanged => {}
        }
    }
}

async fn retention_sweeper(manager: Arc<SyncManager>, retention: Duration) {
    let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let cutoff = OffsetDateTime::now_utc() - retention;
        match manager.actions().purge_synced_before(cutoff).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "purged synced action records"),
            Err(err) => warn!(error = %err, "failed to purge action records"),
        }
    }
}
