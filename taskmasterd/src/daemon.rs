use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use taskmaster_core::{EntityKind, TaskmasterClient};
use tracing::{info, warn};

use crate::sync::entities::EntityService;
use crate::sync::manager::{SyncManager, SyncOutcome};
use crate::sync::runtime::{RuntimeOptions, SyncHandle, SyncRuntime};
use crate::sync::status::{Indicator, SyncStatus};
use crate::sync::store::{LocalStore, default_db_path};
use crate::sync::triggers::SyncTrigger;

const DEFAULT_API_URL: &str = "http://localhost:3000";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;
const DEFAULT_ACTION_RETENTION_DAYS: u64 = 30;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub db_path: PathBuf,
    pub sync_interval: Duration,
    pub probe_interval: Duration,
    pub action_retention: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let api_url = lookup("TASKMASTER_API_URL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let token = lookup("TASKMASTER_TOKEN").filter(|value| !value.trim().is_empty());
        let db_path = match lookup("TASKMASTER_DB_PATH") {
            Some(value) => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            None => default_db_path().context("failed to resolve database location")?,
        };
        let read_u64 = |name: &str, default: u64| {
            lookup(name)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(default)
        };
        let sync_interval = Duration::from_secs(read_u64(
            "TASKMASTER_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
        ));
        let probe_interval = Duration::from_secs(read_u64(
            "TASKMASTER_PROBE_INTERVAL_SECS",
            DEFAULT_PROBE_INTERVAL_SECS,
        ));
        let action_retention = Duration::from_secs(
            read_u64(
                "TASKMASTER_ACTION_RETENTION_DAYS",
                DEFAULT_ACTION_RETENTION_DAYS,
            )
            .saturating_mul(SECS_PER_DAY),
        );

        Ok(Self {
            api_url,
            token,
            db_path,
            sync_interval,
            probe_interval,
            action_retention,
        })
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            sync_interval: self.sync_interval,
            probe_interval: Some(self.probe_interval),
            action_retention: Some(self.action_retention),
            ..RuntimeOptions::default()
        }
    }
}

/// Composition root: one store, one gateway client, one manager.
pub struct DaemonRuntime {
    config: DaemonConfig,
    manager: Arc<SyncManager>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = TaskmasterClient::with_base_url(
            &config.api_url,
            config.token.clone().unwrap_or_default(),
        )
        .with_context(|| format!("invalid api url {:?}", config.api_url))?;
        let store = LocalStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open local store at {:?}", config.db_path))?;
        let manager = SyncManager::load(client, store)
            .await
            .context("failed to load pending actions")?;
        Ok(Self {
            config,
            manager: Arc::new(manager),
        })
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    pub fn entities(&self) -> EntityService {
        EntityService::new(Arc::clone(&self.manager))
    }

    /// One manual cycle, for the `sync` command.
    pub async fn sync_once(&self) -> SyncOutcome {
        self.manager.sync().await
    }

    pub async fn summary(&self) -> anyhow::Result<StoreSummary> {
        let store = self.manager.store();
        let mut collections = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            collections.push(CollectionSummary {
                kind,
                cached: store.count(kind).await?,
                pending: store.count_pending(kind).await?,
            });
        }
        Ok(StoreSummary {
            pending_actions: self.manager.actions().pending_count().await?,
            collections,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            api_url = %self.config.api_url,
            db_path = %self.config.db_path.display(),
            sync_interval = ?self.config.sync_interval,
            "taskmasterd started"
        );

        let handle = SyncRuntime::start(Arc::clone(&self.manager), self.config.runtime_options());
        let _status_log = handle.subscribe(log_status_change());

        wait_for_shutdown(&handle).await?;

        info!(pending = handle.status().pending_changes, "taskmasterd stopping");
        handle.shutdown();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSummary {
    pub kind: EntityKind,
    pub cached: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    pub pending_actions: u64,
    pub collections: Vec<CollectionSummary>,
}

fn log_status_change() -> impl Fn(&SyncStatus) + Send + Sync + 'static {
    let last = std::sync::Mutex::new(None);
    move |status| {
        let indicator = status.indicator();
        let mut last = last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == Some(indicator) {
            return;
        }
        *last = Some(indicator);
        match indicator {
            Indicator::Error => {
                for error in &status.errors {
                    warn!(
                        phase = ?error.phase,
                        entity = ?error.entity,
                        id = ?error.entity_id,
                        message = %error.message,
                        "sync error"
                    );
                }
            }
            other => info!(state = ?other, pending = status.pending_changes, "sync status"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(handle: &SyncHandle) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut manual =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                return res.context("failed waiting for shutdown signal");
            }
            _ = manual.recv() => {
                info!("manual sync requested");
                handle.request_sync(SyncTrigger::Manual);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_handle: &SyncHandle) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed waiting for shutdown signal")
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
