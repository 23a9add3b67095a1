use std::fmt;

use super::status::SyncStatus;

/// Why a sync cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// Connectivity went from offline to online.
    CameOnline,
    /// The app returned to the foreground.
    Foreground,
    Periodic,
    /// Explicit user request, e.g. pull-to-refresh.
    Manual,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::CameOnline => "online",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate applied before a trigger starts a cycle. Manual requests always run; an
/// offline manual cycle simply records its network errors.
pub fn should_run(trigger: SyncTrigger, status: &SyncStatus) -> bool {
    match trigger {
        SyncTrigger::Manual => true,
        SyncTrigger::CameOnline | SyncTrigger::Foreground => status.is_online,
        SyncTrigger::Periodic => status.is_online && !status.is_syncing,
    }
}
