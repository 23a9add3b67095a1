pub mod daemon;
pub mod sync;

pub use sync::entities::{EntityError, EntityService};
pub use sync::manager::{ConnectivityChange, SyncManager, SyncOutcome, SyncReport};
pub use sync::runtime::{RuntimeOptions, SyncHandle, SyncRuntime};
pub use sync::status::{Indicator, SyncErrorEntry, SyncPhase, SyncStatus};
pub use sync::triggers::SyncTrigger;
