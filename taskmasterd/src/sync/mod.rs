pub mod action_log;
pub mod backoff;
pub mod entities;
pub mod manager;
pub mod runtime;
pub mod status;
pub mod store;
pub mod triggers;
