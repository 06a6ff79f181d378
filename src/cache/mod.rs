//! Local cache and sync: SQLite store, reconciliation engine, scheduler.

pub mod db;
pub mod scheduler;
pub mod sync;

pub use db::HeaderCache;
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use sync::SyncEngine;
