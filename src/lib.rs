pub mod balance;
pub mod config;
pub mod ledger;
pub mod store;

pub use balance::{SyncEngine, SyncError, SyncHandle, SyncService};
pub use config::SyncConfig;
