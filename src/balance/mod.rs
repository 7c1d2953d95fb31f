pub mod command;
pub mod sync;
pub mod types;

pub use sync::{SyncEngine, SyncHandle, SyncService};
pub use types::*;
