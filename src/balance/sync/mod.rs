//! Balance Synchronization Module
//!
//! This module provides the core logic for keeping each identity's local balance consistent with
//! its document in the remote store. It is composed of several submodules:
//!
//! - `engine`: Reconciles one identity (fetch, compare, push or pull, cache) and batches of them.
//! - `cache`: The process-wide map of last-synced balances, drained to the store on shutdown.
//! - `policy`: The staleness policy deciding whether the remote document or the local value wins.
//! - `link`: Issues and redeems single-use link codes.
//! - `events`: Host signals in, sync outcome events out, and the handler trait for observers.
//! - `stats`: An event handler that counts sync outcomes.
//! - `service`: The background actor that turns host signals and timer ticks into engine calls.

/// Last-synced balance cache
pub mod cache;
/// Reconciliation engine
pub mod engine;
/// Host signals and sync outcome events
pub mod events;
/// Link code issuance and redemption
pub mod link;
/// Staleness policy
pub mod policy;
/// Background sync actor
pub mod service;
/// Outcome counters
pub mod stats;

pub use engine::SyncEngine;
pub use service::{SyncHandle, SyncService};
