//! Remote balance store integration
//!
//! This module provides the repository trait used to read and upsert per-identity balance
//! documents, the concrete in-memory and file-backed repositories, and the retrying writer
//! used by the sync engine for every push.

/// Repository trait and implementations
mod repository;
/// Bounded retry policy and the retrying balance writer
pub mod retry;
/// Type definitions for balance documents
mod types;

pub use repository::*;
pub use retry::{BackoffStrategy, BalanceWriter, PushOutcome, RetryPolicy};
pub use types::*;
