use crate::balance::sync::link::LinkError;
use crate::ledger::LedgerError;
use crate::store::StoreError;

/// Outcome of reconciling one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
	/// No remote document existed; the local balance was written as a new one.
	Created,
	/// The remote document was stale; the local balance overwrote it.
	Pushed,
	/// The remote document was fresh; the local balance was replaced by it.
	Pulled,
	/// Linking is required and the identity has not linked an account yet.
	Unlinked,
}

/// Counts of a `reconcile_all` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
	pub created: usize,
	pub pushed: usize,
	pub pulled: usize,
	pub unlinked: usize,
	pub failed: usize,
}

impl BatchReport {
	pub fn record(&mut self, result: &Result<SyncResult, SyncError>) {
		match result {
			Ok(SyncResult::Created) => self.created += 1,
			Ok(SyncResult::Pushed) => self.pushed += 1,
			Ok(SyncResult::Pulled) => self.pulled += 1,
			Ok(SyncResult::Unlinked) => self.unlinked += 1,
			Err(_) => self.failed += 1,
		}
	}

	pub fn total(&self) -> usize {
		self.created + self.pushed + self.pulled + self.unlinked + self.failed
	}

	pub fn summary(&self) -> String {
		format!(
			"{} identities: {} created, {} pushed, {} pulled, {} unlinked, {} failed",
			self.total(),
			self.created,
			self.pushed,
			self.pulled,
			self.unlinked,
			self.failed
		)
	}
}

/// Counts of a shutdown drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
	pub flushed: usize,
	pub failed: usize,
}

/// Result of a link code request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
	/// The identity's document is already marked as linked.
	AlreadyLinked,
	/// The pending code for the identity.
	Issued(String),
}

/// Reasons a remote balance adjustment is refused
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AdjustError {
	#[error("No remote balance for {0}")]
	NotFound(String),

	#[error("Insufficient balance for {identity}: balance {balance}, adjustment {delta}")]
	InsufficientBalance {
		identity: String,
		balance: f64,
		delta: f64,
	},

	#[error("Balance update for {0} conflicts with a newer write")]
	Conflict(String),

	#[error("Invalid adjustment: {0}")]
	InvalidAmount(f64),
}

/// Error types for balance synchronization
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Store error: {0}")]
	StoreError(#[from] StoreError),

	#[error("Ledger error: {0}")]
	LedgerError(#[from] LedgerError),

	#[error("Link error: {0}")]
	LinkError(#[from] LinkError),

	#[error("Adjustment error: {0}")]
	AdjustError(#[from] AdjustError),

	#[error("Configuration error: {0}")]
	ConfigError(String),

	#[error("Sync service is closed")]
	ServiceClosed,
}
