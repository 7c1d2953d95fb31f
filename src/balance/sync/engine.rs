//! Balance sync engine.
//!
//! `SyncEngine` reconciles one identity at a time between the local ledger and the remote store:
//! fetch the remote document, classify it with the staleness policy, then either push the local
//! balance or pull the remote one, and record the synced value in the cache.
//!
//! Every operation on an identity runs under that identity's lock, so a tick-driven reconcile and
//! a departure push for the same identity never interleave. Different identities proceed
//! concurrently.
//!
//! Besides the local ledger, the remote balance has a second writer: `adjust_remote` applies a
//! signed delta directly to the remote document, then reconciles so the ledger picks it up.

use crate::balance::sync::cache::BalanceCache;
use crate::balance::sync::events::{ActiveIdentities, EventDispatcher, SyncEvent, SyncEventHandler};
use crate::balance::sync::link::LinkCodeRegistry;
use crate::balance::sync::policy::{Freshness, StalenessPolicy};
use crate::balance::{AdjustError, BatchReport, DrainReport, LinkStatus, SyncError, SyncResult};
use crate::config::SyncConfig;
use crate::ledger::{LocalLedger, replace_balance};
use crate::store::{
	BalanceRecord, BalanceRepository, BalanceWriter, PushOutcome, RecordPatch, StoreError,
};

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub struct SyncEngine {
	repository: Arc<dyn BalanceRepository>,
	ledger: Arc<dyn LocalLedger>,
	writer: BalanceWriter,
	cache: BalanceCache,
	links: LinkCodeRegistry,
	policy: StalenessPolicy,
	require_link: bool,
	/// One lock per identity ever seen, serializing every operation on it
	locks: DashMap<String, Arc<Mutex<()>>>,
	dispatcher: EventDispatcher,
}

impl SyncEngine {
	pub fn new(
		repository: Arc<dyn BalanceRepository>,
		ledger: Arc<dyn LocalLedger>,
		config: &SyncConfig,
	) -> Self {
		let writer = BalanceWriter::new(repository.clone(), config.retry.clone());

		Self {
			repository,
			ledger,
			writer,
			cache: BalanceCache::new(),
			links: LinkCodeRegistry::new(),
			policy: config.staleness.clone(),
			require_link: config.require_link,
			locks: DashMap::new(),
			dispatcher: EventDispatcher::new(),
		}
	}

	/// Register an event handler.
	pub fn with_handler(mut self, handler: Arc<dyn SyncEventHandler>) -> Self {
		self.dispatcher.register_handler(handler);
		self
	}

	pub fn cache(&self) -> &BalanceCache {
		&self.cache
	}

	pub fn links(&self) -> &LinkCodeRegistry {
		&self.links
	}

	async fn lock_identity(&self, identity: &str) -> OwnedMutexGuard<()> {
		let lock = self
			.locks
			.entry(identity.to_string())
			.or_default()
			.clone();
		lock.lock_owned().await
	}

	/// Reconcile one identity.
	///
	/// A fetch failure aborts the identity for this cycle and is returned; push failures are
	/// swallowed by the writer and reported through a `WriteFailed` event only.
	pub async fn reconcile(&self, identity: &str) -> Result<SyncResult, SyncError> {
		let _guard = self.lock_identity(identity).await;

		let result = self.reconcile_locked(identity).await?;
		debug!("Reconciled {}: {:?}", identity, result);
		self.dispatcher
			.dispatch(&SyncEvent::Reconciled {
				identity: identity.to_string(),
				result,
			})
			.await;
		Ok(result)
	}

	async fn reconcile_locked(&self, identity: &str) -> Result<SyncResult, SyncError> {
		let record = self.fetch(identity).await?;
		if let Some(record) = &record {
			self.check_record(record).await?;
		}

		if self.require_link && !record.as_ref().is_some_and(|record| record.linked) {
			debug!("Skipping {}: no linked account", identity);
			return Ok(SyncResult::Unlinked);
		}

		let local_balance = self.ledger.balance(identity);

		let Some(record) = record else {
			info!(
				"No remote balance for {}, creating it with {}",
				identity, local_balance
			);
			self.push(identity, local_balance).await;
			return Ok(SyncResult::Created);
		};

		match self.policy.classify(record.last_updated, Utc::now()) {
			Freshness::Stale => {
				debug!(
					"Remote balance for {} last updated {} is stale, pushing {}",
					identity, record.last_updated, local_balance
				);
				self.push(identity, local_balance).await;
				Ok(SyncResult::Pushed)
			}
			Freshness::Fresh => {
				if local_balance != record.balance {
					replace_balance(self.ledger.as_ref(), identity, local_balance, record.balance)?;
					info!(
						"Updated local balance for {}: {} -> {}",
						identity, local_balance, record.balance
					);
				}
				self.cache.put(identity, record.balance);
				Ok(SyncResult::Pulled)
			}
		}
	}

	async fn fetch(&self, identity: &str) -> Result<Option<BalanceRecord>, StoreError> {
		match self.repository.find_one(identity).await {
			Ok(record) => Ok(record),
			Err(e) => {
				warn!("Failed to fetch remote balance for {}: {}", identity, e);
				self.dispatcher
					.dispatch(&SyncEvent::FetchFailed {
						identity: identity.to_string(),
						error: e.to_string(),
					})
					.await;
				Err(e)
			}
		}
	}

	/// Refuse documents whose balance the ledger could never hold, before anything is changed.
	async fn check_record(&self, record: &BalanceRecord) -> Result<(), StoreError> {
		if record.balance.is_finite() && record.balance >= 0.0 {
			return Ok(());
		}

		let error = StoreError::InvalidRecord {
			identity: record.identity.clone(),
			reason: format!("balance {} is not a valid amount", record.balance),
		};
		warn!("Skipping {}: {}", record.identity, error);
		self.dispatcher
			.dispatch(&SyncEvent::FetchFailed {
				identity: record.identity.clone(),
				error: error.to_string(),
			})
			.await;
		Err(error)
	}

	/// Push a balance and cache it once written. The caller must hold the identity lock.
	async fn push(&self, identity: &str, balance: f64) -> PushOutcome {
		let outcome = self.writer.push(identity, balance).await;
		match &outcome {
			PushOutcome::Written(_) => self.cache.put(identity, balance),
			PushOutcome::Failed { attempts, error } => {
				self.dispatcher
					.dispatch(&SyncEvent::WriteFailed {
						identity: identity.to_string(),
						balance,
						attempts: *attempts,
						error: error.clone(),
					})
					.await;
			}
		}
		outcome
	}

	/// Reconcile every active identity.
	///
	/// Identities are reconciled concurrently; a failure for one never stops the others.
	pub async fn reconcile_all(&self, active: &dyn ActiveIdentities) -> BatchReport {
		let identities = active.active_identities();
		let results = futures::future::join_all(
			identities.iter().map(|identity| self.reconcile(identity)),
		)
		.await;

		let mut report = BatchReport::default();
		for (identity, result) in identities.iter().zip(&results) {
			if let Err(e) = result {
				warn!("Skipping {} until the next cycle: {}", identity, e);
			}
			report.record(result);
		}
		report
	}

	/// Write the departing identity's local balance, bypassing the staleness comparison.
	pub async fn push_departure(&self, identity: &str) -> PushOutcome {
		let guard = self.lock_identity(identity).await;

		let balance = self.ledger.balance(identity);
		let outcome = self.push(identity, balance).await;
		if outcome.is_written() {
			info!("Saved balance {} for departing {}", balance, identity);
			self.dispatcher
				.dispatch(&SyncEvent::DeparturePushed {
					identity: identity.to_string(),
					balance,
				})
				.await;
		}

		drop(guard);
		// Forget the lock unless another operation is holding or waiting on it.
		self.locks.remove_if(identity, |_, lock| Arc::strong_count(lock) == 1);
		outcome
	}

	/// Apply a signed `delta` to the remote balance of `identity`, then reconcile it.
	///
	/// The write only lands if the document has not been written since it was read, and never
	/// takes the balance below zero. The follow-up reconcile pulls the new balance into the
	/// local ledger; its failure is logged, not returned.
	pub async fn adjust_remote(
		&self,
		identity: &str,
		delta: f64,
	) -> Result<BalanceRecord, SyncError> {
		if !delta.is_finite() {
			return Err(AdjustError::InvalidAmount(delta).into());
		}

		let record = {
			let _guard = self.lock_identity(identity).await;
			self.adjust_locked(identity, delta).await?
		};

		if let Err(e) = self.reconcile(identity).await {
			warn!("Failed to sync {} after remote adjustment: {}", identity, e);
		}
		Ok(record)
	}

	async fn adjust_locked(
		&self,
		identity: &str,
		delta: f64,
	) -> Result<BalanceRecord, SyncError> {
		let record = self
			.fetch(identity)
			.await?
			.ok_or_else(|| AdjustError::NotFound(identity.to_string()))?;

		let balance = record.balance + delta;
		if balance < 0.0 {
			return Err(AdjustError::InsufficientBalance {
				identity: identity.to_string(),
				balance: record.balance,
				delta,
			}
			.into());
		}

		let now = Utc::now();
		if record.last_updated > now {
			return Err(AdjustError::Conflict(identity.to_string()).into());
		}

		let written = self
			.repository
			.compare_and_upsert(
				identity,
				record.last_updated,
				&RecordPatch::balance(balance, now),
			)
			.await?
			.ok_or_else(|| AdjustError::Conflict(identity.to_string()))?;

		self.cache.put(identity, balance);
		info!(
			"Adjusted remote balance for {} by {}: {} -> {}",
			identity, delta, record.balance, balance
		);
		self.dispatcher
			.dispatch(&SyncEvent::RemoteAdjusted {
				identity: identity.to_string(),
				delta,
				balance,
			})
			.await;
		Ok(written)
	}

	/// Record a balance the host applied outside the ledger's normal flow and write it.
	pub async fn record_balance(&self, identity: &str, balance: f64) -> PushOutcome {
		let _guard = self.lock_identity(identity).await;

		self.cache.put(identity, balance);
		self.push(identity, balance).await
	}

	/// Issue a link code for `identity`, or report that it is already linked.
	pub async fn issue_link_code(&self, identity: &str) -> Result<LinkStatus, SyncError> {
		let _guard = self.lock_identity(identity).await;
		self.links.issue(self.repository.as_ref(), identity).await
	}

	/// Redeem a link code on behalf of an external account.
	///
	/// An identity without a remote document gets one holding its current local balance.
	pub async fn redeem_link_code(
		&self,
		identity: &str,
		code: &str,
		account: &str,
	) -> Result<BalanceRecord, SyncError> {
		let _guard = self.lock_identity(identity).await;
		let opening_balance = self.ledger.balance(identity);
		self.links
			.redeem(
				self.repository.as_ref(),
				identity,
				code,
				account,
				opening_balance,
			)
			.await
	}

	/// Flush every cached balance to the remote store.
	///
	/// Each entry is pushed with the usual bounded retry; failures are logged and reported, not
	/// retried further.
	pub async fn shutdown_drain(&self) -> DrainReport {
		let mut report = DrainReport::default();

		for (identity, balance) in self.cache.drain() {
			match self.writer.push(&identity, balance).await {
				PushOutcome::Written(_) => report.flushed += 1,
				PushOutcome::Failed { attempts, error } => {
					report.failed += 1;
					self.dispatcher
						.dispatch(&SyncEvent::WriteFailed {
							identity,
							balance,
							attempts,
							error,
						})
						.await;
				}
			}
		}

		info!(
			"Flushed {} cached balances ({} failed)",
			report.flushed, report.failed
		);
		self.dispatcher
			.dispatch(&SyncEvent::Drained {
				flushed: report.flushed,
				failed: report.failed,
			})
			.await;
		report
	}

	/// Release the remote store connection.
	pub async fn close(&self) -> Result<(), StoreError> {
		self.repository.close().await?;
		info!("Closed {}", self.repository.name());
		Ok(())
	}
}
