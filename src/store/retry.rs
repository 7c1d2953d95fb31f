//! Bounded retry for remote writes.
//!
//! Every balance push goes through [`BalanceWriter`], which retries failed upserts according to
//! an injected [`RetryPolicy`]. Once the attempts are exhausted the failure is reported back as a
//! [`PushOutcome::Failed`] value instead of an error: callers log it and move on, and the next
//! sync cycle compares from scratch.

use crate::store::{BalanceRecord, BalanceRepository, RecordPatch, StoreError};

use backoff::backoff::Backoff;
use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay between attempts of a failed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
	/// Retry straight away.
	Immediate,
	/// Wait the same delay before every retry.
	Fixed { delay_ms: u64 },
	/// Randomized exponential delays, capped at `max_ms`.
	Exponential { initial_ms: u64, max_ms: u64 },
}

/// How many times a write is attempted, and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	/// Total attempts, the first one included.
	pub max_attempts: u32,
	pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			backoff: BackoffStrategy::Immediate,
		}
	}
}

impl RetryPolicy {
	pub fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
		Self {
			max_attempts,
			backoff,
		}
	}

	/// Build a fresh backoff schedule for one write.
	pub fn schedule(&self) -> AttemptBackoff {
		let delays = match &self.backoff {
			BackoffStrategy::Immediate => Delays::Fixed(Duration::ZERO),
			BackoffStrategy::Fixed { delay_ms } => {
				Delays::Fixed(Duration::from_millis(*delay_ms))
			}
			BackoffStrategy::Exponential { initial_ms, max_ms } => Delays::Exponential(
				ExponentialBackoffBuilder::new()
					.with_initial_interval(Duration::from_millis(*initial_ms))
					.with_max_interval(Duration::from_millis(*max_ms))
					.with_max_elapsed_time(None)
					.build(),
			),
		};

		AttemptBackoff {
			max_attempts: self.max_attempts.max(1),
			failures: 0,
			delays,
		}
	}
}

enum Delays {
	Fixed(Duration),
	Exponential(ExponentialBackoff),
}

/// A [`Backoff`] that gives up after a fixed number of attempts.
pub struct AttemptBackoff {
	max_attempts: u32,
	failures: u32,
	delays: Delays,
}

impl Backoff for AttemptBackoff {
	fn reset(&mut self) {
		self.failures = 0;
		if let Delays::Exponential(exponential) = &mut self.delays {
			exponential.reset();
		}
	}

	fn next_backoff(&mut self) -> Option<Duration> {
		self.failures += 1;
		if self.failures >= self.max_attempts {
			return None;
		}
		match &mut self.delays {
			Delays::Fixed(delay) => Some(*delay),
			Delays::Exponential(exponential) => exponential.next_backoff(),
		}
	}
}

/// Result of a balance push after retries.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
	/// The document as written.
	Written(BalanceRecord),
	/// Every attempt failed; `error` is the last failure.
	Failed { attempts: u32, error: String },
}

impl PushOutcome {
	pub fn is_written(&self) -> bool {
		matches!(self, PushOutcome::Written(_))
	}
}

/// Writes balances to the remote store with bounded retry.
#[derive(Clone)]
pub struct BalanceWriter {
	repository: Arc<dyn BalanceRepository>,
	policy: RetryPolicy,
}

impl BalanceWriter {
	pub fn new(repository: Arc<dyn BalanceRepository>, policy: RetryPolicy) -> Self {
		Self { repository, policy }
	}

	pub fn policy(&self) -> &RetryPolicy {
		&self.policy
	}

	/// Upsert `balance` for `identity`, stamped with the current instant.
	///
	/// Never returns an error: exhausted retries are logged and reported as
	/// [`PushOutcome::Failed`].
	pub async fn push(&self, identity: &str, balance: f64) -> PushOutcome {
		let patch = RecordPatch::balance(balance, Utc::now());
		let repository = &self.repository;
		let patch = &patch;
		let mut attempts = 0u32;

		let result = retry_notify(
			self.policy.schedule(),
			|| {
				attempts += 1;
				async move {
					repository
						.upsert(identity, patch)
						.await
						.map_err(backoff::Error::transient)
				}
			},
			|e: StoreError, delay: Duration| {
				warn!(
					"Failed to save balance for {} ({}), retrying in {:?}",
					identity, e, delay
				);
			},
		)
		.await;

		match result {
			Ok(record) => {
				debug!(
					"Saved balance {} for {} after {} attempt(s)",
					balance, identity, attempts
				);
				PushOutcome::Written(record)
			}
			Err(e) => {
				warn!(
					"Giving up saving balance {} for {} after {} attempt(s): {}",
					balance, identity, attempts, e
				);
				PushOutcome::Failed {
					attempts,
					error: e.to_string(),
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemoryBalanceRepository;

	#[test]
	fn schedule_stops_after_max_attempts() {
		let mut schedule = RetryPolicy::default().schedule();
		assert_eq!(schedule.next_backoff(), Some(Duration::ZERO));
		assert_eq!(schedule.next_backoff(), Some(Duration::ZERO));
		assert_eq!(schedule.next_backoff(), None);

		schedule.reset();
		assert!(schedule.next_backoff().is_some());
	}

	#[test]
	fn exponential_schedule_is_capped() {
		let policy = RetryPolicy::new(
			10,
			BackoffStrategy::Exponential {
				initial_ms: 10,
				max_ms: 40,
			},
		);
		let mut schedule = policy.schedule();
		for _ in 0..9 {
			let delay = schedule.next_backoff().unwrap();
			// Randomization stretches the cap by at most half.
			assert!(delay <= Duration::from_millis(60));
		}
		assert_eq!(schedule.next_backoff(), None);
	}

	#[tokio::test]
	async fn push_succeeds_after_transient_failures() {
		let repository = Arc::new(MemoryBalanceRepository::new());
		repository.fail_next_writes(2);
		let writer = BalanceWriter::new(repository.clone(), RetryPolicy::default());

		let outcome = writer.push("alice", 10.0).await;

		assert!(outcome.is_written());
		assert_eq!(repository.write_attempts(), 3);
		let record = repository.find_one("alice").await.unwrap().unwrap();
		assert_eq!(record.balance, 10.0);
	}

	#[tokio::test]
	async fn push_gives_up_after_exhausting_attempts() {
		let repository = Arc::new(MemoryBalanceRepository::new());
		repository.fail_next_writes(usize::MAX);
		let writer = BalanceWriter::new(repository.clone(), RetryPolicy::default());

		let outcome = writer.push("bob", 5.0).await;

		match outcome {
			PushOutcome::Failed { attempts, .. } => assert_eq!(attempts, 3),
			other => panic!("expected failure, got {:?}", other),
		}
		assert_eq!(repository.write_attempts(), 3);
		assert!(repository.find_one("bob").await.unwrap().is_none());
	}

	#[test]
	fn policy_deserializes_from_json() {
		let policy: RetryPolicy = serde_json::from_str(
			r#"{"max_attempts": 5, "backoff": {"kind": "fixed", "delay_ms": 250}}"#,
		)
		.unwrap();
		assert_eq!(policy.max_attempts, 5);
		assert_eq!(policy.backoff, BackoffStrategy::Fixed { delay_ms: 250 });

		let defaulted: RetryPolicy = serde_json::from_str("{}").unwrap();
		assert_eq!(defaulted, RetryPolicy::default());
	}
}
