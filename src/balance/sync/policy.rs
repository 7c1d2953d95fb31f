use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a remote document against the current instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
	/// The remote balance wins and is pulled into the local ledger.
	Fresh,
	/// The local balance wins and is pushed over the remote document.
	Stale,
}

/// Rule deciding whether a remote document is overwritten or adopted during reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StalenessPolicy {
	/// A document written at most `max_age_ms` ago is fresh; older documents are stale.
	/// Documents stamped in the future (clock skew between instances) are fresh.
	/// A zero window makes the local balance win whenever a document is older than now.
	FreshnessWindow { max_age_ms: u64 },
	/// Every existing document is fresh; local balances are only pushed on creation, departure
	/// and shutdown.
	RemoteAlwaysWins,
}

impl Default for StalenessPolicy {
	fn default() -> Self {
		StalenessPolicy::FreshnessWindow { max_age_ms: 60_000 }
	}
}

impl StalenessPolicy {
	pub fn classify(&self, last_updated: DateTime<Utc>, now: DateTime<Utc>) -> Freshness {
		match self {
			StalenessPolicy::FreshnessWindow { max_age_ms } => {
				let age = now.signed_duration_since(last_updated);
				if age.num_milliseconds() <= i64::try_from(*max_age_ms).unwrap_or(i64::MAX) {
					Freshness::Fresh
				} else {
					Freshness::Stale
				}
			}
			StalenessPolicy::RemoteAlwaysWins => Freshness::Fresh,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;

	#[test]
	fn window_splits_fresh_from_stale() {
		let policy = StalenessPolicy::FreshnessWindow { max_age_ms: 60_000 };
		let now = Utc::now();

		assert_eq!(policy.classify(now, now), Freshness::Fresh);
		assert_eq!(
			policy.classify(now - Duration::seconds(59), now),
			Freshness::Fresh
		);
		assert_eq!(
			policy.classify(now - Duration::minutes(10), now),
			Freshness::Stale
		);
		assert_eq!(
			policy.classify(now + Duration::minutes(10), now),
			Freshness::Fresh
		);
	}

	#[test]
	fn zero_window_only_keeps_documents_from_now() {
		let policy = StalenessPolicy::FreshnessWindow { max_age_ms: 0 };
		let now = Utc::now();

		assert_eq!(policy.classify(now, now), Freshness::Fresh);
		assert_eq!(
			policy.classify(now - Duration::milliseconds(5), now),
			Freshness::Stale
		);
	}

	#[test]
	fn huge_window_keeps_everything_fresh() {
		let policy = StalenessPolicy::FreshnessWindow { max_age_ms: u64::MAX };
		let now = Utc::now();

		assert_eq!(
			policy.classify(now - Duration::days(3650), now),
			Freshness::Fresh
		);
	}

	#[test]
	fn remote_always_wins() {
		let now = Utc::now();
		assert_eq!(
			StalenessPolicy::RemoteAlwaysWins.classify(now - Duration::days(365), now),
			Freshness::Fresh
		);
	}

	#[test]
	fn policy_deserializes_from_json() {
		let policy: StalenessPolicy =
			serde_json::from_str(r#"{"kind": "freshness_window", "max_age_ms": 5000}"#).unwrap();
		assert_eq!(policy, StalenessPolicy::FreshnessWindow { max_age_ms: 5000 });

		let policy: StalenessPolicy =
			serde_json::from_str(r#"{"kind": "remote_always_wins"}"#).unwrap();
		assert_eq!(policy, StalenessPolicy::RemoteAlwaysWins);
	}
}
