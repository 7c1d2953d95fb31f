//! Configuration for the balance sync subsystem.
//!
//! Configuration comes from `BALANCE_SYNC_*` environment variables or a JSON file. The default
//! store URL is a placeholder which `validate` rejects, so an unconfigured deployment disables
//! the subsystem instead of syncing against the wrong store.

use crate::balance::SyncError;
use crate::balance::sync::policy::StalenessPolicy;
use crate::store::{BackoffStrategy, RetryPolicy};

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Store URL shipped in the default configuration.
pub const PLACEHOLDER_STORE_URL: &str = "file://your_store_path_here";

/// Balance sync configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// `memory://` or `file://<directory>`
	pub store_url: String,
	/// Interval between `reconcile_all` passes (default: 1 minute)
	pub tick_interval_ms: u64,
	pub staleness: StalenessPolicy,
	pub retry: RetryPolicy,
	/// Skip reconciliation of identities that have not linked an account
	pub require_link: bool,
	/// Capacity of the host signal channel
	pub channel_capacity: usize,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			store_url: PLACEHOLDER_STORE_URL.to_string(),
			tick_interval_ms: 60 * 1000,
			staleness: StalenessPolicy::default(),
			retry: RetryPolicy::default(),
			require_link: false,
			channel_capacity: 256,
		}
	}
}

impl SyncConfig {
	/// Create config from environment variables
	pub fn from_env() -> Self {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Create config from any key lookup, falling back to defaults for missing or
	/// unparsable values.
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
		let defaults = Self::default();

		let retry_attempts = parse_or(
			&lookup,
			"BALANCE_SYNC_RETRY_ATTEMPTS",
			defaults.retry.max_attempts,
		);
		let retry_backoff = match lookup("BALANCE_SYNC_RETRY_DELAY_MS") {
			Some(_) => BackoffStrategy::Fixed {
				delay_ms: parse_or(&lookup, "BALANCE_SYNC_RETRY_DELAY_MS", 0),
			},
			None => defaults.retry.backoff.clone(),
		};
		let staleness = match lookup("BALANCE_SYNC_MAX_AGE_MS") {
			Some(value) if value == "remote" => StalenessPolicy::RemoteAlwaysWins,
			Some(_) => StalenessPolicy::FreshnessWindow {
				max_age_ms: parse_or(&lookup, "BALANCE_SYNC_MAX_AGE_MS", 60_000),
			},
			None => defaults.staleness.clone(),
		};

		Self {
			store_url: lookup("BALANCE_SYNC_STORE_URL").unwrap_or(defaults.store_url),
			tick_interval_ms: parse_or(
				&lookup,
				"BALANCE_SYNC_TICK_INTERVAL_MS",
				defaults.tick_interval_ms,
			),
			staleness,
			retry: RetryPolicy::new(retry_attempts, retry_backoff),
			require_link: parse_or(&lookup, "BALANCE_SYNC_REQUIRE_LINK", defaults.require_link),
			channel_capacity: parse_or(
				&lookup,
				"BALANCE_SYNC_CHANNEL_CAPACITY",
				defaults.channel_capacity,
			),
		}
	}

	/// Load config from a JSON file. Missing fields take their defaults.
	pub async fn load(path: &Path) -> Result<Self, SyncError> {
		let content = tokio::fs::read_to_string(path).await.map_err(|e| {
			SyncError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
		})?;

		let config: SyncConfig = serde_json::from_str(&content).map_err(|e| {
			SyncError::ConfigError(format!("Failed to parse config file {:?}: {}", path, e))
		})?;

		info!("Loaded sync configuration from {:?}", path);
		Ok(config)
	}

	/// Reject configurations the subsystem cannot run with.
	pub fn validate(&self) -> Result<(), SyncError> {
		if self.store_url.trim().is_empty() || self.store_url == PLACEHOLDER_STORE_URL {
			return Err(SyncError::ConfigError(
				"store URL is not set. Set BALANCE_SYNC_STORE_URL or store_url in the config file"
					.to_string(),
			));
		}
		if self.tick_interval_ms == 0 {
			return Err(SyncError::ConfigError(
				"tick interval must be greater than zero".to_string(),
			));
		}
		if self.retry.max_attempts == 0 {
			return Err(SyncError::ConfigError(
				"retry attempts must be greater than zero".to_string(),
			));
		}
		if self.channel_capacity == 0 {
			return Err(SyncError::ConfigError(
				"channel capacity must be greater than zero".to_string(),
			));
		}
		Ok(())
	}

	/// Get tick interval as Duration
	pub fn tick_interval(&self) -> Duration {
		Duration::from_millis(self.tick_interval_ms)
	}
}

fn parse_or<T: std::str::FromStr>(
	lookup: &impl Fn(&str) -> Option<String>,
	key: &str,
	default: T,
) -> T {
	match lookup(key) {
		Some(value) => value.parse().unwrap_or_else(|_| {
			warn!("Ignoring invalid value {:?} for {}", value, key);
			default
		}),
		None => default,
	}
}
