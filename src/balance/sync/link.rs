//! Link code issuance and redemption.
//!
//! A link code lets an external account claim an identity out of band: the identity asks for a
//! code, hands it to the external system, and the external system redeems it together with its
//! own account id. Codes are 9-digit numbers, unique per identity only, and live in process
//! memory until redeemed. Redemption writes the link marker to the identity's remote document,
//! after which no new code is ever issued for it. An identity without a document gets one
//! carrying its opening balance together with the marker, never an empty one.

use crate::balance::{LinkStatus, SyncError};
use crate::store::{BalanceRecord, BalanceRepository, RecordPatch};

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tracing::info;

/// Smallest code that can be issued.
pub const LINK_CODE_MIN: u32 = 100_000_000;
/// Largest code that can be issued.
pub const LINK_CODE_MAX: u32 = 999_999_999;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LinkError {
	#[error("{0} is already linked to an external account")]
	AlreadyLinked(String),

	#[error("invalid link code for {0}")]
	InvalidCode(String),
}

/// Draw a code from the thread-local CSPRNG.
pub fn generate_code() -> String {
	rand::rng()
		.random_range(LINK_CODE_MIN..=LINK_CODE_MAX)
		.to_string()
}

/// Pending link codes, keyed by identity
#[derive(Debug, Default)]
pub struct LinkCodeRegistry {
	codes: DashMap<String, String>,
}

impl LinkCodeRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// The code waiting to be redeemed for `identity`, if any.
	pub fn pending(&self, identity: &str) -> Option<String> {
		self.codes.get(identity).map(|code| code.clone())
	}

	/// Issue a code for `identity`, or report that it is already linked.
	///
	/// Repeated calls before redemption return the same code.
	pub async fn issue(
		&self,
		repository: &dyn BalanceRepository,
		identity: &str,
	) -> Result<LinkStatus, SyncError> {
		let record = repository.find_one(identity).await?;
		if record.is_some_and(|record| record.linked) {
			self.codes.remove(identity);
			return Ok(LinkStatus::AlreadyLinked);
		}

		let code = self
			.codes
			.entry(identity.to_string())
			.or_insert_with(|| {
				let code = generate_code();
				info!("Generated link code for {}", identity);
				code
			})
			.clone();

		Ok(LinkStatus::Issued(code))
	}

	/// Redeem `code` for `identity` on behalf of the external `account`.
	///
	/// On success the remote document is marked as linked and the pending code is dropped. If
	/// the identity has no document yet, it is created with `opening_balance`.
	pub async fn redeem(
		&self,
		repository: &dyn BalanceRepository,
		identity: &str,
		code: &str,
		account: &str,
		opening_balance: f64,
	) -> Result<BalanceRecord, SyncError> {
		let record = repository.find_one(identity).await?;
		if record.as_ref().is_some_and(|record| record.linked) {
			return Err(LinkError::AlreadyLinked(identity.to_string()).into());
		}

		if self.pending(identity).as_deref() != Some(code) {
			return Err(LinkError::InvalidCode(identity.to_string()).into());
		}

		let mut patch = RecordPatch::link(code, account);
		if record.is_none() {
			patch.balance = Some(opening_balance);
			patch.last_updated = Some(Utc::now());
		}
		let record = repository.upsert(identity, &patch).await?;
		self.codes.remove(identity);

		info!("Linked {} to external account {}", identity, account);
		Ok(record)
	}
}
