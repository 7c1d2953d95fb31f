//! Local value provider.
//!
//! The local ledger holds the live, frequently-mutated balance of each identity. The sync engine
//! only reads it and replaces it wholesale through a withdraw/deposit pair; all other mutations
//! belong to the host.

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LedgerError {
	#[error("Insufficient funds for {identity}: balance {balance}, requested {requested}")]
	InsufficientFunds {
		identity: String,
		balance: f64,
		requested: f64,
	},

	#[error("Invalid amount: {0}")]
	InvalidAmount(f64),
}

/// In-process, non-blocking access to the locally authoritative balance.
pub trait LocalLedger: Send + Sync {
	/// Current local balance. Unknown identities have a balance of zero.
	fn balance(&self, identity: &str) -> f64;

	fn withdraw(&self, identity: &str, amount: f64) -> Result<(), LedgerError>;

	fn deposit(&self, identity: &str, amount: f64) -> Result<(), LedgerError>;
}

/// Set the local balance to exactly `target` by withdrawing the full current amount and
/// depositing the target.
///
/// If the deposit is refused, `current` is deposited back so the balance is left as it was.
pub fn replace_balance(
	ledger: &dyn LocalLedger,
	identity: &str,
	current: f64,
	target: f64,
) -> Result<(), LedgerError> {
	ledger.withdraw(identity, current)?;
	if let Err(e) = ledger.deposit(identity, target) {
		ledger.deposit(identity, current)?;
		return Err(e);
	}
	Ok(())
}

/// Ledger backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryLedger {
	balances: DashMap<String, f64>,
}

impl MemoryLedger {
	pub fn new() -> Self {
		Self::default()
	}

	/// Overwrite a balance directly, as a host-side mutation would.
	pub fn set(&self, identity: &str, balance: f64) {
		self.balances.insert(identity.to_string(), balance);
	}
}

fn check_amount(amount: f64) -> Result<(), LedgerError> {
	if !amount.is_finite() || amount < 0.0 {
		return Err(LedgerError::InvalidAmount(amount));
	}
	Ok(())
}

impl LocalLedger for MemoryLedger {
	fn balance(&self, identity: &str) -> f64 {
		self.balances.get(identity).map(|b| *b).unwrap_or(0.0)
	}

	fn withdraw(&self, identity: &str, amount: f64) -> Result<(), LedgerError> {
		check_amount(amount)?;
		let mut entry = self.balances.entry(identity.to_string()).or_insert(0.0);
		if *entry < amount {
			return Err(LedgerError::InsufficientFunds {
				identity: identity.to_string(),
				balance: *entry,
				requested: amount,
			});
		}
		*entry -= amount;
		debug!("Withdrew {} from {}", amount, identity);
		Ok(())
	}

	fn deposit(&self, identity: &str, amount: f64) -> Result<(), LedgerError> {
		check_amount(amount)?;
		*self.balances.entry(identity.to_string()).or_insert(0.0) += amount;
		debug!("Deposited {} to {}", amount, identity);
		Ok(())
	}
}
