//! User-facing link commands.
//!
//! These render engine results as the text shown to whoever typed the command. Internal errors
//! are logged and replaced by a generic message.

use crate::balance::sync::link::LinkError;
use crate::balance::{LinkStatus, SyncEngine, SyncError};
use tracing::error;

pub const ALREADY_LINKED: &str = "Your account is already linked.";
pub const TRY_AGAIN_LATER: &str =
	"An error occurred while processing your request. Please try again later.";
pub const MISSING_INPUT: &str = "Please provide both a link code and an identity.";
pub const INVALID_CODE: &str = "Invalid link code or identity. Please try again.";
pub const REDEEM_ALREADY_LINKED: &str = "This identity is already linked to an external account.";
pub const REDEEMED: &str = "Account linked successfully.";

/// Request a link code for `identity`.
pub async fn link_command(engine: &SyncEngine, identity: &str) -> String {
	match engine.issue_link_code(identity).await {
		Ok(LinkStatus::AlreadyLinked) => ALREADY_LINKED.to_string(),
		Ok(LinkStatus::Issued(code)) => format!("Your link code is: {}", code),
		Err(e) => {
			error!("Failed to issue link code for {}: {}", identity, e);
			TRY_AGAIN_LATER.to_string()
		}
	}
}

/// Redeem `code` for `identity` on behalf of the external `account`.
pub async fn redeem_command(
	engine: &SyncEngine,
	identity: &str,
	code: &str,
	account: &str,
) -> String {
	let (identity, code) = (identity.trim(), code.trim());
	if identity.is_empty() || code.is_empty() {
		return MISSING_INPUT.to_string();
	}

	match engine.redeem_link_code(identity, code, account).await {
		Ok(_) => REDEEMED.to_string(),
		Err(SyncError::LinkError(LinkError::InvalidCode(_))) => INVALID_CODE.to_string(),
		Err(SyncError::LinkError(LinkError::AlreadyLinked(_))) => REDEEM_ALREADY_LINKED.to_string(),
		Err(e) => {
			error!("Failed to redeem link code for {}: {}", identity, e);
			TRY_AGAIN_LATER.to_string()
		}
	}
}
