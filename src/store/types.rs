//! Types for the remote balance document store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The persisted per-identity balance document.
///
/// One document exists per identity. Documents are upserted in place and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// The identity this document belongs to. Used as the document key.
    pub identity: String,
    /// The last balance written to the remote store.
    pub balance: f64,
    /// The instant the balance was last written from either side.
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    /// Whether an external account has been linked to this identity.
    #[serde(default)]
    pub linked: bool,
    /// The code that was redeemed to link the external account.
    #[serde(rename = "linkCode", default, skip_serializing_if = "Option::is_none")]
    pub link_code: Option<String>,
    /// The external account id recorded when the link code was redeemed.
    #[serde(rename = "linkedAccount", default, skip_serializing_if = "Option::is_none")]
    pub linked_account: Option<String>,
}

impl BalanceRecord {
    /// Create an empty, unlinked record for a new identity.
    pub fn new(identity: impl Into<String>, last_updated: DateTime<Utc>) -> Self {
        Self {
            identity: identity.into(),
            balance: 0.0,
            last_updated,
            linked: false,
            link_code: None,
            linked_account: None,
        }
    }

    /// Apply a field-set patch to this record.
    pub fn apply(&mut self, patch: &RecordPatch) {
        if let Some(balance) = patch.balance {
            self.balance = balance;
        }
        if let Some(last_updated) = patch.last_updated {
            self.last_updated = last_updated;
        }
        if let Some(linked) = patch.linked {
            self.linked = linked;
        }
        if let Some(code) = &patch.link_code {
            self.link_code = Some(code.clone());
        }
        if let Some(account) = &patch.linked_account {
            self.linked_account = Some(account.clone());
        }
    }
}

/// The "set" document of an upsert.
///
/// Only the fields that are present are written. Upserting a patch for an identity with no
/// document creates one from [`BalanceRecord::new`] first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub balance: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub linked: Option<bool>,
    pub link_code: Option<String>,
    pub linked_account: Option<String>,
}

impl RecordPatch {
    /// Patch that writes a balance stamped with the given instant.
    pub fn balance(balance: f64, at: DateTime<Utc>) -> Self {
        Self {
            balance: Some(balance),
            last_updated: Some(at),
            ..Default::default()
        }
    }

    /// Patch that marks the record as linked to an external account.
    pub fn link(code: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            linked: Some(true),
            link_code: Some(code.into()),
            linked_account: Some(account.into()),
            ..Default::default()
        }
    }
}

/// Error types for remote store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid document for {identity}: {reason}")]
    InvalidRecord { identity: String, reason: String },

    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
