//! Outcome counters for balance synchronization.
//!
//! `SyncStats` is a `SyncEventHandler` that counts every event it receives. Register it with the
//! engine to expose sync activity, including writes that were dropped after exhausting their
//! retries, to logs or a metrics endpoint.

use crate::balance::SyncError;
use crate::balance::SyncResult;
use crate::balance::sync::events::{SyncEvent, SyncEventHandler};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Event handler that counts sync outcomes
#[derive(Debug, Default)]
pub struct SyncStats {
    created: AtomicU64,
    pushed: AtomicU64,
    pulled: AtomicU64,
    unlinked: AtomicU64,
    departures: AtomicU64,
    adjustments: AtomicU64,
    fetch_failures: AtomicU64,
    write_failures: AtomicU64,
    drained: AtomicU64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters at once.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            pushed: self.pushed.load(Ordering::Relaxed),
            pulled: self.pulled.load(Ordering::Relaxed),
            unlinked: self.unlinked.load(Ordering::Relaxed),
            departures: self.departures.load(Ordering::Relaxed),
            adjustments: self.adjustments.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }

    /// Log the current counters
    pub fn log_summary(&self) {
        info!("Sync stats: {}", self.snapshot().summary());
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for SyncStats {
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
        let counter = match event {
            SyncEvent::Reconciled { result, .. } => match result {
                SyncResult::Created => &self.created,
                SyncResult::Pushed => &self.pushed,
                SyncResult::Pulled => &self.pulled,
                SyncResult::Unlinked => &self.unlinked,
            },
            SyncEvent::DeparturePushed { .. } => &self.departures,
            SyncEvent::RemoteAdjusted { .. } => &self.adjustments,
            SyncEvent::FetchFailed { .. } => &self.fetch_failures,
            SyncEvent::WriteFailed { .. } => &self.write_failures,
            SyncEvent::Drained { flushed, .. } => {
                self.drained.fetch_add(*flushed as u64, Ordering::Relaxed);
                return Ok(());
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SyncStats"
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub created: u64,
    pub pushed: u64,
    pub pulled: u64,
    pub unlinked: u64,
    pub departures: u64,
    pub adjustments: u64,
    pub fetch_failures: u64,
    pub write_failures: u64,
    /// Entries flushed by shutdown drains
    pub drained: u64,
}

impl StatsSnapshot {
    /// Get a human-readable summary of the counters
    pub fn summary(&self) -> String {
        format!(
            "{} created, {} pushed, {} pulled, {} unlinked, {} departures, {} adjustments, {} drained{}",
            self.created,
            self.pushed,
            self.pulled,
            self.unlinked,
            self.departures,
            self.adjustments,
            self.drained,
            if self.fetch_failures + self.write_failures == 0 {
                String::new()
            } else {
                format!(
                    " ({} fetch failures, {} write failures)",
                    self.fetch_failures, self.write_failures
                )
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_each_event_kind() {
        let stats = SyncStats::new();
        let events = [
            SyncEvent::Reconciled {
                identity: "a".into(),
                result: SyncResult::Created,
            },
            SyncEvent::Reconciled {
                identity: "b".into(),
                result: SyncResult::Pulled,
            },
            SyncEvent::DeparturePushed {
                identity: "a".into(),
                balance: 1.0,
            },
            SyncEvent::RemoteAdjusted {
                identity: "a".into(),
                delta: -2.0,
                balance: 3.0,
            },
            SyncEvent::WriteFailed {
                identity: "c".into(),
                balance: 2.0,
                attempts: 3,
                error: "down".into(),
            },
            SyncEvent::Drained {
                flushed: 4,
                failed: 1,
            },
        ];
        for event in &events {
            stats.handle(event).await.unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.created, 1);
        assert_eq!(snapshot.pulled, 1);
        assert_eq!(snapshot.pushed, 0);
        assert_eq!(snapshot.departures, 1);
        assert_eq!(snapshot.adjustments, 1);
        assert_eq!(snapshot.write_failures, 1);
        assert_eq!(snapshot.drained, 4);
        assert!(snapshot.summary().contains("1 write failures"));
    }
}
