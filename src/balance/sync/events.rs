//! Event system for balance synchronization.
//!
//! This module defines both directions of event traffic around the sync engine. Host signals
//! (`HostEvent`) arrive from the runtime that owns the identities: an identity arrived, departed,
//! or a periodic tick elapsed. Sync events (`SyncEvent`) leave the engine and describe what each
//! reconciliation, push and drain actually did; they are delivered to every registered
//! `SyncEventHandler`, which is how failures that the engine swallows stay observable.

use crate::balance::{SyncError, SyncResult};
use dashmap::DashSet;
use std::sync::Arc;

/// Signals emitted by the host runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// An identity became active locally.
    Arrived(String),
    /// An identity stopped being active locally.
    Departed(String),
    /// Time to reconcile every active identity.
    Tick,
}

/// The host's view of which identities are currently active.
pub trait ActiveIdentities: Send + Sync {
    fn active_identities(&self) -> Vec<String>;
}

/// A concurrent set of active identities maintained by the host.
#[derive(Debug, Default)]
pub struct ActiveSet {
    identities: DashSet<String>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: &str) -> bool {
        self.identities.insert(identity.to_string())
    }

    pub fn remove(&self, identity: &str) -> bool {
        self.identities.remove(identity).is_some()
    }
}

impl ActiveIdentities for ActiveSet {
    fn active_identities(&self) -> Vec<String> {
        self.identities.iter().map(|identity| identity.clone()).collect()
    }
}

/// Events that occur during balance synchronization
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// One identity was reconciled
    Reconciled {
        identity: String,
        result: SyncResult,
    },
    /// A departing identity's local balance was written to the store
    DeparturePushed { identity: String, balance: f64 },
    /// The remote balance was changed by `delta` outside the local ledger
    RemoteAdjusted {
        identity: String,
        delta: f64,
        balance: f64,
    },
    /// The remote document could not be read; the identity is skipped until the next trigger
    FetchFailed { identity: String, error: String },
    /// A push exhausted its retries and was dropped
    WriteFailed {
        identity: String,
        balance: f64,
        attempts: u32,
        error: String,
    },
    /// The cache was flushed at shutdown
    Drained { flushed: usize, failed: usize },
}

/// Trait for handling sync events.
///
/// Implementors receive all sync events and can perform side effects such as metrics or alerts.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in the order they are registered.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn SyncEventHandler>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Register a new event handler.
    pub fn register_handler(&mut self, handler: Arc<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&self, event: &SyncEvent) {
        for handler in &self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        events: Mutex<Vec<SyncEvent>>,
    }

    #[async_trait::async_trait]
    impl SyncEventHandler for Recorder {
        async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Recorder"
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl SyncEventHandler for Broken {
        async fn handle(&self, _event: &SyncEvent) -> Result<(), SyncError> {
            Err(SyncError::ServiceClosed)
        }

        fn name(&self) -> &'static str {
            "Broken"
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_others() {
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Arc::new(Broken));
        dispatcher.register_handler(recorder.clone());

        let event = SyncEvent::Drained {
            flushed: 2,
            failed: 0,
        };
        dispatcher.dispatch(&event).await;

        assert_eq!(dispatcher.handler_count(), 2);
        assert_eq!(*recorder.events.lock().unwrap(), vec![event]);
    }

    #[test]
    fn active_set_tracks_membership() {
        let active = ActiveSet::new();
        assert!(active.insert("alice"));
        assert!(!active.insert("alice"));
        active.insert("bob");
        assert!(active.remove("alice"));

        assert_eq!(active.active_identities(), vec!["bob".to_string()]);
    }
}
