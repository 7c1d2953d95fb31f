//! Background sync actor.
//!
//! The host talks to the engine through a [`SyncHandle`]: signals are queued on a bounded channel
//! and each one is handled on its own task, so the host never waits on the remote store. A
//! periodic interval reconciles every active identity, skipping a tick while the previous batch
//! is still running. Shutdown stops accepting signals, waits for in-flight work, drains the cache
//! to the store and closes it.

use crate::balance::sync::engine::SyncEngine;
use crate::balance::sync::events::{ActiveIdentities, HostEvent, SyncEventHandler};
use crate::balance::{DrainReport, SyncError};
use crate::config::SyncConfig;
use crate::ledger::LocalLedger;
use crate::store::open_repository;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

enum Command {
	Host(HostEvent),
	Shutdown(oneshot::Sender<DrainReport>),
}

/// Entry points for starting the sync actor
pub struct SyncService;

impl SyncService {
	/// Validate `config`, open the store it names and start the actor.
	///
	/// An error means the subsystem must stay disabled; the host keeps running without it.
	pub async fn start(
		config: SyncConfig,
		ledger: Arc<dyn LocalLedger>,
		active: Arc<dyn ActiveIdentities>,
		handlers: Vec<Arc<dyn SyncEventHandler>>,
	) -> Result<SyncHandle, SyncError> {
		config.validate()?;
		let repository = open_repository(&config.store_url).await?;

		let engine = handlers
			.into_iter()
			.fold(SyncEngine::new(repository, ledger, &config), |engine, handler| {
				engine.with_handler(handler)
			});

		Ok(Self::spawn(Arc::new(engine), active, &config))
	}

	/// Start the actor around an existing engine.
	pub fn spawn(
		engine: Arc<SyncEngine>,
		active: Arc<dyn ActiveIdentities>,
		config: &SyncConfig,
	) -> SyncHandle {
		let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
		let actor = tokio::spawn(run(
			engine.clone(),
			active,
			receiver,
			config.tick_interval(),
		));

		info!(
			"Balance sync started (tick every {:?})",
			config.tick_interval()
		);
		SyncHandle {
			sender,
			engine,
			actor,
		}
	}
}

/// Handle to a running sync actor
pub struct SyncHandle {
	sender: mpsc::Sender<Command>,
	engine: Arc<SyncEngine>,
	actor: JoinHandle<()>,
}

impl SyncHandle {
	/// Queue a host signal, waiting only for channel capacity.
	pub async fn send(&self, event: HostEvent) -> Result<(), SyncError> {
		self.sender
			.send(Command::Host(event))
			.await
			.map_err(|_| SyncError::ServiceClosed)
	}

	pub async fn arrived(&self, identity: &str) -> Result<(), SyncError> {
		self.send(HostEvent::Arrived(identity.to_string())).await
	}

	pub async fn departed(&self, identity: &str) -> Result<(), SyncError> {
		self.send(HostEvent::Departed(identity.to_string())).await
	}

	/// Request an immediate `reconcile_all`, outside the regular interval.
	pub async fn tick(&self) -> Result<(), SyncError> {
		self.send(HostEvent::Tick).await
	}

	pub fn engine(&self) -> &Arc<SyncEngine> {
		&self.engine
	}

	/// Handle the link request command for `identity`.
	pub async fn link_command(&self, identity: &str) -> String {
		crate::balance::command::link_command(&self.engine, identity).await
	}

	/// Stop the actor, drain the cache and close the store.
	pub async fn shutdown(self) -> Result<DrainReport, SyncError> {
		let (reply, report) = oneshot::channel();
		self.sender
			.send(Command::Shutdown(reply))
			.await
			.map_err(|_| SyncError::ServiceClosed)?;

		let report = report.await.map_err(|_| SyncError::ServiceClosed)?;
		if let Err(e) = self.actor.await {
			error!("Sync actor terminated abnormally: {}", e);
		}
		Ok(report)
	}
}

async fn run(
	engine: Arc<SyncEngine>,
	active: Arc<dyn ActiveIdentities>,
	mut commands: mpsc::Receiver<Command>,
	tick_interval: Duration,
) {
	let mut ticker = tokio::time::interval(tick_interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	// The first tick completes immediately.
	ticker.tick().await;

	let mut tasks = JoinSet::new();
	let batch_running = Arc::new(AtomicBool::new(false));

	let reply = loop {
		tokio::select! {
			_ = ticker.tick() => {
				handle_event(&engine, &active, &batch_running, &mut tasks, HostEvent::Tick);
			}
			Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
				if let Err(e) = joined {
					error!("Sync task failed: {}", e);
				}
			}
			command = commands.recv() => match command {
				Some(Command::Host(event)) => {
					handle_event(&engine, &active, &batch_running, &mut tasks, event)
				}
				Some(Command::Shutdown(reply)) => break Some(reply),
				None => {
					warn!("All sync handles dropped, shutting down");
					break None;
				}
			},
		}
	};

	commands.close();
	info!("Stopping balance sync, waiting for {} in-flight task(s)", tasks.len());
	while let Some(joined) = tasks.join_next().await {
		if let Err(e) = joined {
			error!("Sync task failed: {}", e);
		}
	}

	let report = engine.shutdown_drain().await;
	if let Err(e) = engine.close().await {
		error!("Failed to close balance store: {}", e);
	}

	if let Some(reply) = reply {
		let _ = reply.send(report);
	}
}

fn handle_event(
	engine: &Arc<SyncEngine>,
	active: &Arc<dyn ActiveIdentities>,
	batch_running: &Arc<AtomicBool>,
	tasks: &mut JoinSet<()>,
	event: HostEvent,
) {
	debug!("Handling {:?}", event);
	let engine = engine.clone();

	match event {
		HostEvent::Arrived(identity) => {
			tasks.spawn(async move {
				if let Err(e) = engine.reconcile(&identity).await {
					warn!("Failed to sync {} on arrival: {}", identity, e);
				}
			});
		}
		HostEvent::Departed(identity) => {
			tasks.spawn(async move {
				engine.push_departure(&identity).await;
			});
		}
		HostEvent::Tick => {
			if batch_running.swap(true, Ordering::SeqCst) {
				debug!("Previous reconciliation still running, skipping tick");
				return;
			}
			let active = active.clone();
			let batch_running = batch_running.clone();
			tasks.spawn(async move {
				let report = engine.reconcile_all(active.as_ref()).await;
				batch_running.store(false, Ordering::SeqCst);
				if report.total() > 0 {
					info!("Reconciled {}", report.summary());
				}
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::balance::sync::events::ActiveSet;
	use crate::balance::sync::stats::SyncStats;
	use crate::ledger::MemoryLedger;
	use crate::store::MemoryBalanceRepository;

	fn memory_config(tick_interval_ms: u64) -> SyncConfig {
		SyncConfig {
			store_url: "memory://".to_string(),
			tick_interval_ms,
			..Default::default()
		}
	}

	#[tokio::test]
	async fn start_refuses_placeholder_store() {
		let result = SyncService::start(
			SyncConfig::default(),
			Arc::new(MemoryLedger::new()),
			Arc::new(ActiveSet::new()),
			Vec::new(),
		)
		.await;
		assert!(matches!(result, Err(SyncError::ConfigError(_))));

		let result = SyncService::start(
			SyncConfig {
				store_url: "mongodb://localhost:27017".to_string(),
				..Default::default()
			},
			Arc::new(MemoryLedger::new()),
			Arc::new(ActiveSet::new()),
			Vec::new(),
		)
		.await;
		assert!(matches!(result, Err(SyncError::StoreError(_))));
	}

	#[tokio::test]
	async fn arrival_departure_and_shutdown() {
		let repository = Arc::new(MemoryBalanceRepository::new());
		let ledger = Arc::new(MemoryLedger::new());
		let stats = Arc::new(SyncStats::new());
		let config = memory_config(60_000);
		let engine = Arc::new(
			SyncEngine::new(repository.clone(), ledger.clone(), &config).with_handler(stats.clone()),
		);

		ledger.set("alice", 100.0);
		ledger.set("bob", 20.0);
		let handle = SyncService::spawn(engine, Arc::new(ActiveSet::new()), &config);

		handle.arrived("alice").await.unwrap();
		handle.departed("bob").await.unwrap();
		let report = handle.shutdown().await.unwrap();

		assert_eq!(report, DrainReport { flushed: 2, failed: 0 });
		assert!(repository.is_closed());
		assert_eq!(repository.get("alice").map(|r| r.balance), Some(100.0));
		assert_eq!(repository.get("bob").map(|r| r.balance), Some(20.0));

		let snapshot = stats.snapshot();
		assert_eq!(snapshot.created, 1);
		assert_eq!(snapshot.departures, 1);
		assert_eq!(snapshot.drained, 2);
	}

	#[tokio::test]
	async fn interval_reconciles_active_identities() {
		let repository = Arc::new(MemoryBalanceRepository::new());
		let ledger = Arc::new(MemoryLedger::new());
		let active = Arc::new(ActiveSet::new());
		let config = memory_config(20);
		let engine = Arc::new(SyncEngine::new(repository.clone(), ledger.clone(), &config));

		for identity in ["carol", "dave"] {
			ledger.set(identity, 7.0);
			active.insert(identity);
		}
		let handle = SyncService::spawn(engine, active, &config);

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(repository.len(), 2);
		assert_eq!(handle.engine().cache().get("carol"), Some(7.0));

		handle.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn tick_is_skipped_while_batch_is_running() {
		let repository = Arc::new(MemoryBalanceRepository::new());
		let ledger = Arc::new(MemoryLedger::new());
		let active = Arc::new(ActiveSet::new());
		let config = memory_config(60_000);
		let engine = Arc::new(SyncEngine::new(repository.clone(), ledger.clone(), &config));

		ledger.set("kate", 4.0);
		active.insert("kate");
		let gate = repository.hold_next_read();
		let handle = SyncService::spawn(engine, active, &config);

		handle.tick().await.unwrap();
		gate.entered().await;
		for _ in 0..3 {
			handle.tick().await.unwrap();
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
		gate.release();

		handle.shutdown().await.unwrap();
		assert_eq!(repository.reads(), 1);
		assert_eq!(repository.get("kate").map(|r| r.balance), Some(4.0));
	}

	#[tokio::test]
	async fn explicit_tick_and_link_command() {
		let repository = Arc::new(MemoryBalanceRepository::new());
		let ledger = Arc::new(MemoryLedger::new());
		let active = Arc::new(ActiveSet::new());
		let config = memory_config(60_000);
		let engine = Arc::new(SyncEngine::new(repository.clone(), ledger.clone(), &config));

		ledger.set("erin", 3.0);
		active.insert("erin");
		let handle = SyncService::spawn(engine, active, &config);

		handle.tick().await.unwrap();
		let reply = handle.link_command("erin").await;
		assert!(reply.starts_with("Your link code is: "));

		let report = handle.shutdown().await.unwrap();
		assert_eq!(report.flushed, 1);
		assert_eq!(repository.get("erin").map(|r| r.balance), Some(3.0));
	}
}
