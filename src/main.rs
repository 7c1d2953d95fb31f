use balance_sync::balance::sync::events::{ActiveSet, SyncEventHandler};
use balance_sync::balance::sync::stats::SyncStats;
use balance_sync::ledger::{LocalLedger, MemoryLedger};
use balance_sync::{SyncConfig, SyncService};

use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting balance sync");

	// Optional JSON config file, otherwise BALANCE_SYNC_* environment variables
	let config = match std::env::args().nth(1) {
		Some(path) => match SyncConfig::load(Path::new(&path)).await {
			Ok(config) => config,
			Err(e) => {
				error!("{}", e);
				return;
			}
		},
		None => SyncConfig::from_env(),
	};

	let ledger = Arc::new(MemoryLedger::new());
	let active = Arc::new(ActiveSet::new());
	let stats = Arc::new(SyncStats::new());

	let handle = match SyncService::start(
		config,
		ledger.clone(),
		active.clone(),
		vec![stats.clone() as Arc<dyn SyncEventHandler>],
	)
	.await
	{
		Ok(handle) => handle,
		Err(e) => {
			error!("Balance sync disabled: {}", e);
			return;
		}
	};

	for (identity, balance) in [("alice", 100.0), ("bob", 50.0)] {
		ledger.set(identity, balance);
		active.insert(identity);
		if let Err(e) = handle.arrived(identity).await {
			warn!("Failed to signal arrival of {}: {}", identity, e);
		}
	}

	if let Err(e) = handle.tick().await {
		warn!("Failed to request reconciliation: {}", e);
	}
	info!("alice: {}", handle.link_command("alice").await);

	if let Err(e) = ledger.withdraw("bob", 20.0) {
		warn!("{}", e);
	}
	active.remove("bob");
	if let Err(e) = handle.departed("bob").await {
		warn!("Failed to signal departure of bob: {}", e);
	}

	match handle.shutdown().await {
		Ok(report) => info!(
			"Balance sync stopped: {} flushed, {} failed",
			report.flushed, report.failed
		),
		Err(e) => error!("Failed to stop balance sync: {}", e),
	}
	stats.log_summary();
}
