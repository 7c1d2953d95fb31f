use crate::store::{BalanceRecord, RecordPatch, StoreError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info};

/// URL scheme of the in-process store.
pub const MEMORY_SCHEME: &str = "memory://";
/// URL scheme of the file-backed document store.
pub const FILE_SCHEME: &str = "file://";

/// Repository for per-identity balance documents
///
/// `upsert` must be atomic per identity: concurrent upserts for the same identity never lose
/// one another's fields.
#[async_trait::async_trait]
pub trait BalanceRepository: Send + Sync {
	/// Point lookup by identity. A missing document is `Ok(None)`.
	async fn find_one(&self, identity: &str) -> Result<Option<BalanceRecord>, StoreError>;

	/// Write the present fields of `patch`, creating the document if needed.
	async fn upsert(
		&self,
		identity: &str,
		patch: &RecordPatch,
	) -> Result<BalanceRecord, StoreError>;

	/// Write `patch` only if the document exists and was last updated at `expected`.
	///
	/// Returns `Ok(None)` when the document is missing or has been written since.
	async fn compare_and_upsert(
		&self,
		identity: &str,
		expected: DateTime<Utc>,
		patch: &RecordPatch,
	) -> Result<Option<BalanceRecord>, StoreError>;

	/// Release the underlying connection.
	async fn close(&self) -> Result<(), StoreError> {
		Ok(())
	}

	/// Get the name of this repository for logging.
	fn name(&self) -> &'static str;
}

/// Open the repository named by a store URL.
///
/// Supported URLs are `memory://` and `file://<directory>`.
pub async fn open_repository(url: &str) -> Result<Arc<dyn BalanceRepository>, StoreError> {
	if url == MEMORY_SCHEME {
		info!("Opened in-memory balance store");
		return Ok(Arc::new(MemoryBalanceRepository::new()));
	}

	if let Some(path) = url.strip_prefix(FILE_SCHEME) {
		if path.is_empty() {
			return Err(StoreError::InvalidUrl(url.to_string()));
		}
		let repository = FileBalanceRepository::open(PathBuf::from(path)).await?;
		return Ok(Arc::new(repository));
	}

	Err(StoreError::InvalidUrl(url.to_string()))
}

/// Pause point for one `find_one` call of a [`MemoryBalanceRepository`].
#[derive(Debug, Default)]
pub struct ReadGate {
	entered: Notify,
	release: Notify,
}

impl ReadGate {
	/// Wait until the held read has taken its snapshot.
	pub async fn entered(&self) {
		self.entered.notified().await;
	}

	/// Let the held read return.
	pub fn release(&self) {
		self.release.notify_one();
	}
}

/// In-process implementation of BalanceRepository
///
/// Reads and writes can be made to fail on demand, and a read can be held open after taking its
/// snapshot, which the sync tests use to simulate an unreachable or slow remote store.
#[derive(Default)]
pub struct MemoryBalanceRepository {
	records: DashMap<String, BalanceRecord>,
	failing_reads: AtomicBool,
	failing_writes: AtomicUsize,
	write_attempts: AtomicUsize,
	reads: AtomicUsize,
	held_read: Mutex<Option<Arc<ReadGate>>>,
	closed: AtomicBool,
}

impl MemoryBalanceRepository {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed a document directly, bypassing upsert.
	pub fn insert(&self, record: BalanceRecord) {
		self.records.insert(record.identity.clone(), record);
	}

	/// Read a document directly, bypassing fault injection and the closed flag.
	pub fn get(&self, identity: &str) -> Option<BalanceRecord> {
		self.records.get(identity).map(|record| record.clone())
	}

	/// Make every `find_one` fail until reset.
	pub fn fail_reads(&self, failing: bool) {
		self.failing_reads.store(failing, Ordering::SeqCst);
	}

	/// Make the next `count` upserts fail.
	pub fn fail_next_writes(&self, count: usize) {
		self.failing_writes.store(count, Ordering::SeqCst);
	}

	/// Hold the next `find_one` after it has read the document, until the gate is released.
	pub fn hold_next_read(&self) -> Arc<ReadGate> {
		let gate = Arc::new(ReadGate::default());
		if let Ok(mut held) = self.held_read.lock() {
			*held = Some(gate.clone());
		}
		gate
	}

	/// Total number of writes attempted, failed ones included.
	pub fn write_attempts(&self) -> usize {
		self.write_attempts.load(Ordering::SeqCst)
	}

	/// Total number of successful `find_one` calls.
	pub fn reads(&self) -> usize {
		self.reads.load(Ordering::SeqCst)
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	fn ensure_open(&self) -> Result<(), StoreError> {
		if self.is_closed() {
			return Err(StoreError::Connection("store is closed".to_string()));
		}
		Ok(())
	}

	/// Count a write attempt and consume one injected failure, if any is left.
	fn begin_write(&self, identity: &str) -> Result<(), StoreError> {
		self.ensure_open()?;
		self.write_attempts.fetch_add(1, Ordering::SeqCst);

		let refused = self
			.failing_writes
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
				remaining.checked_sub(1)
			})
			.is_ok();
		if refused {
			return Err(StoreError::Unavailable(format!(
				"write of {} refused",
				identity
			)));
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl BalanceRepository for MemoryBalanceRepository {
	async fn find_one(&self, identity: &str) -> Result<Option<BalanceRecord>, StoreError> {
		self.ensure_open()?;
		if self.failing_reads.load(Ordering::SeqCst) {
			return Err(StoreError::Unavailable(format!(
				"read of {} refused",
				identity
			)));
		}
		let record = self.records.get(identity).map(|record| record.clone());
		self.reads.fetch_add(1, Ordering::SeqCst);

		let gate = self.held_read.lock().ok().and_then(|mut held| held.take());
		if let Some(gate) = gate {
			gate.entered.notify_one();
			gate.release.notified().await;
		}
		Ok(record)
	}

	async fn upsert(
		&self,
		identity: &str,
		patch: &RecordPatch,
	) -> Result<BalanceRecord, StoreError> {
		self.begin_write(identity)?;

		// The entry guard holds the shard lock, so the read-modify-write is atomic per identity.
		let mut entry = self
			.records
			.entry(identity.to_string())
			.or_insert_with(|| {
				BalanceRecord::new(identity, patch.last_updated.unwrap_or_else(Utc::now))
			});
		entry.apply(patch);
		Ok(entry.clone())
	}

	async fn compare_and_upsert(
		&self,
		identity: &str,
		expected: DateTime<Utc>,
		patch: &RecordPatch,
	) -> Result<Option<BalanceRecord>, StoreError> {
		self.begin_write(identity)?;

		let Some(mut entry) = self.records.get_mut(identity) else {
			return Ok(None);
		};
		if entry.last_updated != expected {
			return Ok(None);
		}
		entry.apply(patch);
		Ok(Some(entry.clone()))
	}

	async fn close(&self) -> Result<(), StoreError> {
		self.closed.store(true, Ordering::SeqCst);
		Ok(())
	}

	fn name(&self) -> &'static str {
		"MemoryBalanceRepository"
	}
}

/// File-based implementation of BalanceRepository
///
/// Each identity is stored as one pretty-printed JSON document in the data directory. Writes go
/// to a temporary file which is then renamed over the document.
pub struct FileBalanceRepository {
	data_dir: PathBuf,
	write_lock: tokio::sync::Mutex<()>,
	closed: AtomicBool,
}

impl FileBalanceRepository {
	/// Open (and create if needed) the data directory.
	pub async fn open(data_dir: PathBuf) -> Result<Self, StoreError> {
		tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
			StoreError::Connection(format!(
				"Failed to create data directory {:?}: {}",
				data_dir, e
			))
		})?;

		let metadata = tokio::fs::metadata(&data_dir).await?;
		if !metadata.is_dir() {
			return Err(StoreError::Connection(format!(
				"{:?} is not a directory",
				data_dir
			)));
		}

		info!("Opened file balance store at {:?}", data_dir);
		Ok(Self {
			data_dir,
			write_lock: tokio::sync::Mutex::new(()),
			closed: AtomicBool::new(false),
		})
	}

	pub fn data_dir(&self) -> &Path {
		&self.data_dir
	}

	fn get_record_filename(&self, identity: &str) -> PathBuf {
		self.data_dir
			.join(format!("balance_{}.json", encode_identity(identity)))
	}

	fn ensure_open(&self) -> Result<(), StoreError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(StoreError::Connection("store is closed".to_string()));
		}
		Ok(())
	}

	async fn read_record(&self, filename: &Path) -> Result<Option<BalanceRecord>, StoreError> {
		let content = match tokio::fs::read_to_string(filename).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		Ok(Some(serde_json::from_str(&content)?))
	}

	async fn write_record(&self, filename: &Path, record: &BalanceRecord) -> Result<(), StoreError> {
		let content = serde_json::to_string_pretty(record)?;
		let tmp_filename = filename.with_extension("json.tmp");
		tokio::fs::write(&tmp_filename, content).await?;
		tokio::fs::rename(&tmp_filename, filename).await?;

		debug!("Saved balance document {:?}", filename);
		Ok(())
	}
}

#[async_trait::async_trait]
impl BalanceRepository for FileBalanceRepository {
	async fn find_one(&self, identity: &str) -> Result<Option<BalanceRecord>, StoreError> {
		self.ensure_open()?;
		let filename = self.get_record_filename(identity);
		let record = self.read_record(&filename).await?;
		debug!("Loaded balance document {:?} (found: {})", filename, record.is_some());
		Ok(record)
	}

	async fn upsert(
		&self,
		identity: &str,
		patch: &RecordPatch,
	) -> Result<BalanceRecord, StoreError> {
		self.ensure_open()?;
		let _guard = self.write_lock.lock().await;

		let filename = self.get_record_filename(identity);
		let mut record = self.read_record(&filename).await?.unwrap_or_else(|| {
			BalanceRecord::new(identity, patch.last_updated.unwrap_or_else(Utc::now))
		});
		record.apply(patch);

		self.write_record(&filename, &record).await?;
		Ok(record)
	}

	async fn compare_and_upsert(
		&self,
		identity: &str,
		expected: DateTime<Utc>,
		patch: &RecordPatch,
	) -> Result<Option<BalanceRecord>, StoreError> {
		self.ensure_open()?;
		let _guard = self.write_lock.lock().await;

		let filename = self.get_record_filename(identity);
		let Some(mut record) = self.read_record(&filename).await? else {
			return Ok(None);
		};
		if record.last_updated != expected {
			debug!(
				"Balance document {:?} changed since {}, not writing",
				filename, expected
			);
			return Ok(None);
		}
		record.apply(patch);

		self.write_record(&filename, &record).await?;
		Ok(Some(record))
	}

	async fn close(&self) -> Result<(), StoreError> {
		// Wait for an in-flight write to land before refusing new ones.
		let _guard = self.write_lock.lock().await;
		self.closed.store(true, Ordering::SeqCst);
		info!("Closed file balance store at {:?}", self.data_dir);
		Ok(())
	}

	fn name(&self) -> &'static str {
		"FileBalanceRepository"
	}
}

/// Map an identity onto a file-name-safe string. Alphanumerics, `-` and `_` pass through,
/// every other byte becomes `%xx`.
fn encode_identity(identity: &str) -> String {
	let mut encoded = String::with_capacity(identity.len());
	for byte in identity.bytes() {
		if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
			encoded.push(byte as char);
		} else {
			encoded.push_str(&format!("%{:02x}", byte));
		}
	}
	encoded
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::{Duration, Utc};

	#[tokio::test]
	async fn memory_upsert_creates_then_sets_fields() {
		let repo = MemoryBalanceRepository::new();
		assert!(repo.find_one("alice").await.unwrap().is_none());

		let now = Utc::now();
		repo.upsert("alice", &RecordPatch::balance(100.0, now))
			.await
			.unwrap();
		repo.upsert("alice", &RecordPatch::link("123456789", "acct-1"))
			.await
			.unwrap();

		let record = repo.find_one("alice").await.unwrap().unwrap();
		assert_eq!(record.balance, 100.0);
		assert_eq!(record.last_updated, now);
		assert!(record.linked);
		assert_eq!(record.link_code.as_deref(), Some("123456789"));
		assert_eq!(repo.len(), 1);
	}

	#[tokio::test]
	async fn memory_failures_are_injected_and_counted() {
		let repo = MemoryBalanceRepository::new();
		repo.fail_next_writes(2);

		let patch = RecordPatch::balance(1.0, Utc::now());
		assert!(repo.upsert("bob", &patch).await.is_err());
		assert!(repo.upsert("bob", &patch).await.is_err());
		assert!(repo.upsert("bob", &patch).await.is_ok());
		assert_eq!(repo.write_attempts(), 3);

		repo.fail_reads(true);
		assert!(matches!(
			repo.find_one("bob").await,
			Err(StoreError::Unavailable(_))
		));
	}

	#[tokio::test]
	async fn memory_refuses_after_close() {
		let repo = MemoryBalanceRepository::new();
		repo.close().await.unwrap();
		assert!(repo.is_closed());
		assert!(matches!(
			repo.find_one("carol").await,
			Err(StoreError::Connection(_))
		));
	}

	#[tokio::test]
	async fn file_repository_persists_documents() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileBalanceRepository::open(dir.path().join("store"))
			.await
			.unwrap();

		let earlier = Utc::now() - Duration::minutes(5);
		repo.upsert("dave", &RecordPatch::balance(42.5, earlier))
			.await
			.unwrap();
		repo.upsert("dave", &RecordPatch::link("555555555", "acct-9"))
			.await
			.unwrap();

		let reopened = FileBalanceRepository::open(dir.path().join("store"))
			.await
			.unwrap();
		let record = reopened.find_one("dave").await.unwrap().unwrap();
		assert_eq!(record.identity, "dave");
		assert_eq!(record.balance, 42.5);
		assert_eq!(record.last_updated, earlier);
		assert_eq!(record.linked_account.as_deref(), Some("acct-9"));
		assert!(reopened.find_one("erin").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn open_repository_dispatches_on_scheme() {
		let dir = tempfile::tempdir().unwrap();

		let memory = open_repository("memory://").await.unwrap();
		assert_eq!(memory.name(), "MemoryBalanceRepository");

		let url = format!("file://{}", dir.path().display());
		let file = open_repository(&url).await.unwrap();
		assert_eq!(file.name(), "FileBalanceRepository");

		assert!(matches!(
			open_repository("mongodb://localhost").await,
			Err(StoreError::InvalidUrl(_))
		));
		assert!(matches!(
			open_repository("file://").await,
			Err(StoreError::InvalidUrl(_))
		));
	}

	#[tokio::test]
	async fn compare_and_upsert_refuses_changed_documents() {
		let dir = tempfile::tempdir().unwrap();
		let memory: Arc<dyn BalanceRepository> = Arc::new(MemoryBalanceRepository::new());
		let file: Arc<dyn BalanceRepository> =
			Arc::new(FileBalanceRepository::open(dir.path().to_path_buf()).await.unwrap());

		for repo in [memory, file] {
			let first = Utc::now() - Duration::minutes(1);
			let patch = RecordPatch::balance(8.0, Utc::now());
			assert!(
				repo.compare_and_upsert("kim", first, &patch)
					.await
					.unwrap()
					.is_none()
			);

			repo.upsert("kim", &RecordPatch::balance(10.0, first))
				.await
				.unwrap();
			let written = repo
				.compare_and_upsert("kim", first, &patch)
				.await
				.unwrap()
				.unwrap();
			assert_eq!(written.balance, 8.0);

			// The document moved on, so the same expectation is now stale.
			let again = RecordPatch::balance(3.0, Utc::now());
			assert!(
				repo.compare_and_upsert("kim", first, &again)
					.await
					.unwrap()
					.is_none()
			);
			assert_eq!(repo.find_one("kim").await.unwrap().unwrap().balance, 8.0);
		}
	}

	#[tokio::test]
	async fn held_read_returns_its_snapshot_once_released() {
		let repo = Arc::new(MemoryBalanceRepository::new());
		repo.upsert("lee", &RecordPatch::balance(1.0, Utc::now()))
			.await
			.unwrap();
		let gate = repo.hold_next_read();

		let reader = {
			let repo = repo.clone();
			tokio::spawn(async move { repo.find_one("lee").await })
		};
		gate.entered().await;
		repo.upsert("lee", &RecordPatch::balance(2.0, Utc::now()))
			.await
			.unwrap();
		gate.release();

		let snapshot = reader.await.unwrap().unwrap().unwrap();
		assert_eq!(snapshot.balance, 1.0);
		assert_eq!(repo.find_one("lee").await.unwrap().unwrap().balance, 2.0);
		assert_eq!(repo.reads(), 2);
	}

	#[test]
	fn identities_are_encoded_for_file_names() {
		assert_eq!(encode_identity("Steve_01"), "Steve_01");
		assert_eq!(encode_identity("a/b c"), "a%2fb%20c");
	}
}
