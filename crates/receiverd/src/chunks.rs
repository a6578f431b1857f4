use std::{
	collections::{BTreeSet, HashMap},
	num::NonZeroU64,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	sync::{Mutex, RwLock},
};
use tracing::{debug, info, instrument, warn};

use coldbak_proto::{
	checksum::{StreamingChecksum, md5_hex},
	chunk::chunk_count,
	metadata::FileMetadata,
	message::ChunkOutcome,
};

use crate::{error::ReceiverError, tokens::TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
	Init,
	Receiving,
	Finalizing,
	Done,
	Aborted,
}

/// In-memory state of one transfer. The staging directory is owned
/// exclusively by this session.
#[derive(Debug)]
struct Transfer {
	id: String,
	metadata: FileMetadata,
	chunk_size: NonZeroU64,
	staging_dir: PathBuf,
	received: BTreeSet<u64>,
	chunk_md5s: HashMap<u64, String>,
	bytes_received: u64,
	state: TransferState,
	last_activity: DateTime<Utc>,
}

impl Transfer {
	fn chunk_total(&self) -> u64 {
		chunk_count(self.metadata.size, self.chunk_size)
	}

	fn chunk_file(&self, index: u64) -> PathBuf {
		// Zero-padded so a directory listing sorts in chunk order.
		let digits = usize::try_from(self.chunk_total().max(1).ilog10() + 1).unwrap_or(1);
		self.staging_dir.join(format!("{index:0digits$}.chunk"))
	}

	fn expected_length(&self, index: u64) -> u64 {
		let total = self.chunk_total();
		if index + 1 == total {
			self.metadata.size - (total - 1) * self.chunk_size.get()
		} else {
			self.chunk_size.get()
		}
	}
}

/// Splits nothing, reassembles everything: receiver-side chunk bookkeeping.
///
/// Chunks may arrive in any order and more than once; every write is
/// checksum-gated; finalize demands the complete set and both whole-file
/// digests.
#[derive(Debug)]
pub struct ChunkManager {
	staging_root: PathBuf,
	tokens: Arc<TokenStore>,
	transfers: RwLock<HashMap<String, Arc<Mutex<Transfer>>>>,
}

/// Everything the protocol layer needs to answer a BEGIN that resumes.
#[derive(Debug, Clone)]
pub struct RestoredTransfer {
	pub transfer_id: String,
	pub completed: BTreeSet<u64>,
}

impl ChunkManager {
	pub fn new(staging_root: impl Into<PathBuf>, tokens: Arc<TokenStore>) -> Self {
		Self {
			staging_root: staging_root.into(),
			tokens,
			transfers: RwLock::new(HashMap::new()),
		}
	}

	pub fn tokens(&self) -> &TokenStore {
		&self.tokens
	}

	async fn transfer(&self, transfer_id: &str) -> Result<Arc<Mutex<Transfer>>, ReceiverError> {
		self.transfers
			.read()
			.await
			.get(transfer_id)
			.cloned()
			.ok_or_else(|| ReceiverError::UnknownTransfer(transfer_id.to_string()))
	}

	/// Start a fresh transfer for `metadata`.
	#[instrument(level = "debug", skip(self, metadata), fields(name = %metadata.name, size = metadata.size))]
	pub async fn init_transfer(
		&self,
		metadata: FileMetadata,
		chunk_size: u64,
	) -> Result<String, ReceiverError> {
		let chunk_size = NonZeroU64::new(chunk_size)
			.ok_or_else(|| ReceiverError::Validation("chunk size must be non-zero".into()))?;
		if metadata.name.trim().is_empty() {
			return Err(ReceiverError::Validation("file name is empty".into()));
		}

		let id = uuid::Uuid::new_v4().to_string();
		let staging_dir = self.staging_root.join(&id);
		tokio::fs::create_dir_all(&staging_dir).await?;

		let transfer = Transfer {
			id: id.clone(),
			metadata,
			chunk_size,
			staging_dir,
			received: BTreeSet::new(),
			chunk_md5s: HashMap::new(),
			bytes_received: 0,
			state: TransferState::Init,
			last_activity: Utc::now(),
		};
		self.transfers
			.write()
			.await
			.insert(id.clone(), Arc::new(Mutex::new(transfer)));
		info!(transfer_id = %id, "initialized transfer");
		Ok(id)
	}

	/// An unfinished transfer whose metadata describes the same file, if any.
	///
	/// This is what turns a reconnect into a RESUME_OFFER.
	pub async fn find_in_flight(&self, metadata: &FileMetadata) -> Option<String> {
		let transfers = self.transfers.read().await;
		for (id, transfer) in transfers.iter() {
			let transfer = transfer.lock().await;
			if matches!(transfer.state, TransferState::Init | TransferState::Receiving)
				&& transfer.metadata.describes_same_file(metadata)
			{
				return Some(id.clone());
			}
		}
		None
	}

	/// Issue (or return the existing) resume token for a transfer.
	pub async fn create_resume_token(&self, transfer_id: &str) -> Result<String, ReceiverError> {
		let transfer = self.transfer(transfer_id).await?;
		let transfer = transfer.lock().await;
		self.tokens
			.issue(
				transfer_id,
				&transfer.metadata,
				transfer.chunk_size.get(),
				&transfer.received,
			)
			.await
	}

	/// Completed indices for a live transfer.
	pub async fn completed_indices(&self, transfer_id: &str) -> Result<BTreeSet<u64>, ReceiverError> {
		let transfer = self.transfer(transfer_id).await?;
		let transfer = transfer.lock().await;
		Ok(transfer.received.clone())
	}

	/// Re-attach a transfer from a resume token.
	///
	/// The presented metadata must describe the same bytes the token was
	/// issued for; a completed token never restores anything.
	#[instrument(level = "debug", skip(self, metadata))]
	pub async fn restore_transfer(
		&self,
		token: &str,
		metadata: &FileMetadata,
	) -> Result<RestoredTransfer, ReceiverError> {
		let info = self.tokens.resume_info(token).await?;
		if !info.metadata.describes_same_file(metadata) {
			return Err(ReceiverError::ResumeMetadataMismatch);
		}

		// Live session still around (same process): just hand it back.
		if let Ok(live) = self.transfer(&info.transfer_id).await {
			let transfer = live.lock().await;
			return Ok(RestoredTransfer {
				transfer_id: transfer.id.clone(),
				completed: transfer.received.clone(),
			});
		}

		// Process restarted: rebuild from the token record and whatever
		// staged chunks survived on disk.
		let staging_dir = self.staging_root.join(&info.transfer_id);
		tokio::fs::create_dir_all(&staging_dir).await?;

		// SAFETY: the token store refuses zero chunk sizes at issue time
		let chunk_size = NonZeroU64::new(info.chunk_size)
			.ok_or_else(|| ReceiverError::Internal("token with zero chunk size".into()))?;

		let mut transfer = Transfer {
			id: info.transfer_id.clone(),
			metadata: info.metadata.clone(),
			chunk_size,
			staging_dir,
			received: BTreeSet::new(),
			chunk_md5s: HashMap::new(),
			bytes_received: 0,
			state: TransferState::Receiving,
			last_activity: Utc::now(),
		};

		for index in &info.completed {
			let path = transfer.chunk_file(*index);
			match tokio::fs::read(&path).await {
				Ok(bytes) if bytes.len() as u64 == transfer.expected_length(*index) => {
					transfer.chunk_md5s.insert(*index, md5_hex(&bytes));
					transfer.bytes_received += bytes.len() as u64;
					transfer.received.insert(*index);
				}
				Ok(_) | Err(_) => {
					// Lost or truncated on disk: the client will resend it.
					warn!(index, ?path, "staged chunk unusable, dropping from completed set");
					let _ = tokio::fs::remove_file(&path).await;
				}
			}
		}

		let restored = RestoredTransfer {
			transfer_id: transfer.id.clone(),
			completed: transfer.received.clone(),
		};
		self.transfers
			.write()
			.await
			.insert(restored.transfer_id.clone(), Arc::new(Mutex::new(transfer)));
		info!(transfer_id = %restored.transfer_id, chunks = restored.completed.len(), "restored transfer from token");
		Ok(restored)
	}

	/// Verify and stage one chunk. Idempotent for exact duplicates.
	pub async fn receive_chunk(
		&self,
		transfer_id: &str,
		index: u64,
		declared_md5: &str,
		bytes: &[u8],
	) -> Result<ChunkOutcome, ReceiverError> {
		let transfer = self.transfer(transfer_id).await?;
		let mut transfer = transfer.lock().await;

		if !matches!(transfer.state, TransferState::Init | TransferState::Receiving) {
			return Ok(ChunkOutcome::Error("TransferNotReceiving".into()));
		}

		let total = transfer.chunk_total();
		if index >= total {
			return Ok(ChunkOutcome::Error("ChunkIndexOutOfRange".into()));
		}
		if bytes.len() as u64 != transfer.expected_length(index) {
			return Ok(ChunkOutcome::Error("ChunkLengthMismatch".into()));
		}

		// Content addressing: the declared digest must match the bytes.
		let actual_md5 = md5_hex(bytes);
		if actual_md5 != declared_md5 {
			warn!(index, "chunk digest mismatch");
			return Ok(ChunkOutcome::Error("ChunkConflict".into()));
		}

		if transfer.received.contains(&index) {
			return Ok(match transfer.chunk_md5s.get(&index) {
				Some(stored) if *stored == actual_md5 => ChunkOutcome::AlreadyPresent,
				_ => ChunkOutcome::Error("ChunkConflict".into()),
			});
		}

		let path = transfer.chunk_file(index);
		let tmp = path.with_extension("chunk.tmp");
		tokio::fs::write(&tmp, bytes).await?;
		tokio::fs::rename(&tmp, &path).await?;

		transfer.received.insert(index);
		transfer.chunk_md5s.insert(index, actual_md5);
		transfer.bytes_received += bytes.len() as u64;
		transfer.state = TransferState::Receiving;
		transfer.last_activity = Utc::now();
		debug!(index, received = transfer.received.len(), total, "staged chunk");

		let received = transfer.received.clone();
		drop(transfer);
		self.tokens.record_progress(transfer_id, &received).await?;

		Ok(ChunkOutcome::Ok)
	}

	/// Indices still missing before finalize can succeed.
	pub async fn missing_chunks(&self, transfer_id: &str) -> Result<Vec<u64>, ReceiverError> {
		let transfer = self.transfer(transfer_id).await?;
		let transfer = transfer.lock().await;
		Ok((0..transfer.chunk_total())
			.filter(|index| !transfer.received.contains(index))
			.collect())
	}

	/// Assemble, verify, and move the archive to `destination`.
	///
	/// On digest mismatch the assembled file is deleted and the transfer
	/// aborted; the staged chunks go too, since they cannot be trusted.
	#[instrument(level = "debug", skip(self, destination))]
	pub async fn finalize(
		&self,
		transfer_id: &str,
		destination: &Path,
	) -> Result<PathBuf, ReceiverError> {
		let transfer = self.transfer(transfer_id).await?;
		let mut transfer = transfer.lock().await;

		let missing: Vec<u64> = (0..transfer.chunk_total())
			.filter(|index| !transfer.received.contains(index))
			.collect();
		if !missing.is_empty() {
			return Err(ReceiverError::MissingChunks { missing });
		}

		transfer.state = TransferState::Finalizing;

		if let Some(parent) = destination.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let partial = destination.with_extension("zip.part");

		let mut sum = StreamingChecksum::new();
		let mut out = tokio::fs::File::create(&partial).await?;
		let mut buf = vec![0u8; 64 * 1024];
		for index in 0..transfer.chunk_total() {
			let mut chunk = tokio::fs::File::open(transfer.chunk_file(index)).await?;
			loop {
				let n = chunk.read(&mut buf).await?;
				if n == 0 {
					break;
				}
				sum.update(&buf[..n]);
				out.write_all(&buf[..n]).await?;
			}
		}
		out.flush().await?;
		out.shutdown().await?;

		let assembled_bytes = sum.bytes_seen();
		let pair = sum.finish();
		if assembled_bytes != transfer.metadata.size
			|| pair.md5 != transfer.metadata.md5
			|| pair.sha256 != transfer.metadata.sha256
		{
			warn!(
				transfer_id = %transfer.id,
				expected_md5 = %transfer.metadata.md5,
				actual_md5 = %pair.md5,
				"assembled archive failed verification"
			);
			let _ = tokio::fs::remove_file(&partial).await;
			transfer.state = TransferState::Aborted;
			let staging = transfer.staging_dir.clone();
			drop(transfer);
			self.discard(transfer_id, &staging).await;
			return Err(ReceiverError::IntegrityFailure);
		}

		tokio::fs::rename(&partial, destination).await?;
		transfer.state = TransferState::Done;
		let staging = transfer.staging_dir.clone();
		info!(transfer_id = %transfer.id, ?destination, "archive finalized");
		drop(transfer);

		self.tokens.mark_completed(transfer_id).await?;
		self.discard(transfer_id, &staging).await;
		Ok(destination.to_path_buf())
	}

	async fn discard(&self, transfer_id: &str, staging_dir: &Path) {
		self.transfers.write().await.remove(transfer_id);
		if let Err(err) = tokio::fs::remove_dir_all(staging_dir).await {
			if err.kind() != std::io::ErrorKind::NotFound {
				warn!(?staging_dir, ?err, "failed to remove staging directory");
			}
		}
	}

	/// Drop idle unfinished transfers and sweep the token store.
	pub async fn sweep(
		&self,
		now: DateTime<Utc>,
		completed_grace: Duration,
		idle_ttl: Duration,
	) -> Result<(), ReceiverError> {
		let idle_cutoff = chrono::Duration::from_std(idle_ttl).unwrap_or(chrono::Duration::MAX);

		let stale: Vec<(String, PathBuf)> = {
			let transfers = self.transfers.read().await;
			let mut stale = Vec::new();
			for (id, transfer) in transfers.iter() {
				let transfer = transfer.lock().await;
				if matches!(transfer.state, TransferState::Init | TransferState::Receiving)
					&& now - transfer.last_activity >= idle_cutoff
				{
					stale.push((id.clone(), transfer.staging_dir.clone()));
				}
			}
			stale
		};

		for (id, staging) in stale {
			info!(transfer_id = %id, "dropping idle transfer");
			self.discard(&id, &staging).await;
		}

		self.tokens.sweep(now, completed_grace, idle_ttl).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use coldbak_proto::checksum::{HashPair, sha256_hex};

	struct Fixture {
		_dir: tempfile::TempDir,
		manager: ChunkManager,
		dest: PathBuf,
	}

	async fn fixture() -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let tokens = Arc::new(
			TokenStore::open(dir.path().join("tokens.json"))
				.await
				.unwrap(),
		);
		let manager = ChunkManager::new(dir.path().join("staging"), tokens);
		let dest = dir.path().join("out").join("archive.zip");
		Fixture {
			_dir: dir,
			manager,
			dest,
		}
	}

	fn data(len: usize) -> Vec<u8> {
		(0..len).map(|i| (i * 7 % 256) as u8).collect()
	}

	fn metadata_for(name: &str, bytes: &[u8]) -> FileMetadata {
		FileMetadata::new(
			name,
			bytes.len() as u64,
			HashPair {
				md5: md5_hex(bytes),
				sha256: sha256_hex(bytes),
			},
		)
	}

	async fn send_chunk(
		manager: &ChunkManager,
		id: &str,
		bytes: &[u8],
		chunk_size: usize,
		index: u64,
	) -> ChunkOutcome {
		let start = index as usize * chunk_size;
		let end = (start + chunk_size).min(bytes.len());
		let chunk = &bytes[start..end];
		manager
			.receive_chunk(id, index, &md5_hex(chunk), chunk)
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn out_of_order_chunks_reassemble_exactly() {
		let fx = fixture().await;
		let bytes = data(10_000);
		let meta = metadata_for("a.zip", &bytes);
		let id = fx.manager.init_transfer(meta, 4096).await.unwrap();

		for index in [2u64, 0, 1] {
			assert_eq!(send_chunk(&fx.manager, &id, &bytes, 4096, index).await, ChunkOutcome::Ok);
		}

		let path = fx.manager.finalize(&id, &fx.dest).await.unwrap();
		let written = tokio::fs::read(&path).await.unwrap();
		assert_eq!(written, bytes);
		assert_eq!(md5_hex(&written), md5_hex(&bytes));
		assert_eq!(sha256_hex(&written), sha256_hex(&bytes));
	}

	#[tokio::test]
	async fn duplicates_are_idempotent_and_conflicts_rejected() {
		let fx = fixture().await;
		let bytes = data(5000);
		let id = fx
			.manager
			.init_transfer(metadata_for("a.zip", &bytes), 4096)
			.await
			.unwrap();

		assert_eq!(send_chunk(&fx.manager, &id, &bytes, 4096, 0).await, ChunkOutcome::Ok);
		assert_eq!(
			send_chunk(&fx.manager, &id, &bytes, 4096, 0).await,
			ChunkOutcome::AlreadyPresent
		);

		// Same index, different bytes with a matching declared digest.
		let other = vec![9u8; 4096];
		assert_eq!(
			fx.manager
				.receive_chunk(&id, 0, &md5_hex(&other), &other)
				.await
				.unwrap(),
			ChunkOutcome::Error("ChunkConflict".into())
		);

		// Declared digest that does not match the bytes.
		assert_eq!(
			fx.manager
				.receive_chunk(&id, 1, &"0".repeat(32), &bytes[4096..])
				.await
				.unwrap(),
			ChunkOutcome::Error("ChunkConflict".into())
		);
	}

	#[tokio::test]
	async fn finalize_requires_the_complete_set() {
		let fx = fixture().await;
		let bytes = data(10_000);
		let id = fx
			.manager
			.init_transfer(metadata_for("a.zip", &bytes), 4096)
			.await
			.unwrap();
		send_chunk(&fx.manager, &id, &bytes, 4096, 0).await;
		send_chunk(&fx.manager, &id, &bytes, 4096, 2).await;

		match fx.manager.finalize(&id, &fx.dest).await {
			Err(ReceiverError::MissingChunks { missing }) => assert_eq!(missing, vec![1]),
			other => panic!("expected MissingChunks, got {other:?}"),
		}

		// Supplying the rest makes finalize pass.
		send_chunk(&fx.manager, &id, &bytes, 4096, 1).await;
		fx.manager.finalize(&id, &fx.dest).await.unwrap();
	}

	#[tokio::test]
	async fn integrity_failure_deletes_the_assembled_file() {
		let fx = fixture().await;
		let bytes = data(5000);
		// Metadata lies about the whole-file digests.
		let mut meta = metadata_for("a.zip", &bytes);
		meta.md5 = "0".repeat(32);
		meta.sha256 = "0".repeat(64);
		let id = fx.manager.init_transfer(meta, 4096).await.unwrap();
		send_chunk(&fx.manager, &id, &bytes, 4096, 0).await;
		send_chunk(&fx.manager, &id, &bytes, 4096, 1).await;

		assert!(matches!(
			fx.manager.finalize(&id, &fx.dest).await,
			Err(ReceiverError::IntegrityFailure)
		));
		assert!(!fx.dest.exists());
		assert!(!fx.dest.with_extension("zip.part").exists());
	}

	#[tokio::test]
	async fn resume_round_trip_produces_identical_bytes() {
		let fx = fixture().await;
		let bytes = data(1024 * 1024);
		let chunk_size = 256 * 1024;
		let meta = metadata_for("db.zip", &bytes);
		let id = fx.manager.init_transfer(meta.clone(), chunk_size as u64).await.unwrap();

		// Chunks 0..=2 land, then the client goes away.
		for index in 0..3u64 {
			send_chunk(&fx.manager, &id, &bytes, chunk_size, index).await;
		}
		let token = fx.manager.create_resume_token(&id).await.unwrap();

		let restored = fx.manager.restore_transfer(&token, &meta).await.unwrap();
		assert_eq!(restored.transfer_id, id);
		assert_eq!(restored.completed, BTreeSet::from([0, 1, 2]));

		send_chunk(&fx.manager, &restored.transfer_id, &bytes, chunk_size, 3).await;
		let path = fx
			.manager
			.finalize(&restored.transfer_id, &fx.dest)
			.await
			.unwrap();
		assert_eq!(tokio::fs::read(path).await.unwrap(), bytes);

		// The token finished its life: no further restores.
		assert!(matches!(
			fx.manager.restore_transfer(&token, &meta).await,
			Err(ReceiverError::TokenAlreadyCompleted)
		));
	}

	#[tokio::test]
	async fn restore_refuses_mismatched_metadata() {
		let fx = fixture().await;
		let bytes = data(5000);
		let id = fx
			.manager
			.init_transfer(metadata_for("a.zip", &bytes), 4096)
			.await
			.unwrap();
		let token = fx.manager.create_resume_token(&id).await.unwrap();

		let other = metadata_for("a.zip", &data(6000));
		assert!(matches!(
			fx.manager.restore_transfer(&token, &other).await,
			Err(ReceiverError::ResumeMetadataMismatch)
		));
	}

	#[tokio::test]
	async fn zero_chunk_size_is_refused() {
		let fx = fixture().await;
		let bytes = data(100);
		assert!(
			fx.manager
				.init_transfer(metadata_for("a.zip", &bytes), 0)
				.await
				.is_err()
		);
	}
}
