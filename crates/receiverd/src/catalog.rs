use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ReceiverError;

/// One finalized backup as the receiver knows it.
///
/// Rows are written at finalize time and never removed: retention marks
/// `archive_missing` instead of deleting history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
	pub id: String,
	pub archive_path: PathBuf,
	pub size: u64,
	pub md5: String,
	pub sha256: String,
	pub server: String,
	pub database: String,
	pub started_at: DateTime<Utc>,
	pub completed_at: DateTime<Utc>,
	#[serde(default)]
	pub archive_missing: bool,
}

/// Append-mostly record of everything this receiver has stored.
///
/// A JSON file with atomic write-temp-then-rename persistence; reads are
/// snapshot reads of the whole file.
#[derive(Debug)]
pub struct Catalog {
	path: PathBuf,
	lock: Mutex<()>,
}

impl Catalog {
	pub fn open(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			lock: Mutex::new(()),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	async fn load(&self) -> Result<Vec<CatalogEntry>, ReceiverError> {
		match tokio::fs::read(&self.path).await {
			Ok(bytes) => serde_json::from_slice(&bytes)
				.map_err(|err| ReceiverError::StoreUnreadable(format!("catalog: {err}"))),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(err) => Err(err.into()),
		}
	}

	async fn save(&self, entries: &[CatalogEntry]) -> Result<(), ReceiverError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let json = serde_json::to_vec_pretty(entries)
			.map_err(|err| ReceiverError::Internal(err.to_string()))?;
		let tmp = self.path.with_extension("json.tmp");
		tokio::fs::write(&tmp, json).await?;
		tokio::fs::rename(&tmp, &self.path).await?;
		Ok(())
	}

	pub async fn record(&self, entry: CatalogEntry) -> Result<(), ReceiverError> {
		let _guard = self.lock.lock().await;
		let mut entries = self.load().await?;
		debug!(id = %entry.id, path = ?entry.archive_path, "recording catalog entry");
		entries.push(entry);
		self.save(&entries).await
	}

	pub async fn all(&self) -> Result<Vec<CatalogEntry>, ReceiverError> {
		let _guard = self.lock.lock().await;
		self.load().await
	}

	pub async fn get(&self, id: &str) -> Result<Option<CatalogEntry>, ReceiverError> {
		Ok(self.all().await?.into_iter().find(|e| e.id == id))
	}

	/// Entries whose archive should still be on disk.
	pub async fn with_archive(&self) -> Result<Vec<CatalogEntry>, ReceiverError> {
		Ok(self
			.all()
			.await?
			.into_iter()
			.filter(|e| !e.archive_missing)
			.collect())
	}

	/// Whether `path` is an archive this catalog knows about.
	pub async fn knows_archive(&self, path: &Path) -> Result<bool, ReceiverError> {
		Ok(self.all().await?.iter().any(|e| e.archive_path == path))
	}

	pub async fn mark_archive_missing(&self, id: &str) -> Result<bool, ReceiverError> {
		let _guard = self.lock.lock().await;
		let mut entries = self.load().await?;
		let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
			return Ok(false);
		};
		entry.archive_missing = true;
		self.save(&entries).await?;
		Ok(true)
	}
}
