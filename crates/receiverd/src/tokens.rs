use std::{
	collections::{BTreeSet, HashMap},
	path::PathBuf,
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use coldbak_proto::{metadata::FileMetadata, token};

use crate::error::ReceiverError;

/// Persisted state of one resume token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeTokenRecord {
	pub token: String,
	pub transfer_id: String,
	pub metadata: FileMetadata,
	pub chunk_size: u64,
	pub completed: BTreeSet<u64>,
	pub created_at: DateTime<Utc>,
	pub last_activity: DateTime<Utc>,
	pub is_completed: bool,
	pub completed_at: Option<DateTime<Utc>>,
}

/// Resume info handed back to the protocol layer.
#[derive(Debug, Clone)]
pub struct ResumeInfo {
	pub transfer_id: String,
	pub metadata: FileMetadata,
	pub chunk_size: u64,
	pub completed: BTreeSet<u64>,
	pub last_activity: DateTime<Utc>,
}

/// Token store: survives restarts, one mutex around the persistence layer.
#[derive(Debug)]
pub struct TokenStore {
	path: PathBuf,
	inner: Mutex<HashMap<String, ResumeTokenRecord>>,
}

impl TokenStore {
	pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ReceiverError> {
		let path = path.into();
		let records = match tokio::fs::read(&path).await {
			Ok(bytes) => serde_json::from_slice::<Vec<ResumeTokenRecord>>(&bytes)
				.map_err(|err| ReceiverError::StoreUnreadable(format!("resume tokens: {err}")))?,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
			Err(err) => return Err(err.into()),
		};
		debug!(count = records.len(), ?path, "loaded resume tokens");
		Ok(Self {
			path,
			inner: Mutex::new(records.into_iter().map(|r| (r.token.clone(), r)).collect()),
		})
	}

	async fn persist(&self, map: &HashMap<String, ResumeTokenRecord>) -> Result<(), ReceiverError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let mut records: Vec<&ResumeTokenRecord> = map.values().collect();
		records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		let json = serde_json::to_vec_pretty(&records)
			.map_err(|err| ReceiverError::Internal(err.to_string()))?;
		let tmp = self.path.with_extension("json.tmp");
		tokio::fs::write(&tmp, json).await?;
		tokio::fs::rename(&tmp, &self.path).await?;
		Ok(())
	}

	/// Issue a token for an in-progress transfer.
	///
	/// Tokens are 1:1 with transfers: a second call for the same transfer
	/// returns the existing token.
	pub async fn issue(
		&self,
		transfer_id: &str,
		metadata: &FileMetadata,
		chunk_size: u64,
		completed: &BTreeSet<u64>,
	) -> Result<String, ReceiverError> {
		let mut map = self.inner.lock().await;

		if let Some(existing) = map.values().find(|r| r.transfer_id == transfer_id) {
			return Ok(existing.token.clone());
		}

		let mut value = token::generate();
		while map.contains_key(&value) {
			value = token::generate();
		}

		let now = Utc::now();
		map.insert(
			value.clone(),
			ResumeTokenRecord {
				token: value.clone(),
				transfer_id: transfer_id.to_string(),
				metadata: metadata.clone(),
				chunk_size,
				completed: completed.clone(),
				created_at: now,
				last_activity: now,
				is_completed: false,
				completed_at: None,
			},
		);
		self.persist(&map).await?;
		info!(transfer_id, "issued resume token");
		Ok(value)
	}

	pub async fn get(&self, token: &str) -> Option<ResumeTokenRecord> {
		if !token::is_well_formed(token) {
			return None;
		}
		self.inner.lock().await.get(token).cloned()
	}

	/// Resume info for a live (not completed) token.
	pub async fn resume_info(&self, token: &str) -> Result<ResumeInfo, ReceiverError> {
		let record = self
			.get(token)
			.await
			.ok_or(ReceiverError::UnknownResumeToken)?;
		if record.is_completed {
			return Err(ReceiverError::TokenAlreadyCompleted);
		}
		Ok(ResumeInfo {
			transfer_id: record.transfer_id,
			metadata: record.metadata,
			chunk_size: record.chunk_size,
			completed: record.completed,
			last_activity: record.last_activity,
		})
	}

	/// Sync completed-chunk progress for the transfer's token, if one exists.
	pub async fn record_progress(
		&self,
		transfer_id: &str,
		completed: &BTreeSet<u64>,
	) -> Result<(), ReceiverError> {
		let mut map = self.inner.lock().await;
		let Some(record) = map.values_mut().find(|r| r.transfer_id == transfer_id) else {
			return Ok(());
		};
		record.completed = completed.clone();
		record.last_activity = Utc::now();
		self.persist(&map).await
	}

	/// Mark the transfer's token complete. A completed token never
	/// authorizes another restore.
	pub async fn mark_completed(&self, transfer_id: &str) -> Result<(), ReceiverError> {
		let mut map = self.inner.lock().await;
		let Some(record) = map.values_mut().find(|r| r.transfer_id == transfer_id) else {
			return Ok(());
		};
		record.is_completed = true;
		record.completed_at = Some(Utc::now());
		record.last_activity = Utc::now();
		self.persist(&map).await
	}

	/// Drop completed tokens past their grace period (measured from
	/// completion) and stale incomplete tokens (measured from last
	/// activity).
	pub async fn sweep(
		&self,
		now: DateTime<Utc>,
		completed_grace: Duration,
		idle_ttl: Duration,
	) -> Result<usize, ReceiverError> {
		let completed_grace =
			chrono::Duration::from_std(completed_grace).unwrap_or(chrono::Duration::MAX);
		let idle_ttl = chrono::Duration::from_std(idle_ttl).unwrap_or(chrono::Duration::MAX);

		let mut map = self.inner.lock().await;
		let before = map.len();
		map.retain(|_, record| {
			if record.is_completed {
				match record.completed_at {
					Some(at) => now - at < completed_grace,
					None => {
						warn!(token = ?record.token, "completed token without completion time");
						false
					}
				}
			} else {
				now - record.last_activity < idle_ttl
			}
		});
		let swept = before - map.len();
		if swept > 0 {
			info!(swept, "swept resume tokens");
			self.persist(&map).await?;
		}
		Ok(swept)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use coldbak_proto::checksum::{HashPair, md5_hex, sha256_hex};

	fn metadata() -> FileMetadata {
		FileMetadata::new(
			"a.zip",
			100,
			HashPair {
				md5: md5_hex(b"a"),
				sha256: sha256_hex(b"a"),
			},
		)
	}

	#[tokio::test]
	async fn issue_is_one_to_one_with_transfer() {
		let dir = tempfile::tempdir().unwrap();
		let store = TokenStore::open(dir.path().join("tokens.json")).await.unwrap();

		let done = BTreeSet::from([0, 1]);
		let t1 = store.issue("tx1", &metadata(), 4096, &done).await.unwrap();
		let t2 = store.issue("tx1", &metadata(), 4096, &done).await.unwrap();
		assert_eq!(t1, t2);
		assert!(t1.starts_with("RT_"));

		let info = store.resume_info(&t1).await.unwrap();
		assert_eq!(info.transfer_id, "tx1");
		assert_eq!(info.completed, done);
	}

	#[tokio::test]
	async fn tokens_survive_restart() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tokens.json");

		let token = {
			let store = TokenStore::open(&path).await.unwrap();
			store
				.issue("tx1", &metadata(), 4096, &BTreeSet::new())
				.await
				.unwrap()
		};

		let store = TokenStore::open(&path).await.unwrap();
		assert!(store.get(&token).await.is_some());
	}

	#[tokio::test]
	async fn completed_tokens_never_authorize_again_and_get_swept() {
		let dir = tempfile::tempdir().unwrap();
		let store = TokenStore::open(dir.path().join("tokens.json")).await.unwrap();

		let token = store
			.issue("tx1", &metadata(), 4096, &BTreeSet::new())
			.await
			.unwrap();
		store.mark_completed("tx1").await.unwrap();

		assert!(matches!(
			store.resume_info(&token).await,
			Err(ReceiverError::TokenAlreadyCompleted)
		));
		let record = store.get(&token).await.unwrap();
		assert!(record.is_completed);

		// Inside the grace window it stays; past it, it goes.
		let now = Utc::now();
		let grace = Duration::from_secs(3600);
		assert_eq!(store.sweep(now, grace, grace).await.unwrap(), 0);
		let later = now + chrono::Duration::hours(2);
		assert_eq!(store.sweep(later, grace, grace).await.unwrap(), 1);
		assert!(store.get(&token).await.is_none());
	}

	#[tokio::test]
	async fn idle_incomplete_tokens_are_swept_from_last_activity() {
		let dir = tempfile::tempdir().unwrap();
		let store = TokenStore::open(dir.path().join("tokens.json")).await.unwrap();
		store
			.issue("tx1", &metadata(), 4096, &BTreeSet::new())
			.await
			.unwrap();

		let later = Utc::now() + chrono::Duration::days(8);
		let swept = store
			.sweep(later, Duration::from_secs(3600), Duration::from_secs(7 * 86_400))
			.await
			.unwrap();
		assert_eq!(swept, 1);
	}
}
