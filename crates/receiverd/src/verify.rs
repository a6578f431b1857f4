use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use coldbak_proto::checksum::hash_file;

use crate::{error::ReceiverError, layout::StorageLayout};

/// Companion metadata as read back from disk.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMeta {
	md5: String,
	sha256: String,
	size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
	Ok,
	MissingMeta,
	SizeMismatch,
	ChecksumMismatch,
}

/// Re-hash one archive against its companion `.meta.json`.
#[instrument(level = "debug")]
pub async fn verify_archive(archive: &Path) -> Result<VerifyOutcome, ReceiverError> {
	let meta_path = StorageLayout::meta_path(archive);
	let meta: StoredMeta = match tokio::fs::read(&meta_path).await {
		Ok(bytes) => serde_json::from_slice(&bytes)
			.map_err(|err| ReceiverError::StoreUnreadable(format!("{meta_path:?}: {err}")))?,
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
			return Ok(VerifyOutcome::MissingMeta);
		}
		Err(err) => return Err(err.into()),
	};

	let (pair, size) = hash_file(archive).await?;
	if size != meta.size {
		return Ok(VerifyOutcome::SizeMismatch);
	}
	if pair.md5 != meta.md5 || pair.sha256 != meta.sha256 {
		return Ok(VerifyOutcome::ChecksumMismatch);
	}
	debug!(?archive, "archive verified");
	Ok(VerifyOutcome::Ok)
}

/// Verify every `.zip` under the storage root. Returns `(path, outcome)`
/// pairs; I/O errors on individual files are reported as outcomes upstream
/// can render rather than aborting the walk.
pub async fn verify_all(root: &Path) -> Result<Vec<(PathBuf, VerifyOutcome)>, ReceiverError> {
	let mut archives = Vec::new();
	for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
		if entry.file_type().is_file()
			&& entry.path().extension().is_some_and(|ext| ext == "zip")
		{
			archives.push(entry.path().to_path_buf());
		}
	}

	let mut results = Vec::with_capacity(archives.len());
	for archive in archives {
		let outcome = verify_archive(&archive).await?;
		results.push((archive, outcome));
	}
	Ok(results)
}

#[cfg(test)]
mod tests {
	use super::*;
	use coldbak_proto::checksum::{md5_hex, sha256_hex};

	async fn write_archive(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
		let archive = dir.join(name);
		tokio::fs::write(&archive, bytes).await.unwrap();
		let meta = serde_json::json!({
			"md5": md5_hex(bytes),
			"sha256": sha256_hex(bytes),
			"size": bytes.len(),
			"createdAt": chrono::Utc::now(),
			"server": "s1",
			"database": "db1",
			"originalName": name,
		});
		tokio::fs::write(
			StorageLayout::meta_path(&archive),
			serde_json::to_vec_pretty(&meta).unwrap(),
		)
		.await
		.unwrap();
		archive
	}

	#[tokio::test]
	async fn intact_archives_verify() {
		let dir = tempfile::tempdir().unwrap();
		let archive = write_archive(dir.path(), "a.zip", b"archive bytes").await;
		assert_eq!(verify_archive(&archive).await.unwrap(), VerifyOutcome::Ok);
	}

	#[tokio::test]
	async fn tampering_is_detected() {
		let dir = tempfile::tempdir().unwrap();
		let archive = write_archive(dir.path(), "a.zip", b"archive bytes").await;
		tokio::fs::write(&archive, b"archive bytez").await.unwrap();
		assert_eq!(
			verify_archive(&archive).await.unwrap(),
			VerifyOutcome::ChecksumMismatch
		);

		tokio::fs::write(&archive, b"short").await.unwrap();
		assert_eq!(
			verify_archive(&archive).await.unwrap(),
			VerifyOutcome::SizeMismatch
		);
	}

	#[tokio::test]
	async fn walk_covers_nested_archives() {
		let dir = tempfile::tempdir().unwrap();
		let nested = dir.path().join("s1/2024/01");
		tokio::fs::create_dir_all(&nested).await.unwrap();
		write_archive(&nested, "a.zip", b"one").await;
		let orphan = nested.join("orphan.zip");
		tokio::fs::write(&orphan, b"no meta").await.unwrap();

		let results = verify_all(dir.path()).await.unwrap();
		assert_eq!(results.len(), 2);
		assert!(results.iter().any(|(p, o)| p.ends_with("a.zip") && *o == VerifyOutcome::Ok));
		assert!(
			results
				.iter()
				.any(|(p, o)| p.ends_with("orphan.zip") && *o == VerifyOutcome::MissingMeta)
		);
	}
}
