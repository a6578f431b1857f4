use std::path::{Path, PathBuf};

use async_zip::{Compression, ZipEntryBuilder, tokio::write::ZipFileWriter};
use futures::AsyncWriteExt as _;
use tokio::io::AsyncReadExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::error::BackupError;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Files to archive, discovered up front so progress has a denominator.
#[derive(Debug)]
struct Inventory {
	files: Vec<(PathBuf, String, u64)>,
	total_bytes: u64,
}

fn inventory(source: &Path) -> Result<Inventory, BackupError> {
	let mut files = Vec::new();
	let mut total_bytes = 0u64;

	for entry in WalkDir::new(source).sort_by_file_name() {
		let entry = entry.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;
		if !entry.file_type().is_file() {
			continue;
		}
		let meta = entry
			.metadata()
			.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;
		// UNWRAP: every walked entry is under `source`
		let relative = entry.path().strip_prefix(source).unwrap();
		let name = relative
			.components()
			.map(|c| c.as_os_str().to_string_lossy())
			.collect::<Vec<_>>()
			.join("/");
		total_bytes += meta.len();
		files.push((entry.path().to_path_buf(), name, meta.len()));
	}

	Ok(Inventory { files, total_bytes })
}

/// Stream a directory tree into one zip archive.
///
/// Progress is reported as bytes read from the source. On any error (or
/// cancellation) the partial archive is removed before returning.
#[instrument(level = "debug", skip(on_progress, cancel))]
pub async fn compress_dir(
	source: &Path,
	target: &Path,
	on_progress: impl Fn(u64, u64) + Send + Sync,
	cancel: &CancellationToken,
) -> Result<u64, BackupError> {
	let result = compress_inner(source, target, &on_progress, cancel).await;
	if result.is_err() {
		cleanup_archive(target).await;
	}
	result
}

async fn compress_inner(
	source: &Path,
	target: &Path,
	on_progress: &(impl Fn(u64, u64) + Send + Sync),
	cancel: &CancellationToken,
) -> Result<u64, BackupError> {
	let inventory = inventory(source)?;
	info!(
		files = inventory.files.len(),
		bytes = inventory.total_bytes,
		?target,
		"compressing directory"
	);

	if let Some(parent) = target.parent() {
		tokio::fs::create_dir_all(parent)
			.await
			.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;
	}
	let mut file = tokio::fs::File::create(target)
		.await
		.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;
	let mut writer = ZipFileWriter::with_tokio(&mut file);

	let mut read_so_far = 0u64;
	let mut buf = vec![0u8; READ_BUF_SIZE];

	for (path, name, _len) in &inventory.files {
		if cancel.is_cancelled() {
			return Err(BackupError::Cancelled);
		}
		debug!(?path, "adding to archive");

		let builder = ZipEntryBuilder::new(name.clone().into(), Compression::Deflate);
		let mut entry = writer
			.write_entry_stream(builder)
			.await
			.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;

		let mut input = tokio::fs::File::open(path)
			.await
			.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;
		loop {
			if cancel.is_cancelled() {
				return Err(BackupError::Cancelled);
			}
			let n = input
				.read(&mut buf)
				.await
				.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;
			if n == 0 {
				break;
			}
			entry
				.write_all(&buf[..n])
				.await
				.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;
			read_so_far += n as u64;
			on_progress(read_so_far, inventory.total_bytes);
		}

		entry
			.close()
			.await
			.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;
	}

	writer
		.close()
		.await
		.map_err(|err| BackupError::CompressionFailed(err.to_string()))?;

	let archive_bytes = tokio::fs::metadata(target)
		.await
		.map_err(|err| BackupError::CompressionFailed(err.to_string()))?
		.len();
	info!(archive_bytes, "archive written");
	Ok(archive_bytes)
}

/// Best-effort removal of a partial archive.
pub async fn cleanup_archive(target: &Path) {
	match tokio::fs::remove_file(target).await {
		Ok(()) => debug!(?target, "removed partial archive"),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
		Err(err) => warn!(?target, "failed to remove partial archive: {err}"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn populate(dir: &Path) -> u64 {
		let sub = dir.join("data").join("ib");
		tokio::fs::create_dir_all(&sub).await.unwrap();
		let mut total = 0u64;
		for (name, len) in [("ibdata1", 400_000usize), ("db.opt", 120_000), ("tiny", 17)] {
			let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
			total += bytes.len() as u64;
			tokio::fs::write(sub.join(name), bytes).await.unwrap();
		}
		total
	}

	#[tokio::test]
	async fn progress_covers_every_source_byte() {
		let dir = tempfile::tempdir().unwrap();
		let total = populate(dir.path()).await;
		let target = dir.path().join("out.zip");

		let seen = std::sync::Mutex::new((0u64, 0u64));
		let written = compress_dir(
			dir.path(),
			&target,
			|read, total| {
				let mut seen = seen.lock().unwrap();
				assert!(read >= seen.0, "progress went backwards");
				*seen = (read, total);
			},
			&CancellationToken::new(),
		)
		.await
		.unwrap();

		let (read, reported_total) = *seen.lock().unwrap();
		assert_eq!(read, total);
		assert_eq!(reported_total, total);
		assert!(written > 0);
		assert!(target.exists());
	}

	#[tokio::test]
	async fn cancellation_removes_the_partial_archive() {
		let dir = tempfile::tempdir().unwrap();
		populate(dir.path()).await;
		let target = dir.path().join("out.zip");

		let cancel = CancellationToken::new();
		cancel.cancel();
		let result = compress_dir(dir.path(), &target, |_, _| {}, &cancel).await;

		assert!(matches!(result, Err(BackupError::Cancelled)));
		assert!(!target.exists());
	}

	#[tokio::test]
	async fn missing_source_fails_without_leaving_output() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("out.zip");
		let result = compress_dir(
			&dir.path().join("nope"),
			&target,
			|_, _| {},
			&CancellationToken::new(),
		)
		.await;
		assert!(result.is_err());
		assert!(!target.exists());
	}
}
