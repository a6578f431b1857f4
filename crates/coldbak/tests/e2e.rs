//! Full client↔receiver exchanges over localhost TCP.

use std::{num::NonZeroU64, path::PathBuf, sync::Mutex, time::Duration};

use chrono::{TimeZone as _, Utc};
use tokio::{net::TcpStream, sync::oneshot};
use tokio_util::sync::CancellationToken;

use coldbak::transfer::TransferClient;
use coldbak_proto::{
	checksum::{md5_hex, sha256_hex},
	metadata::FileMetadata,
};
use coldbak_receiverd::{Catalog, ReceiverConfig};

struct Receiver {
	port: u16,
	storage: PathBuf,
	shutdown: Option<oneshot::Sender<()>>,
	_dir: tempfile::TempDir,
}

impl Drop for Receiver {
	fn drop(&mut self) {
		if let Some(tx) = self.shutdown.take() {
			let _ = tx.send(());
		}
	}
}

async fn start_receiver() -> Receiver {
	let dir = tempfile::tempdir().unwrap();
	let storage = dir.path().join("storage");

	let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
	let port = listener.local_addr().unwrap().port();
	drop(listener);

	let mut config = ReceiverConfig::new(&storage, port, [3u8; 32]);
	config.bind = "127.0.0.1".into();
	config.retention_interval = None;

	let (tx, rx) = oneshot::channel();
	tokio::spawn(coldbak_receiverd::run_with_shutdown(config, rx));

	for _ in 0..100 {
		if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
			return Receiver {
				port,
				storage,
				shutdown: Some(tx),
				_dir: dir,
			};
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	panic!("receiver did not start listening");
}

fn client(port: u16) -> TransferClient {
	TransferClient {
		host: "127.0.0.1".into(),
		port,
		tls: false,
		client_id: "default-client".into(),
		client_secret: "default-secret-2024".into(),
		chunk_size: NonZeroU64::new(256 * 1024).unwrap(),
		max_in_flight: 4,
	}
}

async fn stage_archive(dir: &std::path::Path, len: usize) -> (PathBuf, FileMetadata, Vec<u8>) {
	let bytes: Vec<u8> = (0..len).map(|i| (i * 17 % 249) as u8).collect();
	let path = dir.join("20240115_103000_s1_db1.zip");
	tokio::fs::write(&path, &bytes).await.unwrap();

	let metadata = FileMetadata {
		name: "20240115_103000_s1_db1.zip".into(),
		size: bytes.len() as u64,
		md5: md5_hex(&bytes),
		sha256: sha256_hex(&bytes),
		created_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
	};
	(path, metadata, bytes)
}

#[tokio::test]
async fn one_mebibyte_travels_in_four_chunks_and_verifies() {
	let receiver = start_receiver().await;
	let work = tempfile::tempdir().unwrap();
	let (path, metadata, bytes) = stage_archive(work.path(), 1024 * 1024).await;

	let progress: Mutex<Vec<(u64, u64)>> = Mutex::default();
	let outcome = client(receiver.port)
		.send_file(
			&path,
			&metadata,
			None,
			&|_| {},
			&|sent, total| progress.lock().unwrap().push((sent, total)),
			&CancellationToken::new(),
		)
		.await
		.unwrap();

	assert_eq!(outcome.chunks.len(), 4);
	assert_eq!(outcome.bytes_sent, bytes.len() as u64);

	let expected = receiver
		.storage
		.join("s1/2024/01/20240115_103000_s1_db1.zip");
	assert_eq!(PathBuf::from(&outcome.remote_path), expected);

	let stored = tokio::fs::read(&expected).await.unwrap();
	assert_eq!(md5_hex(&stored), metadata.md5);
	assert_eq!(sha256_hex(&stored), metadata.sha256);
	assert_eq!(stored.len() as u64, metadata.size);

	// Progress was monotonic and reached the full size.
	let progress = progress.lock().unwrap();
	for pair in progress.windows(2) {
		assert!(pair[1].0 >= pair[0].0);
	}
	assert_eq!(progress.last().unwrap().0, metadata.size);

	// The receiver catalogued the backup.
	let catalog = Catalog::open(receiver.storage.join("catalog.json"));
	assert!(catalog.knows_archive(&expected).await.unwrap());
}

#[tokio::test]
async fn second_attempt_resumes_instead_of_restarting() {
	let receiver = start_receiver().await;
	let work = tempfile::tempdir().unwrap();
	let (path, metadata, bytes) = stage_archive(work.path(), 1024 * 1024).await;

	// First attempt is cancelled mid-flight: some chunks land, no finalize.
	let cancel = CancellationToken::new();
	{
		let cancel_for_progress = cancel.clone();
		let progress_cancel = move |sent: u64, _total: u64| {
			if sent >= 256 * 1024 {
				cancel_for_progress.cancel();
			}
		};
		let result = client(receiver.port)
			.send_file(&path, &metadata, None, &|_| {}, &progress_cancel, &cancel)
			.await;
		assert!(result.is_err(), "expected the first attempt to be cut short");
	}

	// Second attempt: the receiver recognizes the metadata, offers a
	// resume, and the transfer completes with identical bytes.
	let tokens: Mutex<Vec<String>> = Mutex::default();
	let outcome = client(receiver.port)
		.send_file(
			&path,
			&metadata,
			None,
			&|token| tokens.lock().unwrap().push(token.to_string()),
			&|_, _| {},
			&CancellationToken::new(),
		)
		.await
		.unwrap();

	let tokens = tokens.lock().unwrap();
	assert_eq!(tokens.len(), 1, "expected exactly one resume offer");
	assert!(tokens[0].starts_with("RT_"));
	// Fewer than all four chunks travelled on the second attempt.
	assert!(outcome.chunks.len() < 4);

	let stored = tokio::fs::read(&outcome.remote_path).await.unwrap();
	assert_eq!(stored, bytes);
}
