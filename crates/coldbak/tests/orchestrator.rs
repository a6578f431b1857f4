//! Orchestrator state-machine runs against fake collaborators.

use std::{
	path::{Path, PathBuf},
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, AtomicU32, Ordering},
	},
	time::Duration,
};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use coldbak::{
	alerts::{AlertChannel, AlertRouter, AlertRouterConfig, FileLogChannel, Severity},
	error::BackupError,
	mysql::{ServiceControl, ServiceState},
	orchestrator::Orchestrator,
	progress::ProgressReport,
	recovery::ErrorRecovery,
	store::{
		BackupConfiguration, BackupStatus, SourceConfig, Store, TargetConfig,
	},
	transfer::TransferOutcome,
};
use coldbak_proto::{chunk::ChunkHeader, metadata::FileMetadata};

#[derive(Debug, Default)]
struct FakeMySql {
	running: AtomicBool,
	fail_start: AtomicBool,
	stop_calls: AtomicU32,
	start_calls: AtomicU32,
}

impl FakeMySql {
	fn new_running() -> FakeMySqlHandle {
		let fake = Self::default();
		fake.running.store(true, Ordering::SeqCst);
		FakeMySqlHandle(Arc::new(fake))
	}
}

#[derive(Debug, Clone)]
struct FakeMySqlHandle(Arc<FakeMySql>);

impl std::ops::Deref for FakeMySqlHandle {
	type Target = FakeMySql;

	fn deref(&self) -> &FakeMySql {
		&self.0
	}
}

impl ServiceControl for FakeMySqlHandle {
	async fn stop(&self) -> Result<(), BackupError> {
		self.stop_calls.fetch_add(1, Ordering::SeqCst);
		self.running.store(false, Ordering::SeqCst);
		Ok(())
	}

	async fn start(&self) -> Result<(), BackupError> {
		self.start_calls.fetch_add(1, Ordering::SeqCst);
		if self.fail_start.load(Ordering::SeqCst) {
			return Err(BackupError::MySqlStartFailed {
				service: "mysql".into(),
				reason: "unit refused to start".into(),
			});
		}
		self.running.store(true, Ordering::SeqCst);
		Ok(())
	}

	async fn is_running(&self) -> Result<bool, BackupError> {
		Ok(self.running.load(Ordering::SeqCst))
	}

	async fn wait_until(&self, state: ServiceState, _: Duration) -> Result<(), BackupError> {
		let running = self.running.load(Ordering::SeqCst);
		let reached = matches!(state, ServiceState::Running) == running;
		if reached {
			Ok(())
		} else {
			Err(BackupError::MySqlTimeout {
				service: "mysql".into(),
				timeout: Duration::ZERO,
			})
		}
	}
}

enum TransferMode {
	Succeed,
	WaitForCancel,
}

struct FakeTransfer {
	mode: TransferMode,
	progress_seen: Arc<Mutex<Vec<u64>>>,
}

impl coldbak::orchestrator::TransferStep for FakeTransfer {
	async fn send(
		&self,
		_archive: &Path,
		metadata: &FileMetadata,
		_resume_token: Option<&str>,
		_on_token: &(dyn Fn(&str) + Send + Sync),
		on_progress: &(dyn Fn(u64, u64) + Send + Sync),
		cancel: &CancellationToken,
	) -> Result<TransferOutcome, BackupError> {
		match self.mode {
			TransferMode::Succeed => {
				on_progress(metadata.size, metadata.size);
				self.progress_seen.lock().unwrap().push(metadata.size);
				Ok(TransferOutcome {
					transfer_id: "tx-fake".into(),
					remote_path: "/remote/s1/2024/01/archive.zip".into(),
					bytes_sent: metadata.size,
					chunks: vec![ChunkHeader {
						index: 0,
						length: metadata.size,
						md5: metadata.md5.clone(),
						is_last: true,
					}],
				})
			}
			TransferMode::WaitForCancel => {
				// Roughly 40% through, then the run is torn down under us.
				on_progress(metadata.size * 2 / 5, metadata.size);
				cancel.cancelled().await;
				Err(BackupError::Cancelled)
			}
		}
	}
}

struct Fixture {
	dir: tempfile::TempDir,
	store: Arc<Store>,
	config: BackupConfiguration,
	alerts_file: PathBuf,
}

async fn fixture() -> Fixture {
	let dir = tempfile::tempdir().unwrap();

	let data_dir = dir.path().join("mysql-data");
	tokio::fs::create_dir_all(&data_dir).await.unwrap();
	for (name, len) in [("ibdata1", 300_000usize), ("users.ibd", 150_000)] {
		let bytes: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
		tokio::fs::write(data_dir.join(name), bytes).await.unwrap();
	}

	let store = Arc::new(Store::open(dir.path().join("state")));
	let config = BackupConfiguration {
		id: "c1".into(),
		name: "nightly".into(),
		source: SourceConfig {
			host: "127.0.0.1".into(),
			port: 3306,
			username: "root".into(),
			password: "pw".into(),
			service_name: "mysql".into(),
			data_dir,
		},
		target: TargetConfig {
			host: "receiver.example".into(),
			port: 7115,
			tls: false,
		},
		server_label: "s1".into(),
		database_label: "db1".into(),
		client_id: "default-client".into(),
		client_secret: "default-secret-2024".into(),
		chunk_size: 256 * 1024,
		active: true,
		created_at: Utc::now(),
	};
	store.config_put(config.clone()).await.unwrap();

	let alerts_file = dir.path().join("alerts.jsonl");
	Fixture {
		dir,
		store,
		config,
		alerts_file,
	}
}

fn orchestrator(
	fx: &Fixture,
	mysql: FakeMySqlHandle,
	mode: TransferMode,
) -> Orchestrator<FakeMySqlHandle, FakeTransfer> {
	let alerts = Arc::new(AlertRouter::new(
		AlertRouterConfig {
			min_severity: Severity::Warning,
			..AlertRouterConfig::default()
		},
		vec![AlertChannel::FileLog(FileLogChannel::new(&fx.alerts_file))],
	));
	let transfer = FakeTransfer {
		mode,
		progress_seen: Arc::default(),
	};
	Orchestrator::new(
		fx.store.clone(),
		mysql,
		transfer,
		Arc::new(ErrorRecovery::new(alerts)),
		fx.dir.path().join("work"),
	)
}

async fn work_dir_is_empty(fx: &Fixture) -> bool {
	match tokio::fs::read_dir(fx.dir.path().join("work")).await {
		Ok(mut entries) => entries.next_entry().await.unwrap().is_none(),
		Err(_) => true,
	}
}

#[tokio::test]
async fn happy_path_completes_with_mysql_running() {
	let fx = fixture().await;
	let mysql = FakeMySql::new_running();
	let orchestrator = orchestrator(&fx, mysql.clone(), TransferMode::Succeed);

	let reports: Arc<Mutex<Vec<ProgressReport>>> = Arc::default();
	let result = {
		let reports = reports.clone();
		orchestrator
			.run(
				&fx.config,
				move |report| reports.lock().unwrap().push(report),
				CancellationToken::new(),
			)
			.await
	};

	assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
	assert_eq!(result.log.status, BackupStatus::Completed);
	assert_eq!(
		result.log.archive_path.as_deref(),
		Some("/remote/s1/2024/01/archive.zip")
	);
	assert!(result.log.archive_bytes.unwrap() > 0);
	assert_eq!(result.log.chunks.len(), 1);
	assert!(result.log.finished_at.is_some());

	// The service is running again and was stopped exactly once.
	assert!(mysql.running.load(Ordering::SeqCst));
	assert_eq!(mysql.stop_calls.load(Ordering::SeqCst), 1);
	assert_eq!(mysql.start_calls.load(Ordering::SeqCst), 1);

	// The staged local archive is gone.
	assert!(work_dir_is_empty(&fx).await);

	// Progress never went backwards and ended complete.
	let reports = reports.lock().unwrap();
	for pair in reports.windows(2) {
		assert!(pair[1].overall >= pair[0].overall);
	}
	let last = reports.last().unwrap();
	assert_eq!(last.phase, BackupStatus::Completed);
	assert!((last.overall - 1.0).abs() < f64::EPSILON);

	// The persisted log agrees with the returned one.
	let stored = fx.store.log_get(&result.log.id).await.unwrap().unwrap();
	assert_eq!(stored.status, BackupStatus::Completed);
}

#[tokio::test]
async fn cancellation_during_transfer_still_restarts_mysql_and_cleans_up() {
	let fx = fixture().await;
	let mysql = FakeMySql::new_running();
	let orchestrator = orchestrator(&fx, mysql.clone(), TransferMode::WaitForCancel);

	let cancel = CancellationToken::new();
	let run = {
		let cancel = cancel.clone();
		let config = fx.config.clone();
		async move { orchestrator.run(&config, |_| {}, cancel).await }
	};
	let run = tokio::spawn(run);

	tokio::time::sleep(Duration::from_millis(300)).await;
	cancel.cancel();
	let result = tokio::time::timeout(Duration::from_secs(10), run)
		.await
		.expect("run did not finish after cancellation")
		.unwrap();

	assert_eq!(result.log.status, BackupStatus::Cancelled);
	assert!(matches!(result.error, Some(BackupError::Cancelled)));

	// The tie-break: cancelled mid-transfer, but MySQL came back and the
	// temp archive is gone.
	assert!(mysql.running.load(Ordering::SeqCst));
	assert!(mysql.start_calls.load(Ordering::SeqCst) >= 1);
	assert!(work_dir_is_empty(&fx).await);
}

#[tokio::test]
async fn failed_restart_surfaces_mysql_error_and_alerts() {
	let fx = fixture().await;
	let mysql = FakeMySql::new_running();
	mysql.fail_start.store(true, Ordering::SeqCst);
	let orchestrator = orchestrator(&fx, mysql.clone(), TransferMode::Succeed);

	let result = orchestrator
		.run(&fx.config, |_| {}, CancellationToken::new())
		.await;

	// Transfer succeeded, but the log must not read Completed while the
	// service is down.
	assert_eq!(result.log.status, BackupStatus::Failed);
	let err = result.error.expect("expected an error");
	assert_eq!(err.exit_code(), 3);
	assert!(matches!(
		err,
		BackupError::MySqlStartFailed { .. } | BackupError::RetryExhausted { .. }
	));

	// A critical alert went out.
	let alerts = tokio::fs::read_to_string(&fx.alerts_file).await.unwrap();
	assert!(alerts.to_lowercase().contains("mysql"), "{alerts}");
}

#[tokio::test]
async fn invalid_configuration_fails_without_touching_mysql() {
	let fx = fixture().await;
	let mysql = FakeMySql::new_running();
	let orchestrator = orchestrator(&fx, mysql.clone(), TransferMode::Succeed);

	let mut config = fx.config.clone();
	config.chunk_size = 0;
	let result = orchestrator.run(&config, |_| {}, CancellationToken::new()).await;

	assert_eq!(result.log.status, BackupStatus::Failed);
	assert_eq!(result.error.unwrap().exit_code(), 2);
	assert_eq!(mysql.stop_calls.load(Ordering::SeqCst), 0);
	assert!(mysql.running.load(Ordering::SeqCst));
}
