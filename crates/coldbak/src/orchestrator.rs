use std::{
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
	time::Duration,
};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use coldbak_proto::metadata::FileMetadata;

use crate::{
	compress,
	error::{BackupError, OpType},
	mysql::ServiceControl,
	progress::{DEFAULT_PROGRESS_INTERVAL, ProgressReport, ProgressSink},
	recovery::{self, ErrorRecovery, RetryPolicy},
	store::{BackupConfiguration, BackupLog, BackupStatus, ChunkLogRecord, Store},
	transfer::{TransferClient, TransferOutcome},
};

/// Per-phase deadlines, each enforced through the recovery timeout wrapper.
#[derive(Debug, Clone, Copy)]
pub struct OperationTimeouts {
	pub mysql: Duration,
	pub compression: Duration,
	pub transfer: Duration,
}

impl Default for OperationTimeouts {
	fn default() -> Self {
		Self {
			mysql: Duration::from_secs(180),
			compression: Duration::from_secs(3600),
			transfer: Duration::from_secs(3600),
		}
	}
}

/// Seam for the transfer phase, so runs can be driven without a network.
#[allow(async_fn_in_trait)]
pub trait TransferStep: Send + Sync {
	async fn send(
		&self,
		archive: &Path,
		metadata: &FileMetadata,
		resume_token: Option<&str>,
		on_token: &(dyn Fn(&str) + Send + Sync),
		on_progress: &(dyn Fn(u64, u64) + Send + Sync),
		cancel: &CancellationToken,
	) -> Result<TransferOutcome, BackupError>;
}

impl TransferStep for TransferClient {
	async fn send(
		&self,
		archive: &Path,
		metadata: &FileMetadata,
		resume_token: Option<&str>,
		on_token: &(dyn Fn(&str) + Send + Sync),
		on_progress: &(dyn Fn(u64, u64) + Send + Sync),
		cancel: &CancellationToken,
	) -> Result<TransferOutcome, BackupError> {
		self.send_file(archive, metadata, resume_token, on_token, on_progress, cancel)
			.await
	}
}

/// A finished run: the log is terminal, and when something went wrong the
/// typed error rides along for exit-code mapping.
#[derive(Debug)]
pub struct BackupRunResult {
	pub log: BackupLog,
	pub error: Option<BackupError>,
}

// Progress weights per phase; transitions always move forward.
const STOP_START: f64 = 0.0;
const COMPRESS_START: f64 = 0.05;
const TRANSFER_START: f64 = 0.40;
const MYSQL_START_PHASE: f64 = 0.95;

/// Drives one backup end to end:
/// `Pending → StoppingMySQL → Compressing → Transferring → StartingMySQL →
/// Completed`, with `Failed`/`Cancelled` reachable from anywhere — and
/// MySQL is started again on the way out no matter which exit is taken.
#[derive(Debug)]
pub struct Orchestrator<S, T> {
	pub store: Arc<Store>,
	pub mysql: S,
	pub transfer: T,
	pub recovery: Arc<ErrorRecovery>,
	pub work_dir: PathBuf,
	pub timeouts: OperationTimeouts,
	pub retry: RetryPolicy,
	pub progress_interval: Duration,
}

struct PhaseOutput {
	remote_path: String,
	archive_bytes: u64,
	chunks: Vec<ChunkLogRecord>,
}

impl<S: ServiceControl, T: TransferStep> Orchestrator<S, T> {
	pub fn new(
		store: Arc<Store>,
		mysql: S,
		transfer: T,
		recovery: Arc<ErrorRecovery>,
		work_dir: impl Into<PathBuf>,
	) -> Self {
		Self {
			store,
			mysql,
			transfer,
			recovery,
			work_dir: work_dir.into(),
			timeouts: OperationTimeouts::default(),
			retry: RetryPolicy::default(),
			progress_interval: DEFAULT_PROGRESS_INTERVAL,
		}
	}

	#[instrument(level = "debug", skip_all, fields(config = %config.id))]
	pub async fn run(
		&self,
		config: &BackupConfiguration,
		on_progress: impl Fn(ProgressReport) + Send + Sync + 'static,
		cancel: CancellationToken,
	) -> BackupRunResult {
		let mut log = BackupLog::new(&config.id);
		let op_id = log.id.clone();
		let started = std::time::Instant::now();
		let sink = ProgressSink::new(self.progress_interval, on_progress);

		if let Err(err) = self.store.log_upsert(log.clone()).await {
			return BackupRunResult {
				log,
				error: Some(err),
			};
		}

		if let Err(err) = config.validate() {
			warn!("configuration invalid: {err}");
			return self.finalize(log, BackupStatus::Failed, Some(err), sink, started).await;
		}

		// Tracks whether this run is responsible for MySQL being down.
		let mysql_stopped = Arc::new(Mutex::new(false));
		let token_cell: Arc<Mutex<Option<String>>> = Arc::default();

		let outcome = self
			.run_phases(config, &mut log, &op_id, &sink, started, &mysql_stopped, &token_cell, &cancel)
			.await;

		// Whatever happened above, MySQL gets started before we report. If
		// the stop phase was interrupted we may not know whether the stop
		// landed, so probe rather than trust the flag alone.
		let stopped_by_us = *mysql_stopped.lock().unwrap();
		let was_stopped = stopped_by_us || !matches!(self.mysql.is_running().await, Ok(true));
		let start_result = if was_stopped {
			self.update_status(&mut log, BackupStatus::StartingMySql).await;
			sink.update(report(
				BackupStatus::StartingMySql,
				MYSQL_START_PHASE,
				&outcome,
				started,
			));
			self.start_mysql(&op_id).await
		} else {
			Ok(())
		};

		self.recovery.temp_files.cleanup(&op_id).await;

		let (status, error) = match (outcome, start_result) {
			(Ok(output), Ok(())) => {
				log.archive_path = Some(output.remote_path.clone());
				log.archive_bytes = Some(output.archive_bytes);
				log.chunks = output.chunks.clone();
				(BackupStatus::Completed, None)
			}
			(Ok(_), Err(start_err)) => {
				// The archive made it, but the service is down: never
				// Completed while MySQL is stopped.
				let handled = self
					.recovery
					.handle_mysql_service_failure(&self.mysql, &start_err, &op_id, true)
					.await;
				debug!(?handled, "start failure handled");
				(BackupStatus::Failed, Some(start_err))
			}
			(Err(BackupError::Cancelled), start_result) => {
				if let Err(start_err) = start_result {
					warn!("MySQL restart after cancellation failed: {start_err}");
					(BackupStatus::Cancelled, Some(start_err))
				} else {
					(BackupStatus::Cancelled, Some(BackupError::Cancelled))
				}
			}
			(Err(err), start_result) => {
				if let Err(start_err) = start_result {
					warn!("MySQL restart after failure also failed: {start_err}");
					let _ = self
						.recovery
						.handle_mysql_service_failure(&self.mysql, &start_err, &op_id, true)
						.await;
				}
				(BackupStatus::Failed, Some(err))
			}
		};

		log.resume_token = token_cell.lock().unwrap().clone();
		self.finalize(log, status, error, sink, started).await
	}

	#[allow(clippy::too_many_arguments)]
	async fn run_phases(
		&self,
		config: &BackupConfiguration,
		log: &mut BackupLog,
		op_id: &str,
		sink: &ProgressSink,
		started: std::time::Instant,
		mysql_stopped: &Arc<Mutex<bool>>,
		token_cell: &Arc<Mutex<Option<String>>>,
		cancel: &CancellationToken,
	) -> Result<PhaseOutput, BackupError> {
		// Phase: stop MySQL.
		self.update_status(log, BackupStatus::StoppingMySql).await;
		sink.update(phase_report(BackupStatus::StoppingMySql, STOP_START, started));

		let stop = recovery::retry(
			|_| {
				recovery::with_timeout(
					self.mysql.stop(),
					self.timeouts.mysql,
					OpType::MySqlStop,
					op_id,
					cancel,
				)
			},
			self.retry,
			OpType::MySqlStop,
			op_id,
			cancel,
		)
		.await;
		if let Err(err) = stop {
			if !matches!(err, BackupError::Cancelled) {
				self.recovery
					.handle_mysql_service_failure(&self.mysql, &err, op_id, false)
					.await;
			}
			return Err(err);
		}
		*mysql_stopped.lock().unwrap() = true;
		info!("MySQL stopped for backup");

		// Phase: compress the data directory.
		self.update_status(log, BackupStatus::Compressing).await;
		let archive = self.archive_path(config);
		self.recovery.temp_files.register(op_id, &archive);

		let archive_bytes = {
			let compress_once = |attempt: u32| {
				let archive = archive.clone();
				let source = config.source.data_dir.clone();
				async move {
					debug!(attempt, "compression attempt");
					recovery::with_timeout(
						compress::compress_dir(
							&source,
							&archive,
							|read, total| {
								let fraction = if total == 0 {
									1.0
								} else {
									read as f64 / total as f64
								};
								sink.update(phase_report(
									BackupStatus::Compressing,
									COMPRESS_START + (TRANSFER_START - COMPRESS_START) * fraction,
									started,
								));
							},
							cancel,
						),
						self.timeouts.compression,
						OpType::Compression,
						op_id,
						cancel,
					)
					.await
				}
			};

			match compress_once(1).await {
				Ok(bytes) => bytes,
				Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
				Err(err) => {
					// One retry after cleanup of the partial archive.
					self.recovery
						.handle_compression_failure(&self.mysql, &err, op_id, &archive, false)
						.await;
					self.recovery.temp_files.register(op_id, &archive);
					compress_once(2).await?
				}
			}
		};

		let metadata = FileMetadata::for_file(&archive)
			.await
			.map_err(|err| BackupError::CompressionFailed(format!("hashing archive: {err}")))?;
		info!(bytes = archive_bytes, md5 = %metadata.md5, "archive ready");

		// Phase: transfer.
		self.update_status(log, BackupStatus::Transferring).await;
		sink.update(phase_report(BackupStatus::Transferring, TRANSFER_START, started));

		let sent = {
			let archive = archive.clone();
			let metadata = metadata.clone();
			recovery::retry(
				move |attempt| {
					let archive = archive.clone();
					let metadata = metadata.clone();
					let token_cell = token_cell.clone();
					async move {
						debug!(attempt, "transfer attempt");
						let token = token_cell.lock().unwrap().clone();
						let on_token = {
							let token_cell = token_cell.clone();
							move |token: &str| {
								*token_cell.lock().unwrap() = Some(token.to_string());
							}
						};
						let on_progress = |bytes: u64, total_bytes: u64| {
							let fraction = if total_bytes == 0 {
								1.0
							} else {
								bytes as f64 / total_bytes as f64
							};
							let mut report = phase_report(
								BackupStatus::Transferring,
								TRANSFER_START + (MYSQL_START_PHASE - TRANSFER_START) * fraction,
								started,
							);
							report.bytes_transferred = bytes;
							report.total_bytes = total_bytes;
							sink.update(report);
						};

						let result = recovery::with_timeout(
							self.transfer.send(
								&archive,
								&metadata,
								token.as_deref(),
								&on_token,
								&on_progress,
								cancel,
							),
							self.timeouts.transfer,
							OpType::Transfer,
							op_id,
							cancel,
						)
						.await;

						match result {
							Err(BackupError::ResumeMetadataMismatch) => {
								// Stale token for different bytes: drop it
								// and go again from scratch.
								warn!("resume token refused, restarting transfer fresh");
								token_cell.lock().unwrap().take();
								recovery::with_timeout(
									self.transfer.send(
										&archive,
										&metadata,
										None,
										&on_token,
										&on_progress,
										cancel,
									),
									self.timeouts.transfer,
									OpType::Transfer,
									op_id,
									cancel,
								)
								.await
							}
							Err(err) if token.is_some() => {
								// A resumed attempt that died may mean the
								// token is dead. The next attempt begins
								// fresh; the receiver re-offers a resume for
								// transfers it still holds.
								token_cell.lock().unwrap().take();
								Err(err)
							}
							other => other,
						}
					}
				},
				self.retry,
				OpType::Transfer,
				op_id,
				cancel,
			)
			.await
		};
		let output = match sent {
			Ok(outcome) => output_from(outcome),
			Err(err) => {
				if !matches!(err, BackupError::Cancelled) {
					// MySQL restart itself happens in the common exit path;
					// the handler logs, cleans, and alerts.
					self.recovery
						.handle_transfer_failure(&self.mysql, &err, op_id, false)
						.await;
				}
				return Err(err);
			}
		};

		sink.update(phase_report(BackupStatus::Transferring, MYSQL_START_PHASE, started));
		Ok(PhaseOutput {
			archive_bytes,
			..output
		})
	}

	async fn start_mysql(&self, op_id: &str) -> Result<(), BackupError> {
		// Cancellation does not apply here: the service comes back up even
		// when the run is being torn down.
		let no_cancel = CancellationToken::new();
		recovery::retry(
			|_| {
				recovery::with_timeout(
					self.mysql.start(),
					self.timeouts.mysql,
					OpType::MySqlStart,
					op_id,
					&no_cancel,
				)
			},
			self.retry,
			OpType::MySqlStart,
			op_id,
			&no_cancel,
		)
		.await
	}

	fn archive_path(&self, config: &BackupConfiguration) -> PathBuf {
		let stamp = Utc::now().format("%Y%m%d_%H%M%S");
		self.work_dir.join(format!(
			"{stamp}_{}_{}.zip",
			config.server_label, config.database_label
		))
	}

	async fn update_status(&self, log: &mut BackupLog, status: BackupStatus) {
		debug!(?status, "phase transition");
		log.status = status;
		if let Err(err) = self.store.log_upsert(log.clone()).await {
			warn!("persisting backup log failed: {err}");
		}
	}

	/// Terminal bookkeeping, exactly once per run.
	async fn finalize(
		&self,
		mut log: BackupLog,
		status: BackupStatus,
		error: Option<BackupError>,
		sink: ProgressSink,
		started: std::time::Instant,
	) -> BackupRunResult {
		log.status = status;
		log.finished_at = Some(Utc::now());
		log.error = error.as_ref().map(ToString::to_string);

		let mut final_report = phase_report(
			status,
			if status == BackupStatus::Completed { 1.0 } else { 0.0 },
			started,
		);
		if status == BackupStatus::Completed {
			final_report.bytes_transferred = log.archive_bytes.unwrap_or(0);
			final_report.total_bytes = log.archive_bytes.unwrap_or(0);
		}
		sink.finish(final_report);

		if let Err(err) = self.store.log_upsert(log.clone()).await {
			warn!("persisting final backup log failed: {err}");
		}
		info!(status = ?log.status, "backup run finished");
		BackupRunResult { log, error }
	}
}

fn phase_report(phase: BackupStatus, overall: f64, started: std::time::Instant) -> ProgressReport {
	ProgressReport {
		phase,
		overall,
		bytes_transferred: 0,
		total_bytes: 0,
		elapsed: started.elapsed(),
	}
}

fn report(
	phase: BackupStatus,
	overall: f64,
	outcome: &Result<PhaseOutput, BackupError>,
	started: std::time::Instant,
) -> ProgressReport {
	let mut report = phase_report(phase, overall, started);
	if let Ok(output) = outcome {
		report.bytes_transferred = output.archive_bytes;
		report.total_bytes = output.archive_bytes;
	}
	report
}

fn output_from(outcome: TransferOutcome) -> PhaseOutput {
	PhaseOutput {
		remote_path: outcome.remote_path,
		archive_bytes: 0,
		chunks: outcome
			.chunks
			.iter()
			.map(|header| ChunkLogRecord {
				index: header.index,
				length: header.length,
				md5: header.md5.clone(),
				is_last: header.is_last,
			})
			.collect(),
	}
}
