use std::{
	collections::HashMap,
	path::PathBuf,
	sync::{Arc, Mutex},
	time::Duration,
};

use rand::Rng as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
	alerts::{Alert, AlertRouter, Severity},
	compress,
	error::{BackupError, OpType},
	mysql::ServiceControl,
};

/// Run an operation under a deadline.
///
/// On expiry the inner future is dropped (cancelling it at its next
/// suspension point) and the caller gets `OperationTimeout` carrying the
/// operation type, id, and configured timeout. An external cancellation
/// wins over both.
pub async fn with_timeout<T, F>(
	op: F,
	timeout: Duration,
	op_type: OpType,
	op_id: &str,
	cancel: &CancellationToken,
) -> Result<T, BackupError>
where
	F: Future<Output = Result<T, BackupError>>,
{
	tokio::select! {
		() = cancel.cancelled() => Err(BackupError::Cancelled),
		outcome = tokio::time::timeout(timeout, op) => match outcome {
			Ok(result) => result,
			Err(_) => {
				warn!(%op_type, op_id, ?timeout, "operation timed out");
				Err(BackupError::OperationTimeout {
					op_type,
					op_id: op_id.to_string(),
					timeout,
				})
			}
		}
	}
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(30),
		}
	}
}

impl RetryPolicy {
	/// `min(max_delay, base * 2^(n-1)) + jitter[0, 1s)` for 1-based attempt n.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
		let backoff = self
			.base_delay
			.saturating_mul(factor)
			.min(self.max_delay);
		backoff + Duration::from_millis(rand::thread_rng().gen_range(0..1000))
	}
}

/// Retry transient failures; surface structural ones immediately.
///
/// Exhaustion converts into `RetryExhausted { op_type, op_id, attempts }`
/// wrapping the last error.
pub async fn retry<T, F, Fut>(
	mut op: F,
	policy: RetryPolicy,
	op_type: OpType,
	op_id: &str,
	cancel: &CancellationToken,
) -> Result<T, BackupError>
where
	F: FnMut(u32) -> Fut,
	Fut: Future<Output = Result<T, BackupError>>,
{
	let mut last = None;
	for attempt in 1..=policy.max_attempts.max(1) {
		if cancel.is_cancelled() {
			return Err(BackupError::Cancelled);
		}
		match op(attempt).await {
			Ok(value) => return Ok(value),
			Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
			Err(err) if err.is_transient() => {
				warn!(%op_type, op_id, attempt, "attempt failed: {err}");
				last = Some(err);
				if attempt < policy.max_attempts {
					let delay = policy.delay_for(attempt);
					debug!(?delay, "backing off");
					tokio::select! {
						() = cancel.cancelled() => return Err(BackupError::Cancelled),
						() = tokio::time::sleep(delay) => {}
					}
				}
			}
			Err(err) => return Err(err),
		}
	}

	Err(BackupError::RetryExhausted {
		op_type,
		op_id: op_id.to_string(),
		attempts: policy.max_attempts.max(1),
		// UNWRAP: the loop ran at least once and only exits here via a
		// transient error
		last: Box::new(last.unwrap()),
	})
}

/// Temp files owned by in-flight operations, deleted on failure cleanup.
#[derive(Debug, Default)]
pub struct TempFileRegistry {
	inner: Mutex<HashMap<String, Vec<PathBuf>>>,
}

impl TempFileRegistry {
	pub fn register(&self, op_id: &str, path: impl Into<PathBuf>) {
		// UNWRAP: no panics while this mutex is held
		let mut inner = self.inner.lock().unwrap();
		inner.entry(op_id.to_string()).or_default().push(path.into());
	}

	pub fn deregister(&self, op_id: &str) -> Vec<PathBuf> {
		// UNWRAP: no panics while this mutex is held
		self.inner.lock().unwrap().remove(op_id).unwrap_or_default()
	}

	/// Remove every file registered to the operation, best effort.
	pub async fn cleanup(&self, op_id: &str) -> usize {
		let paths = self.deregister(op_id);
		let mut removed = 0;
		for path in paths {
			match tokio::fs::remove_file(&path).await {
				Ok(()) => {
					debug!(?path, "removed temp file");
					removed += 1;
				}
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
				Err(err) => warn!(?path, "failed to remove temp file: {err}"),
			}
		}
		removed
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
	None,
	Restart,
	Resume,
	Cleanup,
	Alert,
}

/// What the caller should do after a handled failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
	Retry,
	Resume,
	Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryResult {
	pub strategy: RecoveryStrategy,
	pub follow_up: FollowUp,
	pub mysql_restarted: bool,
}

/// Typed failure handlers shared by every phase of a run.
///
/// Every handler logs, runs its strategy-specific recovery, restarts MySQL
/// when the failing operation had stopped it, clears the operation's temp
/// files, and routes critical failures to the alert router. The MySQL
/// controller is passed per call rather than held, which keeps the
/// orchestrator/recovery/controller triangle acyclic.
#[derive(Debug)]
pub struct ErrorRecovery {
	pub temp_files: TempFileRegistry,
	alerts: Arc<AlertRouter>,
}

impl ErrorRecovery {
	pub fn new(alerts: Arc<AlertRouter>) -> Self {
		Self {
			temp_files: TempFileRegistry::default(),
			alerts,
		}
	}

	async fn restart_if_needed<S: ServiceControl>(
		&self,
		mysql: &S,
		mysql_was_stopped: bool,
	) -> bool {
		if !mysql_was_stopped {
			return false;
		}
		match mysql.start().await {
			Ok(()) => {
				info!("MySQL restarted during failure recovery");
				true
			}
			Err(err) => {
				error!("failed to restart MySQL during recovery: {err}");
				self.alert(
					Severity::Critical,
					"MySQL left stopped",
					&format!("recovery could not restart the service: {err}"),
					None,
				)
				.await;
				false
			}
		}
	}

	async fn alert(&self, severity: Severity, title: &str, message: &str, op_id: Option<&str>) {
		let alert = Alert {
			severity,
			title: title.to_string(),
			message: message.to_string(),
			operation_id: op_id.map(ToString::to_string),
			timestamp: chrono::Utc::now(),
		};
		if let Err(err) = self.alerts.route(alert).await {
			warn!("alert routing failed: {err}");
		}
	}

	pub async fn handle_mysql_service_failure<S: ServiceControl>(
		&self,
		mysql: &S,
		err: &BackupError,
		op_id: &str,
		mysql_was_stopped: bool,
	) -> RecoveryResult {
		error!(op_id, "MySQL service failure: {err}");
		let mysql_restarted = self.restart_if_needed(mysql, mysql_was_stopped).await;
		self.temp_files.cleanup(op_id).await;
		self.alert(
			Severity::Critical,
			"MySQL service failure",
			&err.to_string(),
			Some(op_id),
		)
		.await;
		RecoveryResult {
			strategy: RecoveryStrategy::Restart,
			follow_up: FollowUp::Abort,
			mysql_restarted,
		}
	}

	pub async fn handle_compression_failure<S: ServiceControl>(
		&self,
		mysql: &S,
		err: &BackupError,
		op_id: &str,
		partial_archive: &std::path::Path,
		mysql_was_stopped: bool,
	) -> RecoveryResult {
		error!(op_id, "compression failure: {err}");
		compress::cleanup_archive(partial_archive).await;
		let mysql_restarted = self.restart_if_needed(mysql, mysql_was_stopped).await;
		self.temp_files.cleanup(op_id).await;
		RecoveryResult {
			strategy: RecoveryStrategy::Cleanup,
			follow_up: FollowUp::Retry,
			mysql_restarted,
		}
	}

	pub async fn handle_transfer_failure<S: ServiceControl>(
		&self,
		mysql: &S,
		err: &BackupError,
		op_id: &str,
		mysql_was_stopped: bool,
	) -> RecoveryResult {
		error!(op_id, "transfer failure: {err}");
		let mysql_restarted = self.restart_if_needed(mysql, mysql_was_stopped).await;
		self.temp_files.cleanup(op_id).await;
		if err.is_critical() {
			self.alert(Severity::Critical, "transfer failure", &err.to_string(), Some(op_id))
				.await;
		}
		let follow_up = if err.is_transient() {
			FollowUp::Resume
		} else {
			FollowUp::Abort
		};
		RecoveryResult {
			strategy: RecoveryStrategy::Resume,
			follow_up,
			mysql_restarted,
		}
	}

	pub async fn handle_timeout_failure<S: ServiceControl>(
		&self,
		mysql: &S,
		err: &BackupError,
		op_id: &str,
		mysql_was_stopped: bool,
	) -> RecoveryResult {
		error!(op_id, "timeout: {err}");
		let mysql_restarted = self.restart_if_needed(mysql, mysql_was_stopped).await;
		self.temp_files.cleanup(op_id).await;
		self.alert(Severity::Error, "operation timeout", &err.to_string(), Some(op_id))
			.await;
		RecoveryResult {
			strategy: RecoveryStrategy::Cleanup,
			follow_up: FollowUp::Retry,
			mysql_restarted,
		}
	}

	pub async fn handle_general_failure<S: ServiceControl>(
		&self,
		mysql: &S,
		err: &BackupError,
		op_id: &str,
		mysql_was_stopped: bool,
	) -> RecoveryResult {
		error!(op_id, "failure: {err}");
		let mysql_restarted = self.restart_if_needed(mysql, mysql_was_stopped).await;
		self.temp_files.cleanup(op_id).await;
		if err.is_critical() {
			self.alert(Severity::Critical, "backup failure", &err.to_string(), Some(op_id))
				.await;
		}
		RecoveryResult {
			strategy: RecoveryStrategy::None,
			follow_up: FollowUp::Abort,
			mysql_restarted,
		}
	}
}
