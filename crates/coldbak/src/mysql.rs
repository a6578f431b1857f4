use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::BackupError;

/// Default time MySQL is given to stop or start.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// State polling cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
	Running,
	Stopped,
}

/// Seam between the orchestrator and the platform service manager.
///
/// Implementations control the service only; none of them may ever touch
/// the data directory.
#[allow(async_fn_in_trait)]
pub trait ServiceControl: Send + Sync {
	async fn stop(&self) -> Result<(), BackupError>;
	/// Idempotent: starting an already-running service succeeds.
	async fn start(&self) -> Result<(), BackupError>;
	async fn is_running(&self) -> Result<bool, BackupError>;
	async fn wait_until(&self, state: ServiceState, timeout: Duration) -> Result<(), BackupError>;
}

/// Drives the local MySQL service through the platform service manager
/// (`systemctl` on unix, `sc` on Windows).
#[derive(Debug, Clone)]
pub struct MySqlController {
	service: String,
	operation_timeout: Duration,
}

impl MySqlController {
	pub fn new(service: impl Into<String>) -> Self {
		Self {
			service: service.into(),
			operation_timeout: DEFAULT_OPERATION_TIMEOUT,
		}
	}

	pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
		self.operation_timeout = timeout;
		self
	}

	pub fn service(&self) -> &str {
		&self.service
	}

	#[cfg(not(windows))]
	fn command(&self, verb: &str) -> duct::Expression {
		duct::cmd("systemctl", [verb, self.service.as_str()])
	}

	#[cfg(windows)]
	fn command(&self, verb: &str) -> duct::Expression {
		duct::cmd("sc", [verb, self.service.as_str()])
	}

	async fn run_command(&self, verb: &'static str) -> Result<(), BackupError> {
		let expr = self.command(verb).stdout_null().stderr_capture().unchecked();
		let service = self.service.clone();
		let output = tokio::task::spawn_blocking(move || expr.run())
			.await
			.map_err(|err| BackupError::Internal(format!("service command task: {err}")))?
			.map_err(|err| BackupError::Internal(format!("running service manager: {err}")))?;

		if output.status.success() {
			Ok(())
		} else {
			let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
			let reason = if reason.is_empty() {
				format!("service manager exited with {}", output.status)
			} else {
				reason
			};
			Err(match verb {
				"stop" => BackupError::MySqlStopFailed { service, reason },
				_ => BackupError::MySqlStartFailed { service, reason },
			})
		}
	}

	#[cfg(not(windows))]
	async fn probe(&self) -> Result<bool, BackupError> {
		let expr = duct::cmd("systemctl", ["is-active", "--quiet", self.service.as_str()])
			.stdout_null()
			.stderr_null()
			.unchecked();
		let output = tokio::task::spawn_blocking(move || expr.run())
			.await
			.map_err(|err| BackupError::Internal(format!("service probe task: {err}")))?
			.map_err(|err| BackupError::Internal(format!("probing service: {err}")))?;
		Ok(output.status.success())
	}

	#[cfg(windows)]
	async fn probe(&self) -> Result<bool, BackupError> {
		let expr = duct::cmd("sc", ["query", self.service.as_str()])
			.stdout_capture()
			.stderr_null()
			.unchecked();
		let output = tokio::task::spawn_blocking(move || expr.run())
			.await
			.map_err(|err| BackupError::Internal(format!("service probe task: {err}")))?
			.map_err(|err| BackupError::Internal(format!("probing service: {err}")))?;
		Ok(String::from_utf8_lossy(&output.stdout).contains("RUNNING"))
	}
}

impl ServiceControl for MySqlController {
	#[instrument(level = "debug", skip(self), fields(service = %self.service))]
	async fn stop(&self) -> Result<(), BackupError> {
		if !self.is_running().await? {
			debug!("service already stopped");
			return Ok(());
		}
		info!("stopping MySQL service");
		self.run_command("stop").await?;
		self.wait_until(ServiceState::Stopped, self.operation_timeout)
			.await
	}

	#[instrument(level = "debug", skip(self), fields(service = %self.service))]
	async fn start(&self) -> Result<(), BackupError> {
		if self.is_running().await? {
			debug!("service already running");
			return Ok(());
		}
		info!("starting MySQL service");
		self.run_command("start").await?;
		self.wait_until(ServiceState::Running, self.operation_timeout)
			.await
	}

	async fn is_running(&self) -> Result<bool, BackupError> {
		self.probe().await
	}

	async fn wait_until(&self, state: ServiceState, timeout: Duration) -> Result<(), BackupError> {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let running = self.is_running().await?;
			let reached = match state {
				ServiceState::Running => running,
				ServiceState::Stopped => !running,
			};
			if reached {
				return Ok(());
			}
			if tokio::time::Instant::now() >= deadline {
				warn!(service = %self.service, ?state, "service did not reach state in time");
				return Err(BackupError::MySqlTimeout {
					service: self.service.clone(),
					timeout,
				});
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}
}
