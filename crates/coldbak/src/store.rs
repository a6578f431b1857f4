use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::BackupError;

/// Where the backup comes from: a local MySQL instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
	pub host: String,
	pub port: u16,
	pub username: String,
	pub password: String,
	/// Service-manager unit name, e.g. `mysql` or `MySQL80`.
	pub service_name: String,
	pub data_dir: PathBuf,
}

/// Where the archive goes: a coldbak receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
	pub host: String,
	pub port: u16,
	pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfiguration {
	pub id: String,
	pub name: String,
	pub source: SourceConfig,
	pub target: TargetConfig,
	/// Label used as the `{server}` filename token.
	pub server_label: String,
	/// Label used as the `{database}` filename token.
	pub database_label: String,
	pub client_id: String,
	pub client_secret: String,
	pub chunk_size: u64,
	pub active: bool,
	pub created_at: DateTime<Utc>,
}

impl BackupConfiguration {
	pub fn validate(&self) -> Result<(), BackupError> {
		if self.name.trim().is_empty() {
			return Err(BackupError::Validation("configuration name is empty".into()));
		}
		if self.source.service_name.trim().is_empty() {
			return Err(BackupError::Validation("MySQL service name is empty".into()));
		}
		if self.source.data_dir.as_os_str().is_empty() {
			return Err(BackupError::Validation("data directory is empty".into()));
		}
		if self.target.host.trim().is_empty() || self.target.port == 0 {
			return Err(BackupError::Validation("target host/port is invalid".into()));
		}
		if self.chunk_size == 0 {
			return Err(BackupError::Validation("chunk size must be non-zero".into()));
		}
		if self.client_id.is_empty() || self.client_id.contains(':') {
			return Err(BackupError::Validation(
				"client id must be non-empty and contain no ':'".into(),
			));
		}
		if self.server_label.trim().is_empty() || self.database_label.trim().is_empty() {
			return Err(BackupError::Validation("server/database labels are empty".into()));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
	Pending,
	StoppingMySql,
	Compressing,
	Transferring,
	StartingMySql,
	Completed,
	Failed,
	Cancelled,
}

impl BackupStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
	}
}

/// Per-chunk record kept with the run's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkLogRecord {
	pub index: u64,
	pub length: u64,
	pub md5: String,
	pub is_last: bool,
}

/// One orchestrator run. Created at start, mutated only by the orchestrator,
/// finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupLog {
	pub id: String,
	pub configuration_id: String,
	pub started_at: DateTime<Utc>,
	pub finished_at: Option<DateTime<Utc>>,
	pub status: BackupStatus,
	pub archive_path: Option<String>,
	pub archive_bytes: Option<u64>,
	pub error: Option<String>,
	pub chunks: Vec<ChunkLogRecord>,
	/// Resume token from the receiver, kept across failed attempts.
	pub resume_token: Option<String>,
}

impl BackupLog {
	pub fn new(configuration_id: impl Into<String>) -> Self {
		Self {
			id: uuid::Uuid::new_v4().to_string(),
			configuration_id: configuration_id.into(),
			started_at: Utc::now(),
			finished_at: None,
			status: BackupStatus::Pending,
			archive_path: None,
			archive_bytes: None,
			error: None,
			chunks: Vec::new(),
			resume_token: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfiguration {
	pub id: String,
	pub configuration_id: String,
	/// Standard five- or six-field cron expression.
	pub cron: String,
	pub enabled: bool,
	pub created_at: DateTime<Utc>,
}

/// Local persisted state: configurations, run logs, schedules.
///
/// One JSON file per entity kind under a data directory; every write is
/// write-temp-then-rename, every read a snapshot of the file. The storage
/// engine behind this interface is swappable; this is the simplest thing
/// satisfying single-row-transactional writes and snapshot reads.
#[derive(Debug)]
pub struct Store {
	dir: PathBuf,
	lock: Mutex<()>,
}

impl Store {
	pub fn open(dir: impl Into<PathBuf>) -> Self {
		Self {
			dir: dir.into(),
			lock: Mutex::new(()),
		}
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	async fn load<T: serde::de::DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, BackupError> {
		let path = self.dir.join(file);
		match tokio::fs::read(&path).await {
			Ok(bytes) => serde_json::from_slice(&bytes)
				.map_err(|err| BackupError::Internal(format!("{file}: {err}"))),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(err) => Err(BackupError::Internal(format!("{file}: {err}"))),
		}
	}

	async fn save<T: Serialize>(&self, file: &str, rows: &[T]) -> Result<(), BackupError> {
		tokio::fs::create_dir_all(&self.dir)
			.await
			.map_err(|err| BackupError::Internal(err.to_string()))?;
		let path = self.dir.join(file);
		let json = serde_json::to_vec_pretty(rows)
			.map_err(|err| BackupError::Internal(err.to_string()))?;
		let tmp = path.with_extension("json.tmp");
		tokio::fs::write(&tmp, json)
			.await
			.map_err(|err| BackupError::Internal(err.to_string()))?;
		tokio::fs::rename(&tmp, &path)
			.await
			.map_err(|err| BackupError::Internal(err.to_string()))?;
		debug!(file, "store saved");
		Ok(())
	}

	// Configurations

	pub async fn config_put(&self, config: BackupConfiguration) -> Result<(), BackupError> {
		let _guard = self.lock.lock().await;
		let mut rows: Vec<BackupConfiguration> = self.load("configs.json").await?;
		rows.retain(|c| c.id != config.id);
		rows.push(config);
		self.save("configs.json", &rows).await
	}

	pub async fn config_get(&self, id: &str) -> Result<Option<BackupConfiguration>, BackupError> {
		let _guard = self.lock.lock().await;
		Ok(self
			.load::<BackupConfiguration>("configs.json")
			.await?
			.into_iter()
			.find(|c| c.id == id || c.name == id))
	}

	pub async fn config_list(&self) -> Result<Vec<BackupConfiguration>, BackupError> {
		let _guard = self.lock.lock().await;
		self.load("configs.json").await
	}

	pub async fn config_remove(&self, id: &str) -> Result<bool, BackupError> {
		let _guard = self.lock.lock().await;
		let mut rows: Vec<BackupConfiguration> = self.load("configs.json").await?;
		let before = rows.len();
		rows.retain(|c| c.id != id && c.name != id);
		let removed = rows.len() != before;
		if removed {
			self.save("configs.json", &rows).await?;
		}
		Ok(removed)
	}

	// Run logs

	pub async fn log_upsert(&self, log: BackupLog) -> Result<(), BackupError> {
		let _guard = self.lock.lock().await;
		let mut rows: Vec<BackupLog> = self.load("logs.json").await?;
		rows.retain(|l| l.id != log.id);
		rows.push(log);
		self.save("logs.json", &rows).await
	}

	pub async fn log_get(&self, id: &str) -> Result<Option<BackupLog>, BackupError> {
		let _guard = self.lock.lock().await;
		Ok(self
			.load::<BackupLog>("logs.json")
			.await?
			.into_iter()
			.find(|l| l.id == id))
	}

	pub async fn logs_for_config(&self, config_id: &str) -> Result<Vec<BackupLog>, BackupError> {
		let _guard = self.lock.lock().await;
		Ok(self
			.load::<BackupLog>("logs.json")
			.await?
			.into_iter()
			.filter(|l| l.configuration_id == config_id)
			.collect())
	}

	/// Most recent unfinished log for a configuration, if any. This is where
	/// a resume token lives between attempts.
	pub async fn latest_resumable(
		&self,
		config_id: &str,
	) -> Result<Option<BackupLog>, BackupError> {
		let mut logs = self.logs_for_config(config_id).await?;
		logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
		Ok(logs
			.into_iter()
			.find(|l| l.resume_token.is_some() && l.status != BackupStatus::Completed))
	}

	// Schedules

	pub async fn schedule_put(&self, schedule: ScheduleConfiguration) -> Result<(), BackupError> {
		let _guard = self.lock.lock().await;
		let mut rows: Vec<ScheduleConfiguration> = self.load("schedules.json").await?;
		rows.retain(|s| s.id != schedule.id);
		rows.push(schedule);
		self.save("schedules.json", &rows).await
	}

	pub async fn schedule_list(&self) -> Result<Vec<ScheduleConfiguration>, BackupError> {
		let _guard = self.lock.lock().await;
		self.load("schedules.json").await
	}

	pub async fn schedule_set_enabled(&self, id: &str, enabled: bool) -> Result<bool, BackupError> {
		let _guard = self.lock.lock().await;
		let mut rows: Vec<ScheduleConfiguration> = self.load("schedules.json").await?;
		let Some(row) = rows.iter_mut().find(|s| s.id == id) else {
			return Ok(false);
		};
		row.enabled = enabled;
		self.save("schedules.json", &rows).await?;
		Ok(true)
	}
}
