use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt as _, sync::Mutex};
use tracing::debug;

use coldbak_proto::error::AuthError;

use crate::error::ReceiverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOperation {
	TokenCreation,
	TokenValidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
	Success,
	Failure,
}

/// One authentication event.
///
/// `error_message` carries only generic text: never the secret, never the
/// raw or decoded token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
	pub id: String,
	pub timestamp: DateTime<Utc>,
	pub client_id: String,
	pub operation: AuditOperation,
	pub outcome: AuditOutcome,
	pub duration_ms: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_code: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
}

impl AuditEntry {
	pub fn success(client_id: impl Into<String>, operation: AuditOperation, duration_ms: u64) -> Self {
		Self {
			id: uuid::Uuid::new_v4().to_string(),
			timestamp: Utc::now(),
			client_id: client_id.into(),
			operation,
			outcome: AuditOutcome::Success,
			duration_ms,
			error_code: None,
			error_message: None,
		}
	}

	pub fn failure(
		client_id: impl Into<String>,
		operation: AuditOperation,
		duration_ms: u64,
		error: AuthError,
	) -> Self {
		Self {
			id: uuid::Uuid::new_v4().to_string(),
			timestamp: Utc::now(),
			client_id: client_id.into(),
			operation,
			outcome: AuditOutcome::Failure,
			duration_ms,
			error_code: Some(error.code().to_string()),
			// AuthError display strings are generic by construction.
			error_message: Some(error.to_string()),
		}
	}
}

/// Append-only audit log, one JSONL file per UTC day.
#[derive(Debug)]
pub struct AuditLog {
	dir: PathBuf,
	lock: Mutex<()>,
}

impl AuditLog {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self {
			dir: dir.into(),
			lock: Mutex::new(()),
		}
	}

	fn file_for(&self, date: NaiveDate) -> PathBuf {
		self.dir.join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")))
	}

	pub async fn record(&self, entry: AuditEntry) -> Result<(), ReceiverError> {
		let mut line = serde_json::to_vec(&entry)
			.map_err(|err| ReceiverError::Internal(err.to_string()))?;
		line.push(b'\n');

		let _guard = self.lock.lock().await;
		tokio::fs::create_dir_all(&self.dir).await?;
		let path = self.file_for(entry.timestamp.date_naive());
		let mut file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.await?;
		file.write_all(&line).await?;
		file.flush().await?;
		debug!(?path, client_id = %entry.client_id, outcome = ?entry.outcome, "audit entry recorded");
		Ok(())
	}

	pub async fn entries_for_day(&self, date: NaiveDate) -> Result<Vec<AuditEntry>, ReceiverError> {
		let path = self.file_for(date);
		let text = match tokio::fs::read_to_string(&path).await {
			Ok(text) => text,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(err) => return Err(err.into()),
		};
		text.lines()
			.filter(|line| !line.trim().is_empty())
			.map(|line| {
				serde_json::from_str(line)
					.map_err(|err| ReceiverError::StoreUnreadable(format!("audit log: {err}")))
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn entries_append_and_read_back() {
		let dir = tempfile::tempdir().unwrap();
		let log = AuditLog::new(dir.path());

		let before = Utc::now();
		log.record(AuditEntry::success("client-a", AuditOperation::TokenValidation, 3))
			.await
			.unwrap();
		log.record(AuditEntry::failure(
			"client-b",
			AuditOperation::TokenValidation,
			1,
			AuthError::InvalidCredentials,
		))
		.await
		.unwrap();
		let after = Utc::now();

		let entries = log.entries_for_day(Utc::now().date_naive()).await.unwrap();
		assert_eq!(entries.len(), 2);

		for entry in &entries {
			assert!(entry.timestamp >= before && entry.timestamp <= after);
		}
		assert_eq!(entries[0].outcome, AuditOutcome::Success);
		assert_eq!(entries[1].outcome, AuditOutcome::Failure);
		assert_eq!(entries[1].error_code.as_deref(), Some("InvalidCredentials"));
	}

	#[tokio::test]
	async fn failure_messages_stay_generic() {
		let dir = tempfile::tempdir().unwrap();
		let log = AuditLog::new(dir.path());
		log.record(AuditEntry::failure(
			"client-x",
			AuditOperation::TokenValidation,
			2,
			AuthError::InvalidCredentials,
		))
		.await
		.unwrap();

		let entries = log.entries_for_day(Utc::now().date_naive()).await.unwrap();
		let message = entries[0].error_message.clone().unwrap();
		assert!(!message.contains("secret"), "message leaks detail: {message}");
		assert!(!message.to_lowercase().contains("base64"));
	}

	#[tokio::test]
	async fn missing_day_reads_empty() {
		let dir = tempfile::tempdir().unwrap();
		let log = AuditLog::new(dir.path());
		let past = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
		assert!(log.entries_for_day(past).await.unwrap().is_empty());
	}
}
