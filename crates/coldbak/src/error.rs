use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use coldbak_proto::error::ProtocolError;

/// Which long-running operation an error or timeout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
	MySqlStop,
	MySqlStart,
	Compression,
	Transfer,
	Finalize,
	Notification,
}

impl std::fmt::Display for OpType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Self::MySqlStop => "mysql-stop",
			Self::MySqlStart => "mysql-start",
			Self::Compression => "compression",
			Self::Transfer => "transfer",
			Self::Finalize => "finalize",
			Self::Notification => "notification",
		})
	}
}

/// Client-side failure kinds.
///
/// Display strings are what operators see; they never carry secrets, tokens,
/// or decoded credentials.
#[derive(Debug, Error, Diagnostic)]
pub enum BackupError {
	#[error("validation error: {0}")]
	Validation(String),

	#[error("stopping MySQL service {service:?} failed: {reason}")]
	MySqlStopFailed { service: String, reason: String },

	#[error("starting MySQL service {service:?} failed: {reason}")]
	#[diagnostic(help("the service may need manual attention; the data directory is untouched"))]
	MySqlStartFailed { service: String, reason: String },

	#[error("MySQL service {service:?} did not reach the requested state within {timeout:?}")]
	MySqlTimeout { service: String, timeout: Duration },

	#[error("compression failed: {0}")]
	CompressionFailed(String),

	#[error("cleaning up partial archive failed: {0}")]
	CompressionCleanup(String),

	#[error("transfer failed: {0}")]
	TransferNetwork(String),

	#[error("receiver rejected the session: {0}")]
	AuthRejected(String),

	#[error("chunk {index} was rejected as conflicting")]
	ChunkConflict { index: u64 },

	#[error("receiver refused to resume: stored transfer does not match this archive")]
	ResumeMetadataMismatch,

	#[error("archive failed integrity verification on the receiver")]
	IntegrityFailure,

	#[error("{op_type} operation {op_id} timed out after {timeout:?}")]
	OperationTimeout {
		op_type: OpType,
		op_id: String,
		timeout: Duration,
	},

	#[error("{op_type} operation {op_id} failed after {attempts} attempt(s)")]
	RetryExhausted {
		op_type: OpType,
		op_id: String,
		attempts: u32,
		#[source]
		last: Box<BackupError>,
	},

	#[error("alert was rate-limited")]
	RateLimited,

	#[error("operation was cancelled")]
	Cancelled,

	#[error(transparent)]
	Protocol(#[from] ProtocolError),

	#[error("internal error: {0}")]
	Internal(String),
}

impl BackupError {
	/// Process exit code for `backup run`.
	pub fn exit_code(&self) -> u8 {
		match self {
			Self::Validation(_) => 2,
			Self::MySqlStopFailed { .. }
			| Self::MySqlStartFailed { .. }
			| Self::MySqlTimeout { .. } => 3,
			Self::TransferNetwork(_)
			| Self::AuthRejected(_)
			| Self::ChunkConflict { .. }
			| Self::ResumeMetadataMismatch
			| Self::Protocol(_) => 4,
			Self::IntegrityFailure => 5,
			Self::RetryExhausted { last, .. } => last.exit_code(),
			Self::OperationTimeout { op_type, .. } => match op_type {
				OpType::MySqlStop | OpType::MySqlStart => 3,
				OpType::Transfer | OpType::Finalize => 4,
				_ => 1,
			},
			_ => 1,
		}
	}

	/// Transient errors are worth another attempt; structural ones are not.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			Self::TransferNetwork(_)
				| Self::OperationTimeout { .. }
				| Self::MySqlTimeout { .. }
				| Self::Protocol(ProtocolError::Truncated | ProtocolError::Io(_))
		)
	}

	/// Critical failures fan out through the alert router.
	pub fn is_critical(&self) -> bool {
		matches!(
			self,
			Self::MySqlStartFailed { .. } | Self::IntegrityFailure
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exit_codes_match_the_cli_contract() {
		assert_eq!(BackupError::Validation("x".into()).exit_code(), 2);
		assert_eq!(
			BackupError::MySqlStopFailed {
				service: "mysql".into(),
				reason: "x".into()
			}
			.exit_code(),
			3
		);
		assert_eq!(BackupError::TransferNetwork("x".into()).exit_code(), 4);
		assert_eq!(BackupError::IntegrityFailure.exit_code(), 5);
		assert_eq!(BackupError::Cancelled.exit_code(), 1);

		let exhausted = BackupError::RetryExhausted {
			op_type: OpType::Transfer,
			op_id: "op".into(),
			attempts: 3,
			last: Box::new(BackupError::TransferNetwork("x".into())),
		};
		assert_eq!(exhausted.exit_code(), 4);
	}
}
