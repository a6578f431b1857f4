use miette::Diagnostic;
use thiserror::Error;

use coldbak_proto::error::{AuthError, ProtocolError};

/// Receiver-side failure kinds.
#[derive(Debug, Error, Diagnostic)]
pub enum ReceiverError {
	#[error("validation error: {0}")]
	Validation(String),

	#[error("unknown transfer {0:?}")]
	UnknownTransfer(String),

	#[error("chunk {index} conflicts with a previously stored copy")]
	ChunkConflict { index: u64 },

	#[error("resume token is unknown or expired")]
	UnknownResumeToken,

	#[error("resume token has already completed a transfer")]
	TokenAlreadyCompleted,

	#[error("presented metadata does not match the transfer this token belongs to")]
	ResumeMetadataMismatch,

	#[error("transfer is missing {} chunk(s)", missing.len())]
	MissingChunks { missing: Vec<u64> },

	#[error("assembled archive failed integrity verification")]
	#[diagnostic(help("the client should restart the transfer from scratch"))]
	IntegrityFailure,

	#[error("retention refused: {0}")]
	RetentionRefused(String),

	#[error("credential store is unreadable")]
	#[diagnostic(help("the store key does not match the file, or the file is corrupt"))]
	CredentialStoreUnreadable,

	#[error("store unreadable: {0}")]
	StoreUnreadable(String),

	#[error(transparent)]
	Auth(#[from] AuthError),

	#[error(transparent)]
	Protocol(#[from] ProtocolError),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

impl ReceiverError {
	/// Short stable code used in CHUNK_ACK / HELLO_ACK error fields.
	pub fn wire_code(&self) -> &'static str {
		match self {
			Self::Validation(_) => "ValidationError",
			Self::UnknownTransfer(_) => "UnknownTransfer",
			Self::ChunkConflict { .. } => "ChunkConflict",
			Self::UnknownResumeToken => "UnknownResumeToken",
			Self::TokenAlreadyCompleted => "TokenAlreadyCompleted",
			Self::ResumeMetadataMismatch => "ResumeMetadataMismatch",
			Self::MissingChunks { .. } => "MissingChunks",
			Self::IntegrityFailure => "IntegrityFailure",
			Self::RetentionRefused(_) => "RetentionRefused",
			Self::CredentialStoreUnreadable => "CredentialStoreUnreadable",
			Self::StoreUnreadable(_) => "StoreUnreadable",
			Self::Auth(err) => AuthError::code(*err),
			Self::Protocol(ProtocolError::VersionMismatch { .. }) => "ProtocolVersionMismatch",
			Self::Protocol(_) => "ProtocolError",
			Self::Io(_) => "IoError",
			Self::Internal(_) => "InternalError",
		}
	}
}
