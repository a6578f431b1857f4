use miette::Diagnostic;
use thiserror::Error;

/// Errors arising from the wire protocol itself.
#[derive(Debug, Error, Diagnostic)]
pub enum ProtocolError {
	#[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
	#[diagnostic(help("both ends must run the same protocol version; upgrade the older side"))]
	VersionMismatch { ours: u32, theirs: u32 },

	#[error("frame of {len} bytes exceeds the {cap} byte cap")]
	FrameTooLarge { len: u64, cap: u64 },

	#[error("unknown message type {0:#04x}")]
	UnknownMessageType(u8),

	#[error("unexpected {got} message (expected {expected})")]
	UnexpectedMessage {
		got: &'static str,
		expected: &'static str,
	},

	#[error("payload field {0:?} is missing")]
	MissingField(&'static str),

	#[error("payload field {field:?} is invalid: {reason}")]
	InvalidField {
		field: &'static str,
		reason: String,
	},

	#[error("connection closed mid-frame")]
	Truncated,

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Authentication outcomes that are reported to the peer and audited.
///
/// The display strings are deliberately generic: they must never carry the
/// secret, the raw token, or anything decoded from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Diagnostic)]
pub enum AuthError {
	#[error("no credentials token presented")]
	MissingToken,

	#[error("credentials token is not in the expected format")]
	InvalidFormat,

	#[error("credentials were not accepted")]
	InvalidCredentials,
}

impl AuthError {
	/// Stable code recorded in audit entries and HELLO_ACK errors.
	pub fn code(self) -> &'static str {
		match self {
			Self::MissingToken => "MissingToken",
			Self::InvalidFormat => "InvalidCredentialsFormat",
			Self::InvalidCredentials => "InvalidCredentials",
		}
	}
}
