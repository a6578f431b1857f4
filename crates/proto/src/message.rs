use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
	error::ProtocolError,
	frame::{PayloadReader, PayloadWriter, read_frame, write_frame},
	metadata::FileMetadata,
};

/// One byte on the wire, right after the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
	Hello = 1,
	HelloAck = 2,
	Begin = 3,
	BeginAck = 4,
	Chunk = 5,
	ChunkAck = 6,
	Finalize = 7,
	FinalizeAck = 8,
	ResumeOffer = 9,
}

impl TryFrom<u8> for MessageType {
	type Error = ProtocolError;

	fn try_from(value: u8) -> Result<Self, ProtocolError> {
		Ok(match value {
			1 => Self::Hello,
			2 => Self::HelloAck,
			3 => Self::Begin,
			4 => Self::BeginAck,
			5 => Self::Chunk,
			6 => Self::ChunkAck,
			7 => Self::Finalize,
			8 => Self::FinalizeAck,
			9 => Self::ResumeOffer,
			other => return Err(ProtocolError::UnknownMessageType(other)),
		})
	}
}

/// Client opener: protocol version and the base64 credentials token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
	pub version: u32,
	pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloAck {
	pub session_id: String,
	pub accepted: bool,
	pub error: Option<String>,
}

/// Start (or resume, when `resume_token` is set) a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
	pub metadata: FileMetadata,
	pub chunk_size: u64,
	pub resume_token: Option<String>,
}

/// `completed` is non-empty when resuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginAck {
	pub transfer_id: String,
	pub completed: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
	pub index: u64,
	pub length: u64,
	pub md5: String,
	pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
	Ok,
	AlreadyPresent,
	Error(String),
}

impl ChunkOutcome {
	fn as_wire(&self) -> &str {
		match self {
			Self::Ok => "ok",
			Self::AlreadyPresent => "already-present",
			Self::Error(code) => code,
		}
	}

	fn from_wire(text: &str) -> Self {
		match text {
			"ok" => Self::Ok,
			"already-present" => Self::AlreadyPresent,
			code => Self::Error(code.to_string()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
	pub index: u64,
	pub outcome: ChunkOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
	/// Archive assembled, verified, and placed at this path on the receiver.
	Ok { path: String },
	IntegrityFailure,
	MissingChunks(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeAck {
	pub outcome: FinalizeOutcome,
}

/// Server-initiated: the client reconnected with metadata matching an
/// in-flight transfer, so it is offered the token to resume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeOffer {
	pub token: String,
	pub completed: Vec<u64>,
}

/// Any protocol message, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	Hello(Hello),
	HelloAck(HelloAck),
	Begin(Begin),
	BeginAck(BeginAck),
	Chunk(Chunk),
	ChunkAck(ChunkAck),
	Finalize,
	FinalizeAck(FinalizeAck),
	ResumeOffer(ResumeOffer),
}

fn encode_metadata(writer: PayloadWriter, metadata: &FileMetadata) -> PayloadWriter {
	writer
		.put_str("name", &metadata.name)
		.put_u64("size", metadata.size)
		.put_str("md5", &metadata.md5)
		.put_str("sha256", &metadata.sha256)
		.put_str("created-at", &metadata.created_at.to_rfc3339())
}

fn decode_metadata(reader: &PayloadReader) -> Result<FileMetadata, ProtocolError> {
	let created_at = reader.str_field("created-at")?;
	let created_at = DateTime::parse_from_rfc3339(&created_at)
		.map_err(|err| ProtocolError::InvalidField {
			field: "created-at",
			reason: err.to_string(),
		})?
		.with_timezone(&Utc);

	Ok(FileMetadata {
		name: reader.str_field("name")?,
		size: reader.u64_field("size")?,
		md5: reader.str_field("md5")?,
		sha256: reader.str_field("sha256")?,
		created_at,
	})
}

impl Message {
	pub fn message_type(&self) -> MessageType {
		match self {
			Self::Hello(_) => MessageType::Hello,
			Self::HelloAck(_) => MessageType::HelloAck,
			Self::Begin(_) => MessageType::Begin,
			Self::BeginAck(_) => MessageType::BeginAck,
			Self::Chunk(_) => MessageType::Chunk,
			Self::ChunkAck(_) => MessageType::ChunkAck,
			Self::Finalize => MessageType::Finalize,
			Self::FinalizeAck(_) => MessageType::FinalizeAck,
			Self::ResumeOffer(_) => MessageType::ResumeOffer,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::Hello(_) => "HELLO",
			Self::HelloAck(_) => "HELLO_ACK",
			Self::Begin(_) => "BEGIN",
			Self::BeginAck(_) => "BEGIN_ACK",
			Self::Chunk(_) => "CHUNK",
			Self::ChunkAck(_) => "CHUNK_ACK",
			Self::Finalize => "FINALIZE",
			Self::FinalizeAck(_) => "FINALIZE_ACK",
			Self::ResumeOffer(_) => "RESUME_OFFER",
		}
	}

	fn encode(&self) -> Bytes {
		match self {
			Self::Hello(m) => PayloadWriter::new()
				.put_u32("version", m.version)
				.put_str("token", &m.token)
				.finish(),
			Self::HelloAck(m) => {
				let mut w = PayloadWriter::new()
					.put_str("session-id", &m.session_id)
					.put_bool("accepted", m.accepted);
				if let Some(error) = &m.error {
					w = w.put_str("error", error);
				}
				w.finish()
			}
			Self::Begin(m) => {
				let mut w = encode_metadata(PayloadWriter::new(), &m.metadata)
					.put_u64("chunk-size", m.chunk_size);
				if let Some(token) = &m.resume_token {
					w = w.put_str("resume-token", token);
				}
				w.finish()
			}
			Self::BeginAck(m) => PayloadWriter::new()
				.put_str("transfer-id", &m.transfer_id)
				.put_u64_list("completed", &m.completed)
				.finish(),
			Self::Chunk(m) => PayloadWriter::new()
				.put_u64("index", m.index)
				.put_u64("length", m.length)
				.put_str("md5", &m.md5)
				.put_bytes("bytes", &m.bytes)
				.finish(),
			Self::ChunkAck(m) => PayloadWriter::new()
				.put_u64("index", m.index)
				.put_str("outcome", m.outcome.as_wire())
				.finish(),
			Self::Finalize => PayloadWriter::new().finish(),
			Self::FinalizeAck(m) => match &m.outcome {
				FinalizeOutcome::Ok { path } => PayloadWriter::new()
					.put_str("outcome", "ok")
					.put_str("path", path)
					.finish(),
				FinalizeOutcome::IntegrityFailure => PayloadWriter::new()
					.put_str("outcome", "integrity-failure")
					.finish(),
				FinalizeOutcome::MissingChunks(missing) => PayloadWriter::new()
					.put_str("outcome", "missing-chunks")
					.put_u64_list("missing", missing)
					.finish(),
			},
			Self::ResumeOffer(m) => PayloadWriter::new()
				.put_str("token", &m.token)
				.put_u64_list("completed", &m.completed)
				.finish(),
		}
	}

	fn decode(msg_type: MessageType, payload: &Bytes) -> Result<Self, ProtocolError> {
		let reader = PayloadReader::parse(payload)?;
		Ok(match msg_type {
			MessageType::Hello => Self::Hello(Hello {
				version: reader.u32_field("version")?,
				token: reader.str_field("token")?,
			}),
			MessageType::HelloAck => Self::HelloAck(HelloAck {
				session_id: reader.str_field("session-id")?,
				accepted: reader.bool_field("accepted")?,
				error: reader.opt_str_field("error")?,
			}),
			MessageType::Begin => Self::Begin(Begin {
				metadata: decode_metadata(&reader)?,
				chunk_size: reader.u64_field("chunk-size")?,
				resume_token: reader.opt_str_field("resume-token")?,
			}),
			MessageType::BeginAck => Self::BeginAck(BeginAck {
				transfer_id: reader.str_field("transfer-id")?,
				completed: reader.u64_list_field("completed")?,
			}),
			MessageType::Chunk => Self::Chunk(Chunk {
				index: reader.u64_field("index")?,
				length: reader.u64_field("length")?,
				md5: reader.str_field("md5")?,
				bytes: reader.bytes("bytes")?.clone(),
			}),
			MessageType::ChunkAck => Self::ChunkAck(ChunkAck {
				index: reader.u64_field("index")?,
				outcome: ChunkOutcome::from_wire(&reader.str_field("outcome")?),
			}),
			MessageType::Finalize => Self::Finalize,
			MessageType::FinalizeAck => {
				let outcome = match reader.str_field("outcome")?.as_str() {
					"ok" => FinalizeOutcome::Ok {
						path: reader.str_field("path")?,
					},
					"integrity-failure" => FinalizeOutcome::IntegrityFailure,
					"missing-chunks" => {
						FinalizeOutcome::MissingChunks(reader.u64_list_field("missing")?)
					}
					other => {
						return Err(ProtocolError::InvalidField {
							field: "outcome",
							reason: format!("unknown finalize outcome {other:?}"),
						});
					}
				};
				Self::FinalizeAck(FinalizeAck { outcome })
			}
			MessageType::ResumeOffer => Self::ResumeOffer(ResumeOffer {
				token: reader.str_field("token")?,
				completed: reader.u64_list_field("completed")?,
			}),
		})
	}

	pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
	where
		W: AsyncWrite + Unpin,
	{
		let payload = self.encode();
		write_frame(writer, self.message_type() as u8, &payload).await
	}

	pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
	where
		R: AsyncRead + Unpin,
	{
		let (raw_type, payload) = read_frame(reader).await?;
		let msg_type = MessageType::try_from(raw_type)?;
		Self::decode(msg_type, &payload)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::checksum::{HashPair, md5_hex, sha256_hex};

	fn metadata() -> FileMetadata {
		FileMetadata::new(
			"20240115_103000_s1_db1.zip",
			1024 * 1024,
			HashPair {
				md5: md5_hex(b"archive"),
				sha256: sha256_hex(b"archive"),
			},
		)
	}

	async fn round_trip(message: Message) -> Message {
		let mut buf = Vec::new();
		message.write_to(&mut buf).await.unwrap();
		let mut cursor = std::io::Cursor::new(buf);
		Message::read_from(&mut cursor).await.unwrap()
	}

	#[tokio::test]
	async fn begin_with_and_without_resume_token() {
		let without = Message::Begin(Begin {
			metadata: metadata(),
			chunk_size: 256 * 1024,
			resume_token: None,
		});
		let with = Message::Begin(Begin {
			metadata: metadata(),
			chunk_size: 256 * 1024,
			resume_token: Some("RT_abcdefghijklmnopqrstuvwxyz".into()),
		});
		assert_eq!(round_trip(without.clone()).await, without);
		assert_eq!(round_trip(with.clone()).await, with);
	}

	#[tokio::test]
	async fn chunk_carries_raw_bytes() {
		let bytes = Bytes::from(vec![0u8, 1, 2, 255, 254]);
		let chunk = Message::Chunk(Chunk {
			index: 3,
			length: bytes.len() as u64,
			md5: md5_hex(&bytes),
			bytes,
		});
		assert_eq!(round_trip(chunk.clone()).await, chunk);
	}

	#[tokio::test]
	async fn finalize_ack_outcomes() {
		for outcome in [
			FinalizeOutcome::Ok {
				path: "/backups/s1/2024/01/x.zip".into(),
			},
			FinalizeOutcome::IntegrityFailure,
			FinalizeOutcome::MissingChunks(vec![3, 4]),
		] {
			let message = Message::FinalizeAck(FinalizeAck { outcome });
			assert_eq!(round_trip(message.clone()).await, message);
		}
	}

	#[tokio::test]
	async fn unknown_message_type_is_rejected() {
		let mut buf = Vec::new();
		crate::frame::write_frame(&mut buf, 200, b"\0").await.unwrap();
		let mut cursor = std::io::Cursor::new(buf);
		assert!(matches!(
			Message::read_from(&mut cursor).await,
			Err(ProtocolError::UnknownMessageType(200))
		));
	}
}
