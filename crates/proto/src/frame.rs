use std::collections::HashMap;

use bytes::{BufMut as _, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::error::ProtocolError;

/// Upper bound on one frame: a chunk plus key/value overhead.
///
/// Anything larger is a trap or a corrupted length prefix, not a real frame.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Write one `u32 length | u8 type | payload` frame.
///
/// The length prefix is big-endian and covers the type byte and the payload.
pub async fn write_frame<W>(writer: &mut W, msg_type: u8, payload: &[u8]) -> Result<(), ProtocolError>
where
	W: AsyncWrite + Unpin,
{
	let len = payload.len() as u64 + 1;
	if len > u64::from(MAX_FRAME_LEN) {
		return Err(ProtocolError::FrameTooLarge {
			len,
			cap: u64::from(MAX_FRAME_LEN),
		});
	}

	writer.write_u32(len as u32).await?;
	writer.write_u8(msg_type).await?;
	writer.write_all(payload).await?;
	writer.flush().await?;
	Ok(())
}

/// Read one frame, returning the message type and payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<(u8, Bytes), ProtocolError>
where
	R: AsyncRead + Unpin,
{
	let len = reader.read_u32().await.map_err(eof_as_truncated)?;
	if len == 0 {
		return Err(ProtocolError::Truncated);
	}
	if len > MAX_FRAME_LEN {
		return Err(ProtocolError::FrameTooLarge {
			len: u64::from(len),
			cap: u64::from(MAX_FRAME_LEN),
		});
	}

	let msg_type = reader.read_u8().await.map_err(eof_as_truncated)?;
	let mut payload = vec![0u8; (len - 1) as usize];
	reader
		.read_exact(&mut payload)
		.await
		.map_err(eof_as_truncated)?;
	Ok((msg_type, Bytes::from(payload)))
}

fn eof_as_truncated(err: std::io::Error) -> ProtocolError {
	if err.kind() == std::io::ErrorKind::UnexpectedEof {
		ProtocolError::Truncated
	} else {
		ProtocolError::Io(err)
	}
}

/// Builder for the length-prefixed key/value payload encoding.
///
/// Layout: `u8 field-count`, then per field `u8 key-len | key | u32 value-len
/// | value`. Values are raw bytes; integers go big-endian, strings UTF-8,
/// booleans a single `0`/`1` byte, u64 lists as packed big-endian words.
#[derive(Debug, Default)]
pub struct PayloadWriter {
	buf: BytesMut,
	count: u8,
}

impl PayloadWriter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn put_bytes(mut self, key: &'static str, value: &[u8]) -> Self {
		debug_assert!(key.len() <= u8::MAX as usize, "key too long");
		self.buf.put_u8(key.len() as u8);
		self.buf.put_slice(key.as_bytes());
		self.buf.put_u32(value.len() as u32);
		self.buf.put_slice(value);
		self.count += 1;
		self
	}

	pub fn put_str(self, key: &'static str, value: &str) -> Self {
		self.put_bytes(key, value.as_bytes())
	}

	pub fn put_u32(self, key: &'static str, value: u32) -> Self {
		self.put_bytes(key, &value.to_be_bytes())
	}

	pub fn put_u64(self, key: &'static str, value: u64) -> Self {
		self.put_bytes(key, &value.to_be_bytes())
	}

	pub fn put_bool(self, key: &'static str, value: bool) -> Self {
		self.put_bytes(key, &[u8::from(value)])
	}

	pub fn put_u64_list(self, key: &'static str, values: &[u64]) -> Self {
		let mut packed = Vec::with_capacity(values.len() * 8);
		for v in values {
			packed.extend_from_slice(&v.to_be_bytes());
		}
		self.put_bytes(key, &packed)
	}

	pub fn finish(self) -> Bytes {
		let mut out = BytesMut::with_capacity(1 + self.buf.len());
		out.put_u8(self.count);
		out.put_slice(&self.buf);
		out.freeze()
	}
}

/// Parsed key/value payload with typed accessors.
#[derive(Debug)]
pub struct PayloadReader {
	fields: HashMap<String, Bytes>,
}

impl PayloadReader {
	pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
		let mut fields = HashMap::new();
		let mut at = 0usize;

		let take = |at: &mut usize, n: usize| -> Result<Bytes, ProtocolError> {
			if *at + n > payload.len() {
				return Err(ProtocolError::Truncated);
			}
			let slice = payload.slice(*at..*at + n);
			*at += n;
			Ok(slice)
		};

		let count = take(&mut at, 1)?[0];
		for _ in 0..count {
			let key_len = take(&mut at, 1)?[0] as usize;
			let key = take(&mut at, key_len)?;
			let key = std::str::from_utf8(&key)
				.map_err(|_| ProtocolError::InvalidField {
					field: "key",
					reason: "not UTF-8".into(),
				})?
				.to_string();
			let value_len = u32::from_be_bytes(
				// UNWRAP: take() returned exactly 4 bytes
				take(&mut at, 4)?.as_ref().try_into().unwrap(),
			) as usize;
			let value = take(&mut at, value_len)?;
			fields.insert(key, value);
		}

		Ok(Self { fields })
	}

	pub fn bytes(&self, key: &'static str) -> Result<&Bytes, ProtocolError> {
		self.fields.get(key).ok_or(ProtocolError::MissingField(key))
	}

	pub fn opt_bytes(&self, key: &'static str) -> Option<&Bytes> {
		self.fields.get(key)
	}

	pub fn str_field(&self, key: &'static str) -> Result<String, ProtocolError> {
		let raw = self.bytes(key)?;
		std::str::from_utf8(raw)
			.map(ToString::to_string)
			.map_err(|_| ProtocolError::InvalidField {
				field: key,
				reason: "not UTF-8".into(),
			})
	}

	pub fn opt_str_field(&self, key: &'static str) -> Result<Option<String>, ProtocolError> {
		match self.opt_bytes(key) {
			None => Ok(None),
			Some(raw) => std::str::from_utf8(raw)
				.map(|s| Some(s.to_string()))
				.map_err(|_| ProtocolError::InvalidField {
					field: key,
					reason: "not UTF-8".into(),
				}),
		}
	}

	pub fn u32_field(&self, key: &'static str) -> Result<u32, ProtocolError> {
		let raw = self.bytes(key)?;
		let arr: [u8; 4] = raw.as_ref().try_into().map_err(|_| ProtocolError::InvalidField {
			field: key,
			reason: format!("expected 4 bytes, got {}", raw.len()),
		})?;
		Ok(u32::from_be_bytes(arr))
	}

	pub fn u64_field(&self, key: &'static str) -> Result<u64, ProtocolError> {
		let raw = self.bytes(key)?;
		let arr: [u8; 8] = raw.as_ref().try_into().map_err(|_| ProtocolError::InvalidField {
			field: key,
			reason: format!("expected 8 bytes, got {}", raw.len()),
		})?;
		Ok(u64::from_be_bytes(arr))
	}

	pub fn bool_field(&self, key: &'static str) -> Result<bool, ProtocolError> {
		let raw = self.bytes(key)?;
		match raw.as_ref() {
			[0] => Ok(false),
			[1] => Ok(true),
			_ => Err(ProtocolError::InvalidField {
				field: key,
				reason: "expected a single 0/1 byte".into(),
			}),
		}
	}

	pub fn u64_list_field(&self, key: &'static str) -> Result<Vec<u64>, ProtocolError> {
		let raw = self.bytes(key)?;
		if raw.len() % 8 != 0 {
			return Err(ProtocolError::InvalidField {
				field: key,
				reason: format!("packed u64 list length {} not a multiple of 8", raw.len()),
			});
		}
		Ok(raw
			.chunks_exact(8)
			// UNWRAP: chunks_exact yields exactly 8 bytes
			.map(|w| u64::from_be_bytes(w.try_into().unwrap()))
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frame_round_trip() {
		let mut buf = Vec::new();
		write_frame(&mut buf, 3, b"hello payload").await.unwrap();
		write_frame(&mut buf, 7, b"").await.unwrap();

		let mut cursor = std::io::Cursor::new(buf);
		let (t1, p1) = read_frame(&mut cursor).await.unwrap();
		assert_eq!((t1, p1.as_ref()), (3, b"hello payload".as_slice()));
		let (t2, p2) = read_frame(&mut cursor).await.unwrap();
		assert_eq!((t2, p2.len()), (7, 0));

		assert!(matches!(
			read_frame(&mut cursor).await,
			Err(ProtocolError::Truncated)
		));
	}

	#[tokio::test]
	async fn oversized_length_prefix_is_rejected_without_allocating() {
		let mut buf = Vec::new();
		buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
		let mut cursor = std::io::Cursor::new(buf);
		assert!(matches!(
			read_frame(&mut cursor).await,
			Err(ProtocolError::FrameTooLarge { .. })
		));
	}

	#[test]
	fn payload_round_trip() {
		let payload = PayloadWriter::new()
			.put_str("name", "db1.zip")
			.put_u64("size", 1_048_576)
			.put_u32("version", 1)
			.put_bool("last", true)
			.put_u64_list("completed", &[0, 1, 5])
			.put_bytes("raw", &[0xde, 0xad])
			.finish();

		let reader = PayloadReader::parse(&payload).unwrap();
		assert_eq!(reader.str_field("name").unwrap(), "db1.zip");
		assert_eq!(reader.u64_field("size").unwrap(), 1_048_576);
		assert_eq!(reader.u32_field("version").unwrap(), 1);
		assert!(reader.bool_field("last").unwrap());
		assert_eq!(reader.u64_list_field("completed").unwrap(), vec![0, 1, 5]);
		assert_eq!(reader.bytes("raw").unwrap().as_ref(), &[0xde, 0xad]);

		assert!(matches!(
			reader.u64_field("absent"),
			Err(ProtocolError::MissingField("absent"))
		));
		assert!(reader.opt_str_field("absent").unwrap().is_none());
	}

	#[test]
	fn truncated_payload_is_an_error_not_a_panic() {
		let full = PayloadWriter::new().put_str("k", "value").finish();
		for cut in 0..full.len() {
			let partial = full.slice(..cut);
			// Either parses to fewer fields or errors; must never panic.
			let _ = PayloadReader::parse(&partial);
		}
	}
}
