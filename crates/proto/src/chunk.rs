use std::{io::SeekFrom, num::NonZeroU64, path::Path};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::{
	fs::File,
	io::{AsyncReadExt as _, AsyncSeekExt as _},
};
use tracing::{instrument, trace};

use crate::checksum::md5_hex;

/// Default chunk size: 256 KiB.
// SAFETY: hardcoded
pub const DEFAULT_CHUNK_SIZE: NonZeroU64 = unsafe { NonZeroU64::new_unchecked(256 * 1024) };

/// Number of chunks a file of `size` bytes splits into.
pub fn chunk_count(size: u64, chunk_size: NonZeroU64) -> u64 {
	if size == 0 {
		0
	} else {
		size.div_ceil(chunk_size.get())
	}
}

/// Per-chunk framing data carried alongside the bytes.
///
/// Keyed by `(transfer_id, index)` on the receiver; `length` is the actual
/// byte count of this chunk (the final chunk is usually short).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
	pub index: u64,
	pub length: u64,
	pub md5: String,
	pub is_last: bool,
}

/// Reads a file in fixed-size chunks, addressable by index.
///
/// Fixed sizing (rather than adaptive) is what makes resume possible: both
/// ends derive identical chunk boundaries from `(size, chunk_size)`, so a
/// resumed transfer can skip exactly the indices the receiver already holds.
#[derive(Debug)]
pub struct FileChunker {
	file: File,
	size: u64,
	chunk_size: NonZeroU64,
}

impl FileChunker {
	#[instrument(level = "debug")]
	pub async fn open(path: &Path, chunk_size: NonZeroU64) -> std::io::Result<Self> {
		let file = File::open(path).await?;
		let size = file.metadata().await?.len();
		Ok(Self {
			file,
			size,
			chunk_size,
		})
	}

	/// The length of the file in bytes, read from metadata at open time.
	#[inline]
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> u64 {
		self.size
	}

	#[inline]
	pub fn chunk_size(&self) -> NonZeroU64 {
		self.chunk_size
	}

	/// Total number of chunks this file divides into.
	#[inline]
	pub fn chunk_count(&self) -> u64 {
		chunk_count(self.size, self.chunk_size)
	}

	/// Read the chunk at `index`.
	///
	/// Returns `Ok(None)` if `index` is past the end of the file.
	pub async fn read_chunk(&mut self, index: u64) -> std::io::Result<Option<(ChunkHeader, Bytes)>> {
		let count = self.chunk_count();
		if index >= count {
			return Ok(None);
		}

		let start = index * self.chunk_size.get();
		let size = self.chunk_size.get().min(self.size - start);
		trace!(index, start, size, "reading a chunk of file");

		self.file.seek(SeekFrom::Start(start)).await?;

		let mut chunk = BytesMut::with_capacity(size as _);
		let mut bytes = self.file.read_buf(&mut chunk).await?;
		while bytes > 0 && chunk.len() < size as _ {
			let more = self.file.read_buf(&mut chunk).await?;
			if more == 0 {
				break;
			}
			bytes += more;
		}
		chunk.truncate(size as _);

		if chunk.len() as u64 != size {
			return Err(std::io::Error::new(
				std::io::ErrorKind::UnexpectedEof,
				format!("chunk {index} truncated: wanted {size} bytes, got {}", chunk.len()),
			));
		}

		let header = ChunkHeader {
			index,
			length: size,
			md5: md5_hex(&chunk),
			is_last: index == count - 1,
		};
		Ok(Some((header, chunk.freeze())))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn count_is_ceiling_division() {
		let k256 = NonZeroU64::new(256 * 1024).unwrap();
		assert_eq!(chunk_count(0, k256), 0);
		assert_eq!(chunk_count(1, k256), 1);
		assert_eq!(chunk_count(256 * 1024, k256), 1);
		assert_eq!(chunk_count(256 * 1024 + 1, k256), 2);
		assert_eq!(chunk_count(1024 * 1024, k256), 4);
	}

	#[tokio::test]
	async fn chunks_reassemble_to_original() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("blob");
		let data: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 256) as u8).collect();
		tokio::fs::write(&path, &data).await.unwrap();

		let chunk_size = NonZeroU64::new(4096).unwrap();
		let mut chunker = FileChunker::open(&path, chunk_size).await.unwrap();
		assert_eq!(chunker.len(), data.len() as u64);

		let mut rebuilt = Vec::new();
		for index in 0..chunker.chunk_count() {
			let (header, bytes) = chunker.read_chunk(index).await.unwrap().unwrap();
			assert_eq!(header.length, bytes.len() as u64);
			assert_eq!(header.md5, md5_hex(&bytes));
			assert_eq!(header.is_last, index == chunker.chunk_count() - 1);
			rebuilt.extend_from_slice(&bytes);
		}

		assert_eq!(rebuilt, data);
		assert!(chunker.read_chunk(chunker.chunk_count()).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn chunks_can_be_read_out_of_order() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("blob");
		tokio::fs::write(&path, vec![7u8; 10_000]).await.unwrap();

		let mut chunker = FileChunker::open(&path, NonZeroU64::new(4096).unwrap())
			.await
			.unwrap();
		let (later, _) = chunker.read_chunk(2).await.unwrap().unwrap();
		let (earlier, _) = chunker.read_chunk(0).await.unwrap().unwrap();
		assert_eq!(later.length, 10_000 - 2 * 4096);
		assert!(later.is_last);
		assert_eq!(earlier.length, 4096);
		assert!(!earlier.is_last);
	}
}
