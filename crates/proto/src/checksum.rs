use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs::File, io::AsyncReadExt as _};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Hex-encoded MD5 and SHA-256 over the same bytes.
///
/// Chunks are addressed by MD5 alone; whole archives carry both digests and
/// finalization requires both to match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashPair {
	pub md5: String,
	pub sha256: String,
}

/// MD5 over a byte slice, lowercase hex.
pub fn md5_hex(bytes: &[u8]) -> String {
	hex::encode(Md5::digest(bytes))
}

/// SHA-256 over a byte slice, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
	hex::encode(Sha256::digest(bytes))
}

/// Both digests computed incrementally in a single pass.
#[derive(Debug, Default)]
pub struct StreamingChecksum {
	md5: Md5,
	sha256: Sha256,
	bytes: u64,
}

impl StreamingChecksum {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn update(&mut self, bytes: &[u8]) {
		self.md5.update(bytes);
		self.sha256.update(bytes);
		self.bytes += bytes.len() as u64;
	}

	pub fn bytes_seen(&self) -> u64 {
		self.bytes
	}

	pub fn finish(self) -> HashPair {
		HashPair {
			md5: hex::encode(self.md5.finalize()),
			sha256: hex::encode(self.sha256.finalize()),
		}
	}
}

/// Hash a file on disk with both digests in one read pass.
///
/// Returns the digests and the number of bytes read.
pub async fn hash_file(path: &Path) -> std::io::Result<(HashPair, u64)> {
	let mut file = File::open(path).await?;
	let mut sum = StreamingChecksum::new();
	let mut buf = vec![0u8; READ_BUF_SIZE];

	loop {
		let n = file.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		sum.update(&buf[..n]);
	}

	let bytes = sum.bytes_seen();
	Ok((sum.finish(), bytes))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn known_vectors() {
		assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
		assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
		assert_eq!(
			sha256_hex(b""),
			"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
		);
		assert_eq!(
			sha256_hex(b"abc"),
			"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
		);
	}

	#[test]
	fn streaming_matches_oneshot() {
		let data = vec![0xa5u8; 100_000];
		let mut sum = StreamingChecksum::new();
		for part in data.chunks(7919) {
			sum.update(part);
		}
		assert_eq!(sum.bytes_seen(), data.len() as u64);
		let pair = sum.finish();
		assert_eq!(pair.md5, md5_hex(&data));
		assert_eq!(pair.sha256, sha256_hex(&data));
	}

	#[tokio::test]
	async fn file_hashing_matches_memory() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("blob");
		let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
		tokio::fs::write(&path, &data).await.unwrap();

		let (pair, size) = hash_file(&path).await.unwrap();
		assert_eq!(size, data.len() as u64);
		assert_eq!(pair.md5, md5_hex(&data));
		assert_eq!(pair.sha256, sha256_hex(&data));
	}
}
