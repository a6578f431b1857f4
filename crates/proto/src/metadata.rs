use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::{HashPair, hash_file};

/// Description of a file about to be transferred.
///
/// Immutable once a transfer begins: resume checks compare against the values
/// captured here, not against whatever is currently on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
	pub name: String,
	pub size: u64,
	pub md5: String,
	pub sha256: String,
	pub created_at: DateTime<Utc>,
}

impl FileMetadata {
	pub fn new(name: impl Into<String>, size: u64, hashes: HashPair) -> Self {
		Self {
			name: name.into(),
			size,
			md5: hashes.md5,
			sha256: hashes.sha256,
			created_at: Utc::now(),
		}
	}

	/// Hash `path` and capture its metadata in one pass.
	pub async fn for_file(path: &Path) -> std::io::Result<Self> {
		let name = path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_default();
		let (hashes, size) = hash_file(path).await?;
		Ok(Self::new(name, size, hashes))
	}

	/// Whether `other` describes the same bytes.
	///
	/// `created_at` is deliberately excluded: a client re-reading its stored
	/// metadata will have the original timestamp, a client re-hashing the
	/// file will not.
	pub fn describes_same_file(&self, other: &Self) -> bool {
		self.name == other.name
			&& self.size == other.size
			&& self.md5 == other.md5
			&& self.sha256 == other.sha256
	}
}
