use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike as _, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReceiverError;

/// What the receiver knows about a backup when placing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
	pub server_name: String,
	pub database_name: String,
	pub backup_time: DateTime<Utc>,
	pub backup_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateGranularity {
	Year,
	Month,
	Day,
}

/// How archive sub-directories are derived under the storage root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationKind {
	/// `server/2024/01/…`
	ServerDateBased,
	/// `2024/01/server/…`
	DateServerBased,
	/// `server/…`
	FlatServerBased,
	/// Pattern with `{server}`, `{database}`, `{year}`, `{month}`, `{day}`
	/// tokens, `/`-separated.
	Custom(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryOrganizationStrategy {
	pub kind: OrganizationKind,
	pub granularity: DateGranularity,
	pub include_database_dir: bool,
}

impl Default for DirectoryOrganizationStrategy {
	fn default() -> Self {
		Self {
			kind: OrganizationKind::ServerDateBased,
			granularity: DateGranularity::Month,
			include_database_dir: false,
		}
	}
}

impl DirectoryOrganizationStrategy {
	fn date_components(&self, time: &DateTime<Utc>) -> Vec<String> {
		let mut parts = vec![format!("{:04}", time.year())];
		if matches!(self.granularity, DateGranularity::Month | DateGranularity::Day) {
			parts.push(format!("{:02}", time.month()));
		}
		if matches!(self.granularity, DateGranularity::Day) {
			parts.push(format!("{:02}", time.day()));
		}
		parts
	}

	/// Raw (unsanitized) path components for this backup.
	fn components(&self, meta: &BackupMetadata) -> Vec<String> {
		let mut parts = match &self.kind {
			OrganizationKind::ServerDateBased => {
				let mut parts = vec![meta.server_name.clone()];
				parts.extend(self.date_components(&meta.backup_time));
				parts
			}
			OrganizationKind::DateServerBased => {
				let mut parts = self.date_components(&meta.backup_time);
				parts.push(meta.server_name.clone());
				parts
			}
			OrganizationKind::FlatServerBased => vec![meta.server_name.clone()],
			OrganizationKind::Custom(pattern) => pattern
				.split('/')
				.map(|part| {
					part.replace("{server}", &meta.server_name)
						.replace("{database}", &meta.database_name)
						.replace("{year}", &format!("{:04}", meta.backup_time.year()))
						.replace("{month}", &format!("{:02}", meta.backup_time.month()))
						.replace("{day}", &format!("{:02}", meta.backup_time.day()))
				})
				.collect(),
		};

		if self.include_database_dir {
			parts.push(meta.database_name.clone());
		}
		parts
	}
}

/// File name generation from a token pattern.
///
/// The boolean flags must agree with the tokens actually present in the
/// pattern; [`validate`](Self::validate) enforces that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNamingStrategy {
	pub pattern: String,
	pub date_format: String,
	pub include_server: bool,
	pub include_database: bool,
}

impl Default for FileNamingStrategy {
	fn default() -> Self {
		Self {
			pattern: "{timestamp}_{server}_{database}".into(),
			date_format: "%Y%m%d_%H%M%S".into(),
			include_server: true,
			include_database: true,
		}
	}
}

impl FileNamingStrategy {
	pub fn validate(&self) -> Result<(), ReceiverError> {
		if self.pattern.trim().is_empty() {
			return Err(ReceiverError::Validation("file pattern is empty".into()));
		}
		if !self.pattern.contains("{timestamp}") {
			return Err(ReceiverError::Validation(
				"file pattern must contain {timestamp}".into(),
			));
		}
		if self.pattern.contains("{server}") != self.include_server {
			return Err(ReceiverError::Validation(
				"include_server flag disagrees with {server} in the pattern".into(),
			));
		}
		if self.pattern.contains("{database}") != self.include_database {
			return Err(ReceiverError::Validation(
				"include_database flag disagrees with {database} in the pattern".into(),
			));
		}
		if self.date_format.trim().is_empty() {
			return Err(ReceiverError::Validation("date format is empty".into()));
		}
		Ok(())
	}

	/// Render the archive file name. Always sanitized, always `.zip`.
	pub fn file_name(&self, meta: &BackupMetadata) -> String {
		let timestamp = meta.backup_time.format(&self.date_format).to_string();
		let stem = self
			.pattern
			.replace("{timestamp}", &timestamp)
			.replace("{server}", &meta.server_name)
			.replace("{database}", &meta.database_name);

		let mut stem = sanitize_component(&stem);
		clip_to_bytes(&mut stem, MAX_FILE_NAME_BYTES - ZIP_SUFFIX.len());
		format!("{stem}{ZIP_SUFFIX}")
	}
}

const ZIP_SUFFIX: &str = ".zip";
const MAX_FILE_NAME_BYTES: usize = 255;

/// Characters never allowed in a path component, on any supported platform.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Make one path component safe: invalid characters become `_`, surrounding
/// whitespace and trailing dots go, empty collapses to `_`.
pub fn sanitize_component(raw: &str) -> String {
	let cleaned: String = raw
		.trim()
		.chars()
		.map(|c| {
			if c.is_control() || INVALID_CHARS.contains(&c) {
				'_'
			} else {
				c
			}
		})
		.collect();

	// Trailing dots are invalid on Windows; this also folds "." and ".."
	// into empty, which collapses to "_" below.
	let cleaned = cleaned.trim_end_matches(['.', ' ']);
	if cleaned.is_empty() {
		"_".to_string()
	} else {
		cleaned.to_string()
	}
}

fn clip_to_bytes(text: &mut String, limit: usize) {
	if text.len() <= limit {
		return;
	}
	let mut end = limit;
	while !text.is_char_boundary(end) {
		end -= 1;
	}
	text.truncate(end);
}

/// Deterministic placement of archives under a base directory.
#[derive(Debug, Clone)]
pub struct StorageLayout {
	base: PathBuf,
	organization: DirectoryOrganizationStrategy,
	naming: FileNamingStrategy,
}

impl StorageLayout {
	pub fn new(
		base: impl Into<PathBuf>,
		organization: DirectoryOrganizationStrategy,
		naming: FileNamingStrategy,
	) -> Result<Self, ReceiverError> {
		naming.validate()?;
		Ok(Self {
			base: base.into(),
			organization,
			naming,
		})
	}

	pub fn base(&self) -> &Path {
		&self.base
	}

	/// The directory this backup's archive belongs in.
	pub fn directory(&self, meta: &BackupMetadata) -> Result<PathBuf, ReceiverError> {
		let mut dir = self.base.clone();
		for component in self.organization.components(meta) {
			dir.push(sanitize_component(&component));
		}

		// Sanitization removes every separator and dot-component, so this
		// only fires if the strategy itself is broken.
		if !dir.starts_with(&self.base) {
			return Err(ReceiverError::Validation(format!(
				"derived directory {dir:?} escapes the storage root"
			)));
		}
		Ok(dir)
	}

	pub fn file_name(&self, meta: &BackupMetadata) -> String {
		self.naming.file_name(meta)
	}

	/// Full archive path: directory + file name.
	pub fn archive_path(&self, meta: &BackupMetadata) -> Result<PathBuf, ReceiverError> {
		Ok(self.directory(meta)?.join(self.file_name(meta)))
	}

	/// Companion metadata path for an archive: `x.zip` → `x.meta.json`.
	pub fn meta_path(archive: &Path) -> PathBuf {
		archive.with_extension("meta.json")
	}
}
