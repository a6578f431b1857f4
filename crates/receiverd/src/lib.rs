#![deny(rust_2018_idioms)]

//! The coldbak file receiver.
//!
//! Accepts authenticated transfer sessions over TCP (optionally TLS), stores
//! chunks into a staging area with content-addressed integrity checks, places
//! verified archives into the configured directory layout, and prunes old
//! archives under retention policies.

use std::{path::PathBuf, time::Duration};

mod audit;
mod authstore;
mod catalog;
mod chunks;
mod daemon;
mod error;
mod layout;
mod retention;
mod session;
mod tls;
mod tokens;
mod verify;

pub use audit::{AuditEntry, AuditLog, AuditOperation, AuditOutcome};
pub use authstore::{AuthStore, ClientCredentials, DEFAULT_CLIENT_ID, DEFAULT_CLIENT_SECRET};
pub use catalog::{Catalog, CatalogEntry};
pub use chunks::{ChunkManager, TransferState};
pub use daemon::{DependencyValidationResult, run, run_with_shutdown};
pub use error::ReceiverError;
pub use layout::{
	BackupMetadata, DateGranularity, DirectoryOrganizationStrategy, FileNamingStrategy,
	OrganizationKind, StorageLayout,
};
pub use retention::{
	AppliedRetention, DeletionPlan, PolicyStore, RetentionImpact, RetentionPolicy,
	apply as retention_apply, estimate as retention_estimate, plan as retention_plan,
};
pub use tokens::TokenStore;
pub use verify::{VerifyOutcome, verify_archive, verify_all};

/// Configuration for the receiver daemon.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
	/// Address to listen on.
	pub bind: String,
	pub port: u16,

	/// Root of the organized archive storage.
	pub storage_root: PathBuf,

	/// Where in-flight chunks are staged. Defaults to `<storage>/.staging`.
	pub staging_dir: PathBuf,

	/// Encrypted client-credential store and its symmetric key.
	pub credentials_file: PathBuf,
	pub store_key: [u8; 32],

	/// Directory for the append-only audit log.
	pub audit_dir: PathBuf,

	/// Maximum concurrently served sessions.
	pub max_sessions: usize,

	/// How sub-directories under the storage root are organized.
	pub organization: DirectoryOrganizationStrategy,
	pub naming: FileNamingStrategy,

	/// Completed resume tokens are kept this long after finalize.
	pub token_grace: Duration,

	/// Idle, unfinished transfers (and their staged chunks) are dropped
	/// after this long without activity.
	pub idle_transfer_ttl: Duration,

	/// How often the token/staging sweep runs.
	pub sweep_interval: Duration,

	/// How often enabled retention policies are applied. `None` disables
	/// the background retention task.
	pub retention_interval: Option<Duration>,

	/// TLS cert/key in PEM format; both or neither.
	pub tls: Option<TlsPaths>,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
	pub cert: PathBuf,
	pub key: PathBuf,
}

impl ReceiverConfig {
	pub fn new(storage_root: impl Into<PathBuf>, port: u16, store_key: [u8; 32]) -> Self {
		let storage_root = storage_root.into();
		Self {
			bind: "0.0.0.0".into(),
			port,
			staging_dir: storage_root.join(".staging"),
			credentials_file: storage_root.join("credentials.enc"),
			audit_dir: storage_root.join("audit"),
			storage_root,
			store_key,
			max_sessions: 8,
			organization: DirectoryOrganizationStrategy::default(),
			naming: FileNamingStrategy::default(),
			token_grace: Duration::from_secs(24 * 60 * 60),
			idle_transfer_ttl: Duration::from_secs(7 * 24 * 60 * 60),
			sweep_interval: Duration::from_secs(15 * 60),
			retention_interval: Some(Duration::from_secs(60 * 60)),
			tls: None,
		}
	}

	pub fn with_tls(mut self, cert: PathBuf, key: PathBuf) -> Self {
		self.tls = Some(TlsPaths { cert, key });
		self
	}

	pub fn with_max_sessions(mut self, max: usize) -> Self {
		self.max_sessions = max.max(1);
		self
	}

	pub fn catalog_file(&self) -> PathBuf {
		self.storage_root.join("catalog.json")
	}

	pub fn tokens_file(&self) -> PathBuf {
		self.storage_root.join("resume-tokens.json")
	}

	pub fn policies_file(&self) -> PathBuf {
		self.storage_root.join("retention-policies.json")
	}
}
