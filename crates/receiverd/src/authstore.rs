use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::{Arc, Mutex as StdMutex, OnceLock},
};

use aes_gcm::{
	Aes256Gcm, Key, Nonce,
	aead::{Aead as _, KeyInit as _},
};
use argon2::{
	Argon2, PasswordHasher as _, PasswordVerifier as _,
	password_hash::{PasswordHash, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use coldbak_proto::auth::{MAX_CLIENT_ID_LEN, MAX_CLIENT_SECRET_LEN};

use crate::error::ReceiverError;

/// Seeded on first initialization so a fresh receiver can be reached.
pub const DEFAULT_CLIENT_ID: &str = "default-client";
pub const DEFAULT_CLIENT_SECRET: &str = "default-secret-2024";

const FILE_MAGIC: &[u8; 5] = b"CBAK1";
const NONCE_LEN: usize = 12;

/// One accepted client. The secret is stored only as an argon2 hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCredentials {
	pub client_id: String,
	pub secret_hash: String,
	pub name: String,
	pub active: bool,
	pub created_at: DateTime<Utc>,
}

// One mutex per store file, shared across AuthStore instances for the same
// path.
fn path_lock(path: &Path) -> Arc<Mutex<()>> {
	static LOCKS: OnceLock<StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
	let locks = LOCKS.get_or_init(|| StdMutex::new(HashMap::new()));
	// UNWRAP: the registry mutex is never poisoned (no panics while held)
	let mut locks = locks.lock().unwrap();
	locks.entry(path.to_path_buf()).or_default().clone()
}

/// At-rest-encrypted credential store.
///
/// The whole file is one AES-256-GCM blob under a host-supplied key:
/// `magic | nonce | ciphertext(json rows)`. Writes go through a temp file
/// and a rename.
#[derive(Debug)]
pub struct AuthStore {
	path: PathBuf,
	key: [u8; 32],
	lock: Arc<Mutex<()>>,
}

impl AuthStore {
	pub fn open(path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
		let path = path.into();
		let lock = path_lock(&path);
		Self { path, key, lock }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn decrypt(&self, blob: &[u8]) -> Result<Vec<ClientCredentials>, ReceiverError> {
		let rest = blob
			.strip_prefix(FILE_MAGIC.as_slice())
			.ok_or(ReceiverError::CredentialStoreUnreadable)?;
		if rest.len() < NONCE_LEN {
			return Err(ReceiverError::CredentialStoreUnreadable);
		}
		let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
		let plain = cipher
			.decrypt(Nonce::from_slice(nonce), ciphertext)
			.map_err(|_| ReceiverError::CredentialStoreUnreadable)?;
		serde_json::from_slice(&plain).map_err(|_| ReceiverError::CredentialStoreUnreadable)
	}

	fn encrypt(&self, rows: &[ClientCredentials]) -> Result<Vec<u8>, ReceiverError> {
		let plain = serde_json::to_vec(rows).map_err(|err| ReceiverError::Internal(err.to_string()))?;

		let mut nonce = [0u8; NONCE_LEN];
		use rand::RngCore as _;
		rand::thread_rng().fill_bytes(&mut nonce);

		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
		let ciphertext = cipher
			.encrypt(Nonce::from_slice(&nonce), plain.as_slice())
			.map_err(|err| ReceiverError::Internal(format!("encrypting credential store: {err}")))?;

		let mut blob = Vec::with_capacity(FILE_MAGIC.len() + NONCE_LEN + ciphertext.len());
		blob.extend_from_slice(FILE_MAGIC);
		blob.extend_from_slice(&nonce);
		blob.extend_from_slice(&ciphertext);
		Ok(blob)
	}

	async fn load(&self) -> Result<Vec<ClientCredentials>, ReceiverError> {
		match tokio::fs::read(&self.path).await {
			Ok(blob) if blob.is_empty() => Ok(Vec::new()),
			Ok(blob) => self.decrypt(&blob),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(err) => Err(err.into()),
		}
	}

	async fn save(&self, rows: &[ClientCredentials]) -> Result<(), ReceiverError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let blob = self.encrypt(rows)?;
		let tmp = self.path.with_extension("enc.tmp");
		tokio::fs::write(&tmp, blob).await?;
		tokio::fs::rename(&tmp, &self.path).await?;
		Ok(())
	}

	fn hash_secret(secret: &str) -> Result<String, ReceiverError> {
		let salt = SaltString::generate(&mut OsRng);
		Argon2::default()
			.hash_password(secret.as_bytes(), &salt)
			.map(|hash| hash.to_string())
			.map_err(|err| ReceiverError::Internal(format!("hashing secret: {err}")))
	}

	/// Seed the default client if (and only if) the store is empty.
	///
	/// Re-running against an existing store is a no-op: the file, including
	/// the original `created_at`, is left byte-for-byte untouched.
	pub async fn init(&self) -> Result<bool, ReceiverError> {
		let _guard = self.lock.lock().await;
		let rows = self.load().await?;
		if !rows.is_empty() {
			debug!(path = ?self.path, "credential store already initialized");
			return Ok(false);
		}

		let seed = ClientCredentials {
			client_id: DEFAULT_CLIENT_ID.into(),
			secret_hash: Self::hash_secret(DEFAULT_CLIENT_SECRET)?,
			name: "Default client".into(),
			active: true,
			created_at: Utc::now(),
		};
		self.save(&[seed]).await?;
		info!(path = ?self.path, "seeded credential store with the default client");
		Ok(true)
	}

	/// Constant-shape validation: every failure path returns plain `false`.
	pub async fn validate(&self, client_id: &str, client_secret: &str) -> Result<bool, ReceiverError> {
		if client_id.is_empty() || client_secret.is_empty() {
			return Ok(false);
		}

		let rows = {
			let _guard = self.lock.lock().await;
			self.load().await?
		};
		let Some(row) = rows.iter().find(|r| r.client_id == client_id) else {
			return Ok(false);
		};
		if !row.active {
			return Ok(false);
		}

		let Ok(parsed) = PasswordHash::new(&row.secret_hash) else {
			warn!(client_id, "stored secret hash is unparseable");
			return Ok(false);
		};
		Ok(Argon2::default()
			.verify_password(client_secret.as_bytes(), &parsed)
			.is_ok())
	}

	pub async fn add(
		&self,
		client_id: &str,
		client_secret: &str,
		name: &str,
	) -> Result<(), ReceiverError> {
		if client_id.is_empty()
			|| client_id.len() > MAX_CLIENT_ID_LEN
			|| client_id.contains(':')
		{
			return Err(ReceiverError::Validation(format!(
				"client id must be 1..={MAX_CLIENT_ID_LEN} chars without ':'"
			)));
		}
		if client_secret.is_empty() || client_secret.len() > MAX_CLIENT_SECRET_LEN {
			return Err(ReceiverError::Validation(format!(
				"client secret must be 1..={MAX_CLIENT_SECRET_LEN} chars"
			)));
		}

		let _guard = self.lock.lock().await;
		let mut rows = self.load().await?;
		if rows.iter().any(|r| r.client_id == client_id) {
			return Err(ReceiverError::Validation(format!(
				"client {client_id:?} already exists"
			)));
		}
		rows.push(ClientCredentials {
			client_id: client_id.into(),
			secret_hash: Self::hash_secret(client_secret)?,
			name: name.into(),
			active: true,
			created_at: Utc::now(),
		});
		self.save(&rows).await
	}

	pub async fn remove(&self, client_id: &str) -> Result<bool, ReceiverError> {
		let _guard = self.lock.lock().await;
		let mut rows = self.load().await?;
		let before = rows.len();
		rows.retain(|r| r.client_id != client_id);
		if rows.len() == before {
			return Ok(false);
		}
		self.save(&rows).await?;
		Ok(true)
	}

	pub async fn list(&self) -> Result<Vec<ClientCredentials>, ReceiverError> {
		let _guard = self.lock.lock().await;
		self.load().await
	}

	/// True when the only row is the seeded default client.
	pub async fn only_default_remains(&self) -> Result<bool, ReceiverError> {
		let rows = self.list().await?;
		Ok(rows.len() == 1 && rows[0].client_id == DEFAULT_CLIENT_ID)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(byte: u8) -> [u8; 32] {
		[byte; 32]
	}

	#[tokio::test]
	async fn auth_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let store = AuthStore::open(dir.path().join("creds.enc"), key(1));
		store.init().await.unwrap();
		store.add("client-a", "hunter2", "Client A").await.unwrap();

		assert!(store.validate("client-a", "hunter2").await.unwrap());
		assert!(store.validate(DEFAULT_CLIENT_ID, DEFAULT_CLIENT_SECRET).await.unwrap());

		assert!(!store.validate("client-a", "wrong").await.unwrap());
		assert!(!store.validate("nobody", "hunter2").await.unwrap());
		assert!(!store.validate("", "").await.unwrap());
		assert!(!store.validate("client-a", "").await.unwrap());
	}

	#[tokio::test]
	async fn init_is_idempotent_byte_for_byte() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("creds.enc");
		let store = AuthStore::open(&path, key(1));

		assert!(store.init().await.unwrap());
		let first = tokio::fs::read(&path).await.unwrap();
		let first_row = store.list().await.unwrap().remove(0);

		assert!(!store.init().await.unwrap());
		let second = tokio::fs::read(&path).await.unwrap();
		assert_eq!(first, second);
		assert_eq!(store.list().await.unwrap()[0].created_at, first_row.created_at);
	}

	#[tokio::test]
	async fn wrong_key_is_unreadable_not_empty() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("creds.enc");
		AuthStore::open(&path, key(1)).init().await.unwrap();

		let wrong = AuthStore::open(&path, key(2));
		assert!(matches!(
			wrong.list().await,
			Err(ReceiverError::CredentialStoreUnreadable)
		));
	}

	#[tokio::test]
	async fn inactive_and_removed_clients_do_not_validate() {
		let dir = tempfile::tempdir().unwrap();
		let store = AuthStore::open(dir.path().join("creds.enc"), key(1));
		store.add("gone", "secret", "Gone").await.unwrap();
		assert!(store.validate("gone", "secret").await.unwrap());

		assert!(store.remove("gone").await.unwrap());
		assert!(!store.remove("gone").await.unwrap());
		assert!(!store.validate("gone", "secret").await.unwrap());
	}

	#[tokio::test]
	async fn add_enforces_wire_limits() {
		let dir = tempfile::tempdir().unwrap();
		let store = AuthStore::open(dir.path().join("creds.enc"), key(1));
		assert!(store.add("with:colon", "s", "n").await.is_err());
		assert!(store.add("", "s", "n").await.is_err());
		assert!(store.add("ok", &"s".repeat(201), "n").await.is_err());
	}
}
