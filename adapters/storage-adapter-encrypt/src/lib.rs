//! Encrypting Storage Adapter Wrapper
//!
//! Wraps any inner StorageAdapter with transparent at-rest encryption. Every
//! blob value and every BLOB column (WAL deltas, snapshots, state vectors) is
//! encrypted with AES-GCM-256 under a per-namespace key derived from a user
//! master key (UMK); the 12-byte random nonce is prepended to the ciphertext.
//!
//! # States
//!
//! ```text
//! disabled ──enable──▶ setup ──provision credential──▶ unlocked
//! unlocked ──idle timeout | lock()──▶ locked
//! locked   ──unlock──▶ unlocked
//! any      ──disable──▶ disabled (only when no encrypted blobs remain)
//! ```
//!
//! While locked, blob reads answer `None` and SQL reads answer empty, so the
//! host can distinguish "no data" from "cannot decrypt yet" through the state
//! watch channel; writes fail with a crypto error. While in `setup` no key
//! exists yet: reads pass through, writes are rejected until a credential is
//! provisioned.
//!
//! # Credentials
//!
//! The UMK is 32 random bytes kept wrapped in the inner blob KV under the
//! reserved `crypt:` prefix, once per unlock path: a passphrase
//! (PBKDF2-SHA256, 100k iterations, 16-byte salt), a platform authenticator
//! secret, and a 20-byte recovery key. Provisioning hands the formatted
//! recovery key to the caller exactly once.
//!
//! # SQL face
//!
//! BLOB parameters are encrypted before they reach the inner adapter and BLOB
//! result columns are decrypted on the way out. The key-derivation namespace
//! is the row's `<collection>:<document>` key: on writes it comes from the
//! statement's first text parameter (every engine-issued WAL/snapshot insert
//! binds the full key); on reads each result row prefers its own first text
//! column (statements that scan several documents select `collection`
//! alongside `data`), falling back to the statement parameter for
//! single-document queries that select blobs only.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use rand::RngExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

use replicate::error::ClResult;
use replicate::prelude::Error;
use replicate::storage_adapter::{SqlRow, SqlValue, StorageAdapter};

mod keyring;
pub use keyring::{format_recovery_key, parse_recovery_key};
use keyring::{RECOVERY_KEY_LEN, SALT_LEN, UMK_LEN, data_key, kek_from_passphrase, kek_from_secret};

const NONCE_LEN: usize = 12;

const KEY_SALT: &str = "crypt:salt";
const KEY_UMK_PASSPHRASE: &str = "crypt:umk:passphrase";
const KEY_UMK_PLATFORM: &str = "crypt:umk:platform";
const KEY_UMK_RECOVERY: &str = "crypt:umk:recovery";
const CRYPT_PREFIX: &str = "crypt:";

/// Public state of the wrapper, observable through a watch channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncryptionState {
	Disabled,
	Setup,
	Locked,
	Unlocked,
}

/// Wrapper configuration
#[derive(Debug, Clone)]
pub struct EncryptConfig {
	/// Idle time in milliseconds after which the in-memory key is zeroed and
	/// the wrapper locks itself.
	pub idle_lock_ms: u64,
}

impl Default for EncryptConfig {
	fn default() -> Self {
		Self { idle_lock_ms: 5 * 60 * 1000 }
	}
}

struct Shared<A> {
	inner: A,
	config: EncryptConfig,
	state_tx: watch::Sender<EncryptionState>,
	umk: parking_lot::Mutex<Option<Vec<u8>>>,
	last_used: parking_lot::Mutex<Instant>,
}

impl<A> Shared<A> {
	fn state(&self) -> EncryptionState {
		*self.state_tx.borrow()
	}

	fn touch(&self) {
		*self.last_used.lock() = Instant::now();
	}

	/// Zero the in-memory key material and move to `Locked`.
	fn lock_now(&self) {
		let mut umk = self.umk.lock();
		if let Some(key) = umk.as_mut() {
			key.iter_mut().for_each(|b| *b = 0);
		}
		*umk = None;
		if self.state() == EncryptionState::Unlocked {
			let _ = self.state_tx.send(EncryptionState::Locked);
		}
	}

	fn encrypt(&self, namespace: &str, plaintext: &[u8]) -> ClResult<Vec<u8>> {
		let umk = self.umk.lock();
		let umk = umk.as_ref().ok_or_else(|| Error::Crypto("storage is locked".into()))?;
		let key = data_key(umk, namespace)?;
		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
		let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
		let ciphertext = cipher
			.encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
			.map_err(|_| Error::Crypto("encryption failed".into()))?;
		let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
		out.extend_from_slice(&nonce_bytes);
		out.extend_from_slice(&ciphertext);
		Ok(out)
	}

	fn decrypt(&self, namespace: &str, bytes: &[u8]) -> ClResult<Vec<u8>> {
		if bytes.len() < NONCE_LEN {
			return Err(Error::Crypto("ciphertext too short".into()));
		}
		let umk = self.umk.lock();
		let umk = umk.as_ref().ok_or_else(|| Error::Crypto("storage is locked".into()))?;
		let key = data_key(umk, namespace)?;
		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
		cipher
			.decrypt(Nonce::from_slice(&bytes[..NONCE_LEN]), &bytes[NONCE_LEN..])
			.map_err(|_| Error::Crypto("decryption failed".into()))
	}
}

/// Transparent AEAD layer over an inner storage adapter.
pub struct EncryptedStorageAdapter<A: StorageAdapter> {
	shared: Arc<Shared<A>>,
	idle_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<A: StorageAdapter + 'static> EncryptedStorageAdapter<A> {
	/// Wrap an inner adapter. Starts `Locked` when a credential has been
	/// provisioned before, `Disabled` otherwise.
	pub async fn new(inner: A, config: EncryptConfig) -> ClResult<Self> {
		let provisioned = inner.get(KEY_SALT).await?.is_some();
		let initial =
			if provisioned { EncryptionState::Locked } else { EncryptionState::Disabled };
		let (state_tx, _) = watch::channel(initial);
		Ok(Self {
			shared: Arc::new(Shared {
				inner,
				config,
				state_tx,
				umk: parking_lot::Mutex::new(None),
				last_used: parking_lot::Mutex::new(Instant::now()),
			}),
			idle_task: parking_lot::Mutex::new(None),
		})
	}

	/// Current wrapper state.
	pub fn state(&self) -> EncryptionState {
		self.shared.state()
	}

	/// Watch channel for state transitions; the UI uses this to tell "no
	/// data" apart from "cannot decrypt yet".
	pub fn subscribe(&self) -> watch::Receiver<EncryptionState> {
		self.shared.state_tx.subscribe()
	}

	/// `Disabled → Setup`: encryption was requested, no credential yet.
	pub fn enable(&self) -> ClResult<()> {
		if self.shared.state() != EncryptionState::Disabled {
			return Err(Error::Crypto("encryption is already enabled".into()));
		}
		let _ = self.shared.state_tx.send(EncryptionState::Setup);
		Ok(())
	}

	/// Provision a passphrase credential. Generates the UMK, wraps it for the
	/// passphrase and recovery paths, and unlocks. Returns the formatted
	/// recovery key — the only time it is ever revealed.
	pub async fn provision_passphrase(&self, passphrase: &str) -> ClResult<String> {
		let salt: [u8; SALT_LEN] = rand::rng().random();
		let kek = kek_from_passphrase(passphrase, &salt);
		self.provision(salt, KEY_UMK_PASSPHRASE, &kek).await
	}

	/// Provision from a platform authenticator secret (a high-entropy value
	/// tied to a stored credential).
	pub async fn provision_platform(&self, secret: &[u8]) -> ClResult<String> {
		let salt: [u8; SALT_LEN] = rand::rng().random();
		let kek = kek_from_secret(secret, &salt)?;
		self.provision(salt, KEY_UMK_PLATFORM, &kek).await
	}

	async fn provision(
		&self,
		salt: [u8; SALT_LEN],
		wrap_key: &str,
		kek: &[u8; UMK_LEN],
	) -> ClResult<String> {
		if self.shared.state() != EncryptionState::Setup {
			return Err(Error::Crypto("provisioning requires setup state".into()));
		}

		let umk: [u8; UMK_LEN] = rand::rng().random();
		let recovery_raw: [u8; RECOVERY_KEY_LEN] = rand::rng().random();
		let recovery_kek = kek_from_secret(&recovery_raw, &salt)?;

		self.shared.inner.set(KEY_SALT, &salt).await?;
		let wrapped = wrap_umk(kek, &umk)?;
		self.shared.inner.set(wrap_key, &wrapped).await?;
		let wrapped_recovery = wrap_umk(&recovery_kek, &umk)?;
		self.shared.inner.set(KEY_UMK_RECOVERY, &wrapped_recovery).await?;

		*self.shared.umk.lock() = Some(umk.to_vec());
		self.shared.touch();
		let _ = self.shared.state_tx.send(EncryptionState::Unlocked);
		self.start_idle_task();
		debug!("encryption provisioned via {}", wrap_key);

		Ok(format_recovery_key(&recovery_raw))
	}

	/// Unlock with the passphrase credential.
	pub async fn unlock_passphrase(&self, passphrase: &str) -> ClResult<()> {
		let salt = self.load_salt().await?;
		let kek = kek_from_passphrase(passphrase, &salt);
		self.unlock(KEY_UMK_PASSPHRASE, &kek).await
	}

	/// Unlock with a platform authenticator secret.
	pub async fn unlock_platform(&self, secret: &[u8]) -> ClResult<()> {
		let salt = self.load_salt().await?;
		let kek = kek_from_secret(secret, &salt)?;
		self.unlock(KEY_UMK_PLATFORM, &kek).await
	}

	/// Unlock with a transcribed recovery key.
	pub async fn unlock_recovery(&self, formatted: &str) -> ClResult<()> {
		let raw = parse_recovery_key(formatted)?;
		let salt = self.load_salt().await?;
		let kek = kek_from_secret(&raw, &salt)?;
		self.unlock(KEY_UMK_RECOVERY, &kek).await
	}

	async fn load_salt(&self) -> ClResult<Vec<u8>> {
		self.shared
			.inner
			.get(KEY_SALT)
			.await?
			.ok_or_else(|| Error::Crypto("no credential provisioned".into()))
	}

	async fn unlock(&self, wrap_key: &str, kek: &[u8; UMK_LEN]) -> ClResult<()> {
		match self.shared.state() {
			EncryptionState::Locked => {}
			EncryptionState::Unlocked => return Ok(()),
			_ => return Err(Error::Crypto("nothing to unlock".into())),
		}
		let wrapped = self
			.shared
			.inner
			.get(wrap_key)
			.await?
			.ok_or_else(|| Error::Crypto("credential not provisioned for this path".into()))?;
		let umk = unwrap_umk(kek, &wrapped)?;
		*self.shared.umk.lock() = Some(umk);
		self.shared.touch();
		let _ = self.shared.state_tx.send(EncryptionState::Unlocked);
		self.start_idle_task();
		Ok(())
	}

	/// Zero the in-memory key and lock.
	pub fn lock(&self) {
		self.shared.lock_now();
	}

	/// Tear encryption down. Allowed only when no encrypted content remains
	/// in the inner adapter.
	pub async fn disable(&self) -> ClResult<()> {
		let blob_keys = self.shared.inner.list_keys("").await?;
		let has_user_blobs = blob_keys.iter().any(|k| !k.starts_with(CRYPT_PREFIX));
		let row = self
			.shared
			.inner
			.get_row(
				"SELECT (SELECT count(*) FROM deltas) + (SELECT count(*) FROM snapshots)",
				&[],
			)
			.await?;
		let encrypted_rows =
			row.and_then(|r| r.first().and_then(SqlValue::as_integer)).unwrap_or(0);
		if has_user_blobs || encrypted_rows > 0 {
			return Err(Error::Crypto("encrypted blobs remain; wipe the collection first".into()));
		}

		for key in [KEY_SALT, KEY_UMK_PASSPHRASE, KEY_UMK_PLATFORM, KEY_UMK_RECOVERY] {
			self.shared.inner.delete(key).await?;
		}
		self.shared.lock_now();
		let _ = self.shared.state_tx.send(EncryptionState::Disabled);
		Ok(())
	}

	/// Spawn the idle-lock watchdog if not already running.
	fn start_idle_task(&self) {
		let mut slot = self.idle_task.lock();
		if slot.as_ref().is_some_and(|task| !task.is_finished()) {
			return;
		}
		let shared = Arc::downgrade(&self.shared);
		let idle = Duration::from_millis(self.shared.config.idle_lock_ms.max(100));
		let tick = idle.min(Duration::from_secs(30)) / 4;
		*slot = Some(tokio::spawn(async move {
			loop {
				tokio::time::sleep(tick.max(Duration::from_millis(25))).await;
				let Some(shared) = shared.upgrade() else { return };
				if shared.state() != EncryptionState::Unlocked {
					continue;
				}
				let elapsed = shared.last_used.lock().elapsed();
				if elapsed >= idle {
					warn!("idle timeout reached, locking storage");
					shared.lock_now();
				}
			}
		}));
	}

	/// Write-side namespace for SQL-face key derivation: the statement's
	/// first text parameter (the `<collection>:<document>` key on every
	/// WAL/snapshot insert the engine issues).
	fn sql_namespace(params: &[SqlValue]) -> &str {
		params.iter().find_map(SqlValue::as_text).unwrap_or("sql")
	}

	/// Read-side namespace: the row's own first text column when the
	/// statement selected one (multi-document scans return rows encrypted
	/// under different per-document keys), else the statement fallback.
	fn row_namespace<'a>(row: &'a [SqlValue], fallback: &'a str) -> &'a str {
		row.iter().find_map(SqlValue::as_text).unwrap_or(fallback)
	}
}

fn wrap_umk(kek: &[u8; UMK_LEN], umk: &[u8; UMK_LEN]) -> ClResult<Vec<u8>> {
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek));
	let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
	let ciphertext = cipher
		.encrypt(Nonce::from_slice(&nonce_bytes), umk.as_slice())
		.map_err(|_| Error::Crypto("key wrap failed".into()))?;
	let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
	out.extend_from_slice(&nonce_bytes);
	out.extend_from_slice(&ciphertext);
	Ok(out)
}

fn unwrap_umk(kek: &[u8; UMK_LEN], wrapped: &[u8]) -> ClResult<Vec<u8>> {
	if wrapped.len() < NONCE_LEN {
		return Err(Error::Crypto("wrapped key too short".into()));
	}
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek));
	cipher
		.decrypt(Nonce::from_slice(&wrapped[..NONCE_LEN]), &wrapped[NONCE_LEN..])
		.map_err(|_| Error::Crypto("invalid credential".into()))
}

#[async_trait]
impl<A: StorageAdapter + 'static> StorageAdapter for EncryptedStorageAdapter<A> {
	async fn get(&self, key: &str) -> ClResult<Option<Vec<u8>>> {
		match self.shared.state() {
			EncryptionState::Disabled | EncryptionState::Setup => self.shared.inner.get(key).await,
			// Locked reads answer "no data"; the state channel tells the
			// host the truth.
			EncryptionState::Locked => Ok(None),
			EncryptionState::Unlocked => {
				self.shared.touch();
				match self.shared.inner.get(key).await? {
					Some(bytes) => Ok(Some(self.shared.decrypt(key, &bytes)?)),
					None => Ok(None),
				}
			}
		}
	}

	async fn set(&self, key: &str, value: &[u8]) -> ClResult<()> {
		match self.shared.state() {
			EncryptionState::Disabled => self.shared.inner.set(key, value).await,
			EncryptionState::Setup => {
				Err(Error::Crypto("credential not provisioned yet".into()))
			}
			EncryptionState::Locked => Err(Error::Crypto("storage is locked".into())),
			EncryptionState::Unlocked => {
				self.shared.touch();
				let encrypted = self.shared.encrypt(key, value)?;
				self.shared.inner.set(key, &encrypted).await
			}
		}
	}

	async fn delete(&self, key: &str) -> ClResult<()> {
		self.shared.inner.delete(key).await
	}

	async fn list_keys(&self, prefix: &str) -> ClResult<Vec<Box<str>>> {
		let keys = self.shared.inner.list_keys(prefix).await?;
		Ok(keys.into_iter().filter(|k| !k.starts_with(CRYPT_PREFIX)).collect())
	}

	async fn exec(&self, sql: &str) -> ClResult<()> {
		self.shared.inner.exec(sql).await
	}

	async fn run(&self, sql: &str, params: &[SqlValue]) -> ClResult<u64> {
		match self.shared.state() {
			EncryptionState::Disabled => self.shared.inner.run(sql, params).await,
			EncryptionState::Setup | EncryptionState::Locked
				if params.iter().any(|p| matches!(p, SqlValue::Blob(_))) =>
			{
				Err(Error::Crypto("storage is locked".into()))
			}
			EncryptionState::Setup | EncryptionState::Locked => {
				self.shared.inner.run(sql, params).await
			}
			EncryptionState::Unlocked => {
				self.shared.touch();
				let namespace = Self::sql_namespace(params);
				let mut encrypted = Vec::with_capacity(params.len());
				for param in params {
					encrypted.push(match param {
						SqlValue::Blob(bytes) => {
							SqlValue::Blob(self.shared.encrypt(namespace, bytes)?)
						}
						other => other.clone(),
					});
				}
				self.shared.inner.run(sql, &encrypted).await
			}
		}
	}

	async fn get_row(&self, sql: &str, params: &[SqlValue]) -> ClResult<Option<SqlRow>> {
		match self.shared.state() {
			EncryptionState::Disabled | EncryptionState::Setup => {
				self.shared.inner.get_row(sql, params).await
			}
			EncryptionState::Locked => Ok(None),
			EncryptionState::Unlocked => {
				self.shared.touch();
				let namespace = Self::sql_namespace(params);
				match self.shared.inner.get_row(sql, params).await? {
					Some(row) => Ok(Some(self.decrypt_row(namespace, row)?)),
					None => Ok(None),
				}
			}
		}
	}

	async fn all(&self, sql: &str, params: &[SqlValue]) -> ClResult<Vec<SqlRow>> {
		match self.shared.state() {
			EncryptionState::Disabled | EncryptionState::Setup => {
				self.shared.inner.all(sql, params).await
			}
			EncryptionState::Locked => Ok(Vec::new()),
			EncryptionState::Unlocked => {
				self.shared.touch();
				let namespace = Self::sql_namespace(params);
				let rows = self.shared.inner.all(sql, params).await?;
				let mut out = Vec::with_capacity(rows.len());
				for row in rows {
					out.push(self.decrypt_row(namespace, row)?);
				}
				Ok(out)
			}
		}
	}

	async fn close(&self) -> ClResult<()> {
		self.shared.lock_now();
		if let Some(task) = self.idle_task.lock().take() {
			task.abort();
		}
		self.shared.inner.close().await
	}

	fn is_closed(&self) -> bool {
		self.shared.inner.is_closed()
	}
}

impl<A: StorageAdapter + 'static> EncryptedStorageAdapter<A> {
	fn decrypt_row(&self, fallback_namespace: &str, row: SqlRow) -> ClResult<SqlRow> {
		let namespace = Self::row_namespace(&row, fallback_namespace).to_string();
		row.into_iter()
			.map(|value| match value {
				SqlValue::Blob(bytes) => {
					Ok(SqlValue::Blob(self.shared.decrypt(&namespace, &bytes)?))
				}
				other => Ok(other),
			})
			.collect()
	}
}

impl<A: StorageAdapter> std::fmt::Debug for EncryptedStorageAdapter<A> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EncryptedStorageAdapter")
			.field("state", &self.shared.state())
			.finish()
	}
}

impl<A: StorageAdapter> Drop for EncryptedStorageAdapter<A> {
	fn drop(&mut self) {
		if let Some(task) = self.idle_task.lock().take() {
			task.abort();
		}
	}
}

// vim: ts=4
