//! SQLite-backed Storage Adapter
//!
//! Implements the StorageAdapter trait over sqlx/SQLite for persistent storage
//! of WAL delta rows, document snapshots, and engine metadata.
//!
//! # Storage Layout
//!
//! Core tables, created on first open:
//! - `snapshots` - One full encoded document state per `<collection>:<document>` key
//! - `deltas` - Pending CRDT deltas in insertion order, indexed by key
//! - `kv` - Stringified JSON metadata (cursors, checkpoints, sync timestamps)
//! - `blobs` - The opaque byte-value face (identity anchors, wrapped keys)
//!
//! The migrator creates `__replicate_schema` lazily; this adapter never
//! touches it.
//!
//! # Legacy Layout
//!
//! Older deployments named the delta table `updates`. When an `updates` table
//! exists and `deltas` does not, the table is renamed in place on first open.
//!
//! # Write Serialization
//!
//! The pool holds exactly one connection and a write mutex guards every
//! mutating statement, so one write request is outstanding at a time per
//! physical database. On an unrecoverable fault the adapter marks itself
//! closed and every subsequent request fails with a storage error.

use async_trait::async_trait;
use replicate::error::ClResult;
use replicate::storage_adapter::{SqlRow, SqlValue, StorageAdapter};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

mod error;
pub use error::Error;

/// Storage adapter configuration
#[derive(Debug, Clone)]
pub struct AdapterConfig {
	/// Create the database file if it does not exist
	pub create_if_missing: bool,

	/// SQLite busy timeout in milliseconds
	pub busy_timeout_ms: u64,
}

impl Default for AdapterConfig {
	fn default() -> Self {
		Self { create_if_missing: true, busy_timeout_ms: 5000 }
	}
}

/// Storage Adapter using SQLite
pub struct SqliteStorageAdapter {
	pool: SqlitePool,

	/// Serializes mutating statements; avoids interleaved compilation and
	/// execution on the shared engine.
	write_lock: tokio::sync::Mutex<()>,

	/// Set after close() or an unrecoverable fault
	closed: AtomicBool,
}

impl SqliteStorageAdapter {
	/// Open (or create) a database file and initialize the core tables.
	pub async fn new(path: impl AsRef<Path>, config: AdapterConfig) -> ClResult<Self> {
		let opts = SqliteConnectOptions::new()
			.filename(path.as_ref())
			.create_if_missing(config.create_if_missing)
			.busy_timeout(Duration::from_millis(config.busy_timeout_ms));

		debug!("Opening sqlite storage at {:?}", path.as_ref());
		Self::open(opts).await
	}

	/// Open a private in-memory database. Used by tests and ephemeral hosts.
	pub async fn new_in_memory() -> ClResult<Self> {
		let opts = SqliteConnectOptions::from_str("sqlite::memory:")
			.map_err(|e| replicate::error::Error::from(Error::from(e)))?;
		Self::open(opts).await
	}

	async fn open(opts: SqliteConnectOptions) -> ClResult<Self> {
		let pool = SqlitePoolOptions::new()
			.min_connections(1)
			.max_connections(1)
			.idle_timeout(None)
			.max_lifetime(None)
			.connect_with(opts)
			.await
			.map_err(|e| replicate::error::Error::from(Error::from(e)))?;

		init_db(&pool).await.map_err(replicate::error::Error::from)?;

		Ok(Self { pool, write_lock: tokio::sync::Mutex::new(()), closed: AtomicBool::new(false) })
	}

	fn check_open(&self) -> Result<(), Error> {
		if self.closed.load(Ordering::Acquire) { Err(Error::Closed) } else { Ok(()) }
	}

	/// Translate an sqlx error, marking the adapter closed when the fault is
	/// unrecoverable (connection gone, underlying I/O failure).
	fn fault(&self, err: sqlx::Error) -> Error {
		if matches!(err, sqlx::Error::PoolClosed | sqlx::Error::Io(_)) {
			warn!("sqlite adapter fault, marking closed: {}", err);
			self.closed.store(true, Ordering::Release);
		}
		Error::from(err)
	}
}

/// Initialize the core tables, handling the legacy `updates` table name.
async fn init_db(db: &SqlitePool) -> Result<(), Error> {
	// Legacy rename: an `updates` table without a `deltas` table is the old
	// layout for the same rows.
	let legacy: Option<(String,)> = sqlx::query_as(
		"SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'updates'",
	)
	.fetch_optional(db)
	.await?;
	let current: Option<(String,)> = sqlx::query_as(
		"SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'deltas'",
	)
	.fetch_optional(db)
	.await?;
	if legacy.is_some() && current.is_none() {
		debug!("Renaming legacy 'updates' table to 'deltas'");
		sqlx::query("ALTER TABLE updates RENAME TO deltas").execute(db).await?;
	}

	let mut tx = db.begin().await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS snapshots (
			collection text NOT NULL,
			data blob,
			state_vector blob,
			seq integer,
			PRIMARY KEY(collection)
	)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS deltas (
			id integer PRIMARY KEY AUTOINCREMENT,
			collection text NOT NULL,
			data blob
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query("CREATE INDEX IF NOT EXISTS idx_deltas_collection ON deltas(collection)")
		.execute(&mut *tx)
		.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS kv (
			key text NOT NULL,
			value text,
			PRIMARY KEY(key)
	)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS blobs (
			key text NOT NULL,
			value blob,
			PRIMARY KEY(key)
	)",
	)
	.execute(&mut *tx)
	.await?;

	tx.commit().await?;
	Ok(())
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_params<'q>(mut query: SqliteQuery<'q>, params: &'q [SqlValue]) -> SqliteQuery<'q> {
	for param in params {
		query = match param {
			SqlValue::Null => query.bind(Option::<i64>::None),
			SqlValue::Integer(v) => query.bind(*v),
			SqlValue::Real(v) => query.bind(*v),
			SqlValue::Text(v) => query.bind(v.as_str()),
			SqlValue::Blob(v) => query.bind(v.as_slice()),
		};
	}
	query
}

fn decode_row(row: &SqliteRow) -> Result<SqlRow, Error> {
	let mut out = Vec::with_capacity(row.len());
	for i in 0..row.len() {
		let raw = row.try_get_raw(i)?;
		let value = if raw.is_null() {
			SqlValue::Null
		} else {
			match raw.type_info().name() {
				"INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get::<i64, _>(i)?),
				"REAL" => SqlValue::Real(row.try_get::<f64, _>(i)?),
				"BLOB" => SqlValue::Blob(row.try_get::<Vec<u8>, _>(i)?),
				_ => SqlValue::Text(row.try_get::<String, _>(i)?),
			}
		};
		out.push(value);
	}
	Ok(out)
}

#[async_trait]
impl StorageAdapter for SqliteStorageAdapter {
	async fn get(&self, key: &str) -> ClResult<Option<Vec<u8>>> {
		self.check_open()?;
		let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM blobs WHERE key = ?")
			.bind(key)
			.fetch_optional(&self.pool)
			.await
			.map_err(|e| self.fault(e))?;
		Ok(row.map(|(value,)| value))
	}

	async fn set(&self, key: &str, value: &[u8]) -> ClResult<()> {
		self.check_open()?;
		let _guard = self.write_lock.lock().await;
		sqlx::query(
			"INSERT INTO blobs(key, value) VALUES (?, ?)
			ON CONFLICT(key) DO UPDATE SET value = excluded.value",
		)
		.bind(key)
		.bind(value)
		.execute(&self.pool)
		.await
		.map_err(|e| self.fault(e))?;
		trace!("blob set {} ({} bytes)", key, value.len());
		Ok(())
	}

	async fn delete(&self, key: &str) -> ClResult<()> {
		self.check_open()?;
		let _guard = self.write_lock.lock().await;
		sqlx::query("DELETE FROM blobs WHERE key = ?")
			.bind(key)
			.execute(&self.pool)
			.await
			.map_err(|e| self.fault(e))?;
		Ok(())
	}

	async fn list_keys(&self, prefix: &str) -> ClResult<Vec<Box<str>>> {
		self.check_open()?;
		let rows: Vec<(String,)> = sqlx::query_as(
			"SELECT key FROM blobs WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
		)
		.bind(prefix)
		.fetch_all(&self.pool)
		.await
		.map_err(|e| self.fault(e))?;
		Ok(rows.into_iter().map(|(key,)| key.into_boxed_str()).collect())
	}

	async fn exec(&self, sql: &str) -> ClResult<()> {
		self.check_open()?;
		let _guard = self.write_lock.lock().await;
		sqlx::raw_sql(sql).execute(&self.pool).await.map_err(|e| self.fault(e))?;
		Ok(())
	}

	async fn run(&self, sql: &str, params: &[SqlValue]) -> ClResult<u64> {
		self.check_open()?;
		let _guard = self.write_lock.lock().await;
		let result = bind_params(sqlx::query(sql), params)
			.execute(&self.pool)
			.await
			.map_err(|e| self.fault(e))?;
		Ok(result.rows_affected())
	}

	async fn get_row(&self, sql: &str, params: &[SqlValue]) -> ClResult<Option<SqlRow>> {
		self.check_open()?;
		let row = bind_params(sqlx::query(sql), params)
			.fetch_optional(&self.pool)
			.await
			.map_err(|e| self.fault(e))?;
		match row {
			Some(row) => Ok(Some(decode_row(&row)?)),
			None => Ok(None),
		}
	}

	async fn all(&self, sql: &str, params: &[SqlValue]) -> ClResult<Vec<SqlRow>> {
		self.check_open()?;
		let rows = bind_params(sqlx::query(sql), params)
			.fetch_all(&self.pool)
			.await
			.map_err(|e| self.fault(e))?;
		let mut out = Vec::with_capacity(rows.len());
		for row in &rows {
			out.push(decode_row(row)?);
		}
		Ok(out)
	}

	async fn close(&self) -> ClResult<()> {
		self.closed.store(true, Ordering::Release);
		self.pool.close().await;
		Ok(())
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}
}

impl std::fmt::Debug for SqliteStorageAdapter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SqliteStorageAdapter")
			.field("closed", &self.closed.load(Ordering::Relaxed))
			.finish()
	}
}

// vim: ts=4
