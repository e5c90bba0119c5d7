//! Storage Adapter
//!
//! Trait and types for pluggable local persistence backends. The adapter
//! exposes two faces to the engine:
//!
//! - a **blob key-value store** (`get`/`set`/`delete`/`list_keys`) with opaque
//!   byte values, used for identity anchors and small metadata blobs;
//! - a **SQL face** (`exec`/`run`/`get_row`/`all`) over the core tables
//!   (`snapshots`, `deltas`, `kv`), used by the WAL, the replicator's cursor
//!   bookkeeping, and the migrator.
//!
//! Implementations must provide ACID single-statement semantics and enforce
//! one outstanding write request at a time per physical database. On any
//! unrecoverable fault, all pending requests fail with `Error::StorageIo` and
//! the adapter reports closed from then on.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::prelude::*;

/// A positional SQL parameter or result column value.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
	Null,
	Integer(i64),
	Real(f64),
	Text(String),
	Blob(Vec<u8>),
}

impl SqlValue {
	pub fn as_integer(&self) -> Option<i64> {
		match self {
			SqlValue::Integer(v) => Some(*v),
			_ => None,
		}
	}

	pub fn as_text(&self) -> Option<&str> {
		match self {
			SqlValue::Text(v) => Some(v),
			_ => None,
		}
	}

	pub fn as_blob(&self) -> Option<&[u8]> {
		match self {
			SqlValue::Blob(v) => Some(v),
			_ => None,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, SqlValue::Null)
	}
}

impl From<i64> for SqlValue {
	fn from(v: i64) -> Self {
		SqlValue::Integer(v)
	}
}

impl From<&str> for SqlValue {
	fn from(v: &str) -> Self {
		SqlValue::Text(v.to_string())
	}
}

impl From<String> for SqlValue {
	fn from(v: String) -> Self {
		SqlValue::Text(v)
	}
}

impl From<Vec<u8>> for SqlValue {
	fn from(v: Vec<u8>) -> Self {
		SqlValue::Blob(v)
	}
}

impl From<&[u8]> for SqlValue {
	fn from(v: &[u8]) -> Self {
		SqlValue::Blob(v.to_vec())
	}
}

/// One result row, columns in select order.
pub type SqlRow = Vec<SqlValue>;

/// Storage Adapter trait.
///
/// The SQL face is mandatory; implementations may wrap an embedded engine or
/// a remote-backed one. The core tables are created on first open:
///
/// - `snapshots(collection TEXT PRIMARY KEY, data BLOB, state_vector BLOB, seq INTEGER)`
/// - `deltas(id INTEGER PRIMARY KEY AUTOINCREMENT, collection TEXT, data BLOB)`
///   plus an index on `(collection)`
/// - `kv(key TEXT PRIMARY KEY, value TEXT)`
///
/// The `collection` column of `snapshots`/`deltas` carries the composite
/// `<collection>:<document>` key. A fourth table `__replicate_schema` is
/// created lazily by the migrator.
#[async_trait]
pub trait StorageAdapter: Debug + Send + Sync {
	// Blob KV face
	//**************

	/// Read a blob. Returns `None` when the key is absent — encrypting
	/// wrappers also answer `None` while locked, so callers can distinguish
	/// "no data" from "cannot decrypt yet" only via the wrapper's state
	/// observable.
	async fn get(&self, key: &str) -> ClResult<Option<Vec<u8>>>;

	/// Write a blob, replacing any previous value.
	async fn set(&self, key: &str, value: &[u8]) -> ClResult<()>;

	/// Delete a blob. Deleting an absent key is not an error.
	async fn delete(&self, key: &str) -> ClResult<()>;

	/// List blob keys with the given prefix, in lexicographic order.
	async fn list_keys(&self, prefix: &str) -> ClResult<Vec<Box<str>>>;

	// SQL face
	//**********

	/// Execute one or more DDL/utility statements with no parameters and no
	/// result. Used for table creation and migration scripts.
	async fn exec(&self, sql: &str) -> ClResult<()>;

	/// Run a single parameterized statement; returns affected row count.
	async fn run(&self, sql: &str, params: &[SqlValue]) -> ClResult<u64>;

	/// Run a query expected to yield at most one row.
	async fn get_row(&self, sql: &str, params: &[SqlValue]) -> ClResult<Option<SqlRow>>;

	/// Run a query returning all matching rows.
	async fn all(&self, sql: &str, params: &[SqlValue]) -> ClResult<Vec<SqlRow>>;

	// Lifecycle
	//***********

	/// Flush and close the adapter. Subsequent calls fail with
	/// `Error::StorageClosed`.
	async fn close(&self) -> ClResult<()> {
		Ok(())
	}

	/// Whether the adapter has been closed or marked failed.
	fn is_closed(&self) -> bool {
		false
	}
}

// vim: ts=4
