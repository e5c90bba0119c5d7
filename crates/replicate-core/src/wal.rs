//! Write-ahead log with snapshot compaction.
//!
//! Every document update (origin other than WAL replay) lands as one
//! `deltas` row keyed by `<collection>:<document>`. When a document's row
//! count crosses the threshold the caller compacts: the live document is
//! re-encoded as a single snapshot, written with `INSERT OR REPLACE`, and the
//! delta rows are deleted. A crash between the two statements only means the
//! next load re-applies deltas on top of the fresh snapshot, which is
//! idempotent.
//!
//! Load order on open: snapshot (if present), then deltas ascending by row
//! id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use replicate_types::storage_adapter::{SqlValue, StorageAdapter};

use crate::prelude::*;

/// WAL pressure tuning.
#[derive(Clone, Debug)]
pub struct CompactionConfig {
	/// Delta rows per document before compaction runs.
	pub threshold: u32,
	/// Minimum interval between compactions of the same collection; crossing
	/// the threshold inside the window defers to the next append.
	pub timeout_ms: u64,
	/// Newest delta rows kept through compaction (0 = replace the whole
	/// tail). Retained rows re-apply idempotently over the snapshot on load.
	pub retain: u32,
}

impl Default for CompactionConfig {
	fn default() -> Self {
		Self { threshold: 50, timeout_ms: 0, retain: 0 }
	}
}

/// Persisted state of one document as found on open.
#[derive(Debug)]
pub struct LoadedDoc {
	pub document: Box<str>,
	pub snapshot: Option<Vec<u8>>,
	pub deltas: Vec<Vec<u8>>,
}

pub struct Wal {
	collection: Box<str>,
	storage: Arc<dyn StorageAdapter>,
	config: CompactionConfig,
	/// Serializes compaction critical sections per collection.
	compact_lock: tokio::sync::Mutex<()>,
	last_compact: parking_lot::Mutex<Option<Instant>>,
}

impl Wal {
	pub fn new(
		collection: impl Into<Box<str>>,
		storage: Arc<dyn StorageAdapter>,
		config: CompactionConfig,
	) -> Self {
		let config = CompactionConfig { threshold: config.threshold.max(1), ..config };
		Self {
			collection: collection.into(),
			storage,
			config,
			compact_lock: tokio::sync::Mutex::new(()),
			last_compact: parking_lot::Mutex::new(None),
		}
	}

	fn key(&self, document: &str) -> String {
		format!("{}:{}", self.collection, document)
	}

	fn prefix(&self) -> String {
		format!("{}:", self.collection)
	}

	/// Append one delta row. Returns true when the document's pending rows
	/// now exceed the compaction threshold and the rate window allows a
	/// compaction.
	pub async fn append(&self, document: &str, bytes: &[u8]) -> ClResult<bool> {
		let key = self.key(document);
		self.storage
			.run(
				"INSERT INTO deltas(collection, data) VALUES (?, ?)",
				&[SqlValue::from(key.as_str()), SqlValue::from(bytes)],
			)
			.await?;
		let count = self.delta_count(document).await?;
		if count < i64::from(self.config.threshold) {
			return Ok(false);
		}
		if self.config.timeout_ms > 0 {
			let last = *self.last_compact.lock();
			if let Some(last) = last {
				if last.elapsed() < Duration::from_millis(self.config.timeout_ms) {
					return Ok(false);
				}
			}
		}
		Ok(true)
	}

	pub async fn delta_count(&self, document: &str) -> ClResult<i64> {
		let key = self.key(document);
		let row = self
			.storage
			.get_row(
				"SELECT count(*) FROM deltas WHERE collection = ?",
				&[SqlValue::from(key.as_str())],
			)
			.await?;
		Ok(row.and_then(|r| r.first().and_then(SqlValue::as_integer)).unwrap_or(0))
	}

	/// Pending delta rows across the whole collection; feeds the migrator's
	/// recovery context.
	pub async fn pending_rows(&self) -> ClResult<i64> {
		let row = self
			.storage
			.get_row(
				"SELECT count(*) FROM deltas WHERE substr(collection, 1, length(?1)) = ?1",
				&[SqlValue::from(self.prefix().as_str())],
			)
			.await?;
		Ok(row.and_then(|r| r.first().and_then(SqlValue::as_integer)).unwrap_or(0))
	}

	/// Compaction: replace the document's delta tail with one snapshot,
	/// optionally keeping the newest `retain` rows.
	pub async fn replace_with_snapshot(
		&self,
		document: &str,
		snapshot: &[u8],
		state_vector: &[u8],
		seq: Cursor,
	) -> ClResult<()> {
		let _guard = self.compact_lock.lock().await;
		let key = self.key(document);
		self.storage
			.run(
				"INSERT OR REPLACE INTO snapshots(collection, data, state_vector, seq)
				VALUES (?, ?, ?, ?)",
				&[
					SqlValue::from(key.as_str()),
					SqlValue::from(snapshot),
					SqlValue::from(state_vector),
					SqlValue::Integer(seq.0),
				],
			)
			.await?;
		if self.config.retain == 0 {
			self.storage
				.run("DELETE FROM deltas WHERE collection = ?", &[SqlValue::from(key.as_str())])
				.await?;
		} else {
			self.storage
				.run(
					"DELETE FROM deltas WHERE collection = ?1 AND id NOT IN (
						SELECT id FROM deltas WHERE collection = ?1
						ORDER BY id DESC LIMIT ?2
					)",
					&[SqlValue::from(key.as_str()), SqlValue::Integer(i64::from(self.config.retain))],
				)
				.await?;
		}
		*self.last_compact.lock() = Some(Instant::now());
		debug!("compacted {} ({} snapshot bytes)", key, snapshot.len());
		Ok(())
	}

	/// Physical removal of a soft-deleted document's rows.
	pub async fn purge(&self, document: &str) -> ClResult<()> {
		let _guard = self.compact_lock.lock().await;
		let key = self.key(document);
		self.storage
			.run("DELETE FROM deltas WHERE collection = ?", &[SqlValue::from(key.as_str())])
			.await?;
		self.storage
			.run("DELETE FROM snapshots WHERE collection = ?", &[SqlValue::from(key.as_str())])
			.await?;
		debug!("purged {}", key);
		Ok(())
	}

	/// Remove every row of the collection; used by migration reset.
	pub async fn clear(&self) -> ClResult<()> {
		let _guard = self.compact_lock.lock().await;
		let prefix = self.prefix();
		self.storage
			.run(
				"DELETE FROM deltas WHERE substr(collection, 1, length(?1)) = ?1",
				&[SqlValue::from(prefix.as_str())],
			)
			.await?;
		self.storage
			.run(
				"DELETE FROM snapshots WHERE substr(collection, 1, length(?1)) = ?1",
				&[SqlValue::from(prefix.as_str())],
			)
			.await?;
		Ok(())
	}

	/// List the document keys persisted for this collection. Key-only scans:
	/// no blob column is touched, so an encrypting wrapper has nothing to
	/// decrypt here.
	async fn stored_documents(&self) -> ClResult<Vec<Box<str>>> {
		let prefix = self.prefix();
		let mut documents: Vec<Box<str>> = Vec::new();
		for sql in [
			"SELECT collection FROM snapshots WHERE substr(collection, 1, length(?1)) = ?1",
			"SELECT DISTINCT collection FROM deltas WHERE substr(collection, 1, length(?1)) = ?1",
		] {
			let rows = self.storage.all(sql, &[SqlValue::from(prefix.as_str())]).await?;
			for row in rows {
				let Some(key) = row.first().and_then(SqlValue::as_text) else { continue };
				let Some(document) = key.strip_prefix(&prefix) else { continue };
				if !documents.iter().any(|d| &**d == document) {
					documents.push(document.into());
				}
			}
		}
		documents.sort();
		Ok(documents)
	}

	/// Read back everything persisted for this collection, snapshot first,
	/// deltas in insertion order. Blob reads go document by document with the
	/// full `<collection>:<document>` key bound, so an encrypting wrapper can
	/// derive the same per-document data key it encrypted under.
	pub async fn load(&self) -> ClResult<Vec<LoadedDoc>> {
		let mut docs: Vec<LoadedDoc> = Vec::new();
		for document in self.stored_documents().await? {
			let key = self.key(&document);

			let snapshot = self
				.storage
				.get_row(
					"SELECT data FROM snapshots WHERE collection = ?",
					&[SqlValue::from(key.as_str())],
				)
				.await?
				.and_then(|row| {
					row.first().and_then(SqlValue::as_blob).map(<[u8]>::to_vec)
				});

			let delta_rows = self
				.storage
				.all(
					"SELECT data FROM deltas WHERE collection = ? ORDER BY id",
					&[SqlValue::from(key.as_str())],
				)
				.await?;
			let deltas = delta_rows
				.into_iter()
				.filter_map(|row| {
					row.first().and_then(SqlValue::as_blob).map(<[u8]>::to_vec)
				})
				.collect();

			docs.push(LoadedDoc { document, snapshot, deltas });
		}
		Ok(docs)
	}
}

impl std::fmt::Debug for Wal {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Wal")
			.field("collection", &self.collection)
			.field("config", &self.config)
			.finish()
	}
}


// vim: ts=4
