//! Shared test fixtures: an in-memory linearizing authority and a collection
//! builder wired to it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::Value;

use replicate_core::authority::*;
use replicate_core::storage_adapter::StorageAdapter;
use replicate_core::{
	ClResult, ClientId, Collection, CollectionConfig, CompactionConfig, Cursor, Error, Schema,
};
use replicate_storage_adapter_sqlite::SqliteStorageAdapter;

/// One committed change in the authority's global log.
#[derive(Clone, Debug)]
struct LogEntry {
	collection: String,
	document: String,
	bytes: Vec<u8>,
	seq: i64,
	change_type: ChangeType,
}

#[derive(Default)]
struct AuthorityState {
	seq: i64,
	log: Vec<LogEntry>,
	/// Full update history per (collection, document); recovery source.
	docs: HashMap<(String, String), Vec<Vec<u8>>>,
	replicate_calls: Vec<(WriteKind, String, String)>,
	recovery_calls: u32,
	compact_queue: Vec<(String, Vec<String>)>,
	materialize_queue: Vec<(String, Vec<String>)>,
}

/// In-memory authority: linearizes writes, assigns sequence numbers, and
/// serves the cursor stream.
pub struct MockAuthority {
	state: parking_lot::Mutex<AuthorityState>,
	version: u32,
	offline: AtomicBool,
	mark_calls: AtomicU32,
}

impl MockAuthority {
	pub fn new() -> Arc<Self> {
		Self::with_version(1)
	}

	pub fn with_version(version: u32) -> Arc<Self> {
		Arc::new(Self {
			state: parking_lot::Mutex::new(AuthorityState::default()),
			version,
			offline: AtomicBool::new(false),
			mark_calls: AtomicU32::new(0),
		})
	}

	pub fn set_offline(&self, offline: bool) {
		self.offline.store(offline, Ordering::SeqCst);
	}

	pub fn replicate_calls(&self) -> Vec<(WriteKind, String, String)> {
		self.state.lock().replicate_calls.clone()
	}

	pub fn recovery_calls(&self) -> u32 {
		self.state.lock().recovery_calls
	}

	pub fn current_seq(&self) -> i64 {
		self.state.lock().seq
	}

	/// Register document history visible to `recovery` but withheld from the
	/// stream, simulating server-side history truncation.
	pub fn inject_hidden(&self, collection: &str, document: &str, bytes: Vec<u8>) {
		let mut state = self.state.lock();
		state
			.docs
			.entry((collection.to_string(), document.to_string()))
			.or_default()
			.push(bytes);
	}

	/// Queue a `compact` notice for the next stream batch.
	pub fn emit_compact(&self, collection: &str, documents: &[&str]) {
		self.state.lock().compact_queue.push((
			collection.to_string(),
			documents.iter().map(|s| s.to_string()).collect(),
		));
	}

	/// Queue a materialization pass (complete live id list) for the next
	/// stream batch.
	pub fn emit_materialize(&self, collection: &str, documents: &[&str]) {
		self.state.lock().materialize_queue.push((
			collection.to_string(),
			documents.iter().map(|s| s.to_string()).collect(),
		));
	}

	fn check_online(&self) -> ClResult<()> {
		if self.offline.load(Ordering::SeqCst) {
			Err(Error::Network("authority unreachable".into()))
		} else {
			Ok(())
		}
	}

	/// Merge a document's full history into one update.
	fn merged_state(updates: &[Vec<u8>]) -> Vec<u8> {
		use yrs::updates::decoder::Decode;
		use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

		let doc = Doc::new();
		{
			let mut txn = doc.transact_mut();
			for bytes in updates {
				if let Ok(update) = Update::decode_v1(bytes) {
					let _ = txn.apply_update(update);
				}
			}
		}
		doc.transact().encode_state_as_update_v1(&StateVector::default())
	}
}

impl std::fmt::Debug for MockAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MockAuthority").field("seq", &self.current_seq()).finish()
	}
}

#[async_trait]
impl Authority for MockAuthority {
	async fn protocol(&self) -> ClResult<ProtocolInfo> {
		self.check_online()?;
		Ok(ProtocolInfo { version: self.version })
	}

	async fn stream(&self, args: StreamArgs) -> ClResult<ChangeBatch> {
		self.check_online()?;
		let mut state = self.state.lock();

		let limit = args.limit.unwrap_or(100) as usize;
		let changes: Vec<Change> = state
			.log
			.iter()
			.filter(|entry| entry.collection == &*args.collection && entry.seq > args.cursor.0)
			.take(limit)
			.map(|entry| Change {
				document: entry.document.clone().into_boxed_str(),
				bytes: entry.bytes.clone(),
				seq: entry.seq,
				change_type: entry.change_type,
			})
			.collect();
		let cursor = changes.iter().map(|c| c.seq).max().unwrap_or(args.cursor.0);

		let compact = {
			let mut notice = None;
			state.compact_queue.retain(|(collection, documents)| {
				if collection == &*args.collection && notice.is_none() {
					notice = Some(CompactNotice {
						documents: documents.iter().map(|d| d.clone().into_boxed_str()).collect(),
					});
					false
				} else {
					true
				}
			});
			notice
		};
		let materialize = {
			let mut pass = None;
			state.materialize_queue.retain(|(collection, documents)| {
				if collection == &*args.collection && pass.is_none() {
					pass = Some(
						documents
							.iter()
							.map(|d| d.clone().into_boxed_str())
							.collect::<Vec<Box<str>>>(),
					);
					false
				} else {
					true
				}
			});
			pass
		};

		Ok(ChangeBatch { changes, cursor: Cursor(cursor), more: false, compact, materialize })
	}

	async fn replicate(
		&self,
		kind: WriteKind,
		collection: &str,
		document: &str,
		bytes: &[u8],
	) -> ClResult<ReplicateAck> {
		self.check_online()?;
		let mut state = self.state.lock();
		state.seq += 1;
		let seq = state.seq;
		state.replicate_calls.push((kind, collection.to_string(), document.to_string()));
		state.log.push(LogEntry {
			collection: collection.to_string(),
			document: document.to_string(),
			bytes: bytes.to_vec(),
			seq,
			change_type: ChangeType::Delta,
		});
		state
			.docs
			.entry((collection.to_string(), document.to_string()))
			.or_default()
			.push(bytes.to_vec());
		Ok(ReplicateAck { success: true, seq })
	}

	async fn recovery(&self, collection: &str, vector: &[u8]) -> ClResult<RecoveryDiff> {
		self.check_online()?;
		let mut state = self.state.lock();
		state.recovery_calls += 1;
		let mut diff = serde_json::Map::new();
		for ((entry_collection, document), updates) in &state.docs {
			if entry_collection == collection {
				diff.insert(
					document.clone(),
					Value::String(B64.encode(Self::merged_state(updates))),
				);
			}
		}
		Ok(RecoveryDiff {
			diff: Some(serde_json::to_vec(&Value::Object(diff))?),
			vector: vector.to_vec(),
			cursor: Some(Cursor(state.seq)),
		})
	}

	async fn mark(&self, _args: MarkArgs) -> ClResult<()> {
		self.check_online()?;
		self.mark_calls.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn compact(&self, _collection: &str, _document: &str) -> ClResult<CompactAck> {
		self.check_online()?;
		Ok(CompactAck { success: true, removed: 0, retained: 0, size: 0 })
	}

	async fn presence(&self, _args: PresenceArgs) -> ClResult<()> {
		self.check_online()?;
		Ok(())
	}

	async fn session(&self, _args: SessionArgs) -> ClResult<Vec<SessionEntry>> {
		self.check_online()?;
		Ok(Vec::new())
	}
}

/// Open a collection over a fresh in-memory adapter with fast test timings.
pub async fn open_collection(
	name: &str,
	schema: Schema,
	authority: Arc<MockAuthority>,
) -> (Arc<Collection>, Arc<dyn StorageAdapter>) {
	let storage: Arc<dyn StorageAdapter> =
		Arc::new(SqliteStorageAdapter::new_in_memory().await.expect("storage"));
	let collection =
		open_collection_with_storage(name, schema, authority, Arc::clone(&storage)).await;
	(collection, storage)
}

/// Same, over caller-provided storage (for reopen/durability tests).
pub async fn open_collection_with_storage(
	name: &str,
	schema: Schema,
	authority: Arc<MockAuthority>,
	storage: Arc<dyn StorageAdapter>,
) -> Arc<Collection> {
	let mut config = CollectionConfig::new(
		name,
		Arc::new(schema),
		storage,
		authority as Arc<dyn Authority>,
	);
	config.sync.debounce_ms = 10;
	config.replicator.poll_interval_ms = 25;
	config.compaction = CompactionConfig { threshold: 50, timeout_ms: 0, retain: 0 };
	Collection::open(config).await.expect("collection open")
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_for<F>(mut predicate: F, what: &str)
where
	F: FnMut() -> bool,
{
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while !predicate() {
		if tokio::time::Instant::now() > deadline {
			panic!("timed out waiting for {}", what);
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}

pub fn client_of(collection: &Collection) -> ClientId {
	collection.client_id().clone()
}

// vim: ts=4
