//! Document manager: owns one CRDT document per entity in a collection.
//!
//! Each handle wraps a `yrs::Doc` with two root maps, `fields` (user-visible
//! CRDT state per field) and `_meta` (creation/deletion tombstones), plus one
//! root XML fragment per prose field. The manager is the arena owner: every
//! external hold on a document is a non-owning lookup by id, so teardown
//! cannot leak reference cycles.
//!
//! All mutation paths run through `apply_update` / `transact_with_delta`,
//! which append the produced delta to the WAL unless the update came from WAL
//! replay itself (the reserved `load` origin).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
	Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update,
	XmlFragmentRef,
};

use crate::fields::{self, FieldWrite, prose};
use crate::prelude::*;
use crate::schema::{FieldKind, Schema};
use crate::wal::Wal;

/// Origin tag for WAL replay; updates tagged with it are never re-logged.
pub const ORIGIN_LOAD: &str = "load";
/// Origin tag for local mutations staged by the transaction coordinator.
pub const ORIGIN_LOCAL: &str = "local";
/// Origin tag for deltas streamed from the authority.
pub const ORIGIN_REMOTE: &str = "remote";
/// Origin tag for authority snapshots replacing local state.
pub const ORIGIN_SNAPSHOT: &str = "snapshot";
/// Origin tag for compensating writes during transaction rollback.
pub const ORIGIN_ROLLBACK: &str = "rollback";

/// An encoded empty update is exactly this long; anything at or below it
/// means "nothing to send".
pub const EMPTY_UPDATE_LEN: usize = 2;

/// One live document: the doc plus its pre-created root refs. Root types must
/// exist before any transaction is opened against them.
pub struct DocHandle {
	pub(crate) doc: Doc,
	pub(crate) fields: MapRef,
	pub(crate) meta: MapRef,
	pub(crate) prose: HashMap<Box<str>, XmlFragmentRef>,
}

impl DocHandle {
	fn create(actor_id: u64, schema: &Schema) -> Self {
		let mut options = yrs::Options::default();
		options.client_id = actor_id;
		let doc = Doc::with_options(options);
		let fields = doc.get_or_insert_map("fields");
		let meta = doc.get_or_insert_map("_meta");
		let mut prose = HashMap::new();
		for spec in &schema.shape.fields {
			if spec.kind == FieldKind::Prose {
				let fragment = doc.get_or_insert_xml_fragment(prose::fragment_name(&spec.name));
				prose.insert(spec.name.clone(), fragment);
			}
		}
		Self { doc, fields, meta, prose }
	}
}

pub struct DocumentManager {
	collection: Box<str>,
	client: ClientId,
	actor_id: u64,
	schema: Arc<Schema>,
	wal: Arc<Wal>,
	/// Latest authority cursor, shared with the replicator; stamped into
	/// snapshot rows at compaction time.
	cursor: Arc<AtomicI64>,
	docs: parking_lot::RwLock<HashMap<Box<str>, Arc<DocHandle>>>,
}

impl DocumentManager {
	pub fn new(
		collection: impl Into<Box<str>>,
		client: ClientId,
		actor_id: u64,
		schema: Arc<Schema>,
		wal: Arc<Wal>,
		cursor: Arc<AtomicI64>,
	) -> Self {
		Self {
			collection: collection.into(),
			client,
			actor_id,
			schema,
			wal,
			cursor,
			docs: parking_lot::RwLock::new(HashMap::new()),
		}
	}

	pub fn collection(&self) -> &str {
		&self.collection
	}

	pub fn client(&self) -> &ClientId {
		&self.client
	}

	pub fn schema(&self) -> &Arc<Schema> {
		&self.schema
	}

	/// Look up a handle without creating it.
	pub fn get(&self, id: &str) -> Option<Arc<DocHandle>> {
		self.docs.read().get(id).cloned()
	}

	/// Return the handle, creating an empty document when absent.
	pub fn get_or_create(&self, id: &str) -> Arc<DocHandle> {
		if let Some(handle) = self.get(id) {
			return handle;
		}
		let mut docs = self.docs.write();
		docs.entry(id.into())
			.or_insert_with(|| Arc::new(DocHandle::create(self.actor_id, &self.schema)))
			.clone()
	}

	pub fn list_documents(&self) -> Vec<Box<str>> {
		let mut ids: Vec<Box<str>> = self.docs.read().keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Merge a foreign delta into the document.
	pub async fn apply_update(&self, id: &str, bytes: &[u8], origin: &str) -> ClResult<()> {
		let handle = self.get_or_create(id);
		{
			let update = Update::decode_v1(bytes).map_err(|e| {
				warn!("undecodable update for {}: {}", id, e);
				Error::Parse
			})?;
			let mut txn = handle.doc.transact_mut_with(origin);
			txn.apply_update(update).map_err(|e| {
				warn!("failed to apply update for {}: {}", id, e);
				Error::ValidationError(format!("update rejected: {}", e))
			})?;
		}
		if origin != ORIGIN_LOAD {
			self.log_update(id, bytes).await?;
		}
		Ok(())
	}

	/// Replace the document's state with an authority snapshot: the in-memory
	/// state is cleared by swapping in a fresh document before the snapshot
	/// update is applied.
	pub async fn apply_snapshot(&self, id: &str, bytes: &[u8]) -> ClResult<()> {
		let fresh = Arc::new(DocHandle::create(self.actor_id, &self.schema));
		{
			let update = Update::decode_v1(bytes).map_err(|e| {
				warn!("undecodable snapshot for {}: {}", id, e);
				Error::Parse
			})?;
			let mut txn = fresh.doc.transact_mut_with(ORIGIN_SNAPSHOT);
			txn.apply_update(update).map_err(|e| {
				Error::ValidationError(format!("snapshot rejected: {}", e))
			})?;
		}
		self.docs.write().insert(id.into(), fresh);
		self.log_update(id, bytes).await?;
		Ok(())
	}

	/// Run `f` inside a single CRDT transaction and return the delta covering
	/// exactly the ops it emitted.
	pub async fn transact_with_delta<F>(&self, id: &str, origin: &str, f: F) -> ClResult<Vec<u8>>
	where
		F: FnOnce(&mut TransactionMut<'_>, &DocHandle) -> ClResult<()>,
	{
		let handle = self.get_or_create(id);
		let before = handle.doc.transact().state_vector();
		{
			let mut txn = handle.doc.transact_mut_with(origin);
			f(&mut txn, &handle)?;
		}
		let delta = handle.doc.transact().encode_state_as_update_v1(&before);
		if origin != ORIGIN_LOAD && delta.len() > EMPTY_UPDATE_LEN {
			self.log_update(id, &delta).await?;
		}
		Ok(delta)
	}

	/// Apply a list of staged field writes, stamping the creation tombstone
	/// on first touch. Returns the emitted delta.
	pub async fn apply_writes(
		&self,
		id: &str,
		writes: &[FieldWrite],
		origin: &str,
	) -> ClResult<Vec<u8>> {
		let schema = Arc::clone(&self.schema);
		let client = self.client.clone();
		let now = Timestamp::now();
		let writes = writes.to_vec();
		self.transact_with_delta(id, origin, move |txn, handle| {
			if handle.meta.get(txn, "created").is_none() {
				handle.meta.insert(txn, "created", Any::BigInt(now.0));
			}
			for write in &writes {
				let spec = schema.shape.field(write.field()).ok_or_else(|| {
					Error::ValidationError(format!(
						"field '{}' is not part of the schema",
						write.field()
					))
				})?;
				fields::apply_write(txn, handle, spec, write, &client, now)?;
			}
			Ok(())
		})
		.await
	}

	/// Soft-delete: tombstone in `_meta`, CRDT history intact so concurrent
	/// edits cannot resurrect the document. Physical removal happens at the
	/// next compaction.
	pub async fn mark_deleted(&self, id: &str) -> ClResult<Vec<u8>> {
		let now = Timestamp::now();
		self.transact_with_delta(id, ORIGIN_LOCAL, move |txn, handle| {
			handle.meta.insert(txn, "_deleted", Any::Bool(true));
			handle.meta.insert(txn, "deletedAt", Any::BigInt(now.0));
			Ok(())
		})
		.await
	}

	/// Remote reconciliation variant of `mark_deleted`: same tombstone, but
	/// not logged as a local change to push.
	pub async fn mark_deleted_remote(&self, id: &str) -> ClResult<()> {
		let now = Timestamp::now();
		self.transact_with_delta(id, ORIGIN_REMOTE, move |txn, handle| {
			handle.meta.insert(txn, "_deleted", Any::Bool(true));
			handle.meta.insert(txn, "deletedAt", Any::BigInt(now.0));
			Ok(())
		})
		.await?;
		Ok(())
	}

	pub fn is_deleted(&self, id: &str) -> bool {
		let Some(handle) = self.get(id) else { return false };
		let txn = handle.doc.transact();
		matches!(handle.meta.get(&txn, "_deleted"), Some(Out::Any(Any::Bool(true))))
	}

	/// Merged read-out of a document, `None` when absent or tombstoned.
	pub fn read_document(&self, id: &str) -> Option<Value> {
		let handle = self.get(id)?;
		let txn = handle.doc.transact();
		if matches!(handle.meta.get(&txn, "_deleted"), Some(Out::Any(Any::Bool(true)))) {
			return None;
		}
		if handle.meta.get(&txn, "created").is_none() {
			return None;
		}
		let mut out = serde_json::Map::new();
		out.insert("id".to_string(), Value::String(id.to_string()));
		for spec in &self.schema.shape.fields {
			if let Some(value) = fields::read_field(&txn, &handle, spec) {
				out.insert(spec.name.to_string(), value);
			}
		}
		Some(Value::Object(out))
	}

	pub fn encode_state(&self, id: &str) -> Option<Vec<u8>> {
		let handle = self.get(id)?;
		let txn = handle.doc.transact();
		Some(txn.encode_state_as_update_v1(&StateVector::default()))
	}

	pub fn encode_state_vector(&self, id: &str) -> Option<Vec<u8>> {
		let handle = self.get(id)?;
		let txn = handle.doc.transact();
		Some(txn.state_vector().encode_v1())
	}

	/// Delta from a previously observed state vector to now; what the sync
	/// actor pushes.
	pub fn encode_update_from(&self, id: &str, vector: &[u8]) -> ClResult<Vec<u8>> {
		let handle = self
			.get(id)
			.ok_or_else(|| Error::DocumentNotRegistered(id.to_string()))?;
		let sv = if vector.is_empty() {
			StateVector::default()
		} else {
			StateVector::decode_v1(vector).map_err(|_| Error::Parse)?
		};
		let txn = handle.doc.transact();
		Ok(txn.encode_state_as_update_v1(&sv))
	}

	/// Aggregate state vector across all documents, used by recovery: a JSON
	/// object of per-document base64 vectors (the wire treats it as opaque
	/// bytes).
	pub fn aggregate_vector(&self) -> ClResult<Vec<u8>> {
		let mut map = serde_json::Map::new();
		for id in self.list_documents() {
			if let Some(vector) = self.encode_state_vector(&id) {
				map.insert(id.to_string(), Value::String(B64.encode(vector)));
			}
		}
		Ok(serde_json::to_vec(&Value::Object(map))?)
	}

	/// Apply a recovery diff produced against `aggregate_vector`: a JSON
	/// object of per-document base64 updates.
	pub async fn apply_recovery_diff(&self, diff: &[u8]) -> ClResult<()> {
		let parsed: serde_json::Map<String, Value> = serde_json::from_slice(diff)?;
		for (id, encoded) in parsed {
			let Some(encoded) = encoded.as_str() else { continue };
			let bytes = B64.decode(encoded).map_err(|_| Error::Parse)?;
			self.apply_update(&id, &bytes, ORIGIN_REMOTE).await?;
		}
		Ok(())
	}

	/// Compensating write used by transaction rollback: restore the document
	/// to a previously observed read-out. CRDT ops cannot be retracted, so
	/// rollback emits new ops that re-establish the old values.
	pub async fn restore_document(&self, id: &str, previous: Option<&Value>) -> ClResult<()> {
		let schema = Arc::clone(&self.schema);
		let client = self.client.clone();
		let now = Timestamp::now();
		let previous = previous.cloned();
		self.transact_with_delta(id, ORIGIN_ROLLBACK, move |txn, handle| {
			let Some(previous) = previous else {
				// Rolling back an insert: tombstone the document again.
				handle.meta.insert(txn, "_deleted", Any::Bool(true));
				handle.meta.insert(txn, "deletedAt", Any::BigInt(now.0));
				return Ok(());
			};
			handle.meta.insert(txn, "_deleted", Any::Bool(false));
			for spec in &schema.shape.fields {
				let prev_value = previous.get(&*spec.name);
				match spec.kind {
					FieldKind::Scalar | FieldKind::Register => {
						let value = prev_value.cloned().unwrap_or(Value::Null);
						crate::fields::register::write(
							txn,
							&handle.fields,
							&spec.name,
							&client,
							&value,
							now,
						);
					}
					FieldKind::Counter => {
						let current =
							crate::fields::counter::value(txn, &handle.fields, &spec.name);
						let target = prev_value.and_then(Value::as_i64).unwrap_or(0);
						if target != current {
							crate::fields::counter::increment(
								txn,
								&handle.fields,
								&spec.name,
								&client,
								target - current,
								now,
							);
						}
					}
					FieldKind::Set => {
						let current =
							crate::fields::set::members(txn, &handle.fields, &spec.name);
						let target: Vec<Value> = prev_value
							.and_then(Value::as_array)
							.cloned()
							.unwrap_or_default();
						for member in &target {
							if !current.contains(member) {
								crate::fields::set::add(
									txn,
									&handle.fields,
									&spec.name,
									&client,
									member,
									now,
								)?;
							}
						}
						for member in &current {
							if !target.contains(member) {
								crate::fields::set::remove(
									txn,
									&handle.fields,
									&spec.name,
									member,
									now,
								)?;
							}
						}
					}
					FieldKind::Prose => {
						if let Some(fragment) = handle.prose.get(spec.name.as_ref()) {
							let empty = serde_json::json!({ "type": "doc", "content": [] });
							let target = prev_value.unwrap_or(&empty);
							crate::fields::prose::replace(txn, fragment, target)?;
						}
					}
				}
			}
			Ok(())
		})
		.await?;
		Ok(())
	}

	/// Append to the WAL and compact when the document's tail crosses the
	/// threshold.
	async fn log_update(&self, id: &str, bytes: &[u8]) -> ClResult<()> {
		if self.wal.append(id, bytes).await? {
			self.compact_document(id).await?;
		}
		Ok(())
	}

	/// Compaction critical section for one document. Tombstoned documents are
	/// physically removed here.
	pub async fn compact_document(&self, id: &str) -> ClResult<()> {
		let Some(handle) = self.get(id) else { return Ok(()) };
		if self.is_deleted(id) {
			self.wal.purge(id).await?;
			self.docs.write().remove(id);
			return Ok(());
		}
		let (snapshot, vector) = {
			let txn = handle.doc.transact();
			(
				txn.encode_state_as_update_v1(&StateVector::default()),
				txn.state_vector().encode_v1(),
			)
		};
		let seq = Cursor(self.cursor.load(Ordering::Acquire));
		self.wal.replace_with_snapshot(id, &snapshot, &vector, seq).await
	}

	/// Replay the persisted WAL: snapshot first, then deltas ascending, all
	/// under the reserved `load` origin.
	pub async fn load(&self) -> ClResult<usize> {
		let loaded = self.wal.load().await?;
		let count = loaded.len();
		for doc in loaded {
			if let Some(snapshot) = &doc.snapshot {
				self.apply_update(&doc.document, snapshot, ORIGIN_LOAD).await?;
			}
			for delta in &doc.deltas {
				self.apply_update(&doc.document, delta, ORIGIN_LOAD).await?;
			}
		}
		debug!("loaded {} documents for {}", count, self.collection);
		Ok(count)
	}

	/// Drop every in-memory handle. Persistence is untouched.
	pub fn destroy(&self) {
		self.docs.write().clear();
	}
}

impl std::fmt::Debug for DocumentManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DocumentManager")
			.field("collection", &self.collection)
			.field("documents", &self.docs.read().len())
			.finish()
	}
}


// vim: ts=4
