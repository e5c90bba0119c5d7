//! Transaction coordinator: staged commits with automatic rollback.
//!
//! Staging never touches the live documents; every staged change records the
//! intended writes and, at commit time, the previous read-out needed to
//! reverse it. Commit applies stages in order (CRDT transaction + WAL) and
//! pushes each delta to the authority. A non-retriable rejection rolls back
//! every already-applied stage in reverse order through compensating writes;
//! a retriable failure leaves the commit durable locally and defers delivery
//! to the document's sync actor.

use std::collections::HashMap;
use std::sync::Arc;

use replicate_types::authority::{Authority, WriteKind};
use serde_json::Value;

use crate::doc::{DocumentManager, ORIGIN_LOCAL};
use crate::fields::FieldWrite;
use crate::handshake::ProtocolGate;
use crate::prelude::*;
use crate::schema::{FieldKind, Schema};
use crate::signals::CollectionSignals;
use crate::sync::SyncManager;

/// Lifecycle of one transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TxState {
	Pending,
	Committing,
	Committed,
	RolledBack,
	Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StageKind {
	Insert,
	Update,
	Delete,
}

impl StageKind {
	fn write_kind(self) -> WriteKind {
		match self {
			StageKind::Insert => WriteKind::Insert,
			StageKind::Update => WriteKind::Update,
			StageKind::Delete => WriteKind::Delete,
		}
	}
}

#[derive(Debug)]
struct StagedChange {
	kind: StageKind,
	document: Box<str>,
	writes: Vec<FieldWrite>,
}

/// Pending-stage bookkeeping shared with the replicator, so it can skip
/// transient updates to documents the user is about to delete.
#[derive(Debug, Default)]
pub struct StageIndex {
	inner: parking_lot::Mutex<HashMap<Box<str>, StageCounts>>,
}

#[derive(Debug, Default)]
struct StageCounts {
	modifying: u32,
	deleting: u32,
}

impl StageIndex {
	fn begin(&self, document: &str, kind: StageKind) {
		let mut inner = self.inner.lock();
		let counts = inner.entry(document.into()).or_default();
		match kind {
			StageKind::Delete => counts.deleting += 1,
			_ => counts.modifying += 1,
		}
	}

	fn end(&self, document: &str, kind: StageKind) {
		let mut inner = self.inner.lock();
		if let Some(counts) = inner.get_mut(document) {
			match kind {
				StageKind::Delete => counts.deleting = counts.deleting.saturating_sub(1),
				_ => counts.modifying = counts.modifying.saturating_sub(1),
			}
			if counts.deleting == 0 && counts.modifying == 0 {
				inner.remove(document);
			}
		}
	}

	pub fn is_document_being_deleted(&self, document: &str) -> bool {
		self.inner.lock().get(document).is_some_and(|c| c.deleting > 0)
	}

	pub fn is_document_being_modified(&self, document: &str) -> bool {
		self.inner.lock().get(document).is_some_and(|c| c.modifying > 0)
	}
}

/// Staging handle passed to the transaction body.
#[derive(Clone)]
pub struct TransactionHandle {
	stages: Arc<parking_lot::Mutex<Vec<StagedChange>>>,
	index: Arc<StageIndex>,
	schema: Arc<Schema>,
}

impl TransactionHandle {
	/// Stage an insert from a JSON object; fields are routed by their schema
	/// kind (scalars become register writes, numbers feed counters, arrays
	/// feed sets, trees feed prose).
	pub fn insert(&self, document: &str, value: &Value) -> ClResult<()> {
		let writes = writes_from_json(&self.schema, value)?;
		self.push(StageKind::Insert, document, writes);
		Ok(())
	}

	/// Stage a partial update from a JSON object.
	pub fn update(&self, document: &str, value: &Value) -> ClResult<()> {
		let writes = writes_from_json(&self.schema, value)?;
		self.push(StageKind::Update, document, writes);
		Ok(())
	}

	/// Stage explicit field writes (counter increments, set add/remove).
	pub fn mutate(&self, document: &str, writes: Vec<FieldWrite>) -> ClResult<()> {
		for write in &writes {
			if self.schema.shape.field(write.field()).is_none() {
				return Err(Error::ValidationError(format!(
					"field '{}' is not part of the schema",
					write.field()
				)));
			}
		}
		self.push(StageKind::Update, document, writes);
		Ok(())
	}

	/// Stage a soft delete.
	pub fn delete(&self, document: &str) {
		self.push(StageKind::Delete, document, Vec::new());
	}

	fn push(&self, kind: StageKind, document: &str, writes: Vec<FieldWrite>) {
		self.index.begin(document, kind);
		self.stages.lock().push(StagedChange { kind, document: document.into(), writes });
	}
}

/// Derive staged writes from a JSON object according to the schema shape.
fn writes_from_json(schema: &Schema, value: &Value) -> ClResult<Vec<FieldWrite>> {
	let object = value
		.as_object()
		.ok_or_else(|| Error::ValidationError("document payload must be an object".into()))?;
	let mut writes = Vec::with_capacity(object.len());
	for (field, field_value) in object {
		if field == "id" {
			continue;
		}
		let spec = schema.shape.field(field).ok_or_else(|| {
			Error::ValidationError(format!("field '{}' is not part of the schema", field))
		})?;
		match spec.kind {
			FieldKind::Scalar | FieldKind::Register => {
				writes.push(FieldWrite::Set {
					field: field.as_str().into(),
					value: field_value.clone(),
				});
			}
			FieldKind::Counter => {
				let by = field_value.as_i64().ok_or_else(|| {
					Error::ValidationError(format!("counter '{}' expects an integer", field))
				})?;
				if by != 0 {
					writes.push(FieldWrite::Increment { field: field.as_str().into(), by });
				}
			}
			FieldKind::Set => {
				let members = field_value.as_array().ok_or_else(|| {
					Error::ValidationError(format!("set '{}' expects an array", field))
				})?;
				for member in members {
					writes.push(FieldWrite::SetAdd {
						field: field.as_str().into(),
						member: member.clone(),
					});
				}
			}
			FieldKind::Prose => {
				writes.push(FieldWrite::ProseReplace {
					field: field.as_str().into(),
					doc: field_value.clone(),
				});
			}
		}
	}
	Ok(writes)
}

pub struct TransactionCoordinator {
	collection: Box<str>,
	manager: Arc<DocumentManager>,
	authority: Arc<dyn Authority>,
	sync: Arc<SyncManager>,
	gate: Arc<ProtocolGate>,
	signals: Arc<CollectionSignals>,
	index: Arc<StageIndex>,
}

impl TransactionCoordinator {
	pub fn new(
		collection: impl Into<Box<str>>,
		manager: Arc<DocumentManager>,
		authority: Arc<dyn Authority>,
		sync: Arc<SyncManager>,
		gate: Arc<ProtocolGate>,
		signals: Arc<CollectionSignals>,
		index: Arc<StageIndex>,
	) -> Self {
		Self {
			collection: collection.into(),
			manager,
			authority,
			sync,
			gate,
			signals,
			index,
		}
	}

	pub fn stage_index(&self) -> &Arc<StageIndex> {
		&self.index
	}

	/// Run `f` with a staging handle; commit its stages when it returns
	/// success, discard them when it fails.
	pub async fn transaction<F, Fut, T>(&self, f: F) -> ClResult<T>
	where
		F: FnOnce(TransactionHandle) -> Fut,
		Fut: Future<Output = ClResult<T>>,
	{
		let stages = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let handle = TransactionHandle {
			stages: Arc::clone(&stages),
			index: Arc::clone(&self.index),
			schema: Arc::clone(self.manager.schema()),
		};

		let mut state = TxState::Pending;
		debug!("transaction started: {:?}", state);
		let result = f(handle).await;
		let staged: Vec<StagedChange> = std::mem::take(&mut *stages.lock());

		let outcome = match result {
			Err(err) => {
				// Failures during staging simply discard the stage list.
				state = TxState::Failed;
				Err(err)
			}
			Ok(value) => {
				state = TxState::Committing;
				match self.commit(&staged).await {
					Ok(()) => {
						state = TxState::Committed;
						Ok(value)
					}
					Err(err) => {
						state = TxState::RolledBack;
						Err(err)
					}
				}
			}
		};

		for stage in &staged {
			self.index.end(&stage.document, stage.kind);
		}
		debug!("transaction finished: {:?} ({} stages)", state, staged.len());
		outcome
	}

	/// Apply every stage in order; on a non-retriable authority rejection,
	/// reverse the applied prefix and propagate.
	async fn commit(&self, staged: &[StagedChange]) -> ClResult<()> {
		let mut applied: Vec<(&StagedChange, Option<Value>)> = Vec::with_capacity(staged.len());

		for stage in staged {
			let previous = self.manager.read_document(&stage.document);
			let delta = match stage.kind {
				StageKind::Insert | StageKind::Update => {
					self.manager.apply_writes(&stage.document, &stage.writes, ORIGIN_LOCAL).await
				}
				StageKind::Delete => self.manager.mark_deleted(&stage.document).await,
			};

			let delta = match delta {
				Ok(delta) => delta,
				Err(err) => {
					self.rollback(&applied).await;
					return Err(err);
				}
			};
			applied.push((stage, previous));

			match self.push_to_authority(stage, &delta).await {
				Ok(()) => self.sync.notify_flushed(&stage.document),
				Err(err) if matches!(err, Error::NonRetriable(_)) => {
					warn!(
						"authority rejected {:?} of {}:{}: {}",
						stage.kind, self.collection, stage.document, err
					);
					self.signals.report("commit", Some(&stage.document), err.to_string());
					self.rollback(&applied).await;
					return Err(err);
				}
				Err(err) => {
					// Offline-first: the commit stays durable locally and the
					// sync actor delivers it once the authority is reachable.
					debug!(
						"deferring delivery of {}:{} to the sync actor: {}",
						self.collection, stage.document, err
					);
					self.sync.notify_local(&stage.document);
				}
			}
		}
		Ok(())
	}

	async fn push_to_authority(&self, stage: &StagedChange, delta: &[u8]) -> ClResult<()> {
		self.gate.verify(&self.authority).await?;
		let ack = self
			.authority
			.replicate(stage.kind.write_kind(), &self.collection, &stage.document, delta)
			.await?;
		if !ack.success {
			return Err(Error::NonRetriable("authority reported unsuccessful write".into()));
		}
		Ok(())
	}

	/// Reverse applied stages in reverse order with compensating writes.
	async fn rollback(&self, applied: &[(&StagedChange, Option<Value>)]) {
		for (stage, previous) in applied.iter().rev() {
			if let Err(err) =
				self.manager.restore_document(&stage.document, previous.as_ref()).await
			{
				// The document stays in its post-failure CRDT state; converge
				// via the next authority snapshot.
				warn!("rollback of {} failed: {}", stage.document, err);
				self.signals.report("rollback", Some(&stage.document), err.to_string());
			}
		}
	}
}

impl std::fmt::Debug for TransactionCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TransactionCoordinator")
			.field("collection", &self.collection)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::schema::{FieldSpec, Shape};
	use serde_json::json;

	fn test_schema() -> Schema {
		Schema::new(
			1,
			Shape::new(vec![
				FieldSpec::new("title", FieldKind::Scalar),
				FieldSpec::new("views", FieldKind::Counter),
				FieldSpec::new("tags", FieldKind::Set),
			]),
		)
	}

	#[test]
	fn test_writes_from_json_routes_by_kind() {
		let schema = test_schema();
		let writes = writes_from_json(
			&schema,
			&json!({"id": "a", "title": "Hi", "views": 2, "tags": ["x", "y"]}),
		)
		.expect("writes");

		assert_eq!(writes.len(), 4);
		assert!(writes.iter().any(|w| matches!(w, FieldWrite::Set { field, .. } if &**field == "title")));
		assert!(writes.iter().any(|w| matches!(w, FieldWrite::Increment { by: 2, .. })));
		assert_eq!(
			writes.iter().filter(|w| matches!(w, FieldWrite::SetAdd { .. })).count(),
			2
		);
	}

	#[test]
	fn test_writes_from_json_rejects_unknown_field() {
		let schema = test_schema();
		let result = writes_from_json(&schema, &json!({"bogus": 1}));
		assert!(result.is_err());
	}

	#[test]
	fn test_stage_index_counts() {
		let index = StageIndex::default();
		index.begin("a", StageKind::Update);
		index.begin("a", StageKind::Delete);
		assert!(index.is_document_being_modified("a"));
		assert!(index.is_document_being_deleted("a"));

		index.end("a", StageKind::Update);
		assert!(!index.is_document_being_modified("a"));
		assert!(index.is_document_being_deleted("a"));

		index.end("a", StageKind::Delete);
		assert!(!index.is_document_being_deleted("a"));
	}
}

// vim: ts=4
