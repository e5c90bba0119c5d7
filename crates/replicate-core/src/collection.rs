//! Collection factory and public engine surface.
//!
//! `Collection::open` instantiates the per-collection components leaves-first
//! (identity → migrator → WAL → document manager → sync actors → replicator)
//! and returns the handle hosts mutate and read through. All mutations run
//! through the transaction coordinator, so every write shares the same
//! staging, rollback, and delivery semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;

use replicate_types::authority::{
	Authority, CompactAck, PresenceAction, PresenceArgs, SessionArgs, SessionEntry,
};
use replicate_types::storage_adapter::StorageAdapter;
use serde_json::Value;
use tokio::sync::watch;
use yrs::{TransactionMut, XmlFragmentRef};

use crate::doc::{DocumentManager, ORIGIN_LOCAL};
use crate::fields::FieldWrite;
use crate::handshake::ProtocolGate;
use crate::identity::{self, Identity, UserGetter};
use crate::migrator::{CustomMigration, MigrationErrorHandler, Migrator};
use crate::prelude::*;
use crate::replicator::{Replicator, ReplicatorConfig};
use crate::schema::Schema;
use crate::signals::{CollectionSignals, ErrorSignal};
use crate::sync::{SyncConfig, SyncManager};
use crate::transaction::{StageIndex, TransactionCoordinator, TransactionHandle};
use crate::wal::{CompactionConfig, Wal};

/// Options recognized by the collection factory.
pub struct CollectionConfig {
	pub name: Box<str>,
	/// Versioned schema descriptor; drives the migrator and field kinds.
	pub schema: Arc<Schema>,
	/// Local persistence.
	pub storage: Arc<dyn StorageAdapter>,
	/// RPC transport handle for the authority.
	pub authority: Arc<dyn Authority>,
	/// Derives a document id from a logical entity; defaults to the `id`
	/// field.
	pub get_key: Option<Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>>,
	/// Optional signed-in user identity getter.
	pub user: Option<UserGetter>,
	/// Migration recovery decision hook.
	pub on_migration_error: Option<MigrationErrorHandler>,
	/// Custom migration steps keyed by target version.
	pub custom_migrations: HashMap<u32, Arc<dyn CustomMigration>>,
	/// WAL pressure tuning.
	pub compaction: CompactionConfig,
	/// Sync actor tuning (debounce, retry budget).
	pub sync: SyncConfig,
	/// Stream consumer tuning.
	pub replicator: ReplicatorConfig,
	/// Injected protocol gate; test harnesses pass one per isolated world.
	pub gate: Option<Arc<ProtocolGate>>,
}

impl CollectionConfig {
	pub fn new(
		name: impl Into<Box<str>>,
		schema: Arc<Schema>,
		storage: Arc<dyn StorageAdapter>,
		authority: Arc<dyn Authority>,
	) -> Self {
		Self {
			name: name.into(),
			schema,
			storage,
			authority,
			get_key: None,
			user: None,
			on_migration_error: None,
			custom_migrations: HashMap::new(),
			compaction: CompactionConfig::default(),
			sync: SyncConfig::default(),
			replicator: ReplicatorConfig::default(),
			gate: None,
		}
	}
}

pub struct Collection {
	name: Box<str>,
	schema: Arc<Schema>,
	identity: Identity,
	manager: Arc<DocumentManager>,
	sync: Arc<SyncManager>,
	coordinator: TransactionCoordinator,
	authority: Arc<dyn Authority>,
	signals: Arc<CollectionSignals>,
	user: Option<UserGetter>,
	get_key: Option<Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>>,
	effective_version: u32,
	shutdown_tx: watch::Sender<bool>,
	replicator_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Collection {
	/// Open the collection: migrate the schema, replay the WAL, and start the
	/// replicator.
	pub async fn open(config: CollectionConfig) -> ClResult<Arc<Self>> {
		let CollectionConfig {
			name,
			schema,
			storage,
			authority,
			get_key,
			user,
			on_migration_error,
			custom_migrations,
			compaction,
			sync: sync_config,
			replicator: replicator_config,
			gate,
		} = config;

		let identity = identity::load_or_create(&storage, &name).await?;
		let signals = Arc::new(CollectionSignals::default());

		// Schema gating: no document machinery exists until the migrator has
		// settled the stored version.
		let migrator = Migrator::new(
			name.clone(),
			Arc::clone(&storage),
			Arc::clone(&schema),
			custom_migrations,
			on_migration_error,
		)?;
		let effective_version = migrator.migrate().await?;

		let cursor_cell = Arc::new(AtomicI64::new(0));
		let wal = Arc::new(Wal::new(name.clone(), Arc::clone(&storage), compaction));
		let manager = Arc::new(DocumentManager::new(
			name.clone(),
			identity.client.clone(),
			identity.actor_id,
			Arc::clone(&schema),
			wal,
			Arc::clone(&cursor_cell),
		));
		manager.load().await?;

		let gate = gate.unwrap_or_else(ProtocolGate::new);
		let sync = Arc::new(SyncManager::new(
			name.clone(),
			Arc::clone(&manager),
			Arc::clone(&authority),
			Arc::clone(&storage),
			Arc::clone(&gate),
			Arc::clone(&signals),
			sync_config,
			identity.client.clone(),
		));

		let index = Arc::new(StageIndex::default());
		let coordinator = TransactionCoordinator::new(
			name.clone(),
			Arc::clone(&manager),
			Arc::clone(&authority),
			Arc::clone(&sync),
			Arc::clone(&gate),
			Arc::clone(&signals),
			Arc::clone(&index),
		);

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let replicator = Replicator::new(
			name.clone(),
			Arc::clone(&manager),
			Arc::clone(&authority),
			Arc::clone(&storage),
			Arc::clone(&sync),
			Arc::clone(&gate),
			Arc::clone(&signals),
			Arc::clone(&index),
			Arc::clone(&cursor_cell),
			replicator_config,
			shutdown_rx,
		);
		let replicator_task = tokio::spawn(replicator.run());

		info!("collection {} open (schema v{})", name, effective_version);
		Ok(Arc::new(Self {
			name,
			schema,
			identity,
			manager,
			sync,
			coordinator,
			authority,
			signals,
			user,
			get_key,
			effective_version,
			shutdown_tx,
			replicator_task: parking_lot::Mutex::new(Some(replicator_task)),
		}))
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn client_id(&self) -> &ClientId {
		&self.identity.client
	}

	pub fn session_id(&self) -> &ClientId {
		&self.identity.session
	}

	/// Schema version currently in effect (the target, unless the migration
	/// handler kept the old one).
	pub fn schema_version(&self) -> u32 {
		self.effective_version
	}

	// Reads //
	//*******//

	/// Merged read-out of one document; `None` when absent or deleted.
	pub fn get(&self, id: &str) -> Option<Value> {
		self.manager.read_document(id)
	}

	/// Read-outs of every live document, in id order.
	pub fn list(&self) -> Vec<Value> {
		self.manager
			.list_documents()
			.iter()
			.filter_map(|id| self.manager.read_document(id))
			.collect()
	}

	/// Per-document `pending` observable around in-flight flushes.
	pub fn pending(&self, id: &str) -> watch::Receiver<bool> {
		self.sync.pending(id)
	}

	/// Per-collection error signal with the last non-retriable failure.
	pub fn errors(&self) -> watch::Receiver<Option<ErrorSignal>> {
		self.signals.subscribe()
	}

	/// Whether a transaction currently stages a delete for the document.
	pub fn is_document_being_deleted(&self, id: &str) -> bool {
		self.coordinator.stage_index().is_document_being_deleted(id)
	}

	/// Whether a transaction currently stages a mutation for the document.
	pub fn is_document_being_modified(&self, id: &str) -> bool {
		self.coordinator.stage_index().is_document_being_modified(id)
	}

	// Mutations //
	//***********//

	/// Insert one document from a JSON object.
	pub async fn insert(&self, id: &str, value: &Value) -> ClResult<()> {
		self.coordinator
			.transaction(|tx| async move {
				tx.insert(id, value)?;
				Ok(())
			})
			.await
	}

	/// Insert, deriving the document id through the configured `get_key`
	/// (falling back to the payload's `id` field).
	pub async fn insert_entity(&self, value: &Value) -> ClResult<String> {
		let id = self
			.get_key
			.as_ref()
			.and_then(|get_key| get_key(value))
			.or_else(|| value.get("id").and_then(Value::as_str).map(str::to_string))
			.ok_or_else(|| {
				Error::ValidationError("entity has no id and no get_key derived one".into())
			})?;
		self.insert(&id, value).await?;
		Ok(id)
	}

	/// Partial update from a JSON object.
	pub async fn update(&self, id: &str, value: &Value) -> ClResult<()> {
		self.coordinator
			.transaction(|tx| async move {
				tx.update(id, value)?;
				Ok(())
			})
			.await
	}

	/// Explicit field writes: counter increments, set add/remove, prose
	/// replacement.
	pub async fn mutate(&self, id: &str, writes: Vec<FieldWrite>) -> ClResult<()> {
		self.coordinator
			.transaction(|tx| async move {
				tx.mutate(id, writes)?;
				Ok(())
			})
			.await
	}

	/// Soft-delete; physical removal happens at the next compaction.
	pub async fn delete(&self, id: &str) -> ClResult<()> {
		self.coordinator
			.transaction(|tx| async move {
				tx.delete(id);
				Ok(())
			})
			.await
	}

	/// Multi-document transaction with automatic rollback.
	pub async fn transaction<F, Fut, T>(&self, f: F) -> ClResult<T>
	where
		F: FnOnce(TransactionHandle) -> Fut,
		Fut: Future<Output = ClResult<T>>,
	{
		self.coordinator.transaction(f).await
	}

	// Maintenance //
	//*************//

	/// Compact one document locally and ask the authority to truncate its
	/// server-side history too.
	pub async fn compact(&self, id: &str) -> ClResult<CompactAck> {
		self.manager.compact_document(id).await?;
		self.authority.compact(&self.name, id).await
	}

	/// Editor binding for a prose field: the fragment handle, a state-vector
	/// snapshot, and a destructor (`Drop`). Deltas produced through it land
	/// in the WAL and flush like any other local change.
	pub fn prose_binding(&self, id: &str, field: &str) -> ClResult<ProseBinding> {
		let handle = self.manager.get_or_create(id);
		let fragment = handle
			.prose
			.get(field)
			.cloned()
			.ok_or_else(|| {
				Error::ValidationError(format!("field '{}' is not a prose field", field))
			})?;
		let vector = self.manager.encode_state_vector(id).unwrap_or_default();
		Ok(ProseBinding {
			document: id.into(),
			field: field.into(),
			fragment,
			vector,
			manager: Arc::clone(&self.manager),
			sync: Arc::clone(&self.sync),
		})
	}

	// Presence boundary //
	//*******************//

	/// Announce presence on a document, carrying the configured user
	/// identity.
	pub async fn announce_presence(&self, id: &str, action: PresenceAction) -> ClResult<()> {
		let profile = self.user.as_ref().and_then(|getter| getter());
		self.authority
			.presence(PresenceArgs {
				collection: self.name.clone(),
				document: id.into(),
				client: self.identity.client.clone(),
				action,
				user: profile.as_ref().map(|p| p.id.clone()),
				profile,
				cursor: None,
				vector: self.manager.encode_state_vector(id),
				interval: None,
			})
			.await
	}

	/// Collaborators currently present on a document.
	pub async fn session_peers(&self, id: &str) -> ClResult<Vec<SessionEntry>> {
		self.authority
			.session(SessionArgs {
				collection: self.name.clone(),
				document: id.into(),
				connected: Some(true),
				exclude: Some(self.identity.client.clone()),
				group: None,
			})
			.await
	}

	/// Graceful teardown: stop the replicator, drain every sync actor, drop
	/// in-memory handles. Persistence is untouched.
	pub async fn close(&self) {
		let _ = self.shutdown_tx.send(true);
		if let Some(task) = self.replicator_task.lock().take() {
			let _ = task.await;
		}
		self.sync.shutdown_all().await;
		self.manager.destroy();
		debug!("collection {} closed", self.name);
	}

	pub fn schema(&self) -> &Arc<Schema> {
		&self.schema
	}
}

impl std::fmt::Debug for Collection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Collection")
			.field("name", &self.name)
			.field("schema_version", &self.effective_version)
			.finish()
	}
}

/// Editor binding for one prose field (collaborator contract).
pub struct ProseBinding {
	document: Box<str>,
	field: Box<str>,
	fragment: XmlFragmentRef,
	vector: Vec<u8>,
	manager: Arc<DocumentManager>,
	sync: Arc<SyncManager>,
}

impl ProseBinding {
	/// The live fragment reference for the editor integration.
	pub fn fragment(&self) -> &XmlFragmentRef {
		&self.fragment
	}

	/// State vector snapshot taken when the binding was produced.
	pub fn state_vector(&self) -> &[u8] {
		&self.vector
	}

	pub fn document(&self) -> &str {
		&self.document
	}

	pub fn field(&self) -> &str {
		&self.field
	}

	/// Run an editor edit inside a CRDT transaction; the resulting delta is
	/// WAL-logged and scheduled for flush like any other local change.
	pub async fn transact<F>(&self, f: F) -> ClResult<()>
	where
		F: FnOnce(&mut TransactionMut<'_>, &XmlFragmentRef) -> ClResult<()>,
	{
		let fragment = self.fragment.clone();
		self.manager
			.transact_with_delta(&self.document, ORIGIN_LOCAL, move |txn, _handle| {
				f(txn, &fragment)
			})
			.await?;
		self.sync.notify_local(&self.document);
		Ok(())
	}
}

impl Drop for ProseBinding {
	fn drop(&mut self) {
		debug!("prose binding for {}:{} dropped", self.document, self.field);
	}
}

impl std::fmt::Debug for ProseBinding {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProseBinding")
			.field("document", &self.document)
			.field("field", &self.field)
			.finish()
	}
}

// vim: ts=4
