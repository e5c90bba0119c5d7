//! Sync actors: one mailbox-driven task per document, supervised by a
//! per-collection manager.
//!
//! The actor is the only writer to the authority for its document, so flushes
//! are strictly serialized. Local changes are debounced; the debounce is a
//! cancellable sleep inside the loop, not a separate task. Retriable RPC
//! failures back off exponentially with jitter up to the configured retry
//! budget; non-retriable failures land on the collection error signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngExt;
use replicate_types::authority::{Authority, MarkArgs, WriteKind};
use replicate_types::storage_adapter::StorageAdapter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::doc::{DocumentManager, EMPTY_UPDATE_LEN};
use crate::handshake::ProtocolGate;
use crate::prelude::*;
use crate::signals::CollectionSignals;
use crate::kv;

/// Messages accepted by a document's sync actor.
#[derive(Debug)]
pub enum SyncMessage {
	/// A local mutation was committed; schedule a debounced flush.
	LocalChange,
	/// The replicator merged remote ops; refresh the pushed vector.
	ExternalUpdate,
	/// The transaction coordinator already pushed the current state through a
	/// direct RPC; record it so the next flush sends nothing twice.
	Flushed,
	/// Stop the actor; the acknowledgment fires after the inbox drains.
	Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
	pub debounce_ms: u64,
	pub max_retries: u32,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self { debounce_ms: 200, max_retries: 3 }
	}
}

/// Inbox batch accumulation window.
const BATCH_ACCUMULATE: Duration = Duration::from_millis(2);
/// Retry backoff base.
const BACKOFF_BASE_MS: u64 = 100;

#[derive(Clone)]
pub struct SyncActorHandle {
	tx: mpsc::UnboundedSender<SyncMessage>,
	pending: watch::Receiver<bool>,
}

impl SyncActorHandle {
	pub fn send(&self, message: SyncMessage) -> ClResult<()> {
		self.tx.send(message).map_err(|_| Error::ActorShutdown)
	}

	/// Per-document `pending` observable: true while a local change awaits a
	/// successful flush.
	pub fn pending(&self) -> watch::Receiver<bool> {
		self.pending.clone()
	}
}

/// Per-collection supervisor for sync actors.
pub struct SyncManager {
	collection: Box<str>,
	manager: Arc<DocumentManager>,
	authority: Arc<dyn Authority>,
	storage: Arc<dyn StorageAdapter>,
	gate: Arc<ProtocolGate>,
	signals: Arc<CollectionSignals>,
	config: SyncConfig,
	client: ClientId,
	actors: parking_lot::Mutex<HashMap<Box<str>, SyncActorHandle>>,
}

impl SyncManager {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		collection: impl Into<Box<str>>,
		manager: Arc<DocumentManager>,
		authority: Arc<dyn Authority>,
		storage: Arc<dyn StorageAdapter>,
		gate: Arc<ProtocolGate>,
		signals: Arc<CollectionSignals>,
		config: SyncConfig,
		client: ClientId,
	) -> Self {
		Self {
			collection: collection.into(),
			manager,
			authority,
			storage,
			gate,
			signals,
			config,
			client,
			actors: parking_lot::Mutex::new(HashMap::new()),
		}
	}

	/// Get or spawn the actor for a document.
	pub fn handle(&self, document: &str) -> SyncActorHandle {
		let mut actors = self.actors.lock();
		if let Some(handle) = actors.get(document) {
			if !handle.tx.is_closed() {
				return handle.clone();
			}
		}
		let (tx, rx) = mpsc::unbounded_channel();
		let (pending_tx, pending_rx) = watch::channel(false);
		let ctx = ActorCtx {
			collection: self.collection.clone(),
			document: document.into(),
			manager: Arc::clone(&self.manager),
			authority: Arc::clone(&self.authority),
			storage: Arc::clone(&self.storage),
			gate: Arc::clone(&self.gate),
			signals: Arc::clone(&self.signals),
			config: self.config.clone(),
			client: self.client.clone(),
			pending: pending_tx,
		};
		tokio::spawn(run_actor(rx, ctx));
		let handle = SyncActorHandle { tx, pending: pending_rx };
		actors.insert(document.into(), handle.clone());
		handle
	}

	pub fn notify_local(&self, document: &str) {
		let _ = self.handle(document).send(SyncMessage::LocalChange);
	}

	pub fn notify_external(&self, document: &str) {
		let _ = self.handle(document).send(SyncMessage::ExternalUpdate);
	}

	pub fn notify_flushed(&self, document: &str) {
		let _ = self.handle(document).send(SyncMessage::Flushed);
	}

	pub fn pending(&self, document: &str) -> watch::Receiver<bool> {
		self.handle(document).pending()
	}

	/// Nudge every known actor to flush; used when connectivity returns.
	pub fn flush_all(&self) {
		let actors = self.actors.lock();
		for handle in actors.values() {
			let _ = handle.send(SyncMessage::LocalChange);
		}
	}

	/// Graceful shutdown: every actor drains its inbox and acknowledges.
	pub async fn shutdown_all(&self) {
		let handles: Vec<SyncActorHandle> = {
			let mut actors = self.actors.lock();
			actors.drain().map(|(_, handle)| handle).collect()
		};
		for handle in handles {
			let (ack_tx, ack_rx) = oneshot::channel();
			if handle.send(SyncMessage::Shutdown(ack_tx)).is_ok() {
				let _ = ack_rx.await;
			}
		}
	}
}

impl std::fmt::Debug for SyncManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SyncManager")
			.field("collection", &self.collection)
			.field("actors", &self.actors.lock().len())
			.finish()
	}
}

struct ActorCtx {
	collection: Box<str>,
	document: Box<str>,
	manager: Arc<DocumentManager>,
	authority: Arc<dyn Authority>,
	storage: Arc<dyn StorageAdapter>,
	gate: Arc<ProtocolGate>,
	signals: Arc<CollectionSignals>,
	config: SyncConfig,
	client: ClientId,
	pending: watch::Sender<bool>,
}

impl ActorCtx {
	fn pushed_key(&self) -> String {
		format!("pushed:{}:{}", self.collection, self.document)
	}
}

enum Wake {
	Msg(SyncMessage),
	Fire,
	Closed,
}

async fn run_actor(mut rx: mpsc::UnboundedReceiver<SyncMessage>, ctx: ActorCtx) {
	// Restore the last successfully pushed vector so a restart never re-sends
	// what the authority already has.
	let mut vector: Vec<u8> = kv::get_json::<String>(&ctx.storage, &ctx.pushed_key())
		.await
		.ok()
		.flatten()
		.and_then(|encoded| B64.decode(encoded).ok())
		.unwrap_or_default();
	let mut debounce: Option<Instant> = None;

	loop {
		let wake = match debounce {
			Some(deadline) => tokio::select! {
				msg = rx.recv() => msg.map_or(Wake::Closed, Wake::Msg),
				_ = tokio::time::sleep_until(deadline) => Wake::Fire,
			},
			None => rx.recv().await.map_or(Wake::Closed, Wake::Msg),
		};

		match wake {
			Wake::Closed => break,
			Wake::Fire => {
				debounce = None;
				flush(&ctx, &mut vector).await;
			}
			Wake::Msg(first) => {
				// Accumulate the burst before deciding what to do.
				let mut batch = vec![first];
				let window = tokio::time::sleep(BATCH_ACCUMULATE);
				tokio::pin!(window);
				loop {
					tokio::select! {
						_ = &mut window => break,
						msg = rx.recv() => match msg {
							Some(msg) => batch.push(msg),
							None => break,
						},
					}
				}

				let mut shutdown = None;
				let mut local_change = false;
				let mut advanced = false;
				for msg in batch {
					match msg {
						SyncMessage::Shutdown(ack) => shutdown = Some(ack),
						SyncMessage::LocalChange => local_change = true,
						SyncMessage::ExternalUpdate => advanced = true,
						SyncMessage::Flushed => {
							advanced = true;
							if let Some(current) =
								ctx.manager.encode_state_vector(&ctx.document)
							{
								persist_pushed(&ctx, &current).await;
							}
						}
					}
				}

				if advanced {
					if let Some(current) = ctx.manager.encode_state_vector(&ctx.document) {
						vector = current;
					}
				}
				if let Some(ack) = shutdown {
					// Cancels any outstanding debounce; in-flight RPCs have
					// already drained because flushes are awaited inline.
					let _ = ack.send(());
					break;
				}
				if local_change {
					let _ = ctx.pending.send(true);
					debounce =
						Some(Instant::now() + Duration::from_millis(ctx.config.debounce_ms));
				}
			}
		}
	}
	debug!("sync actor for {}:{} stopped", ctx.collection, ctx.document);
}

/// One serialized flush attempt with retry budget.
async fn flush(ctx: &ActorCtx, vector: &mut Vec<u8>) {
	if let Err(err) = ctx.gate.verify(&ctx.authority).await {
		ctx.signals.report("flush", Some(&ctx.document), err.to_string());
		return;
	}

	let mut attempt: u32 = 0;
	loop {
		let delta = match ctx.manager.encode_update_from(&ctx.document, vector) {
			Ok(delta) => delta,
			Err(err) => {
				ctx.signals.report("flush", Some(&ctx.document), err.to_string());
				return;
			}
		};
		if delta.len() <= EMPTY_UPDATE_LEN {
			let _ = ctx.pending.send(false);
			return;
		}

		let kind = if ctx.manager.is_deleted(&ctx.document) {
			WriteKind::Delete
		} else if vector.is_empty() {
			WriteKind::Insert
		} else {
			WriteKind::Update
		};

		match ctx
			.authority
			.replicate(kind, &ctx.collection, &ctx.document, &delta)
			.await
		{
			Ok(ack) => {
				if let Some(current) = ctx.manager.encode_state_vector(&ctx.document) {
					*vector = current;
				}
				persist_pushed(ctx, vector).await;
				let _ = ctx.pending.send(false);
				ctx.signals.clear();
				// Progress acknowledgment; failures here are harmless.
				let mark = ctx
					.authority
					.mark(MarkArgs {
						collection: ctx.collection.clone(),
						document: ctx.document.clone(),
						client: ctx.client.clone(),
						seq: Some(ack.seq),
						vector: Some(vector.clone()),
					})
					.await;
				if let Err(err) = mark {
					debug!("mark failed for {}:{}: {}", ctx.collection, ctx.document, err);
				}
				return;
			}
			Err(err) if err.is_retriable() && attempt < ctx.config.max_retries => {
				attempt += 1;
				let jitter = rand::rng().random_range(0..BACKOFF_BASE_MS);
				let delay = BACKOFF_BASE_MS * (1 << (attempt - 1)) + jitter;
				debug!(
					"retriable flush failure for {}:{} (attempt {}): {}",
					ctx.collection, ctx.document, attempt, err
				);
				tokio::time::sleep(Duration::from_millis(delay)).await;
			}
			Err(err) => {
				warn!("flush failed for {}:{}: {}", ctx.collection, ctx.document, err);
				ctx.signals.report("replicate", Some(&ctx.document), err.to_string());
				return;
			}
		}
	}
}

async fn persist_pushed(ctx: &ActorCtx, vector: &[u8]) {
	let encoded = B64.encode(vector);
	if let Err(err) = kv::set_json(&ctx.storage, &ctx.pushed_key(), &encoded).await {
		warn!("failed to persist pushed vector for {}: {}", ctx.document, err);
	}
}

// vim: ts=4
