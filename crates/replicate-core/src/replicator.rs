//! Replicator: one cursor-driven stream consumer per collection.
//!
//! Pulls committed changes from the authority in batches, applies them
//! through the document manager (which makes them WAL-durable), and only then
//! advances the persisted cursor — so the cursor never names ops the local
//! store could lose. Cursor advancement is strictly monotonic; a batch with a
//! lower cursor is dropped and recovery is requested instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use replicate_types::authority::{Authority, ChangeBatch, ChangeType, StreamArgs};
use replicate_types::storage_adapter::StorageAdapter;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::doc::{DocumentManager, ORIGIN_REMOTE};
use crate::handshake::ProtocolGate;
use crate::kv;
use crate::prelude::*;
use crate::signals::CollectionSignals;
use crate::sync::SyncManager;
use crate::transaction::StageIndex;

#[derive(Clone, Debug)]
pub struct ReplicatorConfig {
	/// Max changes per stream batch.
	pub limit: u32,
	/// Idle poll delay once the stream reports no more changes.
	pub poll_interval_ms: u64,
	/// Server-side batching hint forwarded on the stream subscription.
	pub threshold: Option<u32>,
}

impl Default for ReplicatorConfig {
	fn default() -> Self {
		Self { limit: 100, poll_interval_ms: 1000, threshold: None }
	}
}

/// Recovery-decision guard persisted under `checkpoint:<collection>`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Checkpoint {
	last_modified: Timestamp,
}

pub struct Replicator {
	collection: Box<str>,
	manager: Arc<DocumentManager>,
	authority: Arc<dyn Authority>,
	storage: Arc<dyn StorageAdapter>,
	sync: Arc<SyncManager>,
	gate: Arc<ProtocolGate>,
	signals: Arc<CollectionSignals>,
	index: Arc<StageIndex>,
	/// Shared with the document manager for compaction seq stamping.
	cursor_cell: Arc<AtomicI64>,
	config: ReplicatorConfig,
	shutdown: watch::Receiver<bool>,
}

impl Replicator {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		collection: impl Into<Box<str>>,
		manager: Arc<DocumentManager>,
		authority: Arc<dyn Authority>,
		storage: Arc<dyn StorageAdapter>,
		sync: Arc<SyncManager>,
		gate: Arc<ProtocolGate>,
		signals: Arc<CollectionSignals>,
		index: Arc<StageIndex>,
		cursor_cell: Arc<AtomicI64>,
		config: ReplicatorConfig,
		shutdown: watch::Receiver<bool>,
	) -> Self {
		Self {
			collection: collection.into(),
			manager,
			authority,
			storage,
			sync,
			gate,
			signals,
			index,
			cursor_cell,
			config,
			shutdown,
		}
	}

	fn cursor_key(&self) -> String {
		format!("cursor:{}", self.collection)
	}

	fn checkpoint_key(&self) -> String {
		format!("checkpoint:{}", self.collection)
	}

	fn last_sync_key(&self) -> String {
		format!("lastSync:{}", self.collection)
	}

	/// Single-reader stream loop. Runs until the shutdown signal flips.
	pub async fn run(mut self) {
		let mut cursor = Cursor(
			kv::get_json::<i64>(&self.storage, &self.cursor_key())
				.await
				.ok()
				.flatten()
				.unwrap_or(0),
		);
		self.cursor_cell.store(cursor.0, Ordering::Release);
		let mut connected = false;
		let mut failures: u32 = 0;

		loop {
			if *self.shutdown.borrow() {
				break;
			}
			if self.gate.verify(&self.authority).await.is_err() {
				// Protocol mismatch inhibits all sync; the gate already
				// surfaced the message.
				if self.idle(self.config.poll_interval_ms).await {
					break;
				}
				continue;
			}

			let args = StreamArgs {
				collection: self.collection.clone(),
				cursor,
				limit: Some(self.config.limit),
				threshold: self.config.threshold,
			};
			let batch = tokio::select! {
				_ = self.shutdown.changed() => break,
				batch = self.authority.stream(args) => batch,
			};

			let batch = match batch {
				Ok(batch) => batch,
				Err(err) => {
					connected = false;
					failures = failures.saturating_add(1);
					let delay = (self.config.poll_interval_ms * u64::from(failures.min(5)))
						.max(self.config.poll_interval_ms);
					debug!("stream failure for {}: {}", self.collection, err);
					if self.idle(delay).await {
						break;
					}
					continue;
				}
			};
			failures = 0;
			if !connected {
				connected = true;
				// Connectivity is back: nudge every actor so offline commits
				// drain to the authority.
				self.sync.flush_all();
			}

			if batch.cursor < cursor {
				warn!(
					"server cursor {} behind local {} for {}; requesting recovery",
					batch.cursor, cursor, self.collection
				);
				if let Some(recovered) = self.recover().await {
					cursor = cursor.max(recovered);
					self.persist_cursor(cursor).await;
				}
				continue;
			}

			match self.apply_batch(&batch).await {
				Ok(()) => {
					cursor = batch.cursor;
					self.persist_cursor(cursor).await;
				}
				Err(err) => {
					// Reconciliation faults are logged; the next batch
					// retries from the unadvanced cursor.
					warn!("failed to apply batch for {}: {}", self.collection, err);
					self.signals.report("stream", None, err.to_string());
					if self.idle(self.config.poll_interval_ms).await {
						break;
					}
					continue;
				}
			}

			if let Some(compact) = &batch.compact {
				if !compact.documents.is_empty() {
					debug!(
						"authority truncated history for {} documents of {}",
						compact.documents.len(),
						self.collection
					);
					if let Some(recovered) = self.recover().await {
						cursor = cursor.max(recovered);
						self.persist_cursor(cursor).await;
					}
				}
			}

			if let Some(live) = &batch.materialize {
				if let Err(err) = self.reconcile(live).await {
					warn!("reconciliation failed for {}: {}", self.collection, err);
					self.signals.report("reconcile", None, err.to_string());
				}
			}

			if !batch.more && self.idle(self.config.poll_interval_ms).await {
				break;
			}
		}
		debug!("replicator for {} stopped", self.collection);
	}

	/// Apply one batch; cursor advances only after every change is durable in
	/// the WAL (`apply_update` awaits the WAL insert).
	async fn apply_batch(&self, batch: &ChangeBatch) -> ClResult<()> {
		for change in &batch.changes {
			if self.index.is_document_being_deleted(&change.document) {
				debug!(
					"skipping streamed change for {}:{}: deletion staged locally",
					self.collection, change.document
				);
				continue;
			}
			match change.change_type {
				ChangeType::Snapshot => {
					self.manager.apply_snapshot(&change.document, &change.bytes).await?;
					// Make the authority snapshot the stored snapshot too, so
					// a reload cannot resurrect pre-snapshot local state.
					self.manager.compact_document(&change.document).await?;
				}
				ChangeType::Delta => {
					self.manager.apply_update(&change.document, &change.bytes, ORIGIN_REMOTE).await?;
				}
			}
			self.sync.notify_external(&change.document);
		}
		Ok(())
	}

	async fn persist_cursor(&self, cursor: Cursor) {
		self.cursor_cell.store(cursor.0, Ordering::Release);
		if let Err(err) = kv::set_json(&self.storage, &self.cursor_key(), &cursor.0).await {
			warn!("failed to persist cursor for {}: {}", self.collection, err);
			return;
		}
		let now = Timestamp::now();
		let _ = kv::set_json(
			&self.storage,
			&self.checkpoint_key(),
			&Checkpoint { last_modified: now },
		)
		.await;
		let _ = kv::set_json(&self.storage, &self.last_sync_key(), &now.0).await;
	}

	/// Ask the authority for everything we are missing, bounded by the
	/// aggregate state vector. Returns the server-named resume cursor.
	async fn recover(&self) -> Option<Cursor> {
		let vector = match self.manager.aggregate_vector() {
			Ok(vector) => vector,
			Err(err) => {
				warn!("cannot encode aggregate vector for {}: {}", self.collection, err);
				return None;
			}
		};
		match self.authority.recovery(&self.collection, &vector).await {
			Ok(diff) => {
				if let Some(bytes) = &diff.diff {
					if let Err(err) = self.manager.apply_recovery_diff(bytes).await {
						warn!("failed to apply recovery diff for {}: {}", self.collection, err);
						self.signals.report("recovery", None, err.to_string());
						return None;
					}
				}
				for id in self.manager.list_documents() {
					self.sync.notify_external(&id);
				}
				diff.cursor
			}
			Err(err) => {
				warn!("recovery failed for {}: {}", self.collection, err);
				self.signals.report("recovery", None, err.to_string());
				None
			}
		}
	}

	/// Phantom-document reconciliation: soft-delete local documents the
	/// authority no longer lists.
	async fn reconcile(&self, live: &[Box<str>]) -> ClResult<()> {
		for id in self.manager.list_documents() {
			if live.contains(&id) {
				continue;
			}
			if self.index.is_document_being_modified(&id)
				|| self.index.is_document_being_deleted(&id)
			{
				continue;
			}
			if self.manager.is_deleted(&id) {
				continue;
			}
			debug!("reconciling phantom document {}:{}", self.collection, id);
			self.manager.mark_deleted_remote(&id).await?;
		}
		Ok(())
	}

	/// Sleep unless shutdown arrives first; returns true on shutdown.
	async fn idle(&mut self, ms: u64) -> bool {
		tokio::select! {
			_ = self.shutdown.changed() => true,
			_ = tokio::time::sleep(Duration::from_millis(ms)) => *self.shutdown.borrow(),
		}
	}
}

impl std::fmt::Debug for Replicator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Replicator").field("collection", &self.collection).finish()
	}
}

// vim: ts=4
