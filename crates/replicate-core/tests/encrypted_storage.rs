//! Engine durability over encrypted storage: the documented composition of
//! the engine on top of the AEAD wrapper, across a full close-and-reopen
//! cycle (provision → write → lock → unlock → reload).

mod common;

use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use common::MockAuthority;
use replicate_core::authority::Authority;
use replicate_core::storage_adapter::StorageAdapter;
use replicate_core::{
	Collection, CollectionConfig, FieldKind, FieldSpec, FieldWrite, Schema, Shape,
};
use replicate_storage_adapter_encrypt::{EncryptConfig, EncryptedStorageAdapter, EncryptionState};
use replicate_storage_adapter_sqlite::{AdapterConfig, SqliteStorageAdapter};
use tempfile::TempDir;

fn note_schema() -> Schema {
	Schema::new(
		1,
		Shape::new(vec![
			FieldSpec::new("title", FieldKind::Scalar),
			FieldSpec::new("views", FieldKind::Counter),
			FieldSpec::new("tags", FieldKind::Set),
		]),
	)
}

async fn sealed_storage(
	path: &Path,
) -> Arc<EncryptedStorageAdapter<SqliteStorageAdapter>> {
	let inner = SqliteStorageAdapter::new(path, AdapterConfig::default()).await.expect("inner");
	Arc::new(
		EncryptedStorageAdapter::new(inner, EncryptConfig::default()).await.expect("wrapper"),
	)
}

async fn open_over(
	authority: Arc<MockAuthority>,
	storage: Arc<dyn StorageAdapter>,
	threshold: u32,
) -> Arc<Collection> {
	let mut config = CollectionConfig::new(
		"notes",
		Arc::new(note_schema()),
		storage,
		authority as Arc<dyn Authority>,
	);
	config.sync.debounce_ms = 10;
	config.replicator.poll_interval_ms = 25;
	config.compaction.threshold = threshold;
	Collection::open(config).await.expect("collection open")
}

#[tokio::test]
async fn test_reopen_after_lock_reloads_documents() {
	let authority = MockAuthority::new();
	authority.set_offline(true);

	let temp_dir = TempDir::new().expect("temp dir");
	let db_path = temp_dir.path().join("sealed.db");

	// First run: provision, write two documents, leave pending deltas in the
	// WAL, close everything.
	let before = {
		let wrapper = sealed_storage(&db_path).await;
		wrapper.enable().expect("enable");
		wrapper.provision_passphrase("correct horse").await.expect("provision");

		let storage: Arc<dyn StorageAdapter> = wrapper.clone();
		let collection = open_over(authority.clone(), storage, 50).await;

		collection
			.insert("a", &json!({"id": "a", "title": "sealed note", "tags": ["secret"]}))
			.await
			.expect("insert a");
		collection
			.insert("b", &json!({"id": "b", "title": "second note"}))
			.await
			.expect("insert b");
		collection
			.mutate("a", vec![FieldWrite::Increment { field: "views".into(), by: 3 }])
			.await
			.expect("increment");

		let before = (collection.get("a").expect("read a"), collection.get("b").expect("read b"));
		collection.close().await;
		wrapper.close().await.expect("close wrapper");
		before
	};

	// Second run: reopen locked, unlock, reload through the WAL replay path.
	let wrapper = sealed_storage(&db_path).await;
	assert_eq!(wrapper.state(), EncryptionState::Locked);
	wrapper.unlock_passphrase("correct horse").await.expect("unlock");

	let storage: Arc<dyn StorageAdapter> = wrapper.clone();
	let reopened = open_over(authority.clone(), storage, 50).await;

	assert_eq!(reopened.get("a").expect("a survives reopen"), before.0);
	assert_eq!(reopened.get("b").expect("b survives reopen"), before.1);
	assert_eq!(before.0["views"], json!(3));

	reopened.close().await;
	wrapper.close().await.expect("close wrapper");
}

#[tokio::test]
async fn test_reopen_reloads_snapshot_and_tail_under_encryption() {
	let authority = MockAuthority::new();
	authority.set_offline(true);

	let temp_dir = TempDir::new().expect("temp dir");
	let db_path = temp_dir.path().join("compacted.db");

	// Low threshold so the run compacts into an encrypted snapshot row and
	// leaves an encrypted delta tail behind it.
	let before = {
		let wrapper = sealed_storage(&db_path).await;
		wrapper.enable().expect("enable");
		wrapper.provision_passphrase("pw").await.expect("provision");

		let storage: Arc<dyn StorageAdapter> = wrapper.clone();
		let collection = open_over(authority.clone(), storage, 3).await;

		collection
			.insert("x", &json!({"id": "x", "title": "busy"}))
			.await
			.expect("insert");
		for _ in 0..4 {
			collection
				.mutate("x", vec![FieldWrite::Increment { field: "views".into(), by: 1 }])
				.await
				.expect("increment");
		}

		let before = collection.get("x").expect("read");
		assert_eq!(before["views"], json!(4));
		collection.close().await;
		wrapper.close().await.expect("close wrapper");
		before
	};

	let wrapper = sealed_storage(&db_path).await;
	wrapper.unlock_passphrase("pw").await.expect("unlock");

	let storage: Arc<dyn StorageAdapter> = wrapper.clone();
	let reopened = open_over(authority, storage, 3).await;
	assert_eq!(reopened.get("x").expect("read after reopen"), before);

	reopened.close().await;
	wrapper.close().await.expect("close wrapper");
}

// vim: ts=4
