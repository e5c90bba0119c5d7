//! Schema migration scenarios against real storage.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use common::{MockAuthority, open_collection_with_storage};
use replicate_core::migrator::{
	CustomMigration, MigrationErrorHandler, MigrationRecovery, Migrator,
};
use replicate_core::storage_adapter::{SqlValue, StorageAdapter};
use replicate_core::{ClResult, FieldKind, FieldSpec, Schema, Shape};
use replicate_storage_adapter_sqlite::SqliteStorageAdapter;

fn intervals_v1() -> Shape {
	Shape::new(vec![FieldSpec::new("title", FieldKind::Scalar)])
}

fn intervals_v2() -> Schema {
	Schema::new(
		2,
		Shape::new(vec![
			FieldSpec::new("title", FieldKind::Scalar),
			FieldSpec::new("description", FieldKind::Prose)
				.with_default(json!({"type": "doc", "content": []})),
		]),
	)
	.with_history(1, intervals_v1())
}

async fn storage() -> Arc<dyn StorageAdapter> {
	Arc::new(SqliteStorageAdapter::new_in_memory().await.expect("storage"))
}

async fn stored_version(storage: &Arc<dyn StorageAdapter>, collection: &str) -> Option<i64> {
	storage
		.get_row(
			"SELECT version FROM __replicate_schema WHERE collection = ?",
			&[SqlValue::from(collection)],
		)
		.await
		.expect("schema row")
		.and_then(|r| r.first().and_then(SqlValue::as_integer))
}

#[tokio::test]
async fn test_v1_to_v2_generates_add_column_with_default() {
	let storage = storage().await;

	// Seed the store at v1
	let v1 = Migrator::new(
		"intervals",
		Arc::clone(&storage),
		Arc::new(Schema::new(1, intervals_v1())),
		HashMap::new(),
		None,
	)
	.expect("migrator");
	assert_eq!(v1.migrate().await.expect("initial migration"), 1);
	assert_eq!(stored_version(&storage, "intervals").await, Some(1));

	// Upgrade to v2: one backwards-compatible ADD COLUMN with the prose
	// default
	let v2 = Migrator::new(
		"intervals",
		Arc::clone(&storage),
		Arc::new(intervals_v2()),
		HashMap::new(),
		None,
	)
	.expect("migrator");
	assert_eq!(v2.migrate().await.expect("upgrade"), 2);
	assert_eq!(stored_version(&storage, "intervals").await, Some(2));

	let table_sql = storage
		.get_row(
			"SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'intervals'",
			&[],
		)
		.await
		.expect("table sql")
		.and_then(|r| r.first().and_then(|v| v.as_text().map(str::to_string)))
		.expect("intervals table exists");
	assert!(table_sql.contains("\"description\" TEXT"));
	assert!(table_sql.contains("{\"type\":\"doc\",\"content\":[]}"));
}

#[tokio::test]
async fn test_kind_change_requires_custom_migration() {
	let storage = storage().await;

	let v1_shape = Shape::new(vec![FieldSpec::new("views", FieldKind::Scalar)]);
	let seed = Migrator::new(
		"stats",
		Arc::clone(&storage),
		Arc::new(Schema::new(1, v1_shape.clone())),
		HashMap::new(),
		None,
	)
	.expect("migrator");
	seed.migrate().await.expect("seed");

	let v2 = Schema::new(2, Shape::new(vec![FieldSpec::new("views", FieldKind::Counter)]))
		.with_history(1, v1_shape);

	// Without a handler the kind change is a hard error
	let failing =
		Migrator::new("stats", Arc::clone(&storage), Arc::new(v2.clone()), HashMap::new(), None)
			.expect("migrator");
	assert!(failing.migrate().await.is_err());
	assert_eq!(stored_version(&storage, "stats").await, Some(1));

	// A handler choosing to keep the old schema leaves the version in place
	let keep: MigrationErrorHandler = Arc::new(|failure| {
		assert!(failure.error.contains("custom"));
		MigrationRecovery::KeepOldSchema
	});
	let kept = Migrator::new(
		"stats",
		Arc::clone(&storage),
		Arc::new(v2.clone()),
		HashMap::new(),
		Some(keep),
	)
	.expect("migrator");
	assert_eq!(kept.migrate().await.expect("keep old"), 1);
	assert_eq!(stored_version(&storage, "stats").await, Some(1));

	// A registered custom step for v2 performs the change and advances
	#[derive(Debug)]
	struct RebuildViews;

	#[async_trait::async_trait]
	impl CustomMigration for RebuildViews {
		async fn run(
			&self,
			storage: &Arc<dyn StorageAdapter>,
			_from: Option<u32>,
			_to: u32,
		) -> ClResult<()> {
			storage.exec("ALTER TABLE \"stats\" DROP COLUMN \"views\"").await?;
			storage
				.exec("ALTER TABLE \"stats\" ADD COLUMN \"views\" INTEGER DEFAULT 0")
				.await?;
			Ok(())
		}
	}

	let mut custom: HashMap<u32, Arc<dyn CustomMigration>> = HashMap::new();
	custom.insert(2, Arc::new(RebuildViews));
	let fixed = Migrator::new("stats", Arc::clone(&storage), Arc::new(v2), custom, None)
		.expect("migrator");
	assert_eq!(fixed.migrate().await.expect("custom upgrade"), 2);
	assert_eq!(stored_version(&storage, "stats").await, Some(2));
}

#[tokio::test]
async fn test_reset_recovery_clears_collection_state() {
	let storage = storage().await;

	// Seed v1 plus some pending local state
	let seed = Migrator::new(
		"notes",
		Arc::clone(&storage),
		Arc::new(Schema::new(1, Shape::new(vec![FieldSpec::new("views", FieldKind::Scalar)]))),
		HashMap::new(),
		None,
	)
	.expect("migrator");
	seed.migrate().await.expect("seed");
	storage
		.run(
			"INSERT INTO deltas(collection, data) VALUES (?, ?)",
			&[SqlValue::from("notes:a"), SqlValue::from(vec![1u8, 2, 3])],
		)
		.await
		.expect("seed delta");
	storage
		.run(
			"INSERT INTO kv(key, value) VALUES (?, ?)",
			&[SqlValue::from("cursor:notes"), SqlValue::from("9")],
		)
		.await
		.expect("seed cursor");

	let v2 = Schema::new(2, Shape::new(vec![FieldSpec::new("views", FieldKind::Counter)]))
		.with_history(1, Shape::new(vec![FieldSpec::new("views", FieldKind::Scalar)]));

	let reset: MigrationErrorHandler = Arc::new(|failure| {
		// Pending local rows make a reset lossy; the handler sees that.
		assert!(!failure.can_reset_safely);
		assert_eq!(failure.pending_changes, 1);
		MigrationRecovery::Reset
	});
	let migrator =
		Migrator::new("notes", Arc::clone(&storage), Arc::new(v2), HashMap::new(), Some(reset))
			.expect("migrator");
	assert_eq!(migrator.migrate().await.expect("reset"), 2);
	assert_eq!(stored_version(&storage, "notes").await, Some(2));

	let deltas = storage
		.get_row("SELECT count(*) FROM deltas WHERE collection = ?", &[SqlValue::from("notes:a")])
		.await
		.expect("count")
		.and_then(|r| r.first().and_then(SqlValue::as_integer));
	assert_eq!(deltas, Some(0));
	let cursor = storage
		.get_row("SELECT value FROM kv WHERE key = ?", &[SqlValue::from("cursor:notes")])
		.await
		.expect("cursor row");
	assert!(cursor.is_none());
}

#[tokio::test]
async fn test_collection_open_gates_on_migration() {
	// A collection opened with a v2 schema over a v1 store migrates before
	// any document machinery starts.
	let authority = MockAuthority::new();
	let storage = storage().await;

	let seed = Migrator::new(
		"intervals",
		Arc::clone(&storage),
		Arc::new(Schema::new(1, intervals_v1())),
		HashMap::new(),
		None,
	)
	.expect("migrator");
	seed.migrate().await.expect("seed");

	let collection = open_collection_with_storage(
		"intervals",
		intervals_v2(),
		authority,
		Arc::clone(&storage),
	)
	.await;
	assert_eq!(collection.schema_version(), 2);
	assert_eq!(stored_version(&storage, "intervals").await, Some(2));
	collection.close().await;
}

// vim: ts=4
