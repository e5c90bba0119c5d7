//! Helpers over the storage adapter's `kv` table: stringified JSON metadata
//! (cursors, checkpoints, sync timestamps).

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use replicate_types::storage_adapter::{SqlValue, StorageAdapter};

use crate::prelude::*;

pub(crate) async fn get_json<T: DeserializeOwned>(
	storage: &Arc<dyn StorageAdapter>,
	key: &str,
) -> ClResult<Option<T>> {
	let row = storage
		.get_row("SELECT value FROM kv WHERE key = ?", &[SqlValue::from(key)])
		.await?;
	match row.as_ref().and_then(|r| r.first()).and_then(SqlValue::as_text) {
		Some(text) => Ok(Some(serde_json::from_str(text)?)),
		None => Ok(None),
	}
}

pub(crate) async fn set_json<T: Serialize>(
	storage: &Arc<dyn StorageAdapter>,
	key: &str,
	value: &T,
) -> ClResult<()> {
	let text = serde_json::to_string(value)?;
	storage
		.run(
			"INSERT INTO kv(key, value) VALUES (?, ?)
			ON CONFLICT(key) DO UPDATE SET value = excluded.value",
			&[SqlValue::from(key), SqlValue::from(text)],
		)
		.await?;
	Ok(())
}

pub(crate) async fn delete_prefix(
	storage: &Arc<dyn StorageAdapter>,
	prefix: &str,
) -> ClResult<()> {
	storage
		.run(
			"DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
			&[SqlValue::from(prefix)],
		)
		.await?;
	Ok(())
}

// vim: ts=4
