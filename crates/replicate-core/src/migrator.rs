//! Versioned schema migrator.
//!
//! Diffs the schema history between the stored version and the target,
//! generates `ALTER TABLE` statements for the collection's projection table,
//! and records progress in `__replicate_schema`. Kind changes cannot be
//! expressed as generated SQL and require a custom migration. Failures are
//! routed to the host's recovery handler, which decides between resetting
//! local state, keeping the old schema, retrying, or delegating to custom
//! code.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use replicate_types::storage_adapter::{SqlValue, StorageAdapter};
use serde_json::Value;

use crate::kv;
use crate::prelude::*;
use crate::schema::{FieldKind, Schema, Shape};

/// One generated migration operation.
#[derive(Clone, Debug, PartialEq)]
pub enum MigrationOp {
	AddColumn { column: Box<str>, sql_type: &'static str, default: Option<String> },
	RemoveColumn { column: Box<str> },
	ChangeType { column: Box<str>, from: FieldKind, to: FieldKind },
}

/// Diff between two shapes of the same collection.
#[derive(Clone, Debug, Default)]
pub struct MigrationPlan {
	pub ops: Vec<MigrationOp>,
}

impl MigrationPlan {
	/// Backwards-compatible iff every op adds a column with a defined
	/// default.
	pub fn is_backwards_compatible(&self) -> bool {
		self.ops.iter().all(|op| {
			matches!(op, MigrationOp::AddColumn { default: Some(_), .. })
		})
	}

	pub fn requires_custom(&self) -> bool {
		self.ops.iter().any(|op| matches!(op, MigrationOp::ChangeType { .. }))
	}
}

/// Context handed to the host's migration error handler.
#[derive(Debug)]
pub struct MigrationFailure {
	pub error: String,
	pub can_reset_safely: bool,
	pub pending_changes: i64,
	pub last_synced_at: Option<Timestamp>,
}

/// Host decision after a failed migration attempt.
#[derive(Clone)]
pub enum MigrationRecovery {
	/// Clear snapshots/deltas/kv for the collection and stamp the target
	/// version; the store re-seeds from the authority on next sync.
	Reset,
	/// Leave the stored version unchanged; reads and writes keep the old
	/// shape until a later upgrade.
	KeepOldSchema,
	/// Retry the migration immediately.
	Retry,
	/// Delegate to custom code; its success advances the version.
	Custom(Arc<dyn CustomMigration>),
}

pub type MigrationErrorHandler =
	Arc<dyn Fn(&MigrationFailure) -> MigrationRecovery + Send + Sync>;

/// Custom migration step, run instead of generated SQL.
#[async_trait]
pub trait CustomMigration: Send + Sync {
	async fn run(
		&self,
		storage: &Arc<dyn StorageAdapter>,
		from: Option<u32>,
		to: u32,
	) -> ClResult<()>;
}

/// Compute the diff between two shapes.
pub fn diff_shapes(from: &Shape, to: &Shape) -> MigrationPlan {
	let mut ops = Vec::new();
	for field in &to.fields {
		match from.field(&field.name) {
			None => ops.push(MigrationOp::AddColumn {
				column: field.name.clone(),
				sql_type: field.kind.sql_type(),
				default: field.default.as_ref().map(sql_literal),
			}),
			Some(old) if old.kind != field.kind => ops.push(MigrationOp::ChangeType {
				column: field.name.clone(),
				from: old.kind,
				to: field.kind,
			}),
			Some(_) => {}
		}
	}
	for field in &from.fields {
		if to.field(&field.name).is_none() {
			ops.push(MigrationOp::RemoveColumn { column: field.name.clone() });
		}
	}
	MigrationPlan { ops }
}

/// SQL-escape a JSON default into a literal.
fn sql_literal(value: &Value) -> String {
	match value {
		Value::Null => "NULL".to_string(),
		Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
		Value::Number(n) => n.to_string(),
		Value::String(s) => quote(s),
		other => quote(&other.to_string()),
	}
}

fn quote(s: &str) -> String {
	format!("'{}'", s.replace('\'', "''"))
}

pub struct Migrator {
	collection: Box<str>,
	storage: Arc<dyn StorageAdapter>,
	schema: Arc<Schema>,
	custom: HashMap<u32, Arc<dyn CustomMigration>>,
	on_error: Option<MigrationErrorHandler>,
	identifier: Regex,
	/// Serializes migrations per collection.
	lock: tokio::sync::Mutex<()>,
}

impl Migrator {
	pub fn new(
		collection: impl Into<Box<str>>,
		storage: Arc<dyn StorageAdapter>,
		schema: Arc<Schema>,
		custom: HashMap<u32, Arc<dyn CustomMigration>>,
		on_error: Option<MigrationErrorHandler>,
	) -> ClResult<Self> {
		let identifier = Regex::new("^[a-zA-Z_][a-zA-Z0-9_]*$")
			.map_err(|e| Error::Internal(format!("identifier regex: {}", e)))?;
		Ok(Self {
			collection: collection.into(),
			storage,
			schema,
			custom,
			on_error,
			identifier,
			lock: tokio::sync::Mutex::new(()),
		})
	}

	fn check_identifier(&self, name: &str) -> ClResult<()> {
		if self.identifier.is_match(name) {
			Ok(())
		} else {
			Err(Error::ValidationError(format!("unsafe SQL identifier: {:?}", name)))
		}
	}

	/// Render one op as SQL against the collection's projection table.
	fn render(&self, op: &MigrationOp) -> ClResult<String> {
		self.check_identifier(&self.collection)?;
		match op {
			MigrationOp::AddColumn { column, sql_type, default } => {
				self.check_identifier(column)?;
				let default = default.as_deref().unwrap_or("NULL");
				Ok(format!(
					"ALTER TABLE \"{}\" ADD COLUMN \"{}\" {} DEFAULT {}",
					self.collection, column, sql_type, default
				))
			}
			MigrationOp::RemoveColumn { column } => {
				self.check_identifier(column)?;
				Ok(format!("ALTER TABLE \"{}\" DROP COLUMN \"{}\"", self.collection, column))
			}
			MigrationOp::ChangeType { column, from, to } => Err(Error::SchemaMismatch(format!(
				"column '{}' changes kind {:?} -> {:?}; a custom migration is required",
				column, from, to
			))),
		}
	}

	/// Stored version from `__replicate_schema`, `None` on first run.
	pub async fn stored_version(&self) -> ClResult<Option<u32>> {
		self.ensure_schema_table().await?;
		let row = self
			.storage
			.get_row(
				"SELECT version FROM __replicate_schema WHERE collection = ?",
				&[SqlValue::from(&*self.collection)],
			)
			.await?;
		Ok(row
			.and_then(|r| r.first().and_then(SqlValue::as_integer))
			.map(|v| v as u32))
	}

	async fn ensure_schema_table(&self) -> ClResult<()> {
		self.storage
			.exec(
				"CREATE TABLE IF NOT EXISTS __replicate_schema (
					collection text NOT NULL,
					version integer,
					migratedAt integer,
					PRIMARY KEY(collection)
			)",
			)
			.await
	}

	async fn stamp_version(&self, version: u32) -> ClResult<()> {
		self.storage
			.run(
				"INSERT INTO __replicate_schema(collection, version, migratedAt)
				VALUES (?, ?, ?)
				ON CONFLICT(collection) DO UPDATE SET
					version = excluded.version, migratedAt = excluded.migratedAt",
				&[
					SqlValue::from(&*self.collection),
					SqlValue::Integer(i64::from(version)),
					SqlValue::Integer(Timestamp::now().0),
				],
			)
			.await?;
		Ok(())
	}

	async fn create_projection_table(&self, shape: &Shape) -> ClResult<()> {
		self.check_identifier(&self.collection)?;
		let mut columns = vec!["\"id\" TEXT PRIMARY KEY".to_string()];
		for field in &shape.fields {
			self.check_identifier(&field.name)?;
			let default = field
				.default
				.as_ref()
				.map(|d| format!(" DEFAULT {}", sql_literal(d)))
				.unwrap_or_default();
			columns.push(format!("\"{}\" {}{}", field.name, field.kind.sql_type(), default));
		}
		let sql = format!(
			"CREATE TABLE IF NOT EXISTS \"{}\" ({})",
			self.collection,
			columns.join(", ")
		);
		self.storage.exec(&sql).await
	}

	/// Run the upgrade to the schema's target version. Returns the effective
	/// version afterwards — the target, or the old version when the host
	/// handler chose to keep it.
	pub async fn migrate(&self) -> ClResult<u32> {
		let _guard = self.lock.lock().await;
		let target = self.schema.version;
		let stored = self.stored_version().await?;

		match stored {
			None => {
				// First run: seed the projection table from the current shape.
				self.create_projection_table(&self.schema.shape).await?;
				self.stamp_version(target).await?;
				info!("collection {} initialized at schema v{}", self.collection, target);
				Ok(target)
			}
			Some(stored) if stored == target => Ok(target),
			Some(stored) if stored > target => Err(Error::SchemaMismatch(format!(
				"stored schema v{} is newer than target v{}",
				stored, target
			))),
			Some(stored) => self.upgrade(stored, target).await,
		}
	}

	async fn upgrade(&self, from: u32, target: u32) -> ClResult<u32> {
		loop {
			match self.attempt(from, target).await {
				Ok(()) => {
					self.stamp_version(target).await?;
					info!(
						"collection {} migrated v{} -> v{}",
						self.collection, from, target
					);
					return Ok(target);
				}
				Err(err) => {
					warn!(
						"migration of {} from v{} to v{} failed: {}",
						self.collection, from, target, err
					);
					let failure = self.failure_context(&err).await;
					let Some(handler) = &self.on_error else { return Err(err) };
					match handler(&failure) {
						MigrationRecovery::Retry => continue,
						MigrationRecovery::KeepOldSchema => {
							info!(
								"keeping schema v{} for {} after failed upgrade",
								from, self.collection
							);
							return Ok(from);
						}
						MigrationRecovery::Reset => {
							self.reset().await?;
							self.create_projection_table(&self.schema.shape).await?;
							self.stamp_version(target).await?;
							info!(
								"collection {} reset to schema v{}; will re-seed from authority",
								self.collection, target
							);
							return Ok(target);
						}
						MigrationRecovery::Custom(custom) => {
							match custom.run(&self.storage, Some(from), target).await {
								Ok(()) => {
									self.stamp_version(target).await?;
									return Ok(target);
								}
								Err(custom_err) => {
									warn!(
										"custom migration for {} failed: {}",
										self.collection, custom_err
									);
									// Consult the handler again on the next
									// loop iteration.
									continue;
								}
							}
						}
					}
				}
			}
		}
	}

	/// One migration attempt: walk the shape history version by version,
	/// preferring a registered custom step over generated SQL.
	async fn attempt(&self, from: u32, target: u32) -> ClResult<()> {
		for version in (from + 1)..=target {
			if let Some(custom) = self.custom.get(&version) {
				custom.run(&self.storage, Some(version - 1), version).await?;
				continue;
			}
			let previous = self.schema.shape_at(version - 1)?;
			let next = self.schema.shape_at(version)?;
			let plan = diff_shapes(previous, next);
			if plan.requires_custom() {
				return Err(Error::SchemaMismatch(format!(
					"upgrade to v{} changes field kinds and has no custom migration",
					version
				)));
			}
			for op in &plan.ops {
				let sql = self.render(op)?;
				debug!("migration sql: {}", sql);
				self.storage.exec(&sql).await?;
			}
		}
		Ok(())
	}

	async fn failure_context(&self, err: &Error) -> MigrationFailure {
		let prefix = format!("{}:", self.collection);
		let pending = self
			.storage
			.get_row(
				"SELECT count(*) FROM deltas WHERE substr(collection, 1, length(?1)) = ?1",
				&[SqlValue::from(prefix.as_str())],
			)
			.await
			.ok()
			.flatten()
			.and_then(|r| r.first().and_then(SqlValue::as_integer))
			.unwrap_or(0);
		let last_synced_at = kv::get_json::<i64>(
			&self.storage,
			&format!("lastSync:{}", self.collection),
		)
		.await
		.ok()
		.flatten()
		.map(Timestamp);
		MigrationFailure {
			error: err.to_string(),
			can_reset_safely: pending == 0,
			pending_changes: pending,
			last_synced_at,
		}
	}

	/// Clear snapshots, deltas, and kv entries for the collection.
	async fn reset(&self) -> ClResult<()> {
		let prefix = format!("{}:", self.collection);
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
		for key_prefix in ["cursor:", "checkpoint:", "lastSync:", "pushed:"] {
			kv::delete_prefix(&self.storage, &format!("{}{}", key_prefix, self.collection))
				.await?;
		}
		Ok(())
	}
}

impl std::fmt::Debug for Migrator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Migrator")
			.field("collection", &self.collection)
			.field("target", &self.schema.version)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::schema::FieldSpec;
	use serde_json::json;

	fn shape_v1() -> Shape {
		Shape::new(vec![FieldSpec::new("title", FieldKind::Scalar)])
	}

	fn shape_v2() -> Shape {
		Shape::new(vec![
			FieldSpec::new("title", FieldKind::Scalar),
			FieldSpec::new("description", FieldKind::Prose)
				.with_default(json!({"type": "doc", "content": []})),
		])
	}

	#[test]
	fn test_diff_detects_added_column() {
		let plan = diff_shapes(&shape_v1(), &shape_v2());
		assert_eq!(plan.ops.len(), 1);
		assert!(matches!(
			&plan.ops[0],
			MigrationOp::AddColumn { column, sql_type: "TEXT", default: Some(_) }
				if &**column == "description"
		));
		assert!(plan.is_backwards_compatible());
	}

	#[test]
	fn test_diff_detects_removed_column() {
		let plan = diff_shapes(&shape_v2(), &shape_v1());
		assert_eq!(plan.ops.len(), 1);
		assert!(matches!(&plan.ops[0], MigrationOp::RemoveColumn { column } if &**column == "description"));
		assert!(!plan.is_backwards_compatible());
	}

	#[test]
	fn test_diff_flags_kind_change() {
		let from = Shape::new(vec![FieldSpec::new("views", FieldKind::Scalar)]);
		let to = Shape::new(vec![FieldSpec::new("views", FieldKind::Counter)]);
		let plan = diff_shapes(&from, &to);
		assert!(plan.requires_custom());
	}

	#[test]
	fn test_sql_literal_escaping() {
		assert_eq!(sql_literal(&json!("o'brien")), "'o''brien'");
		assert_eq!(sql_literal(&json!(5)), "5");
		assert_eq!(sql_literal(&json!(null)), "NULL");
		assert_eq!(
			sql_literal(&json!({"type": "doc", "content": []})),
			"'{\"type\":\"doc\",\"content\":[]}'"
		);
	}
}

// vim: ts=4
