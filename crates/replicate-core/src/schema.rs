//! Versioned schema descriptors.
//!
//! A schema names the fields of a collection, their CRDT kinds, and optional
//! defaults, plus the full shape history the migrator diffs against.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::fields::RegisterEntry;
use crate::prelude::*;

/// Resolver for multi-value registers: picks the winning entry. The default
/// picks the highest timestamp, breaking ties by lexicographic client id.
pub type RegisterResolver = Arc<dyn Fn(&[RegisterEntry]) -> Option<Value> + Send + Sync>;

/// CRDT kind of one field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
	/// Last-writer-wins scalar (a register with the default resolver).
	Scalar,
	Counter,
	Register,
	Set,
	Prose,
}

impl FieldKind {
	/// SQL column type for the collection's projection table.
	pub fn sql_type(&self) -> &'static str {
		match self {
			FieldKind::Counter => "INTEGER",
			_ => "TEXT",
		}
	}
}

/// One field of a collection shape.
#[derive(Clone)]
pub struct FieldSpec {
	pub name: Box<str>,
	pub kind: FieldKind,
	/// Default value, used both for reads of absent fields and for generated
	/// `ADD COLUMN ... DEFAULT` migrations.
	pub default: Option<Value>,
	/// Register resolver override; `None` means latest-wins.
	pub resolver: Option<RegisterResolver>,
}

impl std::fmt::Debug for FieldSpec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FieldSpec")
			.field("name", &self.name)
			.field("kind", &self.kind)
			.field("default", &self.default)
			.field("resolver", &self.resolver.as_ref().map(|_| "fn"))
			.finish()
	}
}

impl FieldSpec {
	pub fn new(name: impl Into<Box<str>>, kind: FieldKind) -> Self {
		Self { name: name.into(), kind, default: None, resolver: None }
	}

	pub fn with_default(mut self, default: Value) -> Self {
		self.default = Some(default);
		self
	}

	pub fn with_resolver(mut self, resolver: RegisterResolver) -> Self {
		self.resolver = Some(resolver);
		self
	}
}

/// The field list of one schema version.
#[derive(Clone, Debug, Default)]
pub struct Shape {
	pub fields: Vec<FieldSpec>,
}

impl Shape {
	pub fn new(fields: Vec<FieldSpec>) -> Self {
		Self { fields }
	}

	pub fn field(&self, name: &str) -> Option<&FieldSpec> {
		self.fields.iter().find(|f| &*f.name == name)
	}
}

/// Versioned schema descriptor for one collection.
#[derive(Clone, Debug)]
pub struct Schema {
	pub version: u32,
	pub shape: Shape,
	/// Shape per historical version; must contain `version` itself.
	pub history: BTreeMap<u32, Shape>,
}

impl Schema {
	pub fn new(version: u32, shape: Shape) -> Self {
		let mut history = BTreeMap::new();
		history.insert(version, shape.clone());
		Self { version, shape, history }
	}

	pub fn with_history(mut self, version: u32, shape: Shape) -> Self {
		self.history.insert(version, shape);
		self
	}

	pub fn shape_at(&self, version: u32) -> ClResult<&Shape> {
		self.history.get(&version).ok_or_else(|| {
			Error::SchemaMismatch(format!("no shape recorded for version {}", version))
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_shape_lookup() {
		let shape = Shape::new(vec![
			FieldSpec::new("title", FieldKind::Scalar),
			FieldSpec::new("views", FieldKind::Counter),
		]);
		assert_eq!(shape.field("views").map(|f| f.kind), Some(FieldKind::Counter));
		assert!(shape.field("missing").is_none());
	}

	#[test]
	fn test_history_contains_current_version() {
		let schema = Schema::new(2, Shape::default())
			.with_history(1, Shape::new(vec![FieldSpec::new("title", FieldKind::Scalar)]));
		assert!(schema.shape_at(2).is_ok());
		assert!(schema.shape_at(1).is_ok());
		assert!(schema.shape_at(3).is_err());
	}

	#[test]
	fn test_sql_types() {
		assert_eq!(FieldKind::Counter.sql_type(), "INTEGER");
		assert_eq!(FieldKind::Prose.sql_type(), "TEXT");
		let spec = FieldSpec::new("description", FieldKind::Prose)
			.with_default(json!({"type": "doc", "content": []}));
		assert!(spec.default.is_some());
	}
}

// vim: ts=4
