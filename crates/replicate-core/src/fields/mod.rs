//! CRDT field kinds.
//!
//! Every document field is one of the kinds in `schema::FieldKind`; dispatch
//! is an exhaustive match over the tagged kind — no runtime introspection on
//! field values. All kinds share the document's single op log, so deltas and
//! snapshots encode them uniformly and re-application of already-seen ops is
//! a no-op.

pub mod counter;
pub mod prose;
pub mod register;
pub mod set;

use std::collections::HashMap;

use serde_json::Value;
use yrs::{Any, ArrayPrelim, ArrayRef, Map, MapPrelim, MapRef, Out, TransactionMut};

use crate::doc::DocHandle;
use crate::prelude::*;
use crate::schema::{FieldKind, FieldSpec};

pub use register::RegisterEntry;

/// One staged write against a document field.
#[derive(Clone, Debug)]
pub enum FieldWrite {
	/// Scalar/register write (last-writer-wins through the resolver).
	Set { field: Box<str>, value: Value },
	/// Counter increment; negative deltas allowed.
	Increment { field: Box<str>, by: i64 },
	/// Add-wins set insertion.
	SetAdd { field: Box<str>, member: Value },
	/// Add-wins set removal; wins only when strictly later than the add.
	SetRemove { field: Box<str>, member: Value },
	/// Replace a prose field from a ProseMirror-style JSON tree.
	ProseReplace { field: Box<str>, doc: Value },
}

impl FieldWrite {
	pub fn field(&self) -> &str {
		match self {
			FieldWrite::Set { field, .. }
			| FieldWrite::Increment { field, .. }
			| FieldWrite::SetAdd { field, .. }
			| FieldWrite::SetRemove { field, .. }
			| FieldWrite::ProseReplace { field, .. } => field,
		}
	}
}

/// Apply one write to a document inside an open CRDT transaction.
pub fn apply_write(
	txn: &mut TransactionMut<'_>,
	handle: &DocHandle,
	spec: &FieldSpec,
	write: &FieldWrite,
	client: &ClientId,
	now: Timestamp,
) -> ClResult<()> {
	match (spec.kind, write) {
		(FieldKind::Scalar | FieldKind::Register, FieldWrite::Set { field, value }) => {
			register::write(txn, &handle.fields, field, client, value, now);
			Ok(())
		}
		(FieldKind::Counter, FieldWrite::Increment { field, by }) => {
			counter::increment(txn, &handle.fields, field, client, *by, now);
			Ok(())
		}
		(FieldKind::Set, FieldWrite::SetAdd { field, member }) => {
			set::add(txn, &handle.fields, field, client, member, now)
		}
		(FieldKind::Set, FieldWrite::SetRemove { field, member }) => {
			set::remove(txn, &handle.fields, field, member, now)
		}
		(FieldKind::Prose, FieldWrite::ProseReplace { field, doc }) => {
			let fragment = handle.prose.get(field.as_ref()).ok_or_else(|| {
				Error::Internal(format!("prose fragment missing for field {}", field))
			})?;
			prose::replace(txn, fragment, doc)
		}
		(kind, write) => Err(Error::ValidationError(format!(
			"write {:?} does not match field '{}' of kind {:?}",
			write,
			spec.name,
			kind
		))),
	}
}

/// Read one field's merged value.
pub fn read_field(
	txn: &impl yrs::ReadTxn,
	handle: &DocHandle,
	spec: &FieldSpec,
) -> Option<Value> {
	let value = match spec.kind {
		FieldKind::Scalar | FieldKind::Register => {
			register::read(txn, &handle.fields, &spec.name, spec.resolver.as_ref())
		}
		FieldKind::Counter => Some(Value::from(counter::value(txn, &handle.fields, &spec.name))),
		FieldKind::Set => Some(Value::Array(set::members(txn, &handle.fields, &spec.name))),
		FieldKind::Prose => handle
			.prose
			.get(spec.name.as_ref())
			.map(|fragment| prose::to_json(txn, fragment)),
	};
	value.or_else(|| spec.default.clone())
}

// JSON <-> Any conversion //
//*************************//

pub(crate) fn json_to_any(value: &Value) -> Any {
	match value {
		Value::Null => Any::Null,
		Value::Bool(b) => Any::Bool(*b),
		Value::Number(n) => match n.as_i64() {
			Some(i) => Any::BigInt(i),
			None => Any::Number(n.as_f64().unwrap_or(0.0)),
		},
		Value::String(s) => Any::from(s.as_str()),
		Value::Array(items) => Any::from(items.iter().map(json_to_any).collect::<Vec<_>>()),
		Value::Object(map) => Any::from(
			map.iter().map(|(k, v)| (k.clone(), json_to_any(v))).collect::<HashMap<_, _>>(),
		),
	}
}

pub(crate) fn any_to_json(value: &Any) -> Value {
	match value {
		Any::Null | Any::Undefined => Value::Null,
		Any::Bool(b) => Value::Bool(*b),
		Any::Number(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
		Any::BigInt(i) => Value::from(*i),
		Any::String(s) => Value::String(s.to_string()),
		Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
		Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
		Any::Map(map) => Value::Object(
			map.iter().map(|(k, v)| (k.clone(), any_to_json(v))).collect(),
		),
	}
}

// Nested container helpers //
//**************************//

pub(crate) fn nested_array(
	txn: &mut TransactionMut<'_>,
	fields: &MapRef,
	name: &str,
) -> ArrayRef {
	match fields.get(txn, name) {
		Some(Out::YArray(array)) => array,
		_ => fields.insert(txn, name, ArrayPrelim::default()),
	}
}

pub(crate) fn nested_map(txn: &mut TransactionMut<'_>, fields: &MapRef, name: &str) -> MapRef {
	match fields.get(txn, name) {
		Some(Out::YMap(map)) => map,
		_ => fields.insert(txn, name, MapPrelim::default()),
	}
}

pub(crate) fn existing_map(
	txn: &impl yrs::ReadTxn,
	fields: &MapRef,
	name: &str,
) -> Option<MapRef> {
	match fields.get(txn, name) {
		Some(Out::YMap(map)) => Some(map),
		_ => None,
	}
}

pub(crate) fn existing_array(
	txn: &impl yrs::ReadTxn,
	fields: &MapRef,
	name: &str,
) -> Option<ArrayRef> {
	match fields.get(txn, name) {
		Some(Out::YArray(array)) => Some(array),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_json_any_roundtrip() {
		let value = json!({
			"title": "Hi",
			"count": 3,
			"ratio": 0.5,
			"done": false,
			"tags": ["a", "b"],
			"nested": {"x": null}
		});
		let back = any_to_json(&json_to_any(&value));
		assert_eq!(back, value);
	}

	#[test]
	fn test_integers_survive_as_integers() {
		let any = json_to_any(&json!(42));
		assert!(matches!(any, Any::BigInt(42)));
	}
}

// vim: ts=4
