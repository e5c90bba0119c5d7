//! Register fields: one entry per writing client, resolved to a single value
//! on read. The default resolver is latest-wins with ties broken by
//! lexicographic client id; schemas may install their own resolver.

use std::collections::HashMap;

use serde_json::Value;
use yrs::{Any, Map, MapRef, Out, TransactionMut};

use super::{any_to_json, existing_map, json_to_any, nested_map};
use crate::prelude::*;
use crate::schema::RegisterResolver;

/// One client's register entry.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterEntry {
	pub client: Box<str>,
	pub value: Value,
	pub ts: Timestamp,
}

/// Write this client's entry, replacing its previous one.
pub fn write(
	txn: &mut TransactionMut<'_>,
	fields: &MapRef,
	name: &str,
	client: &ClientId,
	value: &Value,
	ts: Timestamp,
) {
	let entries = nested_map(txn, fields, name);
	let mut entry = HashMap::new();
	entry.insert("value".to_string(), json_to_any(value));
	entry.insert("ts".to_string(), Any::BigInt(ts.0));
	entries.insert(txn, client.as_str(), Any::from(entry));
}

/// Collect all entries, sorted by client id for deterministic resolution.
pub fn entries(txn: &impl yrs::ReadTxn, fields: &MapRef, name: &str) -> Vec<RegisterEntry> {
	let Some(map) = existing_map(txn, fields, name) else {
		return Vec::new();
	};
	let mut out = Vec::new();
	for (client, value) in map.iter(txn) {
		if let Out::Any(Any::Map(entry)) = value {
			let ts = match entry.get("ts") {
				Some(Any::BigInt(ts)) => Timestamp(*ts),
				Some(Any::Number(ts)) => Timestamp(*ts as i64),
				_ => Timestamp(0),
			};
			let value = entry.get("value").map(any_to_json).unwrap_or(Value::Null);
			out.push(RegisterEntry { client: client.into(), value, ts });
		}
	}
	out.sort_by(|a, b| a.client.cmp(&b.client));
	out
}

/// Resolve the register to its winning value.
pub fn read(
	txn: &impl yrs::ReadTxn,
	fields: &MapRef,
	name: &str,
	resolver: Option<&RegisterResolver>,
) -> Option<Value> {
	let entries = entries(txn, fields, name);
	if entries.is_empty() {
		return None;
	}
	match resolver {
		Some(resolver) => resolver(&entries),
		None => default_resolver(&entries),
	}
}

/// Latest-wins: highest timestamp, ties broken by lexicographic client id.
pub fn default_resolver(entries: &[RegisterEntry]) -> Option<Value> {
	entries
		.iter()
		.max_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.client.cmp(&b.client)))
		.map(|entry| entry.value.clone())
}


// vim: ts=4
