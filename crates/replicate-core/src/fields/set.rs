//! Add-wins set fields: a map from the JSON-encoded member to add/remove
//! timestamps. A remove is effective only when its timestamp strictly exceeds
//! the last add, so a concurrent add defeats a prior remove.
//!
//! Adds and removes write disjoint keys of the per-member entry map
//! (`addedBy`/`addedAt` vs `removedAt`); concurrent operations therefore both
//! survive the merge and the timestamp comparison decides membership.

use serde_json::Value;
use yrs::{Any, Map, MapRef, Out, TransactionMut};

use super::{existing_map, nested_map};
use crate::prelude::*;

/// Add a member: stamp `addedBy`/`addedAt`, leaving any concurrent remove
/// stamp in place for the timestamp comparison.
pub fn add(
	txn: &mut TransactionMut<'_>,
	fields: &MapRef,
	name: &str,
	client: &ClientId,
	member: &Value,
	ts: Timestamp,
) -> ClResult<()> {
	let key = member_key(member)?;
	let set = nested_map(txn, fields, name);
	let entry = match set.get(txn, &key) {
		Some(Out::YMap(entry)) => entry,
		_ => set.insert(txn, key.as_str(), yrs::MapPrelim::default()),
	};
	entry.insert(txn, "addedBy", Any::from(client.as_str()));
	entry.insert(txn, "addedAt", Any::BigInt(ts.0));
	Ok(())
}

/// Remove a member: stamp `removedAt` only. Removing an absent member leaves
/// a tombstone entry with no `addedAt`, which never reads as present.
pub fn remove(
	txn: &mut TransactionMut<'_>,
	fields: &MapRef,
	name: &str,
	member: &Value,
	ts: Timestamp,
) -> ClResult<()> {
	let key = member_key(member)?;
	let set = nested_map(txn, fields, name);
	let entry = match set.get(txn, &key) {
		Some(Out::YMap(entry)) => entry,
		_ => set.insert(txn, key.as_str(), yrs::MapPrelim::default()),
	};
	entry.insert(txn, "removedAt", Any::BigInt(ts.0));
	Ok(())
}

/// Current members, decoded from their JSON keys, in key order.
pub fn members(txn: &impl yrs::ReadTxn, fields: &MapRef, name: &str) -> Vec<Value> {
	let Some(set) = existing_map(txn, fields, name) else {
		return Vec::new();
	};
	let mut keys: Vec<(String, Value)> = Vec::new();
	for (key, value) in set.iter(txn) {
		let Out::YMap(entry) = value else { continue };
		if !is_member(txn, &entry) {
			continue;
		}
		if let Ok(member) = serde_json::from_str::<Value>(key) {
			keys.push((key.to_string(), member));
		}
	}
	keys.sort_by(|a, b| a.0.cmp(&b.0));
	keys.into_iter().map(|(_, member)| member).collect()
}

/// Whether one member entry currently reads as present.
fn is_member(txn: &impl yrs::ReadTxn, entry: &MapRef) -> bool {
	let added_at = match entry.get(txn, "addedAt") {
		Some(Out::Any(Any::BigInt(ts))) => ts,
		Some(Out::Any(Any::Number(ts))) => ts as i64,
		_ => return false,
	};
	match entry.get(txn, "removedAt") {
		Some(Out::Any(Any::BigInt(removed))) => !(removed > added_at),
		Some(Out::Any(Any::Number(removed))) => !((removed as i64) > added_at),
		_ => true,
	}
}

fn member_key(member: &Value) -> ClResult<String> {
	serde_json::to_string(member).map_err(Error::from)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use yrs::updates::decoder::Decode;
	use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

	fn exchange(doc_a: &Doc, doc_b: &Doc) {
		let update_a = doc_a.transact().encode_state_as_update_v1(&StateVector::default());
		let update_b = doc_b.transact().encode_state_as_update_v1(&StateVector::default());
		doc_a
			.transact_mut()
			.apply_update(Update::decode_v1(&update_b).expect("decode"))
			.expect("apply");
		doc_b
			.transact_mut()
			.apply_update(Update::decode_v1(&update_a).expect("decode"))
			.expect("apply");
	}

	#[test]
	fn test_add_then_remove() {
		let doc = Doc::new();
		let fields = doc.get_or_insert_map("fields");
		let client = ClientId::from("a");

		{
			let mut txn = doc.transact_mut();
			add(&mut txn, &fields, "tags", &client, &json!("urgent"), Timestamp(10))
				.expect("add");
		}
		assert_eq!(members(&doc.transact(), &fields, "tags"), vec![json!("urgent")]);

		{
			let mut txn = doc.transact_mut();
			remove(&mut txn, &fields, "tags", &json!("urgent"), Timestamp(20)).expect("remove");
		}
		assert!(members(&doc.transact(), &fields, "tags").is_empty());
	}

	#[test]
	fn test_concurrent_add_defeats_earlier_remove() {
		// A removes "urgent" at t=10; B adds it at t=20; after exchange the
		// set contains "urgent" on both replicas.
		let doc_a = Doc::new();
		let doc_b = Doc::new();
		let fields_a = doc_a.get_or_insert_map("fields");
		let fields_b = doc_b.get_or_insert_map("fields");

		// Both start from a shared state containing the member
		{
			let mut txn = doc_a.transact_mut();
			add(&mut txn, &fields_a, "tags", &ClientId::from("a"), &json!("urgent"), Timestamp(1))
				.expect("add");
		}
		exchange(&doc_a, &doc_b);

		{
			let mut txn = doc_a.transact_mut();
			remove(&mut txn, &fields_a, "tags", &json!("urgent"), Timestamp(10)).expect("remove");
		}
		{
			let mut txn = doc_b.transact_mut();
			add(&mut txn, &fields_b, "tags", &ClientId::from("b"), &json!("urgent"), Timestamp(20))
				.expect("add");
		}
		exchange(&doc_a, &doc_b);

		assert_eq!(members(&doc_a.transact(), &fields_a, "tags"), vec![json!("urgent")]);
		assert_eq!(members(&doc_b.transact(), &fields_b, "tags"), vec![json!("urgent")]);
	}

	#[test]
	fn test_remove_wins_only_when_strictly_later() {
		let doc = Doc::new();
		let fields = doc.get_or_insert_map("fields");
		let client = ClientId::from("a");

		{
			let mut txn = doc.transact_mut();
			add(&mut txn, &fields, "tags", &client, &json!("kept"), Timestamp(10)).expect("add");
			remove(&mut txn, &fields, "tags", &json!("kept"), Timestamp(10)).expect("remove");
		}
		// Equal timestamps: the add wins
		assert_eq!(members(&doc.transact(), &fields, "tags"), vec![json!("kept")]);
	}

	#[test]
	fn test_remove_of_absent_member_is_inert() {
		let doc = Doc::new();
		let fields = doc.get_or_insert_map("fields");

		{
			let mut txn = doc.transact_mut();
			remove(&mut txn, &fields, "tags", &json!("ghost"), Timestamp(5)).expect("remove");
		}
		assert!(members(&doc.transact(), &fields, "tags").is_empty());
	}

	#[test]
	fn test_non_string_members() {
		let doc = Doc::new();
		let fields = doc.get_or_insert_map("fields");
		let client = ClientId::from("a");

		{
			let mut txn = doc.transact_mut();
			add(&mut txn, &fields, "ids", &client, &json!(7), Timestamp(1)).expect("add");
			add(&mut txn, &fields, "ids", &client, &json!({"k": "v"}), Timestamp(1))
				.expect("add");
		}
		let all = members(&doc.transact(), &fields, "ids");
		assert!(all.contains(&json!(7)));
		assert!(all.contains(&json!({"k": "v"})));
	}
}

// vim: ts=4
