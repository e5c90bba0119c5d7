//! Counter fields: an append-only log of `(client, delta, ts)` entries whose
//! value is the sum of all deltas. Entries are never rewritten; compaction of
//! stable prefixes happens implicitly when the document snapshot replaces the
//! WAL tail.

use std::collections::HashMap;

use yrs::{Any, Array, MapRef, TransactionMut};

use super::{existing_array, nested_array};
use crate::prelude::*;

/// Append one increment entry. Negative deltas are allowed.
pub fn increment(
	txn: &mut TransactionMut<'_>,
	fields: &MapRef,
	name: &str,
	client: &ClientId,
	by: i64,
	ts: Timestamp,
) {
	let log = nested_array(txn, fields, name);
	let mut entry = HashMap::new();
	entry.insert("client".to_string(), Any::from(client.as_str()));
	entry.insert("delta".to_string(), Any::BigInt(by));
	entry.insert("ts".to_string(), Any::BigInt(ts.0));
	log.push_back(txn, Any::from(entry));
}

/// Read = Σ delta over all entries.
pub fn value(txn: &impl yrs::ReadTxn, fields: &MapRef, name: &str) -> i64 {
	let Some(log) = existing_array(txn, fields, name) else {
		return 0;
	};
	let mut sum = 0i64;
	for item in log.iter(txn) {
		if let yrs::Out::Any(Any::Map(entry)) = item {
			match entry.get("delta") {
				Some(Any::BigInt(delta)) => sum += delta,
				Some(Any::Number(delta)) => sum += *delta as i64,
				_ => {}
			}
		}
	}
	sum
}

#[cfg(test)]
mod tests {
	use super::*;
	use yrs::{Doc, Transact};

	#[test]
	fn test_increment_and_sum() {
		let doc = Doc::new();
		let fields = doc.get_or_insert_map("fields");
		let client = ClientId::from("c1");

		{
			let mut txn = doc.transact_mut();
			increment(&mut txn, &fields, "views", &client, 1, Timestamp(10));
			increment(&mut txn, &fields, "views", &client, 2, Timestamp(11));
			increment(&mut txn, &fields, "views", &client, -1, Timestamp(12));
		}

		let txn = doc.transact();
		assert_eq!(value(&txn, &fields, "views"), 2);
		assert_eq!(value(&txn, &fields, "absent"), 0);
	}

	#[test]
	fn test_concurrent_increments_merge_commutatively() {
		use yrs::updates::decoder::Decode;
		use yrs::{ReadTxn, StateVector, Update};

		let doc_a = Doc::new();
		let doc_b = Doc::new();
		let fields_a = doc_a.get_or_insert_map("fields");
		let fields_b = doc_b.get_or_insert_map("fields");

		{
			let mut txn = doc_a.transact_mut();
			increment(&mut txn, &fields_a, "views", &ClientId::from("a"), 1, Timestamp(10));
		}
		{
			let mut txn = doc_b.transact_mut();
			increment(&mut txn, &fields_b, "views", &ClientId::from("b"), 2, Timestamp(10));
		}

		// Exchange updates both ways
		let update_a = doc_a.transact().encode_state_as_update_v1(&StateVector::default());
		let update_b = doc_b.transact().encode_state_as_update_v1(&StateVector::default());
		{
			let mut txn = doc_a.transact_mut();
			txn.apply_update(Update::decode_v1(&update_b).expect("decode")).expect("apply");
		}
		{
			let mut txn = doc_b.transact_mut();
			txn.apply_update(Update::decode_v1(&update_a).expect("decode")).expect("apply");
		}

		assert_eq!(value(&doc_a.transact(), &fields_a, "views"), 3);
		assert_eq!(value(&doc_b.transact(), &fields_b, "views"), 3);
	}
}

// vim: ts=4
