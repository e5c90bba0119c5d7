//! Prose fields: rich text backed by an XML fragment sequence CRDT.
//!
//! Each prose field owns one root-level fragment (`prose:<field>`). Block and
//! inline elements map to XML elements tagged with the node type; runs of
//! inline text map to XML text with marks encoded as per-run formatting
//! attributes. Node attributes are carried as a single JSON-encoded `attrs`
//! attribute, which keeps serialization to and from the ProseMirror-style
//! tree lossless for structure and attributes.

use std::sync::Arc;

use serde_json::{Value, json};
use yrs::types::Attrs;
use yrs::types::text::YChange;
use yrs::types::xml::XmlOut;
use yrs::{Any, Text, TransactionMut, Xml, XmlElementPrelim, XmlFragment, XmlTextPrelim};

use super::{any_to_json, json_to_any};
use crate::prelude::*;

/// Root name of the fragment backing a prose field.
pub fn fragment_name(field: &str) -> String {
	format!("prose:{}", field)
}

/// Replace the fragment's entire content from a ProseMirror-style JSON tree
/// (`{"type": "doc", "content": [...]}`).
pub fn replace<F: XmlFragment>(
	txn: &mut TransactionMut<'_>,
	fragment: &F,
	doc: &Value,
) -> ClResult<()> {
	let len = fragment.len(txn);
	if len > 0 {
		fragment.remove_range(txn, 0, len);
	}
	let content = doc.get("content").and_then(Value::as_array);
	if let Some(nodes) = content {
		build_into(txn, fragment, nodes)?;
	}
	Ok(())
}

fn build_into<F: XmlFragment>(
	txn: &mut TransactionMut<'_>,
	parent: &F,
	nodes: &[Value],
) -> ClResult<()> {
	let mut index = 0;
	while index < nodes.len() {
		let node = &nodes[index];
		let node_type = node
			.get("type")
			.and_then(Value::as_str)
			.ok_or_else(|| Error::ValidationError("prose node without type".into()))?;

		if node_type == "text" {
			// Consecutive text nodes collapse into one XML text with per-run
			// formatting attributes.
			let text = parent.push_back(txn, XmlTextPrelim::new(""));
			let mut offset = 0u32;
			while index < nodes.len()
				&& nodes[index].get("type").and_then(Value::as_str) == Some("text")
			{
				let run = &nodes[index];
				let chunk = run.get("text").and_then(Value::as_str).unwrap_or("");
				let marks = run.get("marks").and_then(Value::as_array);
				match marks {
					Some(marks) if !marks.is_empty() => {
						text.insert_with_attributes(txn, offset, chunk, marks_to_attrs(marks));
					}
					_ => text.insert(txn, offset, chunk),
				}
				offset += chunk.encode_utf16().count() as u32;
				index += 1;
			}
		} else {
			let element = parent.push_back(txn, XmlElementPrelim::empty(node_type));
			if let Some(attrs) = node.get("attrs") {
				if !attrs.is_null() {
					element.insert_attribute(txn, "attrs", attrs.to_string());
				}
			}
			if let Some(children) = node.get("content").and_then(Value::as_array) {
				build_into(txn, &element, children)?;
			}
			index += 1;
		}
	}
	Ok(())
}

/// Serialize the fragment back to a ProseMirror-style JSON tree.
pub fn to_json<F: XmlFragment>(txn: &impl yrs::ReadTxn, fragment: &F) -> Value {
	json!({ "type": "doc", "content": read_children(txn, fragment) })
}

fn read_children<F: XmlFragment>(txn: &impl yrs::ReadTxn, parent: &F) -> Vec<Value> {
	let mut out = Vec::new();
	for child in parent.children(txn) {
		match child {
			XmlOut::Element(element) => {
				let mut node = serde_json::Map::new();
				node.insert("type".to_string(), Value::String(element.tag().to_string()));
				if let Some(yrs::Out::Any(Any::String(raw))) =
					element.get_attribute(txn, "attrs")
				{
					if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
						node.insert("attrs".to_string(), parsed);
					}
				}
				let content = read_children(txn, &element);
				if !content.is_empty() {
					node.insert("content".to_string(), Value::Array(content));
				}
				out.push(Value::Object(node));
			}
			XmlOut::Text(text) => {
				for diff in text.diff(txn, YChange::identity) {
					let yrs::Out::Any(Any::String(chunk)) = &diff.insert else { continue };
					let chunk = chunk.to_string();
					let mut node = serde_json::Map::new();
					node.insert("type".to_string(), Value::String("text".to_string()));
					node.insert("text".to_string(), Value::String(chunk));
					if let Some(attrs) = &diff.attributes {
						let marks = attrs_to_marks(attrs);
						if !marks.is_empty() {
							node.insert("marks".to_string(), Value::Array(marks));
						}
					}
					out.push(Value::Object(node));
				}
			}
			XmlOut::Fragment(fragment) => {
				out.extend(read_children(txn, &fragment));
			}
		}
	}
	out
}

/// ProseMirror marks → per-run formatting attributes. A mark without attrs is
/// stored as `true`; a mark with attrs stores them as a nested map.
fn marks_to_attrs(marks: &[Value]) -> Attrs {
	let mut attrs = Attrs::new();
	for mark in marks {
		let Some(mark_type) = mark.get("type").and_then(Value::as_str) else { continue };
		let value = match mark.get("attrs") {
			Some(mark_attrs) if !mark_attrs.is_null() => json_to_any(mark_attrs),
			_ => Any::Bool(true),
		};
		attrs.insert(Arc::from(mark_type), value);
	}
	attrs
}

fn attrs_to_marks(attrs: &Attrs) -> Vec<Value> {
	let mut entries: Vec<(&str, &Any)> =
		attrs.iter().map(|(k, v)| (k.as_ref(), v)).collect();
	entries.sort_by(|a, b| a.0.cmp(b.0));
	entries
		.into_iter()
		.map(|(mark_type, value)| match value {
			Any::Map(_) => json!({ "type": mark_type, "attrs": any_to_json(value) }),
			_ => json!({ "type": mark_type }),
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use yrs::{Doc, Transact};

	fn roundtrip(doc_json: Value) -> Value {
		let doc = Doc::new();
		let fragment = doc.get_or_insert_xml_fragment("prose:body");
		{
			let mut txn = doc.transact_mut();
			replace(&mut txn, &fragment, &doc_json).expect("replace");
		}
		to_json(&doc.transact(), &fragment)
	}

	#[test]
	fn test_empty_doc_roundtrip() {
		let input = json!({"type": "doc", "content": []});
		assert_eq!(roundtrip(input.clone()), input);
	}

	#[test]
	fn test_paragraph_roundtrip() {
		let input = json!({
			"type": "doc",
			"content": [
				{"type": "paragraph", "content": [
					{"type": "text", "text": "Hello world"}
				]}
			]
		});
		assert_eq!(roundtrip(input.clone()), input);
	}

	#[test]
	fn test_marks_roundtrip() {
		let input = json!({
			"type": "doc",
			"content": [
				{"type": "paragraph", "content": [
					{"type": "text", "text": "plain "},
					{"type": "text", "text": "bold", "marks": [{"type": "strong"}]},
					{"type": "text", "text": " and "},
					{"type": "text", "text": "linked", "marks": [
						{"type": "link", "attrs": {"href": "https://example.com"}}
					]}
				]}
			]
		});
		assert_eq!(roundtrip(input.clone()), input);
	}

	#[test]
	fn test_attrs_and_nesting_roundtrip() {
		let input = json!({
			"type": "doc",
			"content": [
				{"type": "heading", "attrs": {"level": 2}, "content": [
					{"type": "text", "text": "Title"}
				]},
				{"type": "bullet_list", "content": [
					{"type": "list_item", "content": [
						{"type": "paragraph", "content": [
							{"type": "text", "text": "item one"}
						]}
					]}
				]}
			]
		});
		assert_eq!(roundtrip(input.clone()), input);
	}

	#[test]
	fn test_replace_clears_previous_content() {
		let doc = Doc::new();
		let fragment = doc.get_or_insert_xml_fragment("prose:body");
		let first = json!({"type": "doc", "content": [
			{"type": "paragraph", "content": [{"type": "text", "text": "old"}]}
		]});
		let second = json!({"type": "doc", "content": [
			{"type": "paragraph", "content": [{"type": "text", "text": "new"}]}
		]});
		{
			let mut txn = doc.transact_mut();
			replace(&mut txn, &fragment, &first).expect("replace");
		}
		{
			let mut txn = doc.transact_mut();
			replace(&mut txn, &fragment, &second).expect("replace");
		}
		assert_eq!(to_json(&doc.transact(), &fragment), second);
	}
}

// vim: ts=4
