//! Authority RPC surface
//!
//! The authority is the transactional backend that linearizes writes and
//! assigns a monotonic sequence number to every committed change. The engine
//! treats it as an opaque RPC peer behind this trait; concrete transports
//! (websocket, HTTP long-poll, in-process test double) live with the host.
//!
//! Behavioral contract:
//! - `replicate` is atomic per call: on `success` the change is committed and
//!   carries the assigned `seq`.
//! - `stream` returns committed changes strictly after the given cursor, in
//!   sequence order. A `compact` notice names documents whose history was
//!   truncated server-side; the client must run `recovery` for those.
//! - `recovery` answers with a state-vector-bounded diff covering everything
//!   the client is missing, plus the vector to resume from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::prelude::*;
use crate::types::UserProfile;

/// Reported wire version of the authority deployment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ProtocolInfo {
	pub version: u32,
}

/// Kind of a streamed change payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeType {
	/// Incremental update bounded by a "before" state vector.
	Delta,
	/// Full document state; replaces local state for the document.
	Snapshot,
}

/// One committed change in the stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
	pub document: Box<str>,
	#[serde(with = "serde_bytes_b64")]
	pub bytes: Vec<u8>,
	pub seq: i64,
	#[serde(rename = "type")]
	pub change_type: ChangeType,
}

/// Notice that the authority truncated history for the named documents.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactNotice {
	pub documents: Vec<Box<str>>,
}

/// One batch from the change stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
	pub changes: Vec<Change>,
	pub cursor: Cursor,
	pub more: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub compact: Option<CompactNotice>,
	/// Materialization pass: the complete list of live document ids. Present
	/// only occasionally; drives phantom-document reconciliation.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub materialize: Option<Vec<Box<str>>>,
}

/// Arguments for the change stream subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamArgs {
	pub collection: Box<str>,
	pub cursor: Cursor,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub limit: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub threshold: Option<u32>,
}

/// Which replicate mutation a write maps to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteKind {
	Insert,
	Update,
	Delete,
}

/// Result of a `replicate` mutation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicateAck {
	pub success: bool,
	pub seq: i64,
}

/// Result of a `recovery` query. The client applies `diff` and resumes
/// streaming from `cursor` when the server names one.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryDiff {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub diff: Option<Vec<u8>>,
	#[serde(with = "serde_bytes_b64")]
	pub vector: Vec<u8>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cursor: Option<Cursor>,
}

/// Progress acknowledgment pushed after a successful flush.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkArgs {
	pub collection: Box<str>,
	pub document: Box<str>,
	pub client: ClientId,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub seq: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub vector: Option<Vec<u8>>,
}

/// Result of a server-side `compact` mutation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactAck {
	pub success: bool,
	pub removed: u64,
	pub retained: u64,
	pub size: u64,
}

/// Presence announcement action.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceAction {
	Join,
	Leave,
}

/// Presence announcement for the live-collaboration channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceArgs {
	pub collection: Box<str>,
	pub document: Box<str>,
	pub client: ClientId,
	pub action: PresenceAction,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<Box<str>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub profile: Option<UserProfile>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cursor: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub vector: Option<Vec<u8>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub interval: Option<u32>,
}

/// Query for the collaborators currently present on a document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionArgs {
	pub collection: Box<str>,
	pub document: Box<str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub connected: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub exclude: Option<ClientId>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub group: Option<Box<str>>,
}

/// One present collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
	pub client: ClientId,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<Box<str>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub profile: Option<UserProfile>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cursor: Option<serde_json::Value>,
	pub seen: Timestamp,
}

/// Authority trait.
///
/// All methods map 1:1 to backend endpoints. Transport errors surface as
/// `Error::Network` (retriable); rejections surface as `Error::NonRetriable`.
#[async_trait]
pub trait Authority: Debug + Send + Sync {
	/// Report the wire protocol version. Queried once per process before any
	/// other traffic.
	async fn protocol(&self) -> ClResult<ProtocolInfo>;

	/// Pull the next batch of committed changes after `args.cursor`.
	async fn stream(&self, args: StreamArgs) -> ClResult<ChangeBatch>;

	/// Push one delta for one document. The authority validates, commits, and
	/// assigns a sequence number.
	async fn replicate(
		&self,
		kind: WriteKind,
		collection: &str,
		document: &str,
		bytes: &[u8],
	) -> ClResult<ReplicateAck>;

	/// Request everything the client is missing, bounded by its aggregate
	/// state vector.
	async fn recovery(&self, collection: &str, vector: &[u8]) -> ClResult<RecoveryDiff>;

	/// Acknowledge replication progress for a client/document pair.
	async fn mark(&self, args: MarkArgs) -> ClResult<()>;

	/// Ask the authority to compact a document's server-side history.
	async fn compact(&self, collection: &str, document: &str) -> ClResult<CompactAck>;

	/// Announce presence on a document.
	async fn presence(&self, args: PresenceArgs) -> ClResult<()>;

	/// List collaborators currently present on a document.
	async fn session(&self, args: SessionArgs) -> ClResult<Vec<SessionEntry>>;
}

/// Base64 (de)serialization for binary payload fields, keeping the JSON wire
/// form transport-safe.
mod serde_bytes_b64 {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(deserializer)?;
		STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_change_wire_shape() {
		let change = Change {
			document: "a".into(),
			bytes: vec![1, 2, 3],
			seq: 7,
			change_type: ChangeType::Delta,
		};
		let json = serde_json::to_value(&change).expect("json");
		assert_eq!(json["type"], "delta");
		assert_eq!(json["seq"], 7);
		let back: Change = serde_json::from_value(json).expect("roundtrip");
		assert_eq!(back.bytes, vec![1, 2, 3]);
	}

	#[test]
	fn test_batch_optional_fields_omitted() {
		let batch = ChangeBatch {
			changes: vec![],
			cursor: Cursor(3),
			more: false,
			compact: None,
			materialize: None,
		};
		let json = serde_json::to_string(&batch).expect("json");
		assert!(!json.contains("compact"));
		assert!(!json.contains("materialize"));
	}
}

// vim: ts=4
