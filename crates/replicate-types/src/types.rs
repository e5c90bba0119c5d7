//! Common types used throughout the Replicate engine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::SystemTime;

// Timestamp //
//***********//
/// Wall-clock milliseconds since the Unix epoch.
///
/// CRDT merge rules (add-wins sets, latest-wins registers) compare timestamps
/// produced on different clients, so millisecond resolution is kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn now() -> Timestamp {
		let res = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
		Timestamp(res.as_millis() as i64)
	}

	pub fn from_now(delta_ms: i64) -> Timestamp {
		Timestamp(Self::now().0 + delta_ms)
	}

	/// Add milliseconds to this timestamp
	pub fn add_millis(&self, ms: i64) -> Timestamp {
		Timestamp(self.0 + ms)
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::cmp::PartialEq for Timestamp {
	fn eq(&self, other: &Self) -> bool {
		self.0 == other.0
	}
}

impl std::cmp::Eq for Timestamp {}

impl std::cmp::PartialOrd for Timestamp {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl std::cmp::Ord for Timestamp {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.0.cmp(&other.0)
	}
}

impl Serialize for Timestamp {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_i64(self.0)
	}
}

impl<'de> Deserialize<'de> for Timestamp {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(Timestamp(i64::deserialize(deserializer)?))
	}
}

// Cursor //
//********//
/// Authority-assigned monotonic sequence naming the highest committed change
/// a collection has durably observed.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Cursor(pub i64);

impl Cursor {
	pub const ZERO: Cursor = Cursor(0);
}

impl std::fmt::Display for Cursor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl Serialize for Cursor {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_i64(self.0)
	}
}

impl<'de> Deserialize<'de> for Cursor {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(Cursor(i64::deserialize(deserializer)?))
	}
}

// ClientId //
//**********//
/// Stable 128-bit client identity, formatted as a uuid string. Generated on
/// first run and persisted in the blob KV under a reserved key.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ClientId(pub Box<str>);

impl ClientId {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for ClientId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for ClientId {
	fn from(s: &str) -> Self {
		ClientId(s.into())
	}
}

impl Serialize for ClientId {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for ClientId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(ClientId(Box::<str>::deserialize(deserializer)?))
	}
}

// DocKey //
//********//
/// Composite `<collection>:<document>` key used by the WAL `deltas` rows and
/// the `snapshots` primary key.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DocKey {
	pub collection: Box<str>,
	pub document: Box<str>,
}

impl DocKey {
	pub fn new(collection: impl Into<Box<str>>, document: impl Into<Box<str>>) -> Self {
		Self { collection: collection.into(), document: document.into() }
	}
}

impl std::fmt::Display for DocKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.collection, self.document)
	}
}

// UserProfile //
//*************//
/// Optional user identity surfaced to the presence collaborator and embedded
/// in counter/register entries via the client id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
	pub id: Box<str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<Box<str>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub avatar: Option<Box<str>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub color: Option<Box<str>>,
}


// vim: ts=4
