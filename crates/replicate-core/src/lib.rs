//! Replicate: an offline-first replication engine for structured documents
//! whose fields carry conflict-free data types (rich text, counters,
//! add-wins sets, and registers).
//!
//! Each client holds a full local replica in embedded storage (see the
//! storage adapter crates), mutates it without coordination, and converges
//! with a central authority through an incremental, cursor-based change
//! stream. The authority is an opaque RPC peer behind the
//! `replicate_types::authority::Authority` trait.
//!
//! Per collection the engine wires, leaves-first: storage adapter (optionally
//! wrapped by at-rest encryption), document manager and CRDT field kinds,
//! WAL with snapshot compaction, one sync actor per document, the streaming
//! replicator, the staged-commit transaction coordinator, the versioned
//! schema migrator, and the protocol handshake gate.

pub mod collection;
pub mod doc;
pub mod fields;
pub mod handshake;
pub mod identity;
pub mod migrator;
pub mod prelude;
pub mod replicator;
pub mod schema;
pub mod signals;
pub mod sync;
pub mod transaction;
pub mod wal;

mod kv;

pub use collection::{Collection, CollectionConfig, ProseBinding};
pub use fields::FieldWrite;
pub use replicate_types::authority;
pub use replicate_types::error::{ClResult, Error};
pub use replicate_types::storage_adapter;
pub use replicate_types::types::{ClientId, Cursor, Timestamp, UserProfile};
pub use schema::{FieldKind, FieldSpec, Schema, Shape};
pub use wal::CompactionConfig;

// vim: ts=4
