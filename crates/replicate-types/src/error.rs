//! Error handling subsystem. Implements a custom Error type.

use crate::prelude::*;

pub type ClResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	// Core errors
	NotFound,
	Parse,

	// Replication
	Network(String),      // Retriable transport failure (backoff + retry)
	NonRetriable(String), // Authority rejected the write (auth, validation)
	ProtocolMismatch { client_min: u32, client_max: u32, server: u32 },

	// Storage
	StorageIo(String),  // Adapter fault; propagated, never retried
	StorageClosed,      // Adapter marked closed after an unrecoverable fault
	Crypto(String),     // Encryption wrapper failures on the write path

	// Schema
	SchemaMismatch(String),
	ValidationError(String),

	// Sync actor
	DocumentNotRegistered(String),
	ActorShutdown,

	// System
	Timeout,
	Internal(String), // Internal invariant violations, for debugging

	// externals
	Io(std::io::Error),
}

impl Error {
	/// Whether the sync actor may retry the failed operation with backoff.
	pub fn is_retriable(&self) -> bool {
		matches!(self, Error::Network(_) | Error::Timeout)
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		warn!("io error: {}", err);
		Self::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(_err: serde_json::Error) -> Self {
		warn!("json error: {}", _err);
		Error::Parse
	}
}

impl From<std::num::ParseIntError> for Error {
	fn from(_err: std::num::ParseIntError) -> Self {
		warn!("parse int error: {}", _err);
		Error::Parse
	}
}

impl From<std::time::SystemTimeError> for Error {
	fn from(_err: std::time::SystemTimeError) -> Self {
		warn!("system time error: {}", _err);
		Error::Internal("system time error".into())
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::ProtocolMismatch { client_min, client_max, server } => write!(
				f,
				"protocol mismatch: server speaks version {} but this client supports {}..={}; \
				 update the client or the backend deployment",
				server, client_min, client_max
			),
			other => write!(f, "{:?}", other),
		}
	}
}

impl std::error::Error for Error {}

/// Helper macro for locking mutexes with automatic internal error handling.
///
/// Converts a poisoned-mutex error into `Error::Internal`, optionally with
/// context naming the lock:
///
/// ```ignore
/// let mut data = lock!(my_mutex)?;
/// let mut data = lock!(my_mutex, "stage_list")?;
/// ```
#[macro_export]
macro_rules! lock {
	($mutex:expr) => {
		$mutex
			.lock()
			.map_err(|_| $crate::error::Error::Internal("mutex poisoned".into()))
	};
	($mutex:expr, $context:expr) => {
		$mutex
			.lock()
			.map_err(|_| $crate::error::Error::Internal(format!("mutex poisoned: {}", $context)))
	};
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_retriable_classification() {
		assert!(Error::Network("connection reset".into()).is_retriable());
		assert!(Error::Timeout.is_retriable());
		assert!(!Error::NonRetriable("schema validation failed".into()).is_retriable());
		assert!(!Error::StorageIo("disk full".into()).is_retriable());
	}

	#[test]
	fn test_protocol_mismatch_message() {
		let err = Error::ProtocolMismatch { client_min: 1, client_max: 2, server: 7 };
		let msg = err.to_string();
		assert!(msg.contains("version 7"));
		assert!(msg.contains("1..=2"));
	}
}

// vim: ts=4
