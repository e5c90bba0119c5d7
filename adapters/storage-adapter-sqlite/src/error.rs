//! Error types for the SQLite storage adapter

use std::fmt;

/// Adapter-specific errors
#[derive(Debug)]
pub enum Error {
	/// Database operation error
	DbError(String),

	/// I/O error
	IoError(String),

	/// The adapter was closed or marked failed
	Closed,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::DbError(msg) => write!(f, "Database error: {}", msg),
			Error::IoError(msg) => write!(f, "I/O error: {}", msg),
			Error::Closed => write!(f, "Storage adapter is closed"),
		}
	}
}

impl std::error::Error for Error {}

impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Error::DbError(err.to_string())
	}
}

impl From<Error> for replicate::error::Error {
	fn from(err: Error) -> Self {
		match err {
			Error::Closed => replicate::error::Error::StorageClosed,
			other => replicate::error::Error::StorageIo(other.to_string()),
		}
	}
}

// vim: ts=4
