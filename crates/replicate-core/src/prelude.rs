pub use replicate_types::error::{ClResult, Error};
pub use replicate_types::types::{ClientId, Cursor, DocKey, Timestamp};

pub use tracing::{debug, debug_span, error, error_span, info, info_span, warn, warn_span};

// vim: ts=4
