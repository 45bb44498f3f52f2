use std::sync::Arc;

use serde::{Serialize, Serializer};
use sqlx_sqlite_objstore::Method;

/// Result type alias for reactive store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors are shared because one failure may be observed by several
/// streams at once.
pub type EngineError = Arc<sqlx_sqlite_objstore::Error>;

/// Structured error response for callers that serialize errors.
#[derive(Serialize)]
struct ErrorResponse {
   code: String,
   message: String,
}

/// Error types for connections, store handles and queries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
   /// The engine refused to open the database.
   #[error("failed to open database: {0}")]
   Open(EngineError),

   /// A migration step failed; nothing from the upgrade was kept.
   #[error("migration from version {from} to {to} failed: {source}")]
   Upgrade {
      from: u32,
      to: u32,
      #[source]
      source: EngineError,
   },

   /// A single request failed.
   #[error("operation failed: {0}")]
   Operation(EngineError),

   /// The enclosing transaction could not be created or did not commit.
   #[error("transaction failed: {0}")]
   Transaction(EngineError),

   /// The connection behind a handle or stream has been closed.
   #[error("connection is closed")]
   ConnectionClosed,

   /// A store name that is not `"collection"` or `"collection.index"`.
   #[error("invalid store name '{0}'")]
   InvalidStoreName(String),

   /// A write through a handle or descriptor that can only read.
   #[error("{method} needs read-write access to '{store}'")]
   ReadOnlyAccess { store: String, method: Method },

   /// The engine returned a result of the wrong shape for the method.
   #[error("unexpected output for {method}")]
   UnexpectedOutput { method: Method },

   /// The query completed without emitting a result.
   #[error("query completed without a result")]
   NoResult,
}

impl Error {
   pub(crate) fn open(e: sqlx_sqlite_objstore::Error) -> Self {
      Error::Open(Arc::new(e))
   }

   pub(crate) fn upgrade(from: u32, to: u32, e: impl Into<EngineError>) -> Self {
      Error::Upgrade {
         from,
         to,
         source: e.into(),
      }
   }

   pub(crate) fn transaction(e: sqlx_sqlite_objstore::Error) -> Self {
      Error::Transaction(Arc::new(e))
   }

   /// The engine error behind this error, if any.
   pub fn engine_error(&self) -> Option<&sqlx_sqlite_objstore::Error> {
      match self {
         Error::Open(e) | Error::Operation(e) | Error::Transaction(e) => Some(e.as_ref()),
         Error::Upgrade { source, .. } => Some(source.as_ref()),
         _ => None,
      }
   }

   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Open(_) => "OPEN_ERROR".to_string(),
         Error::Upgrade { .. } => "UPGRADE_ERROR".to_string(),
         Error::Operation(_) => "OPERATION_ERROR".to_string(),
         Error::Transaction(_) => "TRANSACTION_ERROR".to_string(),
         Error::ConnectionClosed => "CONNECTION_CLOSED".to_string(),
         Error::InvalidStoreName(_) => "INVALID_STORE_NAME".to_string(),
         Error::ReadOnlyAccess { .. } => "READ_ONLY_ACCESS".to_string(),
         Error::UnexpectedOutput { .. } => "UNEXPECTED_OUTPUT".to_string(),
         Error::NoResult => "NO_RESULT".to_string(),
      }
   }
}

impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      let response = ErrorResponse {
         code: self.error_code(),
         message: self.to_string(),
      };
      response.serialize(serializer)
   }
}
