//! Error types for sqlx-sqlite-objstore

use thiserror::Error;

/// Errors that may occur when working with an object database
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// A stored record or schema entry could not be (de)serialized
   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   /// Database has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// The database path is empty or names an in-memory database
   #[error("Invalid database path: {0}")]
   InvalidPath(String),

   /// Version 0 was requested
   #[error("Invalid version {0}: versions start at 1")]
   InvalidVersion(u32),

   /// The requested version is lower than the version already stored
   #[error("Requested version {requested} is lower than the stored version {stored}")]
   VersionError { requested: u32, stored: u32 },

   /// An object store, index, or record scope does not exist
   #[error("Not found: {0}")]
   NotFound(String),

   /// A key or unique index constraint was violated
   #[error("Constraint violated: {0}")]
   Constraint(String),

   /// A key or key path could not be used (invalid key, missing key, etc.)
   #[error("Data error: {0}")]
   Data(String),

   /// A write was issued in a read-only transaction
   #[error("Cannot write to '{0}' in a read-only transaction")]
   ReadOnly(String),

   /// A schema operation was not valid for the current state
   #[error("Invalid state: {0}")]
   InvalidState(String),

   /// The transaction was aborted before the request could complete
   #[error("Transaction aborted: {0}")]
   Aborted(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// Codes follow the names of the equivalent DOMException where one exists.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Json(_) => "JSON_ERROR".to_string(),
         Error::DatabaseClosed => "DATABASE_CLOSED".to_string(),
         Error::InvalidPath(_) => "INVALID_PATH".to_string(),
         Error::InvalidVersion(_) => "INVALID_VERSION".to_string(),
         Error::VersionError { .. } => "VERSION_ERROR".to_string(),
         Error::NotFound(_) => "NOT_FOUND_ERROR".to_string(),
         Error::Constraint(_) => "CONSTRAINT_ERROR".to_string(),
         Error::Data(_) => "DATA_ERROR".to_string(),
         Error::ReadOnly(_) => "READ_ONLY_ERROR".to_string(),
         Error::InvalidState(_) => "INVALID_STATE_ERROR".to_string(),
         Error::Aborted(_) => "ABORT_ERROR".to_string(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_error_code_version_error() {
      let err = Error::VersionError {
         requested: 1,
         stored: 3,
      };
      assert_eq!(err.error_code(), "VERSION_ERROR");
      assert!(err.to_string().contains("stored version 3"));
   }

   #[test]
   fn test_error_code_constraint() {
      let err = Error::Constraint("key already exists".into());
      assert_eq!(err.error_code(), "CONSTRAINT_ERROR");
   }

   #[test]
   fn test_error_code_sqlx_non_database() {
      let err = Error::Sqlx(sqlx::Error::RowNotFound);
      assert_eq!(err.error_code(), "SQLX_ERROR");
   }
}
