//! # sqlx-sqlite-objstore
//!
//! Versioned object stores with secondary indexes, backed by a single SQLite
//! file through SQLx.
//!
//! ## Core Types
//!
//! - **[`ObjectDatabase`]**: An open connection. Opening yields an [`OpenRequest`]
//!   stream of [`OpenEvent`]s.
//! - **[`VersionChange`]**: Schema changes while the database is upgraded
//! - **[`Transaction`]**: Requests against a fixed set of object stores,
//!   run in order and committed together
//! - **[`Key`]**, **[`KeyRange`]**, **[`KeyPath`]**: The key model
//! - **[`Operation`]** / **[`Output`]**: A single request and its result
//! - **[`Error`]**: Error type for all of the above
//!
//! ## Architecture
//!
//! - **Connection pooling**: A read-only pool for read-only transactions and
//!   a single-connection write pool for read-write transactions and upgrades
//! - **WAL mode**: Enabled on the writer the first time a file is opened
//! - **Meta tables**: Stores, indexes, records and index entries live in four
//!   fixed tables, so schema changes never issue DDL
//! - **Versioning**: The database version is kept in `PRAGMA user_version`
//!   and only changes when a [`VersionChange`] finishes
//!
//! ## Usage
//!
//! ```no_run
//! use futures::StreamExt;
//! use serde_json::json;
//! use sqlx_sqlite_objstore::{
//!    ObjectDatabase, ObjectStoreParameters, OpenEvent, TransactionMode,
//! };
//!
//! #[tokio::main]
//! async fn main() -> sqlx_sqlite_objstore::Result<()> {
//!    let mut request = ObjectDatabase::open("example.db", Some(1), Default::default());
//!    let mut db = None;
//!    while let Some(event) = request.next().await {
//!       match event {
//!          OpenEvent::UpgradeNeeded(change) => {
//!             let params = ObjectStoreParameters::new().key_path("id");
//!             change.create_object_store("users", params).await?;
//!          }
//!          OpenEvent::Success(opened) => db = Some(opened),
//!          OpenEvent::Error(e) => return Err(e),
//!          OpenEvent::Blocked { .. } => {}
//!       }
//!    }
//!    let Some(db) = db else { return Ok(()) };
//!
//!    let tx = db.transaction(["users"], TransactionMode::ReadWrite)?;
//!    let key = tx
//!       .object_store("users")?
//!       .put(json!({"id": 1, "name": "Alice"}), None)
//!       .await?;
//!    tx.commit().await?;
//!    println!("stored {key:?}");
//!
//!    db.close();
//!    Ok(())
//! }
//! ```
//!
mod config;
mod database;
mod error;
mod exec;
mod key;
mod key_path;
mod operation;
mod registry;
mod schema;
mod transaction;
mod upgrade;
mod write_guard;

// Re-export public types
pub use config::ObjectDatabaseConfig;
pub use database::{ObjectDatabase, OpenEvent, OpenRequest};
pub use error::Error;
pub use key::{Key, KeyRange};
pub use key_path::KeyPath;
pub use operation::{Cursor, CursorDirection, CursorRecord, Method, Operation, Output, Source};
pub use registry::{VersionChangeEvent, delete_database};
pub use schema::{IndexParameters, IndexSchema, ObjectStoreParameters, Schema, StoreSchema};
pub use transaction::{ObjectStore, Request, Transaction, TransactionDone, TransactionMode};
pub use upgrade::{UpgradeTransaction, VersionChange};

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
