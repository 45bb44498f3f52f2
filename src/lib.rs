//! # reactive-objstore
//!
//! Reactive access to versioned object stores. Opening a connection applies
//! a [`MigrationPlan`], store handles expose every read and write as a
//! [`Query`], and live queries re-emit whenever their collection is written.
//!
//! ## Core Types
//!
//! - **[`Connection`]**: An open, migrated database. Built with
//!   [`Connection::builder`] or [`open_connection`].
//! - **[`MigrationPlan`]**: `"from-to"` steps that create, update and delete
//!   collections during an upgrade
//! - **[`StoreHandle`]**: One collection or index in a fixed [`AccessMode`]
//! - **[`Query`]** / **[`QueryStream`]**: A pending operation and the
//!   stream of its results
//! - **[`Completion`]**: A one-shot engine request any number of observers
//!   can await
//! - **[`ChangeStream`]**: Committed writes, as [`ChangeEvent`]s
//!
//! ## Live queries
//!
//! A live query registers a listener on its collection before it first
//! runs. Every successful write through the same connection re-runs each
//! listener on a fresh read transaction and hands the result to all of the
//! listener's subscribers; the write's own stream ends only after that.
//! Live queries with structurally equal arguments share a listener.
//!
//! ```no_run
//! use futures::StreamExt;
//! use reactive_objstore::{CreateStore, MigrationPlan, MigrationStep, open_connection};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> reactive_objstore::Result<()> {
//!    let plan = MigrationPlan::new()
//!       .step(0, 1, MigrationStep::new().create(CreateStore::new("users").key_path("id")));
//!    let conn = open_connection("example.db", Some(1), plan).await?;
//!
//!    let mut users = conn.readonly("users")?.get_all(None, None).live();
//!    assert_eq!(users.next().await.transpose()?, Some(vec![]));
//!
//!    conn.readwrite("users")?.add(json!({"id": 1, "name": "Alice"}), None).await?;
//!    let all = users.next().await.transpose()?.unwrap_or_default();
//!    assert_eq!(all.len(), 1);
//!    Ok(())
//! }
//! ```

mod bridge;
mod change;
mod config;
mod connection;
mod error;
mod handle;
mod migration;
mod query;
mod stream;
mod subscriptions;

pub use bridge::{Completion, Observation, Outcome};
pub use change::{ChangeEvent, ChangeKind, ChangeStream};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionBuilder, open_connection};
pub use error::{EngineError, Error, Result};
pub use handle::{AccessMode, Reader, StoreHandle, StoreName, Writer};
pub use migration::{
   CreateStore, IndexDefinition, MigrationPlan, MigrationStep, OpenState, UpdateStore,
};
pub use query::{FromOutput, Query, QueryDescriptor};
pub use stream::QueryStream;
pub use subscriptions::ListenerKey;

// Engine types that appear in this crate's API
pub use sqlx_sqlite_objstore::{
   Cursor, CursorDirection, CursorRecord, Key, KeyPath, KeyRange, Method, ObjectDatabaseConfig,
   Operation, Output, Source, VersionChangeEvent, delete_database,
};
