//! Object store and index definitions, and the meta tables that persist them.
//!
//! Everything lives in four tables so that creating or deleting an object
//! store never issues DDL:
//!
//! - `objstore_stores`: one row per object store (key path, key generator)
//! - `objstore_indexes`: one row per index
//! - `objstore_records`: encoded primary key → JSON value
//! - `objstore_index_entries`: encoded index key → encoded primary key

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use tracing::trace;

use crate::Result;
use crate::error::Error;
use crate::key_path::KeyPath;

const META_DDL: &[&str] = &[
   "CREATE TABLE IF NOT EXISTS objstore_stores (
      name TEXT PRIMARY KEY NOT NULL,
      key_path TEXT,
      auto_increment INTEGER NOT NULL,
      next_key INTEGER NOT NULL DEFAULT 1
   )",
   "CREATE TABLE IF NOT EXISTS objstore_indexes (
      store TEXT NOT NULL,
      name TEXT NOT NULL,
      key_path TEXT NOT NULL,
      is_unique INTEGER NOT NULL,
      multi_entry INTEGER NOT NULL,
      PRIMARY KEY (store, name)
   )",
   "CREATE TABLE IF NOT EXISTS objstore_records (
      store TEXT NOT NULL,
      key BLOB NOT NULL,
      value TEXT NOT NULL,
      PRIMARY KEY (store, key)
   ) WITHOUT ROWID",
   "CREATE TABLE IF NOT EXISTS objstore_index_entries (
      store TEXT NOT NULL,
      idx TEXT NOT NULL,
      key BLOB NOT NULL,
      primary_key BLOB NOT NULL,
      PRIMARY KEY (store, idx, key, primary_key)
   ) WITHOUT ROWID",
   "CREATE INDEX IF NOT EXISTS objstore_index_entries_by_record
      ON objstore_index_entries (store, primary_key)",
];

/// Options for a new object store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectStoreParameters {
   /// Where the key lives inside each value. `None` means keys are supplied
   /// out-of-line with every write.
   pub key_path: Option<KeyPath>,
   /// Generate increasing integer keys when none is supplied.
   pub auto_increment: bool,
}

impl ObjectStoreParameters {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
      self.key_path = Some(key_path.into());
      self
   }

   pub fn auto_increment(mut self, auto_increment: bool) -> Self {
      self.auto_increment = auto_increment;
      self
   }
}

/// Options for a new index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexParameters {
   /// Reject two records with the same index key.
   pub unique: bool,
   /// Index each element of an array value separately.
   pub multi_entry: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSchema {
   pub name: String,
   pub key_path: KeyPath,
   pub unique: bool,
   pub multi_entry: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSchema {
   pub name: String,
   pub key_path: Option<KeyPath>,
   pub auto_increment: bool,
   pub indexes: BTreeMap<String, IndexSchema>,
}

impl StoreSchema {
   pub fn index(&self, name: &str) -> Option<&IndexSchema> {
      self.indexes.get(name)
   }

   pub fn index_names(&self) -> Vec<String> {
      self.indexes.keys().cloned().collect()
   }
}

/// Snapshot of every object store and index in a database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
   stores: BTreeMap<String, StoreSchema>,
}

impl Schema {
   pub fn store(&self, name: &str) -> Option<&StoreSchema> {
      self.stores.get(name)
   }

   pub fn contains(&self, name: &str) -> bool {
      self.stores.contains_key(name)
   }

   /// Object store names in sorted order.
   pub fn store_names(&self) -> Vec<String> {
      self.stores.keys().cloned().collect()
   }

   pub(crate) fn require_store(&self, name: &str) -> Result<&StoreSchema> {
      self
         .stores
         .get(name)
         .ok_or_else(|| Error::NotFound(format!("object store '{name}'")))
   }

   pub(crate) fn require_index(&self, store: &str, index: &str) -> Result<&IndexSchema> {
      self
         .require_store(store)?
         .index(index)
         .ok_or_else(|| Error::NotFound(format!("index '{index}' on object store '{store}'")))
   }

   fn store_mut(&mut self, name: &str) -> Result<&mut StoreSchema> {
      self
         .stores
         .get_mut(name)
         .ok_or_else(|| Error::NotFound(format!("object store '{name}'")))
   }
}

/// Creates the meta tables if this is a fresh database file.
pub(crate) async fn ensure_meta_tables(conn: &mut SqliteConnection) -> Result<()> {
   for ddl in META_DDL {
      sqlx::query(ddl).execute(&mut *conn).await?;
   }
   Ok(())
}

/// Reads the full schema from the meta tables.
pub(crate) async fn load(conn: &mut SqliteConnection) -> Result<Schema> {
   let store_rows: Vec<(String, Option<String>, bool)> =
      sqlx::query_as("SELECT name, key_path, auto_increment FROM objstore_stores")
         .fetch_all(&mut *conn)
         .await?;

   let mut stores = BTreeMap::new();
   for (name, key_path, auto_increment) in store_rows {
      let key_path = key_path
         .map(|raw| serde_json::from_str::<KeyPath>(&raw))
         .transpose()?;
      stores.insert(
         name.clone(),
         StoreSchema {
            name,
            key_path,
            auto_increment,
            indexes: BTreeMap::new(),
         },
      );
   }

   let index_rows: Vec<(String, String, String, bool, bool)> = sqlx::query_as(
      "SELECT store, name, key_path, is_unique, multi_entry FROM objstore_indexes",
   )
   .fetch_all(&mut *conn)
   .await?;

   for (store, name, key_path, unique, multi_entry) in index_rows {
      let Some(schema) = stores.get_mut(&store) else {
         continue;
      };
      schema.indexes.insert(
         name.clone(),
         IndexSchema {
            name,
            key_path: serde_json::from_str(&key_path)?,
            unique,
            multi_entry,
         },
      );
   }

   trace!(stores = stores.len(), "Loaded object store schema");
   Ok(Schema { stores })
}

/// Persists a new object store and adds it to `schema`.
pub(crate) async fn create_store(
   conn: &mut SqliteConnection,
   schema: &mut Schema,
   name: &str,
   params: &ObjectStoreParameters,
) -> Result<()> {
   if schema.contains(name) {
      return Err(Error::Constraint(format!("object store '{name}' already exists")));
   }
   if let Some(key_path) = &params.key_path {
      key_path.validate()?;
      if params.auto_increment && !key_path.is_injectable() {
         return Err(Error::InvalidState(format!(
            "object store '{name}' cannot combine auto_increment with an empty or compound key path"
         )));
      }
   }

   let key_path = params
      .key_path
      .as_ref()
      .map(serde_json::to_string)
      .transpose()?;

   sqlx::query("INSERT INTO objstore_stores (name, key_path, auto_increment) VALUES (?, ?, ?)")
      .bind(name)
      .bind(key_path)
      .bind(params.auto_increment)
      .execute(&mut *conn)
      .await?;

   schema.stores.insert(
      name.to_string(),
      StoreSchema {
         name: name.to_string(),
         key_path: params.key_path.clone(),
         auto_increment: params.auto_increment,
         indexes: BTreeMap::new(),
      },
   );
   Ok(())
}

/// Deletes an object store with all its records and indexes.
pub(crate) async fn delete_store(
   conn: &mut SqliteConnection,
   schema: &mut Schema,
   name: &str,
) -> Result<()> {
   schema.require_store(name)?;

   for sql in [
      "DELETE FROM objstore_index_entries WHERE store = ?",
      "DELETE FROM objstore_records WHERE store = ?",
      "DELETE FROM objstore_indexes WHERE store = ?",
      "DELETE FROM objstore_stores WHERE name = ?",
   ] {
      sqlx::query(sql).bind(name).execute(&mut *conn).await?;
   }

   schema.stores.remove(name);
   Ok(())
}

/// Persists a new index definition and adds it to `schema`.
///
/// The caller is responsible for populating entries for existing records.
pub(crate) async fn create_index(
   conn: &mut SqliteConnection,
   schema: &mut Schema,
   store: &str,
   name: &str,
   key_path: &KeyPath,
   params: IndexParameters,
) -> Result<()> {
   key_path.validate()?;
   if params.multi_entry && matches!(key_path, KeyPath::Compound(_)) {
      return Err(Error::InvalidState(format!(
         "index '{name}' cannot be multi_entry with a compound key path"
      )));
   }

   let store_schema = schema.store_mut(store)?;
   if store_schema.indexes.contains_key(name) {
      return Err(Error::Constraint(format!(
         "index '{name}' already exists on object store '{store}'"
      )));
   }

   sqlx::query(
      "INSERT INTO objstore_indexes (store, name, key_path, is_unique, multi_entry)
       VALUES (?, ?, ?, ?, ?)",
   )
   .bind(store)
   .bind(name)
   .bind(serde_json::to_string(key_path)?)
   .bind(params.unique)
   .bind(params.multi_entry)
   .execute(&mut *conn)
   .await?;

   store_schema.indexes.insert(
      name.to_string(),
      IndexSchema {
         name: name.to_string(),
         key_path: key_path.clone(),
         unique: params.unique,
         multi_entry: params.multi_entry,
      },
   );
   Ok(())
}

/// Deletes an index definition and its entries.
pub(crate) async fn delete_index(
   conn: &mut SqliteConnection,
   schema: &mut Schema,
   store: &str,
   name: &str,
) -> Result<()> {
   schema.require_index(store, name)?;

   sqlx::query("DELETE FROM objstore_index_entries WHERE store = ? AND idx = ?")
      .bind(store)
      .bind(name)
      .execute(&mut *conn)
      .await?;
   sqlx::query("DELETE FROM objstore_indexes WHERE store = ? AND name = ?")
      .bind(store)
      .bind(name)
      .execute(&mut *conn)
      .await?;

   schema.store_mut(store)?.indexes.remove(name);
   Ok(())
}
