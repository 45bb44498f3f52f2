//! Executes requests against the record tables.
//!
//! Every function here runs on a connection that already has a transaction
//! open; committing or rolling back is the caller's job.

use std::collections::HashSet;

use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::{QueryBuilder, Sqlite};
use tracing::trace;

use crate::Result;
use crate::error::Error;
use crate::key::{Key, KeyRange};
use crate::key_path::{KeyPath, lookup};
use crate::operation::{Cursor, CursorDirection, CursorRecord, Operation, Output, Source};
use crate::schema::{IndexSchema, Schema, StoreSchema};

/// A row read from a store or an index, still encoded.
struct RawRow {
   key: Vec<u8>,
   primary_key: Vec<u8>,
   value: String,
}

impl RawRow {
   fn value(&self) -> Result<Value> {
      Ok(serde_json::from_str(&self.value)?)
   }

   fn primary_key(&self) -> Result<Key> {
      Key::decode(&self.primary_key)
   }
}

/// Runs one operation and returns its result.
pub(crate) async fn execute(
   conn: &mut SqliteConnection,
   schema: &Schema,
   source: &Source,
   operation: Operation,
) -> Result<Output> {
   match source {
      Source::Store { store } => {
         schema.require_store(store)?;
      }
      Source::Index { store, index } => {
         schema.require_index(store, index)?;
      }
   }

   trace!(%source, method = %operation.method(), "Executing request");

   match operation {
      Operation::Count { query } => {
         let count = count(conn, source, query.as_ref()).await?;
         Ok(Output::Count(count))
      }
      Operation::Get { query } => {
         let rows = fetch(conn, source, Some(&query), CursorDirection::Next, Some(1)).await?;
         let value = rows.first().map(RawRow::value).transpose()?;
         Ok(Output::Value(value))
      }
      Operation::GetAll { query, count } => {
         let rows = fetch(conn, source, query.as_ref(), CursorDirection::Next, limit(count)).await?;
         let values = rows.iter().map(RawRow::value).collect::<Result<Vec<_>>>()?;
         Ok(Output::Values(values))
      }
      Operation::GetAllKeys { query, count } => {
         let rows = fetch(conn, source, query.as_ref(), CursorDirection::Next, limit(count)).await?;
         let keys = rows
            .iter()
            .map(RawRow::primary_key)
            .collect::<Result<Vec<_>>>()?;
         Ok(Output::Keys(keys))
      }
      Operation::GetKey { query } => {
         let rows = fetch(conn, source, Some(&query), CursorDirection::Next, Some(1)).await?;
         let key = rows.first().map(RawRow::primary_key).transpose()?;
         Ok(Output::Key(key))
      }
      Operation::OpenCursor { query, direction } => {
         let rows = fetch(conn, source, query.as_ref(), direction, None).await?;
         cursor(rows, direction, true).map(Output::Cursor)
      }
      Operation::OpenKeyCursor { query, direction } => {
         let rows = fetch(conn, source, query.as_ref(), direction, None).await?;
         cursor(rows, direction, false).map(Output::Cursor)
      }
      Operation::Add { value, key } => {
         let store = writable_store(schema, source)?;
         let key = store_record(conn, store, value, key, false).await?;
         Ok(Output::Key(Some(key)))
      }
      Operation::Put { value, key } => {
         let store = writable_store(schema, source)?;
         let key = store_record(conn, store, value, key, true).await?;
         Ok(Output::Key(Some(key)))
      }
      Operation::Delete { query } => {
         let store = writable_store(schema, source)?;
         delete_range(conn, &store.name, &query).await?;
         Ok(Output::Done)
      }
      Operation::Clear => {
         let store = writable_store(schema, source)?;
         clear(conn, &store.name).await?;
         Ok(Output::Done)
      }
   }
}

fn limit(count: Option<u32>) -> Option<u32> {
   // A count of 0 means "no limit"
   count.filter(|c| *c > 0)
}

fn writable_store<'a>(schema: &'a Schema, source: &Source) -> Result<&'a StoreSchema> {
   match source {
      Source::Store { store } => schema.require_store(store),
      Source::Index { store, index } => Err(Error::InvalidState(format!(
         "cannot write through index '{index}' of object store '{store}'"
      ))),
   }
}

fn push_range(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, range: Option<&KeyRange>) {
   let Some(range) = range else {
      return;
   };
   if let Some(lower) = &range.lower {
      let op = if range.lower_open { ">" } else { ">=" };
      qb.push(format!(" AND {column} {op} "));
      qb.push_bind(lower.encode());
   }
   if let Some(upper) = &range.upper {
      let op = if range.upper_open { "<" } else { "<=" };
      qb.push(format!(" AND {column} {op} "));
      qb.push_bind(upper.encode());
   }
}

async fn count(
   conn: &mut SqliteConnection,
   source: &Source,
   range: Option<&KeyRange>,
) -> Result<u64> {
   if let Some(range) = range {
      range.validate()?;
   }

   let mut qb = match source {
      Source::Store { store } => {
         let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM objstore_records WHERE store = ");
         qb.push_bind(store.clone());
         qb
      }
      Source::Index { store, index } => {
         let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM objstore_index_entries WHERE store = ");
         qb.push_bind(store.clone());
         qb.push(" AND idx = ");
         qb.push_bind(index.clone());
         qb
      }
   };
   push_range(&mut qb, "key", range);

   let count: i64 = qb.build_query_scalar().fetch_one(&mut *conn).await?;
   Ok(count.max(0) as u64)
}

async fn fetch(
   conn: &mut SqliteConnection,
   source: &Source,
   range: Option<&KeyRange>,
   direction: CursorDirection,
   limit: Option<u32>,
) -> Result<Vec<RawRow>> {
   if let Some(range) = range {
      range.validate()?;
   }

   let order = if direction.is_reverse() { "DESC" } else { "ASC" };

   let mut qb = match source {
      Source::Store { store } => {
         let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT key, key, value FROM objstore_records WHERE store = ",
         );
         qb.push_bind(store.clone());
         push_range(&mut qb, "key", range);
         qb.push(format!(" ORDER BY key {order}"));
         qb
      }
      Source::Index { store, index } => {
         // For `prevunique` the first record of each key must still be the
         // one with the lowest primary key
         let pk_order = if direction == CursorDirection::Prev {
            "DESC"
         } else {
            "ASC"
         };
         let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT e.key, e.primary_key, r.value FROM objstore_index_entries e \
             JOIN objstore_records r ON r.store = e.store AND r.key = e.primary_key \
             WHERE e.store = ",
         );
         qb.push_bind(store.clone());
         qb.push(" AND e.idx = ");
         qb.push_bind(index.clone());
         push_range(&mut qb, "e.key", range);
         qb.push(format!(" ORDER BY e.key {order}, e.primary_key {pk_order}"));
         qb
      }
   };

   if let Some(limit) = limit
      && !direction.is_unique()
   {
      qb.push(" LIMIT ");
      qb.push_bind(i64::from(limit));
   }

   let rows: Vec<(Vec<u8>, Vec<u8>, String)> =
      qb.build_query_as().fetch_all(&mut *conn).await?;

   let mut rows: Vec<RawRow> = rows
      .into_iter()
      .map(|(key, primary_key, value)| RawRow {
         key,
         primary_key,
         value,
      })
      .collect();

   if direction.is_unique() {
      rows.dedup_by(|next, prev| next.key == prev.key);
      if let Some(limit) = limit {
         rows.truncate(limit as usize);
      }
   }

   Ok(rows)
}

fn cursor(rows: Vec<RawRow>, direction: CursorDirection, with_values: bool) -> Result<Cursor> {
   let records = rows
      .into_iter()
      .map(|row| {
         Ok(CursorRecord {
            key: Key::decode(&row.key)?,
            primary_key: row.primary_key()?,
            value: if with_values { Some(row.value()?) } else { None },
         })
      })
      .collect::<Result<Vec<_>>>()?;
   Ok(Cursor::new(direction, records))
}

/// Computes the keys a value contributes to an index.
///
/// Values that are missing or are not valid keys are simply not indexed.
pub(crate) fn index_keys(index: &IndexSchema, value: &Value) -> Vec<Key> {
   if index.multi_entry
      && let KeyPath::Single(path) = &index.key_path
      && let Some(Value::Array(items)) = lookup(path, value)
   {
      let mut keys: Vec<(Vec<u8>, Key)> = items
         .iter()
         .filter_map(|item| Key::try_from(item).ok())
         .filter(|key| key.validate().is_ok())
         .map(|key| (key.encode(), key))
         .collect();
      keys.sort_by(|a, b| a.0.cmp(&b.0));
      keys.dedup_by(|a, b| a.0 == b.0);
      return keys.into_iter().map(|(_, key)| key).collect();
   }

   match index.key_path.extract(value) {
      Ok(Some(key)) if key.validate().is_ok() => vec![key],
      _ => Vec::new(),
   }
}

/// Resolves the primary key for a write, generating one when the store has a
/// key generator.
async fn resolve_key(
   conn: &mut SqliteConnection,
   store: &StoreSchema,
   value: &mut Value,
   key: Option<Key>,
) -> Result<Key> {
   let key = match (&store.key_path, key) {
      (Some(_), Some(_)) => {
         return Err(Error::Data(format!(
            "object store '{}' uses in-line keys; a key argument is not allowed",
            store.name
         )));
      }
      (Some(path), None) => match path.extract(value)? {
         Some(key) => key,
         None if store.auto_increment => {
            let key = next_generated_key(conn, &store.name).await?;
            path.inject(value, &key)?;
            return Ok(key);
         }
         None => {
            return Err(Error::Data(format!(
               "record has no value at the key path of object store '{}'",
               store.name
            )));
         }
      },
      (None, Some(key)) => key,
      (None, None) if store.auto_increment => {
         return next_generated_key(conn, &store.name).await;
      }
      (None, None) => {
         return Err(Error::Data(format!(
            "object store '{}' has no key path or key generator; a key is required",
            store.name
         )));
      }
   };

   key.validate()?;
   if store.auto_increment {
      bump_generator(conn, &store.name, &key).await?;
   }
   Ok(key)
}

async fn next_generated_key(conn: &mut SqliteConnection, store: &str) -> Result<Key> {
   let next: i64 = sqlx::query_scalar("SELECT next_key FROM objstore_stores WHERE name = ?")
      .bind(store)
      .fetch_one(&mut *conn)
      .await?;
   sqlx::query("UPDATE objstore_stores SET next_key = ? WHERE name = ?")
      .bind(next.saturating_add(1))
      .bind(store)
      .execute(&mut *conn)
      .await?;
   Ok(Key::from(next))
}

/// Explicit numeric keys push the generator past them.
async fn bump_generator(conn: &mut SqliteConnection, store: &str, key: &Key) -> Result<()> {
   let Some(n) = key.as_number() else {
      return Ok(());
   };
   if n < 1.0 {
      return Ok(());
   }
   let floor = n.floor().min(i64::MAX as f64) as i64;
   sqlx::query("UPDATE objstore_stores SET next_key = MAX(next_key, ?) WHERE name = ?")
      .bind(floor.saturating_add(1))
      .bind(store)
      .execute(&mut *conn)
      .await?;
   Ok(())
}

/// Writes a record and its index entries. Returns the record's primary key.
pub(crate) async fn store_record(
   conn: &mut SqliteConnection,
   store: &StoreSchema,
   mut value: Value,
   key: Option<Key>,
   overwrite: bool,
) -> Result<Key> {
   let key = resolve_key(conn, store, &mut value, key).await?;
   let encoded = key.encode();

   if !overwrite {
      let exists: i64 =
         sqlx::query_scalar("SELECT COUNT(*) FROM objstore_records WHERE store = ? AND key = ?")
            .bind(&store.name)
            .bind(&encoded)
            .fetch_one(&mut *conn)
            .await?;
      if exists > 0 {
         return Err(Error::Constraint(format!(
            "a record with key {:?} already exists in object store '{}'",
            key, store.name
         )));
      }
   }

   let mut entries = Vec::new();
   for index in store.indexes.values() {
      for index_key in index_keys(index, &value) {
         let index_key = index_key.encode();
         if index.unique {
            let conflicts: i64 = sqlx::query_scalar(
               "SELECT COUNT(*) FROM objstore_index_entries
                WHERE store = ? AND idx = ? AND key = ? AND primary_key != ?",
            )
            .bind(&store.name)
            .bind(&index.name)
            .bind(&index_key)
            .bind(&encoded)
            .fetch_one(&mut *conn)
            .await?;
            if conflicts > 0 {
               return Err(Error::Constraint(format!(
                  "unique index '{}' of object store '{}' already contains this key",
                  index.name, store.name
               )));
            }
         }
         entries.push((index.name.as_str(), index_key));
      }
   }

   sqlx::query("DELETE FROM objstore_index_entries WHERE store = ? AND primary_key = ?")
      .bind(&store.name)
      .bind(&encoded)
      .execute(&mut *conn)
      .await?;

   sqlx::query("INSERT OR REPLACE INTO objstore_records (store, key, value) VALUES (?, ?, ?)")
      .bind(&store.name)
      .bind(&encoded)
      .bind(serde_json::to_string(&value)?)
      .execute(&mut *conn)
      .await?;

   for (index, index_key) in entries {
      sqlx::query(
         "INSERT OR IGNORE INTO objstore_index_entries (store, idx, key, primary_key)
          VALUES (?, ?, ?, ?)",
      )
      .bind(&store.name)
      .bind(index)
      .bind(index_key)
      .bind(&encoded)
      .execute(&mut *conn)
      .await?;
   }

   Ok(key)
}

async fn delete_range(conn: &mut SqliteConnection, store: &str, range: &KeyRange) -> Result<()> {
   range.validate()?;

   let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM objstore_index_entries WHERE store = ");
   qb.push_bind(store.to_string());
   qb.push(" AND primary_key IN (SELECT key FROM objstore_records WHERE store = ");
   qb.push_bind(store.to_string());
   push_range(&mut qb, "key", Some(range));
   qb.push(")");
   qb.build().execute(&mut *conn).await?;

   let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM objstore_records WHERE store = ");
   qb.push_bind(store.to_string());
   push_range(&mut qb, "key", Some(range));
   qb.build().execute(&mut *conn).await?;

   Ok(())
}

async fn clear(conn: &mut SqliteConnection, store: &str) -> Result<()> {
   sqlx::query("DELETE FROM objstore_index_entries WHERE store = ?")
      .bind(store)
      .execute(&mut *conn)
      .await?;
   sqlx::query("DELETE FROM objstore_records WHERE store = ?")
      .bind(store)
      .execute(&mut *conn)
      .await?;
   Ok(())
}

/// Builds entries for a newly created index from the records already stored.
pub(crate) async fn populate_index(
   conn: &mut SqliteConnection,
   store: &StoreSchema,
   index: &IndexSchema,
) -> Result<()> {
   let rows: Vec<(Vec<u8>, String)> =
      sqlx::query_as("SELECT key, value FROM objstore_records WHERE store = ?")
         .bind(&store.name)
         .fetch_all(&mut *conn)
         .await?;

   let mut seen = HashSet::new();
   for (primary_key, value) in rows {
      let value: Value = serde_json::from_str(&value)?;
      for index_key in index_keys(index, &value) {
         let index_key = index_key.encode();
         if index.unique && !seen.insert(index_key.clone()) {
            return Err(Error::Constraint(format!(
               "existing records violate unique index '{}' of object store '{}'",
               index.name, store.name
            )));
         }
         sqlx::query(
            "INSERT OR IGNORE INTO objstore_index_entries (store, idx, key, primary_key)
             VALUES (?, ?, ?, ?)",
         )
         .bind(&store.name)
         .bind(&index.name)
         .bind(index_key)
         .bind(&primary_key)
         .execute(&mut *conn)
         .await?;
      }
   }

   trace!(store = %store.name, index = %index.name, "Populated index from existing records");
   Ok(())
}
