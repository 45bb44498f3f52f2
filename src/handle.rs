//! Store handles: one collection (or index) opened in a fixed access mode.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Weak;

use serde::Serialize;
use serde_json::Value;
use sqlx_sqlite_objstore::{
   Cursor, CursorDirection, Key, KeyRange, Operation, Source, Transaction, TransactionMode,
};

use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::query::{FromOutput, Query, QueryDescriptor};

/// A parsed `"collection"` or `"collection.index"` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreName {
   collection: String,
   #[serde(skip_serializing_if = "Option::is_none")]
   index: Option<String>,
}

impl StoreName {
   /// Accepts `"collection"` or `"collection.index"` with non-empty
   /// segments.
   pub fn parse(name: &str) -> Result<Self> {
      let mut segments = name.split('.');
      let collection = segments.next().unwrap_or_default();
      let index = segments.next();

      if collection.is_empty() || index.is_some_and(str::is_empty) || segments.next().is_some() {
         return Err(Error::InvalidStoreName(name.to_string()));
      }

      Ok(Self {
         collection: collection.to_string(),
         index: index.map(str::to_string),
      })
   }

   pub fn collection(&self) -> &str {
      &self.collection
   }

   pub fn index(&self) -> Option<&str> {
      self.index.as_deref()
   }
}

impl fmt::Display for StoreName {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match &self.index {
         Some(index) => write!(f, "{}.{index}", self.collection),
         None => f.write_str(&self.collection),
      }
   }
}

/// How a store handle accesses its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessMode {
   ReadOnly,
   ReadWrite,
   /// Read-only access through an index of the collection.
   Indexed,
}

struct Dispatch {
   transaction: TransactionMode,
   indexed: bool,
}

const DISPATCH: [Dispatch; 3] = [
   Dispatch {
      transaction: TransactionMode::ReadOnly,
      indexed: false,
   },
   Dispatch {
      transaction: TransactionMode::ReadWrite,
      indexed: false,
   },
   Dispatch {
      transaction: TransactionMode::ReadOnly,
      indexed: true,
   },
];

impl AccessMode {
   fn dispatch(self) -> &'static Dispatch {
      // Rows are in declaration order
      &DISPATCH[self as usize]
   }

   pub fn transaction_mode(self) -> TransactionMode {
      self.dispatch().transaction
   }

   /// Index modes need a dotted name, the others reject one.
   pub(crate) fn check(self, store: &StoreName) -> Result<()> {
      if self.dispatch().indexed != store.index.is_some() {
         return Err(Error::InvalidStoreName(store.to_string()));
      }
      Ok(())
   }

   /// Only read-write access may run writes.
   pub(crate) fn check_operation(self, store: &StoreName, operation: &Operation) -> Result<()> {
      if operation.is_mutation() && self.transaction_mode() != TransactionMode::ReadWrite {
         return Err(Error::ReadOnlyAccess {
            store: store.to_string(),
            method: operation.method(),
         });
      }
      Ok(())
   }

   pub(crate) fn source(self, store: &StoreName) -> Source {
      match (&store.index, self.dispatch().indexed) {
         (Some(index), true) => Source::index(&store.collection, index),
         _ => Source::store(&store.collection),
      }
   }
}

/// Access marker for handles that only read: [`AccessMode::ReadOnly`] and
/// [`AccessMode::Indexed`].
#[derive(Debug)]
pub enum Reader {}

/// Access marker for [`AccessMode::ReadWrite`] handles, which also write.
#[derive(Debug)]
pub enum Writer {}

/// One collection or index opened in a fixed access mode.
///
/// The engine transaction is started when the handle is created; it takes a
/// database connection only once a query runs. Each operation consumes the
/// handle and returns a [`Query`] that runs on that transaction.
///
/// Write methods exist only on handles from
/// [`Connection::readwrite`](crate::Connection::readwrite):
///
/// ```compile_fail
/// # async fn example(conn: reactive_objstore::Connection) -> reactive_objstore::Result<()> {
/// conn.readonly("users")?.add(serde_json::json!({ "id": 1 }), None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StoreHandle<A = Reader> {
   inner: Weak<ConnectionInner>,
   store: StoreName,
   mode: AccessMode,
   transaction: Transaction,
   _access: PhantomData<fn() -> A>,
}

impl<A> StoreHandle<A> {
   pub(crate) fn new(
      inner: Weak<ConnectionInner>,
      store: StoreName,
      mode: AccessMode,
      transaction: Transaction,
   ) -> Self {
      Self {
         inner,
         store,
         mode,
         transaction,
         _access: PhantomData,
      }
   }

   pub fn store(&self) -> &StoreName {
      &self.store
   }

   pub fn mode(&self) -> AccessMode {
      self.mode
   }

   fn query<T: FromOutput>(self, operation: Operation) -> Query<T> {
      let descriptor = QueryDescriptor::from_parts(self.store, self.mode, operation);
      Query::new(self.inner, self.transaction, descriptor)
   }

   pub fn count(self, query: Option<KeyRange>) -> Query<u64> {
      self.query(Operation::Count { query })
   }

   pub fn get(self, query: impl Into<KeyRange>) -> Query<Option<Value>> {
      self.query(Operation::Get {
         query: query.into(),
      })
   }

   pub fn get_all(self, query: Option<KeyRange>, count: Option<u32>) -> Query<Vec<Value>> {
      self.query(Operation::GetAll { query, count })
   }

   pub fn get_all_keys(self, query: Option<KeyRange>, count: Option<u32>) -> Query<Vec<Key>> {
      self.query(Operation::GetAllKeys { query, count })
   }

   pub fn get_key(self, query: impl Into<KeyRange>) -> Query<Option<Key>> {
      self.query(Operation::GetKey {
         query: query.into(),
      })
   }

   pub fn open_cursor(self, query: Option<KeyRange>, direction: CursorDirection) -> Query<Cursor> {
      self.query(Operation::OpenCursor { query, direction })
   }

   pub fn open_key_cursor(
      self,
      query: Option<KeyRange>,
      direction: CursorDirection,
   ) -> Query<Cursor> {
      self.query(Operation::OpenKeyCursor { query, direction })
   }
}

impl StoreHandle<Writer> {
   /// Adds a record. Fails if the key already exists.
   pub fn add(self, value: Value, key: Option<Key>) -> Query<Key> {
      self.query(Operation::Add { value, key })
   }

   /// Adds or replaces a record.
   pub fn put(self, value: Value, key: Option<Key>) -> Query<Key> {
      self.query(Operation::Put { value, key })
   }

   pub fn delete(self, query: impl Into<KeyRange>) -> Query<()> {
      self.query(Operation::Delete {
         query: query.into(),
      })
   }

   pub fn clear(self) -> Query<()> {
      self.query(Operation::Clear)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_parse_store_names() {
      let plain = StoreName::parse("users").unwrap();
      assert_eq!(plain.collection(), "users");
      assert_eq!(plain.index(), None);

      let indexed = StoreName::parse("users.byEmail").unwrap();
      assert_eq!(indexed.collection(), "users");
      assert_eq!(indexed.index(), Some("byEmail"));
      assert_eq!(indexed.to_string(), "users.byEmail");

      for bad in ["", ".", "users.", ".byEmail", "a.b.c"] {
         assert!(
            matches!(StoreName::parse(bad), Err(Error::InvalidStoreName(_))),
            "{bad:?} should be rejected"
         );
      }
   }

   #[test]
   fn test_dispatch_table() {
      let users = StoreName::parse("users").unwrap();
      let by_email = StoreName::parse("users.byEmail").unwrap();

      assert_eq!(AccessMode::ReadOnly.transaction_mode(), TransactionMode::ReadOnly);
      assert_eq!(AccessMode::ReadWrite.transaction_mode(), TransactionMode::ReadWrite);
      assert_eq!(AccessMode::Indexed.transaction_mode(), TransactionMode::ReadOnly);

      assert_eq!(AccessMode::ReadWrite.source(&users), Source::store("users"));
      assert_eq!(
         AccessMode::Indexed.source(&by_email),
         Source::index("users", "byEmail")
      );

      assert!(AccessMode::ReadOnly.check(&users).is_ok());
      assert!(AccessMode::ReadOnly.check(&by_email).is_err());
      assert!(AccessMode::Indexed.check(&users).is_err());
      assert!(AccessMode::Indexed.check(&by_email).is_ok());
   }

   #[test]
   fn test_only_read_write_access_writes() {
      let users = StoreName::parse("users").unwrap();
      let by_email = StoreName::parse("users.byEmail").unwrap();
      let add = Operation::Add {
         value: serde_json::json!({"id": 1}),
         key: None,
      };
      let count = Operation::Count { query: None };

      assert!(AccessMode::ReadWrite.check_operation(&users, &add).is_ok());
      assert!(AccessMode::ReadOnly.check_operation(&users, &count).is_ok());
      match AccessMode::ReadOnly.check_operation(&users, &add) {
         Err(Error::ReadOnlyAccess { store, method }) => {
            assert_eq!(store, "users");
            assert_eq!(method, sqlx_sqlite_objstore::Method::Add);
         }
         other => panic!("expected read-only access error, got {other:?}"),
      }
      assert!(matches!(
         AccessMode::Indexed.check_operation(&by_email, &Operation::Clear),
         Err(Error::ReadOnlyAccess { .. })
      ));
   }
}
