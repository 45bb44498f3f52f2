//! Query descriptors and typed query results.
//!
//! Building a query and running it are separate steps. A
//! [`QueryDescriptor`] is a plain value naming the collection, the access
//! mode and the operation. Nothing touches the database until a
//! [`QueryStream`] built from it is polled.

use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::sync::Weak;

use futures::StreamExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use sqlx_sqlite_objstore::{Cursor, Key, Method, Operation, Output, Source, Transaction};

use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::handle::{AccessMode, StoreName};
use crate::stream::QueryStream;

/// What to run: a collection (or index), an access mode and an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
   store: StoreName,
   mode: AccessMode,
   operation: Operation,
   listen: bool,
}

impl QueryDescriptor {
   /// Fails if `store` is malformed or does not fit `mode`, or if `operation`
   /// writes and `mode` only reads.
   pub fn new(store: &str, mode: AccessMode, operation: Operation) -> Result<Self> {
      let store = StoreName::parse(store)?;
      mode.check(&store)?;
      mode.check_operation(&store, &operation)?;
      Ok(Self {
         store,
         mode,
         operation,
         listen: false,
      })
   }

   pub(crate) fn from_parts(store: StoreName, mode: AccessMode, operation: Operation) -> Self {
      Self {
         store,
         mode,
         operation,
         listen: false,
      }
   }

   /// Re-run the query after every write to its collection.
   pub fn listen(mut self, listen: bool) -> Self {
      self.listen = listen;
      self
   }

   pub fn store(&self) -> &StoreName {
      &self.store
   }

   /// The collection writes are tracked under (the base collection for
   /// index queries).
   pub fn collection(&self) -> &str {
      self.store.collection()
   }

   pub fn mode(&self) -> AccessMode {
      self.mode
   }

   pub fn operation(&self) -> &Operation {
      &self.operation
   }

   pub fn method(&self) -> Method {
      self.operation.method()
   }

   pub fn is_listening(&self) -> bool {
      self.listen
   }

   pub fn is_mutation(&self) -> bool {
      self.operation.is_mutation()
   }

   pub fn source(&self) -> Source {
      self.mode.source(&self.store)
   }

   /// Structural identity of the source and arguments, as canonical JSON.
   ///
   /// Two descriptors with equal identities run the same query.
   pub(crate) fn identity(&self) -> String {
      serde_json::to_string(&(self.source(), &self.operation))
         .unwrap_or_else(|_| format!("{}:{:?}", self.source(), self.operation))
   }
}

/// Conversion from an engine [`Output`] to the typed result of a method.
pub trait FromOutput: Clone + Send + Sync + Sized + 'static {
   fn from_output(method: Method, output: Output) -> Result<Self>;
}

macro_rules! from_output {
   ($ty:ty, $pattern:pat => $value:expr) => {
      impl FromOutput for $ty {
         fn from_output(method: Method, output: Output) -> Result<Self> {
            match output {
               $pattern => Ok($value),
               _ => Err(Error::UnexpectedOutput { method }),
            }
         }
      }
   };
}

from_output!(u64, Output::Count(n) => n);
from_output!(Option<Value>, Output::Value(value) => value);
from_output!(Vec<Value>, Output::Values(values) => values);
from_output!(Vec<Key>, Output::Keys(keys) => keys);
from_output!(Option<Key>, Output::Key(key) => key);
from_output!(Key, Output::Key(Some(key)) => key);
from_output!(Cursor, Output::Cursor(cursor) => cursor);
from_output!((), Output::Done => ());

impl FromOutput for Output {
   fn from_output(_method: Method, output: Output) -> Result<Self> {
      Ok(output)
   }
}

/// A query bound to a store handle, not yet running.
///
/// Turn it into a stream with [`Query::once`] or [`Query::live`], or await
/// it directly for a single result.
#[must_use = "queries do nothing until streamed or awaited"]
pub struct Query<T> {
   inner: Weak<ConnectionInner>,
   transaction: Transaction,
   descriptor: QueryDescriptor,
   _output: PhantomData<fn() -> T>,
}

impl<T: FromOutput> Query<T> {
   pub(crate) fn new(
      inner: Weak<ConnectionInner>,
      transaction: Transaction,
      descriptor: QueryDescriptor,
   ) -> Self {
      Self {
         inner,
         transaction,
         descriptor,
         _output: PhantomData,
      }
   }

   pub fn descriptor(&self) -> &QueryDescriptor {
      &self.descriptor
   }

   /// Runs once on the handle's transaction.
   pub fn once(self) -> QueryStream<T> {
      self.stream(false)
   }

   /// Runs on the handle's transaction, then again after every write to the
   /// collection. Writes ignore this and behave like [`Query::once`].
   pub fn live(self) -> QueryStream<T> {
      self.stream(true)
   }

   fn stream(self, listen: bool) -> QueryStream<T> {
      QueryStream::new(
         self.inner,
         Some(self.transaction),
         self.descriptor.listen(listen),
      )
   }
}

impl<T> std::fmt::Debug for Query<T> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Query")
         .field("descriptor", &self.descriptor)
         .field("transaction", &self.transaction.id())
         .finish()
   }
}

impl<T: FromOutput> IntoFuture for Query<T> {
   type Output = Result<T>;
   type IntoFuture = BoxFuture<'static, Result<T>>;

   /// Resolves once the operation has fully completed, including the
   /// transaction commit and, for writes, the re-run of live queries.
   fn into_future(self) -> Self::IntoFuture {
      Box::pin(last_value(self.once()))
   }
}

pub(crate) fn last_value<T: FromOutput>(
   mut stream: QueryStream<T>,
) -> impl Future<Output = Result<T>> + Send + 'static {
   async move {
      let mut value = None;
      while let Some(item) = stream.next().await {
         value = Some(item?);
      }
      value.ok_or(Error::NoResult)
   }
}
