//! Scoped transactions and the requests issued against them.
//!
//! A [`Transaction`] owns a background task that takes a connection and
//! opens the SQLite transaction when the first request arrives. Requests are
//! queued to that task and run in the order they were issued. The task commits once the [`Transaction`] handle
//! is released, either through [`Transaction::commit`] or by dropping it, and
//! rolls back if any request failed or [`Transaction::abort`] was called.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::Result;
use crate::error::Error;
use crate::exec;
use crate::key::{Key, KeyRange};
use crate::operation::{CursorDirection, Operation, Output, Source};
use crate::registry::SharedDatabase;
use crate::schema::Schema;
use crate::write_guard::WriteGuard;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
   #[default]
   ReadOnly,
   ReadWrite,
}

enum Job {
   Request {
      source: Source,
      operation: Operation,
      reply: oneshot::Sender<Result<Output>>,
   },
   Abort,
}

/// A transaction over a fixed set of object stores.
#[derive(Debug)]
pub struct Transaction {
   id: Uuid,
   mode: TransactionMode,
   scope: Arc<[String]>,
   jobs: mpsc::UnboundedSender<Job>,
   done: Option<oneshot::Receiver<Result<()>>>,
}

impl std::fmt::Debug for Job {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      match self {
         Job::Request {
            source, operation, ..
         } => f
            .debug_struct("Request")
            .field("source", source)
            .field("method", &operation.method())
            .finish(),
         Job::Abort => f.write_str("Abort"),
      }
   }
}

impl Transaction {
   /// Starts the background task. Scope validation is the caller's job.
   pub(crate) fn begin(
      shared: Arc<SharedDatabase>,
      scope: Vec<String>,
      mode: TransactionMode,
   ) -> Self {
      let id = Uuid::new_v4();
      let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
      let (done_tx, done_rx) = oneshot::channel();

      trace!(transaction = %id, ?mode, ?scope, "Beginning transaction");
      tokio::spawn(async move {
         let result = run(id, &shared, mode, jobs_rx).await;
         match &result {
            Ok(()) => trace!(transaction = %id, "Transaction committed"),
            Err(e) => debug!(transaction = %id, error = %e, "Transaction did not commit"),
         }
         let _ = done_tx.send(result);
      });

      Self {
         id,
         mode,
         scope: scope.into(),
         jobs: jobs_tx,
         done: Some(done_rx),
      }
   }

   pub fn id(&self) -> Uuid {
      self.id
   }

   pub fn mode(&self) -> TransactionMode {
      self.mode
   }

   /// Names of the object stores this transaction may touch.
   pub fn scope(&self) -> &[String] {
      &self.scope
   }

   /// Queues a request. The returned future resolves once the request ran.
   ///
   /// Requests that can never succeed in this transaction (an object store
   /// outside the scope, a write in a read-only transaction) fail right away
   /// without affecting the transaction.
   pub fn request(&self, source: Source, operation: Operation) -> Request {
      let (reply, rx) = oneshot::channel();

      if !self.scope.iter().any(|s| s == source.store_name()) {
         let _ = reply.send(Err(Error::NotFound(format!(
            "object store '{}' is not in the scope of this transaction",
            source.store_name()
         ))));
         return Request { rx };
      }
      if self.mode == TransactionMode::ReadOnly && operation.is_mutation() {
         let _ = reply.send(Err(Error::ReadOnly(source.to_string())));
         return Request { rx };
      }

      let job = Job::Request {
         source,
         operation,
         reply,
      };
      if let Err(mpsc::error::SendError(Job::Request { reply, .. })) = self.jobs.send(job) {
         let _ = reply.send(Err(Error::Aborted("transaction has finished".into())));
      }
      Request { rx }
   }

   /// Request helpers for one object store in the scope.
   pub fn object_store(&self, name: &str) -> Result<ObjectStore<'_>> {
      if !self.scope.iter().any(|s| s == name) {
         return Err(Error::NotFound(format!(
            "object store '{name}' is not in the scope of this transaction"
         )));
      }
      Ok(ObjectStore {
         transaction: self,
         source: Source::store(name),
      })
   }

   /// Request helpers for an index of an object store in the scope.
   pub fn index(&self, store: &str, index: &str) -> Result<ObjectStore<'_>> {
      self.object_store(store)?;
      Ok(ObjectStore {
         transaction: self,
         source: Source::index(store, index),
      })
   }

   /// Releases the handle so the transaction commits once its queued
   /// requests have run.
   pub fn commit(mut self) -> TransactionDone {
      TransactionDone { rx: self.done.take() }
   }

   /// Rolls the transaction back. Requests still queued fail with
   /// [`Error::Aborted`].
   pub fn abort(mut self) -> TransactionDone {
      let _ = self.jobs.send(Job::Abort);
      TransactionDone { rx: self.done.take() }
   }
}

/// Resolves once a request has run.
#[derive(Debug)]
#[must_use = "dropping a request does not cancel it, but its result is lost"]
pub struct Request {
   rx: oneshot::Receiver<Result<Output>>,
}

impl Future for Request {
   type Output = Result<Output>;

   fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
      Pin::new(&mut self.rx).poll(cx).map(|result| {
         result.unwrap_or_else(|_| Err(Error::Aborted("transaction task ended".into())))
      })
   }
}

/// Resolves once the transaction has committed or rolled back.
#[derive(Debug)]
pub struct TransactionDone {
   rx: Option<oneshot::Receiver<Result<()>>>,
}

impl Future for TransactionDone {
   type Output = Result<()>;

   fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
      let Some(rx) = self.rx.as_mut() else {
         return Poll::Ready(Err(Error::InvalidState(
            "transaction completion was already taken".into(),
         )));
      };
      Pin::new(rx).poll(cx).map(|result| {
         result.unwrap_or_else(|_| Err(Error::Aborted("transaction task ended".into())))
      })
   }
}

/// Typed request helpers bound to one store or index of a transaction.
#[derive(Debug, Clone)]
pub struct ObjectStore<'a> {
   transaction: &'a Transaction,
   source: Source,
}

impl ObjectStore<'_> {
   pub fn source(&self) -> &Source {
      &self.source
   }

   fn request(&self, operation: Operation) -> Request {
      self.transaction.request(self.source.clone(), operation)
   }

   pub fn get(&self, query: impl Into<KeyRange>) -> Request {
      self.request(Operation::Get {
         query: query.into(),
      })
   }

   pub fn get_all(&self, query: Option<KeyRange>, count: Option<u32>) -> Request {
      self.request(Operation::GetAll { query, count })
   }

   pub fn get_all_keys(&self, query: Option<KeyRange>, count: Option<u32>) -> Request {
      self.request(Operation::GetAllKeys { query, count })
   }

   pub fn get_key(&self, query: impl Into<KeyRange>) -> Request {
      self.request(Operation::GetKey {
         query: query.into(),
      })
   }

   pub fn count(&self, query: Option<KeyRange>) -> Request {
      self.request(Operation::Count { query })
   }

   pub fn open_cursor(&self, query: Option<KeyRange>, direction: CursorDirection) -> Request {
      self.request(Operation::OpenCursor { query, direction })
   }

   pub fn open_key_cursor(&self, query: Option<KeyRange>, direction: CursorDirection) -> Request {
      self.request(Operation::OpenKeyCursor { query, direction })
   }

   pub fn add(&self, value: Value, key: Option<Key>) -> Request {
      self.request(Operation::Add { value, key })
   }

   pub fn put(&self, value: Value, key: Option<Key>) -> Request {
      self.request(Operation::Put { value, key })
   }

   pub fn delete(&self, query: impl Into<KeyRange>) -> Request {
      self.request(Operation::Delete {
         query: query.into(),
      })
   }

   pub fn clear(&self) -> Request {
      self.request(Operation::Clear)
   }
}

/// The connection a transaction task runs on.
enum TransactionConnection {
   Read(PoolConnection<Sqlite>),
   Write(WriteGuard),
}

impl Deref for TransactionConnection {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      match self {
         TransactionConnection::Read(conn) => &**conn,
         TransactionConnection::Write(guard) => &**guard,
      }
   }
}

impl DerefMut for TransactionConnection {
   fn deref_mut(&mut self) -> &mut Self::Target {
      match self {
         TransactionConnection::Read(conn) => &mut **conn,
         TransactionConnection::Write(guard) => &mut **guard,
      }
   }
}

/// Takes a connection for `mode` and starts the SQLite transaction on it.
async fn open(
   shared: &SharedDatabase,
   mode: TransactionMode,
) -> Result<(TransactionConnection, Arc<Schema>)> {
   let (mut conn, begin) = match mode {
      TransactionMode::ReadOnly => (
         TransactionConnection::Read(shared.acquire_reader().await?),
         "BEGIN",
      ),
      TransactionMode::ReadWrite => (
         TransactionConnection::Write(shared.acquire_writer().await?),
         "BEGIN IMMEDIATE",
      ),
   };
   sqlx::query(begin).execute(&mut *conn).await?;
   Ok((conn, shared.schema()))
}

/// Processes queued jobs until the handle is released.
///
/// No connection is taken until the first request arrives, so idle handles
/// never hold the writer or a slot of the read pool.
async fn run(
   id: Uuid,
   shared: &SharedDatabase,
   mode: TransactionMode,
   mut jobs: mpsc::UnboundedReceiver<Job>,
) -> Result<()> {
   let mut active: Option<(TransactionConnection, Arc<Schema>)> = None;
   let mut failure: Option<String> = None;

   while let Some(job) = jobs.recv().await {
      let (source, operation, reply) = match job {
         Job::Abort => {
            failure.get_or_insert_with(|| "transaction was aborted".to_string());
            continue;
         }
         Job::Request { reply, .. } if failure.is_some() => {
            let reason = failure.clone().unwrap_or_default();
            let _ = reply.send(Err(Error::Aborted(reason)));
            continue;
         }
         Job::Request {
            source,
            operation,
            reply,
         } => (source, operation, reply),
      };

      if active.is_none() {
         match open(shared, mode).await {
            Ok(opened) => {
               trace!(transaction = %id, ?mode, "Acquired connection");
               active = Some(opened);
            }
            Err(e) => {
               debug!(transaction = %id, error = %e, "Could not start transaction");
               failure = Some(e.to_string());
               let _ = reply.send(Err(e));
               continue;
            }
         }
      }
      let Some((conn, schema)) = active.as_mut() else {
         continue;
      };

      match exec::execute(&mut **conn, &**schema, &source, operation).await {
         Ok(output) => {
            let _ = reply.send(Ok(output));
         }
         Err(e) => {
            debug!(transaction = %id, %source, error = %e, "Request failed, aborting transaction");
            failure = Some(e.to_string());
            let _ = reply.send(Err(e));
         }
      }
   }

   let Some((mut conn, _)) = active else {
      trace!(transaction = %id, "Released without running a request");
      return match failure {
         Some(reason) => Err(Error::Aborted(reason)),
         None => Ok(()),
      };
   };

   if let Some(reason) = failure {
      rollback(&mut conn, id).await;
      return Err(Error::Aborted(reason));
   }

   if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
      rollback(&mut conn, id).await;
      return Err(e.into());
   }
   Ok(())
}

async fn rollback(conn: &mut SqliteConnection, id: Uuid) {
   if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
      warn!(transaction = %id, error = %e, "Rollback failed");
   }
}
