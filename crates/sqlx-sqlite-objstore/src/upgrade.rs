//! Schema changes while a database is being upgraded to a new version.
//!
//! A [`VersionChange`] owns a worker task holding the writer connection with
//! an open SQLite transaction. Schema operations and batches are queued to
//! that worker and applied in the order they were issued, each inside its
//! own savepoint, so a failed operation leaves the rest of the upgrade
//! intact. The new version is only written once the change has ended
//! successfully; aborting rolls back everything.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::Result;
use crate::error::Error;
use crate::exec;
use crate::key::Key;
use crate::key_path::KeyPath;
use crate::operation::{Operation, Output, Source};
use crate::schema::{self, IndexParameters, ObjectStoreParameters, Schema};
use crate::write_guard::WriteGuard;

/// How a version change ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
   Finish,
   Abort,
}

/// What the worker hands back once the change has ended.
pub(crate) struct Ended {
   pub(crate) conn: WriteGuard,
   pub(crate) schema: Schema,
   pub(crate) outcome: Outcome,
}

#[derive(Debug)]
enum UpgradeOp {
   CreateStore {
      name: String,
      params: ObjectStoreParameters,
   },
   DeleteStore {
      name: String,
   },
   CreateIndex {
      store: String,
      name: String,
      key_path: KeyPath,
      params: IndexParameters,
   },
   DeleteIndex {
      store: String,
      name: String,
   },
   Request {
      source: Source,
      operation: Operation,
   },
}

impl UpgradeOp {
   fn store(&self) -> &str {
      match self {
         UpgradeOp::CreateStore { name, .. } | UpgradeOp::DeleteStore { name } => name,
         UpgradeOp::CreateIndex { store, .. } | UpgradeOp::DeleteIndex { store, .. } => store,
         UpgradeOp::Request { source, .. } => source.store_name(),
      }
   }
}

enum UpgradeJob {
   Batch {
      scope: Option<Vec<String>>,
      ops: Vec<UpgradeOp>,
      reply: oneshot::Sender<Result<Vec<Output>>>,
   },
   End(Outcome),
}

fn ended() -> Error {
   Error::InvalidState("version change has already ended".into())
}

/// Queues a batch right away and returns a future for its result.
fn submit(
   jobs: &mpsc::UnboundedSender<UpgradeJob>,
   scope: Option<Vec<String>>,
   ops: Vec<UpgradeOp>,
) -> impl Future<Output = Result<Vec<Output>>> + Send + 'static {
   let (reply, rx) = oneshot::channel();
   let sent = jobs.send(UpgradeJob::Batch { scope, ops, reply }).is_ok();
   async move {
      if !sent {
         return Err(ended());
      }
      rx.await.unwrap_or_else(|_| Err(ended()))
   }
}

/// Handle given to the caller while an open request upgrades the database.
///
/// Dropping it has the same effect as [`VersionChange::finish`].
#[derive(Debug)]
pub struct VersionChange {
   old_version: u32,
   new_version: u32,
   schema: Arc<Mutex<Schema>>,
   jobs: mpsc::UnboundedSender<UpgradeJob>,
   ended: bool,
}

impl std::fmt::Debug for UpgradeJob {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      match self {
         UpgradeJob::Batch { scope, ops, .. } => f
            .debug_struct("Batch")
            .field("scope", scope)
            .field("ops", &ops.len())
            .finish(),
         UpgradeJob::End(outcome) => f.debug_tuple("End").field(outcome).finish(),
      }
   }
}

impl VersionChange {
   /// Starts the worker. The returned handle resolves once the change has
   /// ended, giving the writer back to the open request.
   pub(crate) fn begin(
      old_version: u32,
      new_version: u32,
      conn: WriteGuard,
      schema: Schema,
   ) -> (Self, JoinHandle<Ended>) {
      let schema = Arc::new(Mutex::new(schema));
      let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
      let worker = tokio::spawn(run_worker(conn, Arc::clone(&schema), jobs_rx));

      let change = Self {
         old_version,
         new_version,
         schema,
         jobs: jobs_tx,
         ended: false,
      };
      (change, worker)
   }

   /// Version stored before this upgrade (0 for a new database).
   pub fn old_version(&self) -> u32 {
      self.old_version
   }

   pub fn new_version(&self) -> u32 {
      self.new_version
   }

   pub fn object_store_names(&self) -> Vec<String> {
      self.schema.lock().store_names()
   }

   pub fn contains(&self, name: &str) -> bool {
      self.schema.lock().contains(name)
   }

   /// Snapshot of the schema as modified so far.
   pub fn schema(&self) -> Schema {
      self.schema.lock().clone()
   }

   pub async fn create_object_store(
      &self,
      name: &str,
      params: ObjectStoreParameters,
   ) -> Result<()> {
      let op = UpgradeOp::CreateStore {
         name: name.to_string(),
         params,
      };
      submit(&self.jobs, None, vec![op]).await?;
      Ok(())
   }

   pub async fn delete_object_store(&self, name: &str) -> Result<()> {
      let op = UpgradeOp::DeleteStore {
         name: name.to_string(),
      };
      submit(&self.jobs, None, vec![op]).await?;
      Ok(())
   }

   /// Creates an index and indexes the records already in the store.
   pub async fn create_index(
      &self,
      store: &str,
      name: &str,
      key_path: impl Into<KeyPath>,
      params: IndexParameters,
   ) -> Result<()> {
      let op = UpgradeOp::CreateIndex {
         store: store.to_string(),
         name: name.to_string(),
         key_path: key_path.into(),
         params,
      };
      submit(&self.jobs, None, vec![op]).await?;
      Ok(())
   }

   pub async fn delete_index(&self, store: &str, name: &str) -> Result<()> {
      let op = UpgradeOp::DeleteIndex {
         store: store.to_string(),
         name: name.to_string(),
      };
      submit(&self.jobs, None, vec![op]).await?;
      Ok(())
   }

   /// Writes a record, returning its primary key.
   pub async fn put(&self, store: &str, value: Value, key: Option<Key>) -> Result<Key> {
      let output = self
         .request(Source::store(store), Operation::Put { value, key })
         .await?;
      match output {
         Output::Key(Some(key)) => Ok(key),
         other => Err(Error::InvalidState(format!("put returned {other:?}"))),
      }
   }

   /// Runs any request as part of the upgrade.
   pub async fn request(&self, source: Source, operation: Operation) -> Result<Output> {
      let op = UpgradeOp::Request { source, operation };
      let mut outputs = submit(&self.jobs, None, vec![op]).await?;
      outputs
         .pop()
         .ok_or_else(|| Error::InvalidState("request produced no output".into()))
   }

   /// Starts a batch of changes scoped to existing object stores.
   ///
   /// Nothing runs until [`UpgradeTransaction::commit`], which queues the
   /// batch behind everything issued before it.
   pub fn transaction<I, S>(&self, stores: I) -> Result<UpgradeTransaction>
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      let scope: Vec<String> = stores.into_iter().map(Into::into).collect();
      {
         let schema = self.schema.lock();
         for store in &scope {
            schema.require_store(store)?;
         }
      }
      Ok(UpgradeTransaction {
         scope,
         ops: Vec::new(),
         jobs: self.jobs.clone(),
      })
   }

   /// Ends the upgrade and lets the open request commit it.
   pub fn finish(mut self) {
      self.end(Outcome::Finish);
   }

   /// Ends the upgrade and rolls back every change made during it.
   pub fn abort(mut self) {
      self.end(Outcome::Abort);
   }

   fn end(&mut self, outcome: Outcome) {
      if !self.ended {
         self.ended = true;
         trace!(
            old_version = self.old_version,
            new_version = self.new_version,
            ?outcome,
            "Version change ended"
         );
         let _ = self.jobs.send(UpgradeJob::End(outcome));
      }
   }
}

impl Drop for VersionChange {
   fn drop(&mut self) {
      self.end(Outcome::Finish);
   }
}

/// A batch of index changes and writes scoped to a set of object stores,
/// applied atomically within a version change.
#[derive(Debug)]
#[must_use = "an upgrade transaction does nothing until committed"]
pub struct UpgradeTransaction {
   scope: Vec<String>,
   ops: Vec<UpgradeOp>,
   jobs: mpsc::UnboundedSender<UpgradeJob>,
}

impl UpgradeTransaction {
   pub fn scope(&self) -> &[String] {
      &self.scope
   }

   pub fn create_index(
      &mut self,
      store: &str,
      name: &str,
      key_path: impl Into<KeyPath>,
      params: IndexParameters,
   ) -> &mut Self {
      self.ops.push(UpgradeOp::CreateIndex {
         store: store.to_string(),
         name: name.to_string(),
         key_path: key_path.into(),
         params,
      });
      self
   }

   pub fn delete_index(&mut self, store: &str, name: &str) -> &mut Self {
      self.ops.push(UpgradeOp::DeleteIndex {
         store: store.to_string(),
         name: name.to_string(),
      });
      self
   }

   pub fn put(&mut self, store: &str, value: Value, key: Option<Key>) -> &mut Self {
      self.request(Source::store(store), Operation::Put { value, key })
   }

   pub fn request(&mut self, source: Source, operation: Operation) -> &mut Self {
      self.ops.push(UpgradeOp::Request { source, operation });
      self
   }

   /// Queues the batch. Either every change lands or none does.
   ///
   /// The batch is ordered when this is called, not when the returned
   /// future is first polled.
   pub fn commit(self) -> BoxFuture<'static, Result<()>> {
      let result = submit(&self.jobs, Some(self.scope), self.ops);
      Box::pin(async move {
         result.await?;
         Ok(())
      })
   }
}

async fn run_worker(
   mut conn: WriteGuard,
   schema: Arc<Mutex<Schema>>,
   mut jobs: mpsc::UnboundedReceiver<UpgradeJob>,
) -> Ended {
   let mut outcome = Outcome::Finish;
   while let Some(job) = jobs.recv().await {
      match job {
         UpgradeJob::End(end) => {
            outcome = end;
            break;
         }
         UpgradeJob::Batch { scope, ops, reply } => {
            let result = apply_in_savepoint(&mut conn, &schema, scope.as_deref(), ops).await;
            let _ = reply.send(result);
         }
      }
   }

   let schema = schema.lock().clone();
   Ended {
      conn,
      schema,
      outcome,
   }
}

async fn apply_in_savepoint(
   conn: &mut SqliteConnection,
   shared_schema: &Mutex<Schema>,
   scope: Option<&[String]>,
   ops: Vec<UpgradeOp>,
) -> Result<Vec<Output>> {
   sqlx::query("SAVEPOINT objstore_upgrade")
      .execute(&mut *conn)
      .await?;

   let mut schema = shared_schema.lock().clone();
   match apply(&mut *conn, &mut schema, scope, ops).await {
      Ok(outputs) => {
         sqlx::query("RELEASE SAVEPOINT objstore_upgrade")
            .execute(&mut *conn)
            .await?;
         *shared_schema.lock() = schema;
         Ok(outputs)
      }
      Err(e) => {
         for sql in [
            "ROLLBACK TO SAVEPOINT objstore_upgrade",
            "RELEASE SAVEPOINT objstore_upgrade",
         ] {
            if let Err(rollback_err) = sqlx::query(sql).execute(&mut *conn).await {
               warn!(error = %rollback_err, "Failed to roll back upgrade savepoint");
            }
         }
         Err(e)
      }
   }
}

async fn apply(
   conn: &mut SqliteConnection,
   schema: &mut Schema,
   scope: Option<&[String]>,
   ops: Vec<UpgradeOp>,
) -> Result<Vec<Output>> {
   let mut outputs = Vec::new();
   for op in ops {
      if let Some(scope) = scope
         && !scope.iter().any(|s| s == op.store())
      {
         return Err(Error::NotFound(format!(
            "object store '{}' is not in the scope of this transaction",
            op.store()
         )));
      }

      trace!(?op, "Applying upgrade operation");
      match op {
         UpgradeOp::CreateStore { name, params } => {
            schema::create_store(conn, schema, &name, &params).await?;
         }
         UpgradeOp::DeleteStore { name } => {
            schema::delete_store(conn, schema, &name).await?;
         }
         UpgradeOp::CreateIndex {
            store,
            name,
            key_path,
            params,
         } => {
            schema::create_index(conn, schema, &store, &name, &key_path, params).await?;
            let store_schema = schema.require_store(&store)?;
            let index_schema = schema.require_index(&store, &name)?;
            exec::populate_index(conn, store_schema, index_schema).await?;
         }
         UpgradeOp::DeleteIndex { store, name } => {
            schema::delete_index(conn, schema, &store, &name).await?;
         }
         UpgradeOp::Request { source, operation } => {
            outputs.push(exec::execute(conn, schema, &source, operation).await?);
         }
      }
   }
   Ok(outputs)
}
