//! Opening, versioning and closing object databases

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::Result;
use crate::config::ObjectDatabaseConfig;
use crate::error::Error;
use crate::registry::{self, SharedDatabase, VersionChangeEvent};
use crate::schema;
use crate::transaction::{Transaction, TransactionMode};
use crate::upgrade::{Ended, Outcome, VersionChange};
use crate::write_guard::WriteGuard;

/// An open connection to an object database.
///
/// Connections to the same file share their connection pools. The
/// connection stays registered until [`ObjectDatabase::close`] is called or
/// it is dropped; while it is registered, upgrades requested by other
/// connections are blocked.
///
/// # Example
///
/// ```no_run
/// use futures::StreamExt;
/// use sqlx_sqlite_objstore::{ObjectDatabase, ObjectStoreParameters, OpenEvent};
///
/// # async fn example() -> Result<(), sqlx_sqlite_objstore::Error> {
/// let mut request = ObjectDatabase::open("app.db", Some(1), Default::default());
/// while let Some(event) = request.next().await {
///    match event {
///       OpenEvent::UpgradeNeeded(change) => {
///          change
///             .create_object_store("users", ObjectStoreParameters::new().key_path("id"))
///             .await?;
///       }
///       OpenEvent::Success(db) => {
///          println!("opened {} at version {}", db.name(), db.version());
///       }
///       OpenEvent::Error(e) => return Err(e),
///       OpenEvent::Blocked { .. } => {}
///    }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ObjectDatabase {
   id: u64,
   version: u32,
   shared: Arc<SharedDatabase>,
   version_changes: broadcast::Sender<VersionChangeEvent>,
   closed: AtomicBool,
}

impl ObjectDatabase {
   /// Opens `path`, upgrading it to `version` if that is newer than the
   /// stored version.
   ///
   /// With `version` set to `None` the stored version is used, or 1 for a
   /// new database. Must be called from within a tokio runtime.
   pub fn open(
      path: impl AsRef<Path>,
      version: Option<u32>,
      config: ObjectDatabaseConfig,
   ) -> OpenRequest {
      let path = path.as_ref().to_path_buf();
      let (tx, rx) = mpsc::unbounded_channel();

      tokio::spawn(async move {
         let event = match open(&path, version, &config, &tx).await {
            Ok(db) => OpenEvent::Success(db),
            Err(e) => {
               debug!(path = %path.display(), error = %e, "Open request failed");
               OpenEvent::Error(e)
            }
         };
         let _ = tx.send(event);
      });

      OpenRequest { events: rx }
   }

   fn register(shared: Arc<SharedDatabase>, version: u32) -> Self {
      let (id, version_changes) = shared.register_connection();
      Self {
         id,
         version,
         shared,
         version_changes,
         closed: AtomicBool::new(false),
      }
   }

   /// File stem of the database path.
   pub fn name(&self) -> String {
      self
         .shared
         .path()
         .file_stem()
         .map(|stem| stem.to_string_lossy().into_owned())
         .unwrap_or_default()
   }

   /// Canonical path of the database file.
   pub fn path(&self) -> &Path {
      self.shared.path()
   }

   pub fn version(&self) -> u32 {
      self.version
   }

   /// Object store names in sorted order.
   pub fn object_store_names(&self) -> Vec<String> {
      self.shared.schema().store_names()
   }

   /// Whether an index exists on an object store.
   pub fn has_index(&self, store: &str, index: &str) -> bool {
      self
         .shared
         .schema()
         .store(store)
         .is_some_and(|s| s.index(index).is_some())
   }

   /// Starts a transaction scoped to `stores`.
   pub fn transaction<I, S>(&self, stores: I, mode: TransactionMode) -> Result<Transaction>
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }

      let scope: Vec<String> = stores.into_iter().map(Into::into).collect();
      if scope.is_empty() {
         return Err(Error::InvalidState(
            "a transaction needs at least one object store".into(),
         ));
      }
      let schema = self.shared.schema();
      for store in &scope {
         schema.require_store(store)?;
      }

      Ok(Transaction::begin(Arc::clone(&self.shared), scope, mode))
   }

   /// Notifications sent when another connection wants to upgrade or delete
   /// this database. The receiver should close this connection.
   pub fn version_changes(&self) -> broadcast::Receiver<VersionChangeEvent> {
      self.version_changes.subscribe()
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::SeqCst)
   }

   /// Closes the connection. Transactions already started run to completion.
   pub fn close(&self) {
      if !self.closed.swap(true, Ordering::SeqCst) {
         self.shared.unregister_connection(self.id);
         debug!(path = %self.shared.path().display(), connection = self.id, "Closed connection");
      }
   }
}

impl Drop for ObjectDatabase {
   fn drop(&mut self) {
      self.close();
   }
}

/// Events produced while opening a database.
#[derive(Debug)]
pub enum OpenEvent {
   /// Other connections must close before the upgrade can start.
   Blocked { old_version: u32, new_version: u32 },
   /// The stored version is older than the requested one. The open request
   /// waits until the [`VersionChange`] is finished, aborted or dropped.
   UpgradeNeeded(VersionChange),
   Success(ObjectDatabase),
   Error(Error),
}

/// Stream of [`OpenEvent`]s ending with `Success` or `Error`.
#[derive(Debug)]
pub struct OpenRequest {
   events: mpsc::UnboundedReceiver<OpenEvent>,
}

impl Stream for OpenRequest {
   type Item = OpenEvent;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      self.events.poll_recv(cx)
   }
}

async fn open(
   path: &Path,
   version: Option<u32>,
   config: &ObjectDatabaseConfig,
   events: &mpsc::UnboundedSender<OpenEvent>,
) -> Result<ObjectDatabase> {
   if version == Some(0) {
      return Err(Error::InvalidVersion(0));
   }

   let shared = registry::get_or_open(path, config).await?;
   let _open = shared.open_lock.lock().await;

   let mut writer = shared.acquire_writer().await?;
   schema::ensure_meta_tables(&mut writer).await?;
   let stored = stored_version(&mut writer).await?;
   let requested = version.unwrap_or(stored.max(1));

   if requested < stored {
      return Err(Error::VersionError { requested, stored });
   }

   if requested == stored {
      let schema = schema::load(&mut writer).await?;
      drop(writer);
      shared.set_schema(schema, stored);
      return Ok(ObjectDatabase::register(Arc::clone(&shared), stored));
   }

   // The writer is released while blocked so transactions on the other
   // connections can still finish
   drop(writer);
   let open = shared.notify_version_change(VersionChangeEvent {
      old_version: stored,
      new_version: Some(requested),
   });
   if open > 0 {
      warn!(
         path = %shared.path().display(),
         open,
         old_version = stored,
         new_version = requested,
         "Upgrade blocked by open connections"
      );
      let _ = events.send(OpenEvent::Blocked {
         old_version: stored,
         new_version: requested,
      });
      shared.wait_for_connections_closed().await;
   }

   let mut writer = shared.acquire_writer().await?;
   sqlx::query("BEGIN IMMEDIATE").execute(&mut *writer).await?;
   let schema = match schema::load(&mut writer).await {
      Ok(schema) => schema,
      Err(e) => {
         rollback(&mut writer).await;
         return Err(e);
      }
   };

   debug!(
      path = %shared.path().display(),
      old_version = stored,
      new_version = requested,
      "Upgrade needed"
   );
   let (change, worker) = VersionChange::begin(stored, requested, writer, schema);
   // If the caller went away the change is dropped here, which finishes it
   let _ = events.send(OpenEvent::UpgradeNeeded(change));

   let Ok(Ended {
      conn: mut writer,
      schema,
      outcome,
   }) = worker.await
   else {
      return Err(Error::InvalidState("version change lost its connection".into()));
   };

   if outcome == Outcome::Abort {
      rollback(&mut writer).await;
      return Err(Error::Aborted(format!(
         "upgrade from version {stored} to {requested} was aborted"
      )));
   }

   if let Err(e) = commit_version(&mut writer, requested).await {
      error!(path = %shared.path().display(), error = %e, "Failed to commit upgrade");
      rollback(&mut writer).await;
      return Err(e);
   }
   drop(writer);

   shared.set_schema(schema, requested);
   debug!(path = %shared.path().display(), version = requested, "Upgrade committed");
   Ok(ObjectDatabase::register(Arc::clone(&shared), requested))
}

async fn stored_version(writer: &mut WriteGuard) -> Result<u32> {
   let version: i64 = sqlx::query_scalar("PRAGMA user_version")
      .fetch_one(&mut **writer)
      .await?;
   Ok(u32::try_from(version).unwrap_or(0))
}

async fn commit_version(writer: &mut WriteGuard, version: u32) -> Result<()> {
   // PRAGMA arguments cannot be bound
   sqlx::query(&format!("PRAGMA user_version = {version}"))
      .execute(&mut **writer)
      .await?;
   sqlx::query("COMMIT").execute(&mut **writer).await?;
   Ok(())
}

async fn rollback(writer: &mut WriteGuard) {
   if let Err(e) = sqlx::query("ROLLBACK").execute(&mut **writer).await {
      warn!(error = %e, "Rollback failed");
   }
}
