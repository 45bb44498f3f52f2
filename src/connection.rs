//! Connections: an open, migrated database plus its live-query state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use sqlx_sqlite_objstore::{self as engine, ObjectDatabase, Output, Transaction, VersionChangeEvent};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::bridge::Completion;
use crate::change::{ChangeEvent, ChangeKind, ChangeStream};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::handle::{AccessMode, Reader, StoreHandle, StoreName, Writer};
use crate::migration::{MigrationEngine, MigrationPlan, OpenState};
use crate::query::QueryDescriptor;
use crate::stream::QueryStream;
use crate::subscriptions::{ListenerKey, ListenerRegistry};

/// Opens `path` at `version`, applying `plan` if the database needs an
/// upgrade.
///
/// # Example
///
/// ```no_run
/// use reactive_objstore::{CreateStore, IndexDefinition, MigrationPlan, MigrationStep, open_connection};
/// use serde_json::json;
///
/// # async fn example() -> reactive_objstore::Result<()> {
/// let plan = MigrationPlan::new().step(
///    0,
///    1,
///    MigrationStep::new().create(
///       CreateStore::new("users")
///          .key_path("id")
///          .index(IndexDefinition::new("byEmail", "email").unique(true)),
///    ),
/// );
/// let conn = open_connection("app.db", Some(1), plan).await?;
///
/// conn.readwrite("users")?
///    .add(json!({ "id": 1, "email": "a@x.com" }), None)
///    .await?;
/// let user = conn.index("users.byEmail")?.get("a@x.com").await?;
/// assert_eq!(user, Some(json!({ "id": 1, "email": "a@x.com" })));
/// # Ok(())
/// # }
/// ```
pub async fn open_connection(
   path: impl AsRef<Path>,
   version: Option<u32>,
   plan: MigrationPlan,
) -> Result<Connection> {
   let mut builder = Connection::builder(path).plan(plan);
   if let Some(version) = version {
      builder = builder.version(version);
   }
   builder.open().await
}

/// Options for opening a [`Connection`].
#[derive(Debug)]
pub struct ConnectionBuilder {
   path: PathBuf,
   version: Option<u32>,
   plan: MigrationPlan,
   config: ConnectionConfig,
   state: watch::Sender<OpenState>,
}

impl ConnectionBuilder {
   /// Target version. Defaults to the stored version, or 1 for a new
   /// database.
   pub fn version(mut self, version: u32) -> Self {
      self.version = Some(version);
      self
   }

   pub fn plan(mut self, plan: MigrationPlan) -> Self {
      self.plan = plan;
      self
   }

   pub fn config(mut self, config: ConnectionConfig) -> Self {
      self.config = config;
      self
   }

   /// Progress of the open sequence. The channel closes once the open
   /// finishes.
   pub fn watch_state(&self) -> watch::Receiver<OpenState> {
      self.state.subscribe()
   }

   pub async fn open(self) -> Result<Connection> {
      let capacity = self.config.change_channel_capacity;
      let engine = MigrationEngine::new(self.path, self.version, self.plan, self.config, self.state);
      let db = engine.run().await?;
      Ok(Connection::new(db, capacity))
   }
}

pub(crate) struct ConnectionInner {
   db: ObjectDatabase,
   registry: Arc<ListenerRegistry>,
   changes: broadcast::Sender<ChangeEvent>,
}

impl ConnectionInner {
   pub(crate) fn registry(&self) -> &Arc<ListenerRegistry> {
      &self.registry
   }

   pub(crate) fn is_closed(&self) -> bool {
      self.db.is_closed()
   }

   pub(crate) fn begin(&self, descriptor: &QueryDescriptor) -> Result<Transaction> {
      self.begin_store(descriptor.store(), descriptor.mode())
   }

   /// Starts a transaction on the base collection of `store`.
   fn begin_store(&self, store: &StoreName, mode: AccessMode) -> Result<Transaction> {
      if let Some(index) = store.index()
         && !self.db.has_index(store.collection(), index)
      {
         return Err(Error::transaction(engine::Error::NotFound(format!(
            "index '{index}' on object store '{}'",
            store.collection()
         ))));
      }
      self
         .db
         .transaction([store.collection()], mode.transaction_mode())
         .map_err(|e| match e {
            engine::Error::DatabaseClosed => Error::ConnectionClosed,
            e => Error::transaction(e),
         })
   }

   /// Runs a listener's query on a fresh transaction.
   async fn rerun(&self, descriptor: &QueryDescriptor) -> Result<Output> {
      let transaction = self.begin(descriptor)?;
      let request = Completion::new(
         transaction.request(descriptor.source(), descriptor.operation().clone()),
      );
      let committed = Completion::new(transaction.commit());

      let output = request.observe().await.map_err(Error::Operation)?;
      committed.observe().await.map_err(Error::Transaction)?;
      Ok(output)
   }

   /// Re-runs every live query on the written collection, then announces the
   /// change.
   pub(crate) async fn publish(&self, write: &QueryDescriptor, output: &Output) {
      let collection = write.collection();
      let listeners = self.registry.listeners(collection);
      trace!(collection, listeners = listeners.len(), "Re-running live queries");

      join_all(listeners.into_iter().map(|(descriptor, subscribers)| async move {
         let result = self.rerun(&descriptor).await;
         for subscriber in subscribers {
            let _ = subscriber.send(result.clone());
         }
      }))
      .await;

      if let Some(kind) = ChangeKind::from_method(write.method()) {
         let key = match output {
            Output::Key(key) => key.clone(),
            _ => None,
         };
         // No receivers is fine
         let _ = self.changes.send(ChangeEvent {
            collection: collection.to_string(),
            kind,
            key,
         });
      }
   }
}

/// An open, migrated database.
///
/// Store handles and query streams only hold weak references; once the
/// connection is closed or dropped they fail with
/// [`Error::ConnectionClosed`] and live queries end.
pub struct Connection {
   inner: Arc<ConnectionInner>,
}

impl Connection {
   pub fn builder(path: impl AsRef<Path>) -> ConnectionBuilder {
      let (state, _) = watch::channel(OpenState::Closed);
      ConnectionBuilder {
         path: path.as_ref().to_path_buf(),
         version: None,
         plan: MigrationPlan::new(),
         config: ConnectionConfig::default(),
         state,
      }
   }

   fn new(db: ObjectDatabase, change_channel_capacity: usize) -> Self {
      let (changes, _) = broadcast::channel(change_channel_capacity.max(1));
      Self {
         inner: Arc::new(ConnectionInner {
            db,
            registry: ListenerRegistry::new(),
            changes,
         }),
      }
   }

   fn weak(&self) -> Weak<ConnectionInner> {
      Arc::downgrade(&self.inner)
   }

   pub fn name(&self) -> String {
      self.inner.db.name()
   }

   pub fn version(&self) -> u32 {
      self.inner.db.version()
   }

   pub fn collection_names(&self) -> Vec<String> {
      self.inner.db.object_store_names()
   }

   /// Opens a collection for reading.
   pub fn readonly(&self, name: &str) -> Result<StoreHandle<Reader>> {
      self.handle(name, AccessMode::ReadOnly)
   }

   /// Opens a collection for reading and writing.
   pub fn readwrite(&self, name: &str) -> Result<StoreHandle<Writer>> {
      self.handle(name, AccessMode::ReadWrite)
   }

   /// Opens an index for reading, named `"collection.index"`.
   pub fn index(&self, name: &str) -> Result<StoreHandle<Reader>> {
      self.handle(name, AccessMode::Indexed)
   }

   fn handle<A>(&self, name: &str, mode: AccessMode) -> Result<StoreHandle<A>> {
      let store = StoreName::parse(name)?;
      mode.check(&store)?;
      self.inner.registry.ensure_collection(store.collection());

      let transaction = self.inner.begin_store(&store, mode)?;
      trace!(store = %store, ?mode, transaction = %transaction.id(), "Opened store handle");
      Ok(StoreHandle::new(self.weak(), store, mode, transaction))
   }

   /// Runs a descriptor on a fresh transaction.
   pub fn execute(&self, descriptor: QueryDescriptor) -> QueryStream<Output> {
      self
         .inner
         .registry
         .ensure_collection(descriptor.collection());
      QueryStream::new(self.weak(), None, descriptor)
   }

   /// Committed writes made through this connection.
   pub fn changes(&self) -> ChangeStream {
      ChangeStream::new(self.inner.changes.subscribe())
   }

   /// Upgrade and delete requests from other connections to the same file.
   /// Close this connection when one arrives, or the request stays blocked.
   pub fn version_changes(&self) -> broadcast::Receiver<VersionChangeEvent> {
      self.inner.db.version_changes()
   }

   /// Number of live-query listeners on `collection`.
   pub fn listener_count(&self, collection: &str) -> usize {
      self.inner.registry.listener_count(collection)
   }

   pub fn listener_keys(&self, collection: &str) -> Vec<ListenerKey> {
      self.inner.registry.listener_keys(collection)
   }

   /// Number of streams subscribed to a listener.
   pub fn subscriber_count(&self, key: &ListenerKey) -> usize {
      self.inner.registry.subscriber_count(key)
   }

   /// Whether a store handle or descriptor has touched `collection`.
   pub fn has_registry(&self, collection: &str) -> bool {
      self.inner.registry.has_collection(collection)
   }

   pub fn is_closed(&self) -> bool {
      self.inner.is_closed()
   }

   /// Closes the database. Requests already issued still complete.
   pub fn close(self) {
      debug!(name = %self.name(), "Closing connection");
      self.inner.db.close();
   }
}

impl std::fmt::Debug for Connection {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Connection")
         .field("path", &self.inner.db.path())
         .field("version", &self.inner.db.version())
         .field("closed", &self.inner.is_closed())
         .finish()
   }
}
