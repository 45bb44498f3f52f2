//! Process-wide registry of open database files.
//!
//! Every connection to the same file shares one [`SharedDatabase`]: the
//! connection pools, the current schema and version, and the list of open
//! connections that must be notified before a version change can proceed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, trace};

use crate::Result;
use crate::config::ObjectDatabaseConfig;
use crate::error::Error;
use crate::schema::Schema;
use crate::write_guard::WriteGuard;

static DATABASES: LazyLock<tokio::sync::Mutex<HashMap<PathBuf, Weak<SharedDatabase>>>> =
   LazyLock::new(|| tokio::sync::Mutex::new(HashMap::new()));

/// Sent to open connections when another connection wants to change the
/// version of (or delete) their database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionChangeEvent {
   pub old_version: u32,
   /// `None` when the database is being deleted.
   pub new_version: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct SharedDatabase {
   path: PathBuf,
   read_pool: Pool<Sqlite>,
   write_conn: Pool<Sqlite>,
   wal_initialized: AtomicBool,
   schema: RwLock<Arc<Schema>>,
   version: AtomicU32,
   connections: Mutex<HashMap<u64, broadcast::Sender<VersionChangeEvent>>>,
   next_connection_id: AtomicU64,
   connections_changed: Notify,
   /// Serializes open requests against this file
   pub(crate) open_lock: tokio::sync::Mutex<()>,
}

impl SharedDatabase {
   async fn open(path: PathBuf, config: &ObjectDatabaseConfig) -> Result<Self> {
      // Read-only connections cannot create the file, so create it up front
      // with a throwaway read-write connection
      let create_options = SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(true)
         .read_only(false);
      let conn = create_options.connect().await?;
      drop(conn);

      let read_options = SqliteConnectOptions::new().filename(&path).read_only(true);
      let read_pool = SqlitePoolOptions::new()
         .max_connections(config.max_read_connections)
         .min_connections(0)
         .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
         .connect_with(read_options)
         .await?;

      let write_options = SqliteConnectOptions::new().filename(&path).read_only(false);
      let write_conn = SqlitePoolOptions::new()
         .max_connections(1)
         .min_connections(0)
         .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
         .connect_with(write_options)
         .await?;

      Ok(Self {
         path,
         read_pool,
         write_conn,
         wal_initialized: AtomicBool::new(false),
         schema: RwLock::new(Arc::new(Schema::default())),
         version: AtomicU32::new(0),
         connections: Mutex::new(HashMap::new()),
         next_connection_id: AtomicU64::new(1),
         connections_changed: Notify::new(),
         open_lock: tokio::sync::Mutex::new(()),
      })
   }

   pub(crate) fn path(&self) -> &Path {
      &self.path
   }

   pub(crate) async fn acquire_reader(&self) -> Result<PoolConnection<Sqlite>> {
      Ok(self.read_pool.acquire().await?)
   }

   /// Acquires the writer connection, enabling WAL mode on first use.
   pub(crate) async fn acquire_writer(&self) -> Result<WriteGuard> {
      let mut conn = self.write_conn.acquire().await?;

      if !self.wal_initialized.load(Ordering::SeqCst) {
         sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;

         // https://www.sqlite.org/wal.html#performance_considerations
         sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&mut *conn)
            .await?;

         self.wal_initialized.store(true, Ordering::SeqCst);
      }

      Ok(WriteGuard::new(conn))
   }

   pub(crate) fn schema(&self) -> Arc<Schema> {
      Arc::clone(&self.schema.read())
   }

   pub(crate) fn version(&self) -> u32 {
      self.version.load(Ordering::SeqCst)
   }

   pub(crate) fn set_schema(&self, schema: Schema, version: u32) {
      *self.schema.write() = Arc::new(schema);
      self.version.store(version, Ordering::SeqCst);
   }

   /// Registers a new open connection and returns its id along with the
   /// sender its version change notifications go through.
   pub(crate) fn register_connection(&self) -> (u64, broadcast::Sender<VersionChangeEvent>) {
      let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
      let (tx, _) = broadcast::channel(4);
      self.connections.lock().insert(id, tx.clone());
      trace!(path = %self.path.display(), connection = id, "Registered connection");
      (id, tx)
   }

   pub(crate) fn unregister_connection(&self, id: u64) {
      let removed = self.connections.lock().remove(&id).is_some();
      if removed {
         trace!(path = %self.path.display(), connection = id, "Unregistered connection");
         self.connections_changed.notify_waiters();
      }
   }

   pub(crate) fn open_connections(&self) -> usize {
      self.connections.lock().len()
   }

   /// Tells every open connection about a pending version change.
   ///
   /// Returns how many connections were open at the time.
   pub(crate) fn notify_version_change(&self, event: VersionChangeEvent) -> usize {
      let senders: Vec<_> = self.connections.lock().values().cloned().collect();
      for sender in &senders {
         // No receivers just means nobody is listening on that connection
         let _ = sender.send(event);
      }
      senders.len()
   }

   /// Waits until every open connection has been closed.
   pub(crate) async fn wait_for_connections_closed(&self) {
      loop {
         let notified = self.connections_changed.notified();
         if self.open_connections() == 0 {
            return;
         }
         notified.await;
      }
   }

   async fn close_pools(&self) {
      self.read_pool.close().await;

      if self.wal_initialized.load(Ordering::SeqCst)
         && let Ok(mut conn) = self.write_conn.acquire().await
      {
         let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&mut *conn)
            .await;
      }

      self.write_conn.close().await;
   }
}

/// Rejects paths that cannot be shared between the read and write pools.
pub(crate) fn validate_path(path: &Path) -> Result<()> {
   if path.as_os_str().is_empty() {
      return Err(Error::InvalidPath("database path cannot be empty".into()));
   }
   let raw = path.to_string_lossy();
   if raw == ":memory:" || raw.starts_with("file::memory:") || raw.contains("mode=memory") {
      return Err(Error::InvalidPath(format!(
         "in-memory databases are not supported: {raw}"
      )));
   }
   Ok(())
}

/// Canonical registry key for a path, which may not exist yet.
fn canonical_path(path: &Path) -> Result<PathBuf> {
   if path.exists() {
      return Ok(std::fs::canonicalize(path)?);
   }
   let parent = match path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => std::fs::canonicalize(parent)?,
      _ => std::env::current_dir()?,
   };
   let file_name = path
      .file_name()
      .ok_or_else(|| Error::InvalidPath(format!("{} has no file name", path.display())))?;
   Ok(parent.join(file_name))
}

/// Returns the shared state for `path`, opening the pools if no connection
/// to that file is alive.
pub(crate) async fn get_or_open(
   path: &Path,
   config: &ObjectDatabaseConfig,
) -> Result<Arc<SharedDatabase>> {
   validate_path(path)?;
   let key = canonical_path(path)?;

   let mut databases = DATABASES.lock().await;
   if let Some(shared) = databases.get(&key).and_then(Weak::upgrade) {
      return Ok(shared);
   }

   let shared = Arc::new(SharedDatabase::open(key.clone(), config).await?);
   databases.retain(|_, weak| weak.strong_count() > 0);
   databases.insert(key.clone(), Arc::downgrade(&shared));
   debug!(path = %key.display(), "Opened database file");
   Ok(shared)
}

/// Deletes a database file along with its WAL and SHM files.
///
/// Fails with [`Error::InvalidState`] while connections to the file are open.
/// Open connections are sent a [`VersionChangeEvent`] with no new version so
/// they can close and the caller can retry.
pub async fn delete_database(path: impl AsRef<Path>) -> Result<()> {
   let path = path.as_ref();
   validate_path(path)?;
   let key = canonical_path(path)?;

   let mut databases = DATABASES.lock().await;
   if let Some(shared) = databases.get(&key).and_then(Weak::upgrade) {
      let _open = shared.open_lock.lock().await;
      let open = shared.notify_version_change(VersionChangeEvent {
         old_version: shared.version(),
         new_version: None,
      });
      if open > 0 {
         return Err(Error::InvalidState(format!(
            "cannot delete {}: {open} connection(s) still open",
            key.display()
         )));
      }
      shared.close_pools().await;
   }
   databases.remove(&key);

   if key.exists() {
      std::fs::remove_file(&key)?;
   }

   // WAL and SHM files only exist if WAL mode was ever enabled
   for suffix in ["-wal", "-shm"] {
      let mut sidecar = key.clone().into_os_string();
      sidecar.push(suffix);
      if let Err(e) = std::fs::remove_file(PathBuf::from(sidecar))
         && e.kind() != std::io::ErrorKind::NotFound
      {
         return Err(Error::Io(e));
      }
   }

   debug!(path = %key.display(), "Deleted database");
   Ok(())
}
