//! Connection configuration

use serde::{Deserialize, Serialize};
use sqlx_sqlite_objstore::ObjectDatabaseConfig;

/// Configuration for a [`Connection`](crate::Connection).
///
/// # Examples
///
/// ```
/// use reactive_objstore::ConnectionConfig;
///
/// let config = ConnectionConfig::default().with_change_channel_capacity(1024);
/// assert_eq!(config.database.max_read_connections, 6);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
   /// Connection pool settings passed to the engine.
   pub database: ObjectDatabaseConfig,

   /// Capacity of the broadcast channel behind [`Connection::changes`].
   ///
   /// A subscriber that falls more than this many events behind skips the
   /// oldest ones and logs a warning. Live queries are not affected; they
   /// are re-run directly by each write.
   ///
   /// Default: 256.
   ///
   /// [`Connection::changes`]: crate::Connection::changes
   pub change_channel_capacity: usize,
}

impl Default for ConnectionConfig {
   fn default() -> Self {
      Self {
         database: ObjectDatabaseConfig::default(),
         change_channel_capacity: 256,
      }
   }
}

impl ConnectionConfig {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_database(mut self, database: ObjectDatabaseConfig) -> Self {
      self.database = database;
      self
   }

   pub fn with_change_channel_capacity(mut self, capacity: usize) -> Self {
      self.change_channel_capacity = capacity;
      self
   }
}
