//! Configuration for object database connection pools

use serde::{Deserialize, Serialize};

/// Configuration for ObjectDatabase connection pools
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_objstore::ObjectDatabaseConfig;
///
/// // Use defaults
/// let config = ObjectDatabaseConfig::default();
///
/// // Override just one field
/// let config = ObjectDatabaseConfig {
///     max_read_connections: 3,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDatabaseConfig {
   /// Maximum number of concurrent read connections
   ///
   /// Every read-only transaction holds one of these for its whole lifetime,
   /// so this bounds the number of read-only transactions running at once.
   ///
   /// Default: 6
   pub max_read_connections: u32,

   /// Idle timeout for both read and write connections (in seconds)
   ///
   /// Default: 30
   pub idle_timeout_secs: u64,
}

impl Default for ObjectDatabaseConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 6,
         idle_timeout_secs: 30,
      }
   }
}

impl ObjectDatabaseConfig {
   pub fn with_max_read_connections(mut self, max: u32) -> Self {
      self.max_read_connections = max;
      self
   }

   pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
      self.idle_timeout_secs = secs;
      self
   }
}
