//! Exclusive access to the single writer connection

use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use std::ops::{Deref, DerefMut};

/// RAII guard for the writer connection of a database file
///
/// The write pool holds exactly one connection, so at most one guard exists
/// per file at a time. Read-write transactions and version changes each hold
/// a guard for their whole lifetime, which serializes them.
///
/// The connection goes back to the pool on drop. Whoever holds the guard
/// must have committed or rolled back before that happens.
#[derive(Debug)]
pub(crate) struct WriteGuard {
   conn: PoolConnection<Sqlite>,
}

impl WriteGuard {
   pub(crate) fn new(conn: PoolConnection<Sqlite>) -> Self {
      Self { conn }
   }
}

impl Deref for WriteGuard {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      &self.conn
   }
}

impl DerefMut for WriteGuard {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut self.conn
   }
}
