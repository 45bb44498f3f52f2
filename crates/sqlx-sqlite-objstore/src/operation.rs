//! Requests that can be issued against an object store or index, and their results.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::{Key, KeyRange};

/// Name of a request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
   Count,
   Get,
   GetAll,
   GetAllKeys,
   GetKey,
   OpenCursor,
   OpenKeyCursor,
   Add,
   Delete,
   Clear,
   Put,
}

impl Method {
   pub fn as_str(&self) -> &'static str {
      match self {
         Method::Count => "count",
         Method::Get => "get",
         Method::GetAll => "getAll",
         Method::GetAllKeys => "getAllKeys",
         Method::GetKey => "getKey",
         Method::OpenCursor => "openCursor",
         Method::OpenKeyCursor => "openKeyCursor",
         Method::Add => "add",
         Method::Delete => "delete",
         Method::Clear => "clear",
         Method::Put => "put",
      }
   }

   /// Returns true for methods that modify the object store.
   pub fn is_mutation(&self) -> bool {
      matches!(
         self,
         Method::Add | Method::Delete | Method::Clear | Method::Put
      )
   }
}

impl fmt::Display for Method {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// Iteration order of a cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorDirection {
   #[default]
   Next,
   NextUnique,
   Prev,
   PrevUnique,
}

impl CursorDirection {
   pub fn is_reverse(&self) -> bool {
      matches!(self, CursorDirection::Prev | CursorDirection::PrevUnique)
   }

   pub fn is_unique(&self) -> bool {
      matches!(self, CursorDirection::NextUnique | CursorDirection::PrevUnique)
   }
}

/// What a request reads from: an object store, or one of its indexes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum Source {
   Store { store: String },
   Index { store: String, index: String },
}

impl Source {
   pub fn store(store: impl Into<String>) -> Self {
      Source::Store {
         store: store.into(),
      }
   }

   pub fn index(store: impl Into<String>, index: impl Into<String>) -> Self {
      Source::Index {
         store: store.into(),
         index: index.into(),
      }
   }

   /// The object store this source belongs to.
   pub fn store_name(&self) -> &str {
      match self {
         Source::Store { store } | Source::Index { store, .. } => store,
      }
   }
}

impl fmt::Display for Source {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Source::Store { store } => f.write_str(store),
         Source::Index { store, index } => write!(f, "{store}.{index}"),
      }
   }
}

/// A single request: the method and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Operation {
   Count {
      query: Option<KeyRange>,
   },
   Get {
      query: KeyRange,
   },
   GetAll {
      query: Option<KeyRange>,
      count: Option<u32>,
   },
   GetAllKeys {
      query: Option<KeyRange>,
      count: Option<u32>,
   },
   GetKey {
      query: KeyRange,
   },
   OpenCursor {
      query: Option<KeyRange>,
      direction: CursorDirection,
   },
   OpenKeyCursor {
      query: Option<KeyRange>,
      direction: CursorDirection,
   },
   Add {
      value: Value,
      key: Option<Key>,
   },
   Put {
      value: Value,
      key: Option<Key>,
   },
   Delete {
      query: KeyRange,
   },
   Clear,
}

impl Operation {
   pub fn method(&self) -> Method {
      match self {
         Operation::Count { .. } => Method::Count,
         Operation::Get { .. } => Method::Get,
         Operation::GetAll { .. } => Method::GetAll,
         Operation::GetAllKeys { .. } => Method::GetAllKeys,
         Operation::GetKey { .. } => Method::GetKey,
         Operation::OpenCursor { .. } => Method::OpenCursor,
         Operation::OpenKeyCursor { .. } => Method::OpenKeyCursor,
         Operation::Add { .. } => Method::Add,
         Operation::Put { .. } => Method::Put,
         Operation::Delete { .. } => Method::Delete,
         Operation::Clear => Method::Clear,
      }
   }

   pub fn is_mutation(&self) -> bool {
      self.method().is_mutation()
   }
}

/// One record visited by a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRecord {
   /// The index key for index cursors, otherwise the primary key.
   pub key: Key,
   pub primary_key: Key,
   /// `None` for key cursors.
   pub value: Option<Value>,
}

/// The records visited by a cursor, in iteration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cursor {
   direction: CursorDirection,
   records: Vec<CursorRecord>,
}

impl Cursor {
   pub(crate) fn new(direction: CursorDirection, records: Vec<CursorRecord>) -> Self {
      Self { direction, records }
   }

   pub fn direction(&self) -> CursorDirection {
      self.direction
   }

   pub fn records(&self) -> &[CursorRecord] {
      &self.records
   }

   pub fn len(&self) -> usize {
      self.records.len()
   }

   pub fn is_empty(&self) -> bool {
      self.records.is_empty()
   }

   pub fn iter(&self) -> std::slice::Iter<'_, CursorRecord> {
      self.records.iter()
   }

   pub fn primary_keys(&self) -> Vec<Key> {
      self.records.iter().map(|r| r.primary_key.clone()).collect()
   }
}

impl IntoIterator for Cursor {
   type Item = CursorRecord;
   type IntoIter = std::vec::IntoIter<CursorRecord>;

   fn into_iter(self) -> Self::IntoIter {
      self.records.into_iter()
   }
}

impl<'a> IntoIterator for &'a Cursor {
   type Item = &'a CursorRecord;
   type IntoIter = std::slice::Iter<'a, CursorRecord>;

   fn into_iter(self) -> Self::IntoIter {
      self.records.iter()
   }
}

/// Result of a successful request.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
   /// `count`
   Count(u64),
   /// `get`
   Value(Option<Value>),
   /// `getAll`
   Values(Vec<Value>),
   /// `getKey`, `add`, `put`
   Key(Option<Key>),
   /// `getAllKeys`
   Keys(Vec<Key>),
   /// `openCursor`, `openKeyCursor`
   Cursor(Cursor),
   /// `delete`, `clear`
   Done,
}
