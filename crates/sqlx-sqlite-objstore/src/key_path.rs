//! Key paths: where a record's key (or an index key) lives inside its value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::error::Error;
use crate::key::Key;

/// A dotted path (`"profile.email"`) or a list of dotted paths.
///
/// The empty string refers to the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
   Single(String),
   Compound(Vec<String>),
}

impl KeyPath {
   pub fn compound<I, S>(paths: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      KeyPath::Compound(paths.into_iter().map(Into::into).collect())
   }

   /// Checks that every path is empty or a sequence of non-empty,
   /// dot-separated identifiers.
   pub fn validate(&self) -> Result<()> {
      match self {
         KeyPath::Single(path) => validate_path(path),
         KeyPath::Compound(paths) if paths.is_empty() => {
            Err(Error::Data("compound key path cannot be empty".into()))
         }
         KeyPath::Compound(paths) => paths.iter().try_for_each(|p| {
            if p.is_empty() {
               return Err(Error::Data(
                  "compound key path segments cannot be empty".into(),
               ));
            }
            validate_path(p)
         }),
      }
   }

   /// Extracts the key this path points at.
   ///
   /// Returns `Ok(None)` if any segment is missing and an error if the value
   /// found is not a valid key.
   pub fn extract(&self, value: &Value) -> Result<Option<Key>> {
      match self {
         KeyPath::Single(path) => lookup(path, value).map(Key::try_from).transpose(),
         KeyPath::Compound(paths) => {
            let mut keys = Vec::with_capacity(paths.len());
            for path in paths {
               match lookup(path, value) {
                  Some(v) => keys.push(Key::try_from(v)?),
                  None => return Ok(None),
               }
            }
            Ok(Some(Key::Array(keys)))
         }
      }
   }

   /// Writes a generated key into `value` at this path, creating intermediate
   /// objects as needed.
   pub(crate) fn inject(&self, value: &mut Value, key: &Key) -> Result<()> {
      let KeyPath::Single(path) = self else {
         return Err(Error::Data("cannot inject a key into a compound key path".into()));
      };
      if path.is_empty() {
         return Err(Error::Data("cannot inject a key into an empty key path".into()));
      }

      let mut segments = path.split('.').peekable();
      let mut current = value;
      while let Some(segment) = segments.next() {
         let Value::Object(map) = current else {
            return Err(Error::Data(format!(
               "cannot inject key at '{path}': parent is not an object"
            )));
         };
         if segments.peek().is_none() {
            map.insert(segment.to_string(), key.to_value());
            return Ok(());
         }
         current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
      }
      Ok(())
   }

   pub(crate) fn is_injectable(&self) -> bool {
      matches!(self, KeyPath::Single(path) if !path.is_empty())
   }
}

/// Resolves a single dotted path against a value.
pub(crate) fn lookup<'a>(path: &str, value: &'a Value) -> Option<&'a Value> {
   if path.is_empty() {
      return Some(value);
   }
   path.split('.').try_fold(value, |current, segment| current.get(segment))
}

fn validate_path(path: &str) -> Result<()> {
   if path.is_empty() {
      return Ok(());
   }
   let valid = path.split('.').all(|segment| {
      let mut chars = segment.chars();
      matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_' || c == '$')
         && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
   });
   if valid {
      Ok(())
   } else {
      Err(Error::Data(format!("invalid key path '{path}'")))
   }
}

impl From<&str> for KeyPath {
   fn from(path: &str) -> Self {
      KeyPath::Single(path.to_string())
   }
}

impl From<String> for KeyPath {
   fn from(path: String) -> Self {
      KeyPath::Single(path)
   }
}

impl From<Vec<String>> for KeyPath {
   fn from(paths: Vec<String>) -> Self {
      KeyPath::Compound(paths)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn test_extract_nested() {
      let value = json!({"id": 1, "profile": {"email": "a@x.com"}});
      assert_eq!(
         KeyPath::from("profile.email").extract(&value).unwrap(),
         Some(Key::from("a@x.com"))
      );
      assert_eq!(KeyPath::from("missing").extract(&value).unwrap(), None);
   }

   #[test]
   fn test_extract_compound() {
      let value = json!({"first": "Ada", "last": "Lovelace"});
      let path = KeyPath::compound(["last", "first"]);
      assert_eq!(
         path.extract(&value).unwrap(),
         Some(Key::Array(vec![Key::from("Lovelace"), Key::from("Ada")]))
      );
   }

   #[test]
   fn test_extract_invalid_key_is_error() {
      let value = json!({"id": {"nested": true}});
      assert!(KeyPath::from("id").extract(&value).is_err());
   }

   #[test]
   fn test_inject_creates_parents() {
      let mut value = json!({"name": "x"});
      KeyPath::from("meta.id")
         .inject(&mut value, &Key::from(4))
         .unwrap();
      assert_eq!(value, json!({"name": "x", "meta": {"id": 4}}));
   }

   #[test]
   fn test_inject_into_non_object_fails() {
      let mut value = json!({"meta": 3});
      assert!(KeyPath::from("meta.id").inject(&mut value, &Key::from(1)).is_err());
   }

   #[test]
   fn test_validate() {
      assert!(KeyPath::from("").validate().is_ok());
      assert!(KeyPath::from("a.b_c").validate().is_ok());
      assert!(KeyPath::from("a..b").validate().is_err());
      assert!(KeyPath::from("1a").validate().is_err());
      assert!(KeyPath::Compound(vec![]).validate().is_err());
   }

   #[test]
   fn test_deserialize_untagged() {
      let single: KeyPath = serde_json::from_value(json!("id")).unwrap();
      let compound: KeyPath = serde_json::from_value(json!(["a", "b"])).unwrap();
      assert_eq!(single, KeyPath::from("id"));
      assert_eq!(compound, KeyPath::compound(["a", "b"]));
   }
}
