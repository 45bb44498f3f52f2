//! Record keys and key ranges.
//!
//! Keys follow IndexedDB ordering: numbers sort before strings, strings before
//! binary, binary before arrays. Arrays compare element-wise.
//!
//! Every key has an order-preserving binary encoding, so range predicates can
//! be pushed down to SQLite as plain `BLOB` comparisons (SQLite compares blobs
//! with `memcmp`).
//!
//! ```text
//! number  0x10 <8 bytes, sign-flipped big-endian f64>
//! string  0x30 <utf-8 bytes, 0x00 escaped as 0x00 0xFF> 0x00 0x01
//! binary  0x40 <bytes, 0x00 escaped as 0x00 0xFF>       0x00 0x01
//! array   0x50 <encoded elements>                        0x00
//! ```

use std::cmp::Ordering;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::Result;
use crate::error::Error;

const TAG_TERMINATOR: u8 = 0x00;
const TAG_NUMBER: u8 = 0x10;
const TAG_STRING: u8 = 0x30;
const TAG_BINARY: u8 = 0x40;
const TAG_ARRAY: u8 = 0x50;

const ESCAPE_NUL: u8 = 0xFF;
const END_OF_BYTES: u8 = 0x01;

/// A record key.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
   Number(f64),
   String(String),
   Binary(Vec<u8>),
   Array(Vec<Key>),
}

impl Key {
   /// Creates a binary key.
   pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
      Key::Binary(bytes.into())
   }

   /// Returns an error if the key (or any nested key) is a NaN number.
   pub fn validate(&self) -> Result<()> {
      match self {
         Key::Number(n) if n.is_nan() => Err(Error::Data("NaN is not a valid key".into())),
         Key::Array(items) => items.iter().try_for_each(Key::validate),
         _ => Ok(()),
      }
   }

   /// Attempts to get this key as a number.
   pub fn as_number(&self) -> Option<f64> {
      match self {
         Key::Number(n) => Some(*n),
         _ => None,
      }
   }

   /// Attempts to get this key as a string reference.
   pub fn as_str(&self) -> Option<&str> {
      match self {
         Key::String(s) => Some(s),
         _ => None,
      }
   }

   /// Converts this key into the JSON value stored inside records.
   ///
   /// Integral numbers become JSON integers; binary keys become base64 strings.
   pub fn to_value(&self) -> Value {
      match self {
         Key::Number(n) => match integral(*n) {
            Some(i) => Value::from(i),
            None => Value::from(*n),
         },
         Key::String(s) => Value::String(s.clone()),
         Key::Binary(b) => Value::String(STANDARD.encode(b)),
         Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
      }
   }

   /// Order-preserving binary encoding of this key.
   pub fn encode(&self) -> Vec<u8> {
      let mut out = Vec::new();
      self.encode_into(&mut out);
      out
   }

   fn encode_into(&self, out: &mut Vec<u8>) {
      match self {
         Key::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&encode_f64(*n));
         }
         Key::String(s) => {
            out.push(TAG_STRING);
            encode_bytes(s.as_bytes(), out);
         }
         Key::Binary(b) => {
            out.push(TAG_BINARY);
            encode_bytes(b, out);
         }
         Key::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
               item.encode_into(out);
            }
            out.push(TAG_TERMINATOR);
         }
      }
   }

   /// Decodes a key produced by [`Key::encode`].
   pub fn decode(bytes: &[u8]) -> Result<Self> {
      let mut pos = 0;
      let key = decode_at(bytes, &mut pos)?;
      if pos != bytes.len() {
         return Err(corrupt("trailing bytes"));
      }
      Ok(key)
   }
}

impl PartialOrd for Key {
   fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
      Some(self.encode().cmp(&other.encode()))
   }
}

fn integral(n: f64) -> Option<i64> {
   if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
      Some(n as i64)
   } else {
      None
   }
}

fn encode_f64(n: f64) -> [u8; 8] {
   // -0.0 and 0.0 are the same key
   let n = if n == 0.0 { 0.0 } else { n };
   let bits = n.to_bits();
   let ordered = if bits >> 63 == 1 {
      !bits
   } else {
      bits | (1 << 63)
   };
   ordered.to_be_bytes()
}

fn decode_f64(bytes: [u8; 8]) -> f64 {
   let ordered = u64::from_be_bytes(bytes);
   let bits = if ordered >> 63 == 1 {
      ordered & !(1 << 63)
   } else {
      !ordered
   };
   f64::from_bits(bits)
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
   for &b in bytes {
      if b == 0 {
         out.push(0);
         out.push(ESCAPE_NUL);
      } else {
         out.push(b);
      }
   }
   out.push(0);
   out.push(END_OF_BYTES);
}

fn corrupt(reason: &str) -> Error {
   Error::Data(format!("corrupt key encoding: {reason}"))
}

fn decode_at(bytes: &[u8], pos: &mut usize) -> Result<Key> {
   let tag = *bytes.get(*pos).ok_or_else(|| corrupt("missing tag"))?;
   *pos += 1;

   match tag {
      TAG_NUMBER => {
         let raw: [u8; 8] = bytes
            .get(*pos..*pos + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| corrupt("truncated number"))?;
         *pos += 8;
         Ok(Key::Number(decode_f64(raw)))
      }
      TAG_STRING => {
         let raw = decode_bytes(bytes, pos)?;
         String::from_utf8(raw)
            .map(Key::String)
            .map_err(|_| corrupt("invalid utf-8"))
      }
      TAG_BINARY => decode_bytes(bytes, pos).map(Key::Binary),
      TAG_ARRAY => {
         let mut items = Vec::new();
         loop {
            match bytes.get(*pos) {
               Some(&TAG_TERMINATOR) => {
                  *pos += 1;
                  return Ok(Key::Array(items));
               }
               Some(_) => items.push(decode_at(bytes, pos)?),
               None => return Err(corrupt("unterminated array")),
            }
         }
      }
      other => Err(corrupt(&format!("unknown tag {other:#04x}"))),
   }
}

fn decode_bytes(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
   let mut out = Vec::new();
   loop {
      let b = *bytes.get(*pos).ok_or_else(|| corrupt("unterminated bytes"))?;
      *pos += 1;
      if b != 0 {
         out.push(b);
         continue;
      }
      let marker = *bytes.get(*pos).ok_or_else(|| corrupt("dangling escape"))?;
      *pos += 1;
      match marker {
         ESCAPE_NUL => out.push(0),
         END_OF_BYTES => return Ok(out),
         _ => return Err(corrupt("bad escape")),
      }
   }
}

impl TryFrom<&Value> for Key {
   type Error = Error;

   fn try_from(value: &Value) -> Result<Self> {
      match value {
         Value::Number(n) => n
            .as_f64()
            .map(Key::Number)
            .ok_or_else(|| Error::Data(format!("{n} is not a valid key"))),
         Value::String(s) => Ok(Key::String(s.clone())),
         Value::Array(items) => items
            .iter()
            .map(Key::try_from)
            .collect::<Result<Vec<_>>>()
            .map(Key::Array),
         other => Err(Error::Data(format!("{other} is not a valid key"))),
      }
   }
}

impl TryFrom<Value> for Key {
   type Error = Error;

   fn try_from(value: Value) -> Result<Self> {
      Key::try_from(&value)
   }
}

impl From<i64> for Key {
   fn from(n: i64) -> Self {
      Key::Number(n as f64)
   }
}

impl From<i32> for Key {
   fn from(n: i32) -> Self {
      Key::Number(f64::from(n))
   }
}

impl From<u32> for Key {
   fn from(n: u32) -> Self {
      Key::Number(f64::from(n))
   }
}

impl From<f64> for Key {
   fn from(n: f64) -> Self {
      Key::Number(n)
   }
}

impl From<&str> for Key {
   fn from(s: &str) -> Self {
      Key::String(s.to_string())
   }
}

impl From<String> for Key {
   fn from(s: String) -> Self {
      Key::String(s)
   }
}

impl From<Vec<Key>> for Key {
   fn from(items: Vec<Key>) -> Self {
      Key::Array(items)
   }
}

impl Serialize for Key {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      match self {
         Key::Number(n) => match integral(*n) {
            Some(i) => serializer.serialize_i64(i),
            None => serializer.serialize_f64(*n),
         },
         Key::String(s) => serializer.serialize_str(s),
         Key::Binary(b) => {
            let mut map = serializer.serialize_map(Some(1))?;
            map.serialize_entry("binary", &STANDARD.encode(b))?;
            map.end()
         }
         Key::Array(items) => items.serialize(serializer),
      }
   }
}

/// A continuous interval over keys.
///
/// A range with neither bound matches every key.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRange {
   pub lower: Option<Key>,
   pub upper: Option<Key>,
   pub lower_open: bool,
   pub upper_open: bool,
}

impl KeyRange {
   /// Matches every key.
   pub fn all() -> Self {
      Self::default()
   }

   /// Matches exactly one key.
   pub fn only(key: impl Into<Key>) -> Self {
      let key = key.into();
      Self {
         lower: Some(key.clone()),
         upper: Some(key),
         lower_open: false,
         upper_open: false,
      }
   }

   /// Matches keys above `lower` (excluding it when `open`).
   pub fn lower_bound(lower: impl Into<Key>, open: bool) -> Self {
      Self {
         lower: Some(lower.into()),
         lower_open: open,
         ..Self::default()
      }
   }

   /// Matches keys below `upper` (excluding it when `open`).
   pub fn upper_bound(upper: impl Into<Key>, open: bool) -> Self {
      Self {
         upper: Some(upper.into()),
         upper_open: open,
         ..Self::default()
      }
   }

   /// Matches keys between `lower` and `upper`.
   ///
   /// Fails if `lower` sorts after `upper`, or if they are equal and either
   /// side is open.
   pub fn bound(
      lower: impl Into<Key>,
      upper: impl Into<Key>,
      lower_open: bool,
      upper_open: bool,
   ) -> Result<Self> {
      let (lower, upper) = (lower.into(), upper.into());
      match lower.encode().cmp(&upper.encode()) {
         Ordering::Greater => {
            return Err(Error::Data("lower bound is greater than upper bound".into()));
         }
         Ordering::Equal if lower_open || upper_open => {
            return Err(Error::Data("empty range with equal open bounds".into()));
         }
         _ => {}
      }
      Ok(Self {
         lower: Some(lower),
         upper: Some(upper),
         lower_open,
         upper_open,
      })
   }

   /// Returns the single key when this range was built with [`KeyRange::only`].
   pub fn as_only(&self) -> Option<&Key> {
      match (&self.lower, &self.upper) {
         (Some(l), Some(u)) if !self.lower_open && !self.upper_open && l == u => Some(l),
         _ => None,
      }
   }

   /// Returns true if `key` falls inside this range.
   pub fn includes(&self, key: &Key) -> bool {
      let encoded = key.encode();
      let above = match &self.lower {
         Some(lower) => match encoded.cmp(&lower.encode()) {
            Ordering::Greater => true,
            Ordering::Equal => !self.lower_open,
            Ordering::Less => false,
         },
         None => true,
      };
      let below = match &self.upper {
         Some(upper) => match encoded.cmp(&upper.encode()) {
            Ordering::Less => true,
            Ordering::Equal => !self.upper_open,
            Ordering::Greater => false,
         },
         None => true,
      };
      above && below
   }

   pub(crate) fn validate(&self) -> Result<()> {
      self.lower.iter().chain(self.upper.iter()).try_for_each(Key::validate)
   }
}

impl From<Key> for KeyRange {
   fn from(key: Key) -> Self {
      KeyRange::only(key)
   }
}

impl From<i64> for KeyRange {
   fn from(n: i64) -> Self {
      KeyRange::only(n)
   }
}

impl From<i32> for KeyRange {
   fn from(n: i32) -> Self {
      KeyRange::only(n)
   }
}

impl From<f64> for KeyRange {
   fn from(n: f64) -> Self {
      KeyRange::only(n)
   }
}

impl From<&str> for KeyRange {
   fn from(s: &str) -> Self {
      KeyRange::only(s)
   }
}

impl From<String> for KeyRange {
   fn from(s: String) -> Self {
      KeyRange::only(s)
   }
}
