//! Change notifications for committed writes.

use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt, ready};
use serde::Serialize;
use sqlx_sqlite_objstore::{Key, Method};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

/// Kind of write that changed a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
   Insert,
   Update,
   Delete,
   Clear,
}

impl ChangeKind {
   /// `None` for methods that do not write.
   pub fn from_method(method: Method) -> Option<Self> {
      match method {
         Method::Add => Some(ChangeKind::Insert),
         Method::Put => Some(ChangeKind::Update),
         Method::Delete => Some(ChangeKind::Delete),
         Method::Clear => Some(ChangeKind::Clear),
         _ => None,
      }
   }
}

/// Notification of a committed write to a collection.
///
/// Sent after the write's transaction committed and every live query on the
/// collection has been re-run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
   pub collection: String,
   pub kind: ChangeKind,
   /// Primary key written by `add` or `put`.
   #[serde(skip_serializing_if = "Option::is_none")]
   pub key: Option<Key>,
}

/// Which change events a [`ChangeStream`] yields. Empty sets match
/// everything.
#[derive(Debug, Clone, Default)]
struct ChangeFilter {
   collections: HashSet<String>,
   kinds: HashSet<ChangeKind>,
}

impl ChangeFilter {
   fn matches(&self, event: &ChangeEvent) -> bool {
      (self.collections.is_empty() || self.collections.contains(&event.collection))
         && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
   }
}

/// Committed writes on a connection, optionally narrowed to some
/// collections or kinds of write.
///
/// A subscriber that falls more than the channel capacity behind loses the
/// oldest events; [`ChangeStream::missed`] counts them.
pub struct ChangeStream {
   events: BroadcastStream<ChangeEvent>,
   filter: ChangeFilter,
   missed: u64,
}

impl ChangeStream {
   pub(crate) fn new(rx: broadcast::Receiver<ChangeEvent>) -> Self {
      Self {
         events: BroadcastStream::new(rx),
         filter: ChangeFilter::default(),
         missed: 0,
      }
   }

   /// Only yield events for these collections.
   pub fn filter_collections<I, S>(mut self, collections: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.filter.collections.extend(collections.into_iter().map(Into::into));
      self
   }

   /// Only yield these kinds of write.
   pub fn filter_kinds(mut self, kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
      self.filter.kinds.extend(kinds);
      self
   }

   /// Events dropped because this subscriber fell behind.
   pub fn missed(&self) -> u64 {
      self.missed
   }
}

impl Stream for ChangeStream {
   type Item = ChangeEvent;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      while let Some(received) = ready!(this.events.poll_next_unpin(cx)) {
         match received {
            Ok(event) if this.filter.matches(&event) => return Poll::Ready(Some(event)),
            Ok(_) => {}
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
               this.missed += skipped;
               warn!(
                  skipped,
                  missed = this.missed,
                  "Change subscriber fell behind, raise change_channel_capacity to keep up"
               );
            }
         }
      }
      Poll::Ready(None)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn event(collection: &str, kind: ChangeKind) -> ChangeEvent {
      ChangeEvent {
         collection: collection.into(),
         kind,
         key: None,
      }
   }

   #[test]
   fn test_kind_from_method() {
      assert_eq!(ChangeKind::from_method(Method::Add), Some(ChangeKind::Insert));
      assert_eq!(ChangeKind::from_method(Method::Put), Some(ChangeKind::Update));
      assert_eq!(ChangeKind::from_method(Method::Clear), Some(ChangeKind::Clear));
      assert_eq!(ChangeKind::from_method(Method::GetAll), None);
   }

   #[tokio::test]
   async fn test_filter_collections() {
      let (tx, rx) = broadcast::channel(8);
      let mut stream = ChangeStream::new(rx).filter_collections(["posts"]);

      tx.send(event("users", ChangeKind::Insert)).unwrap();
      tx.send(event("posts", ChangeKind::Delete)).unwrap();
      drop(tx);

      assert_eq!(stream.next().await, Some(event("posts", ChangeKind::Delete)));
      assert_eq!(stream.next().await, None);
   }

   #[tokio::test]
   async fn test_lagged_stream_continues() {
      let (tx, rx) = broadcast::channel(2);
      let mut stream = ChangeStream::new(rx);

      for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
         tx.send(event("users", kind)).unwrap();
      }
      drop(tx);

      // The oldest event was overwritten
      assert_eq!(stream.next().await.unwrap().kind, ChangeKind::Update);
      assert_eq!(stream.missed(), 1);
      assert_eq!(stream.next().await.unwrap().kind, ChangeKind::Delete);
      assert_eq!(stream.next().await, None);
   }

   #[tokio::test]
   async fn test_filter_kinds_and_collections() {
      let (tx, rx) = broadcast::channel(8);
      let mut stream = ChangeStream::new(rx)
         .filter_collections(["users"])
         .filter_kinds([ChangeKind::Delete, ChangeKind::Clear]);

      tx.send(event("users", ChangeKind::Insert)).unwrap();
      tx.send(event("posts", ChangeKind::Clear)).unwrap();
      tx.send(event("users", ChangeKind::Clear)).unwrap();
      tx.send(event("users", ChangeKind::Delete)).unwrap();
      drop(tx);

      assert_eq!(stream.next().await, Some(event("users", ChangeKind::Clear)));
      assert_eq!(stream.next().await, Some(event("users", ChangeKind::Delete)));
      assert_eq!(stream.next().await, None);
      assert_eq!(stream.missed(), 0);
   }
}
