//! Listener registries for live queries.
//!
//! Every collection that has been opened through a store handle gets a
//! registry of listeners, keyed by [`ListenerKey`]. A listener is one logical
//! query (collection, method and structurally equal arguments) plus the
//! streams subscribed to it. Live queries with the same arguments share one
//! listener; the listener is removed when its last subscriber goes away.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx_sqlite_objstore::{Method, Output};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::Result;
use crate::query::QueryDescriptor;

/// Identifies one listener within a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerKey {
   pub collection: String,
   pub method: Method,
   pub id: u64,
}

impl fmt::Display for ListenerKey {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}:{}:{}", self.collection, self.method, self.id)
   }
}

pub(crate) type Subscriber = mpsc::UnboundedSender<Result<Output>>;

/// Hands out listener ids. Equal identities get the same id while in use.
#[derive(Debug, Default)]
struct ListenerIds {
   next: u64,
   ids: HashMap<String, u64>,
}

impl ListenerIds {
   fn acquire(&mut self, identity: &str) -> u64 {
      if let Some(id) = self.ids.get(identity) {
         return *id;
      }
      self.next += 1;
      self.ids.insert(identity.to_string(), self.next);
      self.next
   }

   fn release(&mut self, identity: &str) {
      self.ids.remove(identity);
   }
}

#[derive(Debug)]
struct Listener {
   descriptor: QueryDescriptor,
   identity: String,
   subscribers: IndexMap<u64, Subscriber>,
}

#[derive(Debug, Default)]
struct RegistryState {
   collections: HashMap<String, IndexMap<ListenerKey, Listener>>,
   ids: ListenerIds,
   next_subscriber: u64,
}

/// Listener registries of one connection.
#[derive(Debug, Default)]
pub(crate) struct ListenerRegistry {
   state: Mutex<RegistryState>,
}

impl ListenerRegistry {
   pub(crate) fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Creates the collection's registry if this is its first use.
   pub(crate) fn ensure_collection(&self, collection: &str) {
      let mut state = self.state.lock();
      if !state.collections.contains_key(collection) {
         trace!(collection, "Created listener registry");
         state
            .collections
            .insert(collection.to_string(), IndexMap::new());
      }
   }

   /// Adds a subscriber for `descriptor`, reusing the listener of an equal
   /// query if one exists.
   pub(crate) fn subscribe(self: &Arc<Self>, descriptor: &QueryDescriptor) -> Subscription {
      let identity = descriptor.identity();
      let (tx, rx) = mpsc::unbounded_channel();

      let mut state = self.state.lock();
      let id = state.ids.acquire(&identity);
      state.next_subscriber += 1;
      let subscriber = state.next_subscriber;

      let key = ListenerKey {
         collection: descriptor.collection().to_string(),
         method: descriptor.method(),
         id,
      };
      let listener = state
         .collections
         .entry(key.collection.clone())
         .or_default()
         .entry(key.clone())
         .or_insert_with(|| Listener {
            descriptor: descriptor.clone().listen(true),
            identity,
            subscribers: IndexMap::new(),
         });
      listener.subscribers.insert(subscriber, tx);
      trace!(
         listener = %key,
         subscribers = listener.subscribers.len(),
         "Subscribed live query"
      );
      drop(state);

      Subscription {
         key,
         subscriber,
         receiver: rx,
         registry: Arc::downgrade(self),
      }
   }

   fn unsubscribe(&self, key: &ListenerKey, subscriber: u64) {
      let mut state = self.state.lock();
      let RegistryState {
         collections, ids, ..
      } = &mut *state;

      let Some(listeners) = collections.get_mut(&key.collection) else {
         return;
      };
      let Some(listener) = listeners.get_mut(key) else {
         return;
      };
      listener.subscribers.shift_remove(&subscriber);
      if listener.subscribers.is_empty()
         && let Some(listener) = listeners.shift_remove(key)
      {
         ids.release(&listener.identity);
         trace!(listener = %key, "Removed live query listener");
      }
   }

   /// Every listener on `collection` with a snapshot of its subscribers.
   pub(crate) fn listeners(&self, collection: &str) -> Vec<(QueryDescriptor, Vec<Subscriber>)> {
      let state = self.state.lock();
      state
         .collections
         .get(collection)
         .map(|listeners| {
            listeners
               .values()
               .map(|l| (l.descriptor.clone(), l.subscribers.values().cloned().collect()))
               .collect()
         })
         .unwrap_or_default()
   }

   pub(crate) fn has_collection(&self, collection: &str) -> bool {
      self.state.lock().collections.contains_key(collection)
   }

   pub(crate) fn listener_count(&self, collection: &str) -> usize {
      self
         .state
         .lock()
         .collections
         .get(collection)
         .map_or(0, IndexMap::len)
   }

   pub(crate) fn listener_keys(&self, collection: &str) -> Vec<ListenerKey> {
      self
         .state
         .lock()
         .collections
         .get(collection)
         .map(|listeners| listeners.keys().cloned().collect())
         .unwrap_or_default()
   }

   pub(crate) fn subscriber_count(&self, key: &ListenerKey) -> usize {
      self
         .state
         .lock()
         .collections
         .get(&key.collection)
         .and_then(|listeners| listeners.get(key))
         .map_or(0, |listener| listener.subscribers.len())
   }
}

/// One live query's subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub(crate) struct Subscription {
   key: ListenerKey,
   subscriber: u64,
   receiver: mpsc::UnboundedReceiver<Result<Output>>,
   registry: Weak<ListenerRegistry>,
}

impl Subscription {
   pub(crate) fn key(&self) -> &ListenerKey {
      &self.key
   }

   pub(crate) fn receiver(&mut self) -> &mut mpsc::UnboundedReceiver<Result<Output>> {
      &mut self.receiver
   }
}

impl Drop for Subscription {
   fn drop(&mut self) {
      if let Some(registry) = self.registry.upgrade() {
         registry.unsubscribe(&self.key, self.subscriber);
      }
   }
}
