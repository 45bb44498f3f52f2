//! Streams of query results.
//!
//! A [`QueryStream`] does nothing until it is first polled. It then
//! registers as a listener (for live reads), issues the request on the
//! handle's transaction (or a fresh one) and yields:
//!
//! - the request's result,
//! - a [`Transaction`](crate::Error::Transaction) error if the transaction
//!   then fails to commit,
//! - for live reads, one fresh result after every write to the collection.
//!
//! Any error ends the stream.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use sqlx_sqlite_objstore::{Method, Output, Transaction};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::bridge::Completion;
use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::query::{FromOutput, QueryDescriptor};
use crate::subscriptions::{ListenerKey, Subscription};

type Events = mpsc::UnboundedReceiver<Result<Output>>;

struct Pending {
   inner: Weak<ConnectionInner>,
   transaction: Option<Transaction>,
   descriptor: QueryDescriptor,
}

/// Results of a query, typed by the method that produced them.
#[must_use = "streams do nothing unless polled"]
pub struct QueryStream<T> {
   method: Method,
   pending: Option<Pending>,
   events: Option<Events>,
   subscription: Option<Subscription>,
   done: bool,
   _output: PhantomData<fn() -> T>,
}

impl<T: FromOutput> QueryStream<T> {
   pub(crate) fn new(
      inner: Weak<ConnectionInner>,
      transaction: Option<Transaction>,
      descriptor: QueryDescriptor,
   ) -> Self {
      Self {
         method: descriptor.method(),
         pending: Some(Pending {
            inner,
            transaction,
            descriptor,
         }),
         events: None,
         subscription: None,
         done: false,
         _output: PhantomData,
      }
   }

   /// The listener this stream is subscribed to, once it has started.
   pub fn listener_key(&self) -> Option<&ListenerKey> {
      self.subscription.as_ref().map(Subscription::key)
   }

   fn start(&mut self, pending: Pending) {
      let (tx, rx) = mpsc::unbounded_channel();
      self.events = Some(rx);

      let Some(inner) = pending.inner.upgrade().filter(|inner| !inner.is_closed()) else {
         let _ = tx.send(Err(Error::ConnectionClosed));
         return;
      };

      let descriptor = pending.descriptor;
      if descriptor.is_listening() && !descriptor.is_mutation() {
         self.subscription = Some(inner.registry().subscribe(&descriptor));
      }
      tokio::spawn(execute(inner, pending.transaction, descriptor, tx));
   }

   fn emit(&mut self, item: Result<Output>) -> Poll<Option<Result<T>>> {
      let item = item.and_then(|output| T::from_output(self.method, output));
      if let Err(e) = &item {
         debug!(method = %self.method, error = %e, "Query stream ended with an error");
         self.finish();
      }
      Poll::Ready(Some(item))
   }

   fn finish(&mut self) {
      self.done = true;
      self.events = None;
      self.subscription = None;
   }
}

impl<T: FromOutput> Stream for QueryStream<T> {
   type Item = Result<T>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      if let Some(pending) = this.pending.take() {
         this.start(pending);
      }
      if this.done {
         return Poll::Ready(None);
      }

      // The first result always comes before any re-run
      if let Some(events) = this.events.as_mut() {
         match events.poll_recv(cx) {
            Poll::Ready(Some(item)) => return this.emit(item),
            Poll::Ready(None) => this.events = None,
            Poll::Pending => return Poll::Pending,
         }
      }

      if let Some(subscription) = this.subscription.as_mut() {
         match subscription.receiver().poll_recv(cx) {
            Poll::Ready(Some(item)) => return this.emit(item),
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
         }
      }

      this.finish();
      Poll::Ready(None)
   }
}

impl<T> std::fmt::Debug for QueryStream<T> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("QueryStream")
         .field("method", &self.method)
         .field("started", &self.pending.is_none())
         .field("listening", &self.subscription.is_some())
         .field("done", &self.done)
         .finish()
   }
}

/// Runs one query to completion, reporting through `events`.
///
/// Runs on its own task, so dropping the stream never cancels an issued
/// request, its commit, or the re-run of live queries after a write.
async fn execute(
   inner: Arc<ConnectionInner>,
   transaction: Option<Transaction>,
   descriptor: QueryDescriptor,
   events: mpsc::UnboundedSender<Result<Output>>,
) {
   let transaction = match transaction {
      Some(transaction) => transaction,
      None => match inner.begin(&descriptor) {
         Ok(transaction) => transaction,
         Err(e) => {
            let _ = events.send(Err(e));
            return;
         }
      },
   };
   trace!(
      transaction = %transaction.id(),
      store = %descriptor.store(),
      method = %descriptor.method(),
      "Executing query"
   );

   let request = Completion::new(
      transaction.request(descriptor.source(), descriptor.operation().clone()),
   );
   let committed = Completion::new(transaction.commit());

   let output = match request.observe().await {
      Ok(output) => output,
      Err(e) => {
         let _ = events.send(Err(Error::Operation(e)));
         return;
      }
   };
   let _ = events.send(Ok(output.clone()));

   if let Err(e) = committed.observe().await {
      let _ = events.send(Err(Error::Transaction(e)));
      return;
   }

   if descriptor.is_mutation() {
      inner.publish(&descriptor, &output).await;
   }
}
