//! Adapts one-shot engine requests into observable completions.
//!
//! An engine [`Request`](sqlx_sqlite_objstore::Request) resolves exactly once.
//! A [`Completion`] captures it so that any number of observers can await the
//! same outcome, and observers attached after the fact get the stored result
//! replayed instead of re-issuing the request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::EngineError;

/// Outcome of a completed engine operation.
pub type Outcome<T> = std::result::Result<T, EngineError>;

type SharedOutcome<T> = Shared<BoxFuture<'static, Outcome<T>>>;

/// A one-shot engine operation that can be observed any number of times.
#[derive(Clone)]
pub struct Completion<T: Clone> {
   inner: SharedOutcome<T>,
}

impl<T> Completion<T>
where
   T: Clone + Send + Sync + 'static,
{
   /// Captures `operation`.
   ///
   /// The operation is driven in the background, so it completes (and its
   /// outcome is stored) whether or not anyone is observing it.
   pub fn new<F>(operation: F) -> Self
   where
      F: Future<Output = sqlx_sqlite_objstore::Result<T>> + Send + 'static,
   {
      let inner = operation.map(|result| result.map_err(Arc::new)).boxed().shared();
      tokio::spawn(inner.clone());
      Self { inner }
   }

   /// Attaches an observer. Dropping the observation only detaches it.
   pub fn observe(&self) -> Observation<T> {
      Observation {
         inner: self.inner.clone(),
      }
   }

   /// The stored outcome, if the operation has finished.
   pub fn peek(&self) -> Option<&Outcome<T>> {
      self.inner.peek()
   }

   pub fn is_complete(&self) -> bool {
      self.peek().is_some()
   }
}

impl<T: Clone> std::fmt::Debug for Completion<T> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Completion")
         .field("complete", &self.inner.peek().is_some())
         .finish()
   }
}

/// A single observer of a [`Completion`].
#[must_use = "observations do nothing unless awaited"]
pub struct Observation<T: Clone> {
   inner: SharedOutcome<T>,
}

impl<T: Clone> Future for Observation<T> {
   type Output = Outcome<T>;

   fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
      Pin::new(&mut self.inner).poll(cx)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use sqlx_sqlite_objstore::Error;
   use std::sync::atomic::{AtomicUsize, Ordering};
   use tokio::sync::oneshot;

   #[tokio::test]
   async fn test_observers_share_one_outcome() {
      let runs = Arc::new(AtomicUsize::new(0));
      let completion = {
         let runs = Arc::clone(&runs);
         Completion::new(async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(42u64)
         })
      };

      let (a, b) = tokio::join!(completion.observe(), completion.observe());
      assert_eq!(a.unwrap(), 42);
      assert_eq!(b.unwrap(), 42);

      // Late observers replay the stored result
      assert_eq!(completion.observe().await.unwrap(), 42);
      assert!(completion.is_complete());
      assert_eq!(runs.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_error_is_replayed() {
      let completion: Completion<u64> =
         Completion::new(async { Err(Error::NotFound("object store 'x'".into())) });

      let first = completion.observe().await.unwrap_err();
      let second = completion.observe().await.unwrap_err();
      assert!(Arc::ptr_eq(&first, &second));
      assert_eq!(first.error_code(), "NOT_FOUND_ERROR");
   }

   #[tokio::test]
   async fn test_dropped_observation_does_not_cancel() {
      let (tx, rx) = oneshot::channel::<u64>();
      let completion =
         Completion::new(async move { rx.await.map_err(|_| Error::Aborted("sender gone".into())) });

      let dropped = completion.observe();
      drop(dropped);
      assert!(completion.peek().is_none());

      tx.send(7).unwrap();
      assert_eq!(completion.observe().await.unwrap(), 7);
   }
}
