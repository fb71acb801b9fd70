//! Pending handles.
//!
//! A pending atom hands out a [`Pending`]: a clonable future that completes
//! when the asynchronous work the atom is waiting on has settled. Settling
//! does not mean the new value is visible yet; it becomes visible at the next
//! flush.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, FutureExt, Shared};

/// A clonable, awaitable handle on in-flight work.
#[derive(Clone)]
pub struct Pending {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl Pending {
    pub(crate) fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// Wait until every handle in `handles` has settled.
    pub fn all(handles: Vec<Pending>) -> Self {
        Self::new(futures_util::future::join_all(handles).map(|_| ()))
    }

    /// Whether the work has already settled.
    pub fn is_settled(&self) -> bool {
        self.inner.peek().is_some()
    }

    /// Whether two handles wait on the same work.
    pub fn ptr_eq(&self, other: &Pending) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

impl Future for Pending {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn clones_share_the_same_work() {
        let (tx, rx) = oneshot::channel::<()>();
        let pending = Pending::new(async move {
            let _ = rx.await;
        });
        let clone = pending.clone();

        assert!(pending.ptr_eq(&clone));
        assert!(!pending.is_settled());

        tx.send(()).unwrap();
        clone.await;
        assert!(pending.is_settled());
        pending.await;
    }

    #[tokio::test]
    async fn all_waits_for_every_handle() {
        let (tx1, rx1) = oneshot::channel::<()>();
        let (tx2, rx2) = oneshot::channel::<()>();
        let first = Pending::new(async move {
            let _ = rx1.await;
        });
        let second = Pending::new(async move {
            let _ = rx2.await;
        });

        let both = Pending::all(vec![first.clone(), second]);
        tx1.send(()).unwrap();
        first.await;
        assert!(!both.is_settled());

        tx2.send(()).unwrap();
        both.await;
    }
}
