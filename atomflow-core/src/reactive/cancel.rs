//! Cancellation tokens.
//!
//! Every derived execution and every subscriber call can ask for a
//! [`CancelToken`]. The token of an execution is cancelled when the atom
//! re-executes or deactivates; the token of a subscriber call is cancelled
//! right before the subscriber receives its next value, and when the
//! subscription ends.
//!
//! Tokens are created lazily: an execution that never asks for one costs
//! nothing. A context that outlives its execution or call hands out an
//! already cancelled token.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use tracing::error;

use crate::error::AtomError;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
    wakers: Mutex<Vec<Waker>>,
}

/// Token for cooperative cancellation of asynchronous work.
///
/// Clones share the same state. Any number of consumers may register
/// callbacks or wait on [`CancelToken::cancelled`].
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a new, live token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Runs every registered callback once.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for callback in callbacks {
            run_guarded(callback);
        }

        let wakers = std::mem::take(&mut *self.inner.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }

    /// Check if cancellation has been signaled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Run `callback` on cancellation, or right away if already cancelled.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut callbacks = self.inner.callbacks.lock();
            if !self.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        run_guarded(Box::new(callback));
    }

    /// A future that completes once the token is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn run_guarded(callback: Callback) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        let error = AtomError::from_panic(payload);
        error!(%error, "cancellation callback panicked");
    }
}

/// Future returned by [`CancelToken::cancelled`].
#[derive(Debug)]
pub struct Cancelled {
    token: CancelToken,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        let mut wakers = self.token.inner.wakers.lock();
        // Re-check under the lock: `cancel` drains the wakers after the flag.
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// A lazily created token that is replaced after each cancellation.
///
/// Every cancellation starts a new epoch. A [`TokenLease`] taken in one
/// epoch only ever hands out that epoch's token.
#[derive(Clone, Default)]
pub(crate) struct TokenSlot {
    state: Arc<Mutex<SlotState>>,
}

#[derive(Default)]
struct SlotState {
    token: Option<CancelToken>,
    epoch: u64,
}

impl TokenSlot {
    /// Cancel and drop the current token, if one was handed out, and start
    /// a new epoch.
    pub fn cancel(&self) {
        let token = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.token.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// A lease on the current epoch's token.
    pub fn lease(&self) -> TokenLease {
        let epoch = self.state.lock().epoch;
        TokenLease {
            state: self.state.clone(),
            epoch,
        }
    }
}

/// Access to the token of one epoch of a [`TokenSlot`].
#[derive(Clone)]
pub(crate) struct TokenLease {
    state: Arc<Mutex<SlotState>>,
    epoch: u64,
}

impl TokenLease {
    /// The epoch's token, or an already cancelled one once the epoch ended.
    pub fn get(&self) -> CancelToken {
        {
            let mut state = self.state.lock();
            if state.epoch == self.epoch {
                return state.token.get_or_insert_with(CancelToken::new).clone();
            }
        }
        let token = CancelToken::new();
        token.cancel();
        token
    }
}

/// Context handed to subscribers alongside each value.
pub struct SubscriberContext {
    token: TokenLease,
}

impl SubscriberContext {
    pub(crate) fn new(token: TokenLease) -> Self {
        Self { token }
    }

    /// Token cancelled when the next value arrives or the subscription ends.
    pub fn token(&self) -> CancelToken {
        self.token.get()
    }
}
