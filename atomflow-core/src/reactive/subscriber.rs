//! Observer bookkeeping.
//!
//! Watchers and subscribers are stored on the atom under a
//! [`SubscriberId`]. Registering either hands back a [`Subscription`] that
//! removes the observer again when it is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a watcher or subscriber.
///
/// IDs come from an atomic counter, so they are unique across threads and
/// ordered by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Handle to a registered watcher or subscriber.
///
/// Dropping the handle unregisters the observer. Use [`Subscription::detach`]
/// to keep the observer for the lifetime of the atom.
#[must_use = "dropping a Subscription unregisters the observer"]
pub struct Subscription {
    id: SubscriberId,
    release: Option<Release>,
}

impl Subscription {
    pub(crate) fn new<F>(id: SubscriberId, release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    /// The observer's ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Unregister the observer now.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    /// Keep the observer registered after the handle is gone.
    pub fn detach(mut self) {
        self.release = None;
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("registered", &self.release.is_some())
            .finish()
    }
}
