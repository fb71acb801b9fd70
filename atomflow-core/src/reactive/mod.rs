//! Reactive Atoms
//!
//! This module implements the user-facing side of the graph: atom handles,
//! the executor that runs computations, and the runtime that schedules them.
//!
//! # Concepts
//!
//! ## Sources
//!
//! A [`Source`] holds a value that is set from outside. Writes are staged and
//! become visible together at the next flush.
//!
//! ## Derived Atoms
//!
//! A derived [`Atom`] caches the result of a computation over other atoms.
//! Dependencies are tracked automatically through the [`Getter`] passed to
//! the computation, and may differ from one execution to the next. A
//! computation may also return a future; the atom is pending until it
//! settles, and only the latest execution's result is ever applied.
//!
//! ## Observers
//!
//! Watchers are called on every propagation. Subscribers receive every new
//! clean value together with a cancellation token that fires when the next
//! value arrives. An atom with neither, and without dependents, is
//! deactivated by the collector.
//!
//! ## Scopes
//!
//! A [`Scope`] overlays the graph with substituted atoms without touching
//! the originals.
//!
//! # Implementation Notes
//!
//! The runtime never runs deferred work itself. Flushes, collections and
//! futures are handed to a [`Driver`]; [`ManualDriver`] makes every step
//! explicit, which is what the tests use.

mod aggregate;
mod atom;
mod cancel;
mod context;
mod driver;
mod executor;
mod pending;
mod runtime;
mod scope;
mod subscriber;

pub use aggregate::AllGetter;
pub use atom::{Atom, AtomOptions, AtomState, EqualsFn, Source, Value};
pub use cancel::{CancelToken, Cancelled, SubscriberContext};
pub use driver::{Driver, ManualDriver, Task, TokioDriver};
pub use executor::{Computed, Getter, RunContext};
pub use pending::Pending;
pub use runtime::{Runtime, RuntimeConfig};
pub use scope::{Scope, ScopeBuilder};
pub use subscriber::{SubscriberId, Subscription};
