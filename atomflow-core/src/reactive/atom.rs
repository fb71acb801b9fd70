//! Atom Implementation
//!
//! An atom is a node of the graph: either a [`Source`] holding a value that
//! is set from outside, or a derived atom computed from the atoms it reads.
//!
//! # How Atoms Work
//!
//! 1. A source starts with its initial value and is always active.
//!
//! 2. A derived atom starts inactive. The first watcher or subscriber
//!    activates it on the next flush; a bare [`Atom::get`] runs it once on
//!    the spot and hands it to the collector afterwards.
//!
//! 3. Writing a source stages the new value and queues the source. Nothing
//!    is visible until the flush commits every staged write at once.
//!
//! 4. The flush re-executes the dependents that actually saw a change, in
//!    dependency order, and notifies watchers and subscribers.
//!
//! 5. A derived atom nothing observes any more is deactivated by the
//!    collector, which also releases the atoms it was reading.
//!
//! # State
//!
//! Exactly one of *pending*, *failed* and *ready* is authoritative at any
//! time. The last good value survives a pending or failed state as a stale
//! cache, which [`Atom::state`] exposes.
//!
//! # Thread Safety
//!
//! Atoms are `Send + Sync`. Each node guards its record with a short-lived
//! lock that is never held while user code runs.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use super::cancel::{SubscriberContext, TokenSlot};
use super::context::ExecutionContext;
use super::executor::ComputeFn;
use super::pending::Pending;
use super::runtime::Runtime;
use super::subscriber::{SubscriberId, Subscription};
use crate::error::{AtomError, Interrupt};
use crate::graph::{AnyNode, Dependents, Flags, NodeId, NodeKind};

/// Bounds every atom value satisfies.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// Equality predicate used to suppress propagation of unchanged values.
pub type EqualsFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Options for creating an atom.
pub struct AtomOptions<T> {
    pub(crate) equals: Option<EqualsFn<T>>,
    pub(crate) persist: bool,
}

impl<T: Value> AtomOptions<T> {
    /// Options without an equality predicate: every new value counts as a
    /// change.
    pub fn new() -> Self {
        Self {
            equals: None,
            persist: false,
        }
    }

    /// Use `equals` to decide whether a new value differs from the old one.
    pub fn equals<F>(mut self, equals: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.equals = Some(Arc::new(equals));
        self
    }

    /// Exempt the atom from garbage collection.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
}

impl<T: Value + PartialEq> Default for AtomOptions<T> {
    fn default() -> Self {
        AtomOptions::new().equals(|a: &T, b: &T| a == b)
    }
}

impl<T> Clone for AtomOptions<T> {
    fn clone(&self) -> Self {
        Self {
            equals: self.equals.clone(),
            persist: self.persist,
        }
    }
}

impl<T> fmt::Debug for AtomOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomOptions")
            .field("equals", &self.equals.is_some())
            .field("persist", &self.persist)
            .finish()
    }
}

/// Snapshot of an atom's state.
#[derive(Clone, Debug)]
pub enum AtomState<T> {
    /// Never computed, or deactivated.
    Inactive,

    /// Waiting on asynchronous work.
    Pending { pending: Pending, stale: Option<T> },

    /// Holding a clean value.
    Ready(T),

    /// Holding an error.
    Failed { error: AtomError, stale: Option<T> },
}

impl<T> AtomState<T> {
    /// The clean value, or the stale one kept through a pending or failed
    /// state.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Inactive => None,
            Self::Ready(value) => Some(value),
            Self::Pending { stale, .. } | Self::Failed { stale, .. } => stale.as_ref(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Turn the snapshot into what [`Atom::get`] would return.
    pub fn into_result(self, id: NodeId) -> Result<T, Interrupt> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending { pending, .. } => Err(Interrupt::Pending(pending)),
            Self::Failed { error, .. } => Err(Interrupt::Failed(error)),
            Self::Inactive => Err(Interrupt::Failed(AtomError::Inactive(id))),
        }
    }
}

// ----------------------------------------------------------------------------
// Node record
// ----------------------------------------------------------------------------

/// Which of pending, failed and ready is authoritative.
pub(super) enum Status {
    Inactive,
    Pending(Pending),
    Ready,
    Failed(AtomError),
}

/// Data waiting for the next flush.
pub(super) enum Staged<T> {
    Value(T),
    Failed(AtomError),
    Pending(Pending),
}

pub(super) type Watcher = Arc<dyn Fn() + Send + Sync>;

type SubscriberFn<T> = Box<dyn Fn(&T, &SubscriberContext) + Send + Sync>;

/// A registered subscriber and the token of its latest call.
pub(super) struct SubscriberEntry<T> {
    callback: SubscriberFn<T>,
    token: TokenSlot,
}

impl<T: Value> SubscriberEntry<T> {
    fn new(callback: SubscriberFn<T>) -> Self {
        Self {
            callback,
            token: TokenSlot::default(),
        }
    }

    /// Cancel the previous call's token and deliver `value`.
    pub(super) fn notify(&self, value: &T, runtime: &Runtime) {
        self.token.cancel();
        let context = SubscriberContext::new(self.token.lease());
        let _detached = ExecutionContext::detach();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (self.callback)(value, &context))) {
            runtime.report(&AtomError::from_panic(payload));
        }
    }
}

pub(super) struct Inner<T> {
    /// Last good value. May lag behind a pending or failed status.
    pub(super) value: Option<T>,
    pub(super) status: Status,
    pub(super) staged: Option<Staged<T>>,
    pub(super) active: bool,
    pub(super) generation: u64,

    /// Nodes read by the last completed execution.
    pub(super) dependencies: IndexMap<NodeId, Arc<dyn AnyNode>>,

    /// Nodes read by the execution in progress.
    pub(super) next_dependencies: IndexMap<NodeId, Arc<dyn AnyNode>>,

    pub(super) dependents: IndexMap<NodeId, Weak<dyn AnyNode>>,
    pub(super) watchers: IndexMap<SubscriberId, Watcher>,
    pub(super) subscribers: IndexMap<SubscriberId, Arc<SubscriberEntry<T>>>,
}

impl<T> Inner<T> {
    fn new(value: Option<T>, active: bool) -> Self {
        let status = if value.is_some() {
            Status::Ready
        } else {
            Status::Inactive
        };
        Self {
            value,
            status,
            staged: None,
            active,
            generation: 0,
            dependencies: IndexMap::new(),
            next_dependencies: IndexMap::new(),
            dependents: IndexMap::new(),
            watchers: IndexMap::new(),
            subscribers: IndexMap::new(),
        }
    }

    fn is_observed(&self) -> bool {
        !self.watchers.is_empty()
            || !self.subscribers.is_empty()
            || self.dependents.values().any(|d| d.strong_count() > 0)
    }

    /// Close an execution: bump the generation and swap in the dependencies
    /// it read. Returns the dependencies that are no longer read.
    pub(super) fn finalize(&mut self) -> Vec<Arc<dyn AnyNode>> {
        self.generation += 1;
        let next = std::mem::take(&mut self.next_dependencies);
        let previous = std::mem::replace(&mut self.dependencies, next);
        previous
            .into_iter()
            .filter(|(id, _)| !self.dependencies.contains_key(id))
            .map(|(_, dependency)| dependency)
            .collect()
    }

    fn snapshot(&self) -> AtomState<T>
    where
        T: Clone,
    {
        match &self.status {
            Status::Inactive => AtomState::Inactive,
            Status::Ready => match &self.value {
                Some(value) => AtomState::Ready(value.clone()),
                None => AtomState::Inactive,
            },
            Status::Pending(pending) => AtomState::Pending {
                pending: pending.clone(),
                stale: self.value.clone(),
            },
            Status::Failed(error) => AtomState::Failed {
                error: error.clone(),
                stale: self.value.clone(),
            },
        }
    }
}

/// The typed record behind every atom handle.
pub(crate) struct Node<T: Value> {
    pub(super) id: NodeId,
    pub(super) kind: NodeKind,
    pub(super) runtime: Runtime,
    pub(super) compute: Option<ComputeFn<T>>,
    pub(super) equals: Option<EqualsFn<T>>,
    pub(super) persist: bool,
    pub(super) flags: Flags,
    pub(super) inner: Mutex<Inner<T>>,

    /// Token of the current execution.
    pub(super) token: TokenSlot,

    pub(super) this: Weak<Node<T>>,
}

impl<T: Value> Node<T> {
    pub(super) fn source(runtime: Runtime, value: T, options: AtomOptions<T>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: NodeId::new(),
            kind: NodeKind::Source,
            runtime,
            compute: None,
            equals: options.equals,
            persist: options.persist,
            flags: Flags::default(),
            inner: Mutex::new(Inner::new(Some(value), true)),
            token: TokenSlot::default(),
            this: this.clone(),
        })
    }

    pub(super) fn derived(
        runtime: Runtime,
        compute: ComputeFn<T>,
        options: AtomOptions<T>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: NodeId::new(),
            kind: NodeKind::Derived,
            runtime,
            compute: Some(compute),
            equals: options.equals,
            persist: options.persist,
            flags: Flags::default(),
            inner: Mutex::new(Inner::new(None, false)),
            token: TokenSlot::default(),
            this: this.clone(),
        })
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock()
    }

    /// This node as a type-erased graph node.
    pub(super) fn as_dyn(&self) -> Option<Arc<dyn AnyNode>> {
        self.this.upgrade().map(|node| node as Arc<dyn AnyNode>)
    }

    /// The options this node was created with.
    pub(super) fn options(&self) -> AtomOptions<T> {
        AtomOptions {
            equals: self.equals.clone(),
            persist: self.kind == NodeKind::Derived && self.persist,
        }
    }

    /// Whether `next` is equal to `previous` under this node's predicate.
    ///
    /// Without a predicate, or without a previous value, nothing is equal.
    pub(super) fn is_equal(&self, next: &T, previous: Option<&T>) -> bool {
        match (&self.equals, previous) {
            (Some(equals), Some(previous)) => equals(next, previous),
            _ => false,
        }
    }

    pub(super) fn read(&self) -> Result<T, Interrupt> {
        self.snapshot().into_result(self.id)
    }

    pub(super) fn snapshot(&self) -> AtomState<T> {
        self.lock().snapshot()
    }

    /// Stage a write of a source.
    fn write(&self, value: T) {
        if self.runtime.config().reject_nested_writes && ExecutionContext::is_active() {
            self.runtime
                .report(&AtomError::WriteDuringComputation(self.id));
            return;
        }

        let current = self.lock().value.clone();
        if self.is_equal(&value, current.as_ref()) {
            // A write back to the committed value withdraws the staged one.
            self.lock().staged = None;
            return;
        }

        self.lock().staged = Some(Staged::Value(value));
        if let Some(node) = self.as_dyn() {
            self.runtime.request_propagate(node);
        }
    }

    /// The value an update function should start from.
    fn latest(&self) -> Option<T> {
        let inner = self.lock();
        match &inner.staged {
            Some(Staged::Value(value)) => Some(value.clone()),
            _ => inner.value.clone(),
        }
    }

    fn watch(&self, watcher: Watcher) -> SubscriberId {
        let id = SubscriberId::new();
        let active = {
            let mut inner = self.lock();
            inner.watchers.insert(id, watcher);
            inner.active
        };
        if !active {
            self.request_activate();
        }
        id
    }

    fn unwatch(&self, id: SubscriberId) {
        let removed = self.lock().watchers.shift_remove(&id);
        if removed.is_some() {
            self.request_deactivate();
        }
    }

    fn subscribe(&self, callback: SubscriberFn<T>) -> SubscriberId {
        let id = SubscriberId::new();
        let entry = Arc::new(SubscriberEntry::new(callback));

        let (active, current) = {
            let inner = self.lock();
            let current = match inner.status {
                Status::Ready if inner.active => inner.value.clone(),
                _ => None,
            };
            (inner.active, current)
        };

        if !active {
            self.request_activate();
        } else if let Some(value) = current {
            entry.notify(&value, &self.runtime);
        }

        self.lock().subscribers.insert(id, entry);
        id
    }

    fn unsubscribe(&self, id: SubscriberId) {
        let removed = self.lock().subscribers.shift_remove(&id);
        if let Some(entry) = removed {
            entry.token.cancel();
            self.request_deactivate();
        }
    }

    fn request_activate(&self) {
        if let Some(node) = self.as_dyn() {
            self.runtime.request_activate(node);
        }
    }

    pub(super) fn request_deactivate(&self) {
        if let Some(node) = self.as_dyn() {
            self.runtime.request_deactivate(node);
        }
    }

    /// Unlink from `dependencies` and hand them to the collector.
    pub(super) fn release(&self, dependencies: Vec<Arc<dyn AnyNode>>) {
        for dependency in dependencies {
            dependency.remove_dependent(self.id);
            self.runtime.request_deactivate(dependency);
        }
    }
}

impl<T: Value> AnyNode for Node<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn flags(&self) -> &Flags {
        &self.flags
    }

    fn is_active(&self) -> bool {
        self.lock().active
    }

    fn is_settled(&self) -> bool {
        matches!(self.lock().status, Status::Ready)
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn commit(&self) -> bool {
        let mut inner = self.lock();
        match inner.staged.take() {
            Some(Staged::Value(value)) => {
                inner.value = Some(value);
                inner.status = Status::Ready;
                true
            }
            Some(Staged::Failed(error)) => {
                inner.status = Status::Failed(error);
                true
            }
            Some(Staged::Pending(pending)) => {
                inner.status = Status::Pending(pending);
                true
            }
            None => self.kind == NodeKind::Derived,
        }
    }

    fn execute(&self) {
        self.run();
    }

    fn propagate(&self) {
        self.propagate_now();
    }

    fn dependents(&self) -> Dependents {
        self.lock()
            .dependents
            .values()
            .filter_map(Weak::upgrade)
            .collect::<SmallVec<_>>()
    }

    fn add_dependent(&self, dependent: &Arc<dyn AnyNode>) {
        self.lock()
            .dependents
            .insert(dependent.id(), Arc::downgrade(dependent));
    }

    fn remove_dependent(&self, id: NodeId) {
        self.lock().dependents.shift_remove(&id);
    }

    fn track(&self, dependency: Arc<dyn AnyNode>) {
        let replaced = self
            .lock()
            .next_dependencies
            .insert(dependency.id(), dependency);
        drop(replaced);
    }

    fn is_collectable(&self) -> bool {
        if self.kind == NodeKind::Source || self.persist {
            return false;
        }
        let inner = self.lock();
        inner.active && !inner.is_observed()
    }

    fn deactivate(&self) -> Option<Vec<Arc<dyn AnyNode>>> {
        if self.kind == NodeKind::Source || self.persist {
            return None;
        }

        let released = {
            let mut inner = self.lock();
            if !inner.active || inner.is_observed() {
                return None;
            }
            inner.active = false;
            inner.generation += 1;
            inner.status = Status::Inactive;
            inner.value = None;
            inner.staged = None;
            inner.dependents.clear();
            let mut released: Vec<_> = inner.dependencies.drain(..).map(|(_, d)| d).collect();
            released.extend(inner.next_dependencies.drain(..).map(|(_, d)| d));
            released
        };

        self.flags.clear();
        self.token.cancel();
        for dependency in &released {
            dependency.remove_dependent(self.id);
        }
        Some(released)
    }
}

impl<T: Value> Drop for Node<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let mut dependencies: Vec<_> = inner.dependencies.drain(..).map(|(_, d)| d).collect();
        dependencies.extend(inner.next_dependencies.drain(..).map(|(_, d)| d));

        self.token.cancel();
        for dependency in dependencies {
            dependency.remove_dependent(self.id);
            self.runtime.request_deactivate(dependency);
        }
    }
}

// ----------------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------------

/// Handle to an atom.
///
/// Cloning is cheap; clones refer to the same node. Two handles compare equal
/// when they refer to the same node.
pub struct Atom<T: Value> {
    pub(crate) node: Arc<Node<T>>,
}

impl<T: Value> Atom<T> {
    pub(crate) fn from_node(node: Arc<Node<T>>) -> Self {
        Self { node }
    }

    /// The node's identity.
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// Whether this is a source or a derived atom.
    pub fn kind(&self) -> NodeKind {
        self.node.kind
    }

    /// Whether the atom participates in propagation.
    pub fn is_active(&self) -> bool {
        AnyNode::is_active(&*self.node)
    }

    /// The runtime this atom belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.node.runtime
    }

    /// Read the current value.
    ///
    /// An inactive derived atom is executed once on the spot and handed to
    /// the collector afterwards, so a bare read never keeps it alive.
    pub fn get(&self) -> Result<T, Interrupt> {
        if !self.is_active() {
            self.node.run();
            self.node.request_deactivate();
        }
        self.node.read()
    }

    /// Snapshot of the state. Never executes anything.
    pub fn state(&self) -> AtomState<T> {
        self.node.snapshot()
    }

    /// Call `watcher` on every propagation, including pending and failed
    /// states. Activates the atom if needed.
    pub fn watch<F>(&self, watcher: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.node.watch(Arc::new(watcher));
        let node = self.node.clone();
        Subscription::new(id, move || node.unwatch(id))
    }

    /// Call `subscriber` with every new clean value.
    ///
    /// If the atom is active and holds a clean value, the subscriber is
    /// called once right away. Activates the atom if needed.
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&T, &SubscriberContext) + Send + Sync + 'static,
    {
        let id = self.node.subscribe(Box::new(subscriber));
        let node = self.node.clone();
        Subscription::new(id, move || node.unsubscribe(id))
    }

    /// This atom as a source, if it is one.
    pub fn as_source(&self) -> Option<Source<T>> {
        match self.node.kind {
            NodeKind::Source => Some(Source(self.clone())),
            NodeKind::Derived => None,
        }
    }
}

impl<T: Value> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T: Value> PartialEq for Atom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.node.id == other.node.id
    }
}

impl<T: Value> Eq for Atom<T> {}

impl<T: Value> Hash for Atom<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.id.hash(state);
    }
}

impl<T: Value> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.node.id)
            .field("kind", &self.node.kind)
            .finish()
    }
}

/// Handle to a source atom: an atom that can be written.
pub struct Source<T: Value>(Atom<T>);

impl<T: Value> Source<T> {
    pub(crate) fn from_node(node: Arc<Node<T>>) -> Self {
        Self(Atom::from_node(node))
    }

    /// Stage `value`. It becomes visible at the next flush unless it equals
    /// the current value.
    pub fn set(&self, value: T) {
        self.0.node.write(value);
    }

    /// Stage the result of `update` applied to the latest staged value.
    pub fn update<F>(&self, update: F)
    where
        F: FnOnce(&T) -> T,
    {
        if let Some(previous) = self.0.node.latest() {
            self.set(update(&previous));
        }
    }

    /// The underlying atom handle.
    pub fn as_atom(&self) -> &Atom<T> {
        &self.0
    }
}

impl<T: Value> Deref for Source<T> {
    type Target = Atom<T>;

    fn deref(&self) -> &Atom<T> {
        &self.0
    }
}

impl<T: Value> AsRef<Atom<T>> for Source<T> {
    fn as_ref(&self) -> &Atom<T> {
        &self.0
    }
}

impl<T: Value> From<Source<T>> for Atom<T> {
    fn from(source: Source<T>) -> Self {
        source.0
    }
}

impl<T: Value> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Value> PartialEq for Source<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: Value> Eq for Source<T> {}

impl<T: Value> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Source").field(&self.0.node.id).finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
