//! Executor
//!
//! Runs a derived atom's computation, records what it reads, and turns the
//! outcome into the atom's next state.
//!
//! # How It Works
//!
//! 1. Every execution bumps the atom's generation and captures it. The
//!    [`Getter`] handed to the computation carries that generation; a read
//!    through a getter whose generation is no longer current fails with
//!    [`Interrupt::Expired`].
//!
//! 2. Each read activates the dependency if needed and records the edge in
//!    both directions. Edges accumulate in a fresh set; when the execution
//!    completes, the old set is diffed against it and dependencies no longer
//!    read are unlinked and handed to the collector.
//!
//! 3. A synchronous result is applied immediately. An asynchronous result
//!    makes the atom pending; the future is spawned on the driver and its
//!    outcome is applied when it settles, unless a newer execution started in
//!    the meantime.
//!
//! 4. Completing an execution bumps the generation again, so a getter that
//!    escaped its computation can never add edges later.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::atom::{Atom, AtomState, Node, Staged, Status, Value, Watcher};
use super::cancel::{CancelToken, TokenLease};
use super::context::ExecutionContext;
use super::pending::Pending;
use super::scope::Scope;
use crate::error::{AtomError, Interrupt};
use crate::graph::{AnyNode, NodeKind};

/// The computation stored in a derived node.
pub(crate) type ComputeFn<T> = Arc<dyn Fn(Getter, RunContext) -> Computed<T> + Send + Sync>;

/// The outcome of invoking a computation.
pub enum Computed<T> {
    /// The computation finished synchronously.
    Ready(Result<T, Interrupt>),

    /// The computation continues asynchronously.
    Future(BoxFuture<'static, Result<T, Interrupt>>),
}

impl<T> Computed<T> {
    /// Wrap a future.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Interrupt>> + Send + 'static,
    {
        Self::Future(future.boxed())
    }
}

impl<T> From<Result<T, Interrupt>> for Computed<T> {
    fn from(result: Result<T, Interrupt>) -> Self {
        Self::Ready(result)
    }
}

/// Read handle passed to computations.
///
/// Reads through a getter are tracked: the computation is re-run when
/// anything it read changes.
#[derive(Clone)]
pub struct Getter {
    reader: Weak<dyn AnyNode>,
    generation: u64,
    scope: Option<Scope>,
}

impl Getter {
    fn new(reader: Weak<dyn AnyNode>, generation: u64) -> Self {
        Self {
            reader,
            generation,
            scope: None,
        }
    }

    /// Read `atom`, failing with its pending handle or error.
    pub fn get<U: Value>(&self, atom: &Atom<U>) -> Result<U, Interrupt> {
        self.track(atom)?.read()
    }

    /// Read the state of `atom` without failing on pending or error.
    pub fn state<U: Value>(&self, atom: &Atom<U>) -> Result<AtomState<U>, Interrupt> {
        Ok(self.track(atom)?.snapshot())
    }

    /// Whether the execution this getter belongs to is still current.
    pub fn is_current(&self) -> bool {
        self.reader
            .upgrade()
            .is_some_and(|reader| reader.generation() == self.generation)
    }

    /// Resolve every read through `scope`.
    pub(crate) fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    fn track<U: Value>(&self, atom: &Atom<U>) -> Result<Arc<Node<U>>, Interrupt> {
        let reader = self.reader.upgrade().ok_or(Interrupt::Expired)?;
        if reader.generation() != self.generation {
            return Err(Interrupt::Expired);
        }

        let node = match &self.scope {
            Some(scope) => scope.atom(atom).node,
            None => atom.node.clone(),
        };

        if node.id != reader.id() {
            if !AnyNode::is_active(&*node) {
                node.run();
                if node.flags.needs_propagate() {
                    node.propagate_now();
                }
            }
            let dependency: Arc<dyn AnyNode> = node.clone();
            reader.track(dependency);
            node.add_dependent(&reader);
        }

        Ok(node)
    }
}

/// Per-execution context passed to computations.
#[derive(Clone)]
pub struct RunContext {
    token: TokenLease,
}

impl RunContext {
    /// Token cancelled when the atom re-executes or deactivates.
    ///
    /// Once a newer execution started, the token is already cancelled.
    pub fn token(&self) -> CancelToken {
        self.token.get()
    }
}

impl<T: Value> Node<T> {
    /// Execute the computation. A no-op for sources.
    pub(crate) fn run(&self) {
        let Some(compute) = self.compute.clone() else {
            return;
        };
        let Some(reader) = self.as_dyn() else {
            return;
        };

        let (generation, activated) = {
            let mut inner = self.lock();
            inner.generation += 1;
            let activated = !std::mem::replace(&mut inner.active, true);
            inner.staged = None;
            if matches!(inner.status, Status::Pending(_)) {
                inner.status = if inner.value.is_some() {
                    Status::Ready
                } else {
                    Status::Inactive
                };
            }
            // Edges of a superseded execution that never completed.
            let leftover = std::mem::take(&mut inner.next_dependencies);
            for (id, dependency) in leftover {
                inner.dependencies.entry(id).or_insert(dependency);
            }
            (inner.generation, activated)
        };
        self.flags.clear_execute();
        self.token.cancel();
        if activated {
            debug!(node = %self.id, "activated");
        }
        trace!(node = %self.id, generation, "execute");

        let getter = Getter::new(Arc::downgrade(&reader), generation);
        let context = RunContext {
            token: self.token.lease(),
        };
        let computed = {
            let _context = ExecutionContext::enter(self.id);
            catch_unwind(AssertUnwindSafe(|| compute(getter, context)))
        };

        match computed {
            Ok(Computed::Ready(result)) => self.finish(result),
            Ok(Computed::Future(future)) => self.start(generation, future),
            Err(payload) => self.finish(Err(Interrupt::Raised(AtomError::from_panic(payload)))),
        }
    }

    /// Apply a synchronous result.
    fn finish(&self, result: Result<T, Interrupt>) {
        let stale = self.lock().finalize();

        match result {
            Ok(value) => {
                let previous = self.lock().value.clone();
                let equal = self.is_equal(&value, previous.as_ref());
                {
                    let mut inner = self.lock();
                    inner.status = Status::Ready;
                    if !equal {
                        inner.value = Some(value);
                    }
                }
                if equal {
                    self.flags.clear_propagate();
                    self.requeue_blocked();
                }
            }
            Err(Interrupt::Pending(pending)) => {
                self.lock().status = Status::Pending(pending);
            }
            Err(Interrupt::Failed(error)) => {
                self.lock().status = Status::Failed(error);
            }
            Err(Interrupt::Raised(error)) => {
                self.runtime.report(&error);
                self.lock().status = Status::Failed(error);
            }
            Err(Interrupt::Expired) => {
                self.flags.clear_propagate();
            }
        }

        self.release(stale);
    }

    /// Make the node pending on `future` and drive it on the runtime.
    fn start(&self, generation: u64, future: BoxFuture<'static, Result<T, Interrupt>>) {
        let this = self.this.clone();
        let pending = Pending::new(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(Interrupt::Raised(AtomError::from_panic(payload))),
            };
            if let Some(node) = this.upgrade() {
                node.settle(generation, result);
            }
        });

        self.lock().status = Status::Pending(pending.clone());
        self.runtime.spawn(pending.boxed());
    }

    /// Apply the outcome of the asynchronous execution `generation`.
    fn settle(&self, generation: u64, result: Result<T, Interrupt>) {
        let stale = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(node = %self.id, generation, "discarding superseded result");
                return;
            }
            inner.finalize()
        };

        let staged = match result {
            Ok(value) => {
                let previous = self.lock().value.clone();
                if self.is_equal(&value, previous.as_ref()) {
                    None
                } else {
                    Some(Staged::Value(value))
                }
            }
            Err(Interrupt::Pending(pending)) => Some(Staged::Pending(pending)),
            Err(Interrupt::Failed(error)) => Some(Staged::Failed(error)),
            Err(Interrupt::Raised(error)) => {
                self.runtime.report(&error);
                Some(Staged::Failed(error))
            }
            Err(Interrupt::Expired) => {
                debug!(node = %self.id, generation, "asynchronous read expired");
                None
            }
        };

        match staged {
            Some(staged) => {
                self.lock().staged = Some(staged);
                if let Some(node) = self.as_dyn() {
                    self.runtime.request_propagate(node);
                }
            }
            None => {
                // Unchanged: nobody is notified, but the node is no longer
                // pending and readers blocked on it must run again.
                {
                    let mut inner = self.lock();
                    if matches!(inner.status, Status::Pending(_)) {
                        inner.status = if inner.value.is_some() {
                            Status::Ready
                        } else {
                            Status::Inactive
                        };
                    }
                }
                self.requeue_blocked();
            }
        }

        self.release(stale);
    }

    /// Re-run dependents that hold a pending or failed state.
    fn requeue_blocked(&self) {
        for dependent in self.dependents() {
            if dependent.kind() == NodeKind::Derived && !dependent.is_settled() {
                self.runtime.request_activate(dependent);
            }
        }
    }

    /// Notify watchers, then subscribers and dependents if the state is a
    /// clean value. Otherwise only dependents blocked on this node run again,
    /// so they pick up its new pending handle or error.
    pub(crate) fn propagate_now(&self) {
        self.flags.clear_propagate();

        let (watchers, delivery) = {
            let inner = self.lock();
            let watchers: SmallVec<[Watcher; 4]> = inner.watchers.values().cloned().collect();
            let delivery = match (&inner.status, &inner.value) {
                (Status::Ready, Some(value)) => {
                    let subscribers: SmallVec<[_; 4]> =
                        inner.subscribers.values().cloned().collect();
                    Some((value.clone(), subscribers))
                }
                _ => None,
            };
            (watchers, delivery)
        };
        trace!(node = %self.id, watchers = watchers.len(), "propagate");

        {
            let _detached = ExecutionContext::detach();
            for watcher in watchers {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| watcher())) {
                    self.runtime.report(&AtomError::from_panic(payload));
                }
            }
        }

        let Some((value, subscribers)) = delivery else {
            self.requeue_blocked();
            return;
        };
        for subscriber in subscribers {
            subscriber.notify(&value, &self.runtime);
        }
        for dependent in self.dependents() {
            self.runtime.request_activate(dependent);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{ManualDriver, Runtime};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};
    use tokio::sync::oneshot;

    fn setup() -> (Arc<ManualDriver>, Runtime) {
        let driver = Arc::new(ManualDriver::new());
        let runtime = Runtime::new(driver.clone());
        (driver, runtime)
    }

    #[test]
    fn conditional_reads_unlink_stale_edges() {
        let (driver, rt) = setup();
        let flag = rt.source(true);
        let a = rt.source(1);
        let b = rt.source(2);

        let (f, x, y) = (flag.clone(), a.clone(), b.clone());
        let picked = rt.derived(move |get, _| {
            if get.get(&f)? {
                get.get(&x)
            } else {
                get.get(&y)
            }
        });
        let _sub = picked.subscribe(|_, _| {});
        driver.run_until_stalled();
        assert_eq!(picked.get().unwrap(), 1);
        assert_eq!(a.node.dependents().len(), 1);
        assert_eq!(b.node.dependents().len(), 0);

        flag.set(false);
        driver.run_until_stalled();
        assert_eq!(picked.get().unwrap(), 2);
        assert_eq!(a.node.dependents().len(), 0);
        assert_eq!(b.node.dependents().len(), 1);
    }

    #[test]
    fn escaped_getter_expires() {
        let (driver, rt) = setup();
        let x = rt.source(1);
        let escaped: Arc<Mutex<Option<Getter>>> = Arc::new(Mutex::new(None));

        let (input, slot) = (x.clone(), escaped.clone());
        let derived = rt.derived(move |get, _| {
            *slot.lock() = Some(get.clone());
            get.get(&input)
        });
        let _sub = derived.subscribe(|_, _| {});
        driver.run_until_stalled();

        let getter = escaped.lock().take().unwrap();
        assert!(!getter.is_current());
        assert!(matches!(getter.get(&x), Err(Interrupt::Expired)));
    }

    #[test]
    fn panicking_computation_fails_and_reports() {
        let (driver, rt) = setup();
        let reports = Arc::new(AtomicI32::new(0));
        let reports_clone = reports.clone();
        rt.on_error(move |_| {
            reports_clone.fetch_add(1, Ordering::SeqCst);
        });

        let broken = rt.derived(|_, _| -> Result<i32, Interrupt> { panic!("kaput") });
        let _sub = broken.subscribe(|_, _| {});
        driver.run_until_stalled();

        match broken.get() {
            Err(Interrupt::Failed(AtomError::Panicked(message))) => assert_eq!(&*message, "kaput"),
            other => panic!("expected a panic error, got {other:?}"),
        }
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dependency_errors_are_not_reported_twice() {
        let (driver, rt) = setup();
        let reports = Arc::new(AtomicI32::new(0));
        let reports_clone = reports.clone();
        rt.on_error(move |_| {
            reports_clone.fetch_add(1, Ordering::SeqCst);
        });

        let failing = rt.derived(|_, _| -> Result<i32, Interrupt> { Err(Interrupt::msg("no")) });
        let input = failing.clone();
        let reader = rt.derived(move |get, _| Ok(get.get(&input)? + 1));
        let _sub = reader.subscribe(|_, _| {});
        driver.run_until_stalled();

        assert!(matches!(reader.get(), Err(Interrupt::Failed(_))));
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recovery_to_the_stale_value_skips_watchers() {
        let (driver, rt) = setup();
        let x = rt.source(1i32);
        let input = x.clone();
        let sign = rt.derived(move |get, _| match get.get(&input)? {
            0 => Err(Interrupt::msg("zero")),
            value => Ok(value.signum()),
        });
        let (source, input) = (sign.clone(), x.clone());
        let scaled = rt.derived(move |get, _| {
            get.get(&input)?;
            Ok(get.get(&source)? * 10)
        });

        let watched = Arc::new(AtomicI32::new(0));
        let watched_clone = watched.clone();
        let _watch = sign.watch(move || {
            watched_clone.fetch_add(1, Ordering::SeqCst);
        });
        let _sub = scaled.subscribe(|_, _| {});
        driver.run_until_stalled();
        assert_eq!(scaled.get().unwrap(), 10);
        assert_eq!(watched.load(Ordering::SeqCst), 1);

        x.set(0);
        driver.run_until_stalled();
        assert!(scaled.state().is_failed());
        assert_eq!(watched.load(Ordering::SeqCst), 2);

        // Back to 1: watchers are not told, the failed reader still recovers.
        x.set(2);
        driver.run_until_stalled();
        assert_eq!(sign.get().unwrap(), 1);
        assert_eq!(scaled.get().unwrap(), 10);
        assert_eq!(watched.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn async_result_settles_through_a_flush() {
        let (driver, rt) = setup();
        let (tx, rx) = oneshot::channel::<i32>();
        let rx = Arc::new(Mutex::new(Some(rx)));

        let remote = rt.derived_async(move |_, _| {
            let rx = rx.lock().take();
            async move {
                match rx {
                    Some(rx) => rx.await.map_err(|_| Interrupt::msg("dropped")),
                    None => Err(Interrupt::msg("ran twice")),
                }
            }
        });
        let _sub = remote.subscribe(|_, _| {});
        driver.run_until_stalled();
        assert!(remote.state().is_pending());

        tx.send(42).unwrap();
        driver.run_until_stalled();
        assert_eq!(remote.get().unwrap(), 42);
    }

    #[test]
    fn async_computation_sees_cancellation() {
        let (driver, rt) = setup();
        let x = rt.source(0);
        let cancelled = Arc::new(AtomicI32::new(0));

        let (input, counter) = (x.clone(), cancelled.clone());
        let slow = rt.derived_async(move |get, ctx| {
            let counter = counter.clone();
            let token = ctx.token();
            let value = get.get(&input);
            async move {
                let value = value?;
                token.cancelled().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Interrupt>(value)
            }
        });
        let _sub = slow.subscribe(|_, _| {});
        driver.run_until_stalled();
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);

        x.set(1);
        driver.run_until_stalled();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(slow.state().is_pending());
    }
}
