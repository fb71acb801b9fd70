//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects atoms. It owns the
//! pending queue, the garbage-collection queue and the error channel, and
//! hands deferred work to its [`Driver`].
//!
//! # How It Works
//!
//! 1. Atoms are created through the runtime and keep a handle to it.
//!
//! 2. When a source is written, the runtime queues it and asks the driver to
//!    run a flush on the next microtask. Writes issued before the flush runs
//!    are coalesced into it.
//!
//! 3. When a derived atom loses its last observer, the runtime queues it for
//!    collection and asks the driver for a macrotask tick.
//!
//! 4. Errors raised by computations and panics in callbacks are reported
//!    through the runtime: they are logged with `tracing` and forwarded to
//!    the hook installed with [`Runtime::on_error`].
//!
//! # Thread Safety
//!
//! The runtime is an `Arc` around its queues; clones share them. Deferred
//! tasks hold a weak reference, so a dropped runtime simply stops flushing.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tracing::{error, trace};

use super::atom::{Atom, AtomOptions, Node, Source, Value};
use super::driver::Driver;
use super::executor::{Computed, Getter, RunContext};
use crate::error::{AtomError, Interrupt};
use crate::graph::{AnyNode, Collector, UpdateScheduler};

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long an unobserved derived atom survives before it is collected.
    /// Zero means the next macrotask tick.
    pub gc_delay: Duration,

    /// Whether writing a source from inside a computation is rejected.
    pub reject_nested_writes: bool,
}

impl RuntimeConfig {
    pub fn with_gc_delay(mut self, delay: Duration) -> Self {
        self.gc_delay = delay;
        self
    }

    pub fn with_reject_nested_writes(mut self, reject: bool) -> Self {
        self.reject_nested_writes = reject;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc_delay: Duration::ZERO,
            reject_nested_writes: true,
        }
    }
}

type ErrorHook = Arc<dyn Fn(&AtomError) + Send + Sync>;

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    driver: Arc<dyn Driver>,
    scheduler: UpdateScheduler,
    collector: Collector,
    error_hook: RwLock<Option<ErrorHook>>,
}

/// Handle to an atom runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self::with_config(driver, RuntimeConfig::default())
    }

    /// Create a runtime with `config`.
    pub fn with_config(driver: Arc<dyn Driver>, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                driver,
                scheduler: UpdateScheduler::new(),
                collector: Collector::new(),
                error_hook: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // Atom construction
    // ------------------------------------------------------------------------

    /// Create a source compared with `==`.
    pub fn source<T>(&self, value: T) -> Source<T>
    where
        T: Value + PartialEq,
    {
        self.source_with(value, AtomOptions::default())
    }

    /// Create a source with explicit options.
    pub fn source_with<T: Value>(&self, value: T, options: AtomOptions<T>) -> Source<T> {
        Source::from_node(Node::source(self.clone(), value, options))
    }

    /// Create a synchronous derived atom compared with `==`.
    pub fn derived<T, F>(&self, compute: F) -> Atom<T>
    where
        T: Value + PartialEq,
        F: Fn(&Getter, &RunContext) -> Result<T, Interrupt> + Send + Sync + 'static,
    {
        self.derived_with(AtomOptions::default(), compute)
    }

    /// Create a synchronous derived atom with explicit options.
    pub fn derived_with<T, F>(&self, options: AtomOptions<T>, compute: F) -> Atom<T>
    where
        T: Value,
        F: Fn(&Getter, &RunContext) -> Result<T, Interrupt> + Send + Sync + 'static,
    {
        self.derived_computed_with(options, move |get, context| {
            Computed::Ready(compute(&get, &context))
        })
    }

    /// Create an asynchronous derived atom compared with `==`.
    ///
    /// Reads made before the future is returned and reads made while it is
    /// polled are both tracked.
    pub fn derived_async<T, F, Fut>(&self, compute: F) -> Atom<T>
    where
        T: Value + PartialEq,
        F: Fn(Getter, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Interrupt>> + Send + 'static,
    {
        self.derived_async_with(AtomOptions::default(), compute)
    }

    /// Create an asynchronous derived atom with explicit options.
    pub fn derived_async_with<T, F, Fut>(&self, options: AtomOptions<T>, compute: F) -> Atom<T>
    where
        T: Value,
        F: Fn(Getter, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Interrupt>> + Send + 'static,
    {
        self.derived_computed_with(options, move |get, context| {
            Computed::Future(compute(get, context).boxed())
        })
    }

    /// Create a derived atom whose computation decides per execution whether
    /// it finishes synchronously.
    pub fn derived_computed_with<T, F>(&self, options: AtomOptions<T>, compute: F) -> Atom<T>
    where
        T: Value,
        F: Fn(Getter, RunContext) -> Computed<T> + Send + Sync + 'static,
    {
        Atom::from_node(Node::derived(self.clone(), Arc::new(compute), options))
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// Install the hook that receives every reported error.
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&AtomError) + Send + Sync + 'static,
    {
        *self.inner.error_hook.write() = Some(Arc::new(hook));
    }

    /// Run the pending flush now instead of waiting for the driver.
    ///
    /// When a flush is already running, on this thread or another, this
    /// returns right away and the running flush commits the pending writes.
    pub fn flush(&self) {
        self.inner.scheduler.run();
    }

    /// Collect unobserved atoms now instead of waiting for the driver.
    ///
    /// Returns the number of atoms deactivated.
    pub fn collect_garbage(&self) -> usize {
        self.inner.collector.collect()
    }

    /// Number of atoms waiting for the next flush.
    pub fn pending_updates(&self) -> usize {
        self.inner.scheduler.len()
    }

    // ------------------------------------------------------------------------
    // Internal requests
    // ------------------------------------------------------------------------

    /// Queue `node` for propagation in the next flush.
    pub(crate) fn request_propagate(&self, node: Arc<dyn AnyNode>) {
        if !node.flags().request_propagate() {
            return;
        }
        if self.inner.scheduler.enqueue(node) {
            let runtime = Arc::downgrade(&self.inner);
            self.inner.driver.defer(Box::new(move || {
                if let Some(runtime) = upgrade(&runtime) {
                    runtime.flush();
                }
            }));
        }
    }

    /// Flag `node` for execution.
    ///
    /// A node already marked by the running flush is picked up by it;
    /// anything else is queued for the next one.
    pub(crate) fn request_activate(&self, node: Arc<dyn AnyNode>) {
        if node.flags().request_execute() && !node.flags().is_marked() {
            self.request_propagate(node);
        }
    }

    /// Queue `node` for collection if nothing observes it.
    pub(crate) fn request_deactivate(&self, node: Arc<dyn AnyNode>) {
        if !node.is_collectable() {
            return;
        }
        trace!(node = %node.id(), "gc candidate");
        if self.inner.collector.request(node) {
            let runtime = Arc::downgrade(&self.inner);
            self.inner.driver.defer_tick(
                self.inner.config.gc_delay,
                Box::new(move || {
                    if let Some(runtime) = upgrade(&runtime) {
                        runtime.collect_garbage();
                    }
                }),
            );
        }
    }

    /// Report an error on the runtime's error channel.
    pub(crate) fn report(&self, error: &AtomError) {
        error!(%error, "atom error");
        let hook = self.inner.error_hook.read().clone();
        if let Some(hook) = hook {
            hook(error);
        }
    }

    /// Drive `future` on the driver.
    pub(crate) fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.inner.driver.spawn(future);
    }
}

fn upgrade(inner: &Weak<RuntimeInner>) -> Option<Runtime> {
    inner.upgrade().map(|inner| Runtime { inner })
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("pending_updates", &self.pending_updates())
            .field("gc_candidates", &self.inner.collector.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ManualDriver;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn setup() -> (Arc<ManualDriver>, Runtime) {
        let driver = Arc::new(ManualDriver::new());
        let runtime = Runtime::new(driver.clone());
        (driver, runtime)
    }

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.gc_delay, Duration::ZERO);
        assert!(config.reject_nested_writes);

        let config = config
            .with_gc_delay(Duration::from_millis(50))
            .with_reject_nested_writes(false);
        assert_eq!(config.gc_delay, Duration::from_millis(50));
        assert!(!config.reject_nested_writes);
    }

    #[test]
    fn writes_schedule_one_flush() {
        let (driver, rt) = setup();
        let a = rt.source(0);
        let b = rt.source(0);

        a.set(1);
        b.set(1);
        a.set(2);
        assert_eq!(rt.pending_updates(), 2);

        assert!(!driver.is_idle());
        driver.run_until_stalled();
        assert_eq!(rt.pending_updates(), 0);
        assert_eq!(a.get().unwrap(), 2);
        assert_eq!(b.get().unwrap(), 1);
    }

    #[test]
    fn manual_flush_commits_immediately() {
        let (_driver, rt) = setup();
        let a = rt.source(0);

        a.set(3);
        rt.flush();
        assert_eq!(a.get().unwrap(), 3);
    }

    #[test]
    fn writes_during_a_flush_join_the_running_loop() {
        let (driver, rt) = setup();
        let a = rt.source(0);
        let b = rt.source(0);
        let writer = b.clone();
        let _sub = a.subscribe(move |value, _| writer.set(*value * 2));
        driver.run_until_stalled();

        a.set(3);
        rt.flush();

        assert_eq!(b.get().unwrap(), 6);
        assert_eq!(rt.pending_updates(), 0);
    }

    #[test]
    fn report_reaches_hook() {
        let (_driver, rt) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        rt.on_error(move |error| seen_clone.lock().push(error.to_string()));

        rt.report(&AtomError::msg("first"));
        rt.report(&AtomError::msg("second"));

        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn nested_writes_are_rejected() {
        let (driver, rt) = setup();
        let reports = Arc::new(AtomicI32::new(0));
        let reports_clone = reports.clone();
        rt.on_error(move |error| {
            assert!(matches!(error, AtomError::WriteDuringComputation(_)));
            reports_clone.fetch_add(1, Ordering::SeqCst);
        });

        let target = rt.source(0);
        let writer = target.clone();
        let sneaky = rt.derived(move |_, _| {
            writer.set(99);
            Ok(1)
        });

        assert_eq!(sneaky.get().unwrap(), 1);
        driver.run_until_stalled();
        assert_eq!(target.get().unwrap(), 0);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_writes_can_be_allowed() {
        let driver = Arc::new(ManualDriver::new());
        let rt = Runtime::with_config(
            driver.clone(),
            RuntimeConfig::default().with_reject_nested_writes(false),
        );

        let target = rt.source(0);
        let writer = target.clone();
        let sneaky = rt.derived(move |_, _| {
            writer.set(99);
            Ok(1)
        });

        assert_eq!(sneaky.get().unwrap(), 1);
        driver.run_until_stalled();
        assert_eq!(target.get().unwrap(), 99);
    }

    #[test]
    fn queued_writes_outlive_their_handles() {
        let driver = Arc::new(ManualDriver::new());
        let seen = Arc::new(AtomicI32::new(0));
        {
            let rt = Runtime::new(driver.clone());
            let a = rt.source(0);
            let seen_clone = seen.clone();
            a.watch(move || {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            })
            .detach();
            a.set(1);
        }

        assert!(driver.run_until_stalled() > 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(driver.is_idle());
    }
}
