//! Drivers
//!
//! The runtime never decides on its own when deferred work runs. It hands
//! three kinds of work to a [`Driver`]:
//!
//! - flushes, deferred to the next microtask (`defer`);
//! - garbage collection, deferred to the next macrotask tick after an
//!   optional delay (`defer_tick`);
//! - asynchronous computations (`spawn`).
//!
//! [`TokioDriver`] runs all three on a tokio runtime. [`ManualDriver`] queues
//! them and runs them only when asked, which makes tests deterministic.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::task::noop_waker_ref;
use parking_lot::Mutex;
use tokio::runtime::Handle;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Executor abstraction the runtime defers work to.
pub trait Driver: Send + Sync {
    /// Run `task` after the current synchronous work, before any tick.
    fn defer(&self, task: Task);

    /// Run `task` on a later tick, at least `delay` from now.
    fn defer_tick(&self, delay: Duration, task: Task);

    /// Drive `future` to completion.
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

/// Driver backed by a tokio runtime.
///
/// Works on current-thread and multi-threaded runtimes. Flushes never
/// overlap: a flush task that starts while another is running leaves its
/// batch to the running one.
#[derive(Clone, Debug)]
pub struct TokioDriver {
    handle: Handle,
}

impl TokioDriver {
    /// Create a driver that spawns on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a driver for the runtime this call runs in.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Driver for TokioDriver {
    fn defer(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }

    fn defer_tick(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            task();
        });
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.handle.spawn(future);
    }
}

#[derive(Default)]
struct Queues {
    microtasks: VecDeque<Task>,
    macrotasks: VecDeque<Task>,
    futures: Vec<BoxFuture<'static, ()>>,
}

/// Deterministic driver for tests and embedding.
///
/// Nothing runs until [`ManualDriver::run_until_stalled`] or
/// [`ManualDriver::advance`] is called. Futures are polled with a no-op
/// waker on every pass, so a future that depends on something outside the
/// driver (a channel, a timer) resolves on the first pass after that thing
/// is ready. Tick delays are ignored: one `advance` is one tick.
#[derive(Default)]
pub struct ManualDriver {
    queues: Mutex<Queues>,
}

impl ManualDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run microtasks and poll futures until neither makes progress.
    ///
    /// Returns the number of microtasks run and futures completed.
    pub fn run_until_stalled(&self) -> usize {
        let mut progress = 0;
        loop {
            let mut step = 0;

            loop {
                let task = self.queues.lock().microtasks.pop_front();
                let Some(task) = task else { break };
                task();
                step += 1;
            }

            let futures = std::mem::take(&mut self.queues.lock().futures);
            let mut cx = Context::from_waker(noop_waker_ref());
            let mut unfinished = Vec::with_capacity(futures.len());
            for mut future in futures {
                if Pin::new(&mut future).poll(&mut cx).is_ready() {
                    step += 1;
                } else {
                    unfinished.push(future);
                }
            }
            {
                // Keep futures spawned while polling after the older ones.
                let mut queues = self.queues.lock();
                let spawned = std::mem::replace(&mut queues.futures, unfinished);
                step += spawned.len();
                queues.futures.extend(spawned);
            }

            if step == 0 {
                return progress;
            }
            progress += step;
        }
    }

    /// Run one macrotask tick: drain microtasks, then run every macrotask
    /// queued so far, each followed by its microtasks.
    pub fn advance(&self) -> usize {
        let mut progress = self.run_until_stalled();
        let ticks = std::mem::take(&mut self.queues.lock().macrotasks);
        for task in ticks {
            task();
            progress += 1 + self.run_until_stalled();
        }
        progress
    }

    /// Whether no microtask or macrotask is queued.
    pub fn is_idle(&self) -> bool {
        let queues = self.queues.lock();
        queues.microtasks.is_empty() && queues.macrotasks.is_empty()
    }

    /// Number of futures that have not completed yet.
    pub fn pending_futures(&self) -> usize {
        self.queues.lock().futures.len()
    }
}

impl Driver for ManualDriver {
    fn defer(&self, task: Task) {
        self.queues.lock().microtasks.push_back(task);
    }

    fn defer_tick(&self, _delay: Duration, task: Task) {
        self.queues.lock().macrotasks.push_back(task);
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.queues.lock().futures.push(future);
    }
}
