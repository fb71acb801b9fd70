//! Update Scheduler
//!
//! The scheduler batches pending updates into a single deferred flush and
//! makes sure every node is processed after the nodes it depends on.
//!
//! # Algorithm
//!
//! Staging a write pushes the node onto the pending queue (once). The first
//! push after a flush asks the caller to schedule the next flush. The flush
//! itself runs in three steps:
//!
//! 1. Commit: each queued node moves its staged value, error or pending
//!    marker into its state and becomes a root of the mark phase.
//! 2. Mark: a depth-first walk through `dependents` from every root. Each
//!    node is visited at most once and pushed in post-order.
//! 3. Process: the list is walked in reverse, which is a topological order:
//!    every node comes after the marked nodes it reads from. A node flagged
//!    for execution runs its computation;
//!    a node whose result must be propagated notifies its observers and
//!    flags its dependents.
//!
//! Only one flush loop runs per scheduler. A flush requested while it runs,
//! from another thread or from an observer inside it, is picked up by the
//! running loop once the current batch is done.
//!
//! Nodes that were marked but never flagged simply unmark. This is what
//! keeps a diamond from recomputing its bottom node twice: it is reached once
//! in the process phase, after both sides have had their say.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::node::{AnyNode, Dependents};

#[derive(Default)]
struct Queue {
    /// Nodes with staged data, in staging order.
    pending: Vec<Arc<dyn AnyNode>>,

    /// Whether a flush has been scheduled and not yet taken.
    scheduled: bool,

    /// Whether a flush loop is running.
    flushing: bool,
}

/// The pending queue of one runtime.
///
/// At most one flush loop runs at a time. Batches queued while it runs,
/// from any thread, are processed by that loop before it returns.
#[derive(Default)]
pub(crate) struct UpdateScheduler {
    queue: Mutex<Queue>,
}

impl UpdateScheduler {
    /// Create an empty, idle scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a node for the next flush.
    ///
    /// Returns `true` when the caller must schedule a flush.
    pub fn enqueue(&self, node: Arc<dyn AnyNode>) -> bool {
        let mut queue = self.queue.lock();
        queue.pending.push(node);
        !std::mem::replace(&mut queue.scheduled, true)
    }

    /// Flush batches until the queue is empty.
    ///
    /// Returns `false` without doing anything when another loop is already
    /// running; that loop picks up everything queued so far.
    pub fn run(&self) -> bool {
        if std::mem::replace(&mut self.queue.lock().flushing, true) {
            trace!("flush already running");
            return false;
        }
        let running = Running(&self.queue);
        loop {
            let batch = {
                let mut queue = self.queue.lock();
                queue.scheduled = false;
                let batch = std::mem::take(&mut queue.pending);
                if batch.is_empty() {
                    queue.flushing = false;
                    std::mem::forget(running);
                    return true;
                }
                batch
            };
            flush(batch);
        }
    }

    /// Number of nodes waiting for the next flush.
    pub fn len(&self) -> usize {
        self.queue.lock().pending.len()
    }
}

/// Releases the flush loop if a flush unwinds.
struct Running<'a>(&'a Mutex<Queue>);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.lock().flushing = false;
    }
}

/// Run one flush over a batch taken from the scheduler.
fn flush(batch: Vec<Arc<dyn AnyNode>>) {
    if batch.is_empty() {
        return;
    }
    trace!(queued = batch.len(), "flush");

    let mut order = Vec::new();
    for node in batch {
        if node.commit() {
            mark(node, &mut order);
        } else {
            node.flags().clear_propagate();
        }
    }

    for node in order.into_iter().rev() {
        let flags = node.flags();
        flags.unmark();
        if flags.needs_execute() {
            flags.request_propagate();
            node.execute();
        }
        if flags.needs_propagate() {
            node.propagate();
        }
    }
}

/// Post-order depth-first walk through dependents.
fn mark(root: Arc<dyn AnyNode>, order: &mut Vec<Arc<dyn AnyNode>>) {
    if !root.flags().mark() {
        return;
    }

    let children = root.dependents();
    let mut stack: Vec<(Arc<dyn AnyNode>, Dependents, usize)> = vec![(root, children, 0)];

    loop {
        let next = match stack.last_mut() {
            Some((_, children, index)) => {
                let child = children.get(*index).cloned();
                *index += 1;
                child
            }
            None => break,
        };

        match next {
            Some(child) => {
                if child.flags().mark() {
                    let children = child.dependents();
                    stack.push((child, children, 0));
                }
            }
            None => {
                if let Some((node, _, _)) = stack.pop() {
                    order.push(node);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
