//! Dependency Graph
//!
//! This module holds the type-erased machinery that moves changes through
//! the atom graph: node identity and flags, the flush scheduler, and the
//! lifecycle collector.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are atoms: sources (settable leaves) or derived computations
//! - Edges are reads: if B reads A, A lists B among its dependents
//!
//! There is no central node table. Each node owns its edges: strong
//! references to the nodes it read during its last execution, and weak
//! references to the nodes that read it. Dropping the last handle to an
//! unobserved derived node therefore frees it, and the edges it held are
//! released with it.
//!
//! # Design Decisions
//!
//! 1. Dependencies are rebuilt on every execution. The old and new sets are
//!    diffed and edges no longer read are unlinked, so conditional reads
//!    never leave stale edges behind.
//!
//! 2. The graph stays acyclic because computations only read. Writing a
//!    source from inside a computation is rejected.
//!
//! 3. Scheduler and collector state belong to a runtime object instead of a
//!    process-wide singleton, so independent runtimes never interfere.

mod lifecycle;
mod node;
mod scheduler;

pub use node::{NodeId, NodeKind};

pub(crate) use lifecycle::Collector;
pub(crate) use node::{AnyNode, Dependents, Flags};
pub(crate) use scheduler::UpdateScheduler;
