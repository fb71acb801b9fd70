//! Atomflow Core
//!
//! This crate provides the core runtime of Atomflow, a fine-grained
//! incremental computation engine. It implements:
//!
//! - Source and derived atoms with automatic dependency tracking
//! - Batched propagation that recomputes each affected atom once per flush
//! - Asynchronous computations with generations and cancellation tokens
//! - Deferred garbage collection of unobserved atoms
//! - Scopes that overlay the graph with substituted atoms
//!
//! # Architecture
//!
//! - `graph`: type-erased node machinery, the flush scheduler and the
//!   lifecycle collector
//! - `reactive`: atom handles, the executor, the runtime and its drivers
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use atomflow_core::reactive::{ManualDriver, Runtime};
//!
//! let driver = Arc::new(ManualDriver::new());
//! let rt = Runtime::new(driver.clone());
//!
//! // Create a source
//! let x = rt.source(0);
//!
//! // Create a derived atom
//! let input = x.clone();
//! let y = rt.derived(move |get, _| Ok(get.get(&input)? + 1));
//! assert_eq!(y.get().unwrap(), 1);
//!
//! // Writes become visible at the next flush
//! x.set(10);
//! driver.run_until_stalled();
//! assert_eq!(y.get().unwrap(), 11);
//! ```

pub mod graph;
pub mod reactive;

mod error;

pub use error::{AtomError, Interrupt};
pub use graph::{NodeId, NodeKind};
pub use reactive::{Atom, AtomOptions, AtomState, Runtime, RuntimeConfig, Scope, Source};
