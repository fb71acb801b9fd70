//! Aggregation
//!
//! An aggregate atom reads several dependencies independently instead of
//! stopping at the first one that is not ready.
//!
//! # How It Works
//!
//! The computation receives an [`AllGetter`]. Each read returns `Some` for a
//! clean value and `None` otherwise, recording why. Once the computation
//! returns:
//!
//! 1. if any dependency failed, the atom fails with the first error;
//! 2. otherwise, if any dependency is pending, the atom waits for all of them
//!    at once;
//! 3. otherwise the computation's result is the atom's value.

use std::cell::RefCell;

use super::atom::{Atom, AtomOptions, AtomState, Value};
use super::executor::{Getter, RunContext};
use super::pending::Pending;
use super::runtime::Runtime;
use crate::error::{AtomError, Interrupt};

#[derive(Default)]
struct Outcome {
    error: Option<AtomError>,
    pending: Vec<Pending>,
    expired: bool,
}

/// Read handle passed to aggregate computations.
pub struct AllGetter<'a> {
    get: &'a Getter,
    outcome: RefCell<Outcome>,
}

impl<'a> AllGetter<'a> {
    fn new(get: &'a Getter) -> Self {
        Self {
            get,
            outcome: RefCell::default(),
        }
    }

    /// Read `atom`. `None` when it is pending, failed or unreachable.
    pub fn get<U: Value>(&self, atom: &Atom<U>) -> Option<U> {
        let state = match self.get.state(atom) {
            Ok(state) => state,
            Err(_) => {
                self.outcome.borrow_mut().expired = true;
                return None;
            }
        };

        let mut outcome = self.outcome.borrow_mut();
        match state {
            AtomState::Ready(value) => return Some(value),
            AtomState::Pending { pending, .. } => outcome.pending.push(pending),
            AtomState::Failed { error, .. } => {
                outcome.error.get_or_insert(error);
            }
            AtomState::Inactive => {
                outcome.error.get_or_insert(AtomError::Inactive(atom.id()));
            }
        }
        None
    }

    /// Whether every read so far returned a value.
    pub fn is_complete(&self) -> bool {
        let outcome = self.outcome.borrow();
        outcome.error.is_none() && outcome.pending.is_empty() && !outcome.expired
    }

    fn finish<T>(self, result: Option<T>) -> Result<T, Interrupt> {
        let outcome = self.outcome.into_inner();
        if let Some(error) = outcome.error {
            return Err(Interrupt::Failed(error));
        }
        if !outcome.pending.is_empty() {
            return Err(Interrupt::Pending(Pending::all(outcome.pending)));
        }
        if outcome.expired {
            return Err(Interrupt::Expired);
        }
        result.ok_or_else(|| Interrupt::msg("aggregate computation returned no value"))
    }
}

impl Runtime {
    /// Create an aggregate atom compared with `==`.
    pub fn all<T, F>(&self, compute: F) -> Atom<T>
    where
        T: Value + PartialEq,
        F: Fn(&AllGetter<'_>, &RunContext) -> Option<T> + Send + Sync + 'static,
    {
        self.all_with(AtomOptions::default(), compute)
    }

    /// Create an aggregate atom with explicit options.
    pub fn all_with<T, F>(&self, options: AtomOptions<T>, compute: F) -> Atom<T>
    where
        T: Value,
        F: Fn(&AllGetter<'_>, &RunContext) -> Option<T> + Send + Sync + 'static,
    {
        self.derived_with(options, move |get, context| {
            let all = AllGetter::new(get);
            let result = compute(&all, context);
            all.finish(result)
        })
    }

    /// Create an atom holding the values of `atoms`, in order.
    pub fn collect<T>(&self, atoms: Vec<Atom<T>>) -> Atom<Vec<T>>
    where
        T: Value + PartialEq,
    {
        self.all(move |all, _| {
            // Read every atom so all pending ones are awaited together.
            let values: Vec<Option<T>> = atoms.iter().map(|atom| all.get(atom)).collect();
            values.into_iter().collect()
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ManualDriver;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn setup() -> (Arc<ManualDriver>, Runtime) {
        let driver = Arc::new(ManualDriver::new());
        let runtime = Runtime::new(driver.clone());
        (driver, runtime)
    }

    fn remote(rt: &Runtime) -> (oneshot::Sender<i32>, Atom<i32>) {
        let (tx, rx) = oneshot::channel::<i32>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let atom = rt.derived_async(move |_, _| {
            let rx = rx.lock().take();
            async move {
                match rx {
                    Some(rx) => rx.await.map_err(|_| Interrupt::msg("dropped")),
                    None => Err(Interrupt::msg("ran twice")),
                }
            }
        });
        (tx, atom)
    }

    #[test]
    fn collects_ready_values() {
        let (_driver, rt) = setup();
        let a = rt.source(1);
        let b = rt.source(2);
        let both = rt.collect(vec![a.as_atom().clone(), b.as_atom().clone()]);

        assert_eq!(both.get().unwrap(), vec![1, 2]);
    }

    #[test]
    fn waits_for_every_pending_dependency() {
        let (driver, rt) = setup();
        let (tx_a, a) = remote(&rt);
        let (tx_b, b) = remote(&rt);
        let sum = rt.all(move |all, _| {
            let x = all.get(&a);
            let y = all.get(&b);
            Some(x? + y?)
        });
        let _sub = sum.subscribe(|_, _| {});
        driver.run_until_stalled();
        assert!(sum.state().is_pending());

        tx_a.send(1).unwrap();
        driver.run_until_stalled();
        assert!(sum.state().is_pending());

        tx_b.send(2).unwrap();
        driver.run_until_stalled();
        assert_eq!(sum.get().unwrap(), 3);
    }

    #[test]
    fn first_error_wins_over_pending() {
        let (driver, rt) = setup();
        let (_tx, slow) = remote(&rt);
        let broken = rt.derived(|_, _| -> Result<i32, Interrupt> { Err(Interrupt::msg("first")) });
        let also_broken =
            rt.derived(|_, _| -> Result<i32, Interrupt> { Err(Interrupt::msg("second")) });
        let combined = rt.collect(vec![slow, broken, also_broken]);
        let _sub = combined.subscribe(|_, _| {});
        driver.run_until_stalled();

        match combined.get() {
            Err(Interrupt::Failed(error)) => assert_eq!(error.to_string(), "first"),
            other => panic!("expected the first error, got {other:?}"),
        }
    }

    #[test]
    fn missing_result_is_an_error() {
        let (_driver, rt) = setup();
        let a = rt.source(1);
        let nothing = rt.all(move |all, _| {
            all.get(&a)?;
            None::<i32>
        });

        match nothing.get() {
            Err(Interrupt::Failed(error)) => {
                assert_eq!(error.to_string(), "aggregate computation returned no value")
            }
            other => panic!("expected a failure, got {other:?}"),
        }
    }
}
