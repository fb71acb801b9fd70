//! Errors and Interrupts
//!
//! Two types travel through the graph:
//!
//! - [`AtomError`] is the error stored in a failed atom. It is cheap to clone
//!   because every reader of a failed atom receives the same error.
//!
//! - [`Interrupt`] is what a read returns when it cannot produce a value: the
//!   atom is pending, the atom failed, the computation raised a fresh error,
//!   or the execution that issued the read has been superseded.
//!
//! Any `std::error::Error` converts into [`Interrupt::Raised`], so user
//! computations can use `?` on their own fallible calls.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::graph::NodeId;
use crate::reactive::Pending;

/// An error stored in, or reported by, an atom.
#[derive(Debug, Clone, Error)]
pub enum AtomError {
    /// A computation returned an error.
    #[error(transparent)]
    Computation(Arc<dyn StdError + Send + Sync>),

    /// A computation failed with a plain message.
    #[error("{0}")]
    Message(Arc<str>),

    /// A computation or callback panicked.
    #[error("panicked: {0}")]
    Panicked(Arc<str>),

    /// A source was written while a computation was running.
    #[error("source {0} was written during a computation")]
    WriteDuringComputation(NodeId),

    /// An inactive atom was read without being activated.
    #[error("atom {0} is inactive")]
    Inactive(NodeId),
}

impl AtomError {
    /// Wrap an arbitrary error.
    ///
    /// An `AtomError` passed in is returned as is rather than wrapped again.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        if let Some(error) = (&error as &dyn Any).downcast_ref::<AtomError>() {
            return error.clone();
        }
        Self::Computation(Arc::new(error))
    }

    /// Create an error from a message.
    pub fn msg(message: impl Into<Arc<str>>) -> Self {
        Self::Message(message.into())
    }

    /// Convert a panic payload into an error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message: Arc<str> = if let Some(s) = payload.downcast_ref::<&str>() {
            Arc::from(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Arc::from(s.as_str())
        } else {
            Arc::from("unknown panic payload")
        };
        Self::Panicked(message)
    }

    /// Borrow the wrapped computation error as a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Computation(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// The reason a read did not produce a value.
#[derive(Clone)]
pub enum Interrupt {
    /// The atom is waiting on an asynchronous result.
    Pending(Pending),

    /// The atom holds an error that was already reported.
    Failed(AtomError),

    /// The running computation raised a new error. It is reported once and
    /// then stored.
    Raised(AtomError),

    /// The execution that issued the read was superseded.
    Expired,
}

impl Interrupt {
    /// Build a raised interrupt from a message.
    pub fn msg(message: impl Into<Arc<str>>) -> Self {
        Self::Raised(AtomError::msg(message))
    }

    /// The carried error, if any.
    pub fn error(&self) -> Option<&AtomError> {
        match self {
            Self::Failed(error) | Self::Raised(error) => Some(error),
            _ => None,
        }
    }

    /// The carried pending handle, if any.
    pub fn pending(&self) -> Option<&Pending> {
        match self {
            Self::Pending(pending) => Some(pending),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired)
    }
}

// `Interrupt` must not implement `Error`, or this overlaps `From<T> for T`.
impl<E> From<E> for Interrupt
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::Raised(AtomError::new(error))
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("Pending"),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
            Self::Raised(error) => f.debug_tuple("Raised").field(error).finish(),
            Self::Expired => f.write_str("Expired"),
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("atom is pending"),
            Self::Failed(error) | Self::Raised(error) => write!(f, "{error}"),
            Self::Expired => f.write_str("execution expired"),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn new_does_not_double_wrap() {
        let inner = AtomError::msg("boom");
        let wrapped = AtomError::new(inner);
        assert!(matches!(wrapped, AtomError::Message(ref m) if &**m == "boom"));
    }

    #[test]
    fn question_mark_raises() {
        fn read() -> Result<i32, DiskError> {
            Err(DiskError)
        }

        fn compute() -> Result<i32, Interrupt> {
            let value = read()?;
            Ok(value + 1)
        }

        let interrupt = compute().unwrap_err();
        let error = interrupt.error().unwrap();
        assert!(matches!(interrupt, Interrupt::Raised(_)));
        assert!(error.downcast_ref::<DiskError>().is_some());
        assert_eq!(interrupt.to_string(), "disk on fire");
    }

    #[test]
    fn panic_payloads_become_messages() {
        let error = AtomError::from_panic(Box::new("kaput"));
        assert_eq!(error.to_string(), "panicked: kaput");

        let error = AtomError::from_panic(Box::new(String::from("owned")));
        assert_eq!(error.to_string(), "panicked: owned");

        let error = AtomError::from_panic(Box::new(42_u8));
        assert_eq!(error.to_string(), "panicked: unknown panic payload");
    }

    #[test]
    fn expired_has_no_error() {
        assert!(Interrupt::Expired.error().is_none());
        assert!(Interrupt::Expired.is_expired());
        assert_eq!(format!("{:?}", Interrupt::Expired), "Expired");
    }
}
