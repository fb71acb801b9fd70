//! Scope Overlay
//!
//! A scope substitutes some atoms with overrides and presents a consistent
//! view of the rest of the graph: every derived atom seen through the scope
//! reads the overrides, transitively.
//!
//! # How It Works
//!
//! Resolving an atom through a scope tries, in order:
//!
//! 1. A shadow this scope already created for it.
//! 2. An override, in this scope or any parent. Value overrides are fresh
//!    sources; atom overrides resolve the replacement through the scope that
//!    declared them.
//! 3. For a derived atom, a new shadow: a derived atom with the same
//!    computation, equality and persist flag whose reads all go through this
//!    scope. Shadows are memoized weakly; the caller's handle keeps one
//!    alive.
//! 4. A source with no override is shared with the unscoped graph.
//!
//! Scopes never touch the atoms they wrap. A scope chain without any override
//! resolves every atom to itself.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::trace;

use super::atom::{Atom, Node, Source, Value};
use crate::graph::{NodeId, NodeKind};

type Entry = Box<dyn Any + Send + Sync>;

enum Override<T: Value> {
    /// A fresh source holding the override value.
    Value(Atom<T>),

    /// Another atom, resolved through the declaring scope.
    Atom(Atom<T>),
}

struct ScopeInner {
    parent: Option<Scope>,

    /// `Override<T>` per atom.
    overrides: DashMap<NodeId, Entry>,

    /// `Weak<Node<T>>` shadow per derived atom.
    shadows: DashMap<NodeId, Entry>,

    /// Whether this scope or any parent overrides anything.
    overriding: bool,
}

/// A view of the graph with some atoms substituted.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// A scope without overrides. Resolves every atom to itself.
    pub fn root() -> Self {
        ScopeBuilder::new(None).build()
    }

    /// Start building a scope nested in `parent`.
    pub fn builder(parent: Option<&Scope>) -> ScopeBuilder {
        ScopeBuilder::new(parent.cloned())
    }

    /// The parent scope, if any.
    pub fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    /// Resolve `atom` through this scope, creating a shadow if needed.
    pub fn atom<T: Value>(&self, atom: &Atom<T>) -> Atom<T> {
        if !self.inner.overriding {
            return atom.clone();
        }
        if let Some(found) = self.lookup(atom) {
            return found;
        }
        match atom.kind() {
            NodeKind::Source => atom.clone(),
            NodeKind::Derived => self.shadow(atom),
        }
    }

    /// Resolve a source through this scope.
    ///
    /// Returns `None` when the source was overridden with a derived atom.
    pub fn source<T: Value>(&self, source: &Source<T>) -> Option<Source<T>> {
        self.atom(source).as_source()
    }

    /// Strict lookup: this scope's shadow of `atom`, or the nearest override
    /// in the chain. Never creates a shadow for `atom` itself.
    pub fn lookup<T: Value>(&self, atom: &Atom<T>) -> Option<Atom<T>> {
        self.shadowed(atom).or_else(|| self.overridden(atom))
    }

    fn shadowed<T: Value>(&self, atom: &Atom<T>) -> Option<Atom<T>> {
        let entry = self.inner.shadows.get(&atom.id())?;
        let node = entry.downcast_ref::<Weak<Node<T>>>()?.upgrade()?;
        Some(Atom::from_node(node))
    }

    fn overridden<T: Value>(&self, atom: &Atom<T>) -> Option<Atom<T>> {
        let with = match self.inner.overrides.get(&atom.id()) {
            Some(entry) => match entry.downcast_ref::<Override<T>>()? {
                Override::Value(source) => return Some(source.clone()),
                Override::Atom(with) => with.clone(),
            },
            None => return self.inner.parent.as_ref()?.overridden(atom),
        };
        if with.id() == atom.id() {
            return Some(with);
        }
        Some(self.atom(&with))
    }

    fn shadow<T: Value>(&self, atom: &Atom<T>) -> Atom<T> {
        let Some(compute) = atom.node.compute.clone() else {
            return atom.clone();
        };

        let mut entry = self
            .inner
            .shadows
            .entry(atom.id())
            .or_insert_with(|| Box::new(Weak::<Node<T>>::new()));
        if let Some(node) = entry.downcast_ref::<Weak<Node<T>>>().and_then(Weak::upgrade) {
            return Atom::from_node(node);
        }

        let scope = self.clone();
        let shadow = atom
            .runtime()
            .derived_computed_with(atom.node.options(), move |get, context| {
                compute(get.with_scope(scope.clone()), context)
            });
        trace!(base = %atom.id(), shadow = %shadow.id(), "scoped shadow");
        *entry = Box::new(Arc::downgrade(&shadow.node));
        shadow
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("overrides", &self.inner.overrides.len())
            .field("shadows", &self.inner.shadows.len())
            .field("nested", &self.inner.parent.is_some())
            .finish()
    }
}

/// Builder for [`Scope`].
pub struct ScopeBuilder {
    parent: Option<Scope>,
    overrides: DashMap<NodeId, Entry>,
}

impl ScopeBuilder {
    fn new(parent: Option<Scope>) -> Self {
        Self {
            parent,
            overrides: DashMap::new(),
        }
    }

    /// Replace `atom` with a fresh source holding `value`. The source uses
    /// the atom's equality.
    pub fn value<T: Value>(self, atom: &Atom<T>, value: T) -> Self {
        let mut options = atom.node.options();
        options.persist = false;
        let source = Atom::from_node(Node::source(atom.runtime().clone(), value, options));
        self.overrides
            .insert(atom.id(), Box::new(Override::Value(source)));
        self
    }

    /// Replace `atom` with `with`, resolved through the new scope.
    pub fn atom<T: Value>(self, atom: &Atom<T>, with: &Atom<T>) -> Self {
        self.overrides
            .insert(atom.id(), Box::new(Override::Atom(with.clone())));
        self
    }

    pub fn build(self) -> Scope {
        let overriding = !self.overrides.is_empty()
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.inner.overriding);
        Scope {
            inner: Arc::new(ScopeInner {
                parent: self.parent,
                overrides: self.overrides,
                shadows: DashMap::new(),
                overriding,
            }),
        }
    }
}

impl fmt::Debug for ScopeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeBuilder")
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
