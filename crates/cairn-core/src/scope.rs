//! Host render scopes
//!
//! A [`RenderScope`] stands in for "a component is currently rendering".
//! Subscriptions and action listeners registered while a scope is current
//! are bound to it and removed when the scope is disposed, in addition to
//! any manual removal through their [`Unsubscribe`] token.

use crate::store::Unsubscribe;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tracing::trace;

struct ScopeInner {
    label: String,
    bindings: RefCell<Vec<Unsubscribe>>,
    disposed: Cell<bool>,
}

thread_local! {
    static SCOPES: RefCell<Vec<Rc<ScopeInner>>> = const { RefCell::new(Vec::new()) };
}

struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            scopes.borrow_mut().pop();
        });
    }
}

/// A host rendering scope
#[derive(Clone)]
pub struct RenderScope(Rc<ScopeInner>);

impl RenderScope {
    /// Create a scope
    pub fn new(label: impl Into<String>) -> Self {
        RenderScope(Rc::new(ScopeInner {
            label: label.into(),
            bindings: RefCell::new(Vec::new()),
            disposed: Cell::new(false),
        }))
    }

    /// Scope label
    pub fn label(&self) -> &str {
        &self.0.label
    }

    /// Run `f` with this scope current
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        SCOPES.with(|scopes| scopes.borrow_mut().push(self.0.clone()));
        let _guard = ScopeGuard;
        f()
    }

    /// Number of subscriptions bound to this scope
    pub fn binding_count(&self) -> usize {
        self.0.bindings.borrow().len()
    }

    /// Check if the scope has been disposed
    pub fn is_disposed(&self) -> bool {
        self.0.disposed.get()
    }

    /// End the scope, removing every bound subscription
    ///
    /// Returns how many were still registered.
    pub fn dispose(&self) -> usize {
        self.0.disposed.set(true);
        let bindings = std::mem::take(&mut *self.0.bindings.borrow_mut());
        let removed = bindings.iter().filter(|token| token.unsubscribe()).count();
        trace!(scope = %self.0.label, removed, "render scope disposed");
        removed
    }

    fn bind(&self, token: &Unsubscribe) {
        if self.is_disposed() {
            token.unsubscribe();
        } else {
            self.0.bindings.borrow_mut().push(token.clone());
        }
    }
}

impl fmt::Debug for RenderScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderScope")
            .field("label", &self.0.label)
            .field("bindings", &self.binding_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// The innermost scope currently running, if any
pub fn current_scope() -> Option<RenderScope> {
    SCOPES.with(|scopes| scopes.borrow().last().cloned().map(RenderScope))
}

pub(crate) fn bind_to_current(token: &Unsubscribe) {
    if let Some(scope) = current_scope() {
        scope.bind(token);
    }
}
