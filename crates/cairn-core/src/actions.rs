//! Action dispatch with listener hooks
//!
//! Calling an action:
//! 1. re-enters the owning session, so nested `use_store` calls resolve
//!    against the right session
//! 2. runs every `on_action` listener in registration order; listeners may
//!    register `after` and `on_error` hooks for this call
//! 3. runs the action body with the call arguments
//! 4. for a pending (async) body, runs the hooks when the future settles
//! 5. for a synchronous failure, runs `on_error` hooks and returns the error
//!
//! The dispatcher never swallows an error.

use crate::error::{ActionError, Error, Result};
use crate::identity::SubscriptionId;
use crate::reactive::untracked;
use crate::store::Store;
use crate::value::Value;
use futures::future::{FutureExt, LocalBoxFuture};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::trace;

/// Result of an action body
pub type ActionResult = std::result::Result<Value, ActionError>;

/// Synchronous action body
pub type SyncActionFn = Rc<dyn Fn(&Store, &[Value]) -> ActionResult>;

/// Asynchronous action body
pub type AsyncActionFn = Rc<dyn Fn(&Store, Vec<Value>) -> LocalBoxFuture<'static, ActionResult>>;

/// An action body as stored in a definition
#[derive(Clone)]
pub enum ActionFn {
    /// Completes before returning
    Sync(SyncActionFn),
    /// Returns a future the caller drives
    Async(AsyncActionFn),
}

impl fmt::Debug for ActionFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionFn::Sync(_) => write!(f, "ActionFn::Sync"),
            ActionFn::Async(_) => write!(f, "ActionFn::Async"),
        }
    }
}

/// The value returned to the caller of an action
#[must_use = "async actions do nothing unless the pending result is awaited"]
pub enum ActionReturn {
    /// The body completed synchronously
    Ready(Value),
    /// The body is still running
    Pending(PendingAction),
}

impl ActionReturn {
    /// Check if the action is still running
    pub fn is_pending(&self) -> bool {
        matches!(self, ActionReturn::Pending(_))
    }

    /// The value of a synchronous action
    pub fn ready(self) -> Option<Value> {
        match self {
            ActionReturn::Ready(value) => Some(value),
            ActionReturn::Pending(_) => None,
        }
    }

    /// Wait for the action to settle
    pub async fn settle(self) -> ActionResult {
        match self {
            ActionReturn::Ready(value) => Ok(value),
            ActionReturn::Pending(pending) => pending.await,
        }
    }
}

impl fmt::Debug for ActionReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionReturn::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            ActionReturn::Pending(_) => write!(f, "Pending"),
        }
    }
}

/// A running asynchronous action
///
/// Resolves to the body's own result; listener hooks run just before.
/// The body does not start until this is polled.
#[must_use = "async actions do nothing unless the pending result is awaited"]
pub struct PendingAction {
    inner: LocalBoxFuture<'static, ActionResult>,
}

impl Future for PendingAction {
    type Output = ActionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

type AfterHook = Box<dyn FnOnce(&Value)>;
type ErrorHook = Box<dyn FnOnce(&ActionError)>;

/// What an action listener sees for one call
pub struct ActionContext {
    name: String,
    args: Vec<Value>,
    store: Store,
    after: RefCell<Vec<AfterHook>>,
    on_error: RefCell<Vec<ErrorHook>>,
}

impl ActionContext {
    fn new(name: &str, args: Vec<Value>, store: Store) -> Self {
        Self {
            name: name.to_string(),
            args,
            store,
            after: RefCell::new(Vec::new()),
            on_error: RefCell::new(Vec::new()),
        }
    }

    /// Name of the action being called
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments of the call
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// The store the action belongs to
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run `hook` with the action's value once it succeeds
    pub fn after(&self, hook: impl FnOnce(&Value) + 'static) {
        self.after.borrow_mut().push(Box::new(hook));
    }

    /// Run `hook` with the action's error if it fails
    pub fn on_error(&self, hook: impl FnOnce(&ActionError) + 'static) {
        self.on_error.borrow_mut().push(Box::new(hook));
    }

    fn into_hooks(self) -> (Vec<AfterHook>, Vec<ErrorHook>) {
        (self.after.into_inner(), self.on_error.into_inner())
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("store", &self.store.id())
            .finish()
    }
}

/// Listener invoked before every action call of a store
pub type ActionListener = Rc<dyn Fn(&ActionContext)>;

fn settle_hooks(result: &ActionResult, after: Vec<AfterHook>, on_error: Vec<ErrorHook>) {
    match result {
        Ok(value) => after.into_iter().for_each(|hook| hook(value)),
        Err(err) => on_error.into_iter().for_each(|hook| hook(err)),
    }
}

/// The actions of one store plus its listeners
pub struct ActionDispatcher {
    store_id: String,
    actions: IndexMap<String, ActionFn>,
    listeners: RefCell<Vec<(SubscriptionId, ActionListener)>>,
}

impl ActionDispatcher {
    /// Create a dispatcher for a store's actions
    pub fn new(store_id: &str, actions: IndexMap<String, ActionFn>) -> Self {
        Self {
            store_id: store_id.to_string(),
            actions,
            listeners: RefCell::new(Vec::new()),
        }
    }

    /// Check if an action exists
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Check if an action returns a future; false for unknown names
    pub fn is_async(&self, name: &str) -> bool {
        matches!(self.actions.get(name), Some(ActionFn::Async(_)))
    }

    /// Action names in definition order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    /// Register a listener
    pub fn add_listener(&self, listener: ActionListener) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.listeners.borrow_mut().push((id, listener));
        id
    }

    /// Remove a listener; returns false if it was already gone
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(listener, _)| *listener != id);
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Call an action on `store`
    pub fn dispatch(&self, store: &Store, name: &str, args: Vec<Value>) -> Result<ActionReturn> {
        let action = self
            .actions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ActionNotFound {
                store: self.store_id.clone(),
                name: name.to_string(),
            })?;

        let session = store.session();
        let _active = session.as_ref().map(|session| session.enter());
        trace!(store = %self.store_id, action = name, args = args.len(), "dispatching action");

        let context = ActionContext::new(name, args, store.clone());
        let listeners: Vec<ActionListener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        untracked(|| {
            for listener in listeners {
                listener(&context);
            }
        });
        let args = context.args.clone();
        let (after, on_error) = context.into_hooks();

        match action {
            ActionFn::Sync(body) => {
                let result = untracked(|| body(store, &args));
                settle_hooks(&result, after, on_error);
                match result {
                    Ok(value) => Ok(ActionReturn::Ready(value)),
                    Err(err) => Err(Error::Action(err)),
                }
            }
            ActionFn::Async(body) => {
                let future = untracked(|| body(store, args));
                let future = match session {
                    Some(session) => session.scope(future).boxed_local(),
                    None => future,
                };
                let inner = async move {
                    let result = future.await;
                    settle_hooks(&result, after, on_error);
                    result
                }
                .boxed_local();
                Ok(ActionReturn::Pending(PendingAction { inner }))
            }
        }
    }
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
