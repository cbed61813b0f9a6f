//! Store definitions and store instances
//!
//! A [`StoreDefinition`] is the immutable description written once by the
//! application: an id, a state factory, getters and actions. A [`Store`] is
//! the live instance of a definition inside one session; there is at most
//! one per `(session, id)`.
//!
//! # Example
//!
//! ```
//! use cairn_core::{define_store, open_session, value_map, Value};
//!
//! let counter = define_store("counter")
//!     .state(|| value_map! { "n" => 0 })
//!     .getter("doubled", |store| {
//!         Ok(Value::Int(store.get("n").as_int().unwrap_or(0) * 2))
//!     })
//!     .action("increment", |store, _args| {
//!         let n = store.get("n").as_int().unwrap_or(0);
//!         store.set("n", n + 1)?;
//!         Ok(Value::Null)
//!     })
//!     .build();
//!
//! let session = open_session();
//! let store = counter.use_store_in(&session).unwrap();
//! store.call("increment", vec![]).unwrap();
//! assert_eq!(store.getter("doubled").unwrap(), Value::Int(2));
//! ```

use crate::actions::{
    ActionContext, ActionDispatcher, ActionFn, ActionResult, ActionReturn, AsyncActionFn,
    SyncActionFn,
};
use crate::error::{ActionError, Error, Result};
use crate::getters::{GetterCache, GetterFn};
use crate::identity::{StoreId, SubscriptionId};
use crate::plugin::Extension;
use crate::scope;
use crate::session::{require_active_session, Session, WeakSession};
use crate::state::{Mutation, StateContainer};
use crate::value::{StatePath, Value, ValueMap};
use futures::future::FutureExt;
use indexmap::IndexMap;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Produces the initial state of a store
pub type StateFactory = Rc<dyn Fn() -> ValueMap>;

struct DefinitionInner {
    id: StoreId,
    state: StateFactory,
    getters: IndexMap<String, GetterFn>,
    actions: IndexMap<String, ActionFn>,
}

/// Immutable description of a store
///
/// Cheap to clone; clones share the same definition.
#[derive(Clone)]
pub struct StoreDefinition(Rc<DefinitionInner>);

impl StoreDefinition {
    /// The store id
    pub fn id(&self) -> &StoreId {
        &self.0.id
    }

    /// Build a fresh initial state from the factory
    pub fn initial_state(&self) -> ValueMap {
        (self.0.state)()
    }

    /// Getter names in definition order
    pub fn getter_names(&self) -> impl Iterator<Item = &str> {
        self.0.getters.keys().map(String::as_str)
    }

    /// Action names in definition order
    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.0.actions.keys().map(String::as_str)
    }

    /// Check if two handles share the same definition
    pub fn ptr_eq(&self, other: &StoreDefinition) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Get (or create) this store in the active session
    pub fn use_store(&self) -> Result<Store> {
        let session = require_active_session()?;
        self.use_store_in(&session)
    }

    /// Get (or create) this store in `session`, making it the active session
    pub fn use_store_in(&self, session: &Session) -> Result<Store> {
        crate::session::set_active_session(session);
        session.use_store(self)
    }
}

impl fmt::Debug for StoreDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreDefinition")
            .field("id", &self.0.id)
            .field("getters", &self.0.getters.keys().collect::<Vec<_>>())
            .field("actions", &self.0.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Start defining a store
pub fn define_store(id: impl Into<StoreId>) -> StoreBuilder {
    StoreBuilder {
        id: id.into(),
        state: None,
        getters: IndexMap::new(),
        actions: IndexMap::new(),
    }
}

/// Builder returned by [`define_store`]
pub struct StoreBuilder {
    id: StoreId,
    state: Option<StateFactory>,
    getters: IndexMap<String, GetterFn>,
    actions: IndexMap<String, ActionFn>,
}

impl StoreBuilder {
    /// Set the state factory (defaults to an empty tree)
    pub fn state(mut self, factory: impl Fn() -> ValueMap + 'static) -> Self {
        self.state = Some(Rc::new(factory));
        self
    }

    /// Add a getter
    pub fn getter(
        mut self,
        name: impl Into<String>,
        getter: impl Fn(&Store) -> Result<Value> + 'static,
    ) -> Self {
        self.getters.insert(name.into(), Rc::new(getter));
        self
    }

    /// Add a synchronous action
    pub fn action(
        mut self,
        name: impl Into<String>,
        action: impl Fn(&Store, &[Value]) -> ActionResult + 'static,
    ) -> Self {
        let body: SyncActionFn = Rc::new(action);
        self.actions.insert(name.into(), ActionFn::Sync(body));
        self
    }

    /// Add an asynchronous action
    pub fn async_action<F, Fut>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(Store, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = ActionResult> + 'static,
    {
        let body: AsyncActionFn = Rc::new(move |store: &Store, args: Vec<Value>| {
            action(store.clone(), args).boxed_local()
        });
        self.actions.insert(name.into(), ActionFn::Async(body));
        self
    }

    /// Finish the definition
    pub fn build(self) -> StoreDefinition {
        StoreDefinition(Rc::new(DefinitionInner {
            id: self.id,
            state: self.state.unwrap_or_else(|| Rc::new(ValueMap::new)),
            getters: self.getters,
            actions: self.actions,
        }))
    }
}

// ============================================================================
// Store instances
// ============================================================================

pub(crate) struct StoreInner {
    id: StoreId,
    session: WeakSession,
    definition: StoreDefinition,
    state: StateContainer,
    getters: GetterCache,
    actions: ActionDispatcher,
    extension: RefCell<Extension>,
}

/// A live store inside one session
///
/// Cheap to clone; clones are the same instance.
#[derive(Clone)]
pub struct Store(Rc<StoreInner>);

impl Store {
    pub(crate) fn new(session: &Session, definition: StoreDefinition, initial: ValueMap) -> Self {
        let id = definition.id().clone();
        let inner = Rc::new_cyclic(|weak: &Weak<StoreInner>| StoreInner {
            state: StateContainer::new(id.clone(), initial),
            getters: GetterCache::new(id.as_str(), weak, &definition.0.getters),
            actions: ActionDispatcher::new(id.as_str(), definition.0.actions.clone()),
            extension: RefCell::new(Extension::new()),
            session: session.downgrade(),
            definition,
            id,
        });
        debug!(store = %inner.id, session = %session.id(), "store created");
        Store(inner)
    }

    pub(crate) fn from_inner(inner: Rc<StoreInner>) -> Self {
        Store(inner)
    }

    /// The store id
    pub fn id(&self) -> &StoreId {
        &self.0.id
    }

    /// The definition this store was built from
    pub fn definition(&self) -> &StoreDefinition {
        &self.0.definition
    }

    /// The owning session, if it is still alive
    pub fn session(&self) -> Option<Session> {
        self.0.session.upgrade()
    }

    /// Check if two handles are the same instance
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// Snapshot of the whole state tree (tracked as a read of everything)
    pub fn state(&self) -> ValueMap {
        self.0.state.snapshot()
    }

    /// Replace the whole state tree; subscribers see one mutation
    pub fn set_state(&self, state: ValueMap) {
        self.0.state.replace(state);
    }

    /// Read the value at a dotted path (`Null` when absent)
    pub fn get(&self, path: &str) -> Value {
        self.0.state.get(&StatePath::parse(path))
    }

    /// Write the value at a dotted path
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        self.0.state.set(&StatePath::parse(path), value.into())
    }

    /// Read-modify-write the value at a dotted path
    pub fn update(&self, path: &str, f: impl FnOnce(&Value) -> Value) -> Result<()> {
        let path = StatePath::parse(path);
        let current = crate::reactive::untracked(|| self.0.state.get(&path));
        self.0.state.set(&path, f(&current))
    }

    /// Deep-merge a partial state; one `PatchObject` mutation
    pub fn patch(&self, patch: ValueMap) {
        self.0.state.patch(patch);
    }

    /// Mutate the state through a function; one `PatchFunction` mutation
    pub fn patch_with(&self, mutator: impl FnOnce(&mut ValueMap)) {
        self.0.state.patch_with(mutator);
    }

    /// Restore the state from the factory and drop every subscription
    ///
    /// Getters, actions, action listeners and plugin extensions are kept.
    pub fn reset(&self) {
        debug!(store = %self.0.id, "store reset");
        self.0.state.reset(self.0.definition.initial_state());
    }

    /// Subscribe to state changes
    ///
    /// When called inside a [`RenderScope`](crate::RenderScope) the
    /// subscription is also removed when that scope is disposed.
    pub fn subscribe(&self, callback: impl Fn(&Mutation, &ValueMap) + 'static) -> Unsubscribe {
        let token = self.subscribe_detached(callback);
        scope::bind_to_current(&token);
        token
    }

    /// Subscribe to state changes, ignoring any render scope
    pub fn subscribe_detached(
        &self,
        callback: impl Fn(&Mutation, &ValueMap) + 'static,
    ) -> Unsubscribe {
        let id = self.0.state.subscribe(Rc::new(callback));
        Unsubscribe::new(&self.0, id, ListenerKind::State)
    }

    /// Number of state subscribers
    pub fn subscriber_count(&self) -> usize {
        self.0.state.subscriber_count()
    }

    // ------------------------------------------------------------------------
    // Getters and actions
    // ------------------------------------------------------------------------

    /// Read a getter
    pub fn getter(&self, name: &str) -> Result<Value> {
        self.0.getters.get(name)
    }

    /// Check if the store has a getter
    pub fn has_getter(&self, name: &str) -> bool {
        self.0.getters.contains(name)
    }

    /// How many times a getter has been evaluated
    pub fn getter_compute_count(&self, name: &str) -> Option<u64> {
        self.0.getters.compute_count(name)
    }

    /// Call an action
    ///
    /// Listeners run before this returns. A synchronous body also completes
    /// before this returns, but an async body only runs once the returned
    /// [`ActionReturn::Pending`] is awaited or polled; dropping it skips the
    /// body and its `after`/`on_error` hooks.
    pub fn dispatch(&self, name: &str, args: Vec<Value>) -> Result<ActionReturn> {
        self.0.actions.dispatch(self, name, args)
    }

    /// Call a synchronous action and return its value
    ///
    /// Async actions are refused before any listener runs; use
    /// [`Store::dispatch`] or [`Store::dispatch_settled`] for those.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        if self.0.actions.is_async(name) {
            return Err(Error::InvalidOperation(format!(
                "action `{name}` of store `{}` is async and must be awaited",
                self.id()
            )));
        }
        match self.dispatch(name, args)? {
            ActionReturn::Ready(value) => Ok(value),
            ActionReturn::Pending(_) => Err(Error::InvalidOperation(format!(
                "action `{name}` did not complete synchronously"
            ))),
        }
    }

    /// Call an action and wait for it to settle
    pub async fn dispatch_settled(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, ActionError> {
        self.dispatch(name, args)?.settle().await
    }

    /// Check if the store has an action
    pub fn has_action(&self, name: &str) -> bool {
        self.0.actions.contains(name)
    }

    /// Listen to every action call of this store
    pub fn on_action(&self, listener: impl Fn(&ActionContext) + 'static) -> Unsubscribe {
        let token = self.on_action_detached(listener);
        scope::bind_to_current(&token);
        token
    }

    /// Listen to action calls, ignoring any render scope
    pub fn on_action_detached(&self, listener: impl Fn(&ActionContext) + 'static) -> Unsubscribe {
        let id = self.0.actions.add_listener(Rc::new(listener));
        Unsubscribe::new(&self.0, id, ListenerKind::Action)
    }

    // ------------------------------------------------------------------------
    // Plugin extensions
    // ------------------------------------------------------------------------

    /// A property contributed by a plugin
    pub fn property(&self, name: &str) -> Option<Value> {
        self.0.extension.borrow().property(name).cloned()
    }

    /// A typed capability contributed by a plugin
    pub fn capability<T: Any>(&self) -> Option<Rc<T>> {
        self.0.extension.borrow().capability::<T>()
    }

    /// Names of every plugin-contributed property
    pub fn property_names(&self) -> Vec<String> {
        self.0.extension.borrow().property_names().map(str::to_string).collect()
    }

    pub(crate) fn apply_extension(&self, extension: Extension) {
        self.0.extension.borrow_mut().merge(extension);
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.0.id)
            .field("state", &self.0.state)
            .field("getters", &self.0.getters)
            .field("actions", &self.0.actions)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    State,
    Action,
}

/// Removes a subscription or action listener
///
/// Cloneable and idempotent; dropping it does *not* unsubscribe.
#[derive(Clone)]
pub struct Unsubscribe {
    store: Weak<StoreInner>,
    id: SubscriptionId,
    kind: ListenerKind,
}

impl Unsubscribe {
    fn new(store: &Rc<StoreInner>, id: SubscriptionId, kind: ListenerKind) -> Self {
        Self {
            store: Rc::downgrade(store),
            id,
            kind,
        }
    }

    /// Remove the callback; returns false if it was already removed
    pub fn unsubscribe(&self) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        match self.kind {
            ListenerKind::State => store.state.unsubscribe(self.id),
            ListenerKind::Action => store.actions.remove_listener(self.id),
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
