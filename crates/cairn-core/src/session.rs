//! Sessions and the active-session pointer
//!
//! A [`Session`] is one isolated set of stores: an application instance, or
//! one inbound request on a server. It owns its [`StoreRegistry`], its plugin
//! list and an optional hydration provider. Stores only hold a weak handle to
//! their session, so dropping the last `Session` handle (or calling
//! [`close_session`]) releases every store it created.
//!
//! The active pointer is thread-local and weak. Hosts either set it
//! explicitly around an entry point with [`set_active_session`], or use the
//! scoped forms [`Session::enter`], [`Session::run`] and [`Session::scope`],
//! which restore the previous pointer when they end.

use crate::config::{runtime_config, MissingSessionPolicy};
use crate::error::{Error, Result};
use crate::identity::{SessionId, StoreId};
use crate::plugin::{PluginContext, PluginSet, StorePlugin};
use crate::reactive::untracked;
use crate::registry::StoreRegistry;
use crate::store::{Store, StoreDefinition};
use crate::value::{Value, ValueMap};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// Supplies serialized state to hydrate stores as they are created
pub type StateProvider = Rc<dyn Fn() -> ValueMap>;

pub(crate) struct SessionInner {
    id: SessionId,
    registry: StoreRegistry,
    plugins: RefCell<PluginSet>,
    state_provider: RefCell<Option<StateProvider>>,
    closed: Cell<bool>,
}

/// One isolated set of stores
///
/// Cheap to clone; clones refer to the same session.
#[derive(Clone)]
pub struct Session(Rc<SessionInner>);

/// Non-owning session handle held by stores
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    /// Get the session back if it is still alive
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(Session)
    }
}

impl fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(session) => write!(f, "WeakSession({})", session.id()),
            None => write!(f, "WeakSession(<dropped>)"),
        }
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<Weak<SessionInner>>> = const { RefCell::new(None) };
}

fn swap_active(next: Option<Weak<SessionInner>>) -> Option<Weak<SessionInner>> {
    ACTIVE.with(|active| active.replace(next))
}

/// Create a new session
pub fn open_session() -> Session {
    let session = Session(Rc::new(SessionInner {
        id: SessionId::next(),
        registry: StoreRegistry::new(),
        plugins: RefCell::new(PluginSet::new()),
        state_provider: RefCell::new(None),
        closed: Cell::new(false),
    }));
    debug!(session = %session.id(), "session opened");
    session
}

/// Close a session, evicting all of its stores
pub fn close_session(session: &Session) {
    session.close();
}

/// Make `session` the active session of this thread
pub fn set_active_session(session: &Session) {
    swap_active(Some(Rc::downgrade(&session.0)));
}

/// Unset the active session of this thread
pub fn clear_active_session() {
    swap_active(None);
}

/// The active session, if one is set and still alive
///
/// When nothing is active the configured [`MissingSessionPolicy`] decides
/// whether a warning is logged; the caller gets `None` either way.
pub fn active_session() -> Option<Session> {
    let active = ACTIVE.with(|active| active.borrow().as_ref().and_then(Weak::upgrade));
    if active.is_none() {
        match runtime_config().missing_session {
            MissingSessionPolicy::Warn => warn!(
                "no active session: a store was requested outside of a session; \
                 call `set_active_session`, `Session::enter` or pass the session \
                 explicitly with `use_store_in`"
            ),
            MissingSessionPolicy::Silent => {}
        }
    }
    active.map(Session)
}

/// The active session, or [`Error::NoActiveSession`]
pub fn require_active_session() -> Result<Session> {
    active_session().ok_or(Error::NoActiveSession)
}

impl Session {
    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.0.id
    }

    /// A non-owning handle
    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Rc::downgrade(&self.0))
    }

    /// Check if two handles refer to the same session
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Check if this is the active session of the current thread
    pub fn is_active(&self) -> bool {
        ACTIVE.with(|active| {
            active
                .borrow()
                .as_ref()
                .is_some_and(|weak| weak.as_ptr() == Rc::as_ptr(&self.0))
        })
    }

    /// Check if the session has been closed
    pub fn is_closed(&self) -> bool {
        self.0.closed.get()
    }

    // ------------------------------------------------------------------------
    // Scoped activation
    // ------------------------------------------------------------------------

    /// Make this session active until the guard is dropped
    pub fn enter(&self) -> SessionGuard {
        SessionGuard {
            previous: swap_active(Some(Rc::downgrade(&self.0))),
        }
    }

    /// Run `f` with this session active
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    /// Wrap a future so that this session is active whenever it is polled
    pub fn scope<F: Future>(&self, future: F) -> SessionScoped<F> {
        SessionScoped {
            session: self.downgrade(),
            future: Box::pin(future),
        }
    }

    // ------------------------------------------------------------------------
    // Plugins
    // ------------------------------------------------------------------------

    /// Register a plugin
    ///
    /// Before [`Session::attach`] the plugin is queued; afterwards it is
    /// active immediately. Either way it applies to stores created later.
    pub fn use_plugin(&self, plugin: impl StorePlugin + 'static) {
        let plugin: Rc<dyn StorePlugin> = Rc::new(plugin);
        let queued = self.0.plugins.borrow_mut().add(plugin.clone());
        debug!(session = %self.id(), plugin = plugin.name(), queued, "plugin registered");
    }

    /// Attach the session to its host, activating queued plugins in order
    pub fn attach(&self) {
        let promoted = self.0.plugins.borrow_mut().attach();
        debug!(session = %self.id(), promoted, "session attached");
    }

    /// Check if [`Session::attach`] has run
    pub fn is_attached(&self) -> bool {
        self.0.plugins.borrow().is_attached()
    }

    /// Number of active plugins
    pub fn plugin_count(&self) -> usize {
        self.0.plugins.borrow().active().len()
    }

    pub(crate) fn apply_plugins(&self, store: &Store) -> Result<()> {
        let plugins = self.0.plugins.borrow().active().to_vec();
        for plugin in plugins {
            let context = PluginContext {
                store,
                session: self,
                definition: store.definition(),
            };
            let extension = untracked(|| plugin.extend(&context)).map_err(|err| {
                debug!(store = %store.id(), plugin = plugin.name(), %err, "plugin failed");
                err
            })?;
            store.apply_extension(extension);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stores
    // ------------------------------------------------------------------------

    /// Get (or create) the instance of `definition` in this session
    pub fn use_store(&self, definition: &StoreDefinition) -> Result<Store> {
        if self.is_closed() {
            return Err(Error::SessionClosed(self.id()));
        }
        self.0.registry.get_or_create(self, definition)
    }

    /// Look up an existing store by id
    pub fn store(&self, id: &str) -> Option<Store> {
        self.0.registry.get(id)
    }

    /// Ids of every live store, in creation order
    pub fn store_ids(&self) -> Vec<StoreId> {
        self.0.registry.ids()
    }

    /// Snapshot of every store's state keyed by store id
    pub fn root_state(&self) -> ValueMap {
        untracked(|| {
            self.0
                .registry
                .stores()
                .into_iter()
                .map(|store| (store.id().to_string(), Value::Map(store.state())))
                .collect()
        })
    }

    /// Hydrate stores created from now on from `provider()[store_id]`
    pub fn set_state_provider(&self, provider: impl Fn() -> ValueMap + 'static) {
        *self.0.state_provider.borrow_mut() = Some(Rc::new(provider));
    }

    /// Stop hydrating new stores
    pub fn clear_state_provider(&self) {
        self.0.state_provider.borrow_mut().take();
    }

    pub(crate) fn initial_state_for(&self, definition: &StoreDefinition) -> ValueMap {
        let provider = self.0.state_provider.borrow().clone();
        let hydrated = provider.and_then(|provider| {
            let mut state = untracked(|| provider());
            match state.swap_remove(definition.id().as_str()) {
                Some(Value::Map(map)) => Some(map),
                _ => None,
            }
        });
        match hydrated {
            Some(map) => {
                debug!(store = %definition.id(), "hydrating store from state provider");
                map
            }
            None => untracked(|| definition.initial_state()),
        }
    }

    /// Evict every store and mark the session closed
    ///
    /// Later `use_store` calls fail with [`Error::SessionClosed`]. If this is
    /// the active session, the active pointer is cleared.
    pub fn close(&self) {
        if self.0.closed.replace(true) {
            return;
        }
        let evicted = self.0.registry.clear();
        if self.is_active() {
            clear_active_session();
        }
        debug!(session = %self.id(), evicted = evicted.len(), "session closed");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.0.id)
            .field("stores", &self.store_ids())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Restores the previously active session on drop
#[must_use = "the session is only active while the guard is alive"]
pub struct SessionGuard {
    previous: Option<Weak<SessionInner>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        swap_active(self.previous.take());
    }
}

/// A future that runs with its session active
///
/// Returned by [`Session::scope`]. Each poll enters the session and restores
/// the previous pointer afterwards, so interleaved futures of different
/// sessions never observe each other's stores.
pub struct SessionScoped<F> {
    session: WeakSession,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for SessionScoped<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _guard = self.session.upgrade().map(|session| session.enter());
        self.future.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{set_runtime_config, RuntimeConfig};
    use crate::plugin::{plugin_fn, Extension};
    use crate::store::define_store;
    use crate::value_map;
    use futures::executor::block_on;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::layer::{self, Layer, SubscriberExt as _};

    fn counter() -> StoreDefinition {
        define_store("counter")
            .state(|| value_map! { "n" => 0 })
            .build()
    }

    struct WarnCounter {
        warnings: Arc<Mutex<Vec<String>>>,
    }

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: layer::Context<'_, S>) {
            struct Message(String);

            impl tracing::field::Visit for Message {
                fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
                    if field.name() == "message" {
                        self.0 = format!("{:?}", value);
                    }
                }
            }

            if *event.metadata().level() == tracing::Level::WARN {
                let mut message = Message(String::new());
                event.record(&mut message);
                self.warnings.lock().unwrap().push(message.0);
            }
        }
    }

    fn warnings_while(policy: MissingSessionPolicy) -> Vec<String> {
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(WarnCounter {
            warnings: warnings.clone(),
        });
        set_runtime_config(RuntimeConfig::default().with_missing_session(policy));
        clear_active_session();
        tracing::subscriber::with_default(subscriber, || {
            assert!(active_session().is_none());
        });
        set_runtime_config(RuntimeConfig::default());
        let captured = warnings.lock().unwrap().clone();
        captured
    }

    #[test]
    fn test_missing_session_policy_controls_warning() {
        let warned = warnings_while(MissingSessionPolicy::Warn);
        assert_eq!(warned.len(), 1);
        assert!(warned[0].starts_with("no active session"));
        assert!(warnings_while(MissingSessionPolicy::Silent).is_empty());
    }

    #[test]
    fn test_enter_restores_previous() {
        let a = open_session();
        let b = open_session();
        set_active_session(&a);
        {
            let _guard = b.enter();
            assert!(b.is_active());
            assert!(!a.is_active());
        }
        assert!(a.is_active());
        clear_active_session();
        assert!(!a.is_active());
    }

    #[test]
    fn test_require_without_session_fails() {
        set_runtime_config(RuntimeConfig::default().with_missing_session(MissingSessionPolicy::Silent));
        clear_active_session();
        assert!(matches!(require_active_session(), Err(Error::NoActiveSession)));
        assert!(matches!(counter().use_store(), Err(Error::NoActiveSession)));
        set_runtime_config(RuntimeConfig::default());
    }

    #[test]
    fn test_active_pointer_does_not_keep_session_alive() {
        let session = open_session();
        set_active_session(&session);
        drop(session);
        set_runtime_config(RuntimeConfig::default().with_missing_session(MissingSessionPolicy::Silent));
        assert!(active_session().is_none());
        set_runtime_config(RuntimeConfig::default());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let a = open_session();
        let b = open_session();
        let def = counter();
        let in_a = def.use_store_in(&a).unwrap();
        let in_b = def.use_store_in(&b).unwrap();
        in_a.set("n", 3).unwrap();
        assert_eq!(in_b.get("n"), Value::Int(0));
        assert!(!in_a.ptr_eq(&in_b));
        assert!(in_a.ptr_eq(&a.run(|| def.use_store().unwrap())));
    }

    #[test]
    fn test_close_evicts_stores() {
        let session = open_session();
        let store = counter().use_store_in(&session).unwrap();
        assert_eq!(session.store_ids(), vec![StoreId::new("counter")]);
        assert!(session.is_active());

        close_session(&session);
        assert!(session.is_closed());
        assert!(!session.is_active());
        assert!(session.store("counter").is_none());
        assert!(matches!(
            session.use_store(&counter()),
            Err(Error::SessionClosed(_))
        ));
        // handles outlive eviction but are detached from the registry
        assert_eq!(store.get("n"), Value::Int(0));
    }

    #[test]
    fn test_dropping_session_drops_stores() {
        let session = open_session();
        let store = counter().use_store_in(&session).unwrap();
        drop(session);
        assert!(store.session().is_none());
    }

    #[test]
    fn test_state_provider_hydrates_new_stores() {
        let session = open_session();
        session.set_state_provider(|| {
            value_map! {
                "counter" => value_map! { "n" => 41 },
                "ignored" => 5,
            }
        });
        let store = counter().use_store_in(&session).unwrap();
        assert_eq!(store.get("n"), Value::Int(41));
        store.reset();
        assert_eq!(store.get("n"), Value::Int(0));
    }

    #[test]
    fn test_root_state_lists_every_store() {
        let session = open_session();
        counter().use_store_in(&session).unwrap().set("n", 2).unwrap();
        define_store("user")
            .state(|| value_map! { "name" => "Ada" })
            .build()
            .use_store_in(&session)
            .unwrap();
        assert_eq!(
            session.root_state(),
            value_map! {
                "counter" => value_map! { "n" => 2 },
                "user" => value_map! { "name" => "Ada" },
            }
        );
    }

    #[test]
    fn test_scope_reenters_session_on_poll() {
        let a = open_session();
        let b = open_session();
        let scoped = a.scope(async { active_session().map(|s| s.id()) });
        set_active_session(&b);
        assert_eq!(block_on(scoped), Some(a.id()));
        assert!(b.is_active());
    }

    #[test]
    fn test_plugins_queue_until_attach() {
        let session = open_session();
        session.use_plugin(plugin_fn("tag", |_| {
            Ok(Extension::new().with_property("tagged", true))
        }));
        assert_eq!(session.plugin_count(), 0);
        let early = counter().use_store_in(&session).unwrap();
        assert_eq!(early.property("tagged"), None);

        session.attach();
        assert!(session.is_attached());
        assert_eq!(session.plugin_count(), 1);
        let late = define_store("late").build().use_store_in(&session).unwrap();
        assert_eq!(late.property("tagged"), Some(Value::Bool(true)));
    }
}
