//! Cairn Core - reactive application-state runtime
//!
//! This crate provides stores that live inside isolated sessions:
//! - Dynamic state trees (`Value`, `ValueMap`, `StatePath`)
//! - A state container with patch, subscribe and reset
//! - Memoized getters with path-granular dependency tracking
//! - Actions with `on_action` listeners and `after` / `on_error` hooks
//! - Per-session store registry with an explicit session lifecycle
//! - A plugin extension point contributing typed capabilities
//!
//! ## Sessions
//!
//! Every store belongs to one [`Session`]. Servers open one session per
//! request and close it when the response is sent; clients usually keep a
//! single session for the lifetime of the application:
//!
//! ```
//! use cairn_core::{close_session, define_store, open_session, value_map, Value};
//!
//! let todos = define_store("todos")
//!     .state(|| value_map! { "items" => Vec::<Value>::new() })
//!     .build();
//!
//! let request_a = open_session();
//! let request_b = open_session();
//! let a = todos.use_store_in(&request_a).unwrap();
//! let b = todos.use_store_in(&request_b).unwrap();
//!
//! a.patch(value_map! { "items" => vec!["write docs"] });
//! assert_eq!(b.get("items"), Value::List(vec![]));
//!
//! close_session(&request_a);
//! close_session(&request_b);
//! ```
//!
//! ## Reactivity
//!
//! The [`reactive`] module is usable on its own: a host can implement
//! [`Observer`] for its effects and evaluate them through [`observe`] to be
//! notified whenever a store value they read changes.

pub mod actions;
mod config;
mod error;
pub mod getters;
mod identity;
pub mod plugin;
pub mod reactive;
mod registry;
pub mod scope;
pub mod session;
pub mod state;
pub mod store;
mod value;

pub use actions::{ActionContext, ActionFn, ActionResult, ActionReturn, PendingAction};
pub use config::{runtime_config, set_runtime_config, MissingSessionPolicy, RuntimeConfig};
pub use error::{ActionError, Error, Result};
pub use identity::{SessionId, StoreId, SubscriptionId};
pub use plugin::{plugin_fn, Extension, FnPlugin, PluginContext, StorePlugin};
pub use reactive::{
    is_tracking, observe, untracked, Computed, ComputedState, Observer, ReactiveCell, Staleness,
};
pub use registry::StoreRegistry;
pub use scope::{current_scope, RenderScope};
pub use session::{
    active_session, clear_active_session, close_session, open_session, require_active_session,
    set_active_session, Session, SessionGuard, SessionScoped, WeakSession,
};
pub use state::{Mutation, MutationKind, StateContainer};
pub use store::{define_store, Store, StoreBuilder, StoreDefinition, Unsubscribe};
pub use value::{apply_paths, diff_paths, merge_into, StatePath, Value, ValueMap};
