//! Plugin extension point
//!
//! A plugin runs once for every store created after it becomes active and
//! returns an [`Extension`]: named [`Value`] properties plus typed
//! capabilities. Extensions are merged onto the store in registration order,
//! so a later plugin sees what earlier ones contributed and may override it.
//!
//! # Example
//!
//! ```
//! use cairn_core::{define_store, open_session, plugin_fn, Extension, Value};
//!
//! struct Clock(u64);
//!
//! let session = open_session();
//! session.attach();
//! session.use_plugin(plugin_fn("audit", |ctx| {
//!     Ok(Extension::new()
//!         .with_property("audited_id", ctx.store.id().as_str())
//!         .with_capability(Clock(7)))
//! }));
//!
//! let store = define_store("cart").build().use_store_in(&session).unwrap();
//! assert_eq!(store.property("audited_id"), Some(Value::from("cart")));
//! assert_eq!(store.capability::<Clock>().map(|c| c.0), Some(7));
//! ```

use crate::error::Result;
use crate::session::Session;
use crate::store::{Store, StoreDefinition};
use crate::value::{Value, ValueMap};
use indexmap::IndexMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::rc::Rc;

/// What a plugin sees when a store is created
pub struct PluginContext<'a> {
    /// The store being created
    pub store: &'a Store,
    /// The session it belongs to
    pub session: &'a Session,
    /// The definition it was built from
    pub definition: &'a StoreDefinition,
}

/// Extends stores at creation time
pub trait StorePlugin {
    /// Name used in logs and errors
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Contribute properties and capabilities to a new store
    fn extend(&self, ctx: &PluginContext<'_>) -> Result<Extension>;
}

type PluginFn = Box<dyn Fn(&PluginContext<'_>) -> Result<Extension>>;

/// A plugin built from a closure, see [`plugin_fn`]
pub struct FnPlugin {
    name: String,
    extend: PluginFn,
}

impl StorePlugin for FnPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn extend(&self, ctx: &PluginContext<'_>) -> Result<Extension> {
        (self.extend)(ctx)
    }
}

impl fmt::Debug for FnPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPlugin").field("name", &self.name).finish()
    }
}

/// Build a named plugin from a closure
pub fn plugin_fn(
    name: impl Into<String>,
    extend: impl Fn(&PluginContext<'_>) -> Result<Extension> + 'static,
) -> FnPlugin {
    FnPlugin {
        name: name.into(),
        extend: Box::new(extend),
    }
}

// ============================================================================
// Extensions
// ============================================================================

/// Properties and capabilities contributed to a store
#[derive(Clone, Default)]
pub struct Extension {
    properties: ValueMap,
    capabilities: IndexMap<TypeId, Rc<dyn Any>>,
}

impl Extension {
    /// Create an empty extension
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named property
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Add a typed capability, replacing any capability of the same type
    pub fn with_capability<T: Any>(mut self, capability: T) -> Self {
        self.capabilities
            .insert(TypeId::of::<T>(), Rc::new(capability) as Rc<dyn Any>);
        self
    }

    /// Get a property
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Get a capability by type
    pub fn capability<T: Any>(&self) -> Option<Rc<T>> {
        self.capabilities
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|capability| capability.downcast::<T>().ok())
    }

    /// Property names in contribution order
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Check if nothing has been contributed
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.capabilities.is_empty()
    }

    /// Merge `other` into this extension; `other` wins on conflicts
    pub fn merge(&mut self, other: Extension) {
        self.properties.extend(other.properties);
        self.capabilities.extend(other.capabilities);
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("properties", &self.properties)
            .field("capabilities", &self.capabilities.len())
            .finish()
    }
}

// ============================================================================
// Plugin list
// ============================================================================

/// Plugins of one session: queued until the session is attached
#[derive(Default)]
pub(crate) struct PluginSet {
    attached: bool,
    pending: Vec<Rc<dyn StorePlugin>>,
    active: Vec<Rc<dyn StorePlugin>>,
}

impl PluginSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a plugin; returns true if it was queued
    pub(crate) fn add(&mut self, plugin: Rc<dyn StorePlugin>) -> bool {
        if self.attached {
            self.active.push(plugin);
            false
        } else {
            self.pending.push(plugin);
            true
        }
    }

    /// Promote queued plugins; returns how many were promoted
    pub(crate) fn attach(&mut self) -> usize {
        self.attached = true;
        let promoted = self.pending.len();
        self.active.append(&mut self.pending);
        promoted
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.attached
    }

    pub(crate) fn active(&self) -> &[Rc<dyn StorePlugin>] {
        &self.active
    }
}
