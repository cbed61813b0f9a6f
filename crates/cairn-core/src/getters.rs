//! Getter cache: memoized derived values bound to one store
//!
//! Each getter is a [`Computed`] whose evaluator upgrades a weak handle to
//! its store, re-enters the store's session and calls the getter function
//! with the store. Getters may read state, other getters of the same store,
//! and stores of the same session.

use crate::error::{Error, Result};
use crate::reactive::Computed;
use crate::store::{Store, StoreInner};
use crate::value::Value;
use indexmap::IndexMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// A getter body: a pure function of the store
pub type GetterFn = Rc<dyn Fn(&Store) -> Result<Value>>;

/// The memoized getters of one store instance
pub struct GetterCache {
    store_id: String,
    getters: IndexMap<String, Rc<Computed<Value>>>,
}

impl GetterCache {
    pub(crate) fn new(
        store_id: &str,
        store: &Weak<StoreInner>,
        definitions: &IndexMap<String, GetterFn>,
    ) -> Self {
        let getters = definitions
            .iter()
            .map(|(name, getter)| {
                let label = format!("{}.{}", store_id, name);
                let weak = store.clone();
                let getter = getter.clone();
                let store_label = store_id.to_string();
                let computed = Computed::new(label, move || {
                    let inner = weak
                        .upgrade()
                        .ok_or_else(|| Error::StoreDropped(store_label.clone()))?;
                    let store = Store::from_inner(inner);
                    let _session = store.session().map(|session| session.enter());
                    getter(&store)
                });
                (name.clone(), computed)
            })
            .collect();
        Self {
            store_id: store_id.to_string(),
            getters,
        }
    }

    /// Read a getter, recomputing only if something it read has changed
    pub fn get(&self, name: &str) -> Result<Value> {
        self.getters
            .get(name)
            .ok_or_else(|| Error::GetterNotFound {
                store: self.store_id.clone(),
                name: name.to_string(),
            })?
            .get()
    }

    /// Check if a getter exists
    pub fn contains(&self, name: &str) -> bool {
        self.getters.contains_key(name)
    }

    /// Getter names in definition order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.getters.keys().map(String::as_str)
    }

    /// How many times a getter has been evaluated
    pub fn compute_count(&self, name: &str) -> Option<u64> {
        self.getters.get(name).map(|computed| computed.runs())
    }
}

impl fmt::Debug for GetterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.getters.iter()).finish()
    }
}
