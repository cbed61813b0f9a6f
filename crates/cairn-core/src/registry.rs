//! Per-session store registry
//!
//! Guarantees at most one store instance per id within a session.

use crate::error::Result;
use crate::identity::StoreId;
use crate::session::Session;
use crate::store::{Store, StoreDefinition};
use indexmap::IndexMap;
use std::cell::RefCell;
use tracing::{debug, trace};

/// Ordered map of store id to live store
#[derive(Default)]
pub struct StoreRegistry {
    stores: RefCell<IndexMap<String, Store>>,
}

impl StoreRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a store by id
    pub fn get(&self, id: &str) -> Option<Store> {
        self.stores.borrow().get(id).cloned()
    }

    /// Return the cached instance of `definition`, or build and insert one
    ///
    /// No borrow is held while the store is built, so state factories and
    /// plugins may use other stores of the same session. If construction
    /// fails (a plugin returned an error) nothing is inserted.
    pub fn get_or_create(&self, session: &Session, definition: &StoreDefinition) -> Result<Store> {
        let id = definition.id().as_str();
        if let Some(existing) = self.get(id) {
            if !existing.definition().ptr_eq(definition) {
                debug!(
                    store = id,
                    session = %session.id(),
                    "store id already registered by another definition; reusing the first instance"
                );
            }
            trace!(store = id, session = %session.id(), "store reused");
            return Ok(existing);
        }

        // factories and plugins resolve nested stores against this session
        let _active = session.enter();
        let initial = session.initial_state_for(definition);
        let store = Store::new(session, definition.clone(), initial);
        session.apply_plugins(&store)?;

        let mut stores = self.stores.borrow_mut();
        // a factory or plugin may have created the same id while we were building
        if let Some(existing) = stores.get(id) {
            return Ok(existing.clone());
        }
        stores.insert(id.to_string(), store.clone());
        Ok(store)
    }

    /// Ids in creation order
    pub fn ids(&self) -> Vec<StoreId> {
        self.stores.borrow().keys().map(StoreId::new).collect()
    }

    /// Every live store in creation order
    pub fn stores(&self) -> Vec<Store> {
        self.stores.borrow().values().cloned().collect()
    }

    /// Number of stores
    pub fn len(&self) -> usize {
        self.stores.borrow().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.stores.borrow().is_empty()
    }

    /// Remove every store, returning the evicted handles
    pub fn clear(&self) -> Vec<Store> {
        let drained = std::mem::take(&mut *self.stores.borrow_mut());
        drained.into_values().collect()
    }
}
