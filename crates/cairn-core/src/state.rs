//! State container: the live state tree of one store
//!
//! Every write goes through the container so that it can:
//! - notify getters that read the changed paths (via [`ReactiveCell`])
//! - deliver exactly one [`Mutation`] to subscribers per logical change
//!
//! Patches and mutator functions are applied to the tree as a whole and
//! produce a single notification, however many fields they touch.

use crate::config::runtime_config;
use crate::error::Result;
use crate::identity::{StoreId, SubscriptionId};
use crate::reactive::{untracked, ReactiveCell};
use crate::value::{apply_paths, diff_paths, diff_values, merge_into, StatePath, Value, ValueMap};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::trace;

/// What produced a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    /// A direct write (`set`, `update`, or a wholesale state replacement)
    Direct,
    /// `patch` with a partial state object
    PatchObject,
    /// `patch_with` with a mutator function
    PatchFunction,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Direct => write!(f, "direct"),
            MutationKind::PatchObject => write!(f, "patch object"),
            MutationKind::PatchFunction => write!(f, "patch function"),
        }
    }
}

/// Payload delivered to subscribers after a state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// The store whose state changed
    pub store_id: StoreId,
    /// What produced the change
    pub kind: MutationKind,
    /// The patch object, the written `{path: value}` pairs, or `Null` for mutators
    pub payload: Value,
    /// Leaf paths whose value changed
    pub changed: Vec<StatePath>,
}

/// Subscriber callback: `(mutation, state after the change)`
pub type SubscriptionFn = Rc<dyn Fn(&Mutation, &ValueMap)>;

/// Owns a store's state tree and its subscription list
pub struct StateContainer {
    store_id: StoreId,
    cell: ReactiveCell<ValueMap>,
    subscriptions: RefCell<Vec<(SubscriptionId, SubscriptionFn)>>,
}

impl StateContainer {
    /// Create a container around an initial tree
    pub fn new(store_id: StoreId, initial: ValueMap) -> Self {
        Self {
            store_id,
            cell: ReactiveCell::new(initial),
            subscriptions: RefCell::new(Vec::new()),
        }
    }

    /// Read the value at `path` (`Null` when absent), tracking only that path
    pub fn get(&self, path: &StatePath) -> Value {
        self.cell
            .with_path(path, |state| {
                if path.is_root() {
                    Some(Value::Map(state.clone()))
                } else {
                    path.lookup(state).cloned()
                }
            })
            .unwrap_or_default()
    }

    /// Snapshot of the whole tree, tracking every path
    pub fn snapshot(&self) -> ValueMap {
        self.cell.get()
    }

    /// Snapshot of the whole tree without tracking
    pub fn snapshot_untracked(&self) -> ValueMap {
        self.cell.with_untracked(ValueMap::clone)
    }

    /// Write `value` at `path`
    ///
    /// Subscribers get one `Direct` mutation if the value actually changed.
    /// The parent of `path` must exist and be a map.
    pub fn set(&self, path: &StatePath, value: Value) -> Result<()> {
        let changed = self.cell.try_update(|state| {
            let old = path.insert(state, value.clone())?;
            let mut changed = Vec::new();
            match old {
                Some(old) => diff_values(&old, &value, path, &mut changed),
                None => changed.push(path.clone()),
            }
            Ok(changed)
        })?;
        if !changed.is_empty() {
            let mut payload = ValueMap::new();
            payload.insert(path.to_string(), value);
            self.emit(Mutation {
                store_id: self.store_id.clone(),
                kind: MutationKind::Direct,
                payload: Value::Map(payload),
                changed,
            });
        }
        Ok(())
    }

    /// Replace the whole tree; always exactly one `Direct` mutation
    pub fn replace(&self, new_state: ValueMap) {
        let payload = Value::Map(new_state.clone());
        let changed = self.cell.update(|state| {
            let changed = diff_paths(state, &new_state);
            *state = new_state;
            changed
        });
        self.emit(Mutation {
            store_id: self.store_id.clone(),
            kind: MutationKind::Direct,
            payload,
            changed,
        });
    }

    /// Deep-merge a partial tree; always exactly one `PatchObject` mutation
    pub fn patch(&self, patch: ValueMap) {
        let changed = self.cell.update(|state| merge_into(state, &patch));
        self.emit(Mutation {
            store_id: self.store_id.clone(),
            kind: MutationKind::PatchObject,
            payload: Value::Map(patch),
            changed,
        });
    }

    /// Apply a mutator with write access to the tree; exactly one `PatchFunction` mutation
    ///
    /// The mutator works on a draft, so it may freely read the store while
    /// running. Only the paths the mutator itself changed are committed;
    /// writes made by other code while it ran (nested actions, subscribers)
    /// are kept.
    pub fn patch_with(&self, mutator: impl FnOnce(&mut ValueMap)) {
        let before = self.snapshot_untracked();
        let mut draft = before.clone();
        mutator(&mut draft);
        let edits = diff_paths(&before, &draft);
        let changed = self.cell.update(|state| {
            let current = state.clone();
            apply_paths(state, &draft, &edits);
            diff_paths(&current, state)
        });
        self.emit(Mutation {
            store_id: self.store_id.clone(),
            kind: MutationKind::PatchFunction,
            payload: Value::Null,
            changed,
        });
    }

    /// Drop every subscription, then install `fresh` without notifying anyone
    ///
    /// Getters that read changed paths are still invalidated.
    pub fn reset(&self, fresh: ValueMap) {
        self.subscriptions.borrow_mut().clear();
        self.cell.update(|state| {
            let changed = diff_paths(state, &fresh);
            *state = fresh;
            changed
        });
    }

    /// Register a subscriber
    pub fn subscribe(&self, callback: SubscriptionFn) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.subscriptions.borrow_mut().push((id, callback));
        id
    }

    /// Remove a subscriber; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.borrow_mut();
        let before = subscriptions.len();
        subscriptions.retain(|(sub, _)| *sub != id);
        subscriptions.len() != before
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.borrow().len()
    }

    fn emit(&self, mutation: Mutation) {
        if runtime_config().trace_mutations {
            trace!(
                store = %mutation.store_id,
                kind = %mutation.kind,
                changed = mutation.changed.len(),
                "state mutation"
            );
        }
        // snapshot: callbacks may subscribe, unsubscribe or write
        let subscribers: Vec<SubscriptionFn> = self
            .subscriptions
            .borrow()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        if subscribers.is_empty() {
            return;
        }
        let state = self.snapshot_untracked();
        untracked(|| {
            for callback in subscribers {
                callback(&mutation, &state);
            }
        });
    }
}

impl fmt::Debug for StateContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateContainer")
            .field("store_id", &self.store_id)
            .field("state", &self.snapshot_untracked())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::value_map;

    type Log = Rc<RefCell<Vec<(Mutation, ValueMap)>>>;

    fn container() -> StateContainer {
        StateContainer::new(
            StoreId::new("main"),
            value_map! {
                "n" => 0,
                "user" => value_map! { "name" => "Ada", "age" => 36 },
                "tags" => vec!["a"],
            },
        )
    }

    fn record(container: &StateContainer) -> (Log, SubscriptionId) {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let id = container.subscribe(Rc::new(move |m: &Mutation, s: &ValueMap| {
            sink.borrow_mut().push((m.clone(), s.clone()));
        }));
        (log, id)
    }

    #[test]
    fn test_direct_set_notifies_once_per_change() {
        let state = container();
        let (log, _) = record(&state);

        state.set(&StatePath::parse("n"), Value::Int(1)).unwrap();
        state.set(&StatePath::parse("n"), Value::Int(2)).unwrap();
        // unchanged write is silent
        state.set(&StatePath::parse("n"), Value::Int(2)).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0.kind, MutationKind::Direct);
        assert_eq!(log[0].1.get("n"), Some(&Value::Int(1)));
        assert_eq!(log[1].1.get("n"), Some(&Value::Int(2)));
        assert_eq!(log[1].0.payload, Value::Map(value_map! { "n" => 2 }));
    }

    #[test]
    fn test_set_nested_and_errors() {
        let state = container();
        state.set(&StatePath::parse("user.name"), "Grace".into()).unwrap();
        assert_eq!(state.get(&StatePath::parse("user.name")), Value::from("Grace"));

        let err = state.set(&StatePath::parse("n.inner"), 1.into()).unwrap_err();
        assert!(matches!(err, Error::TypeError { .. }));
        assert_eq!(state.get(&StatePath::parse("missing")), Value::Null);
    }

    #[test]
    fn test_patch_object_single_notification() {
        let state = container();
        let (log, _) = record(&state);

        state.patch(value_map! {
            "n" => 5,
            "user" => value_map! { "age" => 37 },
            "tags" => vec!["b", "c"],
        });

        assert_eq!(
            state.snapshot_untracked(),
            value_map! {
                "n" => 5,
                "user" => value_map! { "name" => "Ada", "age" => 37 },
                "tags" => vec!["b", "c"],
            }
        );
        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0.kind, MutationKind::PatchObject);
        assert_eq!(log[0].0.changed.len(), 3);
    }

    #[test]
    fn test_patch_notifies_even_without_changes() {
        let state = container();
        let (log, _) = record(&state);
        state.patch(value_map! { "n" => 0 });
        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow()[0].0.changed.is_empty());
    }

    #[test]
    fn test_patch_function_single_notification() {
        let state = container();
        let (log, _) = record(&state);

        state.patch_with(|s| {
            s.insert("n".into(), Value::Int(10));
            s.insert("extra".into(), Value::Bool(true));
        });

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0.kind, MutationKind::PatchFunction);
        assert_eq!(log[0].0.payload, Value::Null);
        assert_eq!(log[0].1.get("extra"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_patch_function_keeps_writes_made_while_running() {
        let state = container();
        let (log, _) = record(&state);

        state.patch_with(|s| {
            s.insert("n".into(), Value::Int(1));
            state.set(&StatePath::parse("user.age"), Value::Int(7)).unwrap();
            state.set(&StatePath::parse("b"), Value::Int(7)).unwrap();
            s.shift_remove("tags");
        });

        assert_eq!(
            state.snapshot_untracked(),
            value_map! {
                "n" => 1,
                "user" => value_map! { "name" => "Ada", "age" => 7 },
                "b" => 7,
            }
        );
        let log = log.borrow();
        let kinds: Vec<MutationKind> = log.iter().map(|(m, _)| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MutationKind::Direct, MutationKind::Direct, MutationKind::PatchFunction]
        );
        let mut changed: Vec<String> = log[2].0.changed.iter().map(|p| p.to_string()).collect();
        changed.sort();
        assert_eq!(changed, vec!["n", "tags"]);
    }

    #[test]
    fn test_unsubscribe() {
        let state = container();
        let (log, id) = record(&state);
        assert!(state.unsubscribe(id));
        assert!(!state.unsubscribe(id));
        state.patch(value_map! { "n" => 1 });
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_reset_clears_subscribers_silently() {
        let state = container();
        let (log, _) = record(&state);
        state.patch(value_map! { "n" => 3 });
        state.reset(value_map! { "n" => 0 });

        assert_eq!(state.subscriber_count(), 0);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(state.snapshot_untracked(), value_map! { "n" => 0 });

        state.set(&StatePath::parse("n"), 9.into()).unwrap();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_replace_whole_state() {
        let state = container();
        let (log, _) = record(&state);
        state.replace(value_map! { "n" => 1 });
        assert_eq!(state.snapshot_untracked(), value_map! { "n" => 1 });
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(log.borrow()[0].0.kind, MutationKind::Direct);
    }

    #[test]
    fn test_subscriber_may_write_back() {
        let state = Rc::new(container());
        let target = state.clone();
        state.subscribe(Rc::new(move |m: &Mutation, s: &ValueMap| {
            if m.kind == MutationKind::PatchObject {
                let n = s.get("n").and_then(Value::as_int).unwrap_or(0);
                target.set(&StatePath::parse("doubled"), Value::Int(n * 2)).unwrap();
            }
        }));
        state.patch(value_map! { "n" => 4 });
        assert_eq!(state.get(&StatePath::parse("doubled")), Value::Int(8));
    }

    #[test]
    fn test_mutation_serializes() {
        let mutation = Mutation {
            store_id: StoreId::new("main"),
            kind: MutationKind::PatchObject,
            payload: Value::Map(value_map! { "n" => 1 }),
            changed: vec![StatePath::parse("n")],
        };
        let text = ron::to_string(&mutation).unwrap();
        let back: Mutation = ron::from_str(&text).unwrap();
        assert_eq!(back, mutation);
    }
}
