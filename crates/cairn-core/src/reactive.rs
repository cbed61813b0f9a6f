//! Reactive primitives: observable cells and memoized computations
//!
//! ## Architecture
//!
//! The engine is a small pull-based reactivity runtime:
//!
//! 1. **Observer stack**: a thread-local stack of the computations currently
//!    evaluating. Reading a [`ReactiveCell`] or a [`Computed`] registers the
//!    top observer as a dependent of the value read.
//! 2. **Path-keyed dependents**: cells record *which path* of their value was
//!    read, so a write to `user.age` does not disturb a reader of `user.name`.
//! 3. **Three-state memos**: a write marks direct readers `Dirty` and their
//!    transitive readers `Check`. A `Check` node first refreshes the memos it
//!    read and only recomputes when one of them actually produced a new value.
//!
//! Any host reactive system can take part by implementing [`Observer`] and
//! evaluating its effects inside [`observe`].

use crate::error::{Error, Result};
use crate::value::StatePath;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// How stale an observer has become
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Something upstream may have changed; verify before recomputing
    Check,
    /// A value that was read has changed; recompute on next read
    Dirty,
}

/// Something that reads reactive values and wants to hear about changes
pub trait Observer {
    /// Evaluation generation; registrations from older generations are dropped
    fn epoch(&self) -> u64;

    /// Called synchronously when a dependency changes
    fn mark(&self, level: Staleness);
}

/// A memo that can be brought up to date on demand
pub(crate) trait Upstream {
    /// Refresh the memo; returns false if it could not produce a value
    fn refresh(&self) -> bool;
}

struct Frame {
    observer: Weak<dyn Observer>,
    epoch: u64,
    upstream: Vec<Rc<dyn Upstream>>,
}

thread_local! {
    // `None` frames come from `untracked` and swallow registrations.
    static FRAMES: RefCell<Vec<Option<Frame>>> = const { RefCell::new(Vec::new()) };
}

struct FrameGuard;

impl FrameGuard {
    fn push(frame: Option<Frame>) -> Self {
        FRAMES.with(|frames| frames.borrow_mut().push(frame));
        FrameGuard
    }

    fn take_upstream(&self) -> Vec<Rc<dyn Upstream>> {
        FRAMES.with(|frames| {
            frames
                .borrow_mut()
                .last_mut()
                .and_then(|frame| frame.as_mut())
                .map(|frame| std::mem::take(&mut frame.upstream))
                .unwrap_or_default()
        })
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

fn current_observer() -> Option<(Weak<dyn Observer>, u64)> {
    FRAMES.with(|frames| {
        frames
            .borrow()
            .last()
            .and_then(|frame| frame.as_ref())
            .map(|frame| (frame.observer.clone(), frame.epoch))
    })
}

fn record_upstream(upstream: Rc<dyn Upstream>) {
    FRAMES.with(|frames| {
        if let Some(Some(frame)) = frames.borrow_mut().last_mut() {
            if !frame.upstream.iter().any(|u| Rc::ptr_eq(u, &upstream)) {
                frame.upstream.push(upstream);
            }
        }
    });
}

/// Run `f` with `observer` recording every reactive read
///
/// This is the seam for host effects: implement [`Observer`], bump the epoch
/// before each run, and evaluate the effect body through this function.
pub fn observe<R>(observer: Weak<dyn Observer>, epoch: u64, f: impl FnOnce() -> R) -> R {
    let guard = FrameGuard::push(Some(Frame {
        observer,
        epoch,
        upstream: Vec::new(),
    }));
    let result = f();
    drop(guard);
    result
}

fn observe_collecting<R>(
    observer: Weak<dyn Observer>,
    epoch: u64,
    f: impl FnOnce() -> R,
) -> (R, Vec<Rc<dyn Upstream>>) {
    let guard = FrameGuard::push(Some(Frame {
        observer,
        epoch,
        upstream: Vec::new(),
    }));
    let result = f();
    let upstream = guard.take_upstream();
    (result, upstream)
}

/// Run `f` without registering any dependency
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = FrameGuard::push(None);
    f()
}

/// Check whether an observer is currently recording reads
pub fn is_tracking() -> bool {
    current_observer().is_some()
}

// ============================================================================
// Dependents
// ============================================================================

struct Dependent {
    path: StatePath,
    observer: Weak<dyn Observer>,
    epoch: u64,
}

/// The readers of one reactive source, keyed by the path they read
#[derive(Default)]
pub struct Dependents {
    entries: RefCell<Vec<Dependent>>,
}

impl Dependents {
    /// Create an empty dependent list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the current observer (if any) as a reader of `path`
    pub fn track(&self, path: &StatePath) {
        let Some((observer, epoch)) = current_observer() else {
            return;
        };
        let mut entries = self.entries.borrow_mut();
        let known = entries.iter().any(|d| {
            d.epoch == epoch && Weak::ptr_eq(&d.observer, &observer) && d.path.is_prefix_of(path)
        });
        if !known {
            entries.push(Dependent {
                path: path.clone(),
                observer,
                epoch,
            });
        }
    }

    /// Mark every live reader whose path overlaps one of `changed`
    pub fn notify(&self, changed: &[StatePath], level: Staleness) {
        if changed.is_empty() {
            return;
        }
        let targets: Vec<Rc<dyn Observer>> = {
            let mut entries = self.entries.borrow_mut();
            entries.retain(|d| d.observer.upgrade().is_some_and(|o| o.epoch() == d.epoch));
            let mut targets: Vec<Rc<dyn Observer>> = Vec::new();
            for dependent in entries.iter() {
                if !changed.iter().any(|path| path.overlaps(&dependent.path)) {
                    continue;
                }
                if let Some(observer) = dependent.observer.upgrade() {
                    if !targets.iter().any(|t| Rc::ptr_eq(t, &observer)) {
                        targets.push(observer);
                    }
                }
            }
            targets
        };
        // borrow released: observers may track again while being marked
        for observer in targets {
            observer.mark(level);
        }
    }

    /// Mark every live reader regardless of path
    pub fn notify_all(&self, level: Staleness) {
        self.notify(&[StatePath::root()], level);
    }

    /// Number of registrations that are still current
    pub fn len(&self) -> usize {
        self.entries
            .borrow()
            .iter()
            .filter(|d| d.observer.upgrade().is_some_and(|o| o.epoch() == d.epoch))
            .count()
    }

    /// Check if nothing is currently registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Dependents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependents").field("len", &self.len()).finish()
    }
}

// ============================================================================
// ReactiveCell
// ============================================================================

/// A single value whose reads are tracked and whose writes notify readers
///
/// Reads may be narrowed to a path of the value (see [`ReactiveCell::with_path`])
/// so that writes reporting unrelated paths leave the reader untouched.
pub struct ReactiveCell<T> {
    value: RefCell<T>,
    dependents: Dependents,
}

impl<T> ReactiveCell<T> {
    /// Wrap a value
    pub fn new(value: T) -> Self {
        Self {
            value: RefCell::new(value),
            dependents: Dependents::new(),
        }
    }

    /// Read the whole value, tracking the root path
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.with_path(&StatePath::root(), f)
    }

    /// Read the value, tracking only `path`
    pub fn with_path<R>(&self, path: &StatePath, f: impl FnOnce(&T) -> R) -> R {
        self.dependents.track(path);
        f(&self.value.borrow())
    }

    /// Read the value without tracking
    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.borrow())
    }

    /// Mutate the value; `f` reports the paths it changed, which are notified
    pub fn update(&self, f: impl FnOnce(&mut T) -> Vec<StatePath>) -> Vec<StatePath> {
        let changed = f(&mut self.value.borrow_mut());
        self.dependents.notify(&changed, Staleness::Dirty);
        changed
    }

    /// Fallible form of [`ReactiveCell::update`]; nothing is notified on error
    pub fn try_update(
        &self,
        f: impl FnOnce(&mut T) -> Result<Vec<StatePath>>,
    ) -> Result<Vec<StatePath>> {
        let changed = f(&mut self.value.borrow_mut())?;
        self.dependents.notify(&changed, Staleness::Dirty);
        Ok(changed)
    }

    /// The readers of this cell
    pub fn dependents(&self) -> &Dependents {
        &self.dependents
    }
}

impl<T: Clone> ReactiveCell<T> {
    /// Clone the value, tracking the root path
    pub fn get(&self) -> T {
        self.with(T::clone)
    }
}

impl<T: PartialEq> ReactiveCell<T> {
    /// Replace the value; readers are notified only if it changed
    pub fn set(&self, value: T) -> bool {
        let changed = self.update(|current| {
            if *current == value {
                Vec::new()
            } else {
                *current = value;
                vec![StatePath::root()]
            }
        });
        !changed.is_empty()
    }
}

impl<T: fmt::Debug> fmt::Debug for ReactiveCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveCell")
            .field("value", &self.value)
            .field("dependents", &self.dependents)
            .finish()
    }
}

// ============================================================================
// Computed
// ============================================================================

/// Freshness of a [`Computed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputedState {
    /// Cached value is current
    Clean,
    /// An upstream memo may have changed
    Check,
    /// A direct dependency changed
    Dirty,
}

type Evaluator<T> = Box<dyn Fn() -> Result<T>>;

/// A lazily evaluated, dependency-tracked, cached value
pub struct Computed<T> {
    label: String,
    evaluator: Evaluator<T>,
    value: RefCell<Option<T>>,
    state: Cell<ComputedState>,
    epoch: Cell<u64>,
    computing: Cell<bool>,
    upstream: RefCell<Vec<Rc<dyn Upstream>>>,
    dependents: Dependents,
    runs: Cell<u64>,
    me: Weak<Computed<T>>,
}

struct ComputingGuard<'a>(&'a Cell<bool>);

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl<T: Clone + PartialEq + 'static> Computed<T> {
    /// Create a memo; nothing is evaluated until the first read
    pub fn new(label: impl Into<String>, evaluator: impl Fn() -> Result<T> + 'static) -> Rc<Self> {
        let label = label.into();
        Rc::new_cyclic(|me| Self {
            label,
            evaluator: Box::new(evaluator),
            value: RefCell::new(None),
            state: Cell::new(ComputedState::Dirty),
            epoch: Cell::new(0),
            computing: Cell::new(false),
            upstream: RefCell::new(Vec::new()),
            dependents: Dependents::new(),
            runs: Cell::new(0),
            me: me.clone(),
        })
    }

    /// Read the value, recomputing only if a dependency changed
    pub fn get(&self) -> Result<T> {
        if self.computing.get() {
            return Err(Error::CyclicGetter(self.label.clone()));
        }
        self.refresh_value()?;
        if let Some(me) = self.me.upgrade() {
            record_upstream(me);
        }
        self.dependents.track(&StatePath::root());
        self.value
            .borrow()
            .clone()
            .ok_or_else(|| Error::InvalidOperation(format!("`{}` has no value", self.label)))
    }

    /// Label used in errors and logs
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current freshness
    pub fn state(&self) -> ComputedState {
        self.state.get()
    }

    /// How many times the evaluator has run
    pub fn runs(&self) -> u64 {
        self.runs.get()
    }

    /// The readers of this memo
    pub fn dependents(&self) -> &Dependents {
        &self.dependents
    }

    fn refresh_value(&self) -> Result<()> {
        if self.state.get() == ComputedState::Check {
            let upstream = self.upstream.borrow().clone();
            for up in upstream {
                if !up.refresh() {
                    self.state.set(ComputedState::Dirty);
                }
                if self.state.get() == ComputedState::Dirty {
                    break;
                }
            }
            if self.state.get() == ComputedState::Check {
                self.state.set(ComputedState::Clean);
            }
        }
        if self.state.get() == ComputedState::Dirty {
            self.recompute()?;
        }
        Ok(())
    }

    fn recompute(&self) -> Result<()> {
        self.computing.set(true);
        let guard = ComputingGuard(&self.computing);
        let epoch = self.epoch.get() + 1;
        self.epoch.set(epoch);
        let observer: Weak<dyn Observer> = self.me.clone();
        let (result, upstream) = observe_collecting(observer, epoch, || (self.evaluator)());
        drop(guard);

        *self.upstream.borrow_mut() = upstream;
        self.runs.set(self.runs.get() + 1);

        match result {
            Ok(value) => {
                let changed = self.value.borrow().as_ref() != Some(&value);
                *self.value.borrow_mut() = Some(value);
                self.state.set(ComputedState::Clean);
                if changed {
                    self.dependents.notify_all(Staleness::Dirty);
                }
                Ok(())
            }
            Err(err) => {
                self.state.set(ComputedState::Dirty);
                Err(err)
            }
        }
    }
}

impl<T: Clone + PartialEq + 'static> Observer for Computed<T> {
    fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    fn mark(&self, level: Staleness) {
        match (self.state.get(), level) {
            (ComputedState::Clean, Staleness::Check) => {
                self.state.set(ComputedState::Check);
                self.dependents.notify_all(Staleness::Check);
            }
            (ComputedState::Clean, Staleness::Dirty) => {
                self.state.set(ComputedState::Dirty);
                self.dependents.notify_all(Staleness::Check);
            }
            (ComputedState::Check, Staleness::Dirty) => {
                self.state.set(ComputedState::Dirty);
            }
            _ => {}
        }
    }
}

impl<T: Clone + PartialEq + 'static> Upstream for Computed<T> {
    fn refresh(&self) -> bool {
        if self.computing.get() {
            return false;
        }
        self.refresh_value().is_ok()
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("label", &self.label)
            .field("state", &self.state.get())
            .field("runs", &self.runs.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value_map, Value, ValueMap};

    struct Watcher {
        epoch: Cell<u64>,
        marks: RefCell<Vec<Staleness>>,
    }

    impl Observer for Watcher {
        fn epoch(&self) -> u64 {
            self.epoch.get()
        }

        fn mark(&self, level: Staleness) {
            self.marks.borrow_mut().push(level);
        }
    }

    fn watcher() -> Rc<Watcher> {
        Rc::new(Watcher {
            epoch: Cell::new(1),
            marks: RefCell::new(Vec::new()),
        })
    }

    #[test]
    fn test_cell_notifies_readers() {
        let cell = ReactiveCell::new(1i64);
        let p = watcher();
        let observer: Weak<dyn Observer> = Rc::downgrade(&p) as Weak<dyn Observer>;
        observe(observer, 1, || cell.get());

        assert!(cell.set(2));
        assert_eq!(*p.marks.borrow(), vec![Staleness::Dirty]);

        // same value: no notification
        assert!(!cell.set(2));
        assert_eq!(p.marks.borrow().len(), 1);
    }

    #[test]
    fn test_untracked_reads_do_not_register() {
        let cell = ReactiveCell::new(1i64);
        let p = watcher();
        let observer: Weak<dyn Observer> = Rc::downgrade(&p) as Weak<dyn Observer>;
        observe(observer, 1, || untracked(|| cell.get()));
        assert!(cell.dependents().is_empty());
        assert!(!is_tracking());
    }

    #[test]
    fn test_stale_epoch_is_pruned() {
        let cell = ReactiveCell::new(1i64);
        let p = watcher();
        let observer: Weak<dyn Observer> = Rc::downgrade(&p) as Weak<dyn Observer>;
        observe(observer, 1, || cell.get());
        p.epoch.set(2);

        cell.set(5);
        assert!(p.marks.borrow().is_empty());
        assert!(cell.dependents().is_empty());
    }

    #[test]
    fn test_path_granular_tracking() {
        let cell = ReactiveCell::new(value_map! { "a" => 1, "b" => 2 });
        let p = watcher();
        let observer: Weak<dyn Observer> = Rc::downgrade(&p) as Weak<dyn Observer>;
        observe(observer, 1, || cell.with_path(&StatePath::parse("a"), |m| m.get("a").cloned()));

        cell.update(|m| {
            m.insert("b".into(), Value::Int(3));
            vec![StatePath::parse("b")]
        });
        assert!(p.marks.borrow().is_empty());

        cell.update(|m| {
            m.insert("a".into(), Value::Int(3));
            vec![StatePath::parse("a")]
        });
        assert_eq!(p.marks.borrow().len(), 1);
    }

    #[test]
    fn test_computed_recomputes_only_on_change() {
        let cell = Rc::new(ReactiveCell::new(value_map! { "n" => 1, "other" => 0 }));
        let source = cell.clone();
        let doubled = Computed::new("doubled", move || {
            let n = source.with_path(&StatePath::parse("n"), |m| {
                m.get("n").and_then(Value::as_int).unwrap_or(0)
            });
            Ok(n * 2)
        });

        assert_eq!(doubled.get().unwrap(), 2);
        assert_eq!(doubled.get().unwrap(), 2);
        assert_eq!(doubled.runs(), 1);

        cell.update(|m: &mut ValueMap| {
            m.insert("other".into(), Value::Int(9));
            vec![StatePath::parse("other")]
        });
        assert_eq!(doubled.get().unwrap(), 2);
        assert_eq!(doubled.runs(), 1);

        cell.update(|m: &mut ValueMap| {
            m.insert("n".into(), Value::Int(5));
            vec![StatePath::parse("n")]
        });
        assert_eq!(doubled.state(), ComputedState::Dirty);
        assert_eq!(doubled.get().unwrap(), 10);
        assert_eq!(doubled.runs(), 2);
    }

    #[test]
    fn test_chained_computed_early_cutoff() {
        let cell = Rc::new(ReactiveCell::new(3i64));
        let source = cell.clone();
        let parity = Computed::new("parity", move || Ok(source.get() % 2));
        let upstream = parity.clone();
        let label = Computed::new("label", move || {
            Ok(if upstream.get()? == 0 { "even" } else { "odd" }.to_string())
        });

        assert_eq!(label.get().unwrap(), "odd");
        assert_eq!(label.runs(), 1);

        // 3 -> 5: parity recomputes but stays 1, so label is not re-run
        cell.set(5);
        assert_eq!(label.state(), ComputedState::Check);
        assert_eq!(label.get().unwrap(), "odd");
        assert_eq!(parity.runs(), 2);
        assert_eq!(label.runs(), 1);

        cell.set(6);
        assert_eq!(label.get().unwrap(), "even");
        assert_eq!(label.runs(), 2);
    }

    #[test]
    fn test_computed_cycle_is_an_error() {
        let slot: Rc<RefCell<Option<Rc<Computed<i64>>>>> = Rc::new(RefCell::new(None));
        let inner = slot.clone();
        let looped = Computed::new("looped", move || match inner.borrow().as_ref() {
            Some(me) => me.get(),
            None => Ok(0),
        });
        *slot.borrow_mut() = Some(looped.clone());

        let err = looped.get().unwrap_err();
        assert!(matches!(err, Error::CyclicGetter(name) if name == "looped"));
        slot.borrow_mut().take();
    }
}
