//! Computeds (lazy, memoized derived values).

use std::any::Any;
use std::fmt;
use std::fmt::Formatter;
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::Rc;

use crate::node::NodeKind;
use crate::root::Root;
use crate::signals::erase_equals;
use crate::ReadSignal;

/// A lazy, memoized derivation of other reactive values.
///
/// The compute closure is not called on creation; the first read triggers the
/// first run. Reads inside the closure are tracked dynamically, so each run
/// re-discovers exactly the set of dependencies it actually used. A computed
/// only recomputes when a dependency it read has changed; diamonds in the
/// graph refresh each node at most once per change.
///
/// Every `Computed` is also a [`ReadSignal`] by deref, so the whole read
/// surface (`get`, `with`, `subscribe`, `dispose`, ...) is available.
pub struct Computed<T: 'static>(pub(crate) ReadSignal<T>);

/// Creates a [`Computed`]: a cached value derived from whatever reactive
/// nodes `f` reads.
///
/// A write to any of those nodes marks the computed outdated; the next read
/// re-validates it, re-running `f` only if a dependency actually changed.
///
/// Dependents are only notified when the output itself changes under
/// `PartialEq`; use [`create_computed_with`] for a custom comparison.
///
/// # Example
/// ```
/// # use willow_reactive::*;
/// # create_root(|| {
/// let items = create_signal(vec!["a", "b"]);
/// let count = create_computed(move || items.with(|v| v.len()));
///
/// assert_eq!(count.get(), 2);
/// items.update(|v| v.push("c"));
/// assert_eq!(count.get(), 3);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_computed<T: PartialEq + 'static>(f: impl FnMut() -> T + 'static) -> Computed<T> {
    create_computed_with(f, PartialEq::eq)
}

/// Creates a memoized computation with a custom equality predicate.
///
/// `equals` decides whether a freshly computed value counts as a change for
/// dependents. Use `|_, _| false` for a computed that always propagates.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_computed_with<T: 'static>(
    mut f: impl FnMut() -> T + 'static,
    equals: impl Fn(&T, &T) -> bool + 'static,
) -> Computed<T> {
    let root = Root::global();
    let id = root.create_node(NodeKind::Computed);
    {
        let mut nodes = root.nodes.borrow_mut();
        let node = &mut nodes[id];
        node.callback = Some(Box::new(move || Rc::new(f()) as Rc<dyn Any>));
        node.equals = Some(erase_equals(equals));
    }
    root.with_observer(|observer| observer.computed_created(id));
    Computed(ReadSignal {
        id,
        root,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    })
}

impl<T> Computed<T> {
    /// Force a re-evaluation: the cached value is first brought up to date,
    /// then the compute closure runs once more, bypassing the equality
    /// predicate. Dependents observe the forced run as a change.
    pub fn recompute(self) {
        // Refresh (and re-register against any outer evaluator) first so the
        // forced run starts from a consistent graph; a cached error does not
        // stop the retry.
        let _ = self.0.root.read_node(self.0.id, true);
        self.0.root.force_recompute(self.0.id);
    }

    /// Testing hook: overwrite the cached current and previous values with
    /// `value`, keeping the node's identity and its edges intact. Dependents
    /// are notified.
    pub fn override_with(self, value: T) {
        self.0.root.override_value(self.0.id, Rc::new(value));
    }

    /// Attach a debug label surfaced in diagnostics.
    pub fn with_label(self, label: &'static str) -> Self {
        let _ = self.0.with_label(label);
        self
    }

    /// Dispose this computed automatically when it loses its last
    /// subscriber.
    pub fn with_auto_dispose(self) -> Self {
        let _ = self.0.with_auto_dispose();
        self
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Computed<T> {}

impl<T> Deref for Computed<T> {
    type Target = ReadSignal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: PartialEq> PartialEq for Computed<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for Computed<T> {}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Computed<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Computed<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn computed_is_lazy() {
        let _ = create_root(|| {
            let runs = Rc::new(Cell::new(0));
            let state = create_signal(1);
            let double = create_computed({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    state.get() * 2
                }
            });

            // Creation does not evaluate.
            assert_eq!(runs.get(), 0);
            assert_eq!(double.get(), 2);
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn computed_only_runs_once_per_change() {
        let _ = create_root(|| {
            let runs = Rc::new(Cell::new(0));
            let state = create_signal(0);
            let double = create_computed({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    state.get() * 2
                }
            });

            assert_eq!(double.get(), 0);
            assert_eq!(double.get(), 0);
            assert_eq!(runs.get(), 1);

            state.set(2);
            assert_eq!(double.get(), 4);
            assert_eq!(double.get(), 4);
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn chained_computeds_stay_lazy_until_pulled() {
        let _ = create_root(|| {
            let base = create_signal(2);
            let mid_runs = Rc::new(Cell::new(0));
            let top_runs = Rc::new(Cell::new(0));
            let mid = create_computed({
                let mid_runs = Rc::clone(&mid_runs);
                move || {
                    mid_runs.set(mid_runs.get() + 1);
                    base.get() * 10
                }
            });
            let top = create_computed({
                let top_runs = Rc::clone(&top_runs);
                move || {
                    top_runs.set(top_runs.get() + 1);
                    mid.get() + 1
                }
            });

            // Nothing in the chain runs until the head is pulled.
            assert_eq!((mid_runs.get(), top_runs.get()), (0, 0));
            assert_eq!(top.get(), 21);
            assert_eq!((mid_runs.get(), top_runs.get()), (1, 1));

            // A write only marks; with no subscribers it runs nothing.
            base.set(3);
            assert_eq!((mid_runs.get(), top_runs.get()), (1, 1));

            // Pulling the head refreshes the whole chain exactly once.
            assert_eq!(top.get(), 31);
            assert_eq!((mid_runs.get(), top_runs.get()), (2, 2));
            assert_eq!(top.get(), 31);
            assert_eq!((mid_runs.get(), top_runs.get()), (2, 2));
        });
    }

    #[test]
    fn unrelated_writes_do_not_recompute() {
        let _ = create_root(|| {
            let runs = Rc::new(Cell::new(0));
            let state = create_signal(1);
            let other = create_signal(10);
            let double = create_computed({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    state.get() * 2
                }
            });

            assert_eq!(double.get(), 2);
            other.set(11);
            assert_eq!(double.get(), 2);
            // The write bumped the global version, but no dependency of
            // `double` advanced, so the cached value was revalidated without
            // a recompute.
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn dynamic_dependencies() {
        let _ = create_root(|| {
            let runs = Rc::new(Cell::new(0));
            let flag = create_signal(true);
            let x = create_signal(10);
            let y = create_signal(20);
            let select = create_computed({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    if flag.get() {
                        x.get()
                    } else {
                        y.get()
                    }
                }
            });

            assert_eq!(select.get(), 10);
            assert_eq!(runs.get(), 1);

            // `y` was not read: changing it must not re-evaluate.
            y.set(99);
            assert_eq!(select.get(), 10);
            assert_eq!(runs.get(), 1);

            flag.set(false);
            assert_eq!(select.get(), 99);
            assert_eq!(runs.get(), 2);

            // After the switch, `x` is no longer a dependency.
            x.set(0);
            assert_eq!(select.get(), 99);
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn equal_result_does_not_notify_dependents() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let parity = create_computed(move || state.get() % 2);
            let counter = create_signal(0);
            create_effect(move || {
                parity.track();
                counter.set(counter.get_untracked() + 1);
            });
            assert_eq!(counter.get(), 1);
            assert_eq!(parity.version(), 1);

            // 3 % 2 == 1 % 2: the computed re-runs but its value is equal, so
            // the version stays put and the effect is not re-run.
            state.set(3);
            assert_eq!(parity.get(), 1);
            assert_eq!(parity.version(), 1);
            assert_eq!(counter.get(), 1);

            state.set(2);
            assert_eq!(parity.get(), 0);
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn equal_write_skips_recompute_entirely() {
        let _ = create_root(|| {
            let runs = Rc::new(Cell::new(0));
            let state = create_signal(1);
            let parity = create_computed({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    state.get() % 2
                }
            });

            assert_eq!(parity.get(), 1);
            state.set(1); // equality-suppressed write
            assert_eq!(parity.get(), 1);
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    #[should_panic(expected = "cyclic reactive dependency")]
    fn cycle_is_detected() {
        let _ = create_root(|| {
            let a: Rc<Cell<Option<Computed<i32>>>> = Rc::new(Cell::new(None));
            let b = create_computed({
                let a = Rc::clone(&a);
                move || a.get().unwrap().get() + 1
            });
            let a_computed = create_computed(move || b.get() + 1);
            a.set(Some(a_computed));
            let _ = a_computed.get();
        });
    }

    #[test]
    fn try_get_reports_cycle_as_error() {
        let _ = create_root(|| {
            let a: Rc<Cell<Option<Computed<i32>>>> = Rc::new(Cell::new(None));
            let b = create_computed({
                let a = Rc::clone(&a);
                move || a.get().unwrap().get() + 1
            });
            let a_computed = create_computed(move || b.get() + 1);
            a.set(Some(a_computed));
            assert!(matches!(
                a_computed.try_get(),
                Err(ReactiveError::Compute(_))
            ));
        });
    }

    #[test]
    fn compute_errors_are_cached_until_recovery() {
        let _ = create_root(|| {
            let runs = Rc::new(Cell::new(0));
            let fail = create_signal(true);
            let fallible = create_computed({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    if fail.get() {
                        panic!("boom");
                    }
                    42
                }
            });

            assert!(matches!(fallible.try_get(), Err(ReactiveError::Compute(_))));
            let version = fallible.version();
            assert_eq!(version, 1);

            // Nothing changed: the cached error is returned without a
            // re-run.
            assert!(matches!(fallible.try_get(), Err(ReactiveError::Compute(_))));
            assert_eq!(runs.get(), 1);

            fail.set(false);
            assert_eq!(fallible.try_get(), Ok(42));
            assert_eq!(runs.get(), 2);
            assert!(fallible.version() > version);
        });
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn get_rethrows_cached_compute_error() {
        let _ = create_root(|| {
            let fallible: Computed<i32> = create_computed(|| panic!("boom"));
            let _ = fallible.try_get();
            let _ = fallible.get();
        });
    }

    #[test]
    fn erroring_computed_counts_as_changed_for_dependents() {
        let _ = create_root(|| {
            let fail = create_signal(false);
            let fallible = create_computed(move || {
                if fail.get() {
                    panic!("boom");
                }
                1
            });
            assert_eq!(fallible.get(), 1);
            let version = fallible.version();

            fail.set(true);
            assert!(fallible.try_get().is_err());
            assert!(fallible.version() > version);
        });
    }

    #[test]
    fn auto_dispose_fires_on_last_unsubscribe() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_computed(move || state.get() * 2).with_auto_dispose();
            let unsub = double.subscribe(|_| {});
            assert!(!double.is_disposed());

            unsub.dispose();
            assert!(double.is_disposed());
        });
    }

    #[test]
    fn disposed_computed_returns_frozen_value() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_computed(move || state.get() * 2);
            assert_eq!(double.get(), 2);

            double.dispose();
            state.set(10);
            assert_eq!(double.get(), 2);
        });
    }

    #[test]
    fn recompute_bypasses_equality() {
        let _ = create_root(|| {
            let runs = Rc::new(Cell::new(0));
            let state = create_signal(1);
            let parity = create_computed({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    state.get() % 2
                }
            });
            let counter = create_signal(0);
            create_effect(move || {
                parity.track();
                counter.set(counter.get_untracked() + 1);
            });
            assert_eq!(runs.get(), 1);
            assert_eq!(counter.get(), 1);

            parity.recompute();
            // The forced run produced an equal value, but dependents are
            // notified anyway.
            assert_eq!(runs.get(), 2);
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn recompute_twice_is_stable() {
        let _ = create_root(|| {
            let state = create_signal(3);
            let double = create_computed(move || state.get() * 2);
            double.recompute();
            let first = double.get();
            double.recompute();
            assert_eq!(double.get(), first);
        });
    }

    #[test]
    fn recompute_recovers_from_cached_error() {
        let _ = create_root(|| {
            let fail = Rc::new(Cell::new(true));
            let fallible = create_computed({
                let fail = Rc::clone(&fail);
                move || {
                    if fail.get() {
                        panic!("boom");
                    }
                    7
                }
            });
            assert!(fallible.try_get().is_err());

            fail.set(false);
            fallible.recompute();
            assert_eq!(fallible.try_get(), Ok(7));
        });
    }

    #[test]
    fn override_with_replaces_value_and_notifies() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_computed(move || state.get() * 2);
            let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
            let _handle = double.subscribe({
                let seen = Rc::clone(&seen);
                move |value| seen.borrow_mut().push(*value)
            });
            let id = double.global_id();

            double.override_with(99);
            assert_eq!(double.get(), 99);
            assert_eq!(double.previous_value(), 99);
            assert_eq!(double.global_id(), id);
            assert_eq!(*seen.borrow(), vec![2, 99]);

            // The next upstream change recomputes as usual.
            state.set(5);
            assert_eq!(double.get(), 10);
        });
    }

    #[test]
    fn computed_previous_and_initial_values() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_computed(move || state.get() * 2);

            assert_eq!(double.previous_value(), 2);
            assert_eq!(double.initial_value(), 2);

            state.set(5);
            assert_eq!(double.get(), 10);
            assert_eq!(double.previous_value(), 2);
            assert_eq!(double.initial_value(), 2);

            state.set(7);
            assert_eq!(double.get(), 14);
            assert_eq!(double.previous_value(), 10);
            assert_eq!(double.initial_value(), 2);
        });
    }

    #[test]
    fn always_propagating_computed() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let parity = create_computed_with(move || state.get() % 2, |_, _| false);
            let counter = create_signal(0);
            create_effect(move || {
                parity.track();
                counter.set(counter.get_untracked() + 1);
            });
            assert_eq!(counter.get(), 1);

            // 1 % 2 == 3 % 2, but the predicate says nothing is ever equal.
            state.set(3);
            assert_eq!(counter.get(), 2);
        });
    }
}
