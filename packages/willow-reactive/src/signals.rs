//! Signals: the mutable leaf cells of the graph.

use std::any::Any;
use std::fmt;
use std::fmt::Formatter;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{AddAssign, Deref, DivAssign, MulAssign, RemAssign, SubAssign};
use std::rc::Rc;

use crate::graph::safe_eq;
use crate::node::{CleanupKey, EqualsFn, NodeFlags, NodeKind};
use crate::root::{Root, MAX_FLUSH_ITERATIONS};
use crate::{create_computed, create_effect, Computed, EffectHandle, NodeId, ReactiveError};

/// A read-only handle to a reactive value.
///
/// "Read-only" constrains the handle, not the value: whoever holds the
/// writable [`Signal`] can keep changing it, and every `ReadSignal` pointing
/// at the same node observes those changes. Both [`Signal`] and [`Computed`]
/// deref to this type, so the whole read surface (`get`, `with`, `subscribe`,
/// `dispose`, ...) is shared.
///
/// # Example
/// ```
/// # use willow_reactive::*;
/// # create_root(|| {
/// let temperature = create_signal(20);
/// // Hand out a handle that cannot write.
/// let readout: ReadSignal<i32> = *temperature;
/// assert_eq!(readout.get(), 20);
///
/// temperature.set(25);
/// assert_eq!(readout.get(), 25);
/// # });
/// ```
pub struct ReadSignal<T: 'static> {
    pub(crate) id: NodeId,
    pub(crate) root: &'static Root,
    /// Keep track of where the signal was created for diagnostics.
    #[cfg(debug_assertions)]
    pub(crate) created_at: &'static std::panic::Location<'static>,
    pub(crate) _phantom: PhantomData<T>,
}

/// A reactive value that can be read and written to.
///
/// This is the writable analog of [`ReadSignal`]. See [`create_signal`] for
/// more information.
pub struct Signal<T: 'static>(pub(crate) ReadSignal<T>);

/// Create a new [`Signal`].
///
/// A signal is a mutable cell at the leaves of the reactive graph: writes to
/// it are where every propagation starts, and any computed or effect that
/// read it re-runs as needed.
///
/// Writes are equality-suppressed: setting a signal to a value equal to the
/// current one (under `PartialEq`, or the predicate given to
/// [`create_signal_with`]) is a no-op that notifies nothing.
///
/// # Example
/// ```rust
/// # use willow_reactive::*;
/// # create_root(|| {
/// let signal = create_signal(1);
/// // Accessing the signal inside the closure below tracks it automatically,
/// // so `double` updates whenever `signal` is changed.
/// let double = create_computed(move || signal.get() * 2);
/// assert_eq!(double.get(), 2);
/// signal.set(2);
/// assert_eq!(double.get(), 4);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_signal<T: PartialEq + 'static>(value: T) -> Signal<T> {
    create_signal_with(value, PartialEq::eq)
}

/// Create a new [`Signal`] with a custom equality predicate.
///
/// `equals` decides whether a write actually changes the value. Use
/// `|_, _| false` for a signal that always notifies. A panicking predicate is
/// treated as "unequal".
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_signal_with<T: 'static>(
    value: T,
    equals: impl Fn(&T, &T) -> bool + 'static,
) -> Signal<T> {
    let root = Root::global();
    let id = root.create_node(NodeKind::Signal);
    let value: Rc<dyn Any> = Rc::new(value);
    {
        let mut nodes = root.nodes.borrow_mut();
        let node = &mut nodes[id];
        node.value = Some(Rc::clone(&value));
        node.prev_value = Some(Rc::clone(&value));
        node.initial_value = Some(value);
        node.equals = Some(erase_equals(equals));
    }
    root.with_observer(|observer| observer.signal_created(id));
    Signal(ReadSignal {
        id,
        root,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    })
}

/// Erase a typed equality predicate so the untyped core can call it.
/// Mismatched types compare as unequal.
pub(crate) fn erase_equals<T: 'static>(equals: impl Fn(&T, &T) -> bool + 'static) -> EqualsFn {
    Rc::new(move |a: &dyn Any, b: &dyn Any| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => equals(a, b),
            _ => false,
        }
    })
}

impl<T> ReadSignal<T> {
    /// Read the current value, panicking on a cycle or a cached compute
    /// error.
    #[cfg_attr(debug_assertions, track_caller)]
    fn read(self, track: bool) -> Rc<dyn Any> {
        match self.root.read_node(self.id, track) {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// The untracked (peek) version of [`get`](ReadSignal::get): returns the
    /// current value without registering a dependency.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// The untracked (peek) version of [`get_clone`](ReadSignal::get_clone).
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Returns a copy of the current value. Inside an evaluating computed or
    /// effect, the read also registers this node as a dependency.
    ///
    /// Requires `T: Copy`; reach for [`get_clone`](ReadSignal::get_clone) or
    /// [`with`](ReadSignal::with) otherwise.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.with(|value| *value)
    }

    /// Returns a clone of the current value. Inside an evaluating computed
    /// or effect, the read also registers this node as a dependency.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.with(Clone::clone)
    }

    /// Get the value of the signal without panicking on cycles or cached
    /// compute errors.
    pub fn try_get(self) -> Result<T, ReactiveError>
    where
        T: Clone,
    {
        let value = self.root.read_node(self.id, true)?;
        Ok(value.downcast_ref::<T>().expect("wrong signal type").clone())
    }

    /// Borrow the value of the signal, tracking it as a dependency.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        let value = self.read(true);
        f(value.downcast_ref().expect("wrong signal type"))
    }

    /// Borrow the value of the signal without tracking it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        let value = self.read(false);
        f(value.downcast_ref().expect("wrong signal type"))
    }

    /// Register this node as a dependency of the current evaluation without
    /// looking at its value. The `get`/`with` family already does this on
    /// every read.
    pub fn track(self) {
        let _ = self.root.read_node(self.id, true);
    }

    /// The value before the most recent change. Equal to the current value
    /// until the first change.
    ///
    /// # Panics
    /// Panics if the node has never produced a value (a computed whose first
    /// run failed).
    pub fn previous_value(self) -> T
    where
        T: Clone,
    {
        self.settle();
        let value = self.root.nodes.borrow()[self.id]
            .prev_value
            .clone()
            .expect("node has not produced a value yet");
        value.downcast_ref::<T>().expect("wrong signal type").clone()
    }

    /// The value the node started with: the creation value for signals, the
    /// first computed value for computeds.
    ///
    /// # Panics
    /// Panics if the node has never produced a value.
    pub fn initial_value(self) -> T
    where
        T: Clone,
    {
        self.settle();
        let value = self.root.nodes.borrow()[self.id]
            .initial_value
            .clone()
            .expect("node has not produced a value yet");
        value.downcast_ref::<T>().expect("wrong signal type").clone()
    }

    /// Make sure a computed has evaluated at least once so the value
    /// accessors below observe a settled node.
    fn settle(self) {
        let (kind, disposed) = {
            let nodes = self.root.nodes.borrow();
            let node = &nodes[self.id];
            (node.kind, node.flags.contains(NodeFlags::DISPOSED))
        };
        if kind == NodeKind::Computed && !disposed {
            let _ = self.root.read_node(self.id, false);
        }
    }

    /// Local version of the node. Increases exactly when a write or
    /// recompute passes the equality predicate (or a compute fails).
    pub fn version(self) -> u64 {
        self.root.nodes.borrow()[self.id].version
    }

    /// Stable identifier of this node, assigned in creation order.
    pub fn global_id(self) -> u64 {
        self.root.nodes.borrow()[self.id].global_id
    }

    /// The debug label, if one was attached with
    /// [`with_label`](ReadSignal::with_label).
    pub fn label(self) -> Option<&'static str> {
        self.root.nodes.borrow()[self.id].label
    }

    /// Returns `true` once [`dispose`](ReadSignal::dispose) has run.
    pub fn is_disposed(self) -> bool {
        self.root.nodes.borrow()[self.id]
            .flags
            .contains(NodeFlags::DISPOSED)
    }

    /// Attach a debug label surfaced in diagnostics.
    pub fn with_label(self, label: &'static str) -> Self {
        self.root.nodes.borrow_mut()[self.id].label = Some(label);
        self
    }

    /// Dispose this node automatically when it loses its last subscriber.
    pub fn with_auto_dispose(self) -> Self {
        self.root.nodes.borrow_mut()[self.id]
            .flags
            .insert(NodeFlags::AUTO_DISPOSE);
        self
    }

    /// Installs an effect that reads this node and passes the value to `f`,
    /// starting immediately. The returned handle is the cleanup token: call
    /// [`EffectHandle::dispose`] to unsubscribe.
    pub fn subscribe(self, mut f: impl FnMut(&T) + 'static) -> EffectHandle {
        create_effect(move || self.with(|value| f(value)))
    }

    /// Registers `f` to run when this node is disposed. Callbacks run exactly
    /// once, in insertion order. If the node is already disposed, `f` runs
    /// immediately.
    ///
    /// The returned key removes the callback again via
    /// [`remove_on_dispose`](ReadSignal::remove_on_dispose).
    pub fn on_dispose(self, f: impl FnOnce() + 'static) -> CleanupKey {
        let mut nodes = self.root.nodes.borrow_mut();
        let node = &mut nodes[self.id];
        if node.flags.contains(NodeFlags::DISPOSED) {
            drop(nodes);
            f();
            return CleanupKey(0);
        }
        node.add_dispose_callback(Box::new(f))
    }

    /// Removes a dispose callback registered with
    /// [`on_dispose`](ReadSignal::on_dispose) before it fires.
    pub fn remove_on_dispose(self, key: CleanupKey) {
        self.root.nodes.borrow_mut()[self.id].remove_dispose_callback(key);
    }

    /// Disposes the node: runs its dispose callbacks and detaches it from
    /// the graph. Reads afterwards return the frozen last value (with a
    /// diagnostic warning); writes fail. Idempotent.
    pub fn dispose(self) {
        self.root.dispose_node(self.id);
    }

    /// Derive a new computed from this node.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn map<U: PartialEq + 'static>(
        self,
        mut f: impl FnMut(&T) -> U + 'static,
    ) -> Computed<U> {
        create_computed(move || self.with(&mut f))
    }

    /// Serialize the current value without tracking it.
    #[cfg(feature = "serde")]
    pub fn to_json(self) -> Result<serde_json::Value, serde_json::Error>
    where
        T: serde::Serialize,
    {
        self.with_untracked(serde_json::to_value)
    }
}

impl<T> Signal<T> {
    /// Set a new value and automatically update any dependents.
    ///
    /// # Panics
    /// Panics if the signal has been disposed, or when an effect scheduled by
    /// this write keeps re-dirtying its own dependencies (a cycle).
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(self, new: T) {
        if let Err(err) = self.write(new, false) {
            panic!("{err}{}", self.created_at_message());
        }
    }

    /// Fallible version of [`set`](Signal::set).
    pub fn try_set(self, new: T) -> Result<(), ReactiveError> {
        self.write(new, false)
    }

    /// Set a new value unconditionally, bypassing the equality predicate.
    ///
    /// # Panics
    /// Panics if the signal has been disposed.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn force_set(self, new: T) {
        if let Err(err) = self.write(new, true) {
            panic!("{err}{}", self.created_at_message());
        }
    }

    /// Set a new value and return the previous one.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace(self, new: T) -> T
    where
        T: Clone,
    {
        let old = self.get_clone_untracked();
        self.set(new);
        old
    }

    /// Replace the value with [`Default::default`], returning the old value.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take(self) -> T
    where
        T: Clone + Default,
    {
        self.replace(T::default())
    }

    /// Mutate the value in place and update any dependents. The write still
    /// goes through the equality predicate, so a mutation that leaves the
    /// value equal notifies nothing.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update<U>(self, f: impl FnOnce(&mut T) -> U) -> U
    where
        T: Clone,
    {
        let mut value = self.get_clone_untracked();
        let ret = f(&mut value);
        self.set(value);
        ret
    }

    /// Set a new value computed from the current one.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn(self, f: impl FnOnce(&T) -> T) {
        let new = self.with_untracked(f);
        self.set(new);
    }

    /// Attach a debug label surfaced in diagnostics.
    pub fn with_label(self, label: &'static str) -> Self {
        let _ = self.0.with_label(label);
        self
    }

    /// Dispose this signal automatically when it loses its last subscriber.
    pub fn with_auto_dispose(self) -> Self {
        let _ = self.0.with_auto_dispose();
        self
    }

    fn created_at_message(self) -> String {
        #[cfg(debug_assertions)]
        return format!(" (signal created at {})", self.0.created_at);
        #[cfg(not(debug_assertions))]
        return String::new();
    }

    /// The shared write path: equality gate, value shift, version bumps and
    /// the notify-then-flush sequence.
    fn write(self, new: T, force: bool) -> Result<(), ReactiveError> {
        let root = self.0.root;
        {
            let nodes = root.nodes.borrow();
            if nodes[self.0.id].flags.contains(NodeFlags::DISPOSED) {
                return Err(ReactiveError::WriteAfterDispose);
            }
        }
        // An effect that keeps writing its own dependencies would flush
        // forever; detect and raise instead.
        if root.flush_iteration.get() > MAX_FLUSH_ITERATIONS {
            return Err(ReactiveError::Cycle);
        }
        if !force {
            let (old, equals) = {
                let nodes = root.nodes.borrow();
                let node = &nodes[self.0.id];
                (
                    node.value.clone().expect("signal has a value"),
                    node.equals.clone(),
                )
            };
            if let Some(equals) = equals {
                if safe_eq(&equals, &*old, &new) {
                    return Ok(());
                }
            }
        }
        let value: Rc<dyn Any> = Rc::new(new);
        {
            let mut nodes = root.nodes.borrow_mut();
            let node = &mut nodes[self.0.id];
            node.prev_value = node.value.take();
            node.value = Some(Rc::clone(&value));
            node.version += 1;
        }
        root.global_version.set(root.global_version.get() + 1);
        root.with_observer(|observer| observer.signal_updated(self.0.id, &*value));
        root.start_batch();
        root.notify_targets(self.0.id);
        root.end_batch();
        Ok(())
    }
}

// Hand-written Clone/Copy: a derive would demand the same of `T`, and the
// handles are plain ids.
impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Signal<T> {}

impl<T: Default + PartialEq> Default for Signal<T> {
    fn default() -> Self {
        create_signal(Default::default())
    }
}

// Comparisons and hashing go through the current value, not the handle.
impl<T: PartialEq> PartialEq for ReadSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for ReadSignal<T> {}
impl<T: PartialOrd> PartialOrd for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.with(|value| other.with(|other| value.partial_cmp(other)))
    }
}
impl<T: Ord> Ord for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.with(|value| other.with(|other| value.cmp(other)))
    }
}
impl<T: Hash> Hash for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T: PartialEq> PartialEq for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for Signal<T> {}
impl<T: Hash> Hash for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T> Deref for Signal<T> {
    type Target = ReadSignal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Formatting reads the value (tracked, like any other read).
impl<T: fmt::Debug> fmt::Debug for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T: fmt::Display> fmt::Display for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

// Serialization goes through the current value; deserializing produces a
// fresh signal.
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for ReadSignal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Signal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de> + PartialEq> serde::Deserialize<'de> for Signal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(create_signal(T::deserialize(deserializer)?))
    }
}

impl<T: AddAssign<Rhs> + Clone + 'static, Rhs> AddAssign<Rhs> for Signal<T> {
    fn add_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this += rhs);
    }
}
impl<T: SubAssign<Rhs> + Clone + 'static, Rhs> SubAssign<Rhs> for Signal<T> {
    fn sub_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this -= rhs);
    }
}
impl<T: MulAssign<Rhs> + Clone + 'static, Rhs> MulAssign<Rhs> for Signal<T> {
    fn mul_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this *= rhs);
    }
}
impl<T: DivAssign<Rhs> + Clone + 'static, Rhs> DivAssign<Rhs> for Signal<T> {
    fn div_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this /= rhs);
    }
}
impl<T: RemAssign<Rhs> + Clone + 'static, Rhs> RemAssign<Rhs> for Signal<T> {
    fn rem_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this %= rhs);
    }
}
