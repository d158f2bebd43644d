//! Observer hooks for devtools integration.
//!
//! An [`Observer`] installed with [`set_observer`] is called on node creation
//! and on every committed update. The hooks are purely informational: they
//! run outside of any graph borrow and must not mutate the graph re-entrantly
//! from inside a hook.

use std::any::Any;
use std::rc::Rc;

use crate::root::Root;
use crate::NodeId;

/// Inspection hooks invoked by the runtime. All methods default to no-ops,
/// so implementors only override what they care about.
pub trait Observer {
    /// A signal was created.
    fn signal_created(&self, _signal: NodeId) {}
    /// A signal committed a new value.
    fn signal_updated(&self, _signal: NodeId, _value: &dyn Any) {}
    /// A computed was created (not yet evaluated).
    fn computed_created(&self, _computed: NodeId) {}
    /// A computed committed a changed value.
    fn computed_updated(&self, _computed: NodeId, _value: &dyn Any) {}
    /// An effect was created.
    fn effect_created(&self, _effect: NodeId) {}
    /// An effect is about to run.
    fn effect_called(&self, _effect: NodeId) {}
}

/// Installs `observer` on the current root, replacing any previous one.
pub fn set_observer(observer: impl Observer + 'static) {
    *Root::global().observer.borrow_mut() = Some(Rc::new(observer));
}

/// Removes and returns the observer installed on the current root.
pub fn take_observer() -> Option<Rc<dyn Observer>> {
    Root::global().observer.borrow_mut().take()
}
