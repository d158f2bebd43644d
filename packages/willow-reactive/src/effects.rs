//! Effects: eager observers at the edge of the graph.

use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::Rc;

use slotmap::Key;

use crate::node::{CleanupKey, NodeFlags, NodeKind};
use crate::root::{EvalGuard, Root};
use crate::{NodeId, ReactiveError};

/// Handle to a running effect: the cleanup token returned by
/// [`create_effect`] and [`subscribe`](crate::ReadSignal::subscribe).
pub struct EffectHandle {
    pub(crate) id: NodeId,
    pub(crate) root: &'static Root,
}

impl fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EffectHandle").field(&self.id).finish()
    }
}

impl Clone for EffectHandle {
    fn clone(&self) -> Self {
        *self
    }
}
impl Copy for EffectHandle {}

impl EffectHandle {
    /// Stops the effect: pending cleanups run, all subscriptions are removed
    /// and the effect is never scheduled again. Disposing an effect from
    /// inside its own run is safe; teardown happens when the run ends.
    pub fn dispose(self) {
        self.root.dispose_node(self.id);
    }

    /// Returns `true` once the effect has been disposed.
    pub fn is_disposed(self) -> bool {
        self.root.nodes.borrow()[self.id]
            .flags
            .contains(NodeFlags::DISPOSED)
    }

    /// Registers `f` to run when the effect is disposed; see
    /// [`ReadSignal::on_dispose`](crate::ReadSignal::on_dispose).
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

    /// Removes a dispose callback before it fires.
    pub fn remove_on_dispose(self, key: CleanupKey) {
        self.root.nodes.borrow_mut()[self.id].remove_dispose_callback(key);
    }
}

/// Creates an eager observer: `f` runs once immediately, subscribing to
/// every node it reads, and re-runs whenever one of those changes.
///
/// Re-runs happen synchronously, after the triggering write (or the
/// outermost [`batch`](crate::batch)) finishes marking dependents. Like
/// computeds, every run re-discovers the dependency set from scratch, so a
/// branch that was not taken is not subscribed.
///
/// A panic inside the closure propagates to whoever triggered the run; the
/// effect itself stays alive unless the panic happened during this initial
/// run.
///
/// # Example
/// ```
/// # use willow_reactive::*;
/// # create_root(|| {
/// let name = create_signal("world".to_string());
///
/// create_effect(move || {
///     println!("hello, {}", name.get_clone());
/// });
/// // Prints "hello, world"
///
/// name.set("willow".to_string());
/// // Prints "hello, willow"
/// # });
/// ```
///
/// Effects are for pushing values out of the graph (logging, rendering, IO).
/// State derived from other state belongs in a
/// [`create_computed`](crate::create_computed), not in an effect that writes
/// signals.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_effect(f: impl FnMut() + 'static) -> EffectHandle {
    let root = Root::global();
    let id = root.create_node(NodeKind::Effect);
    root.nodes.borrow_mut()[id].callback = Some(Box::new({
        let mut f = f;
        move || {
            f();
            Rc::new(()) as Rc<dyn Any>
        }
    }));
    root.with_observer(|observer| observer.effect_created(id));

    let handle = EffectHandle { id, root };
    // The initial run discovers the source set. If it panics, the half-built
    // effect is torn down before the panic continues.
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| root.run_effect(id))) {
        root.dispose_node(id);
        resume_unwind(payload);
    }
    handle
}

/// Registers a cleanup on the currently running effect. The cleanup is
/// invoked before the effect's next run and when the effect is disposed.
///
/// Outside of a running effect this is a no-op (with a diagnostic warning).
///
/// # Example
/// ```
/// # use willow_reactive::*;
/// # create_root(|| {
/// let connect = create_signal(0);
/// create_effect(move || {
///     let id = connect.get();
///     on_cleanup(move || println!("closing connection {id}"));
/// });
/// connect.set(1); // Prints "closing connection 0"
/// # });
/// ```
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    let root = Root::global();
    let context = root.eval_context.get();
    let is_effect = !context.is_null()
        && root.nodes.borrow()[context].kind == NodeKind::Effect;
    if is_effect {
        root.nodes.borrow_mut()[context]
            .effect_cleanups
            .push(Box::new(f));
    } else {
        tracing::warn!("on_cleanup called outside of a running effect; ignored");
    }
}

impl Root {
    /// Runs an effect: previous cleanups first, then the body under the
    /// tracker with the usual prepare/cleanup-sources discipline. Panics in
    /// the body are re-raised after the graph is back in a consistent state.
    pub(crate) fn run_effect(&'static self, id: NodeId) {
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            if node.flags.contains(NodeFlags::RUNNING) {
                panic!("{}", ReactiveError::Cycle);
            }
            node.flags.insert(NodeFlags::RUNNING);
        }

        let cleanups = mem::take(&mut self.nodes.borrow_mut()[id].effect_cleanups);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| {
            for cleanup in cleanups {
                cleanup();
            }
        })) {
            // A panicking cleanup poisons the effect: tear it down and
            // re-raise.
            self.nodes.borrow_mut()[id].flags.remove(NodeFlags::RUNNING);
            self.dispose_node(id);
            resume_unwind(payload);
        }

        self.prepare_sources(id);
        self.start_batch();
        self.with_observer(|observer| observer.effect_called(id));
        let mut callback = self.nodes.borrow_mut()[id]
            .callback
            .take()
            .expect("effect node without callback");
        let result = {
            let _guard = EvalGuard::enter(self, id);
            catch_unwind(AssertUnwindSafe(|| {
                let _ = callback();
            }))
        };
        self.nodes.borrow_mut()[id].callback = Some(callback);

        let mut pending = Vec::new();
        self.cleanup_sources(id, &mut pending);
        self.nodes.borrow_mut()[id].flags.remove(NodeFlags::RUNNING);
        if self.nodes.borrow()[id].flags.contains(NodeFlags::DISPOSED) {
            // Disposed from inside its own run: finish the teardown now.
            self.teardown_node(id, &mut pending);
        }
        self.dispose_pending(pending);
        self.end_batch();
        if let Err(payload) = result {
            resume_unwind(payload);
        }
    }
}
