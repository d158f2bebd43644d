//! Reactive nodes.

use std::any::Any;
use std::rc::Rc;

use bitflags::bitflags;
use slotmap::new_key_type;

use crate::graph::EdgeId;

new_key_type! {
    /// Unique identifier of a node in the reactive graph.
    ///
    /// A `NodeId` is stable for the lifetime of the node but is recycled by the
    /// arena once the owning [`Root`](crate::RootHandle) is disposed. For a
    /// stable identifier across tooling snapshots, use
    /// [`ReadSignal::global_id`](crate::ReadSignal::global_id) instead.
    pub struct NodeId;
}

bitflags! {
    /// Status word of a reactive node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u8 {
        /// The cached value may be stale and must be re-validated on read.
        const OUTDATED = 1 << 0;
        /// The node has at least one live subscriber and therefore keeps
        /// live subscriptions on its own sources.
        const TRACKING = 1 << 1;
        /// The node's own callback is currently executing. Seeing this flag
        /// on a re-entrant read means the graph has a cycle.
        const RUNNING = 1 << 2;
        /// The node has already been visited by the current notify walk.
        const NOTIFIED = 1 << 3;
        /// The last compute call panicked; the message is cached in
        /// `ReactiveNode::error` until a clean recompute.
        const HAS_ERROR = 1 << 4;
        /// The node has been disposed.
        const DISPOSED = 1 << 5;
        /// Dispose automatically when the last subscriber unsubscribes.
        const AUTO_DISPOSE = 1 << 6;
    }
}

/// Which primitive a [`ReactiveNode`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    /// A mutable leaf cell. Always authoritative, never OUTDATED.
    Signal,
    /// A lazy, memoized derivation.
    Computed,
    /// An eager observer with a side-effecting callback.
    Effect,
}

/// Token returned by [`on_dispose`](crate::ReadSignal::on_dispose), used to
/// remove the callback again before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupKey(pub(crate) u64);

/// Erased equality predicate. Installed by the typed constructors so the
/// untyped core can compare values without knowing `T`.
pub(crate) type EqualsFn = Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>;

/// Erased compute callback. Computeds return their new value; effects return
/// `Rc::new(())`.
pub(crate) type ComputeFn = Box<dyn FnMut() -> Rc<dyn Any>>;

/// A node inside the reactive graph. One struct covers all three kinds; the
/// unused fields of a kind stay `None`.
pub(crate) struct ReactiveNode {
    pub kind: NodeKind,
    pub flags: NodeFlags,
    /// Current value. `None` until a signal is created or a computed has run.
    pub value: Option<Rc<dyn Any>>,
    /// Value before the most recent change.
    pub prev_value: Option<Rc<dyn Any>>,
    /// Value the node was created with (first computed value for computeds).
    pub initial_value: Option<Rc<dyn Any>>,
    /// Local version. Increases iff a write or recompute passes the equality
    /// check, or a compute errored.
    pub version: u64,
    /// Global version observed at the last refresh. Equal to the current
    /// global version means the cached value is definitely up to date.
    pub global_snapshot: u64,
    /// Stable public identifier, assigned in creation order per root.
    pub global_id: u64,
    /// Optional label surfaced in diagnostics.
    pub label: Option<&'static str>,
    pub equals: Option<EqualsFn>,
    pub callback: Option<ComputeFn>,
    /// Cached panic message while `HAS_ERROR` is set.
    pub error: Option<Rc<str>>,
    /// Entry point of the sources list (edges to nodes this node reads).
    /// Points at the head between evaluations and at the tail during the
    /// node's own run; see `graph::prepare_sources`.
    pub sources: Option<EdgeId>,
    /// Head of the targets list (edges to nodes that read this node).
    pub targets: Option<EdgeId>,
    /// Rolling marker letting the tracker find the edge from this node to the
    /// current evaluator in O(1).
    pub cursor: Option<EdgeId>,
    /// Callbacks to run exactly once on dispose, in insertion order.
    pub dispose_callbacks: Vec<(CleanupKey, Box<dyn FnOnce()>)>,
    pub next_cleanup_key: u64,
    /// Effect-only: cleanups registered during the last run, invoked before
    /// the next run and on dispose.
    pub effect_cleanups: Vec<Box<dyn FnOnce()>>,
}

impl ReactiveNode {
    /// Register a dispose callback, returning the key that removes it again.
    pub fn add_dispose_callback(&mut self, f: Box<dyn FnOnce()>) -> CleanupKey {
        let key = CleanupKey(self.next_cleanup_key);
        self.next_cleanup_key += 1;
        self.dispose_callbacks.push((key, f));
        key
    }

    pub fn remove_dispose_callback(&mut self, key: CleanupKey) {
        self.dispose_callbacks.retain(|(k, _)| *k != key);
    }

    pub fn new(kind: NodeKind, global_id: u64, global_version: u64) -> Self {
        Self {
            kind,
            flags: match kind {
                NodeKind::Signal => NodeFlags::empty(),
                // A fresh computed is outdated: nothing has been computed yet.
                NodeKind::Computed => NodeFlags::OUTDATED,
                // Effects are born with demand; their edges subscribe eagerly.
                NodeKind::Effect => NodeFlags::TRACKING,
            },
            value: None,
            prev_value: None,
            initial_value: None,
            version: 0,
            // Must differ from the current global version so that the first
            // refresh is not short-circuited.
            global_snapshot: global_version.wrapping_sub(1),
            global_id,
            label: None,
            equals: None,
            callback: None,
            error: None,
            sources: None,
            targets: None,
            cursor: None,
            dispose_callbacks: Vec::new(),
            next_cleanup_key: 1,
            effect_cleanups: Vec::new(),
        }
    }
}
