//! The dependency graph: pooled edges, dynamic read-tracking and the
//! notify/refresh propagation engine.
//!
//! Edges live in their own arena and are linked into two intrusive
//! doubly-linked lists at once: the dependent's *sources* list and the
//! source's *targets* list. An edge is only present in a targets list while
//! the dependent has live demand (`TRACKING`); until then the subscription is
//! deferred. Each evaluation re-discovers exactly the set of sources it
//! actually read: `prepare_sources` marks every existing edge as a removal
//! candidate, reads re-mark them as used (or append fresh edges at the tail),
//! and `cleanup_sources` drops whatever was not touched.

use std::any::Any;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use slotmap::{new_key_type, Key, SlotMap};
use smallvec::SmallVec;

use crate::node::{EqualsFn, NodeFlags, NodeKind, ReactiveNode};
use crate::root::{EvalGuard, Root};
use crate::{NodeId, ReactiveError};

new_key_type! {
    /// Identifier of an edge in the pooled edge arena.
    pub(crate) struct EdgeId;
}

/// Sentinel for "not used during the current run". Real source versions can
/// never reach it.
pub(crate) const UNUSED_VERSION: u64 = u64::MAX;

/// One edge per (source, dependent) pair currently in use.
pub(crate) struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    /// Source version recorded at the last observation, or [`UNUSED_VERSION`]
    /// while the edge is a removal candidate.
    pub version: u64,
    /// Position in the dependent's sources list.
    pub prev_source: Option<EdgeId>,
    pub next_source: Option<EdgeId>,
    /// Position in the source's targets list. Both `None` (and not at the
    /// head) while the dependent has no subscribers.
    pub prev_target: Option<EdgeId>,
    pub next_target: Option<EdgeId>,
    /// Cursor displaced from the source when this edge took its place; put
    /// back by `cleanup_sources` so nested evaluations stay consistent.
    pub rollback: Option<EdgeId>,
}

type Nodes = SlotMap<NodeId, ReactiveNode>;
type Edges = SlotMap<EdgeId, Edge>;
type EffectQueue = SmallVec<[NodeId; 8]>;

impl Root {
    /// Routes a read into the dependency graph. Called on every tracked read
    /// of `source`.
    ///
    /// Returns the edge from `source` to the current evaluator so the caller
    /// can record the observed version on it, or `None` when nothing is
    /// evaluating or the read is a duplicate within the same run.
    pub(crate) fn add_dependency(&self, source: NodeId) -> Option<EdgeId> {
        let target = self.eval_context.get();
        if target.is_null() {
            return None;
        }

        let mut nodes_ref = self.nodes.borrow_mut();
        let mut edges_ref = self.edges.borrow_mut();
        let nodes = &mut *nodes_ref;
        let edges = &mut *edges_ref;

        let cursor = nodes[source]
            .cursor
            .filter(|&edge| edges.get(edge).is_some_and(|e| e.target == target));
        match cursor {
            Some(edge) => {
                if edges[edge].version != UNUSED_VERSION {
                    // Duplicate read within the same run; already coalesced.
                    return None;
                }
                edges[edge].version = 0;
                // Move the edge to the most-recently-used end of the sources
                // list, unless it is already the tail.
                if let Some(next) = edges[edge].next_source {
                    let prev = edges[edge].prev_source;
                    edges[next].prev_source = prev;
                    if let Some(prev) = prev {
                        edges[prev].next_source = Some(next);
                    }
                    let tail = nodes[target].sources.expect("evaluator sources list is empty");
                    edges[edge].prev_source = Some(tail);
                    edges[edge].next_source = None;
                    edges[tail].next_source = Some(edge);
                    nodes[target].sources = Some(edge);
                }
                Some(edge)
            }
            None => {
                let rollback = nodes[source].cursor;
                let tail = nodes[target].sources;
                let edge = edges.insert(Edge {
                    source,
                    target,
                    version: 0,
                    prev_source: tail,
                    next_source: None,
                    prev_target: None,
                    next_target: None,
                    rollback,
                });
                if let Some(tail) = tail {
                    edges[tail].next_source = Some(edge);
                }
                nodes[target].sources = Some(edge);
                nodes[source].cursor = Some(edge);
                // Subscription is deferred until the evaluator itself has
                // subscribers.
                if nodes[target].flags.contains(NodeFlags::TRACKING) {
                    subscribe_edge(nodes, edges, source, edge);
                }
                Some(edge)
            }
        }
    }

    /// Marks every edge of `target` as a removal candidate and installs the
    /// per-source cursors for the upcoming run. Leaves the sources entry
    /// pointing at the tail so reads can resume from there.
    pub(crate) fn prepare_sources(&self, target: NodeId) {
        let mut nodes_ref = self.nodes.borrow_mut();
        let mut edges_ref = self.edges.borrow_mut();
        let nodes = &mut *nodes_ref;
        let edges = &mut *edges_ref;

        let mut e = nodes[target].sources;
        while let Some(edge) = e {
            let source = edges[edge].source;
            let rollback = nodes[source].cursor;
            if rollback.is_some() {
                edges[edge].rollback = rollback;
            }
            nodes[source].cursor = Some(edge);
            edges[edge].version = UNUSED_VERSION;
            match edges[edge].next_source {
                Some(next) => e = Some(next),
                None => {
                    nodes[target].sources = Some(edge);
                    break;
                }
            }
        }
    }

    /// Walks back from the tail after a run: frees every edge still carrying
    /// the removal candidate mark (unsubscribing its source side), restores
    /// the displaced cursors, and re-points the entry at the new head.
    ///
    /// Nodes whose auto-dispose fired while unsubscribing are pushed onto
    /// `pending`; the caller disposes them once all borrows are released.
    pub(crate) fn cleanup_sources(&self, target: NodeId, pending: &mut Vec<NodeId>) {
        let mut nodes_ref = self.nodes.borrow_mut();
        let mut edges_ref = self.edges.borrow_mut();
        let nodes = &mut *nodes_ref;
        let edges = &mut *edges_ref;

        let mut e = nodes[target].sources;
        let mut head = None;
        while let Some(edge) = e {
            let prev = edges[edge].prev_source;
            let source = edges[edge].source;
            let rollback = edges[edge].rollback;
            if edges[edge].version == UNUSED_VERSION {
                unsubscribe_edge(nodes, edges, source, edge, pending);
                if let Some(prev) = prev {
                    edges[prev].next_source = edges[edge].next_source;
                }
                if let Some(next) = edges[edge].next_source {
                    edges[next].prev_source = prev;
                }
                edges.remove(edge);
            } else {
                head = Some(edge);
                edges[edge].rollback = None;
            }
            nodes[source].cursor = rollback;
            e = prev;
        }
        nodes[target].sources = head;
    }

    /// Mark-only notification walk starting from the dependents of `id`.
    /// No compute runs here; effects enqueue themselves for the flush.
    pub(crate) fn notify_targets(&self, id: NodeId) {
        let mut nodes_ref = self.nodes.borrow_mut();
        let mut edges_ref = self.edges.borrow_mut();
        let mut queue = self.effect_queue.borrow_mut();
        let nodes = &mut *nodes_ref;
        let edges = &mut *edges_ref;

        let mut e = nodes[id].targets;
        while let Some(edge) = e {
            let target = edges[edge].target;
            let next = edges[edge].next_target;
            notify(nodes, edges, &mut queue, target);
            e = next;
        }
    }

    /// Did any source of `target` actually advance past the version recorded
    /// on its edge? Pulls computed sources up to date along the way.
    pub(crate) fn needs_recompute(&'static self, target: NodeId) -> bool {
        let list: Vec<(EdgeId, NodeId)> = {
            let nodes = self.nodes.borrow();
            let edges = self.edges.borrow();
            let mut out = Vec::new();
            let mut e = nodes[target].sources;
            while let Some(edge) = e {
                out.push((edge, edges[edge].source));
                e = edges[edge].next_source;
            }
            out
        };
        for (edge, source) in list {
            let recorded = self.edges.borrow()[edge].version;
            if self.nodes.borrow()[source].version != recorded {
                return true;
            }
            let kind = self.nodes.borrow()[source].kind;
            if kind == NodeKind::Computed && !self.refresh(source) {
                return true;
            }
            if self.nodes.borrow()[source].version != recorded {
                return true;
            }
        }
        false
    }

    /// Brings the cached value of a computed up to date, recomputing only if
    /// a source it actually read has changed. Returns `false` when the node
    /// is already running (a cycle).
    pub(crate) fn refresh(&'static self, id: NodeId) -> bool {
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            node.flags.remove(NodeFlags::NOTIFIED);
            if node.flags.contains(NodeFlags::RUNNING) {
                return false;
            }
            // A subscribed computed that was not marked outdated is kept up
            // to date by its subscriptions; nothing to do.
            if node.flags.contains(NodeFlags::TRACKING) && !node.flags.contains(NodeFlags::OUTDATED)
            {
                return true;
            }
            node.flags.remove(NodeFlags::OUTDATED);
            if node.flags.contains(NodeFlags::DISPOSED) {
                return true;
            }
            // Nothing anywhere has changed since the last refresh.
            if node.global_snapshot == self.global_version.get() {
                return true;
            }
            node.global_snapshot = self.global_version.get();
            node.flags.insert(NodeFlags::RUNNING);
        }

        let (version, has_error) = {
            let nodes = self.nodes.borrow();
            let node = &nodes[id];
            (node.version, node.flags.contains(NodeFlags::HAS_ERROR))
        };
        if version > 0 && !has_error && !self.needs_recompute(id) {
            self.nodes.borrow_mut()[id].flags.remove(NodeFlags::RUNNING);
            return true;
        }

        self.prepare_sources(id);
        let mut callback = self.nodes.borrow_mut()[id]
            .callback
            .take()
            .expect("computed node without callback");
        let result = {
            let _guard = EvalGuard::enter(self, id);
            catch_unwind(AssertUnwindSafe(|| callback()))
        };
        self.nodes.borrow_mut()[id].callback = Some(callback);

        let disposed_mid_run = self.nodes.borrow()[id].flags.contains(NodeFlags::DISPOSED);
        if !disposed_mid_run {
            match result {
                Ok(value) => self.commit_computed(id, value),
                Err(payload) => {
                    let message: Rc<str> = panic_message(&*payload).into();
                    let mut nodes = self.nodes.borrow_mut();
                    let node = &mut nodes[id];
                    node.error = Some(message);
                    node.flags.insert(NodeFlags::HAS_ERROR);
                    // Dependents must observe the failed run as a change.
                    node.version += 1;
                }
            }
        }

        let mut pending = Vec::new();
        self.cleanup_sources(id, &mut pending);
        self.nodes.borrow_mut()[id].flags.remove(NodeFlags::RUNNING);
        if disposed_mid_run {
            // Disposed from inside its own run: the in-flight result is
            // discarded and teardown happens now.
            self.teardown_node(id, &mut pending);
        }
        self.dispose_pending(pending);
        true
    }

    /// Store a freshly computed value, shifting current to previous when the
    /// equality predicate reports a change.
    fn commit_computed(&self, id: NodeId, value: Rc<dyn Any>) {
        let (old, equals, version, has_error) = {
            let nodes = self.nodes.borrow();
            let node = &nodes[id];
            (
                node.value.clone(),
                node.equals.clone(),
                node.version,
                node.flags.contains(NodeFlags::HAS_ERROR),
            )
        };
        let first = version == 0 || old.is_none();
        let changed = first
            || has_error
            || match (&old, &equals) {
                (Some(old), Some(equals)) => !safe_eq(equals, &**old, &*value),
                _ => true,
            };
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            node.flags.remove(NodeFlags::HAS_ERROR);
            node.error = None;
            if first {
                node.value = Some(Rc::clone(&value));
                node.prev_value = Some(Rc::clone(&value));
                node.initial_value = Some(Rc::clone(&value));
                node.version = 1;
            } else if changed {
                node.prev_value = node.value.take();
                node.value = Some(Rc::clone(&value));
                node.version += 1;
            }
        }
        if changed && !first {
            self.with_observer(|observer| observer.computed_updated(id, &*value));
        }
    }

    /// Re-runs the compute callback unconditionally, bypassing the equality
    /// predicate, and notifies dependents of the result.
    pub(crate) fn force_recompute(&'static self, id: NodeId) {
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            if node.flags.contains(NodeFlags::DISPOSED) {
                return;
            }
            if node.flags.contains(NodeFlags::RUNNING) {
                panic!("{}", ReactiveError::Cycle);
            }
            node.flags.insert(NodeFlags::RUNNING);
        }

        self.prepare_sources(id);
        let mut callback = self.nodes.borrow_mut()[id]
            .callback
            .take()
            .expect("computed node without callback");
        let result = {
            let _guard = EvalGuard::enter(self, id);
            catch_unwind(AssertUnwindSafe(|| callback()))
        };
        self.nodes.borrow_mut()[id].callback = Some(callback);

        match result {
            Ok(value) => {
                {
                    let mut nodes = self.nodes.borrow_mut();
                    let node = &mut nodes[id];
                    node.flags.remove(NodeFlags::HAS_ERROR);
                    node.error = None;
                    if node.version == 0 || node.value.is_none() {
                        node.value = Some(Rc::clone(&value));
                        node.prev_value = Some(Rc::clone(&value));
                        node.initial_value = Some(Rc::clone(&value));
                    } else {
                        node.prev_value = node.value.take();
                        node.value = Some(Rc::clone(&value));
                    }
                    node.version += 1;
                }
                self.with_observer(|observer| observer.computed_updated(id, &*value));
            }
            Err(payload) => {
                let message: Rc<str> = panic_message(&*payload).into();
                let mut nodes = self.nodes.borrow_mut();
                let node = &mut nodes[id];
                node.error = Some(message);
                node.flags.insert(NodeFlags::HAS_ERROR);
                node.version += 1;
            }
        }

        let mut pending = Vec::new();
        self.cleanup_sources(id, &mut pending);
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            node.flags.remove(NodeFlags::RUNNING);
            // The bumped global version below must not invalidate this node:
            // its value is the freshest thing in the graph.
            node.global_snapshot = self.global_version.get() + 1;
        }
        self.global_version.set(self.global_version.get() + 1);
        self.dispose_pending(pending);
        self.start_batch();
        self.notify_targets(id);
        self.end_batch();
    }

    /// Overwrite the cached value in place, keeping identity and edges.
    pub(crate) fn override_value(&'static self, id: NodeId, value: Rc<dyn Any>) {
        // Settle the node first so the override is applied to a consistent
        // graph; a cached compute error is cleared by the overwrite.
        let _ = self.read_node(id, false);
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            if node.flags.contains(NodeFlags::DISPOSED) {
                return;
            }
            node.flags.remove(NodeFlags::HAS_ERROR);
            node.error = None;
            node.prev_value = Some(Rc::clone(&value));
            if node.initial_value.is_none() {
                node.initial_value = Some(Rc::clone(&value));
            }
            node.value = Some(value);
            node.version += 1;
            node.global_snapshot = self.global_version.get() + 1;
        }
        self.global_version.set(self.global_version.get() + 1);
        self.start_batch();
        self.notify_targets(id);
        self.end_batch();
    }

    /// The single read path shared by every readable node kind.
    pub(crate) fn read_node(
        &'static self,
        id: NodeId,
        track: bool,
    ) -> Result<Rc<dyn Any>, ReactiveError> {
        let (kind, disposed) = {
            let nodes = self.nodes.borrow();
            let node = &nodes[id];
            (node.kind, node.flags.contains(NodeFlags::DISPOSED))
        };

        if disposed {
            let nodes = self.nodes.borrow();
            let node = &nodes[id];
            tracing::warn!(
                global_id = node.global_id,
                label = node.label.unwrap_or_default(),
                "read of a disposed node returns its frozen last value"
            );
            if node.flags.contains(NodeFlags::HAS_ERROR) {
                let message = node.error.as_ref().expect("HAS_ERROR without cached message");
                return Err(ReactiveError::Compute(Rc::clone(message)));
            }
            let value = node.value.as_ref().expect("disposed node was never evaluated");
            return Ok(Rc::clone(value));
        }

        if kind == NodeKind::Computed {
            if self.nodes.borrow()[id].flags.contains(NodeFlags::RUNNING) {
                return Err(ReactiveError::Cycle);
            }
            let edge = if track { self.add_dependency(id) } else { None };
            if !self.refresh(id) {
                return Err(ReactiveError::Cycle);
            }
            if let Some(edge) = edge {
                let version = self.nodes.borrow()[id].version;
                self.edges.borrow_mut()[edge].version = version;
            }
            let nodes = self.nodes.borrow();
            let node = &nodes[id];
            if node.flags.contains(NodeFlags::HAS_ERROR) {
                let message = node.error.as_ref().expect("HAS_ERROR without cached message");
                return Err(ReactiveError::Compute(Rc::clone(message)));
            }
            Ok(Rc::clone(node.value.as_ref().expect("computed has a value after refresh")))
        } else {
            let edge = if track { self.add_dependency(id) } else { None };
            let nodes = self.nodes.borrow();
            let node = &nodes[id];
            if let Some(edge) = edge {
                self.edges.borrow_mut()[edge].version = node.version;
            }
            Ok(Rc::clone(node.value.as_ref().expect("signal has a value")))
        }
    }

    /// Dispose a node and everything its teardown cascades into.
    pub(crate) fn dispose_node(&'static self, id: NodeId) {
        self.dispose_pending(vec![id]);
    }

    /// Drain a worklist of nodes to dispose. Teardown of one node can queue
    /// more (auto-dispose of upstream computeds losing their last
    /// subscriber).
    pub(crate) fn dispose_pending(&'static self, mut pending: Vec<NodeId>) {
        while let Some(id) = pending.pop() {
            {
                let mut nodes = self.nodes.borrow_mut();
                let Some(node) = nodes.get_mut(id) else {
                    continue;
                };
                if node.flags.contains(NodeFlags::DISPOSED) {
                    continue;
                }
                node.flags.insert(NodeFlags::DISPOSED);
                // A node disposed from inside its own run finishes teardown
                // when the run ends.
                if node.flags.contains(NodeFlags::RUNNING) {
                    continue;
                }
            }
            self.teardown_node(id, &mut pending);
        }
    }

    /// Runs cleanups, detaches all source edges and fires the dispose
    /// callbacks. The DISPOSED flag is expected to be set already.
    pub(crate) fn teardown_node(&self, id: NodeId, pending: &mut Vec<NodeId>) {
        let cleanups = mem::take(&mut self.nodes.borrow_mut()[id].effect_cleanups);
        for cleanup in cleanups {
            cleanup();
        }

        {
            let mut nodes_ref = self.nodes.borrow_mut();
            let mut edges_ref = self.edges.borrow_mut();
            let nodes = &mut *nodes_ref;
            let edges = &mut *edges_ref;

            let mut e = nodes[id].sources;
            while let Some(edge) = e {
                let source = edges[edge].source;
                let next = edges[edge].next_source;
                unsubscribe_edge(nodes, edges, source, edge, pending);
                edges.remove(edge);
                e = next;
            }
            nodes[id].sources = None;
            nodes[id].callback = None;
        }

        let callbacks = mem::take(&mut self.nodes.borrow_mut()[id].dispose_callbacks);
        for (_, callback) in callbacks {
            callback();
        }
    }
}

/// Recursive mark phase. Computeds mark themselves outdated and pass the
/// notification on; effects schedule themselves exactly once.
fn notify(nodes: &mut Nodes, edges: &mut Edges, queue: &mut EffectQueue, id: NodeId) {
    if nodes[id].flags.contains(NodeFlags::NOTIFIED) {
        return;
    }
    match nodes[id].kind {
        NodeKind::Effect => {
            nodes[id].flags.insert(NodeFlags::NOTIFIED);
            queue.push(id);
        }
        NodeKind::Computed => {
            nodes[id]
                .flags
                .insert(NodeFlags::OUTDATED | NodeFlags::NOTIFIED);
            let mut e = nodes[id].targets;
            while let Some(edge) = e {
                let target = edges[edge].target;
                let next = edges[edge].next_target;
                notify(nodes, edges, queue, target);
                e = next;
            }
        }
        NodeKind::Signal => {}
    }
}

/// Link `edge` into the targets list of `source`, promoting an unobserved
/// computed source into tracking mode first.
fn subscribe_edge(nodes: &mut Nodes, edges: &mut Edges, source: NodeId, edge: EdgeId) {
    if nodes[source].targets.is_none() && nodes[source].kind == NodeKind::Computed {
        // Lazy subscription promotion: a computed only attaches to its
        // upstream once demand materializes.
        nodes[source]
            .flags
            .insert(NodeFlags::OUTDATED | NodeFlags::TRACKING);
        let mut e = nodes[source].sources;
        while let Some(id) = e {
            let upstream = edges[id].source;
            let next = edges[id].next_source;
            subscribe_edge(nodes, edges, upstream, id);
            e = next;
        }
    }
    if nodes[source].targets != Some(edge) && edges[edge].prev_target.is_none() {
        edges[edge].next_target = nodes[source].targets;
        if let Some(head) = nodes[source].targets {
            edges[head].prev_target = Some(edge);
        }
        nodes[source].targets = Some(edge);
    }
}

/// Unlink `edge` from the targets list of `source`. A computed losing its
/// last subscriber detaches from its own upstream; nodes flagged for
/// auto-dispose are pushed onto `pending`.
fn unsubscribe_edge(
    nodes: &mut Nodes,
    edges: &mut Edges,
    source: NodeId,
    edge: EdgeId,
    pending: &mut Vec<NodeId>,
) {
    if nodes[source].targets.is_none() {
        return;
    }
    let prev = edges[edge].prev_target;
    let next = edges[edge].next_target;
    if let Some(prev) = prev {
        edges[prev].next_target = next;
        edges[edge].prev_target = None;
    }
    if let Some(next) = next {
        edges[next].prev_target = prev;
        edges[edge].next_target = None;
    }
    if nodes[source].targets == Some(edge) {
        nodes[source].targets = next;
    }
    if nodes[source].targets.is_none() {
        if nodes[source].kind == NodeKind::Computed {
            nodes[source].flags.remove(NodeFlags::TRACKING);
            let mut e = nodes[source].sources;
            while let Some(id) = e {
                let upstream = edges[id].source;
                let next = edges[id].next_source;
                unsubscribe_edge(nodes, edges, upstream, id, pending);
                e = next;
            }
        }
        if nodes[source].flags.contains(NodeFlags::AUTO_DISPOSE)
            && !nodes[source].flags.contains(NodeFlags::DISPOSED)
        {
            pending.push(source);
        }
    }
}

/// Compare two values with a user-provided predicate. A panicking comparator
/// counts as "unequal".
pub(crate) fn safe_eq(equals: &EqualsFn, a: &dyn Any, b: &dyn Any) -> bool {
    catch_unwind(AssertUnwindSafe(|| (**equals)(a, b))).unwrap_or(false)
}

/// Best-effort extraction of a panic payload into a message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}
