//! [`Root`] of the reactive runtime.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::mem;
use std::panic::resume_unwind;
use std::rc::Rc;

use slotmap::{Key, SlotMap};
use smallvec::SmallVec;

use crate::graph::{Edge, EdgeId};
use crate::node::{NodeFlags, NodeKind, ReactiveNode};
use crate::observer::Observer;
use crate::NodeId;

/// Number of flush rounds a single tick may take before the runtime assumes
/// an effect keeps re-dirtying its own dependencies and raises
/// [`ReactiveError::Cycle`](crate::ReactiveError::Cycle).
pub(crate) const MAX_FLUSH_ITERATIONS: u32 = 100;

/// Shared state of one reactive graph: the node and edge arenas plus the
/// bookkeeping the propagation engine needs (tracker slot, version counter,
/// batch depth, effect queue).
///
/// One `Root` serves one graph. It is allocated once and leaked so that the
/// `Copy` handles can carry a `&'static` reference to it; `reinit` releases
/// everything the graph accumulated, so only the empty shell itself stays
/// behind.
pub(crate) struct Root {
    /// All the nodes created in this `Root`.
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    /// The pooled edge arena. Every edge is linked into both a sources list
    /// and (while demand exists) a targets list; removal unlinks from both.
    pub edges: RefCell<SlotMap<EdgeId, Edge>>,
    /// The node whose callback is currently evaluating, or the null key.
    /// Reads route through this slot to become dependency edges.
    pub eval_context: Cell<NodeId>,
    /// Bumped by every value-changing write. Computeds snapshot this to
    /// short-circuit refreshes within one tick.
    pub global_version: Cell<u64>,
    /// Nesting depth of `batch` calls plus implicit per-write batches.
    pub batch_depth: Cell<u32>,
    /// Flush rounds taken by the current tick; guards against effect loops.
    pub flush_iteration: Cell<u32>,
    /// Effects notified during the current batch, in notification order.
    pub effect_queue: RefCell<SmallVec<[NodeId; 8]>>,
    /// Source of stable public node ids.
    pub next_global_id: Cell<u64>,
    /// Devtools observer, if one is installed.
    pub observer: RefCell<Option<Rc<dyn Observer>>>,
}

thread_local! {
    /// Root the current thread is operating on, if any.
    static ACTIVE_ROOT: Cell<Option<&'static Root>> = const { Cell::new(None) };
}

impl Root {
    /// The active root. Panics when called outside of [`create_root`] or
    /// [`RootHandle::run_in`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn global() -> &'static Root {
        ACTIVE_ROOT
            .with(|root| root.get())
            .expect("no reactive root is active")
    }

    /// Replace the active root, returning whichever one was installed
    /// before.
    pub fn set_global(root: Option<&'static Root>) -> Option<&'static Root> {
        ACTIVE_ROOT.with(|r| r.replace(root))
    }

    /// Allocate a fresh, empty root and leak it to obtain the `&'static`
    /// reference the handles need.
    pub fn new_static() -> &'static Self {
        let this = Self {
            nodes: RefCell::new(SlotMap::default()),
            edges: RefCell::new(SlotMap::default()),
            eval_context: Cell::new(NodeId::null()),
            global_version: Cell::new(0),
            batch_depth: Cell::new(0),
            flush_iteration: Cell::new(0),
            effect_queue: RefCell::new(SmallVec::new()),
            next_global_id: Cell::new(1),
            observer: RefCell::new(None),
        };
        Box::leak(Box::new(this))
    }

    /// Disposes of all the resources held on by this root and resets the
    /// state. Every node still alive is disposed (running its dispose
    /// callbacks) in creation order.
    pub fn reinit(&'static self) {
        let mut alive: Vec<(u64, NodeId)> = self
            .nodes
            .borrow()
            .iter()
            .map(|(id, node)| (node.global_id, id))
            .collect();
        alive.sort_unstable();
        for (_, id) in alive {
            self.dispose_node(id);
        }

        let _ = self.nodes.take();
        let _ = self.edges.take();
        let _ = self.effect_queue.take();
        let _ = self.observer.take();
        self.eval_context.set(NodeId::null());
        self.global_version.set(0);
        self.batch_depth.set(0);
        self.flush_iteration.set(0);
        self.next_global_id.set(1);
    }

    /// Insert a fresh node of `kind` and assign its stable id.
    pub fn create_node(&self, kind: NodeKind) -> NodeId {
        let global_id = self.next_global_id.get();
        self.next_global_id.set(global_id + 1);
        self.nodes
            .borrow_mut()
            .insert(ReactiveNode::new(kind, global_id, self.global_version.get()))
    }

    /// Invoke the installed observer, if any, outside of any graph borrow.
    pub fn with_observer(&self, f: impl FnOnce(&dyn Observer)) {
        let observer = self.observer.borrow().clone();
        if let Some(observer) = observer {
            f(&*observer);
        }
    }

    /// Opens a batch. Writes inside a batch mark dependents but defer the
    /// effect flush until the outermost batch closes.
    pub fn start_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    /// Closes a batch. Closing the outermost batch drains the effect queue,
    /// re-running every scheduled effect whose dependencies actually changed.
    /// The first effect panic is re-raised once the queue has drained.
    pub fn end_batch(&'static self) {
        if self.batch_depth.get() > 1 {
            self.batch_depth.set(self.batch_depth.get() - 1);
            return;
        }

        let mut first_error: Option<Box<dyn Any + Send>> = None;
        loop {
            let queue = {
                let mut queue = self.effect_queue.borrow_mut();
                if queue.is_empty() {
                    break;
                }
                mem::take(&mut *queue)
            };
            self.flush_iteration.set(self.flush_iteration.get() + 1);

            for id in queue {
                {
                    let mut nodes = self.nodes.borrow_mut();
                    let node = &mut nodes[id];
                    node.flags.remove(NodeFlags::NOTIFIED);
                    if node.flags.contains(NodeFlags::DISPOSED) {
                        continue;
                    }
                }
                // Pull before re-running: the effect only runs if a
                // dependency it actually read advanced.
                if !self.needs_recompute(id) {
                    continue;
                }
                if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    self.run_effect(id);
                })) {
                    first_error.get_or_insert(payload);
                }
            }
        }
        self.flush_iteration.set(0);
        self.batch_depth.set(self.batch_depth.get() - 1);

        if let Some(payload) = first_error {
            resume_unwind(payload);
        }
    }
}

/// Restores the previous eval context on drop, so nested evaluations keep
/// strict LIFO save/restore on every exit path.
pub(crate) struct EvalGuard {
    root: &'static Root,
    prev: NodeId,
}

impl EvalGuard {
    pub fn enter(root: &'static Root, id: NodeId) -> Self {
        Self {
            root,
            prev: root.eval_context.replace(id),
        }
    }
}

impl Drop for EvalGuard {
    fn drop(&mut self) {
        self.root.eval_context.set(self.prev);
    }
}

/// Reference to a reactive root, used to re-enter the graph after
/// [`create_root`] has returned or to tear the whole graph down.
#[derive(Clone, Copy)]
pub struct RootHandle {
    root: &'static Root,
}

impl RootHandle {
    /// Tears down every node created under this root, running dispose
    /// callbacks along the way, and resets the runtime to an empty state.
    pub fn dispose(&self) {
        self.root.reinit();
    }

    /// Makes this root current for the duration of `f`, then restores
    /// whatever root was current before.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        let outer = Root::set_global(Some(self.root));
        let value = f();
        Root::set_global(outer);
        value
    }
}

/// Creates a new reactive root and runs `f` with it installed. The returned
/// [`RootHandle`] can re-enter the graph ([`run_in`](RootHandle::run_in)) or
/// [`dispose`](RootHandle::dispose) it.
///
/// # Example
/// ```rust
/// # use willow_reactive::*;
/// let root = create_root(|| {
///     let signal = create_signal(123);
///     assert_eq!(signal.get(), 123);
/// });
/// root.dispose();
/// ```
#[must_use = "dispose the root to release its nodes"]
pub fn create_root(f: impl FnOnce()) -> RootHandle {
    let root = Root::new_static();
    #[cfg(not(target_arch = "wasm32"))]
    {
        /// Pointer wrapper that is only ever stored, never dereferenced.
        struct RawRoot(#[allow(dead_code)] *const Root);
        // SAFETY: the pointer is inert; it exists so the registry below keeps
        // leaked roots reachable.
        unsafe impl Send for RawRoot {}

        /// Registry of leaked roots. Keeping them reachable stops leak
        /// checkers from flagging the intentional `Box::leak` in
        /// `Root::new_static`.
        static LEAKED_ROOTS: std::sync::Mutex<Vec<RawRoot>> = std::sync::Mutex::new(Vec::new());
        LEAKED_ROOTS
            .lock()
            .unwrap()
            .push(RawRoot(root as *const Root));
    }

    let outer = Root::set_global(Some(root));
    f();
    Root::set_global(outer);
    RootHandle { root }
}

/// Groups several writes into one propagation tick.
///
/// Inside `f`, writes still mark their dependents and reads still observe
/// fully fresh values; only the effect flush is held back. Nested batches
/// coalesce, and scheduled effects run once each when the outermost batch
/// closes.
///
/// # Example
///
/// ```
/// # use willow_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let double = create_computed(move || state.get() * 2);
/// batch(move || {
///     state.set(2);
///     assert_eq!(double.get(), 4);
/// });
/// # });
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    root.start_batch();
    let value = f();
    root.end_batch();
    value
}

/// Runs `f` with dependency tracking suspended: reads inside do not register
/// edges on the surrounding evaluation.
///
/// # Example
///
/// ```
/// # use willow_reactive::*;
/// # create_root(|| {
/// let hits = create_signal(0);
/// let label = create_signal("count");
/// let report = create_computed(move || {
///     format!("{}: {}", untrack(|| label.get()), hits.get())
/// });
/// assert_eq!(report.get_clone(), "count: 0");
///
/// // The label was read untracked, so changing it re-runs nothing.
/// label.set("clicks");
/// assert_eq!(report.get_clone(), "count: 0");
/// # });
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    let guard = EvalGuard::enter(root, NodeId::null());
    let ret = f();
    drop(guard);
    ret
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn reads_inside_a_batch_observe_fresh_values() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_computed(move || state.get() * 2);
            batch(move || {
                state.set(2);
                assert_eq!(double.get(), 4);
            });
            assert_eq!(double.get(), 4);
        });
    }

    #[test]
    fn writes_inside_a_batch_flush_once() {
        let _ = create_root(|| {
            let width = create_signal(2);
            let height = create_signal(3);
            let runs = Rc::new(Cell::new(0));
            create_effect({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    let _area = width.get() * height.get();
                }
            });
            assert_eq!(runs.get(), 1);

            // Unbatched writes flush one by one.
            width.set(4);
            height.set(5);
            assert_eq!(runs.get(), 3);

            // Batched writes coalesce into a single run at the boundary.
            batch(|| {
                width.set(6);
                assert_eq!(runs.get(), 3);
                height.set(7);
                assert_eq!(runs.get(), 3);
            });
            assert_eq!(runs.get(), 4);
        });
    }

    #[test]
    fn nested_batches_coalesce() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let runs = Rc::new(Cell::new(0));
            create_effect({
                let runs = Rc::clone(&runs);
                move || {
                    state.track();
                    runs.set(runs.get() + 1);
                }
            });
            assert_eq!(runs.get(), 1);
            batch(|| {
                batch(|| {
                    state.set(1);
                    state.set(2);
                });
                assert_eq!(runs.get(), 1);
            });
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn untracked_reads_do_not_subscribe() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let runs = Rc::new(Cell::new(0));
            create_effect({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    untrack(|| {
                        let _ = state.get();
                    });
                }
            });
            assert_eq!(runs.get(), 1);
            state.set(2);
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn root_dispose_runs_dispose_callbacks() {
        let fired = Rc::new(Cell::new(0));
        let root = create_root({
            let fired = Rc::clone(&fired);
            move || {
                let state = create_signal(1);
                state.on_dispose(move || fired.set(fired.get() + 1));
            }
        });
        assert_eq!(fired.get(), 0);
        root.dispose();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn run_in_reenters_root() {
        let root = create_root(|| {});
        let value = root.run_in(|| {
            let state = create_signal(41);
            state.set(42);
            state.get()
        });
        assert_eq!(value, 42);
    }
}
