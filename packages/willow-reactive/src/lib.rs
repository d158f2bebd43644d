//! Fine-grained reactive primitives with push-pull change propagation.
//!
//! The runtime maintains a graph of [`Signal`]s (mutable leaf cells),
//! [`Computed`]s (lazy, memoized derivations) and effects (eager observers).
//! Dependencies are discovered dynamically: every read inside an evaluating
//! computed or effect becomes an edge, and every run re-discovers the set of
//! edges from scratch, so conditional reads subscribe to exactly what they
//! used.
//!
//! Propagation is two-phase. A write eagerly *marks* all transitive
//! dependents as outdated and schedules any reachable effects, without
//! running anything. Values are then *pulled* lazily: a read (or an effect
//! flush) refreshes a node only if a dependency it actually read has changed,
//! using per-edge versions and a global version counter. This gives
//! glitch-freedom (no observer ever sees a half-updated graph) and minimal
//! recomputation (diamonds refresh each node at most once per change).
//!
//! # Example
//! ```
//! use willow_reactive::*;
//!
//! let _ = create_root(|| {
//!     let count = create_signal(1);
//!     let double = create_computed(move || count.get() * 2);
//!     create_effect(move || println!("double = {}", double.get()));
//!     count.set(5); // prints "double = 10"
//! });
//! ```

#![warn(missing_docs)]

mod computeds;
mod effects;
mod error;
mod graph;
mod node;
mod observer;
mod root;
mod signals;
mod utils;

pub use computeds::*;
pub use effects::*;
pub use error::*;
pub use node::{CleanupKey, NodeId};
pub use observer::*;
pub use root::{batch, create_root, untrack, RootHandle};
pub use signals::*;
pub use utils::*;
