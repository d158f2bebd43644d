//! Error types.

use std::rc::Rc;

use thiserror::Error;

/// Errors surfaced by the reactive runtime.
///
/// The panicking accessors (`get`, `set`, ...) raise these as panics at the
/// access site; the `try_` variants return them instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A computed or effect read its own currently-running self, directly or
    /// transitively, or an effect kept re-dirtying its own dependencies past
    /// the per-tick flush limit.
    #[error("cyclic reactive dependency")]
    Cycle,
    /// A write was attempted on a disposed signal. Reads of disposed nodes
    /// are not errors; they return the frozen last value.
    #[error("cannot write to a disposed signal")]
    WriteAfterDispose,
    /// The compute callback panicked. The message is cached on the computed
    /// and returned on every read until a recompute succeeds.
    #[error("computed callback panicked: {0}")]
    Compute(Rc<str>),
}
