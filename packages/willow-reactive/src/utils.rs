//! Small helpers on top of the core primitives.

use crate::{Computed, ReadSignal, Signal};

/// Anything that can be registered as a dependency of the current
/// evaluation: the three node handles, and tuples of them for passing
/// several dependencies to [`on`] at once.
pub trait Trackable {
    /// Register the dependency (or all of them, for tuples).
    fn _track(&self);
}

impl<T> Trackable for Signal<T> {
    fn _track(&self) {
        self.track();
    }
}

impl<T> Trackable for ReadSignal<T> {
    fn _track(&self) {
        self.track();
    }
}

impl<T> Trackable for Computed<T> {
    fn _track(&self) {
        self.track();
    }
}

macro_rules! impl_trackable_deps_for_tuple {
    ($($T:tt),*) => {
        paste::paste! {
            impl<$($T,)*> Trackable for ($($T,)*)
            where
                $($T: Trackable,)*
            {
                fn _track(&self) {
                    let ($([<$T:lower>],)*) = self;
                    $(
                        [<$T:lower>]._track();
                    )*
                }
            }
        }
    }
}

impl_trackable_deps_for_tuple!(A);
impl_trackable_deps_for_tuple!(A, B);
impl_trackable_deps_for_tuple!(A, B, C);
impl_trackable_deps_for_tuple!(A, B, C, D);
impl_trackable_deps_for_tuple!(A, B, C, D, E);
impl_trackable_deps_for_tuple!(A, B, C, D, E, F);
impl_trackable_deps_for_tuple!(A, B, C, D, E, F, G);
impl_trackable_deps_for_tuple!(A, B, C, D, E, F, G, H);
impl_trackable_deps_for_tuple!(A, B, C, D, E, F, G, H, I);
impl_trackable_deps_for_tuple!(A, B, C, D, E, F, G, H, I, J);
impl_trackable_deps_for_tuple!(A, B, C, D, E, F, G, H, I, J, K);
impl_trackable_deps_for_tuple!(A, B, C, D, E, F, G, H, I, J, K, L);

/// Wraps a callback so that `deps` (one node, or a tuple of nodes) are
/// always tracked before it runs.
///
/// Useful when the callback peeks instead of reading, or reads
/// conditionally: the subscription set stays fixed to `deps` no matter which
/// path a particular run takes. Tracked reads inside `f` still register on
/// top of `deps`.
///
/// # Example
/// ```
/// # use willow_reactive::*;
/// # create_root(|| {
/// let volume = create_signal(3);
///
/// create_effect(on(volume, move || {
///     // Peeking would normally not subscribe; `on` does it for us.
///     println!("volume is now {}", volume.get_untracked());
/// }));
///
/// volume.set(11); // prints "volume is now 11"
/// # });
/// ```
pub fn on<T>(
    deps: impl Trackable + 'static,
    mut f: impl FnMut() -> T + 'static,
) -> impl FnMut() -> T + 'static {
    move || {
        deps._track();
        f()
    }
}
