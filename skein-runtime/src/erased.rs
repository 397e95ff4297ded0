//! Type-erased values carried through the interpreter.
//!
//! Effects are typed at the surface (`Effect<A, E>`) but the interpreter
//! works on a single uniform representation so that one frame stack can
//! hold continuations of any type. Values and errors are erased into
//! [`AnyValue`] when they enter the interpreter and recovered with
//! [`unerase`] when a typed continuation consumes them.

use std::any::{type_name, Any};
use std::sync::Arc;

/// Marker for types that can flow through effects.
///
/// Exits are replayed to every observer of a fiber, so values must be
/// cloneable as well as shareable across worker threads.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// A shared, type-erased value.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Erase a typed value.
pub fn erase<A: Data>(value: A) -> AnyValue {
    Arc::new(value)
}

/// Recover a typed value from its erased form.
///
/// # Panics
///
/// Panics when the erased value does not hold an `A`. Every call site in
/// the crate runs inside the interpreter's panic guard, so a mismatch is
/// reported as a defect of the running fiber.
pub fn unerase<A: Data>(value: AnyValue) -> A {
    match value.downcast::<A>() {
        Ok(typed) => Arc::try_unwrap(typed).unwrap_or_else(|shared| (*shared).clone()),
        Err(_) => panic!("erased value is not a `{}`", type_name::<A>()),
    }
}

/// Borrow a typed view of an erased value without consuming it.
pub fn downcast_ref<A: Data>(value: &AnyValue) -> Option<&A> {
    value.downcast_ref::<A>()
}

/// The unit value, pre-erased.
pub fn unit() -> AnyValue {
    erase(())
}
