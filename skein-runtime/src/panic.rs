//! Panic capture.
//!
//! Every user closure the interpreter invokes runs under [`catch_defect`],
//! so a panic inside `sync`, a continuation, or an async registration never
//! unwinds through the trampoline. It becomes a `Die` failure of the
//! running fiber instead, carrying a [`CaughtPanic`] payload.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cause::Defect;

/// Counter for panics converted to defects.
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Information about a panic caught by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaughtPanic {
    /// The panic message.
    pub message: String,
    /// Name of the thread that panicked.
    pub thread_name: Option<String>,
    /// Running total of caught panics when this one happened.
    pub count: u64,
}

/// Run `f`, converting a panic into a [`Defect`].
pub fn catch_defect<F, R>(f: F) -> Result<R, Defect>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        let count = PANIC_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
        let thread_name = std::thread::current().name().map(|s| s.to_string());
        tracing::debug!(%message, count, "caught panic in fiber");
        Defect::with_payload(
            message.clone(),
            CaughtPanic {
                message,
                thread_name,
                count,
            },
        )
    })
}

/// Extract the message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Number of panics caught since process start.
pub fn caught_panics() -> u64 {
    PANIC_COUNT.load(Ordering::SeqCst)
}
