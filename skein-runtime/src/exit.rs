//! Terminal outcome of an effect.

use crate::cause::{Cause, Defect};
use crate::erased::{erase, unerase, AnyValue, Data};
use crate::fiber::FiberId;

/// How an effect finished.
#[derive(Debug, Clone)]
pub enum Exit<A, E> {
    /// Completed with a value.
    Success(A),
    /// Failed with a non-empty cause.
    Failure(Cause<E>),
}

/// Exit value type used by scope finalizers.
pub type ScopeExit = Exit<(), AnyValue>;

impl<A, E> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A failed exit with a typed error.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// A failed exit with the given cause.
    ///
    /// An empty cause is replaced by a defect so that failed exits always
    /// explain themselves.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        if cause.is_empty() {
            Exit::Failure(Cause::die(Defect::new("empty cause")))
        } else {
            Exit::Failure(cause)
        }
    }

    /// A defect exit.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An interruption exit.
    pub fn interrupt(by: Option<FiberId>) -> Self {
        Exit::Failure(Cause::interrupt(by))
    }

    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True for `Failure`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// True when the exit failed only because of interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Failure(cause) => cause.is_interrupted_only(),
            Exit::Success(_) => false,
        }
    }

    /// Borrow the success value.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// Borrow the failure cause.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform the typed error.
    pub fn map_error<E2>(self, f: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Convert into a `Result` over the whole cause.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

impl<A: Data, E: Data> Exit<A, E> {
    pub(crate) fn erase(self) -> Exit<AnyValue, AnyValue> {
        match self {
            Exit::Success(a) => Exit::Success(erase(a)),
            Exit::Failure(cause) => Exit::Failure(cause.erase()),
        }
    }

    /// Forget the value and erase the error, as scope finalizers see it.
    pub fn to_scope_exit(&self) -> ScopeExit {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(cause) => Exit::Failure(cause.clone().erase()),
        }
    }
}

impl Exit<AnyValue, AnyValue> {
    pub(crate) fn unerase<A: Data, E: Data>(self) -> Exit<A, E> {
        match self {
            Exit::Success(a) => Exit::Success(unerase(a)),
            Exit::Failure(cause) => Exit::Failure(cause.unerase()),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}
