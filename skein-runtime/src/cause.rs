//! # Failure Causes
//!
//! The error algebra shared by every effect. A [`Cause`] is an ordered list
//! of [`Failure`]s, each of which is one of:
//!
//! - `Fail(E)`: an expected, typed domain error
//! - `Die(Defect)`: an unexpected failure such as a panic or broken invariant
//! - `Interrupt(Option<FiberId>)`: cooperative cancellation, carrying the
//!   interrupting fiber when known
//!
//! Causes compose sequentially (a finalizer failing after the main effect
//! failed) and in parallel (two concurrent fibers failing). Both forms keep
//! every failure, first failure first.

use std::collections::BTreeMap;
use std::fmt;

use crate::erased::{downcast_ref, erase, unerase, AnyValue, Data};
use crate::fiber::FiberId;

/// An unexpected failure.
#[derive(Clone)]
pub struct Defect {
    /// Human readable description.
    pub message: String,
    /// Optional value attached by the code that died.
    pub payload: Option<AnyValue>,
}

impl Defect {
    /// Create a defect from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }

    /// Create a defect carrying a payload.
    pub fn with_payload<P: Data>(message: impl Into<String>, payload: P) -> Self {
        Self {
            message: message.into(),
            payload: Some(erase(payload)),
        }
    }

    /// Borrow the payload as a `P`, if it holds one.
    pub fn payload<P: Data>(&self) -> Option<&P> {
        self.payload.as_ref().and_then(downcast_ref::<P>)
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defect")
            .field("message", &self.message)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Why a single failure happened.
#[derive(Debug, Clone)]
pub enum Reason<E> {
    /// Expected domain error.
    Fail(E),
    /// Unexpected defect.
    Die(Defect),
    /// Cooperative interruption.
    Interrupt(Option<FiberId>),
}

/// One failure together with its annotations.
#[derive(Debug, Clone)]
pub struct Failure<E> {
    /// What went wrong.
    pub reason: Reason<E>,
    /// Attribution data attached while the failure propagated.
    pub annotations: BTreeMap<String, String>,
}

impl<E> Failure<E> {
    fn new(reason: Reason<E>) -> Self {
        Self {
            reason,
            annotations: BTreeMap::new(),
        }
    }
}

/// The full cause of a failed effect.
#[derive(Debug, Clone)]
pub struct Cause<E> {
    failures: Vec<Failure<E>>,
}

impl<E> Cause<E> {
    /// A cause with no failures.
    ///
    /// Only used as an accumulator; failed exits never carry one.
    pub fn empty() -> Self {
        Self {
            failures: Vec::new(),
        }
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Self::single(Reason::Fail(error))
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Self::single(Reason::Die(defect))
    }

    /// A defect built from a message.
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// An interruption, optionally attributed to a fiber.
    pub fn interrupt(by: Option<FiberId>) -> Self {
        Self::single(Reason::Interrupt(by))
    }

    fn single(reason: Reason<E>) -> Self {
        Self {
            failures: vec![Failure::new(reason)],
        }
    }

    /// Compose a cause that happened after this one.
    pub fn sequential(mut self, then: Cause<E>) -> Self {
        self.failures.extend(then.failures);
        self
    }

    /// Compose a cause that happened concurrently with this one.
    pub fn parallel(mut self, other: Cause<E>) -> Self {
        self.failures.extend(other.failures);
        self
    }

    /// Combine many concurrent causes, in order.
    pub fn parallel_all(causes: impl IntoIterator<Item = Cause<E>>) -> Self {
        causes
            .into_iter()
            .fold(Cause::empty(), |acc, cause| acc.parallel(cause))
    }

    /// All failures in order.
    pub fn failures(&self) -> &[Failure<E>] {
        &self.failures
    }

    /// Number of failures.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// True when no failure has been recorded.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// True when any failure is a typed `Fail`.
    pub fn is_failure(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f.reason, Reason::Fail(_)))
    }

    /// True when any failure is a defect.
    pub fn is_die(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f.reason, Reason::Die(_)))
    }

    /// True when any failure is an interruption.
    pub fn is_interrupted(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f.reason, Reason::Interrupt(_)))
    }

    /// True when the cause is non-empty and consists only of interruptions.
    pub fn is_interrupted_only(&self) -> bool {
        !self.failures.is_empty()
            && self
                .failures
                .iter()
                .all(|f| matches!(f.reason, Reason::Interrupt(_)))
    }

    /// Fibers that requested the interruptions in this cause.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut ids = Vec::new();
        for failure in &self.failures {
            if let Reason::Interrupt(Some(id)) = failure.reason {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Typed errors in order.
    pub fn errors(&self) -> impl Iterator<Item = &E> {
        self.failures.iter().filter_map(|f| match &f.reason {
            Reason::Fail(e) => Some(e),
            _ => None,
        })
    }

    /// Defects in order.
    pub fn defects(&self) -> impl Iterator<Item = &Defect> {
        self.failures.iter().filter_map(|f| match &f.reason {
            Reason::Die(d) => Some(d),
            _ => None,
        })
    }

    /// The first typed error, if any.
    pub fn first_error(&self) -> Option<&E> {
        self.errors().next()
    }

    /// Transform the typed errors.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        Cause {
            failures: self
                .failures
                .into_iter()
                .map(|failure| Failure {
                    reason: match failure.reason {
                        Reason::Fail(e) => Reason::Fail(f(e)),
                        Reason::Die(d) => Reason::Die(d),
                        Reason::Interrupt(id) => Reason::Interrupt(id),
                    },
                    annotations: failure.annotations,
                })
                .collect(),
        }
    }

    /// Attach an annotation to every failure.
    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        for failure in &mut self.failures {
            failure
                .annotations
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Drop failures matching a predicate.
    pub fn filter(self, mut keep: impl FnMut(&Failure<E>) -> bool) -> Self {
        Self {
            failures: self.failures.into_iter().filter(|f| keep(f)).collect(),
        }
    }

    /// Remove interruptions, keeping everything else.
    pub fn strip_interrupts(self) -> Self {
        self.filter(|f| !matches!(f.reason, Reason::Interrupt(_)))
    }

    /// Drop every typed failure, keeping defects and interruptions.
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        Cause {
            failures: self
                .failures
                .into_iter()
                .filter_map(|failure| {
                    let reason = match failure.reason {
                        Reason::Fail(_) => return None,
                        Reason::Die(d) => Reason::Die(d),
                        Reason::Interrupt(id) => Reason::Interrupt(id),
                    };
                    Some(Failure {
                        reason,
                        annotations: failure.annotations,
                    })
                })
                .collect(),
        }
    }

    /// Turn every typed failure into a defect.
    pub fn into_defects<E2>(self, mut to_defect: impl FnMut(E) -> Defect) -> Cause<E2> {
        Cause {
            failures: self
                .failures
                .into_iter()
                .map(|failure| Failure {
                    reason: match failure.reason {
                        Reason::Fail(e) => Reason::Die(to_defect(e)),
                        Reason::Die(d) => Reason::Die(d),
                        Reason::Interrupt(id) => Reason::Interrupt(id),
                    },
                    annotations: failure.annotations,
                })
                .collect(),
        }
    }

    /// The first typed error if there is one, otherwise the remaining cause
    /// with the typed channel emptied.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        let position = self
            .failures
            .iter()
            .position(|f| matches!(f.reason, Reason::Fail(_)));
        match position {
            Some(index) => {
                let mut failures = self.failures;
                match failures.swap_remove(index).reason {
                    Reason::Fail(e) => Ok(e),
                    _ => unreachable!("position matched a Fail"),
                }
            }
            None => Err(self),
        }
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Render the cause across multiple lines.
    pub fn pretty(&self) -> String {
        if self.failures.is_empty() {
            return "<empty cause>".to_string();
        }
        let mut out = String::new();
        for (index, failure) in self.failures.iter().enumerate() {
            if index > 0 {
                out.push('\n');
            }
            match &failure.reason {
                Reason::Fail(e) => out.push_str(&format!("Fail: {:?}", e)),
                Reason::Die(d) => out.push_str(&format!("Die: {}", d)),
                Reason::Interrupt(Some(id)) => {
                    out.push_str(&format!("Interrupted by {}", id))
                }
                Reason::Interrupt(None) => out.push_str("Interrupted"),
            }
            for (key, value) in &failure.annotations {
                out.push_str(&format!(" [{}={}]", key, value));
            }
        }
        out
    }
}

impl<E: Data> Cause<E> {
    pub(crate) fn erase(self) -> Cause<AnyValue> {
        self.map(erase)
    }
}

impl Cause<AnyValue> {
    pub(crate) fn unerase<E: Data>(self) -> Cause<E> {
        self.map(unerase::<E>)
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_keeps_order() {
        let cause = Cause::fail("first").sequential(Cause::die_message("second"));
        assert_eq!(cause.len(), 2);
        assert_eq!(cause.first_error(), Some(&"first"));
        assert!(cause.is_die());
    }

    #[test]
    fn test_parallel_keeps_both() {
        let cause = Cause::fail(1).parallel(Cause::fail(2));
        assert_eq!(cause.errors().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_interrupted_only() {
        let by = FiberId::new(7);
        let cause: Cause<()> = Cause::interrupt(Some(by)).parallel(Cause::interrupt(Some(by)));
        assert!(cause.is_interrupted_only());
        assert_eq!(cause.interruptors(), vec![by]);

        let mixed = cause.sequential(Cause::fail(()));
        assert!(!mixed.is_interrupted_only());
        assert!(!Cause::<()>::empty().is_interrupted_only());
    }

    #[test]
    fn test_failure_or_cause() {
        let cause = Cause::die_message("boom").sequential(Cause::fail("typed"));
        assert_eq!(cause.failure_or_cause().ok(), Some("typed"));

        let defect_only: Cause<&str> = Cause::die_message("boom");
        let rest = defect_only.failure_or_cause().unwrap_err();
        assert_eq!(rest.defects().next().map(|d| d.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_annotate_and_map() {
        let cause = Cause::fail(3).annotate("fiber", "Fiber(1)").map(|n| n * 2);
        assert_eq!(cause.first_error(), Some(&6));
        assert_eq!(
            cause.failures()[0].annotations.get("fiber").map(String::as_str),
            Some("Fiber(1)")
        );
    }

    #[test]
    fn test_pretty() {
        let cause: Cause<&str> = Cause::fail("nope").parallel(Cause::interrupt(None));
        assert_eq!(cause.pretty(), "Fail: \"nope\"\nInterrupted");
    }

    #[test]
    fn test_defect_payload() {
        let defect = Defect::with_payload("marker", 42u8);
        assert_eq!(defect.payload::<u8>(), Some(&42));
        assert_eq!(defect.payload::<u16>(), None);
    }
}
