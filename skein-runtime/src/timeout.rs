//! Timeout Enforcement
//!
//! Timeouts are races against a timer on the clock in effect. When the timer
//! wins, the timed effect is interrupted and its finalizers run before the
//! timeout is reported.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use skein_runtime::{Effect, Runtime};
//!
//! let runtime = Runtime::current_thread();
//! let slow = Effect::<u32, ()>::never();
//! let exit = runtime.run_exit(slow.timeout(Duration::from_millis(5)));
//! assert_eq!(exit.value(), Some(&None));
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cause::Defect;
use crate::clock::{Clock, CLOCK};
use crate::effect::Effect;
use crate::erased::Data;

/// Error describing an expired timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeoutError {
    /// The timeout expired before the operation completed.
    #[error("operation timed out after {duration:?}")]
    Expired {
        /// The timeout duration that was exceeded.
        duration: Duration,
    },
}

/// A point in time on the clock in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at_millis: u64,
}

impl Deadline {
    /// A deadline at an absolute clock time.
    pub fn at(at_millis: u64) -> Self {
        Self { at_millis }
    }

    /// A deadline `duration` from now.
    pub fn after<E: Data>(duration: Duration) -> Effect<Deadline, E> {
        Effect::current_time_millis()
            .map(move |now| Deadline::at(now.saturating_add(duration.as_millis() as u64)))
    }

    /// Clock time of the deadline, in milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.at_millis
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining<E: Data>(&self) -> Effect<Duration, E> {
        let at = self.at_millis;
        Effect::current_time_millis().map(move |now| Duration::from_millis(at.saturating_sub(now)))
    }

    /// True once the deadline has passed.
    pub fn is_expired<E: Data>(&self) -> Effect<bool, E> {
        let at = self.at_millis;
        Effect::current_time_millis().map(move |now| now >= at)
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Run with a time limit. Yields `None` and interrupts the effect if the
    /// limit passes first.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some)
            .race_first(Effect::sleep(duration).as_value(None))
    }

    /// Run with a time limit, failing with `on_timeout()` if it passes.
    pub fn timeout_fail<F>(self, duration: Duration, on_timeout: F) -> Effect<A, E>
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.timeout(duration).flat_map(move |value| match value {
            Some(value) => Effect::succeed(value),
            None => Effect::fail(on_timeout()),
        })
    }

    /// Run with a time limit, dying with a [`TimeoutError`] payload if it
    /// passes.
    pub fn timeout_die(self, duration: Duration) -> Effect<A, E> {
        self.timeout(duration).flat_map(move |value| match value {
            Some(value) => Effect::succeed(value),
            None => {
                let error = TimeoutError::Expired { duration };
                Effect::die(Defect::with_payload(error.to_string(), error))
            }
        })
    }

    /// Run until `deadline`. Yields `None` if it passes first.
    pub fn timeout_at(self, deadline: Deadline) -> Effect<Option<A>, E> {
        Effect::<Arc<dyn Clock>, E>::service_or_default(&CLOCK).flat_map(move |clock| {
            let left = deadline.as_millis().saturating_sub(clock.current_time_millis());
            self.clone().timeout(Duration::from_millis(left))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::exit::Exit;
    use crate::runtime::Runtime;
    use parking_lot::Mutex;

    #[test]
    fn test_timeout_completes_in_time() {
        let runtime = Runtime::current_thread();
        let exit = runtime.run_exit(Effect::<u8, ()>::succeed(3).timeout(Duration::from_secs(5)));
        assert_eq!(exit.value(), Some(&Some(3)));
    }

    #[test]
    fn test_timeout_interrupts_and_finalizes() {
        let runtime = Runtime::current_thread();
        let clock = TestClock::new();
        let finalized = Arc::new(Mutex::new(false));
        let flag = finalized.clone();
        let slow = Effect::<u8, ()>::never().ensuring(Effect::sync(move || *flag.lock() = true));
        let fiber = runtime.run_fork(
            slow.timeout_fail(Duration::from_millis(100), || ())
                .with_clock(clock.clone()),
        );
        runtime.run_until_idle();
        clock.adjust(Duration::from_millis(100));
        runtime.run_until_idle();
        assert_eq!(fiber.poll().map(|e| e.is_failure()), Some(true));
        assert!(*finalized.lock());
    }

    #[test]
    fn test_timeout_die_carries_error() {
        let runtime = Runtime::current_thread();
        let exit = runtime.run_exit(Effect::<u8, ()>::never().timeout_die(Duration::from_millis(1)));
        let cause = match exit {
            Exit::Failure(cause) => cause,
            Exit::Success(_) => panic!("expected a timeout"),
        };
        let defect = cause.defects().next().unwrap();
        assert_eq!(
            defect.payload::<TimeoutError>(),
            Some(&TimeoutError::Expired {
                duration: Duration::from_millis(1)
            })
        );
    }

    #[test]
    fn test_deadline() {
        let runtime = Runtime::current_thread();
        let clock = TestClock::new();
        clock.set_time(1_000);
        let program = Deadline::after::<()>(Duration::from_millis(250)).flat_map(|deadline| {
            deadline
                .remaining()
                .zip(deadline.is_expired())
                .map(move |(left, expired)| (deadline.as_millis(), left, expired))
        });
        let exit = runtime.run_exit(program.with_clock(clock));
        assert_eq!(exit.value(), Some(&(1_250, Duration::from_millis(250), false)));
    }
}
