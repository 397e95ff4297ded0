//! # Concurrent Combinators
//!
//! Racing and parallel collection built on forked fibers.
//!
//! Every combinator here forks its operands as children of the calling
//! fiber, waits on a latch completed by fiber observers, then interrupts and
//! awaits whatever is still running before it returns. No child outlives
//! the combinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cause::Cause;
use crate::deferred::Deferred;
use crate::effect::{absurd, Effect, Restore};
use crate::erased::Data;
use crate::exit::Exit;
use crate::fiber::Fiber;

/// Latch value meaning "no single winner".
const NO_WINNER: usize = usize::MAX;

/// Fork each effect under `restore` and register `on_done(index, exit)` on
/// each child.
fn fork_each<A, E, F>(
    effects: Arc<Vec<Effect<A, E>>>,
    restore: Restore,
    on_done: F,
) -> Effect<Vec<Fiber<A, E>>, E>
where
    A: Data,
    E: Data,
    F: Fn(usize, &Exit<A, E>) + Send + Sync + 'static,
{
    let on_done = Arc::new(on_done);
    Effect::for_each(0..effects.len(), move |index| {
        let on_done = on_done.clone();
        restore
            .apply(effects[index].clone())
            .fork()
            .tap(move |fiber| {
                let fiber = fiber.clone();
                let on_done = on_done.clone();
                Effect::sync(move || {
                    let on_done = on_done.clone();
                    fiber.on_done(move |exit| on_done(index, &exit));
                })
            })
            .widen::<E>()
    })
}

/// Request interruption of every fiber, then wait for all of them.
fn interrupt_and_await<A: Data, E: Data>(fibers: Arc<Vec<Fiber<A, E>>>) -> Effect<Vec<Exit<A, E>>, E> {
    let waiting = fibers.clone();
    Effect::for_each(0..fibers.len(), move |i| fibers[i].interrupt_fork())
        .then(Effect::for_each(0..waiting.len(), move |i| waiting[i].await_exit()))
        .widen::<E>()
}

/// Wait on the latch interruptibly. If the caller is interrupted while
/// waiting, tear the children down and re-raise the interruption.
fn await_latch<A, E, B, F>(
    latch: Deferred<usize>,
    fibers: Arc<Vec<Fiber<A, E>>>,
    restore: Restore,
    settle: F,
) -> Effect<B, E>
where
    A: Data,
    E: Data,
    B: Data,
    F: Fn(usize, Arc<Vec<Fiber<A, E>>>) -> Effect<B, E> + Send + Sync + 'static,
{
    restore
        .apply(latch.wait())
        .exit()
        .widen::<E>()
        .flat_map(move |signal| match signal {
            Exit::Success(winner) => settle(winner, fibers.clone()),
            Exit::Failure(cause) => interrupt_and_await(fibers.clone())
                .then(Effect::fail_cause(absurd(cause))),
        })
}

fn race_inner<A: Data, E: Data>(effects: Vec<Effect<A, E>>, first_success: bool) -> Effect<A, E> {
    if effects.is_empty() {
        return Effect::die_message("race of no effects");
    }
    let effects = Arc::new(effects);
    Effect::uninterruptible_mask(move |restore| {
        let total = effects.len();
        let latch: Deferred<usize> = Deferred::new();
        let failures = Arc::new(AtomicUsize::new(0));
        let signal = latch.clone();
        let forked = fork_each(effects.clone(), restore, move |index, exit| {
            if !first_success || exit.is_success() {
                signal.complete_now(Exit::Success(index));
            } else if failures.fetch_add(1, Ordering::SeqCst) + 1 == total {
                signal.complete_now(Exit::Success(NO_WINNER));
            }
        });
        let latch = latch.clone();
        forked.flat_map(move |fibers| {
            await_latch(latch.clone(), Arc::new(fibers), restore, |winner, fibers| {
                interrupt_and_await(fibers).flat_map(move |exits| {
                    if winner != NO_WINNER {
                        return Effect::from_exit(exits[winner].clone());
                    }
                    let causes = exits.into_iter().filter_map(|exit| match exit {
                        Exit::Failure(cause) => Some(cause),
                        Exit::Success(_) => None,
                    });
                    Effect::fail_cause(Cause::parallel_all(causes))
                })
            })
        })
    })
}

fn all_par_inner<A: Data, E: Data>(effects: Vec<Effect<A, E>>) -> Effect<Vec<A>, E> {
    if effects.is_empty() {
        return Effect::succeed(Vec::new());
    }
    let effects = Arc::new(effects);
    Effect::uninterruptible_mask(move |restore| {
        let latch: Deferred<usize> = Deferred::new();
        let remaining = Arc::new(AtomicUsize::new(effects.len()));
        let signal = latch.clone();
        let forked = fork_each(effects.clone(), restore, move |index, exit| {
            if exit.is_failure() {
                signal.complete_now(Exit::Success(index));
            } else if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                signal.complete_now(Exit::Success(NO_WINNER));
            }
        });
        let latch = latch.clone();
        forked.flat_map(move |fibers| {
            await_latch(latch.clone(), Arc::new(fibers), restore, |first_failure, fibers| {
                interrupt_and_await(fibers).flat_map(move |exits| collect_all(exits, first_failure))
            })
        })
    })
}

/// Gather values, or build the failure cause with the first failure in
/// front. Interruptions we caused while cancelling siblings are dropped
/// unless nothing else remains.
fn collect_all<A: Data, E: Data>(exits: Vec<Exit<A, E>>, first_failure: usize) -> Effect<Vec<A>, E> {
    if first_failure == NO_WINNER {
        let mut values = Vec::with_capacity(exits.len());
        for exit in exits {
            match exit {
                Exit::Success(value) => values.push(value),
                Exit::Failure(cause) => return Effect::fail_cause(cause),
            }
        }
        return Effect::succeed(values);
    }

    let mut primary = None;
    let mut others = Vec::new();
    let mut interrupted = Vec::new();
    for (index, exit) in exits.into_iter().enumerate() {
        if let Exit::Failure(cause) = exit {
            if index == first_failure {
                primary = Some(cause);
            } else if cause.is_interrupted_only() {
                interrupted.push(cause);
            } else {
                others.push(cause);
            }
        }
    }
    let cause = match primary {
        Some(primary) => others.into_iter().fold(primary, Cause::parallel),
        None => Cause::parallel_all(others.into_iter().chain(interrupted)),
    };
    Effect::fail_cause(cause)
}

#[derive(Clone)]
enum Either<A, B> {
    Left(A),
    Right(B),
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Run both effects concurrently; the first to succeed wins and the
    /// other is interrupted. Fails with both causes if both fail.
    pub fn race(self, other: Effect<A, E>) -> Effect<A, E> {
        race_inner(vec![self, other], true)
    }

    /// Run both effects concurrently; the first to finish, successfully or
    /// not, decides the outcome and the other is interrupted.
    pub fn race_first(self, other: Effect<A, E>) -> Effect<A, E> {
        race_inner(vec![self, other], false)
    }

    /// Run all effects concurrently; the first success wins.
    pub fn race_all(effects: impl IntoIterator<Item = Effect<A, E>>) -> Effect<A, E> {
        race_inner(effects.into_iter().collect(), true)
    }

    /// Run all effects concurrently, collecting results in input order.
    /// The first failure interrupts the rest.
    pub fn all_par(effects: impl IntoIterator<Item = Effect<A, E>>) -> Effect<Vec<A>, E> {
        all_par_inner(effects.into_iter().collect())
    }

    /// Run both effects concurrently, pairing the results.
    pub fn zip_par<B: Data>(self, other: Effect<B, E>) -> Effect<(A, B), E> {
        let left = self.map(Either::<A, B>::Left);
        let right = other.map(Either::<A, B>::Right);
        all_par_inner(vec![left, right]).flat_map(|pair| match pair.as_slice() {
            [Either::Left(a), Either::Right(b)] => Effect::succeed((a.clone(), b.clone())),
            _ => Effect::die_message("zip_par produced mismatched results"),
        })
    }
}

impl<E: Data> Effect<(), E> {
    /// Apply `f` to every item concurrently, collecting results in input
    /// order. The first failure interrupts the rest.
    pub fn for_each_par<T, B, F>(items: impl IntoIterator<Item = T>, f: F) -> Effect<Vec<B>, E>
    where
        T: Data,
        B: Data,
        F: Fn(T) -> Effect<B, E> + Send + Sync + 'static,
    {
        let items: Vec<T> = items.into_iter().collect();
        let f = Arc::new(f);
        Effect::suspend(move || all_par_inner(items.iter().cloned().map(|item| f(item)).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::effect::Never;
    use crate::runtime::Runtime;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_race_first_success_wins() {
        let runtime = Runtime::current_thread();
        let slow = Effect::<&str, ()>::never();
        let fast = Effect::yield_now().then(Effect::succeed("fast"));
        assert_eq!(runtime.run_exit(slow.race(fast)).value(), Some(&"fast"));
    }

    #[test]
    fn test_race_ignores_early_failure() {
        let runtime = Runtime::current_thread();
        let failing = Effect::<u8, &str>::fail("nope");
        let ok = Effect::yield_now().repeat_n(3).then(Effect::succeed(7));
        assert_eq!(runtime.run_exit(failing.race(ok)).value(), Some(&7));
    }

    #[test]
    fn test_race_both_fail_combines_causes() {
        let runtime = Runtime::current_thread();
        let exit = runtime.run_exit(Effect::<u8, &str>::fail("a").race(Effect::fail("b")));
        let cause = exit.cause().unwrap();
        let mut errors: Vec<_> = cause.errors().copied().collect();
        errors.sort();
        assert_eq!(errors, vec!["a", "b"]);
    }

    #[test]
    fn test_race_first_takes_failure() {
        let runtime = Runtime::current_thread();
        let exit = runtime.run_exit(Effect::<u8, &str>::fail("first").race_first(Effect::never()));
        assert_eq!(exit.cause().unwrap().first_error(), Some(&"first"));
    }

    #[test]
    fn test_loser_is_interrupted_and_finalized() {
        let runtime = Runtime::current_thread();
        let finalized = Arc::new(Mutex::new(false));
        let flag = finalized.clone();
        let loser = Effect::<u8, ()>::never().ensuring(Effect::sync(move || *flag.lock() = true));
        let exit = runtime.run_exit(loser.race(Effect::succeed(1)));
        assert_eq!(exit.value(), Some(&1));
        assert!(*finalized.lock());
    }

    #[test]
    fn test_race_first_waits_for_loser_finalizer() {
        let runtime = Runtime::current_thread();
        let released = Arc::new(Mutex::new(false));
        let flag = released.clone();
        let slow_release = Effect::<(), Never>::yield_now()
            .repeat_n(5)
            .then(Effect::sync(move || *flag.lock() = true));
        let loser = Effect::<u8, ()>::never().ensuring(slow_release);
        let seen = released.clone();
        let program = loser
            .race_first(Effect::succeed(1))
            .flat_map(move |winner| {
                let seen = seen.clone();
                Effect::sync(move || (winner, *seen.lock()))
            });
        assert_eq!(runtime.run_exit(program).value(), Some(&(1, true)));
    }

    #[test]
    fn test_all_par_preserves_order() {
        let runtime = Runtime::current_thread();
        let clock = TestClock::new();
        let effects = (0..4u64).map(|n| {
            Effect::<(), ()>::sleep(Duration::from_millis(40 - n * 10)).then(Effect::succeed(n))
        });
        let fiber = runtime.run_fork(Effect::all_par(effects).with_clock(clock.clone()));
        runtime.run_until_idle();
        clock.adjust(Duration::from_millis(40));
        runtime.run_until_idle();
        assert_eq!(fiber.poll().unwrap().value(), Some(&vec![0, 1, 2, 3]));
    }

    #[test]
    fn test_all_par_fails_fast() {
        let runtime = Runtime::current_thread();
        let interrupted = Arc::new(Mutex::new(0));
        let counter = interrupted.clone();
        let sleeper = Effect::<u8, &str>::never().on_interrupt(move |_| {
            let counter = counter.clone();
            Effect::sync(move || *counter.lock() += 1)
        });
        let exit = runtime.run_exit(Effect::all_par(vec![
            sleeper.clone(),
            Effect::fail("broken"),
            sleeper,
        ]));
        let cause = exit.cause().unwrap();
        assert_eq!(cause.first_error(), Some(&"broken"));
        assert!(!cause.is_interrupted());
        assert_eq!(*interrupted.lock(), 2);
    }

    #[test]
    fn test_for_each_par_and_zip_par() {
        let runtime = Runtime::current_thread();
        let squares = Effect::for_each_par(1..=4, |n: u32| Effect::<u32, ()>::succeed(n * n));
        assert_eq!(runtime.run_exit(squares).value(), Some(&vec![1, 4, 9, 16]));

        let pair = Effect::<u8, ()>::succeed(1).zip_par(Effect::succeed("two"));
        assert_eq!(runtime.run_exit(pair).value(), Some(&(1, "two")));

        let empty = Effect::<u8, ()>::all_par(Vec::new());
        assert_eq!(runtime.run_exit(empty).value(), Some(&Vec::new()));
    }

    #[test]
    fn test_interrupting_race_interrupts_children() {
        let runtime = Runtime::current_thread();
        let cleaned = Arc::new(Mutex::new(0));
        let make = |cleaned: Arc<Mutex<u32>>| {
            Effect::<(), ()>::never().ensuring(Effect::sync(move || *cleaned.lock() += 1))
        };
        let racing = make(cleaned.clone()).race(make(cleaned.clone()));
        let exit = runtime.run_exit(
            racing
                .fork()
                .flat_map(|fiber| Effect::yield_now().repeat_n(3).then(fiber.interrupt())),
        );
        assert!(exit.value().unwrap().is_interrupted());
        assert_eq!(*cleaned.lock(), 2);
    }
}
