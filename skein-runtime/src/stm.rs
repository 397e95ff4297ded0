//! # Software Transactional Memory
//!
//! [`TxRef`]s are cells that are only mutated by committing a transaction.
//! A transaction is an ordinary effect run with [`Effect::atomically`]:
//!
//! ```text
//!   attempt ──► body ──► validate ──► commit ──► Done
//!      ▲          │          │
//!      │        retry     conflict
//!      │          │          │
//!      │   block on touched refs
//!      └──────────┴──────────┘
//! ```
//!
//! Each attempt starts with an empty [`Journal`] stored on the running fiber.
//! The first access to a ref copies its live value and version into the
//! journal; later accesses only touch the copy. On completion every journaled
//! version is checked against the live ref. Any mismatch discards the journal
//! and reruns the body. A body that calls [`Effect::retry`] with a consistent
//! journal parks the fiber until one of the refs it read is committed.
//!
//! Commits are serialized by a single process-wide lock. The lock is also
//! taken on first access to a ref so that an attempt always sees a
//! consistent snapshot and never acts on a half-applied commit.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::cause::{Cause, Defect};
use crate::deferred::Deferred;
use crate::effect::{with_fiber, Effect, Never, Restore};
use crate::erased::{erase, unerase, AnyValue, Data};
use crate::exit::Exit;
use crate::fiber::Priority;

static COMMIT_LOCK: Mutex<()> = parking_lot::const_mutex(());
static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WAIT_TOKEN: AtomicU64 = AtomicU64::new(1);

type Waker = Arc<dyn Fn() + Send + Sync>;

/// Control signals raised inside a transaction body. They travel as defect
/// payloads so typed error handlers never see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Retry,
    Conflict,
}

impl Signal {
    fn cause<E>(self) -> Cause<E> {
        let message = match self {
            Signal::Retry => "transaction retry",
            Signal::Conflict => "transaction conflict",
        };
        Cause::die(Defect::with_payload(message, self))
    }

    fn of<E>(cause: &Cause<E>) -> Option<Signal> {
        cause.defects().find_map(|defect| defect.payload::<Signal>().copied())
    }
}

struct Versioned {
    version: u64,
    value: AnyValue,
}

struct TxRefInner {
    id: u64,
    live: Mutex<Versioned>,
    waiters: Mutex<HashMap<u64, Waker>>,
}

impl TxRefInner {
    fn version(&self) -> u64 {
        self.live.lock().version
    }
}

// ============================================================================
// Journal
// ============================================================================

#[derive(Clone)]
struct Entry {
    tref: Arc<TxRefInner>,
    /// Version of the ref when the attempt first touched it.
    version: u64,
    /// Value read on first touch.
    original: AnyValue,
    /// The attempt's private value.
    value: AnyValue,
    changed: bool,
}

/// The private view of transactional state for one attempt.
#[derive(Clone, Default)]
pub(crate) struct Journal {
    entries: BTreeMap<u64, Entry>,
}

impl Journal {
    fn read(&mut self, tref: &Arc<TxRefInner>) -> Result<AnyValue, Signal> {
        if let Some(entry) = self.entries.get(&tref.id) {
            return Ok(entry.value.clone());
        }
        let _commit = COMMIT_LOCK.lock();
        let (version, value) = {
            let live = tref.live.lock();
            (live.version, live.value.clone())
        };
        if !self.is_consistent() {
            return Err(Signal::Conflict);
        }
        self.entries.insert(
            tref.id,
            Entry {
                tref: tref.clone(),
                version,
                original: value.clone(),
                value: value.clone(),
                changed: false,
            },
        );
        Ok(value)
    }

    fn write(&mut self, tref: &Arc<TxRefInner>, value: AnyValue) -> Result<(), Signal> {
        self.read(tref)?;
        if let Some(entry) = self.entries.get_mut(&tref.id) {
            entry.value = value;
            entry.changed = true;
        }
        Ok(())
    }

    /// Must be called with `COMMIT_LOCK` held.
    fn is_consistent(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.tref.version() == entry.version)
    }

    fn is_valid(&self) -> bool {
        let _commit = COMMIT_LOCK.lock();
        self.is_consistent()
    }

    /// Publish every changed ref. Returns the wakers of fibers blocked on
    /// them, or `None` if another transaction got there first.
    fn commit(&self) -> Option<Vec<Waker>> {
        let _commit = COMMIT_LOCK.lock();
        if !self.is_consistent() {
            return None;
        }
        let mut wakers = Vec::new();
        for entry in self.entries.values().filter(|entry| entry.changed) {
            {
                let mut live = entry.tref.live.lock();
                live.version += 1;
                live.value = entry.value.clone();
            }
            wakers.extend(entry.tref.waiters.lock().drain().map(|(_, waker)| waker));
        }
        Some(wakers)
    }

    /// Register `waker` on every touched ref, unless the journal is already
    /// stale.
    fn block(&self, token: u64, waker: Waker) -> bool {
        let _commit = COMMIT_LOCK.lock();
        if !self.is_consistent() {
            return false;
        }
        for entry in self.entries.values() {
            entry.tref.waiters.lock().insert(token, waker.clone());
        }
        true
    }

    fn refs(&self) -> Vec<Arc<TxRefInner>> {
        self.entries.values().map(|entry| entry.tref.clone()).collect()
    }

    fn changed(&self) -> usize {
        self.entries.values().filter(|entry| entry.changed).count()
    }

    /// Undo writes made since `snapshot` while keeping every read, so a
    /// later block still waits on refs the abandoned branch looked at.
    fn rollback_to(&mut self, snapshot: &Journal) {
        for (id, entry) in self.entries.iter_mut() {
            match snapshot.entries.get(id) {
                Some(saved) => *entry = saved.clone(),
                None => {
                    entry.value = entry.original.clone();
                    entry.changed = false;
                }
            }
        }
    }
}

// ============================================================================
// Transactions
// ============================================================================

fn with_journal<B, F>(op: F) -> Effect<B, Never>
where
    B: Data,
    F: Fn(&mut Journal) -> Result<B, Signal> + Send + Sync + 'static,
{
    with_fiber(move |state, _| match state.journal.as_mut() {
        Some(journal) => match op(journal) {
            Ok(value) => Effect::succeed(value),
            Err(signal) => Effect::fail_cause(signal.cause()),
        },
        None => Effect::die_message("transactional operation outside a transaction"),
    })
    .atomically()
}

fn attempt<A: Data, E: Data>(body: Effect<A, E>, restore: Restore, attempt_no: u64) -> Effect<A, E> {
    with_fiber(move |state, _| {
        state.journal = Some(Journal::default());
        let again = body.clone();
        restore
            .apply(body.clone())
            .exit()
            .widen::<E>()
            .flat_map(move |exit| settle(again.clone(), restore, attempt_no, exit))
    })
}

fn settle<A: Data, E: Data>(
    body: Effect<A, E>,
    restore: Restore,
    attempt_no: u64,
    exit: Exit<A, E>,
) -> Effect<A, E> {
    with_fiber(move |state, fiber| {
        let journal = state.journal.take().unwrap_or_default();
        let signal = exit.cause().and_then(Signal::of);
        match (exit.clone(), signal) {
            (_, Some(Signal::Conflict)) => {
                trace!(fiber_id = %fiber.id(), attempt = attempt_no, "transaction conflict");
                attempt(body.clone(), restore, attempt_no + 1)
            }
            (_, Some(Signal::Retry)) => block(journal, body.clone(), restore, attempt_no),
            (Exit::Success(value), None) => match journal.commit() {
                Some(wakers) => {
                    trace!(
                        fiber_id = %fiber.id(),
                        attempt = attempt_no,
                        written = journal.changed(),
                        woken = wakers.len(),
                        "transaction committed"
                    );
                    for waker in wakers {
                        fiber
                            .scheduler()
                            .schedule_task(Box::new(move || waker()), Priority::Normal);
                    }
                    Effect::succeed(value)
                }
                None => {
                    trace!(fiber_id = %fiber.id(), attempt = attempt_no, "transaction conflict");
                    attempt(body.clone(), restore, attempt_no + 1)
                }
            },
            (Exit::Failure(cause), None) => {
                if cause.is_interrupted() || journal.is_valid() {
                    Effect::fail_cause(cause)
                } else {
                    attempt(body.clone(), restore, attempt_no + 1)
                }
            }
        }
    })
}

/// Park until a ref the attempt read is committed, then run a fresh attempt.
fn block<A: Data, E: Data>(
    journal: Journal,
    body: Effect<A, E>,
    restore: Restore,
    attempt_no: u64,
) -> Effect<A, E> {
    let token = NEXT_WAIT_TOKEN.fetch_add(1, Ordering::Relaxed);
    let woken: Deferred<()> = Deferred::new();
    let waker: Waker = {
        let woken = woken.clone();
        Arc::new(move || {
            woken.complete_now(Exit::succeed(()));
        })
    };
    if !journal.block(token, waker) {
        return attempt(body, restore, attempt_no + 1);
    }
    let refs = journal.refs();
    trace!(attempt = attempt_no, refs = refs.len(), "transaction blocked");
    let unregister = Effect::sync(move || {
        for tref in &refs {
            tref.waiters.lock().remove(&token);
        }
    });
    restore
        .apply(woken.wait())
        .ensuring(unregister)
        .widen::<E>()
        .then(attempt(body, restore, attempt_no + 1))
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Run this effect as a transaction: every [`TxRef`] change it makes
    /// becomes visible at once, or not at all.
    ///
    /// Nested calls join the enclosing transaction.
    pub fn atomically(self) -> Self {
        let body = self;
        with_fiber(move |state, _| {
            if state.journal.is_some() {
                return body.clone();
            }
            let body = body.clone();
            Effect::uninterruptible_mask(move |restore| attempt(body.clone(), restore, 1))
        })
    }

    /// Abandon the current attempt and wait until a ref it read changes.
    pub fn retry() -> Self {
        Effect::fail_cause(Signal::Retry.cause())
    }

    /// Run this transaction, falling back to `other` if it retries. Writes
    /// made by this branch are rolled back before `other` runs.
    pub fn or_else(self, other: Effect<A, E>) -> Self {
        let left = self;
        with_fiber(move |state, _| {
            let snapshot = state.journal.clone().unwrap_or_default();
            let other = other.clone();
            left.clone().catch_all_cause(move |cause| {
                if Signal::of(&cause) == Some(Signal::Retry) {
                    let snapshot = snapshot.clone();
                    with_fiber(move |state, _| {
                        if let Some(journal) = state.journal.as_mut() {
                            journal.rollback_to(&snapshot);
                        }
                        Effect::unit()
                    })
                    .then(other.clone())
                } else {
                    Effect::fail_cause(cause)
                }
            })
        })
        .atomically()
    }
}

impl<E: Data> Effect<(), E> {
    /// Retry unless `condition` holds.
    pub fn check(condition: bool) -> Self {
        if condition {
            Effect::unit()
        } else {
            Effect::retry()
        }
    }
}

// ============================================================================
// TxRef
// ============================================================================

/// A transactional cell.
pub struct TxRef<A> {
    inner: Arc<TxRefInner>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TxRef<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for TxRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxRef")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version())
            .finish()
    }
}

impl<A: Data> TxRef<A> {
    /// Create a ref outside any effect.
    pub fn new(value: A) -> Self {
        Self {
            inner: Arc::new(TxRefInner {
                id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
                live: Mutex::new(Versioned {
                    version: 0,
                    value: erase(value),
                }),
                waiters: Mutex::new(HashMap::new()),
            }),
            _marker: PhantomData,
        }
    }

    /// An effect creating a ref.
    pub fn make(value: A) -> Effect<Self, Never> {
        Effect::sync(move || TxRef::new(value.clone()))
    }

    /// Read the value.
    pub fn get(&self) -> Effect<A, Never> {
        let inner = self.inner.clone();
        with_journal(move |journal| journal.read(&inner).map(unerase::<A>))
    }

    /// Replace the value.
    pub fn set(&self, value: A) -> Effect<(), Never> {
        let inner = self.inner.clone();
        with_journal(move |journal| journal.write(&inner, erase(value.clone())))
    }

    /// Compute a result and a new value from the current one.
    pub fn modify<B, F>(&self, f: F) -> Effect<B, Never>
    where
        B: Data,
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        with_journal(move |journal| {
            let current = unerase::<A>(journal.read(&inner)?);
            let (result, next) = f(current);
            journal.write(&inner, erase(next))?;
            Ok(result)
        })
    }

    /// Apply `f` to the value.
    pub fn update<F>(&self, f: F) -> Effect<(), Never>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |value| ((), f(value)))
    }

    /// Apply `f` and yield the new value.
    pub fn update_and_get<F>(&self, f: F) -> Effect<A, Never>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |value| {
            let next = f(value);
            (next.clone(), next)
        })
    }

    /// Replace the value, yielding the previous one.
    pub fn get_and_set(&self, value: A) -> Effect<A, Never> {
        self.modify(move |previous| (previous, value.clone()))
    }

    /// Number of commits that have changed this ref.
    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    /// The committed value, read outside any transaction.
    pub fn snapshot(&self) -> A {
        unerase(self.inner.live.lock().value.clone())
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.inner.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_single_op_transactions() {
        let runtime = Runtime::current_thread();
        let counter = TxRef::new(10);
        let program = counter
            .update(|n| n + 5)
            .then(counter.get_and_set(1))
            .zip(counter.update_and_get(|n| n * 3));
        assert_eq!(runtime.run_exit(program).value(), Some(&(15, 3)));
        assert_eq!(counter.snapshot(), 3);
        assert_eq!(counter.version(), 3);
    }

    #[test]
    fn test_concurrent_increments() {
        let runtime = Runtime::current_thread();
        let counter = TxRef::new(0u64);
        let increment = counter.update(|n| n + 1);
        let program = increment
            .clone()
            .fork()
            .zip(increment.fork())
            .flat_map(|(a, b)| a.join().then(b.join()));
        assert!(runtime.run_exit(program).is_success());
        assert_eq!(counter.snapshot(), 2);
        assert_eq!(counter.version(), 2);
    }

    #[test]
    fn test_conflicting_attempt_is_rerun() {
        let runtime = Runtime::current_thread();
        let counter = TxRef::new(0u64);
        let attempts = Arc::new(AtomicUsize::new(0));
        let body = {
            let counter = counter.clone();
            let attempts = attempts.clone();
            Effect::sync(move || {
                attempts.fetch_add(1, Ordering::SeqCst);
            })
            .then(counter.get())
            .flat_map(move |n| Effect::yield_now().then(counter.set(n + 1)))
            .atomically()
        };
        let program = body
            .clone()
            .fork()
            .zip(body.fork())
            .flat_map(|(a, b)| a.join().then(b.join()));
        assert!(runtime.run_exit(program).is_success());
        assert_eq!(counter.snapshot(), 2);
        assert_eq!(counter.version(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failure_discards_writes() {
        let runtime = Runtime::current_thread();
        let cell = TxRef::new(0);
        let program = cell
            .set(9)
            .widen::<&str>()
            .then(Effect::<(), &str>::fail("abort"))
            .atomically();
        let exit = runtime.run_exit(program);
        assert_eq!(exit.cause().and_then(|c| c.first_error()), Some(&"abort"));
        assert_eq!(cell.snapshot(), 0);
        assert_eq!(cell.version(), 0);
    }

    #[test]
    fn test_retry_blocks_until_commit() {
        let runtime = Runtime::current_thread();
        let gate = TxRef::new(0);
        let waiting = {
            let gate = gate.clone();
            gate.get()
                .flat_map(|n| Effect::check(n >= 3).as_value(n))
                .atomically()
        };
        let fiber = runtime.run_fork(waiting);
        runtime.run_until_idle();
        assert!(fiber.poll().is_none());
        assert_eq!(gate.waiter_count(), 1);

        runtime.run_exit(gate.set(2));
        runtime.run_until_idle();
        assert!(fiber.poll().is_none());

        runtime.run_exit(gate.set(3));
        runtime.run_until_idle();
        assert_eq!(fiber.poll().and_then(|e| e.value().copied()), Some(3));
        assert_eq!(gate.waiter_count(), 0);
    }

    #[test]
    fn test_or_else_rolls_back_left() {
        let runtime = Runtime::current_thread();
        let cell = TxRef::new(1);
        let left = cell.set(5).then(Effect::retry());
        let program = left.or_else(cell.get());
        assert_eq!(runtime.run_exit(program).value(), Some(&1));
        assert_eq!(cell.snapshot(), 1);
        assert_eq!(cell.version(), 0);
    }

    #[test]
    fn test_or_else_keeps_left_success() {
        let runtime = Runtime::current_thread();
        let cell = TxRef::new(1);
        let program = cell.update_and_get(|n| n + 1).or_else(Effect::succeed(0));
        assert_eq!(runtime.run_exit(program).value(), Some(&2));
        assert_eq!(cell.snapshot(), 2);
    }

    #[test]
    fn test_interrupted_wait_unregisters() {
        let runtime = Runtime::current_thread();
        let gate = TxRef::new(false);
        let waiting = {
            let gate = gate.clone();
            gate.get().flat_map(Effect::check).atomically()
        };
        let program = waiting.fork().flat_map(|fiber| {
            Effect::yield_now()
                .then(Effect::yield_now())
                .then(fiber.interrupt())
        });
        let exit = runtime.run_exit(program);
        assert!(exit.value().unwrap().is_interrupted());
        assert_eq!(gate.waiter_count(), 0);
    }

    #[test]
    fn test_retry_bypasses_typed_handlers() {
        let runtime = Runtime::current_thread();
        let cell = TxRef::new(0);
        let caught = Arc::new(AtomicUsize::new(0));
        let seen = caught.clone();
        let body = cell
            .get()
            .widen::<&str>()
            .flat_map(|n| Effect::check(n > 0).as_value(n))
            .catch_all(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Effect::<i32, &str>::succeed(-1)
            })
            .atomically();
        let fiber = runtime.run_fork(body);
        runtime.run_until_idle();
        assert!(fiber.poll().is_none());
        runtime.run_exit(cell.set(4));
        runtime.run_until_idle();
        assert_eq!(fiber.poll().and_then(|e| e.value().copied()), Some(4));
        assert_eq!(caught.load(Ordering::SeqCst), 0);
    }
}
