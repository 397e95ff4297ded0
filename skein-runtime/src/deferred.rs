//! # Deferred
//!
//! A one-shot, multi-waiter promise. The first completion wins; every waiter,
//! past or future, observes the same exit.
//!
//! Waiters are resumed through their fiber's mailbox, never inline, so
//! completing a deferred from inside a fiber does not run other fibers on
//! the completer's stack.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{from_raw_exit, prim, Effect, Never, Prim, Primitive, RawExit};
use crate::erased::Data;
use crate::exit::Exit;
use crate::fiber::Resume;

type Waiter = Box<dyn FnOnce(&RawExit) + Send>;

enum CellState {
    Pending { waiters: Vec<(u64, Waiter)>, next_key: u64 },
    Done(RawExit),
}

/// Untyped deferred shared by the typed view and by runtime internals.
pub(crate) struct DeferredCell {
    state: Mutex<CellState>,
}

impl DeferredCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState::Pending {
                waiters: Vec::new(),
                next_key: 0,
            }),
        })
    }

    /// Store `exit` and wake every waiter. Returns false if the cell was
    /// already complete.
    pub(crate) fn complete(&self, exit: RawExit) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                CellState::Done(_) => return false,
                CellState::Pending { waiters, .. } => {
                    let waiters = std::mem::take(waiters);
                    *state = CellState::Done(exit.clone());
                    waiters
                }
            }
        };
        for (_, waiter) in waiters {
            waiter(&exit);
        }
        true
    }

    pub(crate) fn poll(&self) -> Option<RawExit> {
        match &*self.state.lock() {
            CellState::Done(exit) => Some(exit.clone()),
            CellState::Pending { .. } => None,
        }
    }

    /// Register a waiter. Runs it immediately, returning `None`, when the
    /// cell is already complete.
    fn add_waiter(&self, waiter: Waiter) -> Option<u64> {
        let mut state = self.state.lock();
        match &mut *state {
            CellState::Done(exit) => {
                let exit = exit.clone();
                drop(state);
                waiter(&exit);
                None
            }
            CellState::Pending { waiters, next_key } => {
                let key = *next_key;
                *next_key += 1;
                waiters.push((key, waiter));
                Some(key)
            }
        }
    }

    fn remove_waiter(&self, key: u64) {
        if let CellState::Pending { waiters, .. } = &mut *self.state.lock() {
            waiters.retain(|(k, _)| *k != key);
        }
    }

    /// Suspend the running fiber until the cell completes, then replay its
    /// exit. Interrupting the wait unregisters the waiter.
    pub(crate) fn wait(self: &Arc<Self>) -> Prim {
        let cell = self.clone();
        prim(Primitive::Suspend(Arc::new(move || {
            if let Some(exit) = cell.poll() {
                return from_raw_exit(exit);
            }
            let cell = cell.clone();
            prim(Primitive::Async(Arc::new(move |resume: Resume| {
                let waker = resume.clone();
                let key = cell.add_waiter(Box::new(move |exit: &RawExit| {
                    waker.resume(from_raw_exit(exit.clone()))
                }));
                let cell = cell.clone();
                key.map(|key| Effect::<(), Never>::sync(move || cell.remove_waiter(key)).prim)
            })))
        })))
    }
}

/// A one-shot promise that fibers can wait on.
pub struct Deferred<A, E = Never> {
    cell: Arc<DeferredCell>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(*self.cell.state.lock(), CellState::Done(_));
        f.debug_struct("Deferred").field("done", &done).finish()
    }
}

impl<A: Data, E: Data> Default for Deferred<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Data, E: Data> Deferred<A, E> {
    /// Create an empty deferred outside any effect.
    pub fn new() -> Self {
        Self {
            cell: DeferredCell::new(),
            _marker: PhantomData,
        }
    }

    /// An effect creating an empty deferred.
    pub fn make() -> Effect<Self, Never> {
        Effect::sync(Self::new)
    }

    /// Suspend until the deferred completes, then adopt its outcome.
    pub fn wait(&self) -> Effect<A, E> {
        Effect::from_prim(self.cell.wait())
    }

    /// Complete with a value. Yields false if already complete.
    pub fn succeed(&self, value: A) -> Effect<bool, Never> {
        self.done(Exit::Success(value))
    }

    /// Complete with a typed failure.
    pub fn fail(&self, error: E) -> Effect<bool, Never> {
        self.done(Exit::fail(error))
    }

    /// Complete with a failure cause.
    pub fn fail_cause(&self, cause: Cause<E>) -> Effect<bool, Never> {
        self.done(Exit::fail_cause(cause))
    }

    /// Complete with an exit.
    pub fn done(&self, exit: Exit<A, E>) -> Effect<bool, Never> {
        let this = self.clone();
        Effect::sync(move || this.complete_now(exit.clone()))
    }

    /// Run `effect` and complete with its outcome.
    pub fn complete(&self, effect: Effect<A, E>) -> Effect<bool, Never> {
        let this = self.clone();
        effect.exit().flat_map(move |exit| this.done(exit))
    }

    /// Complete from outside any fiber.
    pub fn complete_now(&self, exit: Exit<A, E>) -> bool {
        self.cell.complete(exit.erase())
    }

    /// The outcome if complete.
    pub fn poll(&self) -> Option<Exit<A, E>> {
        self.cell.poll().map(|exit| exit.unerase())
    }

    /// True once complete.
    pub fn is_done(&self) -> bool {
        self.cell.poll().is_some()
    }
}
