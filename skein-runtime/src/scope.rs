//! # Scopes
//!
//! A [`Scope`] collects finalizers and runs them exactly once when it is
//! closed. Sequential scopes release in reverse order of registration, so
//! later acquisitions are released first; parallel scopes run every
//! finalizer concurrently and wait for all of them.
//!
//! Every acquire/release pattern in the crate reduces to
//! [`Scope::add_finalizer`] plus ordinary sequencing. The scope an effect
//! runs in is found through the [`CURRENT_SCOPE`] tag.
//!
//! ```text
//!   make ──► Empty ──add_finalizer──► Open ──close(exit)──► Closed(exit)
//!              └──────────────close(exit)────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::cause::Cause;
use crate::context::Tag;
use crate::deferred::Deferred;
use crate::effect::{absurd, Effect, Never};
use crate::erased::Data;
use crate::exit::{Exit, ScopeExit};
use crate::fiber::Fiber;

/// The scope an effect is running in.
pub const CURRENT_SCOPE: Tag<Scope> = Tag::new("skein/Scope");

/// How a scope runs its finalizers on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// One at a time, last registered first.
    #[default]
    Sequential,
    /// All at once; close waits for every finalizer.
    Parallel,
}

/// Observable state of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    /// Open with no finalizers.
    Empty,
    /// Open with at least one finalizer.
    Open,
    /// Closed; no further finalizers are accepted.
    Closed,
}

/// Handle for removing a registered finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FinalizerKey(u64);

/// Cleanup run with the exit the scope closes with.
pub type Finalizer = Arc<dyn Fn(&ScopeExit) -> Effect<(), Never> + Send + Sync>;

enum ScopeState {
    Open {
        finalizers: BTreeMap<FinalizerKey, Finalizer>,
        next_key: u64,
    },
    Closed {
        exit: ScopeExit,
    },
}

struct ScopeInner {
    id: u64,
    strategy: ExecutionStrategy,
    state: Mutex<ScopeState>,
    /// Completed once the first close has run every finalizer.
    released: Deferred<()>,
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// A resource lifetime boundary.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("strategy", &self.inner.strategy)
            .field("status", &self.status())
            .finish()
    }
}

impl Scope {
    /// Create an open scope outside any effect.
    pub fn new(strategy: ExecutionStrategy) -> Self {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        trace!(scope_id = id, ?strategy, "scope created");
        Self {
            inner: Arc::new(ScopeInner {
                id,
                strategy,
                state: Mutex::new(ScopeState::Open {
                    finalizers: BTreeMap::new(),
                    next_key: 0,
                }),
                released: Deferred::new(),
            }),
        }
    }

    /// An effect creating an open scope.
    pub fn make(strategy: ExecutionStrategy) -> Effect<Scope, Never> {
        Effect::sync(move || Scope::new(strategy))
    }

    /// Unique id, for diagnostics.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The finalizer strategy.
    pub fn strategy(&self) -> ExecutionStrategy {
        self.inner.strategy
    }

    /// Current state.
    pub fn status(&self) -> ScopeStatus {
        match &*self.inner.state.lock() {
            ScopeState::Open { finalizers, .. } if finalizers.is_empty() => ScopeStatus::Empty,
            ScopeState::Open { .. } => ScopeStatus::Open,
            ScopeState::Closed { .. } => ScopeStatus::Closed,
        }
    }

    /// The exit the scope was closed with.
    pub fn exit(&self) -> Option<ScopeExit> {
        match &*self.inner.state.lock() {
            ScopeState::Closed { exit } => Some(exit.clone()),
            ScopeState::Open { .. } => None,
        }
    }

    /// Number of registered finalizers.
    pub fn finalizer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            ScopeState::Open { finalizers, .. } => finalizers.len(),
            ScopeState::Closed { .. } => 0,
        }
    }

    /// Register a finalizer. On a closed scope it runs immediately with the
    /// stored exit instead of being dropped.
    pub fn add_finalizer<F>(&self, finalizer: F) -> Effect<FinalizerKey, Never>
    where
        F: Fn(&ScopeExit) -> Effect<(), Never> + Send + Sync + 'static,
    {
        let finalizer: Finalizer = Arc::new(finalizer);
        let inner = self.inner.clone();
        Effect::suspend(move || {
            let registered = {
                let mut state = inner.state.lock();
                match &mut *state {
                    ScopeState::Open {
                        finalizers,
                        next_key,
                    } => {
                        let key = FinalizerKey(*next_key);
                        *next_key += 1;
                        finalizers.insert(key, finalizer.clone());
                        Ok(key)
                    }
                    ScopeState::Closed { exit } => Err(exit.clone()),
                }
            };
            match registered {
                Ok(key) => Effect::succeed(key),
                Err(exit) => {
                    let finalizer = finalizer.clone();
                    Effect::suspend(move || finalizer(&exit))
                        .uninterruptible()
                        .as_value(FinalizerKey(u64::MAX))
                }
            }
        })
    }

    /// Unregister a finalizer without running it.
    pub fn remove_finalizer(&self, key: FinalizerKey) -> Effect<bool, Never> {
        let this = self.clone();
        Effect::sync(move || this.remove_finalizer_now(key))
    }

    pub(crate) fn remove_finalizer_now(&self, key: FinalizerKey) -> bool {
        match &mut *self.inner.state.lock() {
            ScopeState::Open { finalizers, .. } => finalizers.remove(&key).is_some(),
            ScopeState::Closed { .. } => false,
        }
    }

    /// Close the scope, running its finalizers with `exit`, and yield the
    /// exit the scope is closed with.
    ///
    /// Closing twice is a no-op: the second close waits for the first to
    /// finish releasing and yields the original exit. Finalizer failures
    /// are combined in release order and fail the first close.
    pub fn close(&self, exit: ScopeExit) -> Effect<ScopeExit, Never> {
        let inner = self.inner.clone();
        Effect::suspend(move || {
            let taken = {
                let mut state = inner.state.lock();
                match &mut *state {
                    ScopeState::Open { finalizers, .. } => {
                        let finalizers = std::mem::take(finalizers);
                        *state = ScopeState::Closed { exit: exit.clone() };
                        Some(finalizers)
                    }
                    ScopeState::Closed { .. } => None,
                }
            };
            let inner = inner.clone();
            match taken {
                None => {
                    let stored = inner.clone();
                    inner.released.wait().flat_map(move |_| {
                        let exit = match &*stored.state.lock() {
                            ScopeState::Closed { exit } => exit.clone(),
                            ScopeState::Open { .. } => Exit::Success(()),
                        };
                        Effect::succeed(exit)
                    })
                }
                Some(finalizers) => {
                    trace!(scope_id = inner.id, count = finalizers.len(), "closing scope");
                    let ordered: Vec<Finalizer> = finalizers.into_values().rev().collect();
                    let exit = exit.clone();
                    run_finalizers(ordered, inner.strategy, exit.clone()).flat_map(move |cause| {
                        let released = inner.released.succeed(());
                        if cause.is_empty() {
                            released.as_value(exit.clone())
                        } else {
                            warn!(
                                scope_id = inner.id,
                                failures = cause.len(),
                                "scope finalizers failed"
                            );
                            released.then(Effect::fail_cause(cause))
                        }
                    })
                }
            }
        })
        .uninterruptible()
    }

    /// Create a child scope. The child is closed when this scope closes,
    /// unless it was closed first; closing the child detaches it.
    pub fn fork(&self, strategy: ExecutionStrategy) -> Effect<Scope, Never> {
        let parent = self.clone();
        Effect::suspend(move || {
            let child = Scope::new(strategy);
            let closing = child.clone();
            let parent = parent.clone();
            parent
                .add_finalizer(move |exit| closing.close(exit.clone()).as_unit())
                .flat_map(move |key| {
                    let parent = parent.clone();
                    child
                        .add_finalizer(move |_| parent.remove_finalizer(key).as_unit())
                        .as_value(child.clone())
                })
        })
        .uninterruptible()
    }

    /// Run `effect` in this scope without closing it.
    pub fn extend<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        effect.provide_service(CURRENT_SCOPE, self.clone())
    }

    /// Run `effect` in this scope, then close the scope with its exit.
    pub fn use_scope<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        let scope = self.clone();
        self.extend(effect)
            .on_exit(move |exit| scope.close(exit.to_scope_exit()).as_unit())
    }
}

/// Run finalizers in the given order (or concurrently), collecting every
/// failure. Panics inside a finalizer are failures too.
fn run_finalizers(
    finalizers: Vec<Finalizer>,
    strategy: ExecutionStrategy,
    exit: ScopeExit,
) -> Effect<Cause<Never>, Never> {
    let exit = Arc::new(exit);
    let run_one = move |finalizer: Finalizer| {
        let exit = exit.clone();
        Effect::suspend(move || finalizer(&*exit)).exit()
    };
    let exits = match strategy {
        ExecutionStrategy::Sequential => Effect::for_each(finalizers, run_one),
        ExecutionStrategy::Parallel => Effect::for_each_par(finalizers, run_one),
    };
    exits.map(|exits| {
        exits
            .into_iter()
            .filter_map(|exit| match exit {
                Exit::Failure(cause) => Some(cause),
                Exit::Success(()) => None,
            })
            .fold(Cause::empty(), Cause::sequential)
    })
}

// ============================================================================
// Effects
// ============================================================================

impl<E: Data> Effect<Scope, E> {
    /// The scope the running effect is in. A missing scope is a defect.
    pub fn scope() -> Self {
        Effect::service(CURRENT_SCOPE)
    }
}

impl<E: Data> Effect<(), E> {
    /// Register a finalizer on the current scope.
    pub fn add_finalizer<F>(finalizer: F) -> Self
    where
        F: Fn(&ScopeExit) -> Effect<(), Never> + Send + Sync + 'static,
    {
        let finalizer = Arc::new(finalizer);
        Effect::<Scope, E>::scope().flat_map(move |scope| {
            let finalizer = finalizer.clone();
            scope
                .add_finalizer(move |exit| finalizer(exit))
                .as_unit()
                .widen::<E>()
        })
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Run in a fresh scope that is closed with the effect's exit.
    pub fn scoped(self) -> Self {
        Scope::make(ExecutionStrategy::Sequential)
            .widen::<E>()
            .flat_map(move |scope| scope.use_scope(self.clone()))
    }

    /// Acquire a resource uninterruptibly and register its release on the
    /// current scope.
    pub fn acquire_release<R>(acquire: Effect<A, E>, release: R) -> Self
    where
        R: Fn(A, &ScopeExit) -> Effect<(), Never> + Send + Sync + 'static,
    {
        let release = Arc::new(release);
        acquire
            .tap(move |resource| {
                let resource = resource.clone();
                let release = release.clone();
                Effect::add_finalizer(move |exit| release(resource.clone(), exit))
            })
            .uninterruptible()
    }

    /// Acquire, use and release a resource without a scope. Release runs
    /// uninterruptibly with the outcome of `use_fn`, however it ends.
    pub fn acquire_use_release<B, U, R>(acquire: Effect<A, E>, use_fn: U, release: R) -> Effect<B, E>
    where
        B: Data,
        U: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
        R: Fn(A, &Exit<B, E>) -> Effect<(), Never> + Send + Sync + 'static,
    {
        let use_fn = Arc::new(use_fn);
        let release = Arc::new(release);
        Effect::uninterruptible_mask(move |restore| {
            let use_fn = use_fn.clone();
            let release = release.clone();
            acquire.clone().flat_map(move |resource| {
                let release = release.clone();
                let held = resource.clone();
                restore
                    .apply(use_fn(resource))
                    .on_exit(move |exit| release(held.clone(), exit))
            })
        })
    }

    /// Fork a fiber whose lifetime is bound to `scope`: closing the scope
    /// interrupts it.
    pub fn fork_in(self, scope: &Scope) -> Effect<Fiber<A, E>, Never> {
        let scope = scope.clone();
        let body = self;
        Effect::uninterruptible_mask(move |restore| {
            let scope = scope.clone();
            restore
                .apply(body.clone())
                .fork_daemon()
                .flat_map(move |fiber| {
                    let interrupting = fiber.clone();
                    let scope = scope.clone();
                    scope
                        .add_finalizer(move |_| interrupting.interrupt().as_unit())
                        .flat_map(move |key| {
                            let scope = scope.clone();
                            let detached = fiber.clone();
                            Effect::sync(move || {
                                let scope = scope.clone();
                                detached.on_done(move |_| {
                                    scope.remove_finalizer_now(key);
                                })
                            })
                            .as_value(fiber.clone())
                        })
                })
        })
    }

    /// Fork a fiber bound to the current scope.
    pub fn fork_scoped(self) -> Effect<Fiber<A, E>, Never> {
        Effect::<Scope, Never>::scope().flat_map(move |scope| self.clone().fork_in(&scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Defect;
    use crate::runtime::Runtime;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl Fn(&ScopeExit) -> Effect<(), Never> {
        let log = log.clone();
        move |_: &ScopeExit| {
            let log = log.clone();
            Effect::sync(move || log.lock().push(name))
        }
    }

    #[test]
    fn test_sequential_close_is_lifo() {
        let runtime = Runtime::current_thread();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new(ExecutionStrategy::Sequential);
        assert_eq!(scope.status(), ScopeStatus::Empty);
        let program = scope
            .add_finalizer(recorder(&log, "A"))
            .then(scope.add_finalizer(recorder(&log, "B")))
            .then(scope.add_finalizer(recorder(&log, "C")))
            .then(scope.close(Exit::Success(())));
        assert!(runtime.run_exit(program).is_success());
        assert_eq!(*log.lock(), vec!["C", "B", "A"]);
        assert_eq!(scope.status(), ScopeStatus::Closed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let runtime = Runtime::current_thread();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new(ExecutionStrategy::Sequential);
        runtime.run_exit(scope.add_finalizer(recorder(&log, "only")));
        let first = runtime.run_exit(scope.close(Exit::die(Defect::new("boom"))));
        let second = runtime.run_exit(scope.close(Exit::Success(())));
        assert_eq!(log.lock().len(), 1);
        let first = first.value().cloned().unwrap();
        let second = second.value().cloned().unwrap();
        assert!(first.is_failure());
        assert!(second.is_failure());
        assert!(scope.exit().unwrap().is_failure());
    }

    #[test]
    fn test_add_to_closed_scope_runs_immediately() {
        let runtime = Runtime::current_thread();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new(ExecutionStrategy::Sequential);
        runtime.run_exit(scope.close(Exit::Success(())));
        runtime.run_exit(scope.add_finalizer(recorder(&log, "late")));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn test_finalizer_failures_are_combined() {
        let runtime = Runtime::current_thread();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new(ExecutionStrategy::Sequential);
        let program = scope
            .add_finalizer(recorder(&log, "first"))
            .then(scope.add_finalizer(|_| Effect::die_message("broken")))
            .then(scope.add_finalizer(|_| Effect::sync(|| panic!("panicked"))))
            .then(scope.close(Exit::Success(())));
        let exit = runtime.run_exit(program);
        let cause = exit.cause().unwrap();
        assert_eq!(cause.defects().count(), 2);
        assert_eq!(cause.defects().next().unwrap().message, "panicked");
        assert_eq!(*log.lock(), vec!["first"]);
    }

    #[test]
    fn test_parallel_close_runs_all() {
        let runtime = Runtime::current_thread();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new(ExecutionStrategy::Parallel);
        let program = Effect::for_each(["x", "y", "z"], {
            let scope = scope.clone();
            let log = log.clone();
            move |name| scope.add_finalizer(recorder(&log, name))
        })
        .then(scope.close(Exit::Success(())));
        assert!(runtime.run_exit(program).is_success());
        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_forked_scope_closes_with_parent() {
        let runtime = Runtime::current_thread();
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = Scope::new(ExecutionStrategy::Sequential);
        let child = runtime
            .run_sync(parent.fork(ExecutionStrategy::Sequential))
            .unwrap();
        runtime.run_exit(child.add_finalizer(recorder(&log, "child")));
        assert_eq!(parent.finalizer_count(), 1);
        runtime.run_exit(parent.close(Exit::Success(())));
        assert_eq!(*log.lock(), vec!["child"]);
        assert_eq!(child.status(), ScopeStatus::Closed);
    }

    #[test]
    fn test_closing_child_detaches_from_parent() {
        let runtime = Runtime::current_thread();
        let parent = Scope::new(ExecutionStrategy::Sequential);
        let child = runtime
            .run_sync(parent.fork(ExecutionStrategy::Sequential))
            .unwrap();
        runtime.run_exit(child.close(Exit::Success(())));
        assert_eq!(parent.finalizer_count(), 0);
        assert_eq!(parent.status(), ScopeStatus::Empty);
    }

    #[test]
    fn test_scoped_acquire_release() {
        let runtime = Runtime::current_thread();
        let log = Arc::new(Mutex::new(Vec::new()));
        let acquire_log = log.clone();
        let release_log = log.clone();
        let use_log = log.clone();
        let resource = Effect::<&'static str, ()>::acquire_release(
            Effect::sync(move || {
                acquire_log.lock().push("acquire");
                "handle"
            }),
            move |handle, exit| {
                let log = release_log.clone();
                let success = exit.is_success();
                Effect::sync(move || log.lock().push(if success { handle } else { "failed" }))
            },
        );
        let program = resource
            .flat_map(move |handle| {
                let log = use_log.clone();
                Effect::sync(move || log.lock().push("use")).as_value(handle)
            })
            .scoped();
        assert_eq!(runtime.run_exit(program).value(), Some(&"handle"));
        assert_eq!(*log.lock(), vec!["acquire", "use", "handle"]);
    }

    #[test]
    fn test_acquire_use_release_on_failure() {
        let runtime = Runtime::current_thread();
        let released = Arc::new(Mutex::new(None));
        let slot = released.clone();
        let program = Effect::<u32, &str>::acquire_use_release(
            Effect::succeed(7),
            |_| Effect::<u32, &str>::fail("use failed"),
            move |resource, exit| {
                let slot = slot.clone();
                let failed = exit.is_failure();
                Effect::sync(move || *slot.lock() = Some((resource, failed)))
            },
        );
        let exit = runtime.run_exit(program);
        assert_eq!(exit.cause().unwrap().first_error(), Some(&"use failed"));
        assert_eq!(*released.lock(), Some((7, true)));
    }

    #[test]
    fn test_fork_in_scope_is_interrupted_on_close() {
        let runtime = Runtime::current_thread();
        let scope = Scope::new(ExecutionStrategy::Sequential);
        let fiber = runtime
            .run_sync(Effect::<(), ()>::never().fork_in(&scope))
            .unwrap();
        runtime.run_until_idle();
        assert!(fiber.poll().is_none());
        runtime.run_exit(scope.close(Exit::Success(())));
        assert!(fiber.poll().unwrap().is_interrupted());
    }

    #[test]
    fn test_missing_scope_is_a_defect() {
        let runtime = Runtime::current_thread();
        let exit = runtime.run_exit(Effect::<(), ()>::add_finalizer(|_| Effect::unit()));
        assert!(exit.cause().unwrap().is_die());
    }
}
