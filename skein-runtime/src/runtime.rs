//! # Runtime
//!
//! The entry point for running effects. A [`Runtime`] owns a scheduler and a
//! root [`Context`], and offers the ways in from ordinary code:
//!
//! - [`Runtime::run_fork`]: start a root fiber and return its handle
//! - [`Runtime::run_callback`]: start a root fiber and get its exit later
//! - [`Runtime::run_exit`]: block until the effect finishes; never panics
//! - [`Runtime::run_sync`]: like `run_exit`, as a `Result`
//!
//! A current-thread runtime has no threads of its own: the blocking calls
//! drive its queue on the caller's thread, and [`Runtime::run_until_idle`]
//! drives it explicitly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::cause::Cause;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::effect::Effect;
use crate::erased::Data;
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberConfig, FiberInner};
use crate::scheduler::{CurrentThreadScheduler, Scheduler, WorkStealingScheduler};

/// How long a blocked `run_exit` waits before looking at the queue again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs effects on a scheduler.
pub struct Runtime {
    scheduler: Arc<dyn Scheduler>,
    /// Present for current-thread runtimes; drained by the blocking calls.
    driver: Option<Arc<CurrentThreadScheduler>>,
    /// Present when the runtime owns a worker pool.
    pool: Option<Arc<WorkStealingScheduler>>,
    context: Context,
    config: RuntimeConfig,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("current_thread", &self.driver.is_some())
            .field("workers", &self.pool.as_ref().map(|pool| pool.num_workers()))
            .field("services", &self.context.len())
            .finish()
    }
}

impl Runtime {
    /// Create a runtime backed by a work-stealing worker pool.
    pub fn new(config: RuntimeConfig) -> Self {
        let pool = Arc::new(WorkStealingScheduler::new(config.scheduler.clone()));
        debug!(workers = pool.num_workers(), "runtime started");
        Self {
            scheduler: pool.clone(),
            driver: None,
            pool: Some(pool),
            context: Context::empty(),
            config,
        }
    }

    /// Create a single-threaded, deterministic runtime driven by the
    /// calling thread.
    pub fn current_thread() -> Self {
        Self::current_thread_with(RuntimeConfig::default())
    }

    /// Like [`Runtime::current_thread`], using the fairness settings and
    /// timeout from `config`.
    pub fn current_thread_with(config: RuntimeConfig) -> Self {
        let driver = Arc::new(CurrentThreadScheduler::from_config(&config.scheduler));
        Self {
            scheduler: driver.clone(),
            driver: Some(driver),
            pool: None,
            context: Context::empty(),
            config,
        }
    }

    /// Create a runtime on a caller-supplied scheduler.
    pub fn with_scheduler(scheduler: Arc<dyn Scheduler>, config: RuntimeConfig) -> Self {
        Self {
            scheduler,
            driver: None,
            pool: None,
            context: Context::empty(),
            config,
        }
    }

    /// Make the services in `context` available to every root fiber.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = self.context.merge(&context);
        self
    }

    /// The root context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The scheduler fibers run on.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Start `effect` on a new root fiber.
    pub fn run_fork<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Fiber<A, E> {
        let fiber = FiberInner::new_root(
            self.scheduler.clone(),
            self.context.clone(),
            &FiberConfig::default(),
        );
        fiber.start(effect.prim);
        Fiber::from_inner(fiber)
    }

    /// Start `effect` and call `callback` with its exit once it finishes.
    pub fn run_callback<A, E, F>(&self, effect: Effect<A, E>, callback: F) -> Fiber<A, E>
    where
        A: Data,
        E: Data,
        F: FnOnce(Exit<A, E>) + Send + 'static,
    {
        let fiber = self.run_fork(effect);
        fiber.on_done(callback);
        fiber
    }

    /// Run `effect` to completion, blocking the calling thread.
    pub fn run_exit<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let slot = Arc::new((Mutex::new(None), Condvar::new()));
        let done = slot.clone();
        self.run_callback(effect, move |exit| {
            let (exit_slot, ready) = &*done;
            *exit_slot.lock() = Some(exit);
            ready.notify_all();
        });

        let (exit_slot, ready) = &*slot;
        loop {
            self.run_until_idle();
            let mut finished = exit_slot.lock();
            if let Some(exit) = finished.take() {
                return exit;
            }
            match &self.driver {
                Some(driver) => {
                    drop(finished);
                    driver.park(POLL_INTERVAL);
                }
                None => {
                    ready.wait_for(&mut finished, POLL_INTERVAL);
                }
            }
        }
    }

    /// Run `effect` to completion, blocking the calling thread, and return
    /// its value or the cause it failed with.
    ///
    /// The configured default timeout, if any, applies; an expired timeout
    /// is reported as a defect.
    pub fn run_sync<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Result<A, FiberFailure<E>> {
        let effect = match self.config.timeout.default_timeout {
            Some(limit) => effect.timeout_die(limit),
            None => effect,
        };
        self.run_exit(effect)
            .into_result()
            .map_err(|cause| FiberFailure { cause })
    }

    /// Run queued tasks on the calling thread until none are left,
    /// returning how many ran. Pool-backed runtimes return 0.
    pub fn run_until_idle(&self) -> usize {
        match &self.driver {
            Some(driver) => driver.run_until_idle(),
            None => self.scheduler.run_pending(),
        }
    }

    /// Stop the worker pool, waiting for workers up to the configured
    /// grace period.
    pub fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            if !pool.is_shutting_down() {
                debug!("runtime shutting down");
                pool.shutdown();
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The failure of an effect run with [`Runtime::run_sync`].
pub struct FiberFailure<E> {
    cause: Cause<E>,
}

impl<E> FiberFailure<E> {
    /// The cause the effect failed with.
    pub fn cause(&self) -> &Cause<E> {
        &self.cause
    }

    /// Take the cause.
    pub fn into_cause(self) -> Cause<E> {
        self.cause
    }
}

impl<E: fmt::Debug> fmt::Debug for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberFailure")
            .field("cause", &self.cause)
            .finish()
    }
}

impl<E: fmt::Debug> fmt::Display for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber failed: {}", self.cause)
    }
}

impl<E: fmt::Debug> std::error::Error for FiberFailure<E> {}
