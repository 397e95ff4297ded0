//! # Fibers
//!
//! Lightweight, cooperatively scheduled units of effect execution.
//!
//! ## Design
//!
//! Each fiber is a small actor. Everything that wants to affect a fiber
//! (starting it, resuming it from an async callback, interrupting it) posts a
//! message to its mailbox. At most one scheduler task drains the mailbox at a
//! time, which gives:
//!
//! - strictly sequential, FIFO continuation order per fiber
//! - no interpreter state shared between threads mid-step
//!
//! Interruption is cooperative. Requesting it sets a flag the interpreter
//! checks between steps and, if the fiber is suspended in an interruptible
//! region, wakes it with an `Interrupt` failure.
//!
//! Forked fibers are attached to their parent: when the parent finishes it
//! interrupts its remaining children and waits for them before reporting its
//! own exit. [`Effect::fork_daemon`] opts out.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace, warn, Span};

use crate::cause::Cause;
use crate::context::Context;
use crate::effect::{
    fail_raw, from_raw_exit, prim, with_fiber, Effect, Never, Prim, Primitive, RawCause, RawExit,
};
use crate::erased::Data;
use crate::exit::Exit;
use crate::interpreter::{run_loop, Frame, Step};
use crate::panic::catch_defect;
use crate::scheduler::Scheduler;
use crate::stm::Journal;

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub u64);

impl FiberId {
    /// Create a new fiber ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Observable lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Executing or queued to execute.
    Running,
    /// Waiting on an async callback.
    Suspended,
    /// Finished; the exit is available.
    Done,
}

const STATUS_RUNNING: u8 = 0;
const STATUS_SUSPENDED: u8 = 1;
const STATUS_DONE: u8 = 2;

/// Priority level for fibers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Low priority (background tasks).
    Low = 0,
    /// Normal priority (default).
    #[default]
    Normal = 1,
    /// High priority (latency-sensitive).
    High = 2,
    /// Critical priority (system tasks).
    Critical = 3,
}

/// Configuration for fiber creation.
#[derive(Debug, Clone, Default)]
pub struct FiberConfig {
    /// Optional name for debugging.
    pub name: Option<String>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Detach from the parent's lifetime.
    pub daemon: bool,
}

impl FiberConfig {
    /// Create a new fiber configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fiber name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Detach the fiber from its parent.
    pub fn daemon(mut self) -> Self {
        self.daemon = true;
        self
    }
}

// ============================================================================
// Runtime state
// ============================================================================

/// Interpreter state, owned by whichever task is draining the mailbox.
pub(crate) struct FiberState {
    /// Services visible to the running effect.
    pub(crate) context: Context,
    /// Whether interruption is currently observed.
    pub(crate) interruptible: bool,
    /// Continuation stack.
    pub(crate) stack: Vec<Frame>,
    /// Ops run since the last yield.
    pub(crate) ops: usize,
    /// Node to continue with on the next drain.
    pub(crate) resume_point: Option<Prim>,
    /// Present while waiting on an async callback.
    pub(crate) suspension: Option<Suspension>,
    /// Incremented on each async registration; stale resumes are dropped.
    pub(crate) async_epoch: u64,
    /// Transaction journal while inside an STM attempt.
    pub(crate) journal: Option<Journal>,
    /// Current tracing span.
    pub(crate) span: Option<Span>,
}

impl FiberState {
    fn new(context: Context, span: Option<Span>) -> Self {
        Self {
            context,
            interruptible: true,
            stack: Vec::new(),
            ops: 0,
            resume_point: None,
            suspension: None,
            async_epoch: 0,
            journal: None,
            span,
        }
    }
}

/// An outstanding async registration.
pub(crate) struct Suspension {
    pub(crate) epoch: u64,
    pub(crate) canceler: Option<Prim>,
}

enum Message {
    Resume { epoch: u64, next: Prim },
    Interrupt,
}

enum Drain {
    Idle,
    Yielded,
    Done(RawExit),
}

type Observer = Box<dyn FnOnce(&RawExit) + Send>;

#[derive(Default)]
struct Completion {
    exit: Option<RawExit>,
    observers: Vec<(u64, Observer)>,
    next_key: u64,
}

/// Shared fiber internals.
pub(crate) struct FiberInner {
    id: FiberId,
    name: Option<String>,
    parent: Option<Weak<FiberInner>>,
    parent_id: Option<FiberId>,
    priority: Priority,
    created_at: Instant,
    scheduler: Arc<dyn Scheduler>,
    max_ops: usize,
    state: Mutex<FiberState>,
    mailbox: Mutex<VecDeque<Message>>,
    /// True while a drain task is queued or running.
    running: AtomicBool,
    status: AtomicU8,
    interrupt_requested: AtomicBool,
    interruptors: Mutex<Vec<Option<FiberId>>>,
    children: Mutex<HashMap<FiberId, Arc<FiberInner>>>,
    completion: Mutex<Completion>,
}

impl FiberInner {
    /// Create a fiber with no parent.
    pub(crate) fn new_root(
        scheduler: Arc<dyn Scheduler>,
        context: Context,
        config: &FiberConfig,
    ) -> Arc<Self> {
        Self::create(scheduler, context, None, None, config)
    }

    fn create(
        scheduler: Arc<dyn Scheduler>,
        context: Context,
        span: Option<Span>,
        parent: Option<&Arc<FiberInner>>,
        config: &FiberConfig,
    ) -> Arc<Self> {
        let max_ops = scheduler.max_ops_before_yield().max(1);
        let attached = parent.filter(|_| !config.daemon);
        let fiber = Arc::new(Self {
            id: next_fiber_id(),
            name: config.name.clone(),
            parent: attached.map(Arc::downgrade),
            parent_id: parent.map(|p| p.id),
            priority: config.priority,
            created_at: Instant::now(),
            scheduler,
            max_ops,
            state: Mutex::new(FiberState::new(context, span)),
            mailbox: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            status: AtomicU8::new(STATUS_RUNNING),
            interrupt_requested: AtomicBool::new(false),
            interruptors: Mutex::new(Vec::new()),
            children: Mutex::new(HashMap::new()),
            completion: Mutex::new(Completion::default()),
        });
        if let Some(parent) = attached {
            parent.children.lock().insert(fiber.id, fiber.clone());
        }
        trace!(fiber_id = %fiber.id, parent = ?fiber.parent_id, name = ?fiber.name, "fiber created");
        fiber
    }

    /// Fork a child of the running fiber.
    pub(crate) fn spawn_child(
        state: &FiberState,
        parent: &Arc<FiberInner>,
        config: &FiberConfig,
    ) -> Arc<Self> {
        Self::create(
            parent.scheduler.clone(),
            state.context.clone(),
            state.span.clone(),
            Some(parent),
            config,
        )
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn max_ops_before_yield(&self) -> usize {
        self.max_ops
    }

    /// Begin running `effect`.
    pub(crate) fn start(self: &Arc<Self>, effect: Prim) {
        self.state.lock().resume_point = Some(effect);
        self.schedule_drain();
    }

    fn tell(self: &Arc<Self>, message: Message) {
        self.mailbox.lock().push_back(message);
        self.schedule_drain();
    }

    fn schedule_drain(self: &Arc<Self>) {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.submit();
        }
    }

    fn submit(self: &Arc<Self>) {
        let fiber = self.clone();
        self.scheduler
            .schedule_task(Box::new(move || fiber.drain()), self.priority);
    }

    fn drain(self: &Arc<Self>) {
        loop {
            let outcome = {
                let mut state = self.state.lock();
                self.drain_messages(&mut state)
            };
            match outcome {
                Drain::Yielded => {
                    // Keep `running` set; the resubmitted task owns the fiber.
                    self.submit();
                    return;
                }
                Drain::Done(exit) => self.complete(exit),
                Drain::Idle => {}
            }
            self.running.store(false, Ordering::SeqCst);
            if self.mailbox.lock().is_empty() || self.running.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    fn drain_messages(self: &Arc<Self>, state: &mut FiberState) -> Drain {
        if self.is_done() {
            self.mailbox.lock().clear();
            return Drain::Idle;
        }
        loop {
            if let Some(next) = state.resume_point.take() {
                self.status.store(STATUS_RUNNING, Ordering::SeqCst);
                match run_loop(state, self, next) {
                    Step::Yielded(node) => {
                        state.resume_point = Some(node);
                        return Drain::Yielded;
                    }
                    Step::Suspended => self.status.store(STATUS_SUSPENDED, Ordering::SeqCst),
                    Step::Done(exit) => match self.reap_children(state, &exit) {
                        Some(reap) => state.resume_point = Some(reap),
                        None => return Drain::Done(exit),
                    },
                }
                continue;
            }

            let message = self.mailbox.lock().pop_front();
            match message {
                None => return Drain::Idle,
                Some(Message::Resume { epoch, next }) => {
                    if state.suspension.as_ref().map(|s| s.epoch) == Some(epoch) {
                        state.suspension = None;
                        state.resume_point = Some(next);
                    }
                }
                Some(Message::Interrupt) => {
                    if state.interruptible {
                        if let Some(suspension) = state.suspension.take() {
                            state.resume_point = Some(self.interrupt_suspended(state, suspension));
                        }
                    }
                }
            }
        }
    }

    /// Wake a suspended fiber with its interruption, running the async
    /// canceler first.
    fn interrupt_suspended(&self, state: &mut FiberState, suspension: Suspension) -> Prim {
        let cause = self.interrupt_cause();
        match suspension.canceler {
            None => fail_raw(cause),
            Some(canceler) => {
                state.stack.push(Frame::RestoreInterruptible(state.interruptible));
                state.interruptible = false;
                let on_failure = cause.clone();
                prim(Primitive::OnSuccessAndFailure(
                    canceler,
                    Arc::new(move |failed: RawCause| fail_raw(on_failure.clone().sequential(failed))),
                    Arc::new(move |_| fail_raw(cause.clone())),
                ))
            }
        }
    }

    /// Interrupt attached children and wait for them before completing.
    fn reap_children(&self, state: &mut FiberState, exit: &RawExit) -> Option<Prim> {
        let children: Vec<Arc<FiberInner>> = self.children.lock().values().cloned().collect();
        if children.is_empty() {
            return None;
        }
        trace!(fiber_id = %self.id, count = children.len(), "interrupting children");
        state.interruptible = false;
        for child in &children {
            child.interrupt_as(Some(self.id));
        }
        let wait: Effect<Vec<()>, Never> = Effect::for_each(children, |child| child.await_done());
        let exit = exit.clone();
        Some(prim(Primitive::OnSuccess(
            wait.prim,
            Arc::new(move |_| from_raw_exit(exit.clone())),
        )))
    }

    fn complete(self: &Arc<Self>, exit: RawExit) {
        let observers = {
            let mut completion = self.completion.lock();
            completion.exit = Some(exit.clone());
            std::mem::take(&mut completion.observers)
        };
        self.status.store(STATUS_DONE, Ordering::SeqCst);
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.children.lock().remove(&self.id);
        }
        {
            let mut state = self.state.lock();
            state.stack.clear();
            state.journal = None;
        }

        match &exit {
            Exit::Failure(cause) if cause.is_die() => {
                debug!(fiber_id = %self.id, cause = %cause.pretty(), "fiber died")
            }
            _ => trace!(fiber_id = %self.id, success = exit.is_success(), "fiber completed"),
        }

        for (_, observer) in observers {
            if let Err(defect) = catch_defect(|| observer(&exit)) {
                warn!(fiber_id = %self.id, %defect, "fiber observer panicked");
            }
        }
    }

    fn is_done(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STATUS_DONE
    }

    fn status(&self) -> FiberStatus {
        match self.status.load(Ordering::SeqCst) {
            STATUS_SUSPENDED => FiberStatus::Suspended,
            STATUS_DONE => FiberStatus::Done,
            _ => FiberStatus::Running,
        }
    }

    // ------------------------------------------------------------------------
    // Interruption
    // ------------------------------------------------------------------------

    pub(crate) fn interrupt_as(self: &Arc<Self>, by: Option<FiberId>) {
        if self.is_done() {
            return;
        }
        {
            let mut interruptors = self.interruptors.lock();
            if !interruptors.contains(&by) {
                interruptors.push(by);
            }
        }
        self.interrupt_requested.store(true, Ordering::SeqCst);
        trace!(fiber_id = %self.id, by = ?by, "interrupt requested");
        self.tell(Message::Interrupt);
    }

    pub(crate) fn is_interrupt_requested(&self) -> bool {
        self.interrupt_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn interrupt_cause(&self) -> RawCause {
        let interruptors = self.interruptors.lock();
        if interruptors.is_empty() {
            return Cause::interrupt(None);
        }
        Cause::parallel_all(interruptors.iter().map(|by| Cause::interrupt(*by)))
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Register a completion observer. Runs immediately, returning `None`,
    /// when the fiber is already done.
    pub(crate) fn add_observer(&self, observer: Observer) -> Option<u64> {
        let mut completion = self.completion.lock();
        match completion.exit.clone() {
            Some(exit) => {
                drop(completion);
                if let Err(defect) = catch_defect(|| observer(&exit)) {
                    warn!(fiber_id = %self.id, %defect, "fiber observer panicked");
                }
                None
            }
            None => {
                let key = completion.next_key;
                completion.next_key += 1;
                completion.observers.push((key, observer));
                Some(key)
            }
        }
    }

    pub(crate) fn remove_observer(&self, key: u64) {
        self.completion.lock().observers.retain(|(k, _)| *k != key);
    }

    fn poll_raw(&self) -> Option<RawExit> {
        self.completion.lock().exit.clone()
    }

    /// Wait for completion, ignoring the outcome.
    pub(crate) fn await_done(self: &Arc<Self>) -> Effect<(), Never> {
        let fiber = self.clone();
        Effect::async_interrupt(move |callback| {
            let key = fiber.add_observer(Box::new(move |_: &RawExit| callback.succeed(())));
            let fiber = fiber.clone();
            key.map(|key| Effect::sync(move || fiber.remove_observer(key)))
        })
    }

    /// Wait for completion, yielding the erased exit.
    fn await_raw(self: &Arc<Self>) -> Effect<RawExit, Never> {
        let fiber = self.clone();
        Effect::async_interrupt(move |callback| {
            let key = fiber.add_observer(Box::new(move |exit: &RawExit| callback.succeed(exit.clone())));
            let fiber = fiber.clone();
            key.map(|key| Effect::sync(move || fiber.remove_observer(key)))
        })
    }
}

/// Resumption handle for a suspended fiber. Usable once.
#[derive(Clone)]
pub(crate) struct Resume {
    fiber: Arc<FiberInner>,
    epoch: u64,
    used: Arc<AtomicBool>,
}

impl Resume {
    pub(crate) fn new(fiber: Arc<FiberInner>, epoch: u64) -> Self {
        Self {
            fiber,
            epoch,
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn resume(&self, next: Prim) {
        if !self.used.swap(true, Ordering::SeqCst) {
            self.fiber.tell(Message::Resume {
                epoch: self.epoch,
                next,
            });
        }
    }

    pub(crate) fn is_used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Fiber handle
// ============================================================================

/// Handle to a running or finished fiber.
pub struct Fiber<A, E> {
    inner: Arc<FiberInner>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.inner.status())
            .finish()
    }
}

impl<A: Data, E: Data> Fiber<A, E> {
    pub(crate) fn from_inner(inner: Arc<FiberInner>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// The fiber's name, if it was given one.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The fiber that forked this one, if any.
    pub fn parent(&self) -> Option<FiberId> {
        self.inner.parent_id
    }

    /// Current lifecycle state.
    pub fn status(&self) -> FiberStatus {
        self.inner.status()
    }

    /// When the fiber was created.
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// The exit if the fiber is done.
    pub fn poll(&self) -> Option<Exit<A, E>> {
        self.inner.poll_raw().map(|exit| exit.unerase())
    }

    /// Wait for the fiber and observe its exit. Never fails.
    pub fn await_exit(&self) -> Effect<Exit<A, E>, Never> {
        self.inner.await_raw().map(|exit| exit.unerase::<A, E>())
    }

    /// Wait for the fiber and adopt its outcome.
    pub fn join(&self) -> Effect<A, E> {
        self.await_exit().widen::<E>().flat_map(Effect::from_exit)
    }

    /// Interrupt the fiber on behalf of the running fiber and wait for it
    /// to finish.
    pub fn interrupt(&self) -> Effect<Exit<A, E>, Never> {
        let fiber = self.clone();
        Effect::fiber_id().flat_map(move |me| fiber.interrupt_as(me))
    }

    /// Interrupt the fiber on behalf of `by` and wait for it to finish.
    pub fn interrupt_as(&self, by: FiberId) -> Effect<Exit<A, E>, Never> {
        let inner = self.inner.clone();
        Effect::sync(move || inner.interrupt_as(Some(by))).then(self.await_exit())
    }

    /// Request interruption without waiting.
    pub fn interrupt_fork(&self) -> Effect<(), Never> {
        let inner = self.inner.clone();
        with_fiber(move |_, me| {
            inner.interrupt_as(Some(me.id()));
            Effect::unit()
        })
    }

    /// Request interruption from outside any fiber.
    pub fn request_interrupt(&self) {
        self.inner.interrupt_as(None);
    }

    /// Register a callback run once with the fiber's exit.
    pub fn on_done<F>(&self, f: F)
    where
        F: FnOnce(Exit<A, E>) + Send + 'static,
    {
        let _ = self
            .inner
            .add_observer(Box::new(move |exit: &RawExit| f(exit.clone().unerase())));
    }
}

// ============================================================================
// Forking
// ============================================================================

impl<A: Data, E: Data> Effect<A, E> {
    /// Run this effect on a new child fiber.
    pub fn fork(self) -> Effect<Fiber<A, E>, Never> {
        self.fork_with(FiberConfig::default())
    }

    /// Run this effect on a new named child fiber.
    pub fn fork_named(self, name: impl Into<String>) -> Effect<Fiber<A, E>, Never> {
        self.fork_with(FiberConfig::new().name(name))
    }

    /// Run this effect on a new fiber that outlives its parent.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>, Never> {
        self.fork_with(FiberConfig::new().daemon())
    }

    /// Run this effect on a new fiber configured by `config`.
    pub fn fork_with(self, config: FiberConfig) -> Effect<Fiber<A, E>, Never> {
        let body = self.prim;
        with_fiber(move |state, parent| {
            let child = FiberInner::spawn_child(state, parent, &config);
            child.start(body.clone());
            Effect::succeed(Fiber::from_inner(child))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use crate::scheduler::CurrentThreadScheduler;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fiber_id_display() {
        assert_eq!(FiberId::new(12).to_string(), "Fiber(12)");
        assert!(next_fiber_id().as_u64() < next_fiber_id().as_u64());
    }

    #[test]
    fn test_fork_join() {
        let runtime = Runtime::current_thread();
        let effect = Effect::<u32, ()>::succeed(21)
            .map(|n| n * 2)
            .fork()
            .widen::<()>()
            .flat_map(|fiber| fiber.join());
        assert_eq!(runtime.run_exit(effect).value(), Some(&42));
    }

    #[test]
    fn test_join_propagates_failure() {
        let runtime = Runtime::current_thread();
        let effect = Effect::<u32, &str>::fail("child failed")
            .fork()
            .widen::<&str>()
            .flat_map(|fiber| fiber.join());
        let exit = runtime.run_exit(effect);
        assert_eq!(exit.cause().unwrap().first_error(), Some(&"child failed"));
    }

    #[test]
    fn test_interrupt_suspended_fiber() {
        let runtime = Runtime::current_thread();
        let effect = Effect::<(), ()>::never()
            .fork()
            .flat_map(|fiber| fiber.interrupt());
        let exit = runtime.run_exit(effect).value().cloned().unwrap();
        assert!(exit.is_interrupted());
    }

    #[test]
    fn test_interrupt_runs_canceler() {
        let canceled = Arc::new(AtomicUsize::new(0));
        let flag = canceled.clone();
        let waiting = Effect::<(), ()>::async_interrupt(move |_cb| {
            let flag = flag.clone();
            Some(Effect::sync(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }))
        });
        let runtime = Runtime::current_thread();
        let exit = runtime.run_exit(
            waiting
                .fork()
                .flat_map(|fiber| Effect::yield_now().then(fiber.interrupt())),
        );
        assert!(exit.value().unwrap().is_interrupted());
        assert_eq!(canceled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_uninterruptible_defers_interrupt() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let work = Effect::<(), ()>::yield_now()
            .repeat_n(50)
            .then(Effect::sync(move || flag.store(true, Ordering::SeqCst)))
            .uninterruptible();
        let runtime = Runtime::current_thread();
        let exit = runtime.run_exit(
            work.fork()
                .flat_map(|fiber| Effect::yield_now().then(fiber.interrupt())),
        );
        assert!(finished.load(Ordering::SeqCst));
        // The region completed, so the fiber finished with its value.
        assert!(exit.value().unwrap().is_success());
    }

    #[test]
    fn test_interrupt_observed_after_region() {
        let after = Arc::new(AtomicBool::new(false));
        let flag = after.clone();
        let work = Effect::<(), ()>::yield_now()
            .repeat_n(10)
            .uninterruptible()
            .then(Effect::yield_now())
            .then(Effect::sync(move || flag.store(true, Ordering::SeqCst)));
        let runtime = Runtime::current_thread();
        let exit = runtime.run_exit(
            work.fork()
                .flat_map(|fiber| Effect::yield_now().then(fiber.interrupt())),
        );
        assert!(exit.value().unwrap().is_interrupted());
        assert!(!after.load(Ordering::SeqCst));
    }

    #[test]
    fn test_observers_run_once_in_order() {
        let runtime = Runtime::current_thread();
        let fiber = runtime.run_fork(Effect::<u8, ()>::succeed(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            fiber.on_done(move |exit| order.lock().push((i, exit.is_success())));
        }
        runtime.run_until_idle();
        assert_eq!(*order.lock(), vec![(0, true), (1, true), (2, true)]);

        // A late observer sees the stored exit immediately.
        let late = order.clone();
        fiber.on_done(move |_| late.lock().push((9, true)));
        assert_eq!(order.lock().len(), 4);
        assert_eq!(fiber.status(), FiberStatus::Done);
        assert_eq!(fiber.poll().and_then(|e| e.value().copied()), Some(1));
    }

    #[test]
    fn test_parent_interrupts_children_on_exit() {
        let runtime = Runtime::current_thread();
        let child_slot = Arc::new(Mutex::new(None));
        let slot = child_slot.clone();
        let parent = Effect::<(), ()>::never().fork().map(move |child| {
            *slot.lock() = Some(child);
        });
        runtime.run_exit(parent);
        let child = child_slot.lock().clone().unwrap();
        assert!(child.poll().unwrap().is_interrupted());
    }

    #[test]
    fn test_daemon_outlives_parent() {
        let runtime = Runtime::current_thread();
        let child_slot = Arc::new(Mutex::new(None));
        let slot = child_slot.clone();
        let parent = Effect::<(), ()>::never().fork_daemon().map(move |child| {
            *slot.lock() = Some(child);
        });
        runtime.run_exit(parent);
        runtime.run_until_idle();
        let child: Fiber<(), ()> = child_slot.lock().clone().unwrap();
        assert_eq!(child.status(), FiberStatus::Suspended);
        child.request_interrupt();
        runtime.run_until_idle();
        assert!(child.poll().unwrap().is_interrupted());
    }

    #[test]
    fn test_yielding_fibers_interleave() {
        let runtime = Runtime::current_thread();
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = |tag: char| {
            let log = log.clone();
            Effect::<(), ()>::sync(move || log.lock().push(tag))
                .then(Effect::yield_now())
                .repeat_n(2)
        };
        let program = worker('a')
            .fork()
            .zip(worker('b').fork())
            .widen::<()>()
            .flat_map(|(a, b)| a.join().then(b.join()));
        let exit = runtime.run_exit(program);
        assert!(exit.is_success());
        let log = log.lock().clone();
        assert_eq!(log.len(), 6);
        assert_ne!(log[..3], ['a', 'a', 'a']);
    }

    #[test]
    fn test_fairness_budget_preempts_busy_fibers() {
        let config = RuntimeConfig::builder()
            .max_ops_before_yield(8)
            .build()
            .unwrap();
        let runtime = Runtime::current_thread_with(config);
        let log = Arc::new(Mutex::new(Vec::new()));
        let busy = |tag: char| {
            let log = log.clone();
            Effect::<(), ()>::sync(move || log.lock().push(tag)).repeat_n(50)
        };
        let program = busy('a')
            .fork()
            .zip(busy('b').fork())
            .widen::<()>()
            .flat_map(|(a, b)| a.join().then(b.join()));
        assert!(runtime.run_exit(program).is_success());

        let log = log.lock().clone();
        assert_eq!(log.len(), 102);
        let switches = log.windows(2).filter(|pair| pair[0] != pair[1]).count();
        assert!(switches >= 4, "only {} switches", switches);
    }

    #[test]
    fn test_yielding_critical_fiber_does_not_starve_normal() {
        fn spin() -> Effect<(), Never> {
            Effect::yield_now().flat_map(|_| spin())
        }

        let driver = Arc::new(CurrentThreadScheduler::new());
        let runtime = Runtime::with_scheduler(driver.clone(), RuntimeConfig::default());
        runtime.run_fork(spin().fork_with(FiberConfig::new().priority(Priority::Critical).daemon()));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let normal = runtime.run_fork(Effect::<(), Never>::sync(move || flag.store(true, Ordering::SeqCst)));

        let mut steps = 0;
        while normal.poll().is_none() && steps < 100_000 {
            driver.step();
            steps += 1;
        }
        assert!(ran.load(Ordering::SeqCst));
        assert!(normal.poll().map(|exit| exit.is_success()).unwrap_or(false));
    }

    #[test]
    fn test_panicking_late_observer_is_contained() {
        let runtime = Runtime::current_thread();
        let fiber = runtime.run_fork(Effect::<u8, ()>::succeed(1));
        runtime.run_until_idle();
        assert_eq!(fiber.status(), FiberStatus::Done);

        fiber.on_done(|_| panic!("observer failed"));
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        fiber.on_done(move |exit| flag.store(exit.is_success(), Ordering::SeqCst));
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fiber_names() {
        let runtime = Runtime::current_thread();
        let fiber = runtime.run_sync(Effect::<(), ()>::unit().fork_named("worker")).unwrap();
        assert_eq!(fiber.name(), Some("worker"));
        assert!(fiber.parent().is_some());
        assert!(fiber.created_at() <= std::time::Instant::now());
    }
}
