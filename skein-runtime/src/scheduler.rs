//! # Schedulers
//!
//! A scheduler decides when queued work runs. Fibers hand it one task per
//! mailbox drain; it never runs a task inline from `schedule_task`, which
//! bounds recursion when fibers resume each other.
//!
//! Two implementations are provided:
//!
//! - [`WorkStealingScheduler`]: M:N scheduling on a pool of worker threads,
//!   each with a local deque, plus a global injector and stealing.
//! - [`CurrentThreadScheduler`]: a single deterministic queue drained by
//!   whichever thread calls [`Scheduler::run_pending`]. Used by tests and by
//!   single-threaded runtimes.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::fiber::Priority;
use crate::panic::catch_defect;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks submitted by fibers.
pub trait Scheduler: Send + Sync + 'static {
    /// Enqueue a task to run later.
    fn schedule_task(&self, task: Task, priority: Priority);

    /// How many interpreter steps a fiber may take before yielding.
    fn max_ops_before_yield(&self) -> usize;

    /// Run queued tasks on the calling thread, returning how many ran.
    ///
    /// Schedulers with their own threads return 0.
    fn run_pending(&self) -> usize {
        0
    }
}

/// Run a task, logging instead of unwinding if it panics.
fn run_task(task: Task) {
    if let Err(defect) = catch_defect(task) {
        warn!(%defect, "scheduler task panicked");
    }
}

// ============================================================================
// Work-stealing scheduler
// ============================================================================

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The local deque of the worker running on this thread, if any.
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

struct LocalQueue {
    scheduler: u64,
    deque: Deque<Task>,
}

/// State shared by the scheduler handle and its workers.
struct Shared {
    /// Identifies this scheduler's workers in the thread-local slot.
    id: u64,
    /// Configuration.
    config: SchedulerConfig,
    /// Global injection queue.
    global_queue: Injector<Task>,
    /// Injection queue for `High` and `Critical` tasks, checked first.
    urgent_queue: Injector<Task>,
    /// Stealers for work-stealing.
    stealers: Vec<Stealer<Task>>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Number of active workers.
    active_workers: AtomicUsize,
    /// Number of workers parked waiting for work.
    idle_workers: AtomicUsize,
    /// Parking lot for idle workers.
    sleep_lock: Mutex<()>,
    sleep_signal: Condvar,
}

impl Shared {
    fn notify_one(&self) {
        if self.idle_workers.load(Ordering::SeqCst) > 0 {
            let _guard = self.sleep_lock.lock();
            self.sleep_signal.notify_one();
        }
    }
}

/// M:N scheduler running tasks on a pool of worker threads.
pub struct WorkStealingScheduler {
    shared: Arc<Shared>,
    /// Worker threads.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkStealingScheduler {
    /// Create a scheduler and start its workers.
    pub fn new(config: SchedulerConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let mut deques = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }
        if !config.work_stealing {
            stealers.clear();
        }

        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            global_queue: Injector::new(),
            urgent_queue: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            sleep_lock: Mutex::new(()),
            sleep_signal: Condvar::new(),
        });

        let workers = deques
            .into_iter()
            .enumerate()
            .map(|(index, deque)| {
                let worker = Worker {
                    index,
                    shared: shared.clone(),
                };
                thread::Builder::new()
                    .name(format!("skein-worker-{}", index))
                    .spawn(move || worker.run_loop(deque))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Get the number of workers.
    pub fn num_workers(&self) -> usize {
        self.shared.config.num_workers.max(1)
    }

    /// Number of worker threads currently running their loop.
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }

    /// Check if the scheduler is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the workers and wait up to the configured graceful shutdown
    /// period for them to exit. Queued tasks that have not started are
    /// dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.sleep_signal.notify_all();
        }
        let deadline = Instant::now() + self.shared.config.graceful_shutdown;
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("worker did not stop within the graceful shutdown period");
            }
        }
        debug!(scheduler = self.shared.id, "scheduler stopped");
    }
}

impl Scheduler for WorkStealingScheduler {
    fn schedule_task(&self, task: Task, priority: Priority) {
        if priority >= Priority::High {
            self.shared.urgent_queue.push(task);
            self.shared.notify_one();
            return;
        }
        let id = self.shared.id;
        let leftover = LOCAL.with(|slot| match slot.borrow().as_ref() {
            Some(local) if local.scheduler == id => {
                local.deque.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = leftover {
            self.shared.global_queue.push(task);
        }
        self.shared.notify_one();
    }

    fn max_ops_before_yield(&self) -> usize {
        self.shared.config.max_ops_before_yield
    }
}

impl Drop for WorkStealingScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A worker thread in the scheduler.
struct Worker {
    /// Worker index, used for stealing order and diagnostics.
    index: usize,
    shared: Arc<Shared>,
}

impl Worker {
    /// Run the worker loop.
    fn run_loop(self, deque: Deque<Task>) {
        LOCAL.with(|slot| {
            *slot.borrow_mut() = Some(LocalQueue {
                scheduler: self.shared.id,
                deque,
            })
        });
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);
        debug!(worker = self.index, "worker started");

        let mut tick: u32 = 0;
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            match self.find_work(tick) {
                Some(task) => {
                    tick = tick.wrapping_add(1);
                    run_task(task);
                }
                None => self.park(),
            }
        }

        self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
        LOCAL.with(|slot| slot.borrow_mut().take());
        debug!(worker = self.index, "worker stopped");
    }

    /// Find work: urgent queue, then local deque, then global queue, then
    /// other workers. Every `global_queue_interval` ticks the global queue
    /// and then the local deque are checked before the urgent queue, so
    /// neither injected work nor lower-priority fibers are starved by
    /// fibers that keep rescheduling themselves.
    fn find_work(&self, tick: u32) -> Option<Task> {
        let interval = self.shared.config.global_queue_interval.max(1) as u32;
        if tick % interval == 0 {
            if let Some(task) = self.steal_global().or_else(pop_local) {
                return Some(task);
            }
        }

        if let Some(task) = steal_from(|| self.shared.urgent_queue.steal()) {
            return Some(task);
        }

        if let Some(task) = pop_local() {
            return Some(task);
        }

        if let Some(task) = self.steal_global() {
            return Some(task);
        }

        let count = self.shared.stealers.len();
        for offset in 1..count {
            let stealer = &self.shared.stealers[(self.index + offset) % count];
            if let Some(task) = steal_from(|| stealer.steal()) {
                return Some(task);
            }
        }

        None
    }

    fn steal_global(&self) -> Option<Task> {
        LOCAL.with(|slot| {
            let slot = slot.borrow();
            match slot.as_ref() {
                Some(local) => {
                    steal_from(|| self.shared.global_queue.steal_batch_and_pop(&local.deque))
                }
                None => steal_from(|| self.shared.global_queue.steal()),
            }
        })
    }

    fn park(&self) {
        let mut guard = self.shared.sleep_lock.lock();
        self.shared.idle_workers.fetch_add(1, Ordering::SeqCst);
        if !self.shared.shutdown.load(Ordering::Acquire)
            && self.shared.global_queue.is_empty()
            && self.shared.urgent_queue.is_empty()
        {
            self.shared
                .sleep_signal
                .wait_for(&mut guard, Duration::from_millis(10));
        }
        self.shared.idle_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn pop_local() -> Option<Task> {
    LOCAL.with(|slot| slot.borrow().as_ref().and_then(|q| q.deque.pop()))
}

fn steal_from(mut steal: impl FnMut() -> Steal<Task>) -> Option<Task> {
    loop {
        match steal() {
            Steal::Success(task) => return Some(task),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

// ============================================================================
// Current-thread scheduler
// ============================================================================

/// Deterministic scheduler drained by the thread that calls
/// [`Scheduler::run_pending`].
///
/// Tasks run by priority, then in submission order, except that every
/// `fairness_interval`-th step runs the oldest queued task whatever its
/// priority. A fiber that keeps yielding at high priority therefore cannot
/// starve the rest of the queue.
pub struct CurrentThreadScheduler {
    queue: Mutex<BTreeMap<(Reverse<Priority>, u64), Task>>,
    /// Signaled when a task is queued, for drivers parked in `park`.
    work_ready: Condvar,
    next_seq: AtomicU64,
    /// Steps taken, for the oldest-first turn.
    ticks: AtomicU64,
    max_ops_before_yield: usize,
    fairness_interval: u64,
}

impl CurrentThreadScheduler {
    /// Create a scheduler with the default fairness budget.
    pub fn new() -> Self {
        Self::with_max_ops(SchedulerConfig::default().max_ops_before_yield)
    }

    /// Create a scheduler with a specific fairness budget.
    pub fn with_max_ops(max_ops_before_yield: usize) -> Self {
        Self::from_config(&SchedulerConfig {
            max_ops_before_yield,
            ..Default::default()
        })
    }

    /// Create a scheduler using the fairness budget and queue interval of
    /// `config`.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            queue: Mutex::new(BTreeMap::new()),
            work_ready: Condvar::new(),
            next_seq: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            max_ops_before_yield: config.max_ops_before_yield.max(1),
            fairness_interval: config.global_queue_interval.max(1) as u64,
        }
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run one queued task. Returns false when the queue was empty.
    pub fn step(&self) -> bool {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let next = {
            let mut queue = self.queue.lock();
            let key = if tick % self.fairness_interval == 0 {
                oldest_key(&queue)
            } else {
                queue.keys().next().copied()
            };
            key.and_then(|key| queue.remove(&key))
        };
        match next {
            Some(task) => {
                run_task(task);
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, returning how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.step() {
            ran += 1;
        }
        ran
    }

    /// Block until a task is queued or `timeout` elapses.
    pub fn park(&self, timeout: Duration) {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.work_ready.wait_for(&mut queue, timeout);
        }
    }
}

/// The key of the task submitted earliest, across all priorities.
fn oldest_key(queue: &BTreeMap<(Reverse<Priority>, u64), Task>) -> Option<(Reverse<Priority>, u64)> {
    [Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        .into_iter()
        .filter_map(|priority| {
            queue
                .range((Reverse(priority), 0)..=(Reverse(priority), u64::MAX))
                .next()
                .map(|(key, _)| *key)
        })
        .min_by_key(|(_, seq)| *seq)
}

impl Default for CurrentThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for CurrentThreadScheduler {
    fn schedule_task(&self, task: Task, priority: Priority) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().insert((Reverse(priority), seq), task);
        self.work_ready.notify_one();
    }

    fn max_ops_before_yield(&self) -> usize {
        self.max_ops_before_yield
    }

    fn run_pending(&self) -> usize {
        self.run_until_idle()
    }
}

// ============================================================================
// Tests
// ============================================================================
