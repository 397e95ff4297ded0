//! # Clock
//!
//! Time as a service. Effects find the clock through the [`CLOCK`]
//! reference, so a test can swap in a [`TestClock`] with
//! [`Effect::with_clock`] and drive sleeping fibers by hand.
//!
//! [`LiveClock`] runs one background timer thread fed by a command channel.
//! [`TestClock`] keeps virtual time that only moves when told to; timers
//! whose deadline has been reached fire in deadline order, each exactly once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::context::Reference;
use crate::effect::{Effect, Never};
use crate::erased::Data;
use crate::panic::catch_defect;

/// Callback run when a timer fires.
pub type Wake = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

static NEXT_TIMER_KEY: AtomicU64 = AtomicU64::new(1);

fn next_timer_key() -> TimerKey {
    TimerKey(NEXT_TIMER_KEY.fetch_add(1, Ordering::Relaxed))
}

/// Source of time and timers.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch (or since the start of virtual
    /// time).
    fn current_time_millis(&self) -> u64;

    /// Run `wake` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, wake: Wake) -> TimerKey;

    /// Cancel a timer. Returns false if it already fired or was canceled.
    fn cancel(&self, key: TimerKey) -> bool;
}

/// The clock in effect. Defaults to the shared [`LiveClock`].
pub static CLOCK: Reference<Arc<dyn Clock>> = Reference::new("skein/Clock", live_clock);

/// The process-wide live clock.
pub fn live_clock() -> Arc<dyn Clock> {
    static LIVE: OnceLock<Arc<LiveClock>> = OnceLock::new();
    LIVE.get_or_init(|| Arc::new(LiveClock::new())).clone()
}

fn fire(key: TimerKey, wake: Wake) {
    if let Err(defect) = catch_defect(wake) {
        warn!(timer = key.0, %defect, "timer callback panicked");
    }
}

// ============================================================================
// Live clock
// ============================================================================

enum Command {
    Schedule {
        key: TimerKey,
        deadline: Instant,
        wake: Wake,
    },
    Cancel(TimerKey),
}

/// Wall-clock timers served by a background thread.
pub struct LiveClock {
    commands: Sender<Command>,
    /// Keys of timers that have not fired or been canceled.
    live: Arc<Mutex<HashMap<TimerKey, Instant>>>,
}

impl LiveClock {
    /// Start a clock with its own timer thread.
    pub fn new() -> Self {
        let (commands, receiver) = crossbeam_channel::unbounded();
        let live = Arc::new(Mutex::new(HashMap::new()));
        let timers = live.clone();
        thread::Builder::new()
            .name("skein-timer".into())
            .spawn(move || timer_loop(receiver, timers))
            .expect("failed to spawn timer thread");
        Self { commands, live }
    }
}

impl Default for LiveClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LiveClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClock")
            .field("pending", &self.live.lock().len())
            .finish()
    }
}

impl Clock for LiveClock {
    fn current_time_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn schedule(&self, delay: Duration, wake: Wake) -> TimerKey {
        let key = next_timer_key();
        let deadline = Instant::now() + delay;
        self.live.lock().insert(key, deadline);
        if let Err(err) = self.commands.send(Command::Schedule {
            key,
            deadline,
            wake,
        }) {
            // The timer thread is gone; fire rather than hang the sleeper.
            self.live.lock().remove(&key);
            if let Command::Schedule { wake, .. } = err.into_inner() {
                fire(key, wake);
            }
        }
        key
    }

    fn cancel(&self, key: TimerKey) -> bool {
        let pending = self.live.lock().remove(&key).is_some();
        if pending {
            let _ = self.commands.send(Command::Cancel(key));
        }
        pending
    }
}

fn timer_loop(receiver: Receiver<Command>, live: Arc<Mutex<HashMap<TimerKey, Instant>>>) {
    let mut timers: BTreeMap<(Instant, TimerKey), Wake> = BTreeMap::new();
    let mut deadlines: HashMap<TimerKey, Instant> = HashMap::new();
    loop {
        let now = Instant::now();
        while let Some(entry) = timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, key), wake) = entry.remove_entry();
            deadlines.remove(&key);
            if live.lock().remove(&key).is_some() {
                fire(key, wake);
            }
        }

        let command = match timers.keys().next() {
            Some((deadline, _)) => {
                match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Schedule {
                key,
                deadline,
                wake,
            } => {
                deadlines.insert(key, deadline);
                timers.insert((deadline, key), wake);
            }
            Command::Cancel(key) => {
                if let Some(deadline) = deadlines.remove(&key) {
                    timers.remove(&(deadline, key));
                }
            }
        }
    }
    trace!("timer thread stopped");
}

// ============================================================================
// Test clock
// ============================================================================

#[derive(Default)]
struct TestClockState {
    now: u64,
    timers: BTreeMap<(u64, TimerKey), Wake>,
}

/// Virtual clock for deterministic tests.
///
/// Time starts at zero and only advances through [`TestClock::adjust`] and
/// [`TestClock::set_time`].
#[derive(Default)]
pub struct TestClock {
    state: Mutex<TestClockState>,
}

impl TestClock {
    /// A clock at time zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Move time forward by `delta`, firing every timer that comes due.
    pub fn adjust(&self, delta: Duration) {
        let target = self.state.lock().now.saturating_add(delta.as_millis() as u64);
        self.set_time(target);
    }

    /// Set the current time. Time never moves backwards; an earlier
    /// `millis` is ignored.
    pub fn set_time(&self, millis: u64) {
        let due = {
            let mut state = self.state.lock();
            if millis > state.now {
                state.now = millis;
            }
            let now = state.now;
            let mut due = Vec::new();
            while let Some(entry) = state.timers.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let ((_, key), wake) = entry.remove_entry();
                due.push((key, wake));
            }
            due
        };
        for (key, wake) in due {
            fire(key, wake);
        }
    }

    /// Number of timers waiting to fire.
    pub fn pending_timers(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// Deadlines of waiting timers, earliest first.
    pub fn deadlines(&self) -> Vec<u64> {
        self.state.lock().timers.keys().map(|(at, _)| *at).collect()
    }
}

impl fmt::Debug for TestClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TestClock")
            .field("now", &state.now)
            .field("pending", &state.timers.len())
            .finish()
    }
}

impl Clock for TestClock {
    fn current_time_millis(&self) -> u64 {
        self.state.lock().now
    }

    fn schedule(&self, delay: Duration, wake: Wake) -> TimerKey {
        let key = next_timer_key();
        if delay.is_zero() {
            fire(key, wake);
            return key;
        }
        let mut state = self.state.lock();
        let deadline = state.now.saturating_add(delay.as_millis().max(1) as u64);
        state.timers.insert((deadline, key), wake);
        key
    }

    fn cancel(&self, key: TimerKey) -> bool {
        let mut state = self.state.lock();
        let found = state.timers.keys().find(|(_, k)| *k == key).copied();
        found.and_then(|entry| state.timers.remove(&entry)).is_some()
    }
}

// ============================================================================
// Effects
// ============================================================================

impl<E: Data> Effect<(), E> {
    /// Suspend the fiber for `duration` of the clock in effect.
    ///
    /// Interrupting the sleep cancels its timer.
    pub fn sleep(duration: Duration) -> Self {
        Effect::<Arc<dyn Clock>, E>::service_or_default(&CLOCK).flat_map(move |clock| {
            Effect::async_interrupt(move |callback| {
                let key = clock.schedule(duration, Box::new(move || callback.succeed(())));
                let clock = clock.clone();
                Some(Effect::sync(move || {
                    clock.cancel(key);
                }))
            })
        })
    }
}

impl<E: Data> Effect<u64, E> {
    /// Current time of the clock in effect, in milliseconds.
    pub fn current_time_millis() -> Self {
        Effect::<Arc<dyn Clock>, E>::service_or_default(&CLOCK)
            .map(|clock| clock.current_time_millis())
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Run after waiting `duration`.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::sleep(duration).then(self)
    }

    /// Run with `clock` as the clock in effect.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.provide_service(CLOCK.tag(), clock)
    }
}

/// Shorthand for `Effect::<(), Never>::sleep`.
pub fn sleep(duration: Duration) -> Effect<(), Never> {
    Effect::sleep(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_test_clock_fires_in_deadline_order() {
        let clock = TestClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, ms) in [("late", 30), ("early", 10), ("mid", 20)] {
            let order = order.clone();
            clock.schedule(Duration::from_millis(ms), Box::new(move || order.lock().push(label)));
        }
        assert_eq!(clock.pending_timers(), 3);
        assert_eq!(clock.deadlines(), vec![10, 20, 30]);

        clock.adjust(Duration::from_millis(25));
        assert_eq!(*order.lock(), vec!["early", "mid"]);
        clock.set_time(30);
        assert_eq!(*order.lock(), vec!["early", "mid", "late"]);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn test_test_clock_cancel() {
        let clock = TestClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let key = clock.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(clock.cancel(key));
        assert!(!clock.cancel(key));
        clock.adjust(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sleep_resumes_at_deadline_exactly_once() {
        let runtime = Runtime::current_thread();
        let clock = TestClock::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = wakes.clone();
        let sleeper = Effect::<(), ()>::sleep(Duration::from_millis(1000))
            .then(Effect::sync(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .with_clock(clock.clone());
        let fiber = runtime.run_fork(sleeper);
        runtime.run_until_idle();
        assert_eq!(clock.pending_timers(), 1);

        clock.set_time(999);
        runtime.run_until_idle();
        assert_eq!(wakes.load(Ordering::SeqCst), 0);
        assert!(fiber.poll().is_none());

        clock.set_time(1000);
        runtime.run_until_idle();
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        assert!(fiber.poll().unwrap().is_success());

        clock.adjust(Duration::from_secs(10));
        runtime.run_until_idle();
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupted_sleep_cancels_timer() {
        let runtime = Runtime::current_thread();
        let clock = TestClock::new();
        let fiber = runtime.run_fork(
            Effect::<(), ()>::sleep(Duration::from_secs(60)).with_clock(clock.clone()),
        );
        runtime.run_until_idle();
        assert_eq!(clock.pending_timers(), 1);
        fiber.request_interrupt();
        runtime.run_until_idle();
        assert!(fiber.poll().unwrap().is_interrupted());
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn test_current_time_and_live_sleep() {
        let runtime = Runtime::current_thread();
        let clock = TestClock::new();
        clock.set_time(42);
        let now = runtime.run_exit(Effect::<u64, ()>::current_time_millis().with_clock(clock));
        assert_eq!(now.value(), Some(&42));

        let start = Instant::now();
        let exit = runtime.run_exit(Effect::<u8, ()>::succeed(1).delay(Duration::from_millis(20)));
        assert_eq!(exit.value(), Some(&1));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
