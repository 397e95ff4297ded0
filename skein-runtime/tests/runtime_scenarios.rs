//! End-to-end scenarios for fibers, scopes, STM, layers and the clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use skein_runtime::{
    Effect, ExecutionStrategy, Exit, Layer, Never, Runtime, RuntimeConfig, Scope, Tag, TestClock,
    TxRef,
};

fn pool_runtime() -> Runtime {
    Runtime::new(RuntimeConfig::builder().num_workers(4).build().unwrap())
}

#[test]
fn interrupted_fiber_runs_finalizers_once_before_join() {
    let runtime = Runtime::current_thread();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = finalized.clone();

    let work = Effect::<(), String>::add_finalizer(move |_| {
        let counter = counter.clone();
        Effect::sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    })
    .then(Effect::<(), String>::never())
    .scoped();

    let observed = finalized.clone();
    let program = work.fork().flat_map(move |fiber| {
        let observed = observed.clone();
        Effect::yield_now()
            .then(fiber.interrupt_fork())
            .then(fiber.await_exit())
            .map(move |exit| (exit.is_interrupted(), observed.load(Ordering::SeqCst)))
    });

    let exit = runtime.run_exit(program);
    assert_eq!(exit.value(), Some(&(true, 1)));
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn scope_close_is_idempotent() {
    let runtime = Runtime::current_thread();
    let runs = Arc::new(AtomicUsize::new(0));
    let scope = Scope::new(ExecutionStrategy::Sequential);
    let counter = runs.clone();
    runtime.run_exit(scope.add_finalizer(move |_| {
        let counter = counter.clone();
        Effect::sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let first = runtime.run_exit(scope.close(Exit::succeed(())));
    let second = runtime.run_exit(scope.close(Exit::interrupt(None)));
    assert!(first.value().map(Exit::is_success).unwrap_or(false));
    assert!(second.value().map(Exit::is_success).unwrap_or(false));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn sequential_scope_releases_in_reverse_order() {
    let runtime = Runtime::current_thread();
    let order = Arc::new(Mutex::new(Vec::new()));
    let scope = Scope::new(ExecutionStrategy::Sequential);
    for name in ["A", "B", "C"] {
        let order = order.clone();
        runtime.run_exit(scope.add_finalizer(move |_| {
            let order = order.clone();
            Effect::sync(move || order.lock().push(name))
        }));
    }
    runtime.run_exit(scope.close(Exit::succeed(())));
    assert_eq!(*order.lock(), vec!["C", "B", "A"]);
}

#[test]
fn two_increments_commit_twice() {
    let runtime = Runtime::current_thread();
    let program = TxRef::make(0u32).flat_map(|cell| {
        let inc = cell.update(|n| n + 1);
        let read = cell.clone();
        inc.clone()
            .fork()
            .zip(inc.fork())
            .flat_map(|(a, b)| a.join().then(b.join()))
            .then(read.get())
            .map(move |value| (value, read.version()))
    });
    let exit = runtime.run_exit(program);
    assert_eq!(exit.value(), Some(&(2, 2)));
}

#[test]
fn contended_transactions_lose_no_updates() {
    let runtime = pool_runtime();
    let counter = TxRef::new(0u64);
    let fibers: usize = 16;
    let per_fiber: usize = 50;
    let work = Effect::<(), Never>::for_each_par(0..fibers, {
        let counter = counter.clone();
        move |_| counter.update(|n| n + 1).repeat_n(per_fiber - 1)
    });
    assert!(runtime.run_exit(work).is_success());
    let expected = (fibers * per_fiber) as u64;
    assert_eq!(counter.snapshot(), expected);
    assert_eq!(counter.version(), expected);
    runtime.shutdown();
}

#[test]
fn disjoint_transactions_both_commit() {
    let runtime = pool_runtime();
    let left = TxRef::new(0);
    let right = TxRef::new(0);
    let program = left
        .update(|n| n + 1)
        .zip_par(right.update(|n| n + 10));
    assert!(runtime.run_exit(program).is_success());
    assert_eq!((left.snapshot(), right.snapshot()), (1, 10));
    assert_eq!((left.version(), right.version()), (1, 1));
    runtime.shutdown();
}

#[test]
fn transfers_preserve_total() {
    let runtime = pool_runtime();
    let from = TxRef::new(1_000i64);
    let to = TxRef::new(0i64);
    let transfer = {
        let (from, to) = (from.clone(), to.clone());
        from.update(|n| n - 1)
            .then(to.update(|n| n + 1))
            .atomically()
    };
    let audit = {
        let (from, to) = (from.clone(), to.clone());
        from.get()
            .zip(to.get())
            .map(|(a, b)| a + b)
            .atomically()
    };
    let work = Effect::<(), Never>::for_each_par(0..200, move |i| {
        if i % 4 == 0 {
            audit.clone().map(|total| assert_eq!(total, 1_000))
        } else {
            transfer.clone()
        }
    });
    assert!(runtime.run_exit(work).is_success());
    assert_eq!(from.snapshot() + to.snapshot(), 1_000);
    assert_eq!(to.snapshot(), 150);
    runtime.shutdown();
}

#[test]
fn diamond_dependency_builds_shared_layer_once() {
    const DB: Tag<Arc<String>> = Tag::new("app/Db");
    const USERS: Tag<String> = Tag::new("app/Users");
    const ORDERS: Tag<String> = Tag::new("app/Orders");

    let runtime = Runtime::current_thread();
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    let db: Layer = Layer::sync(DB, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Arc::new("db".to_string())
    });
    let users = Layer::effect(USERS, Effect::service(DB).map(|db| format!("users@{db}")));
    let orders = Layer::effect(ORDERS, Effect::service(DB).map(|db| format!("orders@{db}")));
    let app = users.provide(db.clone()).merge(orders.provide(db));

    let program = Effect::service(USERS)
        .zip(Effect::service(ORDERS))
        .provide_layer(app);
    let exit = runtime.run_exit(program);
    assert_eq!(
        exit.value(),
        Some(&("users@db".to_string(), "orders@db".to_string()))
    );
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn sleep_resumes_exactly_at_deadline() {
    let runtime = Runtime::current_thread();
    let clock = TestClock::new();
    let wakeups = Arc::new(AtomicUsize::new(0));
    let counter = wakeups.clone();
    let sleeper = Effect::<(), Never>::sleep(Duration::from_millis(1000))
        .then(Effect::sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .with_clock(clock.clone());

    let fiber = runtime.run_fork(sleeper);
    runtime.run_until_idle();

    clock.set_time(999);
    runtime.run_until_idle();
    assert!(fiber.poll().is_none());
    assert_eq!(wakeups.load(Ordering::SeqCst), 0);

    clock.set_time(1000);
    runtime.run_until_idle();
    assert!(fiber.poll().map(|e| e.is_success()).unwrap_or(false));

    clock.set_time(5000);
    runtime.run_until_idle();
    assert_eq!(wakeups.load(Ordering::SeqCst), 1);
}

#[test]
fn timeout_interrupts_slow_effect() {
    let runtime = Runtime::current_thread();
    let clock = TestClock::new();
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let slow = Effect::<u32, Never>::never().ensuring(Effect::sync(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let fiber = runtime.run_fork(slow.timeout(Duration::from_millis(50)).with_clock(clock.clone()));
    runtime.run_until_idle();
    clock.adjust(Duration::from_millis(50));
    runtime.run_until_idle();
    assert_eq!(fiber.poll().and_then(|e| e.value().cloned()), Some(None));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}
