//! # Skein Runtime Library
//!
//! A structured-concurrency effect runtime:
//!
//! - **Effects**: immutable descriptions of computations, interpreted by a
//!   trampoline with an explicit continuation stack
//! - **Fibers**: lightweight, cooperatively scheduled, interruptible units of
//!   execution with a typed [`Exit`]
//! - **Scopes**: resource lifetimes whose finalizers run exactly once
//! - **STM**: optimistic transactions over [`TxRef`] cells
//! - **Layers**: memoized service construction into a [`Context`]
//!
//! ## Technical Standards
//!
//! - **Work Stealing**: Chase-Lev deques per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Timers**: a single timer thread fed through
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - **Diagnostics**: structured events per [tracing](https://docs.rs/tracing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SKEIN RUNTIME                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │ Interpreter  │  │    Fiber     │          │
//! │  │ (effect.rs)  │─►│(interpreter) │◄─│  (fiber.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                                   │                   │
//! │         ▼                                   ▼                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Scope     │  │     STM      │  │  Scheduler   │          │
//! │  │  (scope.rs)  │  │   (stm.rs)   │  │(scheduler.rs)│          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                                                       │
//! │         ▼                                                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Layer     │  │    Clock     │  │   Runtime    │          │
//! │  │  (layer.rs)  │  │  (clock.rs)  │  │ (runtime.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use skein_runtime::{Effect, ExecutionStrategy, Exit, Runtime, Scope, TxRef};
//!
//! let runtime = Runtime::current_thread();
//!
//! let counter = TxRef::new(0u32);
//! let bump = counter.update(|n| n + 1);
//! let program = bump.clone().fork().zip(bump.fork())
//!     .flat_map(|(a, b)| a.join().then(b.join()));
//! assert!(runtime.run_exit(program).is_success());
//! assert_eq!(counter.snapshot(), 2);
//!
//! let scope = Scope::new(ExecutionStrategy::Sequential);
//! let closed = runtime.run_exit(scope.close(Exit::succeed(())));
//! assert!(closed.is_success());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod clock;
pub mod concurrent;
pub mod config;
pub mod context;
pub mod deferred;
pub mod effect;
pub mod erased;
pub mod exit;
pub mod fiber;
pub(crate) mod interpreter;
pub mod layer;
pub mod log;
pub mod panic;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod stm;
pub mod timeout;

// Re-exports
pub use cause::{Cause, Defect, Failure, Reason};
pub use clock::{sleep, Clock, LiveClock, TestClock, TimerKey, CLOCK};
pub use config::{
    ConfigError, LogConfig, LogFormat, LogLevel, RuntimeConfig, RuntimeConfigBuilder,
    SchedulerConfig, TimeoutConfig,
};
pub use context::{Context, Reference, Tag};
pub use deferred::Deferred;
pub use effect::{absurd, Callback, Effect, Never, Restore};
pub use erased::Data;
pub use exit::{Exit, ScopeExit};
pub use fiber::{Fiber, FiberConfig, FiberId, FiberStatus, Priority};
pub use layer::{Layer, MemoMap};
pub use log::{init_tracing, LogInitError};
pub use runtime::{FiberFailure, Runtime};
pub use scheduler::{CurrentThreadScheduler, Scheduler, Task, WorkStealingScheduler};
pub use scope::{ExecutionStrategy, Finalizer, FinalizerKey, Scope, ScopeStatus, CURRENT_SCOPE};
pub use stm::TxRef;
pub use timeout::{Deadline, TimeoutError};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start a pool-backed runtime with the default configuration.
pub fn init() -> Runtime {
    init_with(RuntimeConfig::default())
}

/// Start a pool-backed runtime with `config`.
///
/// The first configuration passed here is kept for [`runtime_config`].
///
/// # Example
///
/// ```rust
/// use skein_runtime::{init_with, Effect, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .num_workers(2)
///     .build()
///     .unwrap();
///
/// let runtime = init_with(config);
/// assert_eq!(runtime.run_sync(Effect::<u32, ()>::succeed(7)).unwrap(), 7);
/// runtime.shutdown();
/// ```
pub fn init_with(config: RuntimeConfig) -> Runtime {
    let _ = RUNTIME_CONFIG.set(config.clone());
    Runtime::new(config)
}

/// Start a pool-backed runtime configured from `SKEIN_*` environment
/// variables. See [`RuntimeConfig::from_env`].
pub fn init_from_env() -> Runtime {
    init_with(RuntimeConfig::from_env())
}

/// Global runtime configuration.
static RUNTIME_CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

/// The configuration of the first runtime started with [`init_with`] or
/// [`init_from_env`].
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}
