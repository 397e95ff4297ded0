//! Runtime Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SKEIN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SKEIN_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `SKEIN_MAX_OPS_BEFORE_YIELD` | Interpreter steps per fiber turn | 2048 |
//! | `SKEIN_GLOBAL_QUEUE_INTERVAL` | Ticks between global queue checks | 61 |
//! | `SKEIN_WORK_STEALING` | Enable work stealing ("true"/"false") | true |
//! | `SKEIN_DEFAULT_TIMEOUT_MS` | Default `run_sync` timeout in milliseconds (0 = none) | 0 |
//! | `SKEIN_GRACEFUL_SHUTDOWN_MS` | Graceful shutdown timeout in milliseconds | 5000 |
//! | `SKEIN_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `SKEIN_LOG_FORMAT` | Log output format (plain/json) | plain |
//!
//! # Example
//!
//! ```rust
//! use skein_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//! assert!(config.scheduler.num_workers >= 1);
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .max_ops_before_yield(512)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.scheduler.num_workers, 4);
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation, usable as an `EnvFilter`
    /// directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a log format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" | "pretty" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Interpreter steps a fiber may take before it yields its turn.
    /// Default: 2048.
    pub max_ops_before_yield: usize,

    /// A worker checks the global queue before its local deque once every
    /// this many tasks.
    /// Default: 61.
    pub global_queue_interval: usize,

    /// Enable work stealing between worker threads.
    /// Default: true.
    pub work_stealing: bool,

    /// How long `shutdown` waits for workers to stop.
    /// Default: 5 seconds.
    pub graceful_shutdown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            max_ops_before_yield: 2048,
            global_queue_interval: 61,
            work_stealing: true,
            graceful_shutdown: Duration::from_secs(5),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Default)]
pub struct TimeoutConfig {
    /// Timeout applied by `Runtime::run_sync`.
    /// None means no timeout (default).
    pub default_timeout: Option<Duration>,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Output format.
    /// Default: Plain.
    pub format: LogFormat,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,

    /// Include source location in log output.
    /// Default: false (only in debug builds).
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Plain,
            timestamps: true,
            source_location: cfg!(debug_assertions),
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Timeout configuration.
    pub timeout: TimeoutConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables that are not set will use default values.
    /// Invalid values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Scheduler configuration
        if let Some(val) = parse_env_usize("SKEIN_NUM_WORKERS") {
            if val > 0 {
                config.scheduler.num_workers = val;
            }
        }

        if let Some(val) = parse_env_usize("SKEIN_MAX_OPS_BEFORE_YIELD") {
            if val > 0 {
                config.scheduler.max_ops_before_yield = val;
            }
        }

        if let Some(val) = parse_env_usize("SKEIN_GLOBAL_QUEUE_INTERVAL") {
            if val > 0 {
                config.scheduler.global_queue_interval = val;
            }
        }

        if let Some(val) = parse_env_bool("SKEIN_WORK_STEALING") {
            config.scheduler.work_stealing = val;
        }

        if let Some(val) = parse_env_usize("SKEIN_GRACEFUL_SHUTDOWN_MS") {
            config.scheduler.graceful_shutdown = Duration::from_millis(val as u64);
        }

        // Timeout configuration
        if let Some(val) = parse_env_usize("SKEIN_DEFAULT_TIMEOUT_MS") {
            config.timeout.default_timeout = if val > 0 {
                Some(Duration::from_millis(val as u64))
            } else {
                None
            };
        }

        // Logging configuration
        if let Ok(val) = env::var("SKEIN_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        if let Ok(val) = env::var("SKEIN_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&val) {
                config.log.format = format;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.max_ops_before_yield == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.max_ops_before_yield".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.global_queue_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.global_queue_interval".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.timeout.default_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "timeout.default_timeout".into(),
                message: "use None to disable the timeout".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the fairness budget.
    pub fn max_ops_before_yield(mut self, ops: usize) -> Self {
        self.config.scheduler.max_ops_before_yield = ops;
        self
    }

    /// Set how often workers check the global queue first.
    pub fn global_queue_interval(mut self, ticks: usize) -> Self {
        self.config.scheduler.global_queue_interval = ticks;
        self
    }

    /// Enable or disable work stealing.
    pub fn work_stealing(mut self, enabled: bool) -> Self {
        self.config.scheduler.work_stealing = enabled;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn graceful_shutdown(mut self, timeout: Duration) -> Self {
        self.config.scheduler.graceful_shutdown = timeout;
        self
    }

    /// Set the default `run_sync` timeout.
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout.default_timeout = timeout;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        })
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
