//! Logging bootstrap.
//!
//! Structured logging via tracing with JSON (production) and plaintext
//! (development) output. The dashboard shell calls [`init_logging`] once
//! at boot; library code only emits through the `tracing` macros with
//! the `sync` target.
//!
//! # Environment Variables
//!
//! - `STORESYNC_LOG` - primary log level/filter (takes precedence)
//! - `RUST_LOG` - fallback log level/filter

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON for production (structured logs).
    Json,
    /// Human-readable plaintext for development.
    #[default]
    Plaintext,
}

/// Log output destination.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Configuration for the logging subsystem.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default level when no env filter is set.
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stdout at INFO.
    pub fn development() -> Self {
        Self::default()
    }

    /// JSON to stdout at INFO.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Self::default()
        }
    }
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("failed to open log file {path}: {message}")]
    File { path: String, message: String },
}

/// Initialize the global tracing subscriber. Callable once per process;
/// later calls return [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level);

    let open = |path: &PathBuf| -> Result<Arc<File>, LoggingError> {
        File::create(path).map(Arc::new).map_err(|e| LoggingError::File {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    };

    let fmt_layer = match (config.format, &config.output) {
        (LogFormat::Json, LogOutput::Stdout) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stdout)
            .boxed(),
        (LogFormat::Json, LogOutput::Stderr) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .boxed(),
        (LogFormat::Json, LogOutput::File(path)) => tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(open(path)?)
            .boxed(),
        (LogFormat::Plaintext, LogOutput::Stdout) => tracing_subscriber::fmt::layer()
            .with_writer(io::stdout)
            .boxed(),
        (LogFormat::Plaintext, LogOutput::Stderr) => tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .boxed(),
        (LogFormat::Plaintext, LogOutput::File(path)) => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(open(path)?)
            .boxed(),
    };

    // A second global subscriber (e.g. set by the host's own init) is
    // treated as already-initialized rather than a hard failure.
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}

fn build_env_filter(default_level: Level) -> EnvFilter {
    let directive = std::env::var("STORESYNC_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok();

    match directive {
        Some(directive) => EnvFilter::try_new(directive)
            .unwrap_or_else(|_| EnvFilter::new(default_level.to_string())),
        None => EnvFilter::new(default_level.to_string()),
    }
}
