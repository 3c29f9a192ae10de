//! Logger module for Corral
//!
//! Go-style simple logging: `[LEVEL] message`
//!
//! # Usage
//!
//! ```rust
//! use corral::util::logger;
//!
//! logger::init();
//! tracing::info!("Hello, {}", "world");
//! ```

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Initialize logger with default configuration (INFO level)
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// Initialize logger with custom level (Go style: `[LEVEL] message`)
///
/// Safe to call more than once; only the first call installs a subscriber,
/// so tests can all call it without panicking.
pub fn init_with_level(level: LogLevel) {
    INSTALLED.get_or_init(|| {
        let filter = tracing_subscriber::filter::LevelFilter::from_level(level.into());

        let layer = tracing_subscriber::fmt::layer()
            .without_time()
            .with_target(false)
            .with_level(true)
            .with_ansi(false)
            .compact()
            .with_filter(filter);

        Registry::default().with(layer).init();
    });
}

/// Initialize logger for debug use (DEBUG level)
pub fn init_debug() {
    init_with_level(LogLevel::Debug);
}

/// Initialize logger for scheduler tracing (TRACE level)
pub fn init_trace() {
    init_with_level(LogLevel::Trace);
}
