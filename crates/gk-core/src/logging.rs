//! Logging infrastructure for oxidized-gekko

use once_cell::sync::OnceCell;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

use crate::config::{Config, LogLevel};

static RELOAD_HANDLE: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(level_filter(level).into())
}

/// Initialize the logging system based on configuration
pub fn init(config: &Config) {
    if config.debug.log_level == LogLevel::Off {
        return;
    }

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(config.debug.log_level))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        );

    if config.debug.log_to_file {
        if let Ok(file) = std::fs::File::create(&config.debug.log_path) {
            let file_layer = fmt::layer().with_writer(file).with_ansi(false);
            let _ = subscriber.with(file_layer).try_init();
        } else {
            let _ = subscriber.try_init();
        }
    } else {
        let _ = subscriber.try_init();
    }
}

/// Initialize logging with default settings (for tests and quick starts)
pub fn init_default() {
    let _ = tracing_subscriber::registry()
        .with(env_filter(LogLevel::Info))
        .with(fmt::layer())
        .try_init();
}

/// Initialize logging with a filter that can be changed at runtime
pub fn init_with_reload(level: LogLevel) {
    let (filter, handle) = reload::Layer::new(env_filter(level));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init()
        .is_ok();

    if installed {
        let _ = RELOAD_HANDLE.set(handle);
    }
}

/// Change the log level of a subscriber installed by [`init_with_reload`]
///
/// Returns false when no reloadable subscriber is active.
pub fn set_log_level(level: LogLevel) -> bool {
    match RELOAD_HANDLE.get() {
        Some(handle) => handle.reload(env_filter(level)).is_ok(),
        None => false,
    }
}

// Convenience macros for component-specific logging

/// Log a CPU trace message
#[macro_export]
macro_rules! cpu_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "cpu", $($arg)*)
    };
}

/// Log a CPU debug message
#[macro_export]
macro_rules! cpu_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "cpu", $($arg)*)
    };
}

/// Log a JIT trace message
#[macro_export]
macro_rules! jit_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "jit", $($arg)*)
    };
}

/// Log a JIT debug message
#[macro_export]
macro_rules! jit_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "jit", $($arg)*)
    };
}

/// Log an MMU trace message
#[macro_export]
macro_rules! mmu_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "mmu", $($arg)*)
    };
}

/// Log an MMU debug message
#[macro_export]
macro_rules! mmu_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "mmu", $($arg)*)
    };
}

/// Log a scheduler trace message
#[macro_export]
macro_rules! timing_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "timing", $($arg)*)
    };
}

/// Log a scheduler debug message
#[macro_export]
macro_rules! timing_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "timing", $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_filter(LogLevel::Off), LevelFilter::OFF);
        assert_eq!(level_filter(LogLevel::Trace), LevelFilter::TRACE);
    }

    #[test]
    fn test_init_default_is_idempotent() {
        init_default();
        init_default();
        cpu_debug!("logging initialized twice without panicking");
    }
}
