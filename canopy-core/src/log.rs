//! Injected logging capability. Components receive a `Logger`; nothing writes to a global sink.

use std::fmt;
use std::sync::Arc;

/// Severity shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Info,
    Warn,
    Fail,
}

/// Receives every notable event. Closures `Fn(Level, &str)` are sinks too.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(Level, &str) + Send + Sync,
{
    fn log(&self, level: Level, message: &str) {
        self(level, message)
    }
}

/// Forwards to `tracing` under the `canopy` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Info => tracing::info!(target: "canopy", "{message}"),
            Level::Warn => tracing::warn!(target: "canopy", "{message}"),
            Level::Fail => tracing::error!(target: "canopy", "{message}"),
        }
    }
}

/// Cheap-to-clone handle to a sink.
#[derive(Clone)]
pub struct Logger(Arc<dyn LogSink>);

impl Logger {
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Logger(Arc::new(sink))
    }

    pub fn tracing() -> Self {
        Logger::new(TracingSink)
    }

    pub fn log(&self, level: Level, message: impl AsRef<str>) {
        self.0.log(level, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(Level::Warn, message);
    }

    pub fn fail(&self, message: impl AsRef<str>) {
        self.log(Level::Fail, message);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::tracing()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Logger")
    }
}
