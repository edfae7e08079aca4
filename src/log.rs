use std::sync::Arc;

/// Logger allows the library's internal logging to be handled by a third
/// party logging facility.
pub trait Logger: Send + Sync {
    /// Logs a general information message. This is verbose and should be
    /// discarded except when troubleshooting.
    fn info(&self, message: &str);

    /// Logs a non-critical error. Everything logged here can be recovered
    /// from or ignored; critical errors are always returned as values.
    fn error(&self, message: &str);
}

/// Discards every message.
pub struct NullLogger;

impl Logger for NullLogger {
    fn info(&self, _message: &str) {}

    fn error(&self, _message: &str) {}
}

/// Forwards messages to the [`log`] crate, so whatever logging backend the
/// embedding application installed picks them up.
pub struct StdLogger;

impl Logger for StdLogger {
    fn info(&self, message: &str) {
        log::info!("{message}");
    }

    fn error(&self, message: &str) {
        log::error!("{message}");
    }
}

/// Internal logging handle. Holding the sink as an option means call sites
/// never branch on whether logging is configured.
#[derive(Clone, Default)]
pub(crate) struct Log {
    sink: Option<Arc<dyn Logger>>,
    suffix: String,
}

impl Log {
    pub(crate) fn new(sink: Option<Arc<dyn Logger>>) -> Self {
        Self {
            sink,
            suffix: String::new(),
        }
    }

    /// A copy of this handle that appends `suffix` to every message, used to
    /// tag per-operation logs.
    pub(crate) fn scoped(&self, suffix: String) -> Self {
        Self {
            sink: self.sink.clone(),
            suffix,
        }
    }

    pub(crate) fn info(&self, message: &str) {
        if let Some(sink) = &self.sink {
            if self.suffix.is_empty() {
                sink.info(message);
            } else {
                sink.info(&format!("{message}{}", self.suffix));
            }
        }
    }

    pub(crate) fn error(&self, message: &str) {
        if let Some(sink) = &self.sink {
            if self.suffix.is_empty() {
                sink.error(message);
            } else {
                sink.error(&format!("{message}{}", self.suffix));
            }
        }
    }
}
