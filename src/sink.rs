//! Operational event sink
//!
//! Sessions narrate their lifecycle (admissions, departures, teardown) as
//! human-readable lines to an [`EventSink`]. The sink is an opaque
//! collaborator (the session-log writer lives outside this crate), so the
//! default implementation simply forwards to the logging facade.

use std::sync::Arc;

pub trait EventSink: Send + Sync {
    fn line(&self, line: &str);
}

/// Default sink: forward to `log::info!`.
pub struct LogSink;

impl EventSink for LogSink {
    fn line(&self, line: &str) {
        log::info!("{}", line);
    }
}

pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(LogSink)
}
