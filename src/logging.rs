//! Logger setup: env_logger on stderr, plus forwarding of this crate's
//! records to the broadcast sink.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{Log, Metadata, Record};

use crate::broadcast::{now_string, BroadcastSink, LogEntry};
use crate::context::Shutdown;

pub const FORWARD_QUEUE_CAPACITY: usize = 256;

/// Targets never forwarded: the sinks themselves, so a sink that logs while
/// publishing cannot feed itself.
const SUPPRESSED_TARGETS: &[&str] = &["zonewatch::broadcast"];

struct ForwardingLogger {
    inner: env_logger::Logger,
    queue: SyncSender<LogEntry>,
}

impl ForwardingLogger {
    fn forwards(target: &str) -> bool {
        let own = target == "zonewatch" || target.starts_with("zonewatch::") || target == "zonewatchd";
        own && !SUPPRESSED_TARGETS
            .iter()
            .any(|prefix| target.starts_with(prefix))
    }
}

impl Log for ForwardingLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.inner.matches(record) {
            return;
        }
        self.inner.log(record);
        if Self::forwards(record.target()) {
            // Full queue: drop rather than block the logging thread.
            let _ = self.queue.try_send(LogEntry {
                timestamp: now_string(),
                level: record.level().to_string(),
                target: record.target().to_string(),
                message: record.args().to_string(),
            });
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Receiving side of the forwarding queue; drained by `LogForwarder::spawn`.
pub struct LogForwarder {
    queue: Receiver<LogEntry>,
}

/// Install the global logger. `RUST_LOG` overrides the default `info` filter.
pub fn init() -> Result<LogForwarder> {
    let inner = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .build();
    let max_level = inner.filter();
    let (queue, rx) = mpsc::sync_channel(FORWARD_QUEUE_CAPACITY);
    log::set_boxed_logger(Box::new(ForwardingLogger { inner, queue }))
        .context("install logger")?;
    log::set_max_level(max_level);
    Ok(LogForwarder { queue: rx })
}

impl LogForwarder {
    /// Drain the queue into `sink` until shutdown.
    pub fn spawn(self, sink: Arc<dyn BroadcastSink>, shutdown: Arc<Shutdown>) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("log-forwarder".to_string())
            .spawn(move || self.run(sink.as_ref(), &shutdown))
            .context("spawn log forwarder thread")
    }

    fn run(self, sink: &dyn BroadcastSink, shutdown: &Shutdown) {
        while !shutdown.is_triggered() {
            match self.queue.recv_timeout(Duration::from_millis(500)) {
                Ok(entry) => sink.emit_log(&entry),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        while let Ok(entry) = self.queue.try_recv() {
            sink.emit_log(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_own_targets_forward() {
        assert!(ForwardingLogger::forwards("zonewatch"));
        assert!(ForwardingLogger::forwards("zonewatch::worker"));
        assert!(!ForwardingLogger::forwards("zonewatch::broadcast::mqtt"));
        assert!(!ForwardingLogger::forwards("rumqttc::state"));
        assert!(!ForwardingLogger::forwards("zonewatchx"));
    }
}
