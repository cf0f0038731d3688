use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};

use super::{open_source, VideoSource};
use crate::context::PipelineContext;

/// Opens a source for an address. Injectable so tests can script failures.
pub type SourceOpener = Box<dyn Fn(&str) -> Result<Box<dyn VideoSource>> + Send>;

/// Reconnect timing.
///
/// The first `quick_retries` consecutive open failures are retried after
/// `quick_delay`; the next failure waits `backoff` and starts a new round.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub quick_retries: u32,
    pub quick_delay: Duration,
    pub backoff: Duration,
    /// Pause after a read failure before reopening.
    pub read_failure_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            quick_retries: 5,
            quick_delay: Duration::from_secs(2),
            backoff: Duration::from_secs(5),
            read_failure_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive open failure. Returns the
    /// delay and whether the failure counter should restart.
    pub fn open_delay(&self, failures: u32) -> (Duration, bool) {
        if failures <= self.quick_retries {
            (self.quick_delay, false)
        } else {
            (self.backoff, true)
        }
    }
}

/// Slice used for interruptible waits.
const WAIT_SLICE: Duration = Duration::from_millis(100);

enum PumpEnd {
    Shutdown,
    SourceChanged,
    ReadFailed,
}

/// Keeps the source open and feeds the frame channel.
pub struct StreamIngestor {
    ctx: Arc<PipelineContext>,
    opener: SourceOpener,
    retry: RetryPolicy,
}

impl StreamIngestor {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            opener: Box::new(open_source),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_opener(mut self, opener: SourceOpener) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("ingestor".to_string())
            .spawn(move || self.run())
            .context("spawn ingestor thread")
    }

    pub fn run(self) {
        let shutdown = self.ctx.shutdown.clone();
        let mut failures = 0u32;
        let mut generation = self.ctx.source_generation();

        while !shutdown.is_triggered() {
            let current = self.ctx.source_generation();
            if current != generation {
                generation = current;
                failures = 0;
                self.ctx.frames.clear();
            }

            let url = self.ctx.source_url();
            let source = match (self.opener)(&url) {
                Ok(source) => source,
                Err(e) => {
                    failures += 1;
                    let (delay, restart) = self.retry.open_delay(failures);
                    if restart {
                        failures = 0;
                    }
                    log::warn!(
                        "{e:#}; retrying in {:.0}s",
                        delay.as_secs_f32()
                    );
                    self.mark_disconnected(&url, format!("{e:#}"));
                    self.pause(delay, generation);
                    continue;
                }
            };

            failures = 0;
            let info = source.info();
            log::info!(
                "stream connected: {} ({}x{} @ {:.1} fps)",
                url,
                info.width,
                info.height,
                info.fps
            );
            self.ctx.update_stream_info(|stream| {
                stream.url = url.clone();
                stream.connected = true;
                stream.width = info.width;
                stream.height = info.height;
                stream.fps = info.fps;
                stream.frames_read = 0;
                stream.last_error = None;
            });

            match self.pump(source, &url, generation) {
                PumpEnd::Shutdown => break,
                PumpEnd::SourceChanged => {
                    log::info!("source changed, reconnecting");
                    self.mark_disconnected(&url, "source changed".to_string());
                }
                PumpEnd::ReadFailed => {
                    self.ctx.update_stream_info(|stream| stream.reconnects += 1);
                    self.pause(self.retry.read_failure_delay, generation);
                }
            }
        }

        self.ctx.update_stream_info(|stream| stream.connected = false);
        log::debug!("ingestor stopped");
    }

    fn pump(&self, mut source: Box<dyn VideoSource>, url: &str, generation: u64) -> PumpEnd {
        loop {
            if self.ctx.shutdown.is_triggered() {
                return PumpEnd::Shutdown;
            }
            if self.ctx.source_generation() != generation {
                return PumpEnd::SourceChanged;
            }
            match source.read_frame() {
                Ok(frame) => {
                    if !frame.is_well_formed() {
                        log::debug!("dropping malformed frame {}", frame.seq);
                        continue;
                    }
                    self.ctx.update_stream_info(|stream| {
                        stream.frames_read += 1;
                        stream.width = frame.width;
                        stream.height = frame.height;
                    });
                    self.ctx.frames.push(frame);
                }
                Err(e) => {
                    log::warn!("read from {url} failed: {e:#}");
                    self.mark_disconnected(url, format!("{e:#}"));
                    return PumpEnd::ReadFailed;
                }
            }
        }
    }

    fn mark_disconnected(&self, url: &str, error: String) {
        self.ctx.update_stream_info(|stream| {
            stream.url = url.to_string();
            stream.connected = false;
            stream.last_error = Some(error);
        });
    }

    /// Wait `delay`, returning early on shutdown or a source change.
    fn pause(&self, delay: Duration, generation: u64) {
        let mut remaining = delay;
        while !remaining.is_zero() {
            let slice = remaining.min(WAIT_SLICE);
            if self.ctx.shutdown.wait_timeout(slice) {
                return;
            }
            if self.ctx.source_generation() != generation {
                return;
            }
            remaining = remaining.saturating_sub(slice);
        }
    }
}
