//! Wiring of the long-lived pipeline tasks.
//!
//! `Pipeline::launch` builds the shared context and starts the ingestor, the
//! detection worker, the camera health monitor and (optionally) the log
//! forwarder. `Pipeline::shutdown` stops them in a fixed order: signal,
//! recorder, task threads, then outstanding event captures.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

use crate::broadcast::BroadcastSink;
use crate::capture::EventCaptureOrchestrator;
use crate::config::ZonewatchConfig;
use crate::context::{PipelineContext, Shutdown};
use crate::control::Controller;
use crate::detect::DetectorHandle;
use crate::health::{CameraHealthMonitor, Probe};
use crate::ingest::{RetryPolicy, SourceOpener, StreamIngestor};
use crate::logging::LogForwarder;
use crate::recording::RecordingSupervisor;
use crate::store::ConfigStore;
use crate::worker::DetectionWorker;

/// Extra time granted to in-flight captures at shutdown.
const CAPTURE_DRAIN_SLACK: Duration = Duration::from_secs(2);

/// Collaborators handed to `Pipeline::launch`.
pub struct LaunchOptions {
    detector: DetectorHandle,
    sink: Arc<dyn BroadcastSink>,
    shutdown: Arc<Shutdown>,
    store: Option<Arc<dyn ConfigStore>>,
    forwarder: Option<LogForwarder>,
    opener: Option<SourceOpener>,
    retry: Option<RetryPolicy>,
    probe: Option<Box<dyn Probe>>,
}

impl LaunchOptions {
    pub fn new(detector: DetectorHandle, sink: Arc<dyn BroadcastSink>, shutdown: Arc<Shutdown>) -> Self {
        Self {
            detector,
            sink,
            shutdown,
            store: None,
            forwarder: None,
            opener: None,
            retry: None,
            probe: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn log_forwarder(mut self, forwarder: LogForwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn source_opener(mut self, opener: SourceOpener) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn health_probe(mut self, probe: Box<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    controller: Arc<Controller>,
    recorder: Arc<RecordingSupervisor>,
    capture: Arc<EventCaptureOrchestrator>,
    threads: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn launch(config: ZonewatchConfig, options: LaunchOptions) -> Result<Self> {
        let LaunchOptions {
            detector,
            sink,
            shutdown,
            store,
            forwarder,
            opener,
            retry,
            probe,
        } = options;

        let ctx = PipelineContext::new(&config, detector, sink.clone(), shutdown.clone())?;
        let recorder = Arc::new(RecordingSupervisor::new(config.recording.clone()));
        let capture = Arc::new(EventCaptureOrchestrator::new(ctx.clone()));
        let auto_record = config.recording.auto_start;

        let mut controller = Controller::new(ctx.clone(), recorder.clone(), config);
        if let Some(store) = store {
            controller = controller.with_store(store);
        }

        let mut pipeline = Self {
            ctx: ctx.clone(),
            controller: Arc::new(controller),
            recorder,
            capture: capture.clone(),
            threads: Vec::new(),
        };

        let mut ingestor = StreamIngestor::new(ctx.clone());
        if let Some(opener) = opener {
            ingestor = ingestor.with_opener(opener);
        }
        if let Some(retry) = retry {
            ingestor = ingestor.with_retry(retry);
        }
        let mut monitor = CameraHealthMonitor::new(ctx.clone());
        if let Some(probe) = probe {
            monitor = monitor.with_probe(probe);
        }

        let spawned = (|| -> Result<()> {
            pipeline.threads.push(ingestor.spawn()?);
            pipeline
                .threads
                .push(DetectionWorker::new(ctx.clone(), capture).spawn()?);
            pipeline.threads.push(monitor.spawn()?);
            if let Some(forwarder) = forwarder {
                pipeline.threads.push(forwarder.spawn(sink, shutdown.clone())?);
            }
            Ok(())
        })();
        if let Err(e) = spawned {
            pipeline.shutdown();
            return Err(e);
        }

        log::info!(
            "pipeline started: source {}, detector {}, {} zone(s)",
            ctx.source_url(),
            ctx.detector.name().unwrap_or_else(|| "none".to_string()),
            ctx.zones().len()
        );

        if auto_record {
            if let Err(e) = pipeline.controller.start_recording() {
                log::error!("auto-start recording failed: {e:#}");
            }
        }
        Ok(pipeline)
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Block until the shutdown signal fires.
    pub fn wait(&self) {
        while !self.ctx.shutdown.wait_timeout(Duration::from_secs(1)) {}
    }

    pub fn shutdown(self) {
        log::info!("pipeline shutting down");
        self.ctx.shutdown.trigger();
        self.recorder.shutdown();

        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("pipeline").to_string();
            if handle.join().is_err() {
                log::error!("{name} thread panicked");
            }
        }

        let capture = self.ctx.alarm_config().capture;
        let drain = capture.clip_duration + capture.grace + CAPTURE_DRAIN_SLACK;
        if !self.capture.wait_idle(drain) {
            log::warn!("event captures still running after {:.0}s", drain.as_secs_f64());
        }
        log::info!("pipeline stopped");
    }
}
