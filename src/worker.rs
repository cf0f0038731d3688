//! The detection loop: frame in, annotated payload and alarms out.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::alarm::AlarmKey;
use crate::annotate::{encode_jpeg, jpeg_data_url, Renderer};
use crate::broadcast::{format_local_time, DetectionRecord, FramePayload, Resolution};
use crate::capture::{AlarmTrigger, EventCaptureOrchestrator};
use crate::config::AlarmConfig;
use crate::context::PipelineContext;
use crate::frame::Frame;
use crate::zone::first_matching_zone;

/// How long a cycle waits for a fresh frame before reusing the last one.
pub const FRAME_WAIT: Duration = Duration::from_secs(1);
/// Pause after a cycle that did no work.
pub const IDLE_PAUSE: Duration = Duration::from_millis(100);
/// How often elapsed debounce entries are dropped.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// What one call to `run_cycle` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Processed a frame taken from the channel.
    NewFrame,
    /// No fresh frame arrived; the previous frame was processed again.
    Reused,
    /// No frame has been seen yet.
    Idle,
    NoDetector,
    DetectorFailed,
    RenderFailed,
}

/// Frame-rate estimate over windows of at least one second.
#[derive(Debug)]
pub struct FpsCounter {
    window_start: Instant,
    window_frames: u32,
    total_frames: u64,
    current: f32,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            window_frames: 0,
            total_frames: 0,
            current: 0.0,
        }
    }

    /// Count one new frame. Returns the updated rate when a window closes.
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.window_frames += 1;
        self.total_frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        self.current = self.window_frames as f32 / elapsed.as_secs_f32();
        self.window_frames = 0;
        self.window_start = now;
        Some(self.current)
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

pub struct DetectionWorker {
    ctx: Arc<PipelineContext>,
    capture: Arc<EventCaptureOrchestrator>,
    renderer: Renderer,
    fps: FpsCounter,
    last_frame: Option<Frame>,
    last_prune: Instant,
    frame_wait: Duration,
}

impl DetectionWorker {
    pub fn new(ctx: Arc<PipelineContext>, capture: Arc<EventCaptureOrchestrator>) -> Self {
        let now = Instant::now();
        Self {
            ctx,
            capture,
            renderer: Renderer::new(),
            fps: FpsCounter::new(now),
            last_frame: None,
            last_prune: now,
            frame_wait: FRAME_WAIT,
        }
    }

    pub fn with_frame_wait(mut self, wait: Duration) -> Self {
        self.frame_wait = wait;
        self
    }

    pub fn fps(&self) -> &FpsCounter {
        &self.fps
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("detection-worker".to_string())
            .spawn(move || self.run())
            .context("spawn detection worker thread")
    }

    pub fn run(mut self) {
        let shutdown = self.ctx.shutdown.clone();
        while !shutdown.is_triggered() {
            match self.run_cycle() {
                CycleOutcome::NewFrame | CycleOutcome::Reused => {}
                CycleOutcome::Idle
                | CycleOutcome::NoDetector
                | CycleOutcome::DetectorFailed
                | CycleOutcome::RenderFailed => {
                    shutdown.wait_timeout(IDLE_PAUSE);
                }
            }
        }
        log::debug!("detection worker stopped");
    }

    pub fn run_cycle(&mut self) -> CycleOutcome {
        let (frame, fresh) = match self.ctx.frames.recv_timeout(self.frame_wait) {
            Some(frame) => (frame, true),
            None => match &self.last_frame {
                Some(frame) => (frame.clone(), false),
                None => return CycleOutcome::Idle,
            },
        };

        let result = match self.ctx.detector.track(&frame) {
            Ok(Some(result)) => result,
            Ok(None) => {
                self.remember(frame, fresh);
                return CycleOutcome::NoDetector;
            }
            Err(e) => {
                log::warn!("{e:#}");
                self.remember(frame, fresh);
                return CycleOutcome::DetectorFailed;
            }
        };

        let classes = self.ctx.classes();
        let zones = self.ctx.zones();
        let alarm_config = self.ctx.alarm_config();
        let display = self.ctx.display();
        let now = Instant::now();
        let wall_now = Local::now();

        let mut records = Vec::with_capacity(result.boxes.len());
        let mut triggers = Vec::new();
        for detection in &result.boxes {
            if !classes.accepts(detection.class_id, detection.confidence) {
                continue;
            }
            let center = detection.centroid();
            let zone = first_matching_zone(&zones, &detection.bbox, alarm_config.detection_mode);
            let class_name = classes
                .name(detection.class_id)
                .map(str::to_string)
                .unwrap_or_else(|| format!("class_{}", detection.class_id));
            let display_name = classes.display_name(detection.class_id);

            if let (Some(zone), Some(track_id)) = (zone, detection.track_id) {
                let key = AlarmKey::object(track_id, detection.class_id, zone.id.clone());
                let fired = self.ctx.evaluate_alarm(key.clone(), AlarmConfig::policy, now);
                if fired {
                    triggers.push(AlarmTrigger {
                        key,
                        track_id,
                        class_id: detection.class_id,
                        object_name: display_name.clone(),
                        zone_id: zone.id.clone(),
                        zone_name: zone.name.clone(),
                        position: [center.x, center.y],
                        time: wall_now,
                    });
                }
            }

            let bbox = detection.bbox;
            records.push(DetectionRecord {
                id: detection.track_id,
                class_id: detection.class_id,
                class_name,
                display_name,
                bbox: [bbox.x1, bbox.y1, bbox.x2, bbox.y2],
                center: [center.x, center.y],
                confidence: detection.confidence,
                in_zone: zone.is_some(),
                zone_id: zone.map(|zone| zone.id.clone()),
            });
        }

        let rendered = self
            .renderer
            .render(&frame, &zones, &records, &display)
            .and_then(|annotated| {
                let jpeg = encode_jpeg(&annotated.image, display.jpeg_quality)?;
                Ok((Arc::new(annotated), jpeg))
            });
        let (annotated, jpeg) = match rendered {
            Ok(rendered) => rendered,
            Err(e) => {
                log::warn!("render failed: {e:#}");
                // These keys are already recorded in the engine.
                self.dispatch(triggers);
                self.remember(frame, fresh);
                return CycleOutcome::RenderFailed;
            }
        };
        self.ctx.set_latest_annotated(annotated);
        self.dispatch(triggers);

        if fresh {
            if let Some(fps) = self.fps.tick(now) {
                self.ctx.set_fps(fps);
            }
        }

        let payload = FramePayload {
            seq: frame.seq,
            timestamp: format_local_time(DateTime::<Local>::from(frame.captured_at)),
            frame: jpeg_data_url(&jpeg),
            zones,
            detections: records,
            fps: self.ctx.fps(),
            resolution: Resolution {
                width: frame.width,
                height: frame.height,
            },
        };
        self.ctx.sink.emit_frame(&Arc::new(payload));

        if now.saturating_duration_since(self.last_prune) >= PRUNE_INTERVAL {
            let window = alarm_config.debounce;
            let pruned = self.ctx.with_alarms(|engine| engine.prune(now, window));
            if pruned > 0 {
                log::debug!("pruned {pruned} expired alarm entries");
            }
            self.last_prune = now;
        }

        self.remember(frame, fresh);
        if fresh {
            CycleOutcome::NewFrame
        } else {
            CycleOutcome::Reused
        }
    }

    fn dispatch(&self, triggers: Vec<AlarmTrigger>) {
        for trigger in triggers {
            self.capture.trigger(trigger);
        }
    }

    fn remember(&mut self, frame: Frame, fresh: bool) {
        if fresh {
            self.last_frame = Some(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{AlarmEvent, BroadcastSink, LogEntry};
    use crate::config::ZonewatchConfig;
    use crate::context::Shutdown;
    use crate::detect::{
        DetectionBox, DetectionResult, DetectionScript, DetectorHandle, ScriptedDetector,
    };
    use crate::zone::{BoundingBox, Point, Zone};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<Arc<FramePayload>>>,
        alarms: Mutex<Vec<AlarmEvent>>,
    }

    impl BroadcastSink for CollectingSink {
        fn emit_frame(&self, payload: &Arc<FramePayload>) {
            self.frames.lock().unwrap().push(payload.clone());
        }
        fn emit_alarm(&self, event: &AlarmEvent) {
            self.alarms.lock().unwrap().push(event.clone());
        }
        fn emit_log(&self, _entry: &LogEntry) {}
    }

    struct Harness {
        ctx: Arc<PipelineContext>,
        sink: Arc<CollectingSink>,
        script: DetectionScript,
        capture: Arc<EventCaptureOrchestrator>,
        _events: tempfile::TempDir,
    }

    fn harness(configure: impl FnOnce(&mut ZonewatchConfig)) -> Result<Harness> {
        let events = tempfile::tempdir()?;
        let mut config = ZonewatchConfig::default();
        config.alarm.capture.save_path = events.path().to_path_buf();
        config.alarm.capture.clip_enabled = false;
        let mut zone = Zone::new(
            "Left Half",
            vec![
                Point::new(0.0, 0.0),
                Point::new(50.0, 0.0),
                Point::new(50.0, 100.0),
                Point::new(0.0, 100.0),
            ],
        );
        zone.id = "zone_left".to_string();
        config.zones.push(zone);
        configure(&mut config);

        let script = DetectionScript::new();
        let detector = DetectorHandle::new(Box::new(ScriptedDetector::new(script.clone())));
        let sink = Arc::new(CollectingSink::default());
        let ctx = PipelineContext::new(&config, detector, sink.clone(), Arc::new(Shutdown::new()))?;
        let capture = Arc::new(EventCaptureOrchestrator::new(ctx.clone()));
        Ok(Harness {
            ctx,
            sink,
            script,
            capture,
            _events: events,
        })
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, 100, 100, vec![40; 100 * 100 * 3])
    }

    fn person(track: Option<u64>, x: f32, confidence: f32) -> DetectionBox {
        DetectionBox::new(track, 0, confidence, BoundingBox::new(x, 40.0, x + 10.0, 60.0))
    }

    #[test]
    fn fps_counter_windows() {
        let start = Instant::now();
        let mut fps = FpsCounter::new(start);
        for i in 1..10 {
            assert_eq!(fps.tick(start + Duration::from_millis(i * 100)), None);
        }
        let rate = fps.tick(start + Duration::from_secs(1)).unwrap();
        assert!((rate - 10.0).abs() < 0.01);
        assert_eq!(fps.total_frames(), 10);
    }

    #[test]
    fn reused_frames_do_not_count() -> Result<()> {
        let h = harness(|_| {})?;
        let mut worker = DetectionWorker::new(h.ctx.clone(), h.capture.clone())
            .with_frame_wait(Duration::from_millis(20));

        assert_eq!(worker.run_cycle(), CycleOutcome::Idle);
        h.ctx.frames.push(frame(1));
        assert_eq!(worker.run_cycle(), CycleOutcome::NewFrame);
        assert_eq!(worker.fps().total_frames(), 1);
        assert_eq!(worker.run_cycle(), CycleOutcome::Reused);
        assert_eq!(worker.run_cycle(), CycleOutcome::Reused);
        assert_eq!(worker.fps().total_frames(), 1);
        assert_eq!(h.sink.frames.lock().unwrap().len(), 3);
        Ok(())
    }

    #[test]
    fn payload_marks_zone_membership_and_filters() -> Result<()> {
        let h = harness(|_| {})?;
        h.script.push(DetectionResult::new(vec![
            person(Some(1), 10.0, 0.9),
            person(Some(2), 70.0, 0.9),
            person(Some(3), 10.0, 0.1),
            DetectionBox::new(Some(4), 2, 0.9, BoundingBox::new(5.0, 5.0, 15.0, 15.0)),
        ]));
        let mut worker = DetectionWorker::new(h.ctx.clone(), h.capture.clone())
            .with_frame_wait(Duration::from_millis(20));
        h.ctx.frames.push(frame(1));
        assert_eq!(worker.run_cycle(), CycleOutcome::NewFrame);

        let frames = h.sink.frames.lock().unwrap();
        let payload = &frames[0];
        assert_eq!(payload.detections.len(), 2);
        assert!(payload.detections[0].in_zone);
        assert_eq!(payload.detections[0].zone_id.as_deref(), Some("zone_left"));
        assert_eq!(payload.detections[0].class_name, "person");
        assert!(!payload.detections[1].in_zone);
        assert!(payload.frame.starts_with("data:image/jpeg;base64,"));
        assert_eq!(payload.resolution, Resolution { width: 100, height: 100 });
        assert!(h.ctx.latest_annotated().is_some());
        Ok(())
    }

    #[test]
    fn alarms_are_debounced_across_cycles() -> Result<()> {
        let h = harness(|_| {})?;
        let mut worker = DetectionWorker::new(h.ctx.clone(), h.capture.clone())
            .with_frame_wait(Duration::from_millis(20));
        for seq in 1..=3 {
            h.script.push(DetectionResult::new(vec![person(Some(7), 10.0, 0.8)]));
            h.ctx.frames.push(frame(seq));
            worker.run_cycle();
        }
        assert!(h.capture.wait_idle(Duration::from_secs(10)));

        let alarms = h.sink.alarms.lock().unwrap();
        let raised: Vec<_> = alarms
            .iter()
            .filter(|event| event.phase == crate::broadcast::AlarmPhase::Raised)
            .collect();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].key, "7_0_zone_left");
        assert_eq!(raised[0].zone_name.as_deref(), Some("Left Half"));
        Ok(())
    }

    #[test]
    fn render_failure_still_emits_recorded_alarm() -> Result<()> {
        let h = harness(|_| {})?;
        let mut worker = DetectionWorker::new(h.ctx.clone(), h.capture.clone())
            .with_frame_wait(Duration::from_millis(20));

        h.script.push(DetectionResult::new(vec![person(Some(9), 10.0, 0.8)]));
        h.ctx.frames.push(Frame::new(1, 100, 100, vec![0; 10]));
        assert_eq!(worker.run_cycle(), CycleOutcome::RenderFailed);

        h.script.push(DetectionResult::new(vec![person(Some(9), 10.0, 0.8)]));
        h.ctx.frames.push(frame(2));
        assert_eq!(worker.run_cycle(), CycleOutcome::NewFrame);
        assert!(h.capture.wait_idle(Duration::from_secs(10)));

        let alarms = h.sink.alarms.lock().unwrap();
        let raised: Vec<_> = alarms
            .iter()
            .filter(|event| event.phase == crate::broadcast::AlarmPhase::Raised)
            .collect();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].key, "9_0_zone_left");
        assert_eq!(h.ctx.with_alarms(|engine| engine.len()), 1);
        Ok(())
    }

    #[test]
    fn untracked_boxes_never_alarm() -> Result<()> {
        let h = harness(|_| {})?;
        h.script.push(DetectionResult::new(vec![person(None, 10.0, 0.8)]));
        let mut worker = DetectionWorker::new(h.ctx.clone(), h.capture.clone())
            .with_frame_wait(Duration::from_millis(20));
        h.ctx.frames.push(frame(1));
        worker.run_cycle();

        assert!(h.sink.alarms.lock().unwrap().is_empty());
        assert!(h.sink.frames.lock().unwrap()[0].detections[0].in_zone);
        assert!(h.ctx.with_alarms(|engine| engine.is_empty()));
        Ok(())
    }

    #[test]
    fn detector_failure_skips_the_cycle() -> Result<()> {
        let h = harness(|_| {})?;
        h.script.push_failure("model crashed");
        let mut worker = DetectionWorker::new(h.ctx.clone(), h.capture.clone())
            .with_frame_wait(Duration::from_millis(20));
        h.ctx.frames.push(frame(1));
        assert_eq!(worker.run_cycle(), CycleOutcome::DetectorFailed);
        assert!(h.sink.frames.lock().unwrap().is_empty());

        // The failed frame is retried on the next cycle.
        assert_eq!(worker.run_cycle(), CycleOutcome::Reused);
        Ok(())
    }

    #[test]
    fn missing_detector_reports_no_detector() -> Result<()> {
        let h = harness(|_| {})?;
        h.ctx.detector.unload();
        let mut worker = DetectionWorker::new(h.ctx.clone(), h.capture.clone())
            .with_frame_wait(Duration::from_millis(20));
        h.ctx.frames.push(frame(1));
        assert_eq!(worker.run_cycle(), CycleOutcome::NoDetector);
        Ok(())
    }
}
