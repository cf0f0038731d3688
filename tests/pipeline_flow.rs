use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use zonewatch::broadcast::DetectionRecord;
use zonewatch::detect::{DetectionBox, DetectionResult, DetectionScript, ScriptedDetector};
use zonewatch::zone::BoundingBox;
use zonewatch::{
    AlarmEvent, AlarmKind, AlarmPhase, BroadcastSink, DetectorHandle, FramePayload, LaunchOptions,
    LogEntry, Pipeline, Point, Shutdown, Zone, ZonewatchConfig,
};

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

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

fn left_half() -> Zone {
    let mut zone = Zone::new(
        "Left Half",
        vec![
            Point::new(0.0, 0.0),
            Point::new(32.0, 0.0),
            Point::new(32.0, 48.0),
            Point::new(0.0, 48.0),
        ],
    );
    zone.id = "zone_lefthalf".to_string();
    zone
}

fn launch(
    script: &DetectionScript,
    events: &tempfile::TempDir,
) -> Result<(Pipeline, Arc<CollectingSink>)> {
    let mut config = ZonewatchConfig {
        source_url: "stub://yard?width=64&height=48&fps=25".to_string(),
        zones: vec![left_half()],
        ..ZonewatchConfig::default()
    };
    config.alarm.capture.save_path = events.path().to_path_buf();
    config.alarm.capture.clip_enabled = false;

    let detector = DetectorHandle::new(Box::new(ScriptedDetector::new(script.clone())));
    let sink = Arc::new(CollectingSink::default());
    let options = LaunchOptions::new(detector, sink.clone(), Arc::new(Shutdown::new()));
    Ok((Pipeline::launch(config, options)?, sink))
}

fn person(track_id: u64, x1: f32) -> DetectionBox {
    DetectionBox::new(Some(track_id), 0, 0.9, BoundingBox::new(x1, 10.0, x1 + 10.0, 30.0))
}

#[test]
fn intruder_raises_one_alarm_with_snapshot() -> Result<()> {
    let events = tempfile::tempdir()?;
    let script = DetectionScript::new();
    script.set_fallback(DetectionResult::new(vec![
        person(7, 5.0),
        person(8, 45.0),
        DetectionBox::new(Some(9), 2, 0.95, BoundingBox::new(5.0, 5.0, 15.0, 15.0)),
    ]));
    let (pipeline, sink) = launch(&script, &events)?;

    assert!(wait_until(Duration::from_secs(10), || {
        sink.alarms
            .lock()
            .unwrap()
            .iter()
            .any(|alarm| alarm.phase == AlarmPhase::Captured)
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        sink.frames.lock().unwrap().len() >= 3
    }));

    let status = pipeline.controller().status();
    assert!(status.stream.connected);
    assert_eq!(status.zones_active, 1);
    assert_eq!(status.alarm_states, 1);
    pipeline.shutdown();

    let alarms = sink.alarms.lock().unwrap();
    let raised: Vec<&AlarmEvent> = alarms
        .iter()
        .filter(|alarm| alarm.phase == AlarmPhase::Raised)
        .collect();
    assert_eq!(raised.len(), 1, "debounce keeps a lingering track to one alarm");
    assert_eq!(raised[0].kind, AlarmKind::Intrusion);
    assert_eq!(raised[0].track_id, Some(7));
    assert_eq!(raised[0].zone_id.as_deref(), Some("zone_lefthalf"));
    assert_eq!(raised[0].key, "7_0_zone_lefthalf");

    let captured = alarms
        .iter()
        .find(|alarm| alarm.phase == AlarmPhase::Captured)
        .expect("captured event");
    let snapshot = captured.snapshot.as_deref().expect("snapshot file");
    assert!(snapshot.ends_with(".jpg"));
    assert!(snapshot.contains("Left_Half"));
    assert!(events.path().join(snapshot).is_file());
    assert!(captured.clip.is_none());

    let frames = sink.frames.lock().unwrap();
    let last = frames.last().expect("frame payload");
    assert!(last.frame.starts_with("data:image/jpeg;base64,"));
    assert_eq!((last.resolution.width, last.resolution.height), (64, 48));
    let by_id = |id: u64| -> Option<&DetectionRecord> {
        last.detections.iter().find(|d| d.id == Some(id))
    };
    assert!(by_id(7).map(|d| d.in_zone).unwrap_or(false));
    assert!(!by_id(8).map(|d| d.in_zone).unwrap_or(true));
    assert!(by_id(9).is_none(), "disabled classes are filtered out");
    Ok(())
}

#[test]
fn deleting_zone_stops_alarms_and_clears_state() -> Result<()> {
    let events = tempfile::tempdir()?;
    let script = DetectionScript::new();
    script.set_fallback(DetectionResult::new(vec![person(3, 5.0)]));
    let (pipeline, sink) = launch(&script, &events)?;

    assert!(wait_until(Duration::from_secs(10), || {
        !sink.alarms.lock().unwrap().is_empty()
    }));
    let controller = pipeline.controller().clone();
    controller.delete_zone("zone_lefthalf")?;
    assert_eq!(controller.status().alarm_states, 0);

    let seen = sink.frames.lock().unwrap().len();
    assert!(wait_until(Duration::from_secs(5), || {
        sink.frames.lock().unwrap().len() >= seen + 3
    }));
    pipeline.shutdown();

    let frames = sink.frames.lock().unwrap();
    let last = frames.last().expect("frame payload");
    assert!(last.zones.is_empty());
    assert!(last.detections.iter().all(|d| !d.in_zone));
    Ok(())
}

#[test]
fn detector_failures_do_not_stop_the_worker() -> Result<()> {
    let events = tempfile::tempdir()?;
    let script = DetectionScript::new();
    script.push_failure("model crashed");
    script.push_failure("model crashed again");
    let (pipeline, sink) = launch(&script, &events)?;

    assert!(wait_until(Duration::from_secs(10), || {
        !sink.frames.lock().unwrap().is_empty()
    }));
    assert!(script.calls() >= 3);
    pipeline.shutdown();
    Ok(())
}
