//! Shared state passed to every pipeline task.
//!
//! Each field has its own lock. A task that needs two at once acquires them in
//! declaration order:
//!
//! `source_url` → `detector` → `classes` → `zones` → `alarm_config` →
//! `alarms` → `display` → `health_settings` → `health` → `stream_info` →
//! `latest_annotated`
//!
//! Accessors below take at most one lock each and return owned snapshots, so
//! callers rarely need to think about the order.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::alarm::{AlarmEngine, AlarmKey, AlarmPolicy};
use crate::annotate::AnnotatedFrame;
use crate::broadcast::BroadcastSink;
use crate::config::{AlarmConfig, DisplayConfig, HealthSettings, ZonewatchConfig};
use crate::detect::{ClassCatalog, DetectorHandle};
use crate::frame::FrameChannel;
use crate::health::CameraHealth;
use crate::ingest::StreamInfo;
use crate::zone::Zone;

/// Process-wide stop signal. Every bounded wait in the pipeline goes through
/// `wait_timeout`, so `trigger` wakes all tasks promptly.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cv.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`. Returns true if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_triggered() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (next, _) = self
                .cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
        self.is_triggered()
    }
}

pub struct PipelineContext {
    pub shutdown: Arc<Shutdown>,
    source_url: RwLock<String>,
    /// Bumped on every source change; the ingestor reconnects when it moves.
    source_generation: AtomicU64,
    pub detector: DetectorHandle,
    classes: RwLock<ClassCatalog>,
    zones: RwLock<Vec<Zone>>,
    alarm_config: RwLock<AlarmConfig>,
    alarms: Mutex<AlarmEngine>,
    display: RwLock<DisplayConfig>,
    health_settings: Mutex<HealthSettings>,
    health: Mutex<CameraHealth>,
    stream_info: Mutex<StreamInfo>,
    latest_annotated: Mutex<Option<Arc<AnnotatedFrame>>>,
    /// f32 bits of the current detection frame rate.
    fps_bits: AtomicU32,
    pub frames: Arc<FrameChannel>,
    pub sink: Arc<dyn BroadcastSink>,
}

impl PipelineContext {
    pub fn new(
        config: &ZonewatchConfig,
        detector: DetectorHandle,
        sink: Arc<dyn BroadcastSink>,
        shutdown: Arc<Shutdown>,
    ) -> Result<Arc<Self>> {
        let mut classes = ClassCatalog::coco();
        if let Some(names) = detector.class_names() {
            classes.replace_names(names);
        }
        config.classes.apply_to(&mut classes)?;

        let health = CameraHealth::new(config.health.interval);
        Ok(Arc::new(Self {
            shutdown,
            source_url: RwLock::new(config.source_url.clone()),
            source_generation: AtomicU64::new(0),
            detector,
            classes: RwLock::new(classes),
            zones: RwLock::new(config.zones.clone()),
            alarm_config: RwLock::new(config.alarm.clone()),
            alarms: Mutex::new(AlarmEngine::new()),
            display: RwLock::new(config.display.clone()),
            health_settings: Mutex::new(config.health.clone()),
            health: Mutex::new(health),
            stream_info: Mutex::new(StreamInfo::new(&config.source_url)),
            latest_annotated: Mutex::new(None),
            fps_bits: AtomicU32::new(0f32.to_bits()),
            frames: Arc::new(FrameChannel::default()),
            sink,
        }))
    }

    // -- source ---------------------------------------------------------------

    pub fn source_url(&self) -> String {
        read(&self.source_url).clone()
    }

    pub fn source_generation(&self) -> u64 {
        self.source_generation.load(Ordering::SeqCst)
    }

    /// Replace the source address. Returns false when it is unchanged.
    pub fn set_source_url(&self, url: &str) -> bool {
        let mut current = write(&self.source_url);
        if *current == url {
            return false;
        }
        *current = url.to_string();
        self.source_generation.fetch_add(1, Ordering::SeqCst);
        true
    }

    // -- classes --------------------------------------------------------------

    pub fn classes(&self) -> ClassCatalog {
        read(&self.classes).clone()
    }

    pub fn update_classes<T>(&self, f: impl FnOnce(&mut ClassCatalog) -> Result<T>) -> Result<T> {
        let mut classes = write(&self.classes);
        let mut draft = classes.clone();
        let out = f(&mut draft)?;
        *classes = draft;
        Ok(out)
    }

    // -- zones ----------------------------------------------------------------

    pub fn zones(&self) -> Vec<Zone> {
        read(&self.zones).clone()
    }

    pub fn update_zones<T>(&self, f: impl FnOnce(&mut Vec<Zone>) -> Result<T>) -> Result<T> {
        let mut zones = write(&self.zones);
        let mut draft = zones.clone();
        let out = f(&mut draft)?;
        *zones = draft;
        Ok(out)
    }

    // -- alarms ---------------------------------------------------------------

    pub fn alarm_config(&self) -> AlarmConfig {
        read(&self.alarm_config).clone()
    }

    /// Replace the alarm config and return the previous one. When
    /// `once_per_id` flips, alarm state is cleared under the same write guard
    /// so no evaluation lands between the switch and the reset.
    pub fn replace_alarm_config(&self, config: AlarmConfig) -> AlarmConfig {
        let mut current = write(&self.alarm_config);
        let flipped = current.once_per_id != config.once_per_id;
        let previous = std::mem::replace(&mut *current, config);
        if flipped {
            lock(&self.alarms).reset();
        }
        previous
    }

    pub fn with_alarms<T>(&self, f: impl FnOnce(&mut AlarmEngine) -> T) -> T {
        f(&mut lock(&self.alarms))
    }

    /// Evaluate `key` under the policy `policy` derives from the current
    /// alarm config. Object keys fire only while their zone still exists.
    /// The zone list and the alarm config stay read-locked so neither
    /// `remove_zone` nor `replace_alarm_config` can interleave.
    pub fn evaluate_alarm(
        &self,
        key: AlarmKey,
        policy: impl FnOnce(&AlarmConfig) -> AlarmPolicy,
        now: Instant,
    ) -> bool {
        let zones = read(&self.zones);
        if let Some(zone_id) = key.zone_id() {
            if !zones.iter().any(|zone| zone.id == zone_id) {
                return false;
            }
        }
        let config = read(&self.alarm_config);
        let policy = policy(&config);
        lock(&self.alarms).evaluate(key, policy, now)
    }

    /// Remove a zone and its alarm state in one step. Returns the zone and
    /// the number of cleared entries.
    pub fn remove_zone(&self, zone_id: &str) -> Option<(Zone, usize)> {
        let mut zones = write(&self.zones);
        let index = zones.iter().position(|zone| zone.id == zone_id)?;
        let zone = zones.remove(index);
        let cleared = lock(&self.alarms).clear_zone(zone_id);
        Some((zone, cleared))
    }

    // -- display --------------------------------------------------------------

    pub fn display(&self) -> DisplayConfig {
        read(&self.display).clone()
    }

    pub fn set_display(&self, display: DisplayConfig) {
        *write(&self.display) = display;
    }

    // -- health ---------------------------------------------------------------

    pub fn health_settings(&self) -> HealthSettings {
        lock(&self.health_settings).clone()
    }

    pub fn set_health_settings(&self, settings: HealthSettings) {
        *lock(&self.health_settings) = settings;
    }

    pub fn camera_health(&self) -> CameraHealth {
        lock(&self.health).clone()
    }

    pub fn update_camera_health<T>(&self, f: impl FnOnce(&mut CameraHealth) -> T) -> T {
        f(&mut lock(&self.health))
    }

    // -- stream ---------------------------------------------------------------

    pub fn stream_info(&self) -> StreamInfo {
        lock(&self.stream_info).clone()
    }

    pub fn update_stream_info(&self, f: impl FnOnce(&mut StreamInfo)) {
        f(&mut lock(&self.stream_info));
    }

    pub fn latest_annotated(&self) -> Option<Arc<AnnotatedFrame>> {
        lock(&self.latest_annotated).clone()
    }

    pub fn set_latest_annotated(&self, frame: Arc<AnnotatedFrame>) {
        *lock(&self.latest_annotated) = Some(frame);
    }

    pub fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    pub fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
