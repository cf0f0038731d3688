//! In-process control surface: the configuration boundary of the pipeline.
//!
//! Every setter validates before touching shared state, so nothing invalid
//! reaches the running tasks. Successful mutations are written back through
//! the attached `ConfigStore`.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;

use crate::config::{
    validate_model_name, AlarmConfig, ClassSettings, DetectorSettings, DisplayConfig,
    HealthSettings, RecordingConfig, ZonewatchConfig,
};
use crate::context::{lock, PipelineContext};
use crate::detect::{build_detector, list_models, Detector, ModelInfo};
use crate::error::{invalid_config, invalid_zone};
use crate::health::CameraHealth;
use crate::ingest::StreamInfo;
use crate::process::StopOutcome;
use crate::recording::{RecordingStatus, RecordingSupervisor};
use crate::store::ConfigStore;
use crate::zone::{generate_zone_id, Point, Zone};

/// Partial zone edit. Unset fields keep their value.
#[derive(Clone, Debug, Default)]
pub struct ZoneUpdate {
    pub name: Option<String>,
    pub points: Option<Vec<Point>>,
    pub enabled: Option<bool>,
    pub fill_color: Option<[u8; 3]>,
    pub border_color: Option<[u8; 3]>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    pub source_url: String,
    pub stream: StreamInfo,
    pub fps: f32,
    pub detector: Option<String>,
    pub zones_total: usize,
    pub zones_active: usize,
    pub alarm_states: usize,
    pub once_per_id: bool,
    pub debounce_secs: f64,
    pub recording: RecordingStatus,
    pub camera: CameraHealth,
}

pub struct Controller {
    ctx: Arc<PipelineContext>,
    recorder: Arc<RecordingSupervisor>,
    store: Option<Arc<dyn ConfigStore>>,
    /// Settings the running tasks do not own (detector, MQTT); merged into
    /// every persisted snapshot.
    base: Mutex<ZonewatchConfig>,
}

impl Controller {
    pub fn new(
        ctx: Arc<PipelineContext>,
        recorder: Arc<RecordingSupervisor>,
        base: ZonewatchConfig,
    ) -> Self {
        Self {
            ctx,
            recorder,
            store: None,
            base: Mutex::new(base),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    // -- zones ----------------------------------------------------------------

    pub fn zones(&self) -> Vec<Zone> {
        self.ctx.zones()
    }

    /// Add a zone. An empty id is replaced with a generated one.
    pub fn add_zone(&self, mut zone: Zone) -> Result<Zone> {
        if zone.id.trim().is_empty() {
            zone.id = generate_zone_id();
        }
        zone.name = zone.name.trim().to_string();
        zone.validate()?;

        let added = self.ctx.update_zones(|zones| {
            if zones.iter().any(|z| z.id == zone.id) {
                return Err(invalid_zone(format!("duplicate zone id '{}'", zone.id)));
            }
            zones.push(zone.clone());
            Ok(zone)
        })?;
        log::info!("zone added: {} ({})", added.name, added.id);
        self.persist();
        Ok(added)
    }

    pub fn update_zone(&self, id: &str, update: ZoneUpdate) -> Result<Zone> {
        let updated = self.ctx.update_zones(|zones| {
            let zone = zones
                .iter_mut()
                .find(|z| z.id == id)
                .ok_or_else(|| invalid_zone(format!("zone '{id}' not found")))?;
            let mut draft = zone.clone();
            if let Some(name) = update.name {
                draft.name = name.trim().to_string();
            }
            if let Some(points) = update.points {
                draft.points = points;
            }
            if let Some(enabled) = update.enabled {
                draft.enabled = enabled;
            }
            if update.fill_color.is_some() {
                draft.fill_color = update.fill_color;
            }
            if update.border_color.is_some() {
                draft.border_color = update.border_color;
            }
            draft.validate()?;
            *zone = draft.clone();
            Ok(draft)
        })?;
        log::info!("zone updated: {} ({})", updated.name, updated.id);
        self.persist();
        Ok(updated)
    }

    /// Remove a zone and every alarm state keyed on it.
    pub fn delete_zone(&self, id: &str) -> Result<Zone> {
        let (removed, cleared) = self
            .ctx
            .remove_zone(id)
            .ok_or_else(|| invalid_zone(format!("zone '{id}' not found")))?;
        log::info!(
            "zone deleted: {} ({}), {} alarm state(s) cleared",
            removed.name,
            removed.id,
            cleared
        );
        self.persist();
        Ok(removed)
    }

    // -- alarm policy -----------------------------------------------------------

    pub fn alarm_config(&self) -> AlarmConfig {
        self.ctx.alarm_config()
    }

    /// Replace the alarm policy. Toggling `once_per_id` clears all alarm state.
    pub fn set_alarm_config(&self, config: AlarmConfig) -> Result<()> {
        config.validate()?;
        let once_per_id = config.once_per_id;
        let previous = self.ctx.replace_alarm_config(config);
        if previous.once_per_id != once_per_id {
            log::info!(
                "alarm policy changed to {}, alarm state cleared",
                if once_per_id { "once-per-id" } else { "debounce" }
            );
        }
        self.persist();
        Ok(())
    }

    // -- source and detector ----------------------------------------------------

    /// Point the ingestor at a new address. Returns false when unchanged.
    pub fn set_source_url(&self, url: &str) -> Result<bool> {
        let url = url.trim();
        if url.is_empty() {
            return Err(invalid_config("source url must not be empty"));
        }
        let changed = self.ctx.set_source_url(url);
        if changed {
            log::info!("source changed to {url}");
            self.persist();
        }
        Ok(changed)
    }

    /// Install a prebuilt detector and reload class names from it.
    ///
    /// Runtime only: the persisted detector settings are left alone. Use
    /// `set_detector` for a change that survives a restart.
    pub fn swap_detector(&self, detector: Box<dyn Detector>) -> Result<Option<String>> {
        let incoming = detector.name().to_string();
        let previous = self.ctx.detector.swap(detector)?;
        if let Some(names) = self.ctx.detector.class_names() {
            self.ctx.update_classes(|catalog| {
                catalog.replace_names(names);
                Ok(())
            })?;
        }
        log::info!(
            "detector swapped: {} -> {}",
            previous.as_deref().unwrap_or("none"),
            incoming
        );
        Ok(previous)
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        lock(&self.base).detector.clone()
    }

    /// Build, install and persist the detector described by `settings`.
    ///
    /// Nothing changes when building or warming up the new detector fails.
    pub fn set_detector(&self, settings: DetectorSettings) -> Result<Option<String>> {
        let detector = build_detector(&settings)?;
        let previous = self.swap_detector(detector)?;
        lock(&self.base).detector = settings;
        self.persist();
        Ok(previous)
    }

    /// Model files available in the configured models directory.
    pub fn models(&self) -> Result<Vec<ModelInfo>> {
        let settings = self.detector_settings();
        match &settings.models_dir {
            Some(dir) => list_models(dir, settings.model.as_deref()),
            None => Ok(Vec::new()),
        }
    }

    /// Switch to another model file in the models directory.
    pub fn set_model(&self, model: &str) -> Result<Option<String>> {
        let model = model.trim();
        validate_model_name(model)?;
        let mut settings = self.detector_settings();
        let Some(dir) = &settings.models_dir else {
            return Err(invalid_config("no models_dir configured"));
        };
        if !dir.join(model).is_file() {
            return Err(invalid_config(format!("model not found: {model}")));
        }
        let previous_model = settings.model.replace(model.to_string());
        self.set_detector(settings)?;
        log::info!(
            "model changed: {} -> {}",
            previous_model.as_deref().unwrap_or("none"),
            model
        );
        Ok(previous_model)
    }

    pub fn class_settings(&self) -> ClassSettings {
        ClassSettings::from_catalog(&self.ctx.classes())
    }

    /// Replace enabled classes, thresholds and custom names as a unit.
    pub fn set_class_settings(&self, settings: ClassSettings) -> Result<()> {
        self.ctx.update_classes(|catalog| {
            let names: Vec<String> = (0..catalog.len() as u32)
                .map(|id| catalog.name(id).unwrap_or_default().to_string())
                .collect();
            let mut fresh = crate::detect::ClassCatalog::new(names);
            settings.apply_to(&mut fresh)?;
            *catalog = fresh;
            Ok(())
        })?;
        self.persist();
        Ok(())
    }

    // -- display and health -------------------------------------------------------

    pub fn set_display(&self, display: DisplayConfig) -> Result<()> {
        display.validate()?;
        self.ctx.set_display(display);
        self.persist();
        Ok(())
    }

    pub fn set_health_settings(&self, settings: HealthSettings) -> Result<()> {
        settings.validate()?;
        self.ctx.set_health_settings(settings);
        self.persist();
        Ok(())
    }

    // -- recording --------------------------------------------------------------

    pub fn set_recording_settings(&self, settings: RecordingConfig) -> Result<()> {
        settings.validate()?;
        self.recorder.set_settings(settings);
        self.persist();
        Ok(())
    }

    pub fn start_recording(&self) -> Result<()> {
        self.recorder.start(&self.ctx.source_url())
    }

    pub fn stop_recording(&self) -> Result<StopOutcome> {
        self.recorder.stop()
    }

    pub fn recording_status(&self) -> RecordingStatus {
        self.recorder.status()
    }

    // -- status -----------------------------------------------------------------

    pub fn status(&self) -> SystemStatus {
        let zones = self.ctx.zones();
        let alarm = self.ctx.alarm_config();
        SystemStatus {
            source_url: self.ctx.source_url(),
            stream: self.ctx.stream_info(),
            fps: self.ctx.fps(),
            detector: self.ctx.detector.name(),
            zones_total: zones.len(),
            zones_active: zones.iter().filter(|z| z.is_active()).count(),
            alarm_states: self.ctx.with_alarms(|engine| engine.len()),
            once_per_id: alarm.once_per_id,
            debounce_secs: alarm.debounce.as_secs_f64(),
            recording: self.recorder.status(),
            camera: self.ctx.camera_health(),
        }
    }

    /// Resolved configuration as currently running.
    pub fn snapshot(&self) -> ZonewatchConfig {
        let mut config = lock(&self.base).clone();
        config.source_url = self.ctx.source_url();
        config.classes = ClassSettings::from_catalog(&self.ctx.classes());
        config.zones = self.ctx.zones();
        config.alarm = self.ctx.alarm_config();
        config.display = self.ctx.display();
        config.health = self.ctx.health_settings();
        config.recording = self.recorder.settings();
        config
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&self.snapshot()) {
            log::warn!("failed to persist configuration: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmKey, AlarmPolicy};
    use crate::broadcast::NullSink;
    use crate::context::Shutdown;
    use crate::detect::{DetectionScript, DetectorHandle, ScriptedDetector};
    use crate::error::PipelineError;
    use crate::store::JsonConfigStore;
    use std::time::{Duration, Instant};

    fn square(offset: f32) -> Vec<Point> {
        vec![
            Point::new(offset, 0.0),
            Point::new(offset + 10.0, 0.0),
            Point::new(offset + 10.0, 10.0),
            Point::new(offset, 10.0),
        ]
    }

    fn controller() -> Result<Controller> {
        let config = ZonewatchConfig::default();
        let ctx = PipelineContext::new(
            &config,
            DetectorHandle::empty(),
            Arc::new(NullSink),
            Arc::new(Shutdown::new()),
        )?;
        let recorder = Arc::new(RecordingSupervisor::new(config.recording.clone()));
        Ok(Controller::new(ctx, recorder, config))
    }

    fn code(err: &anyhow::Error) -> &'static str {
        err.downcast_ref::<PipelineError>()
            .map(PipelineError::code)
            .unwrap_or("OTHER")
    }

    #[test]
    fn add_generates_ids_and_rejects_bad_zones() -> Result<()> {
        let controller = controller()?;
        let zone = controller.add_zone(Zone {
            id: String::new(),
            ..Zone::new("Gate", square(0.0))
        })?;
        assert!(zone.id.starts_with("zone_"));

        let err = controller
            .add_zone(Zone::new("Tiny", square(0.0)[..2].to_vec()))
            .unwrap_err();
        assert_eq!(code(&err), "ZONE_VALIDATION");

        let duplicate = Zone {
            id: zone.id.clone(),
            ..Zone::new("Again", square(5.0))
        };
        assert!(controller.add_zone(duplicate).is_err());
        assert_eq!(controller.zones().len(), 1);
        Ok(())
    }

    #[test]
    fn update_keeps_zone_when_invalid() -> Result<()> {
        let controller = controller()?;
        let zone = controller.add_zone(Zone::new("Gate", square(0.0)))?;

        let renamed = controller.update_zone(
            &zone.id,
            ZoneUpdate {
                name: Some("Front Gate".to_string()),
                enabled: Some(false),
                ..ZoneUpdate::default()
            },
        )?;
        assert_eq!(renamed.name, "Front Gate");
        assert!(!renamed.enabled);

        let bad = controller.update_zone(
            &zone.id,
            ZoneUpdate {
                name: Some("   ".to_string()),
                ..ZoneUpdate::default()
            },
        );
        assert!(bad.is_err());
        assert_eq!(controller.zones()[0].name, "Front Gate");

        assert!(controller.update_zone("zone_missing", ZoneUpdate::default()).is_err());
        Ok(())
    }

    #[test]
    fn delete_clears_only_that_zones_alarms() -> Result<()> {
        let controller = controller()?;
        let a = controller.add_zone(Zone::new("A", square(0.0)))?;
        let b = controller.add_zone(Zone::new("B", square(20.0)))?;

        let policy = AlarmPolicy::Debounce(Duration::from_secs(5));
        let now = Instant::now();
        controller.context().with_alarms(|engine| {
            engine.evaluate(AlarmKey::object(1, 0, a.id.clone()), policy, now);
            engine.evaluate(AlarmKey::object(2, 0, a.id.clone()), policy, now);
            engine.evaluate(AlarmKey::object(1, 0, b.id.clone()), policy, now);
        });

        controller.delete_zone(&a.id)?;
        let ctx = controller.context();
        assert_eq!(ctx.with_alarms(|engine| engine.len()), 1);
        assert!(ctx
            .with_alarms(|engine| engine.state(&AlarmKey::object(1, 0, b.id.clone())))
            .is_some());
        assert_eq!(controller.zones().len(), 1);
        Ok(())
    }

    #[test]
    fn toggling_once_per_id_resets_alarm_state() -> Result<()> {
        let controller = controller()?;
        let policy = AlarmPolicy::Debounce(Duration::from_secs(5));
        controller.context().with_alarms(|engine| {
            engine.evaluate(AlarmKey::object(1, 0, "zone_a"), policy, Instant::now());
        });

        let mut config = controller.alarm_config();
        config.debounce = Duration::from_secs(9);
        controller.set_alarm_config(config.clone())?;
        assert_eq!(controller.context().with_alarms(|engine| engine.len()), 1);

        config.once_per_id = true;
        controller.set_alarm_config(config)?;
        assert!(controller.context().with_alarms(|engine| engine.is_empty()));
        Ok(())
    }

    #[test]
    fn class_settings_are_validated() -> Result<()> {
        let controller = controller()?;
        let mut settings = controller.class_settings();
        settings.enabled = vec![0, 2];
        settings.thresholds.insert(2, 0.6);
        controller.set_class_settings(settings)?;
        let classes = controller.context().classes();
        assert!(classes.is_enabled(2));
        assert_eq!(classes.threshold(2), 0.6);

        let mut bad = controller.class_settings();
        bad.enabled = vec![500];
        assert!(controller.set_class_settings(bad).is_err());
        assert!(controller.context().classes().is_enabled(2));
        Ok(())
    }

    #[test]
    fn swap_reloads_class_names() -> Result<()> {
        let controller = controller()?;
        let detector = ScriptedDetector::new(DetectionScript::new())
            .with_name("yard-model")
            .with_class_names(vec!["intruder".to_string(), "dog".to_string()]);
        let previous = controller.swap_detector(Box::new(detector))?;
        assert_eq!(previous, None);

        let status = controller.status();
        assert_eq!(status.detector.as_deref(), Some("yard-model"));
        assert_eq!(controller.context().classes().display_name(1), "dog");
        Ok(())
    }

    #[cfg(unix)]
    fn detector_helper(dir: &std::path::Path) -> Result<std::path::PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("detector.sh");
        // Refuses models named bad.onnx, otherwise answers every request.
        std::fs::write(
            &path,
            r#"#!/bin/sh
case "$1" in
  *bad.onnx) read line; echo '{"error":"corrupt model"}'; exit 0 ;;
esac
while read line; do echo '{"class_names":["person","vehicle"]}'; done
"#,
        )?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[cfg(unix)]
    fn process_settings(dir: &std::path::Path, model: &str) -> Result<DetectorSettings> {
        let models = dir.join("models");
        std::fs::create_dir_all(&models)?;
        Ok(DetectorSettings {
            backend: crate::config::DetectorBackendKind::Process,
            name: "yolo-large".to_string(),
            command: Some(detector_helper(dir)?),
            args: vec![crate::detect::MODEL_PLACEHOLDER.to_string()],
            timeout: Duration::from_secs(5),
            models_dir: Some(models),
            model: Some(model.to_string()),
        })
    }

    #[cfg(unix)]
    #[test]
    fn set_detector_persists_full_settings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = process_settings(dir.path(), "yolo-large.onnx")?;
        std::fs::write(dir.path().join("models/yolo-large.onnx"), b"weights")?;
        let store = Arc::new(JsonConfigStore::new(dir.path().join("zonewatch.json")));
        let controller = controller()?.with_store(store.clone());

        controller.set_detector(settings.clone())?;
        assert_eq!(controller.status().detector.as_deref(), Some("yolo-large"));
        assert_eq!(controller.context().classes().display_name(1), "vehicle");

        let reloaded = store.load()?;
        assert_eq!(reloaded.detector, settings);
        let rebuilt = build_detector(&reloaded.detector)?;
        assert_eq!(rebuilt.name(), "yolo-large");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failed_model_change_keeps_previous_model() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = process_settings(dir.path(), "good.onnx")?;
        std::fs::write(dir.path().join("models/good.onnx"), b"weights")?;
        std::fs::write(dir.path().join("models/bad.onnx"), b"weights")?;
        let store = Arc::new(JsonConfigStore::new(dir.path().join("zonewatch.json")));
        let controller = controller()?.with_store(store.clone());
        controller.set_detector(settings)?;

        assert!(controller.set_model("bad.onnx").is_err());
        assert_eq!(controller.detector_settings().model.as_deref(), Some("good.onnx"));
        assert_eq!(store.load()?.detector.model.as_deref(), Some("good.onnx"));
        assert_eq!(controller.status().detector.as_deref(), Some("yolo-large"));

        let missing = controller.set_model("absent.onnx").unwrap_err();
        assert_eq!(code(&missing), "CONFIG_VALIDATION");
        assert!(controller.set_model("../good.onnx").is_err());

        let models = controller.models()?;
        let current: Vec<_> = models.iter().filter(|m| m.current).map(|m| m.name.as_str()).collect();
        assert_eq!(models.len(), 2);
        assert_eq!(current, ["good.onnx"]);
        Ok(())
    }

    #[test]
    fn models_without_directory_are_empty() -> Result<()> {
        let controller = controller()?;
        assert!(controller.models()?.is_empty());
        assert!(controller.set_model("yolo.onnx").is_err());
        Ok(())
    }

    #[test]
    fn mutations_are_persisted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("zonewatch.json");
        let store = Arc::new(JsonConfigStore::new(&path));
        let controller = controller()?.with_store(store.clone());

        let zone = controller.add_zone(Zone::new("Porch", square(0.0)))?;
        controller.set_source_url("rtsp://10.0.0.5/live")?;

        let reloaded = store.load()?;
        assert_eq!(reloaded.source_url, "rtsp://10.0.0.5/live");
        assert_eq!(reloaded.zones.len(), 1);
        assert_eq!(reloaded.zones[0].id, zone.id);
        Ok(())
    }

    #[test]
    fn empty_source_is_rejected() -> Result<()> {
        let controller = controller()?;
        let err = controller.set_source_url("  ").unwrap_err();
        assert_eq!(code(&err), "CONFIG_VALIDATION");
        assert!(!controller.set_source_url(&controller.context().source_url())?);
        Ok(())
    }
}
