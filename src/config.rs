use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::alarm::AlarmPolicy;
use crate::detect::ClassCatalog;
use crate::error::{invalid_config, invalid_zone};
use crate::zone::{generate_zone_id, DetectionMode, Zone};

const DEFAULT_SOURCE_URL: &str = "stub://front_camera";
const DEFAULT_DEBOUNCE_SECS: f64 = 5.0;
const DEFAULT_CLIP_SECS: u64 = 10;
const DEFAULT_CLIP_GRACE_SECS: u64 = 5;
const DEFAULT_MAX_CONCURRENT_CLIPS: usize = 4;
const DEFAULT_EVENT_PATH: &str = "events";
const DEFAULT_RECORDING_PATH: &str = "recordings";
const DEFAULT_SEGMENT_SECS: u64 = 300;
const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 10;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 2;
/// Probe port when neither the settings nor the source URL name one.
pub const DEFAULT_PROBE_PORT: u16 = 554;
const DEFAULT_DETECTOR_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MQTT_PREFIX: &str = "zonewatch";
const DEFAULT_MQTT_CLIENT_ID: &str = "zonewatchd";

const DEFAULT_FONT_SIZE: u32 = 16;
const DEFAULT_BOX_THICKNESS: u32 = 2;
const DEFAULT_ZONE_ALPHA: f32 = 0.3;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const GREEN: [u8; 3] = [0, 255, 0];
const BLACK: [u8; 3] = [0, 0, 0];
const YELLOW: [u8; 3] = [255, 255, 0];

// ----------------------------------------------------------------------------
// File layout. Every field is optional; `ZonewatchConfig::from_file` applies
// defaults. The same layout is written back by `ConfigStore`.
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize, Serialize)]
pub(crate) struct ZonewatchConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<SourceConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alarm: Option<AlarmConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    display: Option<DisplayConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    classes: Option<ClassesConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recording: Option<RecordingConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<HealthConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detector: Option<DetectorConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mqtt: Option<MqttConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    zones: Option<Vec<Zone>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct SourceConfigFile {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct AlarmConfigFile {
    debounce_secs: Option<f64>,
    detection_mode: Option<String>,
    once_per_id: Option<bool>,
    event_capture: Option<EventCaptureConfigFile>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct EventCaptureConfigFile {
    snapshot_enabled: Option<bool>,
    clip_enabled: Option<bool>,
    clip_duration_secs: Option<u64>,
    grace_secs: Option<u64>,
    save_path: Option<PathBuf>,
    ffmpeg_bin: Option<PathBuf>,
    max_concurrent_clips: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DisplayConfigFile {
    font_size: Option<u32>,
    box_color: Option<[u8; 3]>,
    box_thickness: Option<u32>,
    text_color: Option<[u8; 3]>,
    zone_fill_color: Option<[u8; 3]>,
    zone_border_color: Option<[u8; 3]>,
    zone_fill_alpha: Option<f32>,
    use_display_names: Option<bool>,
    font_path: Option<PathBuf>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ClassesConfigFile {
    enabled: Option<Vec<u32>>,
    /// Keyed by class id as a string (TOML keys are strings).
    thresholds: Option<BTreeMap<String, f32>>,
    custom_names: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RecordingConfigFile {
    save_path: Option<PathBuf>,
    segment_secs: Option<u64>,
    ffmpeg_bin: Option<PathBuf>,
    auto_start: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct HealthConfigFile {
    camera_ip: Option<String>,
    interval_secs: Option<u64>,
    probe: Option<String>,
    port: Option<u16>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DetectorConfigFile {
    backend: Option<String>,
    name: Option<String>,
    command: Option<PathBuf>,
    args: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    models_dir: Option<PathBuf>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct MqttConfigFile {
    broker: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
}

// ----------------------------------------------------------------------------
// Resolved settings
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct ZonewatchConfig {
    pub source_url: String,
    pub alarm: AlarmConfig,
    pub display: DisplayConfig,
    pub classes: ClassSettings,
    pub recording: RecordingConfig,
    pub health: HealthSettings,
    pub detector: DetectorSettings,
    pub mqtt: Option<MqttSettings>,
    pub zones: Vec<Zone>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AlarmConfig {
    pub debounce: Duration,
    pub detection_mode: DetectionMode,
    pub once_per_id: bool,
    pub capture: EventCaptureSettings,
}

impl AlarmConfig {
    pub fn policy(&self) -> AlarmPolicy {
        if self.once_per_id {
            AlarmPolicy::OncePerId
        } else {
            AlarmPolicy::Debounce(self.debounce)
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.capture.validate()
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs_f64(DEFAULT_DEBOUNCE_SECS),
            detection_mode: DetectionMode::Center,
            once_per_id: false,
            capture: EventCaptureSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventCaptureSettings {
    pub snapshot_enabled: bool,
    pub clip_enabled: bool,
    pub clip_duration: Duration,
    /// Extra wall-clock allowance on top of `clip_duration` before the
    /// capture process is killed.
    pub grace: Duration,
    pub save_path: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub max_concurrent_clips: usize,
}

impl EventCaptureSettings {
    pub fn validate(&self) -> Result<()> {
        if self.clip_duration.is_zero() {
            return Err(invalid_config("event clip duration must be greater than zero"));
        }
        if self.max_concurrent_clips == 0 {
            return Err(invalid_config("max_concurrent_clips must be at least 1"));
        }
        Ok(())
    }
}

impl Default for EventCaptureSettings {
    fn default() -> Self {
        Self {
            snapshot_enabled: true,
            clip_enabled: true,
            clip_duration: Duration::from_secs(DEFAULT_CLIP_SECS),
            grace: Duration::from_secs(DEFAULT_CLIP_GRACE_SECS),
            save_path: PathBuf::from(DEFAULT_EVENT_PATH),
            ffmpeg_bin: PathBuf::from(DEFAULT_FFMPEG_BIN),
            max_concurrent_clips: DEFAULT_MAX_CONCURRENT_CLIPS,
        }
    }
}

/// Overlay rendering settings. Colors are RGB.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayConfig {
    pub font_size: u32,
    pub box_color: [u8; 3],
    pub box_thickness: u32,
    pub text_color: [u8; 3],
    pub zone_fill_color: [u8; 3],
    pub zone_border_color: [u8; 3],
    pub zone_fill_alpha: f32,
    pub use_display_names: bool,
    pub font_path: Option<PathBuf>,
    pub jpeg_quality: u8,
}

impl DisplayConfig {
    pub fn validate(&self) -> Result<()> {
        if !(8..=72).contains(&self.font_size) {
            return Err(invalid_config(format!(
                "font_size must be between 8 and 72, got {}",
                self.font_size
            )));
        }
        if !(1..=10).contains(&self.box_thickness) {
            return Err(invalid_config(format!(
                "box_thickness must be between 1 and 10, got {}",
                self.box_thickness
            )));
        }
        if !(0.0..=1.0).contains(&self.zone_fill_alpha) {
            return Err(invalid_config(format!(
                "zone_fill_alpha must be between 0 and 1, got {}",
                self.zone_fill_alpha
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(invalid_config(format!(
                "jpeg_quality must be between 1 and 100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            font_size: DEFAULT_FONT_SIZE,
            box_color: GREEN,
            box_thickness: DEFAULT_BOX_THICKNESS,
            text_color: BLACK,
            zone_fill_color: YELLOW,
            zone_border_color: YELLOW,
            zone_fill_alpha: DEFAULT_ZONE_ALPHA,
            use_display_names: false,
            font_path: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassSettings {
    pub enabled: Vec<u32>,
    pub thresholds: BTreeMap<u32, f32>,
    pub custom_names: BTreeMap<u32, String>,
}

impl Default for ClassSettings {
    fn default() -> Self {
        Self {
            enabled: vec![crate::detect::DEFAULT_ENABLED_CLASS],
            thresholds: BTreeMap::new(),
            custom_names: BTreeMap::new(),
        }
    }
}

impl ClassSettings {
    /// Apply onto a catalog, validating every class id against it.
    pub fn apply_to(&self, catalog: &mut ClassCatalog) -> Result<()> {
        catalog.set_enabled(self.enabled.iter().copied())?;
        for (class_id, threshold) in &self.thresholds {
            catalog.set_threshold(*class_id, *threshold)?;
        }
        for (class_id, name) in &self.custom_names {
            catalog.set_custom_name(*class_id, name)?;
        }
        Ok(())
    }

    pub fn from_catalog(catalog: &ClassCatalog) -> Self {
        Self {
            enabled: catalog.enabled().collect(),
            thresholds: catalog.thresholds().clone(),
            custom_names: catalog.custom_names().clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordingConfig {
    pub save_path: PathBuf,
    pub segment: Duration,
    pub ffmpeg_bin: PathBuf,
    pub auto_start: bool,
}

impl RecordingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.segment.is_zero() {
            return Err(invalid_config("recording segment duration must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            save_path: PathBuf::from(DEFAULT_RECORDING_PATH),
            segment: Duration::from_secs(DEFAULT_SEGMENT_SECS),
            ffmpeg_bin: PathBuf::from(DEFAULT_FFMPEG_BIN),
            auto_start: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProbeKind {
    /// TCP connect to the stream port.
    #[default]
    Tcp,
    /// One ICMP echo through the system `ping`.
    Ping,
}

impl ProbeKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "ping" => Ok(Self::Ping),
            other => Err(invalid_config(format!(
                "health probe must be 'tcp' or 'ping', got '{other}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ping => "ping",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthSettings {
    /// Explicit camera address; derived from the source URL when unset.
    pub camera_ip: Option<String>,
    pub interval: Duration,
    pub probe: ProbeKind,
    /// TCP probe port; taken from the source URL when unset.
    pub port: Option<u16>,
    pub timeout: Duration,
}

impl HealthSettings {
    pub fn validate(&self) -> Result<()> {
        if self.interval < Duration::from_secs(1) {
            return Err(invalid_config("health check interval must be at least 1 second"));
        }
        if self.timeout.is_zero() {
            return Err(invalid_config("health probe timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            camera_ip: None,
            interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            probe: ProbeKind::Tcp,
            port: None,
            timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetectorBackendKind {
    Stub,
    Process,
}

/// Model file extensions listed from `models_dir`.
pub const MODEL_EXTENSIONS: [&str; 3] = ["engine", "pt", "onnx"];

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
    pub backend: DetectorBackendKind,
    pub name: String,
    pub command: Option<PathBuf>,
    /// Helper arguments. `{model}` is replaced by the selected model's path.
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Directory holding selectable model files.
    pub models_dir: Option<PathBuf>,
    /// Selected model, a file name inside `models_dir`.
    pub model: Option<String>,
}

impl DetectorSettings {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid_config("detector name must not be empty"));
        }
        if self.backend == DetectorBackendKind::Process && self.command.is_none() {
            return Err(invalid_config("detector backend 'process' requires a command"));
        }
        if self.timeout.is_zero() {
            return Err(invalid_config("detector timeout must be greater than zero"));
        }
        if let Some(model) = &self.model {
            if self.models_dir.is_none() {
                return Err(invalid_config("detector model requires models_dir"));
            }
            validate_model_name(model)?;
        }
        Ok(())
    }

    /// Full path of the selected model.
    pub fn model_path(&self) -> Option<PathBuf> {
        match (&self.models_dir, &self.model) {
            (Some(dir), Some(model)) => Some(dir.join(model)),
            _ => None,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DetectorBackendKind::Stub,
            name: "stub".to_string(),
            command: None,
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_DETECTOR_TIMEOUT_SECS),
            models_dir: None,
            model: None,
        }
    }
}

/// A model name is a bare file name with a known extension.
pub fn validate_model_name(model: &str) -> Result<()> {
    let path = Path::new(model);
    let bare = path.file_name().is_some_and(|name| name == path.as_os_str());
    if !bare || model.starts_with('.') {
        return Err(invalid_config(format!("invalid model name '{model}'")));
    }
    let known = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MODEL_EXTENSIONS.contains(&ext));
    if !known {
        return Err(invalid_config(format!(
            "model '{model}' must end in one of .{}",
            MODEL_EXTENSIONS.join(", .")
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub struct MqttSettings {
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
}

impl ZonewatchConfig {
    /// Load from `ZONEWATCH_CONFIG` (when set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ZONEWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit path (or defaults), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub(crate) fn from_file(file: ZonewatchConfigFile) -> Result<Self> {
        let source_url = file
            .source
            .and_then(|source| source.url)
            .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());

        let alarm_file = file.alarm.unwrap_or_default();
        let capture_file = alarm_file.event_capture.unwrap_or_default();
        let capture_defaults = EventCaptureSettings::default();
        let debounce_secs = alarm_file.debounce_secs.unwrap_or(DEFAULT_DEBOUNCE_SECS);
        let alarm = AlarmConfig {
            debounce: duration_from_secs_f64("alarm.debounce_secs", debounce_secs)?,
            detection_mode: match alarm_file.detection_mode.as_deref() {
                Some(mode) => DetectionMode::parse(mode)?,
                None => DetectionMode::Center,
            },
            once_per_id: alarm_file.once_per_id.unwrap_or(false),
            capture: EventCaptureSettings {
                snapshot_enabled: capture_file
                    .snapshot_enabled
                    .unwrap_or(capture_defaults.snapshot_enabled),
                clip_enabled: capture_file
                    .clip_enabled
                    .unwrap_or(capture_defaults.clip_enabled),
                clip_duration: capture_file
                    .clip_duration_secs
                    .map(Duration::from_secs)
                    .unwrap_or(capture_defaults.clip_duration),
                grace: capture_file
                    .grace_secs
                    .map(Duration::from_secs)
                    .unwrap_or(capture_defaults.grace),
                save_path: capture_file.save_path.unwrap_or(capture_defaults.save_path),
                ffmpeg_bin: capture_file.ffmpeg_bin.unwrap_or(capture_defaults.ffmpeg_bin),
                max_concurrent_clips: capture_file
                    .max_concurrent_clips
                    .unwrap_or(capture_defaults.max_concurrent_clips),
            },
        };

        let display_file = file.display.unwrap_or_default();
        let display_defaults = DisplayConfig::default();
        let display = DisplayConfig {
            font_size: display_file.font_size.unwrap_or(display_defaults.font_size),
            box_color: display_file.box_color.unwrap_or(display_defaults.box_color),
            box_thickness: display_file
                .box_thickness
                .unwrap_or(display_defaults.box_thickness),
            text_color: display_file.text_color.unwrap_or(display_defaults.text_color),
            zone_fill_color: display_file
                .zone_fill_color
                .unwrap_or(display_defaults.zone_fill_color),
            zone_border_color: display_file
                .zone_border_color
                .unwrap_or(display_defaults.zone_border_color),
            zone_fill_alpha: display_file
                .zone_fill_alpha
                .unwrap_or(display_defaults.zone_fill_alpha),
            use_display_names: display_file
                .use_display_names
                .unwrap_or(display_defaults.use_display_names),
            font_path: display_file.font_path,
            jpeg_quality: display_file
                .jpeg_quality
                .unwrap_or(display_defaults.jpeg_quality),
        };

        let classes_file = file.classes.unwrap_or_default();
        let classes = ClassSettings {
            enabled: classes_file
                .enabled
                .unwrap_or_else(|| ClassSettings::default().enabled),
            thresholds: parse_class_keys(classes_file.thresholds.unwrap_or_default())?,
            custom_names: parse_class_keys(classes_file.custom_names.unwrap_or_default())?,
        };

        let recording_file = file.recording.unwrap_or_default();
        let recording_defaults = RecordingConfig::default();
        let recording = RecordingConfig {
            save_path: recording_file
                .save_path
                .unwrap_or(recording_defaults.save_path),
            segment: recording_file
                .segment_secs
                .map(Duration::from_secs)
                .unwrap_or(recording_defaults.segment),
            ffmpeg_bin: recording_file
                .ffmpeg_bin
                .unwrap_or(recording_defaults.ffmpeg_bin),
            auto_start: recording_file.auto_start.unwrap_or(false),
        };

        let health_file = file.health.unwrap_or_default();
        let health_defaults = HealthSettings::default();
        let health = HealthSettings {
            camera_ip: health_file.camera_ip.filter(|ip| !ip.trim().is_empty()),
            interval: health_file
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or(health_defaults.interval),
            probe: match health_file.probe.as_deref() {
                Some(probe) => ProbeKind::parse(probe)?,
                None => health_defaults.probe,
            },
            port: health_file.port.or(health_defaults.port),
            timeout: health_file
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(health_defaults.timeout),
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector_defaults = DetectorSettings::default();
        let backend = match detector_file.backend.as_deref().map(str::trim) {
            None | Some("stub") => DetectorBackendKind::Stub,
            Some("process") => DetectorBackendKind::Process,
            Some(other) => {
                return Err(invalid_config(format!(
                    "detector backend must be 'stub' or 'process', got '{other}'"
                )))
            }
        };
        let detector = DetectorSettings {
            name: detector_file.name.unwrap_or_else(|| match backend {
                DetectorBackendKind::Stub => "stub".to_string(),
                DetectorBackendKind::Process => "process".to_string(),
            }),
            backend,
            command: detector_file.command,
            args: detector_file.args.unwrap_or_default(),
            timeout: detector_file
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(detector_defaults.timeout),
            models_dir: detector_file.models_dir,
            model: detector_file.model.filter(|model| !model.trim().is_empty()),
        };

        let mqtt = file
            .mqtt
            .and_then(|mqtt| {
                let broker = mqtt.broker?;
                Some(MqttSettings {
                    broker,
                    topic_prefix: mqtt
                        .topic_prefix
                        .unwrap_or_else(|| DEFAULT_MQTT_PREFIX.to_string()),
                    client_id: mqtt
                        .client_id
                        .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                })
            });

        Ok(Self {
            source_url,
            alarm,
            display,
            classes,
            recording,
            health,
            detector,
            mqtt,
            zones: file.zones.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("ZONEWATCH_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source_url = url;
            }
        }
        if let Ok(ip) = std::env::var("ZONEWATCH_CAMERA_IP") {
            if !ip.trim().is_empty() {
                self.health.camera_ip = Some(ip.trim().to_string());
            }
        }
        if let Ok(debounce) = std::env::var("ZONEWATCH_DEBOUNCE_SECS") {
            let seconds: f64 = debounce.trim().parse().map_err(|_| {
                anyhow!("ZONEWATCH_DEBOUNCE_SECS must be a number of seconds")
            })?;
            self.alarm.debounce = duration_from_secs_f64("ZONEWATCH_DEBOUNCE_SECS", seconds)?;
        }
        if let Ok(path) = std::env::var("ZONEWATCH_RECORDING_PATH") {
            if !path.trim().is_empty() {
                self.recording.save_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("ZONEWATCH_EVENT_PATH") {
            if !path.trim().is_empty() {
                self.alarm.capture.save_path = PathBuf::from(path);
            }
        }
        if let Ok(broker) = std::env::var("ZONEWATCH_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                let mqtt = self.mqtt.get_or_insert_with(|| MqttSettings {
                    broker: String::new(),
                    topic_prefix: DEFAULT_MQTT_PREFIX.to_string(),
                    client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                });
                mqtt.broker = broker;
            }
        }
        Ok(())
    }

    pub(crate) fn validate(&mut self) -> Result<()> {
        if self.source_url.trim().is_empty() {
            return Err(invalid_config("source url must not be empty"));
        }
        self.alarm.validate()?;
        self.display.validate()?;
        self.recording.validate()?;
        self.health.validate()?;

        let mut catalog = ClassCatalog::coco();
        self.classes.apply_to(&mut catalog)?;

        self.detector.validate()?;

        let mut seen = HashSet::new();
        for zone in &mut self.zones {
            if zone.id.trim().is_empty() {
                zone.id = generate_zone_id();
            }
            zone.validate()?;
            if !seen.insert(zone.id.clone()) {
                return Err(invalid_zone(format!("duplicate zone id '{}'", zone.id)));
            }
        }
        Ok(())
    }

    pub(crate) fn to_file(&self) -> ZonewatchConfigFile {
        let capture = &self.alarm.capture;
        ZonewatchConfigFile {
            source: Some(SourceConfigFile {
                url: Some(self.source_url.clone()),
            }),
            alarm: Some(AlarmConfigFile {
                debounce_secs: Some(self.alarm.debounce.as_secs_f64()),
                detection_mode: Some(self.alarm.detection_mode.as_str().to_string()),
                once_per_id: Some(self.alarm.once_per_id),
                event_capture: Some(EventCaptureConfigFile {
                    snapshot_enabled: Some(capture.snapshot_enabled),
                    clip_enabled: Some(capture.clip_enabled),
                    clip_duration_secs: Some(capture.clip_duration.as_secs()),
                    grace_secs: Some(capture.grace.as_secs()),
                    save_path: Some(capture.save_path.clone()),
                    ffmpeg_bin: Some(capture.ffmpeg_bin.clone()),
                    max_concurrent_clips: Some(capture.max_concurrent_clips),
                }),
            }),
            display: Some(DisplayConfigFile {
                font_size: Some(self.display.font_size),
                box_color: Some(self.display.box_color),
                box_thickness: Some(self.display.box_thickness),
                text_color: Some(self.display.text_color),
                zone_fill_color: Some(self.display.zone_fill_color),
                zone_border_color: Some(self.display.zone_border_color),
                zone_fill_alpha: Some(self.display.zone_fill_alpha),
                use_display_names: Some(self.display.use_display_names),
                font_path: self.display.font_path.clone(),
                jpeg_quality: Some(self.display.jpeg_quality),
            }),
            classes: Some(ClassesConfigFile {
                enabled: Some(self.classes.enabled.clone()),
                thresholds: Some(
                    self.classes
                        .thresholds
                        .iter()
                        .map(|(id, t)| (id.to_string(), *t))
                        .collect(),
                ),
                custom_names: Some(
                    self.classes
                        .custom_names
                        .iter()
                        .map(|(id, name)| (id.to_string(), name.clone()))
                        .collect(),
                ),
            }),
            recording: Some(RecordingConfigFile {
                save_path: Some(self.recording.save_path.clone()),
                segment_secs: Some(self.recording.segment.as_secs()),
                ffmpeg_bin: Some(self.recording.ffmpeg_bin.clone()),
                auto_start: Some(self.recording.auto_start),
            }),
            health: Some(HealthConfigFile {
                camera_ip: self.health.camera_ip.clone(),
                interval_secs: Some(self.health.interval.as_secs()),
                probe: Some(self.health.probe.as_str().to_string()),
                port: self.health.port,
                timeout_secs: Some(self.health.timeout.as_secs()),
            }),
            detector: Some(DetectorConfigFile {
                backend: Some(
                    match self.detector.backend {
                        DetectorBackendKind::Stub => "stub",
                        DetectorBackendKind::Process => "process",
                    }
                    .to_string(),
                ),
                name: Some(self.detector.name.clone()),
                command: self.detector.command.clone(),
                args: Some(self.detector.args.clone()),
                timeout_secs: Some(self.detector.timeout.as_secs()),
                models_dir: self.detector.models_dir.clone(),
                model: self.detector.model.clone(),
            }),
            mqtt: self.mqtt.as_ref().map(|mqtt| MqttConfigFile {
                broker: Some(mqtt.broker.clone()),
                topic_prefix: Some(mqtt.topic_prefix.clone()),
                client_id: Some(mqtt.client_id.clone()),
            }),
            zones: Some(self.zones.clone()),
        }
    }
}

impl Default for ZonewatchConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            alarm: AlarmConfig::default(),
            display: DisplayConfig::default(),
            classes: ClassSettings::default(),
            recording: RecordingConfig::default(),
            health: HealthSettings::default(),
            detector: DetectorSettings::default(),
            mqtt: None,
            zones: Vec::new(),
        }
    }
}

pub(crate) fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

pub(crate) fn read_config_file(path: &Path) -> Result<ZonewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    parse_config_str(path, &raw)
}

pub(crate) fn parse_config_str(path: &Path, raw: &str) -> Result<ZonewatchConfigFile> {
    let cfg = if is_toml(path) {
        toml::from_str(raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn duration_from_secs_f64(field: &str, seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(invalid_config(format!(
            "{field} must be a non-negative number of seconds, got {seconds}"
        )));
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn parse_class_keys<V>(raw: BTreeMap<String, V>) -> Result<BTreeMap<u32, V>> {
    raw.into_iter()
        .map(|(key, value)| {
            let id = key
                .trim()
                .parse::<u32>()
                .map_err(|_| invalid_config(format!("class key '{key}' is not a class id")))?;
            Ok((id, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_json(raw: &str) -> Result<ZonewatchConfig> {
        let file = parse_config_str(Path::new("config.json"), raw)?;
        let mut cfg = ZonewatchConfig::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn empty_file_yields_documented_defaults() -> Result<()> {
        let cfg = parse_json("{}")?;
        assert_eq!(cfg.alarm.debounce, Duration::from_secs(5));
        assert_eq!(cfg.alarm.detection_mode, DetectionMode::Center);
        assert!(!cfg.alarm.once_per_id);
        assert_eq!(cfg.alarm.capture.clip_duration, Duration::from_secs(10));
        assert_eq!(cfg.recording.segment, Duration::from_secs(300));
        assert_eq!(cfg.health.interval, Duration::from_secs(10));
        assert_eq!(cfg.classes.enabled, vec![0]);
        assert_eq!(cfg.display.jpeg_quality, 85);
        assert!(cfg.mqtt.is_none());
        Ok(())
    }

    #[test]
    fn policy_follows_once_per_id() {
        let mut alarm = AlarmConfig::default();
        assert_eq!(alarm.policy(), AlarmPolicy::Debounce(Duration::from_secs(5)));
        alarm.once_per_id = true;
        assert_eq!(alarm.policy(), AlarmPolicy::OncePerId);
    }

    #[test]
    fn rejects_negative_debounce() {
        let err = parse_json(r#"{"alarm": {"debounce_secs": -1}}"#).unwrap_err();
        let typed = err.downcast_ref::<crate::PipelineError>().unwrap();
        assert_eq!(typed.code(), "CONFIG_VALIDATION");
    }

    #[test]
    fn rejects_bad_display_and_health_values() {
        assert!(parse_json(r#"{"display": {"font_size": 4}}"#).is_err());
        assert!(parse_json(r#"{"display": {"zone_fill_alpha": 1.5}}"#).is_err());
        assert!(parse_json(r#"{"health": {"interval_secs": 0}}"#).is_err());
        assert!(parse_json(r#"{"alarm": {"detection_mode": "overlap"}}"#).is_err());
    }

    #[test]
    fn zones_get_ids_and_are_validated() -> Result<()> {
        let cfg = parse_json(
            r#"{"zones": [{"name": "gate", "points": [[0,0],[10,0],[10,10]]}]}"#,
        )?;
        assert!(cfg.zones[0].id.starts_with("zone_"));
        assert!(cfg.zones[0].enabled);

        let err = parse_json(r#"{"zones": [{"name": "bad", "points": [[0,0],[1,1]]}]}"#)
            .unwrap_err();
        let typed = err.downcast_ref::<crate::PipelineError>().unwrap();
        assert_eq!(typed.code(), "ZONE_VALIDATION");
        Ok(())
    }

    #[test]
    fn class_keys_parse_from_strings() -> Result<()> {
        let cfg = parse_json(
            r#"{"classes": {"enabled": [0, 2], "thresholds": {"2": 0.5}, "custom_names": {"0": "visitor"}}}"#,
        )?;
        assert_eq!(cfg.classes.thresholds.get(&2), Some(&0.5));
        assert_eq!(cfg.classes.custom_names.get(&0).map(String::as_str), Some("visitor"));
        assert!(parse_json(r#"{"classes": {"enabled": [99]}}"#).is_err());
        Ok(())
    }

    #[test]
    fn toml_layout_parses() -> Result<()> {
        let raw = r#"
[source]
url = "rtsp://10.0.0.8:554/stream1"

[alarm]
debounce_secs = 2.5
detection_mode = "edge"

[health]
probe = "ping"
"#;
        let file = parse_config_str(Path::new("zonewatch.toml"), raw)?;
        let cfg = ZonewatchConfig::from_file(file)?;
        assert_eq!(cfg.source_url, "rtsp://10.0.0.8:554/stream1");
        assert_eq!(cfg.alarm.debounce, Duration::from_millis(2500));
        assert_eq!(cfg.alarm.detection_mode, DetectionMode::Edge);
        assert_eq!(cfg.health.probe, ProbeKind::Ping);
        Ok(())
    }

    #[test]
    fn written_layout_reloads_identically() -> Result<()> {
        let mut cfg = parse_json(
            r#"{"alarm": {"once_per_id": true}, "zones": [{"name": "yard", "points": [[0,0],[5,0],[5,5]]}]}"#,
        )?;
        cfg.display.box_color = [1, 2, 3];
        let raw = serde_json::to_string(&cfg.to_file())?;
        let reloaded = parse_json(&raw)?;
        assert_eq!(reloaded.alarm, cfg.alarm);
        assert_eq!(reloaded.display, cfg.display);
        assert_eq!(reloaded.zones, cfg.zones);
        Ok(())
    }
}
