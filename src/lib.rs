//! Zonewatch
//!
//! Zone intrusion analytics for a single live camera stream.
//!
//! # Architecture
//!
//! A fixed set of long-lived tasks share one `PipelineContext`:
//!
//! 1. **Ingestor**: keeps the source open and feeds a drop-oldest frame channel.
//! 2. **Detection worker**: runs the detector, tests zone membership, renders
//!    the overlay, and publishes one frame payload per cycle.
//! 3. **Camera health monitor**: probes reachability and raises an alarm on
//!    an online to offline transition.
//!
//! Alarms go through a debounced `AlarmEngine`; each fresh alarm spawns a
//! short-lived event capture (clip + snapshot). Continuous recording runs as
//! a supervised external process.
//!
//! # Module Structure
//!
//! - `frame`: frames and the bounded frame channel
//! - `ingest`: video sources and the reconnecting ingestor
//! - `detect`: detector trait, handle, class catalog
//! - `zone`, `alarm`: containment tests and alarm decisions
//! - `annotate`, `capture`, `recording`, `health`: pipeline side effects
//! - `config`, `store`, `control`: the configuration boundary

pub mod alarm;
pub mod annotate;
pub mod broadcast;
pub mod capture;
pub mod config;
pub mod context;
pub mod control;
pub mod detect;
pub mod error;
pub mod frame;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod process;
pub mod recording;
pub mod store;
pub mod worker;
pub mod zone;

pub use alarm::{AlarmEngine, AlarmKey, AlarmPolicy, AlarmState};
pub use broadcast::{
    AlarmEvent, AlarmKind, AlarmPhase, BroadcastSink, Broadcaster, FramePayload, LogEntry,
    MqttSink, MqttSinkConfig, NullSink,
};
pub use config::{AlarmConfig, ZonewatchConfig};
pub use context::{PipelineContext, Shutdown};
pub use control::{Controller, SystemStatus, ZoneUpdate};
pub use detect::{build_detector, Detector, DetectorHandle};
pub use error::PipelineError;
pub use frame::{Frame, FrameChannel};
pub use health::{CameraHealth, CameraHealthMonitor, CameraStatus};
pub use pipeline::{LaunchOptions, Pipeline};
pub use recording::{RecordingStatus, RecordingSupervisor};
pub use store::{ConfigStore, JsonConfigStore};
pub use zone::{DetectionMode, Point, Zone};
