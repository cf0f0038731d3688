//! Fan-out of frames, alarms, and log lines to subscribers.
//!
//! Every emit is fire-and-forget: slow subscribers lose messages instead of
//! stalling the pipeline.

mod mqtt;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::zone::Zone;

pub use mqtt::{MqttSink, MqttSinkConfig};

/// Wall-clock format used in every payload.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_local_time(time: chrono::DateTime<chrono::Local>) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub fn now_string() -> String {
    format_local_time(chrono::Local::now())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Track id; `None` for untracked boxes.
    pub id: Option<u64>,
    pub class_id: u32,
    pub class_name: String,
    pub display_name: String,
    pub bbox: [f32; 4],
    pub center: [f32; 2],
    pub confidence: f32,
    pub in_zone: bool,
    pub zone_id: Option<String>,
}

/// One annotated frame with its structured detections.
#[derive(Clone, Debug, Serialize)]
pub struct FramePayload {
    pub seq: u64,
    pub timestamp: String,
    /// `data:image/jpeg;base64,...`
    pub frame: String,
    pub zones: Vec<Zone>,
    pub detections: Vec<DetectionRecord>,
    pub fps: f32,
    pub resolution: Resolution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    Intrusion,
    CameraOffline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmPhase {
    /// Emitted as soon as the alarm fires.
    Raised,
    /// Emitted after evidence capture finished, with whatever artifacts exist.
    Captured,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub kind: AlarmKind,
    pub phase: AlarmPhase,
    pub time: String,
    /// Alarm key in wire form (`<track>_<class>_<zone>` or a named key).
    pub key: String,
    pub message: String,
    pub track_id: Option<u64>,
    pub class_id: Option<u32>,
    pub object_name: Option<String>,
    pub zone_id: Option<String>,
    pub zone_name: Option<String>,
    pub position: Option<[f32; 2]>,
    pub snapshot: Option<String>,
    pub clip: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

pub trait BroadcastSink: Send + Sync {
    fn emit_frame(&self, payload: &Arc<FramePayload>);
    fn emit_alarm(&self, event: &AlarmEvent);
    fn emit_log(&self, entry: &LogEntry);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl BroadcastSink for NullSink {
    fn emit_frame(&self, _payload: &Arc<FramePayload>) {}
    fn emit_alarm(&self, _event: &AlarmEvent) {}
    fn emit_log(&self, _entry: &LogEntry) {}
}

#[derive(Clone, Debug)]
pub enum BroadcastMessage {
    Frame(Arc<FramePayload>),
    Alarm(AlarmEvent),
    Log(LogEntry),
}

/// In-process fan-out to bounded subscriber queues plus optional forward sinks.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<SyncSender<BroadcastMessage>>>,
    forwards: Vec<Arc<dyn BroadcastSink>>,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every message to `sink` as well.
    pub fn with_sink(mut self, sink: Arc<dyn BroadcastSink>) -> Self {
        self.forwards.push(sink);
        self
    }

    pub fn subscribe(&self, capacity: usize) -> Receiver<BroadcastMessage> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Messages dropped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn publish(&self, message: BroadcastMessage) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl BroadcastSink for Broadcaster {
    fn emit_frame(&self, payload: &Arc<FramePayload>) {
        self.publish(BroadcastMessage::Frame(payload.clone()));
        for sink in &self.forwards {
            sink.emit_frame(payload);
        }
    }

    fn emit_alarm(&self, event: &AlarmEvent) {
        self.publish(BroadcastMessage::Alarm(event.clone()));
        for sink in &self.forwards {
            sink.emit_alarm(event);
        }
    }

    fn emit_log(&self, entry: &LogEntry) {
        self.publish(BroadcastMessage::Log(entry.clone()));
        for sink in &self.forwards {
            sink.emit_log(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_entry(message: &str) -> LogEntry {
        LogEntry {
            timestamp: now_string(),
            level: "INFO".to_string(),
            target: "zonewatch".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn full_subscriber_drops_instead_of_blocking() {
        let broadcaster = Broadcaster::new();
        let rx = broadcaster.subscribe(1);
        broadcaster.emit_log(&log_entry("first"));
        broadcaster.emit_log(&log_entry("second"));

        assert_eq!(broadcaster.dropped(), 1);
        match rx.try_recv() {
            Ok(BroadcastMessage::Log(entry)) => assert_eq!(entry.message, "first"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let broadcaster = Broadcaster::new();
        let rx = broadcaster.subscribe(4);
        let _keep = broadcaster.subscribe(4);
        drop(rx);
        broadcaster.emit_log(&log_entry("x"));
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[test]
    fn forwards_reach_inner_sinks() {
        let inner = Arc::new(Broadcaster::new());
        let rx = inner.subscribe(4);
        let outer = Broadcaster::new().with_sink(inner.clone());
        outer.emit_log(&log_entry("forwarded"));
        assert!(matches!(rx.try_recv(), Ok(BroadcastMessage::Log(_))));
    }

    #[test]
    fn time_format_is_second_resolution() {
        let stamp = now_string();
        assert_eq!(stamp.len(), "2024-01-01 00:00:00".len());
    }
}
