use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};
use serde::Serialize;

use super::{AlarmEvent, BroadcastSink, DetectionRecord, FramePayload, LogEntry, Resolution};

#[derive(Clone, Debug)]
pub struct MqttSinkConfig {
    /// `host:port`, optionally prefixed with `mqtt://` or `tcp://`.
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
}

/// Frame payload without the JPEG, published to `<prefix>/detections`.
#[derive(Serialize)]
struct DetectionsMessage<'a> {
    seq: u64,
    timestamp: &'a str,
    fps: f32,
    resolution: Resolution,
    detections: &'a [DetectionRecord],
}

/// Publishes alarms, logs, and detection lists to an MQTT v5 broker.
///
/// Publishing uses `try_publish`, so a stalled broker drops messages rather
/// than blocking the caller.
pub struct MqttSink {
    client: Client,
    prefix: String,
    stop: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSink {
    pub fn connect(config: &MqttSinkConfig) -> Result<Self> {
        let (host, port) = split_broker(&config.broker)?;
        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);

        let (client, connection) = Client::new(options, 64);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection_loop(connection, stop.clone())?;
        log::info!(
            "mqtt sink publishing to {} under '{}'",
            config.broker,
            config.topic_prefix
        );
        Ok(Self {
            client,
            prefix: config.topic_prefix.trim_end_matches('/').to_string(),
            stop,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn disconnect(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect() {
            log::debug!("mqtt disconnect: {e}");
        }
        let handle = self
            .connection_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn publish_json<T: Serialize>(&self, suffix: &str, value: &T) {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("mqtt payload encode failed: {e}");
                return;
            }
        };
        let topic = format!("{}/{}", self.prefix, suffix);
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
        {
            log::debug!("mqtt publish dropped: {e}");
        }
    }
}

impl BroadcastSink for MqttSink {
    fn emit_frame(&self, payload: &Arc<FramePayload>) {
        let message = DetectionsMessage {
            seq: payload.seq,
            timestamp: &payload.timestamp,
            fps: payload.fps,
            resolution: payload.resolution,
            detections: &payload.detections,
        };
        self.publish_json("detections", &message);
    }

    fn emit_alarm(&self, event: &AlarmEvent) {
        self.publish_json("alarm", event);
    }

    fn emit_log(&self, entry: &LogEntry) {
        self.publish_json("log", entry);
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn spawn_connection_loop(mut connection: Connection, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            for event in connection.iter() {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log::debug!("mqtt connection error: {e}");
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        })
        .context("spawn mqtt connection thread")
}

fn split_broker(broker: &str) -> Result<(String, u16)> {
    let mut remainder = broker.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", broker))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", broker));
    }
    Ok((host.to_string(), port))
}
