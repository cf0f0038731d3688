//! Camera reachability monitoring.
//!
//! The monitor reads its settings and the source address under short locks,
//! runs the network probe with no lock held, then records the result. Only an
//! online to offline transition raises an alarm.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use url::{Host, Url};

use crate::alarm::{AlarmKey, AlarmPolicy};
use crate::broadcast::{now_string, AlarmEvent, AlarmKind, AlarmPhase};
use crate::config::{AlarmConfig, HealthSettings, ProbeKind, DEFAULT_PROBE_PORT};
use crate::context::PipelineContext;
use crate::process::{CommandSpec, ProcessHandle};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraHealth {
    pub ip: Option<String>,
    pub status: CameraStatus,
    pub last_status: CameraStatus,
    pub last_checked: Option<String>,
    pub interval_secs: f64,
}

impl CameraHealth {
    pub fn new(interval: Duration) -> Self {
        Self {
            ip: None,
            status: CameraStatus::Unknown,
            last_status: CameraStatus::Unknown,
            last_checked: None,
            interval_secs: interval.as_secs_f64(),
        }
    }
}

/// Reachability check for one address.
pub trait Probe: Send {
    fn probe(&self, ip: &str, port: u16, timeout: Duration) -> bool;
}

/// TCP connect to the camera's stream port.
#[derive(Debug, Default)]
pub struct TcpProbe;

impl Probe for TcpProbe {
    fn probe(&self, ip: &str, port: u16, timeout: Duration) -> bool {
        let addrs = match (ip, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::debug!("resolve {ip}: {e}");
                return false;
            }
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
    }
}

/// One ICMP echo through the system `ping`.
#[derive(Debug, Default)]
pub struct PingProbe;

impl Probe for PingProbe {
    fn probe(&self, ip: &str, _port: u16, timeout: Duration) -> bool {
        let wait_secs = timeout.as_secs().max(1);
        let spec = CommandSpec::new("ping", "ping")
            .args(["-c", "1", "-W"])
            .arg(wait_secs.to_string())
            .arg(ip);
        match ProcessHandle::run_to_completion(&spec, timeout + Duration::from_secs(1)) {
            Ok(status) => status.success(),
            Err(e) => {
                log::debug!("ping {ip}: {e:#}");
                false
            }
        }
    }
}

fn probe_for(kind: ProbeKind) -> Box<dyn Probe> {
    match kind {
        ProbeKind::Tcp => Box::new(TcpProbe),
        ProbeKind::Ping => Box::new(PingProbe),
    }
}

/// Explicit camera address, else the host of the source URL.
pub fn resolve_ip(settings: &HealthSettings, source_url: &str) -> Option<String> {
    if let Some(ip) = settings.camera_ip.as_deref().map(str::trim) {
        if !ip.is_empty() {
            return Some(ip.to_string());
        }
    }
    let url = Url::parse(source_url).ok()?;
    if url.scheme() == "stub" {
        return None;
    }
    match url.host()? {
        Host::Domain(domain) if !domain.is_empty() => Some(domain.to_string()),
        Host::Domain(_) => None,
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
    }
}

/// Configured probe port, else the source URL's port (or its scheme's
/// default), else `DEFAULT_PROBE_PORT`.
pub fn resolve_port(settings: &HealthSettings, source_url: &str) -> u16 {
    settings
        .port
        .or_else(|| Url::parse(source_url).ok()?.port_or_known_default())
        .unwrap_or(DEFAULT_PROBE_PORT)
}

pub struct CameraHealthMonitor {
    ctx: Arc<PipelineContext>,
    probe: Option<Box<dyn Probe>>,
}

impl CameraHealthMonitor {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx, probe: None }
    }

    /// Use `probe` instead of the kind named in the settings.
    pub fn with_probe(mut self, probe: Box<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("camera-health".to_string())
            .spawn(move || self.run())
            .context("spawn camera health thread")
    }

    pub fn run(self) {
        let shutdown = self.ctx.shutdown.clone();
        while !shutdown.is_triggered() {
            self.check_once();
            let interval = self.ctx.health_settings().interval;
            if shutdown.wait_timeout(interval) {
                break;
            }
        }
        log::debug!("camera health monitor stopped");
    }

    /// Probe once and record the result.
    pub fn check_once(&self) -> CameraStatus {
        let settings = self.ctx.health_settings();
        let url = self.ctx.source_url();

        let Some(ip) = resolve_ip(&settings, &url) else {
            self.record(None, CameraStatus::Unknown, &settings);
            return CameraStatus::Unknown;
        };

        let port = resolve_port(&settings, &url);
        let online = match &self.probe {
            Some(probe) => probe.probe(&ip, port, settings.timeout),
            None => probe_for(settings.probe).probe(&ip, port, settings.timeout),
        };
        let status = if online {
            CameraStatus::Online
        } else {
            CameraStatus::Offline
        };

        let previous = self.record(Some(ip.clone()), status, &settings);
        match (previous, status) {
            (CameraStatus::Online, CameraStatus::Offline) => self.raise_offline(&ip),
            (before, after) if before != after => {
                log::info!("camera {ip} is {after:?} (was {before:?})");
            }
            _ => {}
        }
        status
    }

    fn record(
        &self,
        ip: Option<String>,
        status: CameraStatus,
        settings: &HealthSettings,
    ) -> CameraStatus {
        self.ctx.update_camera_health(|health| {
            let previous = health.status;
            health.ip = ip;
            health.last_status = previous;
            health.status = status;
            health.last_checked = Some(now_string());
            health.interval_secs = settings.interval.as_secs_f64();
            previous
        })
    }

    fn raise_offline(&self, ip: &str) {
        let key = AlarmKey::camera_offline(ip);
        let policy = |config: &AlarmConfig| AlarmPolicy::Debounce(config.debounce);
        let fired = self.ctx.evaluate_alarm(key.clone(), policy, Instant::now());
        if !fired {
            log::debug!("camera offline alarm for {ip} suppressed by debounce");
            return;
        }

        log::warn!("camera {ip} went offline");
        self.ctx.sink.emit_alarm(&AlarmEvent {
            kind: AlarmKind::CameraOffline,
            phase: AlarmPhase::Raised,
            time: now_string(),
            key: key.to_string(),
            message: format!("camera {ip} is unreachable"),
            track_id: None,
            class_id: None,
            object_name: None,
            zone_id: None,
            zone_name: None,
            position: None,
            snapshot: None,
            clip: None,
        });
    }
}
