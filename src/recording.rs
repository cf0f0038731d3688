//! Continuous segmented recording through an external recorder process.
//!
//! State machine: `Idle -> Starting -> Active -> Stopping -> Idle`. The state
//! lock is held for the whole of `start`, so concurrent starts serialize and
//! the loser sees `ALREADY_ACTIVE`. `stop` releases the lock while it waits
//! for the process so status queries stay responsive.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::broadcast::format_local_time;
use crate::config::RecordingConfig;
use crate::context::lock;
use crate::error::PipelineError;
use crate::process::{CommandSpec, ProcessHandle, StopOutcome};

/// How long a freshly spawned recorder must survive to count as started.
pub const STARTUP_GRACE: Duration = Duration::from_millis(200);
/// Bound on graceful shutdown before the recorder is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Starting,
    Active,
    Stopping,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordingStatus {
    Idle,
    Starting,
    Stopping,
    Active {
        started_at: String,
        elapsed_secs: f64,
        segment_elapsed_secs: f64,
        segment_secs: u64,
        save_path: PathBuf,
        pid: u32,
    },
}

impl RecordingStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

struct RecordingSession {
    process: ProcessHandle,
    started_at: Instant,
    started_wall: DateTime<Local>,
    segment: Duration,
    save_path: PathBuf,
}

struct Inner {
    state: RecordingState,
    session: Option<RecordingSession>,
}

pub struct RecordingSupervisor {
    settings: Mutex<RecordingConfig>,
    inner: Mutex<Inner>,
    startup_grace: Duration,
    stop_timeout: Duration,
}

impl RecordingSupervisor {
    pub fn new(settings: RecordingConfig) -> Self {
        Self {
            settings: Mutex::new(settings),
            inner: Mutex::new(Inner {
                state: RecordingState::Idle,
                session: None,
            }),
            startup_grace: STARTUP_GRACE,
            stop_timeout: STOP_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, startup_grace: Duration, stop_timeout: Duration) -> Self {
        self.startup_grace = startup_grace;
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn settings(&self) -> RecordingConfig {
        lock(&self.settings).clone()
    }

    /// New settings apply to the next `start`.
    pub fn set_settings(&self, settings: RecordingConfig) {
        *lock(&self.settings) = settings;
    }

    pub fn state(&self) -> RecordingState {
        lock(&self.inner).state
    }

    /// Start recording `url`.
    pub fn start(&self, url: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.state != RecordingState::Idle {
            return Err(PipelineError::AlreadyActive("recording").into());
        }
        inner.state = RecordingState::Starting;
        match self.launch(url) {
            Ok(session) => {
                log::info!(
                    "recording started: {} -> {} (segments of {}s)",
                    url,
                    session.save_path.display(),
                    session.segment.as_secs()
                );
                inner.session = Some(session);
                inner.state = RecordingState::Active;
                Ok(())
            }
            Err(e) => {
                inner.state = RecordingState::Idle;
                log::error!("recording start failed: {e:#}");
                Err(e)
            }
        }
    }

    fn launch(&self, url: &str) -> Result<RecordingSession> {
        if url.starts_with("stub://") {
            return Err(PipelineError::ProcessSupervision(format!(
                "cannot record synthetic source {url}"
            ))
            .into());
        }
        let settings = self.settings();
        std::fs::create_dir_all(&settings.save_path).map_err(|e| {
            PipelineError::ProcessSupervision(format!(
                "create recording directory {}: {}",
                settings.save_path.display(),
                e
            ))
        })?;

        let spec = recorder_command(&settings, url);
        let mut process = ProcessHandle::spawn(&spec)?;
        if let Some(status) = process.wait_timeout(self.startup_grace)? {
            let detail = process
                .last_stderr_line()
                .unwrap_or_else(|| "no output".to_string());
            return Err(PipelineError::ProcessSupervision(format!(
                "recorder exited immediately ({status}): {detail}"
            ))
            .into());
        }

        Ok(RecordingSession {
            process,
            started_at: Instant::now(),
            started_wall: Local::now(),
            segment: settings.segment,
            save_path: settings.save_path,
        })
    }

    /// Stop recording. Always ends `Idle`, escalating to a kill if needed.
    pub fn stop(&self) -> Result<StopOutcome> {
        let session = {
            let mut inner = lock(&self.inner);
            if inner.state != RecordingState::Active {
                return Err(PipelineError::NotActive("recording").into());
            }
            inner.state = RecordingState::Stopping;
            inner.session.take()
        };

        let outcome = match session {
            Some(mut session) => {
                let elapsed = session.started_at.elapsed();
                let outcome = session.process.stop(true, self.stop_timeout);
                log::info!("recording stopped after {:.0}s", elapsed.as_secs_f64());
                outcome
            }
            None => Err(PipelineError::NotActive("recording").into()),
        };

        lock(&self.inner).state = RecordingState::Idle;
        outcome
    }

    /// Current status. A recorder that exited on its own is reaped here.
    pub fn status(&self) -> RecordingStatus {
        let mut inner = lock(&self.inner);
        match inner.state {
            RecordingState::Idle => RecordingStatus::Idle,
            RecordingState::Starting => RecordingStatus::Starting,
            RecordingState::Stopping => RecordingStatus::Stopping,
            RecordingState::Active => {
                let Some(session) = inner.session.as_mut() else {
                    inner.state = RecordingState::Idle;
                    return RecordingStatus::Idle;
                };
                match session.process.try_wait() {
                    Ok(None) => {}
                    Ok(Some(status)) => {
                        let detail = session.process.last_stderr_line().unwrap_or_default();
                        log::warn!("recorder exited unexpectedly ({status}) {detail}");
                        inner.session = None;
                        inner.state = RecordingState::Idle;
                        return RecordingStatus::Idle;
                    }
                    Err(e) => log::warn!("{e:#}"),
                }
                let elapsed = session.started_at.elapsed();
                let segment_elapsed = if session.segment.is_zero() {
                    elapsed
                } else {
                    Duration::from_nanos(
                        (elapsed.as_nanos() % session.segment.as_nanos()) as u64,
                    )
                };
                RecordingStatus::Active {
                    started_at: format_local_time(session.started_wall),
                    elapsed_secs: elapsed.as_secs_f64(),
                    segment_elapsed_secs: segment_elapsed.as_secs_f64(),
                    segment_secs: session.segment.as_secs(),
                    save_path: session.save_path.clone(),
                    pid: session.process.id(),
                }
            }
        }
    }

    /// Stop if active; used at process shutdown.
    pub fn shutdown(&self) {
        if self.state() == RecordingState::Active {
            if let Err(e) = self.stop() {
                log::warn!("recording stop at shutdown: {e:#}");
            }
        }
    }
}

/// Stream-copy into fixed-length segments named by start time.
pub(crate) fn recorder_command(settings: &RecordingConfig, url: &str) -> CommandSpec {
    let pattern = settings.save_path.join("rec_%Y%m%d_%H%M%S.mp4");
    let mut spec = CommandSpec::new("recorder", &settings.ffmpeg_bin)
        .args(["-hide_banner", "-loglevel", "error"]);
    if url.starts_with("rtsp://") {
        spec = spec.args(["-rtsp_transport", "tcp"]);
    }
    spec.args(["-i", url])
        .args(["-c", "copy", "-map", "0", "-f", "segment"])
        .args(["-segment_time".to_string(), settings.segment.as_secs().to_string()])
        .args(["-reset_timestamps", "1", "-strftime", "1"])
        .arg(pattern.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_arguments() {
        let settings = RecordingConfig {
            save_path: PathBuf::from("/data/rec"),
            segment: Duration::from_secs(120),
            ..RecordingConfig::default()
        };
        let spec = recorder_command(&settings, "rtsp://cam/live");
        assert!(spec.args.windows(2).any(|w| w == ["-c", "copy"]));
        assert!(spec.args.windows(2).any(|w| w == ["-segment_time", "120"]));
        assert!(spec.args.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
        assert_eq!(
            spec.args.last().map(String::as_str),
            Some("/data/rec/rec_%Y%m%d_%H%M%S.mp4")
        );
    }

    #[test]
    fn stop_when_idle_is_not_active() {
        let supervisor = RecordingSupervisor::new(RecordingConfig::default());
        let err = supervisor.stop().unwrap_err();
        let typed = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(typed.code(), "NOT_ACTIVE");
        assert_eq!(supervisor.status(), RecordingStatus::Idle);
    }

    #[test]
    fn synthetic_sources_cannot_be_recorded() {
        let supervisor = RecordingSupervisor::new(RecordingConfig::default());
        assert!(supervisor.start("stub://cam").is_err());
        assert_eq!(supervisor.state(), RecordingState::Idle);
    }

    #[test]
    fn status_serializes_with_state_tag() -> Result<()> {
        let json = serde_json::to_value(RecordingStatus::Idle)?;
        assert_eq!(json["state"], "idle");
        Ok(())
    }
}
