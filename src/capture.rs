//! Evidence capture for fired alarms.
//!
//! `trigger` emits the `raised` event immediately and hands the snapshot and
//! clip work to a short-lived thread, which emits the `captured` event once
//! both attempts have finished.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use regex::Regex;

use crate::alarm::AlarmKey;
use crate::annotate::{encode_jpeg, AnnotatedFrame, Renderer};
use crate::broadcast::{format_local_time, AlarmEvent, AlarmKind, AlarmPhase};
use crate::config::{DisplayConfig, EventCaptureSettings};
use crate::context::{lock, PipelineContext};
use crate::process::{CommandSpec, ProcessHandle};

/// Clips below this size are treated as failed captures.
pub const MIN_CLIP_BYTES: u64 = 1024;

/// One fired intrusion alarm.
#[derive(Clone, Debug)]
pub struct AlarmTrigger {
    pub key: AlarmKey,
    pub track_id: u64,
    pub class_id: u32,
    pub object_name: String,
    pub zone_id: String,
    pub zone_name: String,
    pub position: [f32; 2],
    pub time: DateTime<Local>,
}

impl AlarmTrigger {
    fn event(&self, phase: AlarmPhase) -> AlarmEvent {
        AlarmEvent {
            kind: AlarmKind::Intrusion,
            phase,
            time: format_local_time(self.time),
            key: self.key.to_string(),
            message: format!(
                "{} #{} entered zone '{}'",
                self.object_name, self.track_id, self.zone_name
            ),
            track_id: Some(self.track_id),
            class_id: Some(self.class_id),
            object_name: Some(self.object_name.clone()),
            zone_id: Some(self.zone_id.clone()),
            zone_name: Some(self.zone_name.clone()),
            position: Some(self.position),
            snapshot: None,
            clip: None,
        }
    }
}

pub struct EventCaptureOrchestrator {
    ctx: Arc<PipelineContext>,
    renderer: Arc<Mutex<Renderer>>,
    active_clips: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventCaptureOrchestrator {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            renderer: Arc::new(Mutex::new(Renderer::new())),
            active_clips: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Publish the alarm and start evidence capture without blocking.
    pub fn trigger(&self, trigger: AlarmTrigger) {
        log::warn!(
            "ALARM: {} #{} in zone '{}' at ({:.0}, {:.0})",
            trigger.object_name,
            trigger.track_id,
            trigger.zone_name,
            trigger.position[0],
            trigger.position[1]
        );
        self.ctx.sink.emit_alarm(&trigger.event(AlarmPhase::Raised));

        let job = CaptureJob {
            settings: self.ctx.alarm_config().capture,
            display: self.ctx.display(),
            source_url: self.ctx.source_url(),
            frame: self.ctx.latest_annotated(),
            renderer: self.renderer.clone(),
            active_clips: self.active_clips.clone(),
            trigger,
        };
        let ctx = self.ctx.clone();
        let spawned = std::thread::Builder::new()
            .name("event-capture".to_string())
            .spawn(move || {
                let event = job.run();
                ctx.sink.emit_alarm(&event);
            });

        let mut workers = lock(&self.workers);
        workers.retain(|handle| !handle.is_finished());
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => log::error!("failed to spawn event capture thread: {e}"),
        }
    }

    /// Clip captures currently running.
    pub fn active_clips(&self) -> usize {
        self.active_clips.load(Ordering::SeqCst)
    }

    /// Wait for outstanding captures. Returns true when all finished in time.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut workers = lock(&self.workers);
            let (finished, running): (Vec<_>, Vec<_>) =
                workers.drain(..).partition(|handle| handle.is_finished());
            *workers = running;
            let idle = workers.is_empty();
            drop(workers);
            for handle in finished {
                let _ = handle.join();
            }
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

struct CaptureJob {
    settings: EventCaptureSettings,
    display: DisplayConfig,
    source_url: String,
    frame: Option<Arc<AnnotatedFrame>>,
    renderer: Arc<Mutex<Renderer>>,
    active_clips: Arc<AtomicUsize>,
    trigger: AlarmTrigger,
}

impl CaptureJob {
    fn run(self) -> AlarmEvent {
        let mut event = self.trigger.event(AlarmPhase::Captured);
        if !self.settings.snapshot_enabled && !self.settings.clip_enabled {
            return event;
        }
        if let Err(e) = std::fs::create_dir_all(&self.settings.save_path) {
            log::error!(
                "cannot create event directory {}: {}",
                self.settings.save_path.display(),
                e
            );
            return event;
        }

        let base = unique_basename(&self.settings.save_path, &event_basename(&self.trigger));

        if self.settings.snapshot_enabled {
            let path = self.settings.save_path.join(format!("{base}.jpg"));
            match self.save_snapshot(&path) {
                Ok(true) => event.snapshot = file_name(&path),
                Ok(false) => log::debug!("no annotated frame yet; snapshot skipped"),
                Err(e) => {
                    log::warn!("snapshot {} failed: {e:#}", path.display());
                    remove_partial(&path);
                }
            }
        }

        if self.settings.clip_enabled {
            let path = self.settings.save_path.join(format!("{base}.mp4"));
            match self.record_clip(&path) {
                Ok(true) => event.clip = file_name(&path),
                Ok(false) => {}
                Err(e) => {
                    log::warn!("clip {} failed: {e:#}", path.display());
                    remove_partial(&path);
                }
            }
        }
        event
    }

    /// Returns false when there was no frame to save.
    fn save_snapshot(&self, path: &Path) -> Result<bool> {
        let Some(frame) = &self.frame else {
            return Ok(false);
        };
        let mut image = frame.image.clone();
        let text = format!(
            "{} | {} #{} | {}",
            format_local_time(self.trigger.time),
            self.trigger.object_name,
            self.trigger.track_id,
            self.trigger.zone_name
        );
        lock(&self.renderer).draw_banner(&mut image, &text, &self.display);
        let jpeg = encode_jpeg(&image, self.display.jpeg_quality)?;
        std::fs::write(path, jpeg).with_context(|| format!("write {}", path.display()))?;
        log::info!("snapshot saved: {}", path.display());
        Ok(true)
    }

    /// Returns false when the clip was skipped.
    fn record_clip(&self, path: &Path) -> Result<bool> {
        if self.source_url.starts_with("stub://") {
            log::debug!("synthetic source; clip skipped");
            return Ok(false);
        }
        let Some(_slot) = ClipSlot::acquire(&self.active_clips, self.settings.max_concurrent_clips)
        else {
            log::warn!(
                "{} clip captures already running; clip skipped",
                self.settings.max_concurrent_clips
            );
            return Ok(false);
        };

        let spec = clip_command(&self.settings, &self.source_url, path);
        ProcessHandle::run_to_completion(&spec, self.settings.clip_duration + self.settings.grace)?;

        let size = std::fs::metadata(path)
            .with_context(|| format!("clip {} missing after capture", path.display()))?
            .len();
        if size < MIN_CLIP_BYTES {
            return Err(anyhow!("clip is only {size} bytes"));
        }
        log::info!("clip saved: {} ({} bytes)", path.display(), size);
        Ok(true)
    }
}

/// Counted reservation of one concurrent clip capture.
struct ClipSlot {
    active: Arc<AtomicUsize>,
}

impl ClipSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self {
                active: active.clone(),
            })
    }
}

impl Drop for ClipSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn clip_command(settings: &EventCaptureSettings, url: &str, output: &Path) -> CommandSpec {
    let mut spec = CommandSpec::new("event-clip", &settings.ffmpeg_bin)
        .args(["-hide_banner", "-loglevel", "error", "-y"]);
    if url.starts_with("rtsp://") {
        spec = spec.args(["-rtsp_transport", "tcp"]);
    }
    spec.args(["-i", url])
        .args(["-t".to_string(), settings.clip_duration.as_secs().to_string()])
        .args(["-c", "copy"])
        .arg(output.to_string_lossy().into_owned())
}

/// `<YYYYmmdd_HHMMSS>_<track>_<object>_<zone>`.
pub fn event_basename(trigger: &AlarmTrigger) -> String {
    format!(
        "{}_{}_{}_{}",
        trigger.time.format("%Y%m%d_%H%M%S"),
        trigger.track_id,
        sanitize(&trigger.object_name),
        sanitize(&trigger.zone_name)
    )
}

/// Replace runs of filesystem-unsafe characters with `_`.
pub fn sanitize(raw: &str) -> String {
    static UNSAFE_RE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE_RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").unwrap());
    let cleaned = re.replace_all(raw.trim(), "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned.to_string()
    }
}

fn unique_basename(dir: &Path, base: &str) -> String {
    let taken = |candidate: &str| {
        dir.join(format!("{candidate}.jpg")).exists() || dir.join(format!("{candidate}.mp4")).exists()
    };
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("could not remove partial artifact {}: {}", path.display(), e);
        }
    }
}
