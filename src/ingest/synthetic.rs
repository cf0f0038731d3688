// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and demos
// ----------------------------------------------------------------------------

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{SourceInfo, VideoSource};
use crate::error::invalid_config;
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: f32 = 10.0;

/// Parameters of a `stub://<name>?width=..&height=..&fps=..` address.
///
/// `fail_open=1` makes every open fail and `fail_after=N` makes reads fail
/// after N frames, for exercising reconnect handling.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub fail_open: bool,
    pub fail_after: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            fail_open: false,
            fail_after: None,
        }
    }
}

impl SyntheticConfig {
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid stub url '{raw}'"))?;
        let mut config = Self {
            name: url.host_str().unwrap_or("synthetic").to_string(),
            ..Self::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => config.width = parse_param(&key, &value)?,
                "height" => config.height = parse_param(&key, &value)?,
                "fps" => config.fps = parse_param(&key, &value)?,
                "fail_open" => config.fail_open = matches!(value.as_ref(), "1" | "true"),
                "fail_after" => config.fail_after = Some(parse_param(&key, &value)?),
                other => log::debug!("stub source: ignoring parameter '{other}'"),
            }
        }
        if config.width == 0 || config.height == 0 {
            return Err(invalid_config("stub source dimensions must be non-zero"));
        }
        if !config.fps.is_finite() || config.fps <= 0.0 {
            return Err(invalid_config("stub source fps must be positive"));
        }
        Ok(config)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| invalid_config(format!("stub source parameter {key}='{value}' is invalid")))
}

/// Paced generator of moving gradient frames.
pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    scene_state: u8,
    next_due: Instant,
}

impl SyntheticSource {
    pub fn open(config: SyntheticConfig) -> Result<Self> {
        if config.fail_open {
            return Err(anyhow!("stub://{}: open refused", config.name));
        }
        log::info!(
            "synthetic source '{}' opened ({}x{} @ {} fps)",
            config.name,
            config.width,
            config.height,
            config.fps
        );
        Ok(Self {
            config,
            frame_count: 0,
            scene_state: 0,
            next_due: Instant::now(),
        })
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.config.fps)
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let pixel_count = (self.config.width as usize) * (self.config.height as usize) * 3;
        let offset = self.frame_count + self.scene_state as u64;
        (0..pixel_count)
            .map(|i| ((i as u64 + offset) % 256) as u8)
            .collect()
    }
}

impl VideoSource for SyntheticSource {
    fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if let Some(limit) = self.config.fail_after {
            if self.frame_count >= limit {
                return Err(anyhow!(
                    "stub://{}: read failed after {} frames",
                    self.config.name,
                    limit
                ));
            }
        }

        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = self.next_due.max(now) + self.frame_interval();

        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(Frame::new(
            self.frame_count,
            self.config.width,
            self.config.height,
            pixels,
        ))
    }
}
