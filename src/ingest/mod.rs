//! Video sources and the ingestion loop.
//!
//! - `stub://` sources produce synthetic frames (always available; used in
//!   tests and demos).
//! - Every other address (`rtsp://`, files, `http://`) is decoded with FFmpeg
//!   (feature: ingest-ffmpeg).
//!
//! `StreamIngestor` owns the connection, reconnects with backoff, and pushes
//! decoded frames into the pipeline's drop-oldest `FrameChannel`.

#[cfg(feature = "ingest-ffmpeg")]
mod ffmpeg;
mod ingestor;
mod synthetic;

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::error::PipelineError;
use crate::frame::Frame;

#[cfg(feature = "ingest-ffmpeg")]
pub use ffmpeg::FfmpegSource;
pub use ingestor::{RetryPolicy, SourceOpener, StreamIngestor};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Longest a network read may stall before the source reports failure and
/// the ingestor reconnects.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Demuxer options for opening `url` with FFmpeg. Network inputs get a socket
/// timeout (microseconds) so a stalled camera surfaces as a read error.
#[cfg_attr(not(feature = "ingest-ffmpeg"), allow(dead_code))]
pub(crate) fn ffmpeg_input_options(url: &str, io_timeout: Duration) -> Vec<(&'static str, String)> {
    let micros = io_timeout.as_micros().to_string();
    let mut options = Vec::new();
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        options.push(("rtsp_transport", "tcp".to_string()));
        options.push(("timeout", micros.clone()));
    }
    if url.contains("://") {
        options.push(("rw_timeout", micros));
    }
    options
}

/// Properties reported by an open source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate; 0 when the container does not say.
    pub fps: f32,
}

/// An open video stream. Sources are opened and read on the ingestor thread
/// and never cross threads.
pub trait VideoSource {
    fn info(&self) -> SourceInfo;

    /// Block until the next frame is decoded.
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Open `url` with the backend its scheme selects.
pub fn open_source(url: &str) -> Result<Box<dyn VideoSource>> {
    if url.starts_with("stub://") {
        let config = SyntheticConfig::from_url(url)?;
        let source = SyntheticSource::open(config).map_err(|e| source_error(url, e))?;
        return Ok(Box::new(source));
    }

    #[cfg(feature = "ingest-ffmpeg")]
    {
        let source = FfmpegSource::open(url).map_err(|e| source_error(url, e))?;
        Ok(Box::new(source))
    }
    #[cfg(not(feature = "ingest-ffmpeg"))]
    {
        Err(PipelineError::SourceUnavailable(format!(
            "{url}: decoding requires the ingest-ffmpeg feature"
        ))
        .into())
    }
}

/// Connection state published for status queries.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StreamInfo {
    pub url: String,
    pub connected: bool,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    /// Frames read since the current connection was opened.
    pub frames_read: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

impl StreamInfo {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }
}

/// Tag `err` as `SourceUnavailable` unless it already is.
pub(crate) fn source_error(url: &str, err: anyhow::Error) -> anyhow::Error {
    if matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::SourceUnavailable(_))
    ) {
        return err;
    }
    PipelineError::SourceUnavailable(format!("{url}: {err:#}")).into()
}
