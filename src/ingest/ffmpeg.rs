//! FFmpeg-backed source for RTSP streams, HTTP streams, and local files.

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{ffmpeg_input_options, SourceInfo, VideoSource, IO_TIMEOUT};
use crate::frame::Frame;

pub struct FfmpegSource {
    url: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: f32,
    frame_count: u64,
}

impl FfmpegSource {
    pub fn open(url: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut options = ffmpeg::Dictionary::new();
        for (key, value) in ffmpeg_input_options(url, IO_TIMEOUT) {
            options.set(key, &value);
        }
        let input = ffmpeg::format::input_with_dictionary(&url, options)
            .with_context(|| format!("failed to open '{url}' with ffmpeg"))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{url}' has no video track"))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let fps = if rate.denominator() == 0 {
            0.0
        } else {
            f64::from(rate) as f32
        };
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "opened {} ({}x{} @ {:.1} fps)",
            url,
            decoder.width(),
            decoder.height(),
            fps
        );
        Ok(Self {
            url: url.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            frame_count: 0,
        })
    }
}

impl VideoSource for FfmpegSource {
    fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.decoder.width(),
            height: self.decoder.height(),
            fps: self.fps,
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        let started = Instant::now();

        for (stream, packet) in self.input.packets() {
            if started.elapsed() > IO_TIMEOUT {
                bail!(
                    "{}: no video frame decoded within {}s",
                    self.url,
                    IO_TIMEOUT.as_secs()
                );
            }
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;

            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                self.frame_count += 1;
                return Ok(Frame::new(self.frame_count, width, height, pixels));
            }
        }

        bail!("{}: stream ended after {} frames", self.url, self.frame_count)
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
