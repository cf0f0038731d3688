//! Overlay rendering and JPEG encoding.
//!
//! Zones are filled on a single overlay that is alpha-blended over the frame,
//! then outlined. Detection boxes go on top, red when the object is inside a
//! zone. Text needs a TrueType font; without one, labels are skipped and only
//! shapes are drawn.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_polygon_mut,
    draw_text_mut, text_size,
};
use imageproc::point::Point as PixelPoint;
use imageproc::rect::Rect;

use crate::broadcast::DetectionRecord;
use crate::config::DisplayConfig;
use crate::frame::Frame;
use crate::zone::{Point, Zone};

const IN_ZONE_COLOR: [u8; 3] = [255, 0, 0];
const BANNER_COLOR: [u8; 3] = [200, 0, 0];
const BANNER_TEXT_COLOR: [u8; 3] = [255, 255, 255];
const LABEL_PADDING: i32 = 3;

/// Fonts tried when no font path is configured.
const FALLBACK_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

/// The most recent rendered frame, kept for snapshots.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub seq: u64,
    pub captured_at: SystemTime,
    pub image: RgbImage,
}

#[derive(Default)]
pub struct Renderer {
    font: Option<FontArc>,
    /// Configured path the cached font was resolved for.
    resolved_for: Option<Option<PathBuf>>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Load (or reuse) the font for `configured`.
    fn ensure_font(&mut self, configured: Option<&Path>) {
        let key = configured.map(Path::to_path_buf);
        if self.resolved_for.as_ref() == Some(&key) {
            return;
        }
        self.font = match configured {
            Some(path) => match load_font(path) {
                Ok(font) => Some(font),
                Err(e) => {
                    log::warn!("{e:#}; labels disabled");
                    None
                }
            },
            None => {
                let found = FALLBACK_FONTS
                    .iter()
                    .find_map(|path| load_font(Path::new(path)).ok());
                if found.is_none() {
                    log::info!("no system font found; labels disabled");
                }
                found
            }
        };
        self.resolved_for = Some(key);
    }

    /// Draw zones and detections over `frame`.
    pub fn render(
        &mut self,
        frame: &Frame,
        zones: &[Zone],
        detections: &[DetectionRecord],
        display: &DisplayConfig,
    ) -> Result<AnnotatedFrame> {
        self.ensure_font(display.font_path.as_deref());
        let mut image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| {
                anyhow!(
                    "frame {} buffer does not match {}x{}",
                    frame.seq,
                    frame.width,
                    frame.height
                )
            })?;

        self.draw_zones(&mut image, zones, display);
        for detection in detections {
            self.draw_detection(&mut image, detection, display);
        }

        Ok(AnnotatedFrame {
            seq: frame.seq,
            captured_at: frame.captured_at,
            image,
        })
    }

    fn draw_zones(&self, image: &mut RgbImage, zones: &[Zone], display: &DisplayConfig) {
        let active: Vec<&Zone> = zones.iter().filter(|zone| zone.is_active()).collect();
        if active.is_empty() {
            return;
        }

        if display.zone_fill_alpha > 0.0 {
            let mut overlay = image.clone();
            for zone in &active {
                let polygon = pixel_polygon(&zone.points);
                if polygon.len() >= 3 {
                    let color = zone.fill_color.unwrap_or(display.zone_fill_color);
                    draw_polygon_mut(&mut overlay, &polygon, Rgb(color));
                }
            }
            blend(image, &overlay, display.zone_fill_alpha);
        }

        for zone in &active {
            let color = Rgb(zone.border_color.unwrap_or(display.zone_border_color));
            let points = &zone.points;
            for (i, start) in points.iter().enumerate() {
                let end = points[(i + 1) % points.len()];
                for offset in 0..2 {
                    let o = offset as f32;
                    draw_line_segment_mut(image, (start.x + o, start.y), (end.x + o, end.y), color);
                }
            }
            if let Some(anchor) = points.first() {
                self.draw_label(
                    image,
                    &zone.name,
                    anchor.x as i32,
                    anchor.y as i32,
                    color.0,
                    display,
                );
            }
        }
    }

    fn draw_detection(&self, image: &mut RgbImage, record: &DetectionRecord, display: &DisplayConfig) {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return;
        }
        let [x1, y1, x2, y2] = record.bbox;
        let max_x = (width - 1) as f32;
        let max_y = (height - 1) as f32;
        let left = x1.clamp(0.0, max_x) as i32;
        let top = y1.clamp(0.0, max_y) as i32;
        let right = x2.clamp(0.0, max_x) as i32;
        let bottom = y2.clamp(0.0, max_y) as i32;

        let color = if record.in_zone {
            IN_ZONE_COLOR
        } else {
            display.box_color
        };
        for inset in 0..display.box_thickness as i32 {
            let w = (right - left - 2 * inset).max(1) as u32;
            let h = (bottom - top - 2 * inset).max(1) as u32;
            let rect = Rect::at(left + inset, top + inset).of_size(w, h);
            draw_hollow_rect_mut(image, rect, Rgb(color));
        }

        let name = if display.use_display_names {
            &record.display_name
        } else {
            &record.class_name
        };
        let label = match record.id {
            Some(id) => format!("{name} #{id} {:.2}", record.confidence),
            None => format!("{name} {:.2}", record.confidence),
        };
        self.draw_label(image, &label, left, top, color, display);
    }

    /// Filled tag with text, placed above `(x, y)` when there is room.
    fn draw_label(
        &self,
        image: &mut RgbImage,
        text: &str,
        x: i32,
        y: i32,
        background: [u8; 3],
        display: &DisplayConfig,
    ) {
        let Some(font) = &self.font else {
            return;
        };
        let scale = PxScale::from(display.font_size as f32);
        let (text_w, text_h) = text_size(scale, font, text);
        let tag_w = text_w + 2 * LABEL_PADDING as u32;
        let tag_h = text_h + 2 * LABEL_PADDING as u32;
        let tag_y = if y >= tag_h as i32 { y - tag_h as i32 } else { y };

        draw_filled_rect_mut(image, Rect::at(x, tag_y).of_size(tag_w.max(1), tag_h.max(1)), Rgb(background));
        draw_text_mut(
            image,
            Rgb(display.text_color),
            x + LABEL_PADDING,
            tag_y + LABEL_PADDING,
            scale,
            font,
            text,
        );
    }

    /// Stamp an alarm banner across the top of a snapshot.
    pub fn draw_banner(&mut self, image: &mut RgbImage, text: &str, display: &DisplayConfig) {
        self.ensure_font(display.font_path.as_deref());
        let (width, _) = image.dimensions();
        let scale = PxScale::from(display.font_size as f32);
        let text_h = match &self.font {
            Some(font) => text_size(scale, font, text).1,
            None => display.font_size,
        };
        let bar_h = text_h + 2 * LABEL_PADDING as u32;
        draw_filled_rect_mut(image, Rect::at(0, 0).of_size(width.max(1), bar_h.max(1)), Rgb(BANNER_COLOR));
        if let Some(font) = &self.font {
            draw_text_mut(
                image,
                Rgb(BANNER_TEXT_COLOR),
                LABEL_PADDING,
                LABEL_PADDING,
                scale,
                font,
                text,
            );
        }
    }
}

fn load_font(path: &Path) -> Result<FontArc> {
    let bytes = std::fs::read(path).with_context(|| format!("read font {}", path.display()))?;
    FontArc::try_from_vec(bytes).map_err(|e| anyhow!("invalid font {}: {}", path.display(), e))
}

/// Integer polygon for filling. The fill routine rejects a closing vertex
/// equal to the first, so one is dropped.
fn pixel_polygon(points: &[Point]) -> Vec<PixelPoint<i32>> {
    let mut polygon: Vec<PixelPoint<i32>> = Vec::with_capacity(points.len());
    for p in points {
        let pixel = PixelPoint::new(p.x.round() as i32, p.y.round() as i32);
        if polygon.last() != Some(&pixel) {
            polygon.push(pixel);
        }
    }
    while polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }
    polygon
}

fn blend(base: &mut RgbImage, overlay: &RgbImage, alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    for (dst, src) in base.pixels_mut().zip(overlay.pixels()) {
        for channel in 0..3 {
            let mixed = src.0[channel] as f32 * alpha + dst.0[channel] as f32 * (1.0 - alpha);
            dst.0[channel] = mixed.round() as u8;
        }
    }
}

/// Encode at `quality` (1-100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg_bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_bytes, quality);
    encoder
        .encode_image(image)
        .context("encode annotated frame as jpeg")?;
    Ok(jpeg_bytes)
}

pub fn jpeg_data_url(jpeg: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    )
}
