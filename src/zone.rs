//! Polygon zones and containment tests.

use std::sync::OnceLock;

use anyhow::Result;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::invalid_zone;

/// Tolerance used when deciding whether a point lies on a polygon edge.
const EDGE_EPSILON: f32 = 1e-3;
pub const MAX_ZONE_NAME_LEN: usize = 64;

/// A point in frame pixel coordinates, serialised as `[x, y]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<[f32; 2]> for Point {
    fn from(value: [f32; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<Point> for [f32; 2] {
    fn from(value: Point) -> Self {
        [value.x, value.y]
    }
}

/// Axis-aligned box `(x1, y1)`-`(x2, y2)` in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn centroid(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x1, self.y1),
            Point::new(self.x2, self.y1),
            Point::new(self.x2, self.y2),
            Point::new(self.x1, self.y2),
        ]
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).abs()
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).abs()
    }
}

/// How a detection box is matched against a zone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Centroid inside the polygon.
    #[default]
    Center,
    /// Any corner or the centroid inside the polygon.
    ///
    /// This is an approximation: a box straddling a zone edge with no corner
    /// and no centroid inside is not matched.
    Edge,
}

impl DetectionMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "center" => Ok(Self::Center),
            "edge" => Ok(Self::Edge),
            other => Err(crate::error::invalid_config(format!(
                "detection_mode must be 'center' or 'edge', got '{other}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Center => "center",
            Self::Edge => "edge",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Generated when absent from a config file.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub points: Vec<Point>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-zone fill override; falls back to the display default.
    #[serde(default)]
    pub fill_color: Option<[u8; 3]>,
    #[serde(default)]
    pub border_color: Option<[u8; 3]>,
}

fn default_enabled() -> bool {
    true
}

impl Zone {
    /// Create a zone with a freshly generated id.
    pub fn new(name: impl Into<String>, points: Vec<Point>) -> Self {
        Self {
            id: generate_zone_id(),
            name: name.into(),
            points,
            enabled: true,
            fill_color: None,
            border_color: None,
        }
    }

    /// A zone participates in detection only when enabled with >= 3 points.
    pub fn is_active(&self) -> bool {
        self.enabled && self.points.len() >= 3
    }

    pub fn contains(&self, point: Point) -> bool {
        point_in_polygon(point, &self.points)
    }

    /// Apply the configured detection mode to a box.
    pub fn matches(&self, bbox: &BoundingBox, mode: DetectionMode) -> bool {
        if !self.is_active() {
            return false;
        }
        match mode {
            DetectionMode::Center => self.contains(bbox.centroid()),
            DetectionMode::Edge => {
                bbox.corners().iter().any(|corner| self.contains(*corner))
                    || self.contains(bbox.centroid())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_zone_id(&self.id)?;
        let name = self.name.trim();
        if name.is_empty() {
            return Err(invalid_zone("zone name must not be empty"));
        }
        if name.chars().count() > MAX_ZONE_NAME_LEN {
            return Err(invalid_zone(format!(
                "zone name must be at most {MAX_ZONE_NAME_LEN} characters"
            )));
        }
        if !self.points.is_empty() && self.points.len() < 3 {
            return Err(invalid_zone(format!(
                "zone '{}' needs at least 3 points, got {}",
                self.name,
                self.points.len()
            )));
        }
        if let Some(point) = self
            .points
            .iter()
            .find(|p| !p.x.is_finite() || !p.y.is_finite() || p.x < 0.0 || p.y < 0.0)
        {
            return Err(invalid_zone(format!(
                "zone '{}' has an invalid point ({}, {})",
                self.name, point.x, point.y
            )));
        }
        Ok(())
    }
}

/// Return the first active zone (in list order) the box falls into.
pub fn first_matching_zone<'a>(
    zones: &'a [Zone],
    bbox: &BoundingBox,
    mode: DetectionMode,
) -> Option<&'a Zone> {
    zones.iter().find(|zone| zone.matches(bbox, mode))
}

/// Boundary-inclusive point-in-polygon test.
///
/// Points on an edge or vertex are inside. Degenerate polygons (< 3 vertices)
/// contain nothing.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let a = polygon[i];
        let b = polygon[j];
        if on_segment(point, a, b) {
            return true;
        }
        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x;
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    let len = ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt();
    if cross.abs() > EDGE_EPSILON * len.max(1.0) {
        return false;
    }
    p.x >= a.x.min(b.x) - EDGE_EPSILON
        && p.x <= a.x.max(b.x) + EDGE_EPSILON
        && p.y >= a.y.min(b.y) - EDGE_EPSILON
        && p.y <= a.y.max(b.y) + EDGE_EPSILON
}

pub fn generate_zone_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("zone_{}", hex::encode(bytes))
}

pub fn validate_zone_id(id: &str) -> Result<()> {
    static ZONE_ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = ZONE_ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap());
    if !re.is_match(id) {
        return Err(invalid_zone(format!(
            "zone id '{id}' must be lowercase alphanumeric with '_' or '-' (max 64)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(100.0, 100.0),
            Point::new(0.0, 100.0),
        ]
    }

    #[test]
    fn boundary_points_are_inside() {
        let poly = square();
        assert!(point_in_polygon(Point::new(50.0, 0.0), &poly));
        assert!(point_in_polygon(Point::new(100.0, 50.0), &poly));
        assert!(point_in_polygon(Point::new(0.0, 0.0), &poly));
        assert!(point_in_polygon(Point::new(100.0, 100.0), &poly));

        let triangle = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(0.0, 10.0),
        ];
        assert!(point_in_polygon(Point::new(5.0, 5.0), &triangle));
    }

    #[test]
    fn interior_and_exterior() {
        let poly = square();
        assert!(point_in_polygon(Point::new(10.0, 90.0), &poly));
        assert!(!point_in_polygon(Point::new(100.5, 50.0), &poly));
        assert!(!point_in_polygon(Point::new(-1.0, -1.0), &poly));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        let line = vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)];
        assert!(!point_in_polygon(Point::new(5.0, 5.0), &line));
    }

    #[test]
    fn edge_mode_uses_corners() {
        let zone = Zone::new("door", square());
        // Centroid at (115, 50) is outside; top-left corner is inside.
        let bbox = BoundingBox::new(90.0, 40.0, 140.0, 60.0);
        assert!(!zone.matches(&bbox, DetectionMode::Center));
        assert!(zone.matches(&bbox, DetectionMode::Edge));
    }

    #[test]
    fn edge_mode_misses_straddling_box() {
        // Thin zone crossed by a box whose corners and centroid all lie outside.
        let zone = Zone::new(
            "strip",
            vec![
                Point::new(45.0, 0.0),
                Point::new(55.0, 0.0),
                Point::new(55.0, 40.0),
                Point::new(45.0, 40.0),
            ],
        );
        let bbox = BoundingBox::new(0.0, 10.0, 80.0, 30.0);
        assert!(!zone.contains(bbox.centroid()));
        assert!(!zone.matches(&bbox, DetectionMode::Edge));
    }

    #[test]
    fn inactive_zones_never_match() {
        let mut zone = Zone::new("off", square());
        zone.enabled = false;
        let bbox = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert!(!zone.matches(&bbox, DetectionMode::Center));

        let partial = Zone::new("partial", vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0)]);
        assert!(!partial.is_active());
    }

    #[test]
    fn first_zone_in_list_order_wins() {
        let a = Zone::new("a", square());
        let b = Zone::new("b", square());
        let zones = vec![a.clone(), b];
        let hit = first_matching_zone(
            &zones,
            &BoundingBox::new(10.0, 10.0, 20.0, 20.0),
            DetectionMode::Center,
        );
        assert_eq!(hit.map(|z| z.id.as_str()), Some(a.id.as_str()));
    }

    #[test]
    fn generated_ids_validate() -> Result<()> {
        let id = generate_zone_id();
        assert!(id.starts_with("zone_"));
        assert_eq!(id.len(), "zone_".len() + 8);
        validate_zone_id(&id)?;
        assert!(validate_zone_id("Bad Id").is_err());
        Ok(())
    }

    #[test]
    fn validation_rejects_two_points() {
        let zone = Zone::new("x", vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]);
        assert!(zone.validate().is_err());
        let empty = Zone::new("drawing", Vec::new());
        assert!(empty.validate().is_ok());
    }

    #[test]
    fn points_serialize_as_pairs() -> Result<()> {
        let zone = Zone::new("z", square());
        let json = serde_json::to_value(&zone)?;
        assert_eq!(json["points"][1], serde_json::json!([100.0, 0.0]));
        let back: Zone = serde_json::from_value(json)?;
        assert_eq!(back, zone);
        Ok(())
    }
}
