use serde::{Deserialize, Serialize};

use crate::zone::{BoundingBox, Point};

/// Result of one tracking call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(default)]
    pub boxes: Vec<DetectionBox>,
}

impl DetectionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(boxes: Vec<DetectionBox>) -> Self {
        Self { boxes }
    }
}

/// One detected object in pixel coordinates.
///
/// Boxes without a track id are drawn and reported but never raise alarms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    #[serde(default)]
    pub track_id: Option<u64>,
    pub class_id: u32,
    pub confidence: f32,
    #[serde(with = "bbox_array")]
    pub bbox: BoundingBox,
}

impl DetectionBox {
    pub fn new(track_id: Option<u64>, class_id: u32, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            track_id,
            class_id,
            confidence,
            bbox,
        }
    }

    pub fn centroid(&self) -> Point {
        self.bbox.centroid()
    }
}

/// `[x1, y1, x2, y2]` on the wire.
pub(crate) mod bbox_array {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::zone::BoundingBox;

    pub fn serialize<S: Serializer>(bbox: &BoundingBox, serializer: S) -> Result<S::Ok, S::Error> {
        [bbox.x1, bbox.y1, bbox.x2, bbox.y2].serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BoundingBox, D::Error> {
        let [x1, y1, x2, y2] = <[f32; 4]>::deserialize(deserializer)?;
        Ok(BoundingBox::new(x1, y1, x2, y2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_helper_response() -> anyhow::Result<()> {
        let raw = r#"{"boxes":[{"track_id":4,"class_id":0,"confidence":0.9,"bbox":[10,20,30,60]},
                               {"class_id":2,"confidence":0.5,"bbox":[0,0,1,1]}]}"#;
        let result: DetectionResult = serde_json::from_str(raw)?;
        assert_eq!(result.boxes.len(), 2);
        assert_eq!(result.boxes[0].centroid(), Point::new(20.0, 40.0));
        assert_eq!(result.boxes[1].track_id, None);
        Ok(())
    }
}
