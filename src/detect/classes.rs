//! Class catalog: names, enabled set, confidence thresholds, display names.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::error::invalid_config;

pub const DEFAULT_CONFIDENCE: f32 = 0.25;
/// Class 0 (person) is the only class enabled out of the box.
pub const DEFAULT_ENABLED_CLASS: u32 = 0;

pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

#[derive(Clone, Debug)]
pub struct ClassCatalog {
    names: Vec<String>,
    enabled: BTreeSet<u32>,
    thresholds: BTreeMap<u32, f32>,
    custom_names: BTreeMap<u32, String>,
}

impl Default for ClassCatalog {
    fn default() -> Self {
        Self::coco()
    }
}

impl ClassCatalog {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            enabled: BTreeSet::from([DEFAULT_ENABLED_CLASS]),
            thresholds: BTreeMap::new(),
            custom_names: BTreeMap::new(),
        }
    }

    pub fn coco() -> Self {
        Self::new(COCO_CLASSES.iter().map(|name| name.to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Replace the catalog names (e.g. after a detector swap). Settings for
    /// ids that no longer exist are dropped.
    pub fn replace_names(&mut self, names: Vec<String>) {
        let count = names.len() as u32;
        self.names = names;
        self.enabled.retain(|id| *id < count);
        self.thresholds.retain(|id, _| *id < count);
        self.custom_names.retain(|id, _| *id < count);
    }

    pub fn name(&self, class_id: u32) -> Option<&str> {
        self.names.get(class_id as usize).map(String::as_str)
    }

    /// Custom name, then catalog name, then `class_<id>`.
    pub fn display_name(&self, class_id: u32) -> String {
        if let Some(custom) = self.custom_names.get(&class_id) {
            return custom.clone();
        }
        self.name(class_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn is_enabled(&self, class_id: u32) -> bool {
        self.enabled.contains(&class_id)
    }

    pub fn threshold(&self, class_id: u32) -> f32 {
        self.thresholds
            .get(&class_id)
            .copied()
            .unwrap_or(DEFAULT_CONFIDENCE)
    }

    /// True when a box of this class and confidence should be processed.
    pub fn accepts(&self, class_id: u32, confidence: f32) -> bool {
        self.is_enabled(class_id) && confidence >= self.threshold(class_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = u32> + '_ {
        self.enabled.iter().copied()
    }

    pub fn thresholds(&self) -> &BTreeMap<u32, f32> {
        &self.thresholds
    }

    pub fn custom_names(&self) -> &BTreeMap<u32, String> {
        &self.custom_names
    }

    pub fn set_enabled<I: IntoIterator<Item = u32>>(&mut self, ids: I) -> Result<()> {
        let ids: BTreeSet<u32> = ids.into_iter().collect();
        for id in &ids {
            self.check_id(*id)?;
        }
        self.enabled = ids;
        Ok(())
    }

    pub fn set_threshold(&mut self, class_id: u32, threshold: f32) -> Result<()> {
        self.check_id(class_id)?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid_config(format!(
                "confidence threshold for class {class_id} must be in [0, 1], got {threshold}"
            )));
        }
        self.thresholds.insert(class_id, threshold);
        Ok(())
    }

    /// Set a display name override. An empty name removes the override.
    pub fn set_custom_name(&mut self, class_id: u32, name: &str) -> Result<()> {
        self.check_id(class_id)?;
        let name = name.trim();
        if name.is_empty() {
            self.custom_names.remove(&class_id);
        } else {
            self.custom_names.insert(class_id, name.to_string());
        }
        Ok(())
    }

    fn check_id(&self, class_id: u32) -> Result<()> {
        if (class_id as usize) < self.names.len() {
            Ok(())
        } else {
            Err(invalid_config(format!(
                "class id {} out of range (catalog has {} classes)",
                class_id,
                self.names.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_person_only() {
        let catalog = ClassCatalog::coco();
        assert_eq!(catalog.len(), 80);
        assert!(catalog.is_enabled(0));
        assert!(!catalog.is_enabled(2));
        assert_eq!(catalog.threshold(0), DEFAULT_CONFIDENCE);
        assert!(catalog.accepts(0, 0.25));
        assert!(!catalog.accepts(0, 0.2));
        assert!(!catalog.accepts(2, 0.99));
    }

    #[test]
    fn per_class_threshold_overrides_default() -> Result<()> {
        let mut catalog = ClassCatalog::coco();
        catalog.set_enabled([0, 2])?;
        catalog.set_threshold(2, 0.6)?;
        assert!(!catalog.accepts(2, 0.5));
        assert!(catalog.accepts(2, 0.6));
        assert!(catalog.set_threshold(2, 1.5).is_err());
        Ok(())
    }

    #[test]
    fn display_name_resolution_order() -> Result<()> {
        let mut catalog = ClassCatalog::coco();
        catalog.set_custom_name(0, "intruder")?;
        assert_eq!(catalog.display_name(0), "intruder");
        assert_eq!(catalog.display_name(2), "car");
        assert_eq!(catalog.display_name(500), "class_500");
        catalog.set_custom_name(0, "  ")?;
        assert_eq!(catalog.display_name(0), "person");
        Ok(())
    }

    #[test]
    fn out_of_range_ids_rejected() {
        let mut catalog = ClassCatalog::coco();
        assert!(catalog.set_enabled([0, 80]).is_err());
        assert!(catalog.is_enabled(0));
    }

    #[test]
    fn replacing_names_drops_stale_settings() -> Result<()> {
        let mut catalog = ClassCatalog::coco();
        catalog.set_enabled([0, 5])?;
        catalog.set_threshold(5, 0.4)?;
        catalog.replace_names(vec!["person".into(), "vehicle".into()]);
        assert!(catalog.is_enabled(0));
        assert!(!catalog.is_enabled(5));
        assert!(catalog.thresholds().is_empty());
        Ok(())
    }
}
