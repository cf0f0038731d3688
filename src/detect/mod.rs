mod backend;
mod backends;
mod classes;
mod handle;
mod result;

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

pub use backend::Detector;
pub use backends::{
    DetectionScript, ProcessDetector, ProcessDetectorConfig, ScriptStep, ScriptedDetector,
    StubDetector,
};
pub use classes::{ClassCatalog, COCO_CLASSES, DEFAULT_CONFIDENCE, DEFAULT_ENABLED_CLASS};
pub use handle::DetectorHandle;
pub use result::{DetectionBox, DetectionResult};

use crate::config::{DetectorBackendKind, DetectorSettings, MODEL_EXTENSIONS};
use crate::error::invalid_config;

/// Placeholder in detector arguments for the selected model's path.
pub const MODEL_PLACEHOLDER: &str = "{model}";

/// Build the detector described by resolved settings.
pub fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
    settings.validate()?;
    let model_path = settings.model_path();
    if let Some(path) = &model_path {
        if !path.is_file() {
            return Err(invalid_config(format!("model file not found: {}", path.display())));
        }
    }

    match settings.backend {
        DetectorBackendKind::Stub => Ok(Box::new(StubDetector::new())),
        DetectorBackendKind::Process => {
            let command = settings
                .command
                .clone()
                .ok_or_else(|| invalid_config("detector backend 'process' requires a command"))?;
            let model = model_path.map(|path| path.display().to_string());
            let args = settings
                .args
                .iter()
                .map(|arg| match &model {
                    Some(model) => arg.replace(MODEL_PLACEHOLDER, model),
                    None => arg.clone(),
                })
                .collect();
            Ok(Box::new(ProcessDetector::new(ProcessDetectorConfig {
                name: settings.name.clone(),
                command,
                args,
                response_timeout: settings.timeout,
            })))
        }
    }
}

/// One selectable model file.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: u64,
    pub size_mb: f64,
    pub current: bool,
}

/// Model files in `dir`, sorted by name. A missing directory lists nothing.
pub fn list_models(dir: &Path, current: Option<&str>) -> Result<Vec<ModelInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("read models dir {}", dir.display()))?;

    let mut models = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read models dir {}", dir.display()))?;
        let path = entry.path();
        let known = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MODEL_EXTENSIONS.contains(&ext));
        if !known || !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let size = entry
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        models.push(ModelInfo {
            current: current == Some(name.as_str()),
            size_mb: (size as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
            size,
            name,
        });
    }
    models.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_stub_by_default() -> Result<()> {
        let detector = build_detector(&DetectorSettings::default())?;
        assert_eq!(detector.name(), "stub");
        Ok(())
    }

    #[test]
    fn process_backend_needs_a_command() {
        let settings = DetectorSettings {
            backend: DetectorBackendKind::Process,
            ..DetectorSettings::default()
        };
        assert!(build_detector(&settings).is_err());
    }

    #[test]
    fn missing_model_file_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = DetectorSettings {
            models_dir: Some(dir.path().to_path_buf()),
            model: Some("absent.onnx".to_string()),
            ..DetectorSettings::default()
        };
        let err = build_detector(&settings).err().expect("missing model");
        assert!(err.to_string().contains("absent.onnx"));
        Ok(())
    }

    #[test]
    fn models_are_listed_by_extension() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("yolo-s.onnx"), vec![0u8; 2048])?;
        std::fs::write(dir.path().join("yolo-l.pt"), b"weights")?;
        std::fs::write(dir.path().join("notes.txt"), b"skip")?;

        let models = list_models(dir.path(), Some("yolo-s.onnx"))?;
        let names: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["yolo-l.pt", "yolo-s.onnx"]);
        assert!(!models[0].current);
        assert!(models[1].current);
        assert_eq!(models[1].size, 2048);

        assert!(list_models(&dir.path().join("missing"), None)?.is_empty());
        Ok(())
    }
}
