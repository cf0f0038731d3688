use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};

use crate::detect::backend::Detector;
use crate::detect::result::DetectionResult;
use crate::error::PipelineError;
use crate::frame::Frame;

/// Shared, exclusive access to the active detector.
///
/// Inference and swapping take the same lock, so a swap waits for any
/// in-flight `track` call and the outgoing detector is never used again.
#[derive(Clone, Default)]
pub struct DetectorHandle {
    inner: Arc<Mutex<Option<Box<dyn Detector>>>>,
}

impl DetectorHandle {
    pub fn new(detector: Box<dyn Detector>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(detector))),
        }
    }

    /// A handle with no detector; the worker idles until one is installed.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn name(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|detector| detector.name().to_string())
    }

    pub fn class_names(&self) -> Option<Vec<String>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|detector| detector.class_names())
    }

    /// Run one tracking call. Returns `Ok(None)` when no detector is loaded.
    pub fn track(&self, frame: &Frame) -> Result<Option<DetectionResult>> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(detector) = guard.as_mut() else {
            return Ok(None);
        };
        detector
            .track(frame, true)
            .map(Some)
            .map_err(|e| PipelineError::DetectionFailure(format!("{}: {e:#}", detector.name())).into())
    }

    /// Install a new detector, resetting and returning the old one's name.
    ///
    /// The replacement is warmed up before the lock is taken so inference is
    /// only paused for the exchange itself.
    pub fn swap(&self, mut detector: Box<dyn Detector>) -> Result<Option<String>> {
        detector
            .warm_up()
            .map_err(|e| anyhow!("warm-up of detector '{}' failed: {e:#}", detector.name()))?;

        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = guard.replace(detector);
        drop(guard);

        Ok(previous.map(|mut old| {
            let name = old.name().to_string();
            if let Err(e) = old.reset() {
                log::warn!("reset of outgoing detector '{name}' failed: {e:#}");
            }
            name
        }))
    }

    /// Drop tracking state of the active detector.
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(detector) => detector.reset(),
            None => Ok(()),
        }
    }

    pub fn unload(&self) -> Option<String> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.take().map(|detector| detector.name().to_string())
    }
}
