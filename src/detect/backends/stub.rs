use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};

use crate::detect::backend::Detector;
use crate::detect::result::DetectionResult;
use crate::frame::Frame;

/// Detector that never detects anything.
#[derive(Debug, Default)]
pub struct StubDetector;

impl StubDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &str {
        "stub"
    }

    fn track(&mut self, _frame: &Frame, _persist: bool) -> Result<DetectionResult> {
        Ok(DetectionResult::empty())
    }
}

/// One queued response for `ScriptedDetector`.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Result(DetectionResult),
    Fail(String),
}

/// Shared queue feeding a `ScriptedDetector`; tests keep a clone to push
/// responses while the pipeline runs.
#[derive(Clone, Debug, Default)]
pub struct DetectionScript {
    steps: Arc<Mutex<VecDeque<ScriptStep>>>,
    /// Returned once the queue is drained.
    fallback: Arc<Mutex<DetectionResult>>,
    calls: Arc<Mutex<u64>>,
    resets: Arc<Mutex<u64>>,
}

impl DetectionScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: DetectionResult) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ScriptStep::Result(result));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ScriptStep::Fail(message.into()));
    }

    /// Result returned on every call after the queue is drained.
    pub fn set_fallback(&self, result: DetectionResult) {
        *self.fallback.lock().unwrap_or_else(PoisonError::into_inner) = result;
    }

    pub fn calls(&self) -> u64 {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resets(&self) -> u64 {
        *self.resets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next(&self) -> ScriptStep {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let queued = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        queued.unwrap_or_else(|| {
            ScriptStep::Result(
                self.fallback
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            )
        })
    }
}

/// Detector replaying a `DetectionScript`.
#[derive(Debug)]
pub struct ScriptedDetector {
    name: String,
    script: DetectionScript,
    class_names: Option<Vec<String>>,
}

impl ScriptedDetector {
    pub fn new(script: DetectionScript) -> Self {
        Self {
            name: "scripted".to_string(),
            script,
            class_names: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        self.class_names = Some(names);
        self
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn track(&mut self, _frame: &Frame, _persist: bool) -> Result<DetectionResult> {
        match self.script.next() {
            ScriptStep::Result(result) => Ok(result),
            ScriptStep::Fail(message) => Err(anyhow!(message)),
        }
    }

    fn reset(&mut self) -> Result<()> {
        *self
            .script
            .resets
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn class_names(&self) -> Option<Vec<String>> {
        self.class_names.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::DetectionBox;
    use crate::zone::BoundingBox;

    fn frame() -> Frame {
        Frame::new(1, 2, 2, vec![0; 12])
    }

    #[test]
    fn scripted_replays_then_falls_back() -> Result<()> {
        let script = DetectionScript::new();
        let person = DetectionBox::new(Some(1), 0, 0.9, BoundingBox::new(0.0, 0.0, 4.0, 4.0));
        script.push(DetectionResult::new(vec![person.clone()]));
        script.push_failure("model crashed");

        let mut detector = ScriptedDetector::new(script.clone());
        assert_eq!(detector.track(&frame(), true)?.boxes, vec![person]);
        assert!(detector.track(&frame(), true).is_err());
        assert!(detector.track(&frame(), true)?.boxes.is_empty());
        assert_eq!(script.calls(), 3);
        Ok(())
    }

    #[test]
    fn stub_never_detects() -> Result<()> {
        let mut detector = StubDetector::new();
        assert!(detector.track(&frame(), true)?.boxes.is_empty());
        Ok(())
    }
}
