use anyhow::Result;

use crate::detect::result::DetectionResult;
use crate::frame::Frame;

/// Object detector with tracking.
///
/// Tracking state lives in the detector: consecutive `track` calls with
/// `persist` set keep track ids stable until `reset` is called. Callers
/// serialise access through `DetectorHandle`, so implementations never see
/// concurrent calls.
pub trait Detector: Send {
    /// Short identifier used in status and logs.
    fn name(&self) -> &str;

    /// Detect and track objects in one frame.
    ///
    /// Implementations must treat the frame as read-only.
    fn track(&mut self, frame: &Frame, persist: bool) -> Result<DetectionResult>;

    /// Drop all tracking state.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Class names indexed by class id, when the model provides them.
    fn class_names(&self) -> Option<Vec<String>> {
        None
    }

    /// Optional warm-up hook, called once before the first `track`.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
