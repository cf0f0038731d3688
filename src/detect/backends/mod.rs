mod process;
mod stub;

pub use process::{ProcessDetector, ProcessDetectorConfig};
pub use stub::{DetectionScript, ScriptStep, ScriptedDetector, StubDetector};
