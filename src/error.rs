//! Error taxonomy for the analytics pipeline.
//!
//! Core loops never propagate these past their own cycle: a failure is logged
//! and the loop continues. Callers of the control surface receive them wrapped
//! in `anyhow::Error` and may recover the variant with `downcast_ref`.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// Connect or read failure on the video source. Retried with backoff.
    SourceUnavailable(String),
    /// The detector call failed. The cycle is skipped.
    DetectionFailure(String),
    /// An external process failed to start, stop, or exited non-zero.
    ProcessSupervision(String),
    /// A zone was rejected at the config boundary.
    ZoneValidation(String),
    /// A configuration value was rejected at the config boundary.
    ConfigValidation(String),
    /// The supervised process is already running.
    AlreadyActive(&'static str),
    /// The supervised process is not running.
    NotActive(&'static str),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            Self::DetectionFailure(_) => "DETECTION_FAILURE",
            Self::ProcessSupervision(_) => "PROCESS_SUPERVISION_FAILURE",
            Self::ZoneValidation(_) => "ZONE_VALIDATION",
            Self::ConfigValidation(_) => "CONFIG_VALIDATION",
            Self::AlreadyActive(_) => "ALREADY_ACTIVE",
            Self::NotActive(_) => "NOT_ACTIVE",
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceUnavailable(msg)
            | Self::DetectionFailure(msg)
            | Self::ProcessSupervision(msg)
            | Self::ZoneValidation(msg)
            | Self::ConfigValidation(msg) => write!(f, "{}: {}", self.code(), msg),
            Self::AlreadyActive(what) => write!(f, "{}: {} already active", self.code(), what),
            Self::NotActive(what) => write!(f, "{}: {} not active", self.code(), what),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Shorthand for a `ConfigValidation` error wrapped in `anyhow`.
pub(crate) fn invalid_config(msg: impl Into<String>) -> anyhow::Error {
    PipelineError::ConfigValidation(msg.into()).into()
}

/// Shorthand for a `ZoneValidation` error wrapped in `anyhow`.
pub(crate) fn invalid_zone(msg: impl Into<String>) -> anyhow::Error {
    PipelineError::ZoneValidation(msg.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = PipelineError::ZoneValidation("need 3 points".to_string());
        assert_eq!(format!("{err}"), "ZONE_VALIDATION: need 3 points");
        let err = PipelineError::AlreadyActive("recording");
        assert_eq!(format!("{err}"), "ALREADY_ACTIVE: recording already active");
    }

    #[test]
    fn variant_survives_anyhow_roundtrip() {
        let err = invalid_config("debounce must be >= 0");
        let inner = err.downcast_ref::<PipelineError>().expect("typed error");
        assert_eq!(inner.code(), "CONFIG_VALIDATION");
    }
}
