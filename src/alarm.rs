//! Debounced alarm decisions over (track, class, zone) keys.
//!
//! `AlarmEngine::evaluate` is a pure decision: it performs no I/O and takes
//! the current instant from the caller, so it can be driven with synthetic
//! time in tests.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of one alarm lineage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AlarmKey {
    /// A tracked object inside a zone.
    Object {
        track_id: u64,
        class_id: u32,
        zone_id: String,
    },
    /// A system-level alarm such as `camera_offline_<ip>`.
    Named(String),
}

impl AlarmKey {
    pub fn object(track_id: u64, class_id: u32, zone_id: impl Into<String>) -> Self {
        Self::Object {
            track_id,
            class_id,
            zone_id: zone_id.into(),
        }
    }

    pub fn camera_offline(ip: &str) -> Self {
        Self::Named(format!("camera_offline_{ip}"))
    }

    pub fn zone_id(&self) -> Option<&str> {
        match self {
            Self::Object { zone_id, .. } => Some(zone_id),
            Self::Named(_) => None,
        }
    }
}

impl fmt::Display for AlarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object {
                track_id,
                class_id,
                zone_id,
            } => write!(f, "{track_id}_{class_id}_{zone_id}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmState {
    LastFiredAt(Instant),
    /// Fired under the once-per-id policy; never re-arms.
    PermanentlyFired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmPolicy {
    OncePerId,
    Debounce(Duration),
}

#[derive(Debug, Default)]
pub struct AlarmEngine {
    states: HashMap<AlarmKey, AlarmState>,
}

impl AlarmEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `key` fires a new alarm at `now`, recording the firing.
    pub fn evaluate(&mut self, key: AlarmKey, policy: AlarmPolicy, now: Instant) -> bool {
        match policy {
            AlarmPolicy::OncePerId => {
                if self.states.contains_key(&key) {
                    return false;
                }
                self.states.insert(key, AlarmState::PermanentlyFired);
                true
            }
            AlarmPolicy::Debounce(window) => {
                match self.states.get(&key) {
                    Some(AlarmState::PermanentlyFired) => return false,
                    Some(AlarmState::LastFiredAt(last)) => {
                        if now.saturating_duration_since(*last) < window {
                            return false;
                        }
                    }
                    None => {}
                }
                self.states.insert(key, AlarmState::LastFiredAt(now));
                true
            }
        }
    }

    pub fn state(&self, key: &AlarmKey) -> Option<AlarmState> {
        self.states.get(key).copied()
    }

    /// Drop every entry referencing `zone_id`. Returns how many were removed.
    pub fn clear_zone(&mut self, zone_id: &str) -> usize {
        let before = self.states.len();
        self.states.retain(|key, _| key.zone_id() != Some(zone_id));
        before - self.states.len()
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }

    /// Drop debounce entries whose window has elapsed. Permanent entries stay.
    pub fn prune(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| match state {
            AlarmState::PermanentlyFired => true,
            AlarmState::LastFiredAt(last) => now.saturating_duration_since(*last) < window,
        });
        before - self.states.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
