//! Debounced attendance gating.
//!
//! A person standing in front of the camera is detected every cycle, but
//! their attendance should be recorded once per cooldown window, not once
//! per cycle. The gate keeps the last-logged timestamp per track and only
//! lets an emission through when the window has fully elapsed.

use std::collections::HashMap;

use crate::types::{TimestampMs, TrackId};

/// Default cooldown between attendance records for the same track: 5 minutes.
pub const DEFAULT_LOG_COOLDOWN_MS: TimestampMs = 5 * 60 * 1000;

/// Last-logged registry with a fixed cooldown window.
///
/// Callers are expected to consult their enrollment mapping first; the
/// gate itself only answers "has this track been logged too recently".
/// Each track debounces independently.
pub struct AttendanceGate {
    cooldown_ms: TimestampMs,
    last_logged: HashMap<TrackId, TimestampMs>,
}

impl Default for AttendanceGate {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_COOLDOWN_MS)
    }
}

impl AttendanceGate {
    pub fn new(cooldown_ms: TimestampMs) -> Self {
        Self {
            cooldown_ms,
            last_logged: HashMap::new(),
        }
    }

    /// Decide whether to record attendance for `track_id` at `now`.
    ///
    /// Returns true (and stamps the registry) iff the track was never
    /// logged or the elapsed time strictly exceeds the cooldown.
    pub fn try_emit(&mut self, track_id: TrackId, now: TimestampMs) -> bool {
        if let Some(&last) = self.last_logged.get(&track_id) {
            if now - last <= self.cooldown_ms {
                return false;
            }
        }
        self.last_logged.insert(track_id, now);
        true
    }

    /// When `track_id` was last logged, if ever.
    pub fn last_logged(&self, track_id: TrackId) -> Option<TimestampMs> {
        self.last_logged.get(&track_id).copied()
    }

    /// Hard reset for a session restart; track ids are about to be
    /// reassigned, so the registry keyed by them is meaningless.
    pub fn reset(&mut self) {
        self.last_logged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_emission_allowed() {
        let mut gate = AttendanceGate::default();
        assert!(gate.try_emit(1, 1000));
        assert_eq!(gate.last_logged(1), Some(1000));
    }

    #[test]
    fn test_repeat_within_cooldown_suppressed() {
        let mut gate = AttendanceGate::default();
        assert!(gate.try_emit(1, 0));
        assert!(!gate.try_emit(1, 1000));
        assert!(!gate.try_emit(1, 299_999));
        // Registry keeps the original stamp while suppressed.
        assert_eq!(gate.last_logged(1), Some(0));
    }

    #[test]
    fn test_cooldown_boundary_is_strict() {
        let mut gate = AttendanceGate::default();
        assert!(gate.try_emit(1, 0));
        // Exactly 5 minutes: still suppressed.
        assert!(!gate.try_emit(1, 300_000));
        // 5 minutes + 1 ms: allowed, registry restamped.
        assert!(gate.try_emit(1, 300_001));
        assert_eq!(gate.last_logged(1), Some(300_001));
    }

    #[test]
    fn test_tracks_debounce_independently() {
        let mut gate = AttendanceGate::default();
        assert!(gate.try_emit(1, 0));
        // A different person in the same frame is not affected.
        assert!(gate.try_emit(2, 0));
        assert!(!gate.try_emit(1, 10_000));
        assert!(!gate.try_emit(2, 10_000));
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut gate = AttendanceGate::default();
        assert!(gate.try_emit(1, 0));
        gate.reset();
        assert_eq!(gate.last_logged(1), None);
        assert!(gate.try_emit(1, 1));
    }

    #[test]
    fn test_custom_cooldown() {
        let mut gate = AttendanceGate::new(1000);
        assert!(gate.try_emit(7, 0));
        assert!(!gate.try_emit(7, 1000));
        assert!(gate.try_emit(7, 1001));
    }
}
