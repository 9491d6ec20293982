//! rollcall-core — track identity continuity for classroom attendance.
//!
//! Turns per-cycle face detections (unstable boxes, ephemeral detector
//! labels) into durable track identities, and gates attendance logging
//! on track identity plus a cooldown window.

pub mod attendance;
pub mod reconciler;
pub mod scorer;
pub mod types;

pub use attendance::AttendanceGate;
pub use reconciler::{ReconcilerConfig, TrackReconciler};
pub use types::{Detection, Region, TimestampMs, Track, TrackId};
