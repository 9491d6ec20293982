//! rollcalld — attendance daemon built on the rollcall-core engine.
//!
//! One capture session per camera: a timer-driven loop that asks a
//! detection provider for the current frame's faces, reconciles them into
//! durable tracks, and emits debounced attendance records for enrolled
//! tracks.

pub mod config;
pub mod provider;
pub mod session;

pub use provider::{DetectError, DetectionProvider, ScriptedProvider, SyntheticProvider};
pub use session::{spawn_session, AttendanceRecord, FrameSnapshot, SessionConfig, SessionHandle};
