use std::path::PathBuf;

use tokio::time::Duration;

use rollcall_core::{ReconcilerConfig, TimestampMs};

use crate::session::SessionConfig;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Milliseconds between analysis cycles.
    pub period_ms: u64,
    /// Minimum overlap score (strict) to keep a track's identity.
    pub match_threshold: f32,
    /// Unmatched tracks older than this are dropped.
    pub inactive_timeout_ms: TimestampMs,
    /// Cooldown between attendance records for the same track.
    pub log_cooldown_ms: TimestampMs,
    /// Session-wide pause after a rate-limit failure.
    pub rate_limit_pause_ms: u64,
    /// Optional detection script to replay instead of the synthetic room.
    pub script_path: Option<PathBuf>,
    /// Number of simulated people when no script is given.
    pub synthetic_people: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            period_ms: env_u64("ROLLCALL_PERIOD_MS", 5000),
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", 0.4),
            inactive_timeout_ms: env_i64("ROLLCALL_INACTIVE_TIMEOUT_MS", 20_000),
            log_cooldown_ms: env_i64("ROLLCALL_LOG_COOLDOWN_MS", 300_000),
            rate_limit_pause_ms: env_u64("ROLLCALL_RATE_LIMIT_PAUSE_MS", 61_000),
            script_path: std::env::var("ROLLCALL_SCRIPT").ok().map(PathBuf::from),
            synthetic_people: env_usize("ROLLCALL_SYNTHETIC_PEOPLE", 3),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            period: Duration::from_millis(self.period_ms),
            rate_limit_pause: Duration::from_millis(self.rate_limit_pause_ms),
            reconciler: ReconcilerConfig {
                match_threshold: self.match_threshold,
                inactive_timeout_ms: self.inactive_timeout_ms,
            },
            log_cooldown_ms: self.log_cooldown_ms,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
