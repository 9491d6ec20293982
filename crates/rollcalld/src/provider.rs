//! Detection provider contract and the two bundled implementations.
//!
//! The daemon consumes face detection as a black box: something that,
//! given the current moment, produces a list of detections or fails.
//! Rate-limit failures are distinguished from everything else because the
//! session reacts to them differently (session-wide pause vs abandoning
//! a single cycle).

use std::future::Future;
use std::io::BufReader;
use std::path::Path;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use rollcall_core::{Detection, Region};

#[derive(Error, Debug)]
pub enum DetectError {
    /// The upstream detection service refused the call for quota reasons.
    /// The session pauses cycling for a fixed cooldown when it sees this.
    #[error("detection provider rate limited")]
    RateLimited,
    /// Any other failure; the cycle is abandoned and retried on the next tick.
    #[error("detection failed: {0}")]
    Provider(String),
}

/// Source of per-cycle face detections.
pub trait DetectionProvider: Send + 'static {
    /// Capture one frame and return its detections.
    ///
    /// May suspend for an arbitrary duration; the session guarantees at
    /// most one outstanding call at a time.
    fn detect(&mut self) -> impl Future<Output = Result<Vec<Detection>, DetectError>> + Send;
}

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("read script {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parse script: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One scripted cycle: either a detection list or a forced failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptFrame {
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Simulate a rate-limit rejection for this cycle.
    #[serde(default)]
    pub rate_limited: bool,
    /// Simulate a non-rate-limit failure with this message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Replays a JSON-scripted sequence of detection cycles.
///
/// The script is an array of [`ScriptFrame`]s consumed one per cycle; an
/// exhausted script reports an empty room from then on. Track ids are
/// assigned deterministically, so a script author can predict them and
/// bind enrollments up front.
pub struct ScriptedProvider {
    frames: std::vec::IntoIter<ScriptFrame>,
}

impl ScriptedProvider {
    pub fn from_path(path: &Path) -> Result<Self, ScriptError> {
        let file = std::fs::File::open(path).map_err(|source| ScriptError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let frames: Vec<ScriptFrame> = serde_json::from_reader(BufReader::new(file))?;
        Ok(Self::new(frames))
    }

    pub fn new(frames: Vec<ScriptFrame>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }

    /// Cycles remaining before the script runs out.
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl DetectionProvider for ScriptedProvider {
    async fn detect(&mut self) -> Result<Vec<Detection>, DetectError> {
        let Some(frame) = self.frames.next() else {
            return Ok(Vec::new());
        };
        if frame.rate_limited {
            return Err(DetectError::RateLimited);
        }
        if let Some(msg) = frame.error {
            return Err(DetectError::Provider(msg));
        }
        Ok(frame.detections)
    }
}

/// Simulated classroom: a fixed set of people whose boxes jitter a little
/// every cycle and who occasionally drop out of frame, with fresh
/// ephemeral labels each time (mimicking a detector that renames people
/// frame to frame).
pub struct SyntheticProvider {
    seats: Vec<Region>,
    jitter: f32,
    dropout: f64,
    cycle: u64,
}

impl SyntheticProvider {
    pub fn new(people: usize) -> Self {
        // Seat the class in a row of 100x100 boxes with a gap wide enough
        // that jittered neighbors never cross the match threshold.
        let seats = (0..people)
            .map(|i| Region::new(i as f32 * 250.0, 100.0, 100.0, 100.0))
            .collect();
        Self {
            seats,
            jitter: 8.0,
            dropout: 0.1,
            cycle: 0,
        }
    }
}

impl DetectionProvider for SyntheticProvider {
    async fn detect(&mut self) -> Result<Vec<Detection>, DetectError> {
        self.cycle += 1;
        let mut rng = rand::thread_rng();
        let mut detections = Vec::with_capacity(self.seats.len());
        for (i, seat) in self.seats.iter().enumerate() {
            if rng.gen_bool(self.dropout) {
                continue;
            }
            let region = Region::new(
                seat.x + rng.gen_range(-self.jitter..=self.jitter),
                seat.y + rng.gen_range(-self.jitter..=self.jitter),
                seat.width,
                seat.height,
            );
            // Label changes every cycle; only the track id is durable.
            detections.push(Detection::new(region, format!("face_{}_{}", self.cycle, i)));
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_frames_in_order() {
        let script = r#"[
            {"detections": [{"region": {"x": 0.0, "y": 0.0, "width": 10.0, "height": 10.0}, "label": "a"}]},
            {"rate_limited": true},
            {"error": "service unavailable"},
            {}
        ]"#;
        let frames: Vec<ScriptFrame> = serde_json::from_str(script).unwrap();
        let mut provider = ScriptedProvider::new(frames);

        let first = provider.detect().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].label, "a");

        assert!(matches!(
            provider.detect().await,
            Err(DetectError::RateLimited)
        ));
        assert!(matches!(
            provider.detect().await,
            Err(DetectError::Provider(msg)) if msg == "service unavailable"
        ));
        assert!(provider.detect().await.unwrap().is_empty());
        // Exhausted: empty room forever, never an error.
        assert!(provider.detect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_synthetic_boxes_stay_near_seats() {
        let mut provider = SyntheticProvider::new(3);
        for _ in 0..20 {
            let detections = provider.detect().await.unwrap();
            assert!(detections.len() <= 3);
            for det in &detections {
                // Jitter is bounded, so boxes never wander between seats.
                assert!(det.region.x >= -10.0 && det.region.x <= 520.0);
                assert_eq!(det.region.width, 100.0);
            }
        }
    }
}
