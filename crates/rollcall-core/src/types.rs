use serde::{Deserialize, Serialize};

/// Durable identifier for one physical person within a capture session.
///
/// Assigned monotonically starting at 1 and never reused; stable across
/// cycles for as long as the person keeps being matched.
pub type TrackId = u64;

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Axis-aligned rectangle in the detector's coordinate space (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Region {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle area; zero for degenerate (non-positive) dimensions.
    pub fn area(&self) -> f32 {
        if self.width <= 0.0 || self.height <= 0.0 {
            return 0.0;
        }
        self.width * self.height
    }
}

/// One face observed in the current cycle.
///
/// Produced fresh each cycle by the external detector; `track_id` is
/// populated by reconciliation. The `label` is whatever name the detector
/// assigned this frame — it may rename the same person frame to frame and
/// must never be used as an identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub region: Region,
    /// Ephemeral detector label, carried for display only.
    pub label: String,
    /// Optional emotion classification from the detector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    /// Durable identity, stamped by the reconciler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<TrackId>,
}

impl Detection {
    pub fn new(region: Region, label: impl Into<String>) -> Self {
        Self {
            region,
            label: label.into(),
            emotion: None,
            track_id: None,
        }
    }
}

/// The durable record of one believed physical person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    /// Region last observed for this person.
    pub region: Region,
    /// Timestamp of the last cycle this track was matched.
    pub last_seen: TimestampMs,
    /// Most recent ephemeral detector label, kept for display only.
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area() {
        let r = Region::new(0.0, 0.0, 10.0, 5.0);
        assert_eq!(r.area(), 50.0);
    }

    #[test]
    fn test_area_degenerate() {
        assert_eq!(Region::new(0.0, 0.0, 0.0, 10.0).area(), 0.0);
        assert_eq!(Region::new(0.0, 0.0, 10.0, -1.0).area(), 0.0);
    }

    #[test]
    fn test_detection_from_json() {
        // Shape the external detector hands over: no track_id yet.
        let det: Detection = serde_json::from_str(
            r#"{"region":{"x":1.0,"y":2.0,"width":10.0,"height":12.0},"label":"face_3","emotion":"happy"}"#,
        )
        .unwrap();
        assert_eq!(det.label, "face_3");
        assert_eq!(det.emotion.as_deref(), Some("happy"));
        assert_eq!(det.track_id, None);
        assert_eq!(det.region, Region::new(1.0, 2.0, 10.0, 12.0));
    }
}
