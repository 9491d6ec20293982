//! Track reconciler — matches per-cycle detections against the durable
//! track table so each physical person keeps one identifier over time.
//!
//! Matching is greedy: tracks pick their best detection in creation order,
//! so an older track wins any ambiguous detection outright. This is a
//! deliberate simplification of the assignment problem, not a
//! maximum-weight matching, and the test suite pins the greedy behavior.

use crate::scorer::overlap_score;
use crate::types::{Detection, TimestampMs, Track, TrackId};

/// Minimum overlap score (strictly exceeded) for a detection to refresh an
/// existing track.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.4;

/// How long an unmatched track survives before it is dropped for good.
pub const DEFAULT_INACTIVE_TIMEOUT_MS: TimestampMs = 20_000;

const FIRST_TRACK_ID: TrackId = 1;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// A detection matches a track only when `overlap_score` is strictly
    /// greater than this.
    pub match_threshold: f32,
    /// Unmatched tracks older than this (relative to `now`) are dropped.
    pub inactive_timeout_ms: TimestampMs,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            inactive_timeout_ms: DEFAULT_INACTIVE_TIMEOUT_MS,
        }
    }
}

/// Owns the track table and the monotone identifier counter for one
/// capture session.
///
/// The table is kept in track-creation order; `reconcile` replaces it
/// wholesale each cycle. One instance per camera session — state is never
/// shared between sessions.
pub struct TrackReconciler {
    config: ReconcilerConfig,
    tracks: Vec<Track>,
    next_id: TrackId,
}

impl Default for TrackReconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

impl TrackReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: FIRST_TRACK_ID,
        }
    }

    /// Reconcile one cycle of detections against the track table.
    ///
    /// Returns the detections with `track_id` stamped on every one of
    /// them; the table side effect is the union of refreshed matches,
    /// carried-forward survivors and newly created tracks. Never fails:
    /// malformed regions simply score 0 and spawn fresh tracks.
    pub fn reconcile(
        &mut self,
        mut detections: Vec<Detection>,
        now: TimestampMs,
    ) -> Vec<Detection> {
        let mut consumed = vec![false; detections.len()];
        // matched[track index] = index of the detection it claimed.
        let mut matched: Vec<Option<usize>> = vec![None; self.tracks.len()];

        // Greedy pass: each track, in creation order, claims its best
        // still-unclaimed detection. Older tracks therefore get first
        // pick of ambiguous detections.
        for (ti, track) in self.tracks.iter().enumerate() {
            let mut best: Option<(usize, f32)> = None;
            for (di, det) in detections.iter().enumerate() {
                if consumed[di] {
                    continue;
                }
                let score = overlap_score(&track.region, &det.region);
                // Strict inequality: a score equal to the threshold is
                // not a match.
                if score <= self.config.match_threshold {
                    continue;
                }
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((di, score));
                }
            }
            if let Some((di, score)) = best {
                consumed[di] = true;
                matched[ti] = Some(di);
                tracing::trace!(track = track.id, score, "detection matched");
            }
        }

        let mut next_table = Vec::with_capacity(self.tracks.len() + detections.len());

        for (ti, track) in self.tracks.iter().enumerate() {
            match matched[ti] {
                Some(di) => {
                    let det = &mut detections[di];
                    det.track_id = Some(track.id);
                    next_table.push(Track {
                        id: track.id,
                        region: det.region,
                        last_seen: now,
                        label: det.label.clone(),
                    });
                }
                // Unmatched but recent: carried forward unmodified so the
                // person survives brief occlusion or detector dropout.
                None if now - track.last_seen <= self.config.inactive_timeout_ms => {
                    next_table.push(track.clone());
                }
                None => {
                    tracing::debug!(
                        track = track.id,
                        idle_ms = now - track.last_seen,
                        "track expired"
                    );
                }
            }
        }

        // Every unclaimed detection is a person we have not seen before.
        for (di, det) in detections.iter_mut().enumerate() {
            if consumed[di] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            det.track_id = Some(id);
            next_table.push(Track {
                id,
                region: det.region,
                last_seen: now,
                label: det.label.clone(),
            });
            tracing::debug!(track = id, label = %det.label, "new track");
        }

        self.tracks = next_table;
        detections
    }

    /// Current track table, in creation order.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Hard reset for a session restart: drops every track and returns the
    /// identifier counter to its initial value.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = FIRST_TRACK_ID;
    }
}
