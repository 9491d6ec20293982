//! Similarity scorer — intersection-over-union between two face regions.

use crate::types::Region;

/// Compute the overlap score (IoU) of two regions.
///
/// Returns a value in [0, 1]. Higher = more overlap. Degenerate regions
/// (non-positive width or height on either side) score 0, never an error,
/// and a non-finite ratio is normalized to 0. Symmetric in its arguments.
pub fn overlap_score(a: &Region, b: &Region) -> f32 {
    if a.width <= 0.0 || a.height <= 0.0 || b.width <= 0.0 || b.height <= 0.0 {
        return 0.0;
    }

    let ix = (a.x + a.width).min(b.x + b.width) - a.x.max(b.x);
    let iy = (a.y + a.height).min(b.y + b.height) - a.y.max(b.y);
    if ix <= 0.0 || iy <= 0.0 {
        return 0.0;
    }

    let intersection = ix * iy;
    let union = a.area() + b.area() - intersection;
    let score = intersection / union;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
