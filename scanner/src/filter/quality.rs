use qrscan_common::config::DEFAULT_MIN_AREA_FRACTION;
use qrscan_common::detection::{Candidate, RejectReason};
use tracing::{debug, warn};

use super::traits::DetectionFilter;

/// Geometric false-positive filter.
///
/// Noise and heavy distortion tend to decode as tiny symbols, so a candidate
/// is only trusted when `top_edge * left_edge` covers at least
/// `min_area_fraction` of the frame. The bound is inclusive: a candidate
/// exactly at the threshold is accepted.
#[derive(Debug, Clone, Copy)]
pub struct QualityFilter {
    min_area_fraction: f64,
}

impl QualityFilter {
    pub fn new(min_area_fraction: f64) -> Self {
        if !min_area_fraction.is_finite() || min_area_fraction < 0.0 {
            warn!(
                min_area_fraction,
                fallback = DEFAULT_MIN_AREA_FRACTION,
                "invalid minimum area fraction, using default"
            );
            return Self::default();
        }
        Self { min_area_fraction }
    }

    pub fn min_area_fraction(&self) -> f64 {
        self.min_area_fraction
    }

    /// Fraction of the frame covered by the candidate's geometry.
    /// Zero-sized frames yield 0.
    pub fn area_ratio(candidate: &Candidate, width: u32, height: u32) -> f64 {
        let frame_area = width as f64 * height as f64;
        if frame_area <= 0.0 {
            return 0.0;
        }
        candidate.geometry.approx_area() / frame_area
    }
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self {
            min_area_fraction: DEFAULT_MIN_AREA_FRACTION,
        }
    }
}

impl DetectionFilter for QualityFilter {
    fn check(&self, candidate: &Candidate, width: u32, height: u32) -> Result<(), RejectReason> {
        let ratio = Self::area_ratio(candidate, width, height);
        let accepted = ratio >= self.min_area_fraction && ratio > 0.0;
        debug!(
            ratio = format!("{:.5}", ratio),
            threshold = format!("{:.5}", self.min_area_fraction),
            accepted,
            "symbol area check"
        );
        if accepted {
            Ok(())
        } else {
            Err(RejectReason::TooSmall)
        }
    }

    fn name(&self) -> &str {
        "quality"
    }
}
