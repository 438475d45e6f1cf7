use qrscan_common::detection::{Candidate, RejectReason};

/// Trust check applied to a candidate detection before deduplication.
///
/// Implementations receive the candidate and the size of the frame it was
/// decoded from, and must be deterministic for the same inputs.
pub trait DetectionFilter: Send + Sync {
    /// Returns `Ok(())` to keep the candidate, or the reason it was dropped.
    fn check(&self, candidate: &Candidate, width: u32, height: u32) -> Result<(), RejectReason>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
