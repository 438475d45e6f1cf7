pub mod quality;
pub mod traits;

pub use quality::QualityFilter;
pub use traits::DetectionFilter;
