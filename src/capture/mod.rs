//! Volume capture: frame collection, the algorithm boundary, and sample aggregation.

pub mod aggregate;
pub mod algorithm;
pub mod collector;
pub mod session;

pub use aggregate::{aggregate, mode, AggregatedResult, AxisSpread};
pub use algorithm::{
    AlgorithmSelection, AlgorithmSelectionInput, AlgorithmSelectionStatus, BoundingBoxAlgorithm,
    ObjectVolume, VolumeAlgorithm,
};
pub use collector::{CollectedFrames, FrameCollector, DEFAULT_FRAME_TIMEOUT};
pub use session::{CaptureOutcome, CaptureSettings, CaptureState, VolumeCaptureSession};

use tracing::{error, info};

/// Distance hint for the algorithm from a range meter reading.
///
/// `reading + correction` when it fits in `i16` and is not below the floor; 0 (no hint)
/// otherwise, including when there is no range meter or the reading failed.
pub fn distance_hint(reading: Option<i64>, correction_mm: i32, floor_depth_mm: i16) -> i16 {
    let Some(reading) = reading else {
        info!("Range meter is not enabled, using depth calculation");
        return 0;
    };
    if reading < 0 {
        error!(reading, "Failed to get proper range meter reading, using depth calculation");
        return 0;
    }

    let corrected = reading + i64::from(correction_mm);
    let in_range = corrected > i64::from(i16::MIN) && corrected < i64::from(i16::MAX);
    let hint = if in_range { corrected as i16 } else { 0 };
    info!(reading = corrected, floor_depth_mm, "Range meter reading");

    if i32::from(floor_depth_mm) - i32::from(hint) < 0 {
        error!("Range meter reading was below floor depth");
        return 0;
    }
    if hint <= 0 {
        error!("Failed to get proper range meter reading, using depth calculation");
        return 0;
    }
    hint
}
