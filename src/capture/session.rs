//! Multi-sample capture session.
//!
//! ```text
//! Idle → AlgorithmSelection ─┬─(not selected)──────────────→ FailedToSelectAlgorithm
//!                            └→ Sampling → Aggregating ─┬──→ Successful
//!                                                       └──→ CalculationError
//! ```

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::aggregate::{aggregate, AggregatedResult};
use super::algorithm::{AlgorithmSelectionInput, AlgorithmSelectionStatus, VolumeAlgorithm};
use crate::config::AlgorithmConfig;
use crate::error::{AppResult, StationError};
use crate::result::CalculationStatus;
use crate::stream::{ColorImage, DepthMap};

/// Session progress, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Not started
    Idle,
    /// Waiting on algorithm selection
    AlgorithmSelection,
    /// Measuring frame pairs
    Sampling,
    /// Combining samples
    Aggregating,
    /// Done
    Finished(CalculationStatus),
}

/// Per-capture settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Frame pairs to measure
    pub required_sample_count: usize,
    /// Allow `Dm1`
    pub dm1_enabled: bool,
    /// Allow `Dm2`
    pub dm2_enabled: bool,
    /// Allow `Rgb`
    pub rgb_enabled: bool,
    /// Base name for algorithm debug output
    pub debug_file_name: String,
}

impl CaptureSettings {
    /// Settings from the algorithm section.
    pub fn from_config(config: &AlgorithmConfig, debug_file_name: impl Into<String>) -> Self {
        Self {
            required_sample_count: config.required_sample_count,
            dm1_enabled: config.dm1_enabled,
            dm2_enabled: config.dm2_enabled,
            rgb_enabled: config.rgb_enabled,
            debug_file_name: debug_file_name.into(),
        }
    }
}

/// What a capture produced.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    /// Aggregated dimensions when successful
    pub volume: Option<AggregatedResult>,
    /// Final status
    pub status: CalculationStatus,
    /// First color image of the capture
    pub object_photo: Arc<ColorImage>,
    /// Selection result
    pub algorithm: AlgorithmSelectionStatus,
    /// The distance hint took part in the measurement
    pub range_meter_used: bool,
    /// Frame pairs handed to the algorithm
    pub samples_taken: usize,
}

/// Runs one capture against a [`VolumeAlgorithm`].
pub struct VolumeCaptureSession {
    algorithm: Arc<dyn VolumeAlgorithm>,
}

impl VolumeCaptureSession {
    /// Session backed by `algorithm`.
    pub fn new(algorithm: Arc<dyn VolumeAlgorithm>) -> Self {
        Self { algorithm }
    }

    /// Select an algorithm with the first pair, measure up to `required_sample_count` pairs
    /// and aggregate them.
    ///
    /// # Errors
    ///
    /// `StationError::InvalidArgument` when either input list is empty. Algorithm failures
    /// are reported through [`CaptureOutcome::status`].
    pub fn calculate(
        &self,
        images: &[Arc<ColorImage>],
        depth_maps: &[Arc<DepthMap>],
        settings: &CaptureSettings,
        distance_hint: i16,
    ) -> AppResult<CaptureOutcome> {
        let (Some(first_image), Some(first_depth)) = (images.first(), depth_maps.first()) else {
            return Err(StationError::InvalidArgument(
                "not enough input frames".to_string(),
            ));
        };

        let mut state = CaptureState::Idle;
        transition(&mut state, CaptureState::AlgorithmSelection);
        let selection = self.algorithm.select_algorithm(&AlgorithmSelectionInput {
            depth_map: first_depth,
            image: first_image,
            distance_hint,
            dm1_enabled: settings.dm1_enabled,
            dm2_enabled: settings.dm2_enabled,
            rgb_enabled: settings.rgb_enabled,
            debug_file_name: &settings.debug_file_name,
        });
        log_selection(selection.status);

        if !selection.status.is_selected() {
            transition(
                &mut state,
                CaptureState::Finished(CalculationStatus::FailedToSelectAlgorithm),
            );
            return Ok(CaptureOutcome {
                volume: None,
                status: CalculationStatus::FailedToSelectAlgorithm,
                object_photo: first_image.clone(),
                algorithm: selection.status,
                range_meter_used: selection.range_meter_used,
                samples_taken: 0,
            });
        }

        transition(&mut state, CaptureState::Sampling);
        let available = images.len().min(depth_maps.len());
        let samples_taken = settings.required_sample_count.min(available);
        if samples_taken < settings.required_sample_count {
            warn!(
                required = settings.required_sample_count,
                available, "Fewer frame pairs than required samples"
            );
        }
        let samples: Vec<_> = images
            .iter()
            .zip(depth_maps)
            .take(samples_taken)
            .map(|(image, depth)| {
                self.algorithm
                    .calculate_volume(depth, image, distance_hint, selection.status)
            })
            .collect();

        transition(&mut state, CaptureState::Aggregating);
        let volume = aggregate(&samples);
        let status = if volume.is_some() {
            CalculationStatus::Successful
        } else {
            error!("Failed to aggregate calculation results: no valid samples");
            CalculationStatus::CalculationError
        };
        transition(&mut state, CaptureState::Finished(status));

        Ok(CaptureOutcome {
            volume,
            status,
            object_photo: first_image.clone(),
            algorithm: selection.status,
            range_meter_used: selection.range_meter_used,
            samples_taken,
        })
    }
}

fn transition(state: &mut CaptureState, next: CaptureState) {
    debug!(from = ?*state, to = ?next, "Capture state");
    *state = next;
}

fn log_selection(status: AlgorithmSelectionStatus) {
    match status {
        AlgorithmSelectionStatus::DataIsInvalid => {
            error!("Failed to select algorithm: data was invalid")
        }
        AlgorithmSelectionStatus::NoAlgorithmsAllowed => {
            error!("Failed to select algorithm: no modes were available")
        }
        AlgorithmSelectionStatus::NoObjectFound => {
            error!("Failed to select algorithm: no objects were found")
        }
        selected => info!(algorithm = ?selected, "Selected algorithm"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::algorithm::{AlgorithmSelection, ObjectVolume};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use parking_lot::Mutex;

    /// Replays scripted answers and counts calls.
    struct ScriptedAlgorithm {
        selection: AlgorithmSelectionStatus,
        volumes: Mutex<VecDeque<Option<ObjectVolume>>>,
        calls: AtomicUsize,
    }

    impl ScriptedAlgorithm {
        fn new(selection: AlgorithmSelectionStatus, volumes: Vec<Option<ObjectVolume>>) -> Arc<Self> {
            Arc::new(Self {
                selection,
                volumes: Mutex::new(volumes.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl VolumeAlgorithm for ScriptedAlgorithm {
        fn select_algorithm(&self, input: &AlgorithmSelectionInput<'_>) -> AlgorithmSelection {
            AlgorithmSelection {
                status: self.selection,
                range_meter_used: input.distance_hint > 0,
            }
        }

        fn calculate_volume(
            &self,
            _depth_map: &DepthMap,
            _image: &ColorImage,
            _distance_hint: i16,
            _algorithm: AlgorithmSelectionStatus,
        ) -> Option<ObjectVolume> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.volumes.lock().pop_front().flatten()
        }
    }

    fn frames(n: usize) -> (Vec<Arc<ColorImage>>, Vec<Arc<DepthMap>>) {
        (
            (0..n).map(|_| Arc::new(ColorImage::filled(4, 4, [0, 0, 0]))).collect(),
            (0..n).map(|_| Arc::new(DepthMap::flat(4, 4, 1000))).collect(),
        )
    }

    fn settings(required: usize) -> CaptureSettings {
        CaptureSettings {
            required_sample_count: required,
            dm1_enabled: true,
            dm2_enabled: true,
            rgb_enabled: true,
            debug_file_name: "test".into(),
        }
    }

    #[test]
    fn test_empty_input_is_argument_error() {
        let session = VolumeCaptureSession::new(ScriptedAlgorithm::new(
            AlgorithmSelectionStatus::Dm1,
            vec![],
        ));
        let (images, _) = frames(1);
        let err = session.calculate(&images, &[], &settings(1), 0).unwrap_err();
        assert!(matches!(err, StationError::InvalidArgument(_)));
    }

    #[test]
    fn test_successful_mode_aggregate() {
        let algorithm = ScriptedAlgorithm::new(
            AlgorithmSelectionStatus::Dm2,
            vec![
                Some(ObjectVolume::new(10, 20, 30)),
                Some(ObjectVolume::new(10, 20, 31)),
                Some(ObjectVolume::new(11, 20, 30)),
            ],
        );
        let session = VolumeCaptureSession::new(algorithm.clone());
        let (images, depths) = frames(3);

        let outcome = session.calculate(&images, &depths, &settings(3), 900).unwrap();
        assert_eq!(outcome.status, CalculationStatus::Successful);
        assert_eq!(outcome.volume.unwrap().volume, ObjectVolume::new(10, 20, 30));
        assert_eq!(outcome.algorithm, AlgorithmSelectionStatus::Dm2);
        assert!(outcome.range_meter_used);
        assert_eq!(outcome.samples_taken, 3);
        assert_eq!(algorithm.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_not_selected_consumes_no_samples() {
        let algorithm = ScriptedAlgorithm::new(AlgorithmSelectionStatus::NoObjectFound, vec![]);
        let session = VolumeCaptureSession::new(algorithm.clone());
        let (images, depths) = frames(3);

        let outcome = session.calculate(&images, &depths, &settings(3), 0).unwrap();
        assert_eq!(outcome.status, CalculationStatus::FailedToSelectAlgorithm);
        assert!(outcome.volume.is_none());
        assert!(Arc::ptr_eq(&outcome.object_photo, &images[0]));
        assert_eq!(outcome.samples_taken, 0);
        assert_eq!(algorithm.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_all_samples_failing_is_calculation_error() {
        let algorithm = ScriptedAlgorithm::new(AlgorithmSelectionStatus::Rgb, vec![None, None]);
        let session = VolumeCaptureSession::new(algorithm);
        let (images, depths) = frames(2);

        let outcome = session.calculate(&images, &depths, &settings(2), 0).unwrap();
        assert_eq!(outcome.status, CalculationStatus::CalculationError);
        assert!(outcome.volume.is_none());
    }

    #[test]
    fn test_short_input_limits_samples() {
        let algorithm = ScriptedAlgorithm::new(
            AlgorithmSelectionStatus::Dm1,
            vec![Some(ObjectVolume::new(1, 1, 1)); 5],
        );
        let session = VolumeCaptureSession::new(algorithm.clone());
        let (images, depths) = frames(2);

        let outcome = session.calculate(&images, &depths, &settings(5), 0).unwrap();
        assert_eq!(outcome.samples_taken, 2);
        assert_eq!(algorithm.calls.load(Ordering::SeqCst), 2);
    }
}
