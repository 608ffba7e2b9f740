//! Volume algorithm boundary.
//!
//! The station treats the depth-processing routine as an opaque pair of calls:
//! pick an algorithm for the scene, then measure one depth/color pair with it.
//! [`BoundingBoxAlgorithm`] is the bundled implementation used with the fake camera.

use serde::{Deserialize, Serialize};

use crate::config::AlgorithmConfig;
use crate::stream::{ColorImage, DepthMap};

/// Result of algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlgorithmSelectionStatus {
    /// Frames were malformed or mismatched
    DataIsInvalid,
    /// Every algorithm is disabled
    NoAlgorithmsAllowed,
    /// Nothing above the floor
    NoObjectFound,
    /// Depth-only, object top from the depth map
    Dm1,
    /// Depth-only, alternative contour search
    Dm2,
    /// Color-assisted contour search
    Rgb,
}

impl AlgorithmSelectionStatus {
    /// True when an algorithm was chosen.
    pub fn is_selected(&self) -> bool {
        matches!(self, Self::Dm1 | Self::Dm2 | Self::Rgb)
    }
}

/// Inputs for algorithm selection.
#[derive(Debug, Clone, Copy)]
pub struct AlgorithmSelectionInput<'a> {
    /// First depth map of the capture
    pub depth_map: &'a DepthMap,
    /// First color image of the capture
    pub image: &'a ColorImage,
    /// Range meter distance to the object top, 0 when unknown
    pub distance_hint: i16,
    /// Allow `Dm1`
    pub dm1_enabled: bool,
    /// Allow `Dm2`
    pub dm2_enabled: bool,
    /// Allow `Rgb`
    pub rgb_enabled: bool,
    /// Base name for any debug output the algorithm writes
    pub debug_file_name: &'a str,
}

/// Selection answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmSelection {
    /// Chosen algorithm or the reason none was chosen
    pub status: AlgorithmSelectionStatus,
    /// The distance hint was used
    pub range_meter_used: bool,
}

/// Dimensions of one measured object, millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ObjectVolume {
    /// Longer side of the footprint
    pub length_mm: i32,
    /// Shorter side of the footprint
    pub width_mm: i32,
    /// Height above the floor
    pub height_mm: i32,
}

impl ObjectVolume {
    /// Create a volume.
    pub const fn new(length_mm: i32, width_mm: i32, height_mm: i32) -> Self {
        Self {
            length_mm,
            width_mm,
            height_mm,
        }
    }

    /// Volume in cubic millimetres.
    pub fn volume_mm3(&self) -> i64 {
        i64::from(self.length_mm) * i64::from(self.width_mm) * i64::from(self.height_mm)
    }
}

/// The depth-processing boundary. Calls are synchronous and bounded.
pub trait VolumeAlgorithm: Send + Sync {
    /// Choose an algorithm for the scene.
    fn select_algorithm(&self, input: &AlgorithmSelectionInput<'_>) -> AlgorithmSelection;

    /// Measure one frame pair, `None` when the frame could not be measured.
    fn calculate_volume(
        &self,
        depth_map: &DepthMap,
        image: &ColorImage,
        distance_hint: i16,
        algorithm: AlgorithmSelectionStatus,
    ) -> Option<ObjectVolume>;
}

/// Axis-aligned bounding box of everything closer than the floor cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBoxAlgorithm {
    /// Distance from the camera to the empty floor
    pub floor_depth_mm: i16,
    /// Points within this distance of the floor count as floor
    pub cutoff_depth_mm: i16,
    /// Footprint of one pixel at one metre
    pub mm_per_pixel_at_1m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObjectBox {
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
    closest_mm: i16,
}

impl BoundingBoxAlgorithm {
    /// Parameters from the algorithm section.
    pub fn from_config(config: &AlgorithmConfig) -> Self {
        Self {
            floor_depth_mm: config.floor_depth_mm,
            cutoff_depth_mm: config.cutoff_depth_mm,
            mm_per_pixel_at_1m: config.mm_per_pixel_at_1m,
        }
    }

    fn is_valid(depth_map: &DepthMap, image: &ColorImage) -> bool {
        !depth_map.is_empty()
            && depth_map.len() == depth_map.width as usize * depth_map.height as usize
            && depth_map.width == image.width
            && depth_map.height == image.height
    }

    fn find_object(&self, depth_map: &DepthMap) -> Option<ObjectBox> {
        let threshold = self.floor_depth_mm.saturating_sub(self.cutoff_depth_mm);
        let mut found: Option<ObjectBox> = None;
        for y in 0..depth_map.height {
            for x in 0..depth_map.width {
                let Some(depth) = depth_map.at(x, y) else {
                    continue;
                };
                if depth <= 0 || depth >= threshold {
                    continue;
                }
                found = Some(match found {
                    None => ObjectBox {
                        left: x,
                        top: y,
                        right: x,
                        bottom: y,
                        closest_mm: depth,
                    },
                    Some(b) => ObjectBox {
                        left: b.left.min(x),
                        top: b.top.min(y),
                        right: b.right.max(x),
                        bottom: b.bottom.max(y),
                        closest_mm: b.closest_mm.min(depth),
                    },
                });
            }
        }
        found
    }
}

impl VolumeAlgorithm for BoundingBoxAlgorithm {
    fn select_algorithm(&self, input: &AlgorithmSelectionInput<'_>) -> AlgorithmSelection {
        let range_meter_used = input.distance_hint > 0;
        let status = if !Self::is_valid(input.depth_map, input.image) {
            AlgorithmSelectionStatus::DataIsInvalid
        } else if !(input.dm1_enabled || input.dm2_enabled || input.rgb_enabled) {
            AlgorithmSelectionStatus::NoAlgorithmsAllowed
        } else if self.find_object(input.depth_map).is_none() {
            AlgorithmSelectionStatus::NoObjectFound
        } else if input.dm1_enabled {
            AlgorithmSelectionStatus::Dm1
        } else if input.dm2_enabled {
            AlgorithmSelectionStatus::Dm2
        } else {
            AlgorithmSelectionStatus::Rgb
        };
        AlgorithmSelection {
            status,
            range_meter_used: range_meter_used && status.is_selected(),
        }
    }

    fn calculate_volume(
        &self,
        depth_map: &DepthMap,
        image: &ColorImage,
        distance_hint: i16,
        algorithm: AlgorithmSelectionStatus,
    ) -> Option<ObjectVolume> {
        if !algorithm.is_selected() || !Self::is_valid(depth_map, image) {
            return None;
        }
        let object = self.find_object(depth_map)?;
        let top_mm = if distance_hint > 0 {
            distance_hint
        } else {
            object.closest_mm
        };

        let scale = self.mm_per_pixel_at_1m * f64::from(top_mm) / 1000.0;
        let box_w = f64::from(object.right - object.left + 1) * scale;
        let box_h = f64::from(object.bottom - object.top + 1) * scale;
        let height = i32::from(self.floor_depth_mm) - i32::from(top_mm);

        Some(ObjectVolume::new(
            box_w.max(box_h).round() as i32,
            box_w.min(box_h).round() as i32,
            height.max(0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::FakeSceneConfig;

    fn algorithm() -> BoundingBoxAlgorithm {
        BoundingBoxAlgorithm {
            floor_depth_mm: 1500,
            cutoff_depth_mm: 20,
            mm_per_pixel_at_1m: 1.6,
        }
    }

    fn input<'a>(depth: &'a DepthMap, image: &'a ColorImage) -> AlgorithmSelectionInput<'a> {
        AlgorithmSelectionInput {
            depth_map: depth,
            image,
            distance_hint: 0,
            dm1_enabled: true,
            dm2_enabled: true,
            rgb_enabled: true,
            debug_file_name: "test",
        }
    }

    #[test]
    fn test_selects_and_measures_box() {
        let scene = FakeSceneConfig::default();
        let (depth, image) = (scene.depth_map(), scene.color_image());

        let selection = algorithm().select_algorithm(&input(&depth, &image));
        assert_eq!(selection.status, AlgorithmSelectionStatus::Dm1);
        assert!(!selection.range_meter_used);

        let volume = algorithm()
            .calculate_volume(&depth, &image, 0, selection.status)
            .unwrap();
        assert_eq!(volume, ObjectVolume::new(154, 115, 300));
    }

    #[test]
    fn test_distance_hint_overrides_depth() {
        let scene = FakeSceneConfig::default();
        let (depth, image) = (scene.depth_map(), scene.color_image());
        let mut selection_input = input(&depth, &image);
        selection_input.distance_hint = 1000;

        let selection = algorithm().select_algorithm(&selection_input);
        assert!(selection.range_meter_used);
        let volume = algorithm()
            .calculate_volume(&depth, &image, 1000, AlgorithmSelectionStatus::Rgb)
            .unwrap();
        assert_eq!(volume.height_mm, 500);
        assert_eq!(volume.length_mm, 128);
    }

    #[test]
    fn test_selection_failures() {
        let floor = DepthMap::flat(16, 12, 1500);
        let image = ColorImage::filled(16, 12, [0, 0, 0]);
        let mut selection_input = input(&floor, &image);
        assert_eq!(
            algorithm().select_algorithm(&selection_input).status,
            AlgorithmSelectionStatus::NoObjectFound
        );

        selection_input.dm1_enabled = false;
        selection_input.dm2_enabled = false;
        selection_input.rgb_enabled = false;
        assert_eq!(
            algorithm().select_algorithm(&selection_input).status,
            AlgorithmSelectionStatus::NoAlgorithmsAllowed
        );

        let small = ColorImage::filled(8, 8, [0, 0, 0]);
        assert_eq!(
            algorithm().select_algorithm(&input(&floor, &small)).status,
            AlgorithmSelectionStatus::DataIsInvalid
        );
    }

    #[test]
    fn test_rgb_fallback_when_depth_algorithms_disabled() {
        let scene = FakeSceneConfig::default();
        let (depth, image) = (scene.depth_map(), scene.color_image());
        let mut selection_input = input(&depth, &image);
        selection_input.dm1_enabled = false;
        selection_input.dm2_enabled = false;
        assert_eq!(
            algorithm().select_algorithm(&selection_input).status,
            AlgorithmSelectionStatus::Rgb
        );
    }
}
