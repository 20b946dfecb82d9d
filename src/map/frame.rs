//! Frames and the 2D features observed in them.

use anyhow::{bail, Result};
use opencv::core::{Mat, Point2f};
use opencv::prelude::*;

use crate::geometry::SE3;

use super::types::{KeyFrameId, MapPointId};

/// A single 2D observation in one image of one frame.
///
/// The landmark link is weak: it stores an id that may no longer resolve
/// in the map, in which case the feature simply observes nothing.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Pixel position in the owning image.
    pub position: Point2f,
    /// Detection scale, kept for drawing and bookkeeping.
    pub scale: f32,
    /// Weak link to the observed landmark.
    pub map_point: Option<MapPointId>,
    /// Scratch flag used by the pose optimizer; cleared after each run.
    pub is_outlier: bool,
    pub on_left_image: bool,
}

impl Feature {
    pub fn new(position: Point2f, scale: f32) -> Self {
        Self {
            position,
            scale,
            map_point: None,
            is_outlier: false,
            on_left_image: true,
        }
    }

    pub fn on_right(position: Point2f, scale: f32) -> Self {
        Self {
            on_left_image: false,
            ..Self::new(position, scale)
        }
    }
}

/// One stereo capture.
///
/// `features_left` and `features_right` are parallel after stereo
/// matching: entry `i` of both refers to the same candidate
/// correspondence, with `None` on the right meaning the LK match failed.
#[derive(Clone)]
pub struct Frame {
    pub id: u64,
    /// Set when the frame is promoted to a keyframe by the map.
    pub keyframe_id: Option<KeyFrameId>,
    pub left: Mat,
    pub right: Mat,
    /// World-to-camera transform, refined during tracking.
    pub pose: SE3,
    pub features_left: Vec<Feature>,
    pub features_right: Vec<Option<Feature>>,
}

impl Frame {
    /// Build a frame from a rectified grayscale pair. Image geometry is
    /// validated here so tracking can assume well-formed input.
    pub fn new(id: u64, left: Mat, right: Mat) -> Result<Self> {
        if left.empty() || right.empty() {
            bail!("frame {}: empty image", id);
        }
        if left.size()? != right.size()? {
            bail!(
                "frame {}: stereo pair size mismatch ({:?} vs {:?})",
                id,
                left.size()?,
                right.size()?
            );
        }
        if left.typ() != opencv::core::CV_8UC1 || right.typ() != opencv::core::CV_8UC1 {
            bail!("frame {}: images must be 8-bit single-channel", id);
        }
        Ok(Self {
            id,
            keyframe_id: None,
            left,
            right,
            pose: SE3::identity(),
            features_left: Vec::new(),
            features_right: Vec::new(),
        })
    }

    pub fn is_keyframe(&self) -> bool {
        self.keyframe_id.is_some()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("keyframe_id", &self.keyframe_id)
            .field("features_left", &self.features_left.len())
            .field("features_right", &self.features_right.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Scalar;

    fn gray(rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, opencv::core::CV_8UC1, Scalar::all(0.0))
            .unwrap()
    }

    #[test]
    fn accepts_matching_grayscale_pair() {
        let frame = Frame::new(0, gray(48, 64), gray(48, 64)).unwrap();
        assert!(!frame.is_keyframe());
        assert_eq!(frame.id, 0);
    }

    #[test]
    fn rejects_size_mismatch() {
        assert!(Frame::new(0, gray(48, 64), gray(48, 63)).is_err());
    }

    #[test]
    fn rejects_empty_image() {
        assert!(Frame::new(0, Mat::default(), gray(48, 64)).is_err());
    }

    #[test]
    fn rejects_multichannel_image() {
        let color = Mat::new_rows_cols_with_default(
            48,
            64,
            opencv::core::CV_8UC3,
            Scalar::all(0.0),
        )
        .unwrap();
        assert!(Frame::new(0, color, gray(48, 64)).is_err());
    }
}
