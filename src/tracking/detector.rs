//! Corner detection with a spatial exclusion mask.

use anyhow::Result;
use opencv::core::{Mat, Point2f, Ptr, Rect, Scalar, Vector};
use opencv::features2d::GFTTDetector;
use opencv::prelude::*;
use opencv::{features2d, imgproc};

/// Good-features-to-track detector that skips the neighborhood of
/// already-tracked features, so new detections complement rather than
/// duplicate the current set.
pub struct FeatureDetector {
    gftt: Ptr<GFTTDetector>,
    /// Half extent of the square painted around each existing feature.
    exclusion_radius: i32,
}

impl FeatureDetector {
    pub fn new(max_features: i32, quality: f64, min_distance: f64) -> Result<Self> {
        let gftt = features2d::GFTTDetector::create(max_features, quality, min_distance, 3, false, 0.04)?;
        Ok(Self {
            gftt,
            exclusion_radius: (min_distance / 2.0) as i32,
        })
    }

    /// Detect corners in `image` outside the boxes around `existing`
    /// positions. Returns pixel positions with their detection scale.
    pub fn detect(&mut self, image: &Mat, existing: &[Point2f]) -> Result<Vec<(Point2f, f32)>> {
        let mask = self.build_mask(image, existing)?;

        let mut keypoints = Vector::<opencv::core::KeyPoint>::new();
        self.gftt.detect(image, &mut keypoints, &mask)?;

        Ok(keypoints
            .iter()
            .map(|kp| (kp.pt(), kp.size()))
            .collect())
    }

    fn build_mask(&self, image: &Mat, existing: &[Point2f]) -> Result<Mat> {
        let mut mask = Mat::new_rows_cols_with_default(
            image.rows(),
            image.cols(),
            opencv::core::CV_8UC1,
            Scalar::all(255.0),
        )?;
        let r = self.exclusion_radius;
        for p in existing {
            let rect = Rect::new(p.x as i32 - r, p.y as i32 - r, 2 * r, 2 * r);
            imgproc::rectangle(&mut mask, rect, Scalar::all(0.0), imgproc::FILLED, imgproc::LINE_8, 0)?;
        }
        Ok(mask)
    }
}
