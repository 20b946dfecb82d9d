//! Sparse pyramidal Lucas-Kanade flow with initial guesses.

use anyhow::Result;
use opencv::core::{Mat, Point2f, Size, TermCriteria, Vector};
use opencv::video;

use crate::config::FlowConfig;

/// Thin wrapper over `calcOpticalFlowPyrLK` that always honors the
/// caller's initial guesses, so correspondences seeded from landmark
/// projections converge in a few iterations.
pub struct FlowTracker {
    win_size: Size,
    max_level: i32,
    criteria: TermCriteria,
}

impl FlowTracker {
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            win_size: Size::new(config.window_size, config.window_size),
            max_level: config.pyramid_levels,
            criteria: TermCriteria {
                typ: opencv::core::TermCriteria_COUNT + opencv::core::TermCriteria_EPS,
                max_count: config.max_iterations,
                epsilon: config.epsilon,
            },
        }
    }

    /// Track `source` points from image `from` into image `to`, starting
    /// each search at the matching entry of `initial`. Returns the
    /// refined position and a success flag per point.
    pub fn track(
        &self,
        from: &Mat,
        to: &Mat,
        source: &[Point2f],
        initial: &[Point2f],
    ) -> Result<Vec<(Point2f, bool)>> {
        debug_assert_eq!(source.len(), initial.len());
        if source.is_empty() {
            return Ok(Vec::new());
        }

        let prev_pts: Vector<Point2f> = source.iter().copied().collect();
        let mut next_pts: Vector<Point2f> = initial.iter().copied().collect();
        let mut status = Vector::<u8>::new();
        let mut err = Vector::<f32>::new();

        video::calc_optical_flow_pyr_lk(
            from,
            to,
            &prev_pts,
            &mut next_pts,
            &mut status,
            &mut err,
            self.win_size,
            self.max_level,
            self.criteria,
            video::OPTFLOW_USE_INITIAL_FLOW,
            1e-4,
        )?;

        Ok(next_pts
            .iter()
            .zip(status.iter())
            .map(|(pt, ok)| (pt, ok != 0))
            .collect())
    }
}
