//! Tracking frontend: the per-frame state machine.
//!
//! `add_frame` dispatches on the current status:
//! - `Initing`: try to bootstrap the map from stereo correspondences.
//! - `TrackingGood`/`TrackingBad`: propagate features from the last frame
//!   by LK flow, refine the pose against the map, reclassify, and decide
//!   on keyframe promotion.
//! - `Lost`: soft reset - drop the temporal state, keep the map, and go
//!   back to `Initing` for the next frame.
//!
//! Per-frame failures never surface as errors: LK misses drop points,
//! degenerate triangulations skip landmarks, optimizer outliers lose
//! their landmark link but keep the feature.

use std::sync::Arc;

use anyhow::Result;
use nalgebra::{Vector2, Vector3};
use opencv::core::Point2f;
use parking_lot::RwLock;
use tracing::info;

use crate::backend::BackendHandle;
use crate::camera::Camera;
use crate::config::SystemConfig;
use crate::geometry::{triangulate, SE3};
use crate::map::{Frame, Map, Observation};
use crate::viz::Visualizer;

use super::detector::FeatureDetector;
use super::optical_flow::FlowTracker;
use super::pose_optimizer::optimize_pose;
use super::state::FrontendStatus;

pub struct Frontend {
    status: FrontendStatus,
    camera_left: Camera,
    camera_right: Camera,
    map: Arc<RwLock<Map>>,
    backend: Option<BackendHandle>,
    viewer: Option<Visualizer>,

    detector: FeatureDetector,
    flow: FlowTracker,

    last_frame: Option<Frame>,
    /// Constant-velocity prior: pose delta observed between the last two
    /// tracked frames. Unset until two frames have been tracked and after
    /// a reset.
    relative_motion: Option<SE3>,
    tracking_inliers: usize,

    num_features_init: usize,
    num_features_tracking: usize,
    num_features_tracking_bad: usize,
    num_features_needed_for_keyframe: usize,
}

impl Frontend {
    pub fn new(
        camera_left: Camera,
        camera_right: Camera,
        map: Arc<RwLock<Map>>,
        backend: Option<BackendHandle>,
        viewer: Option<Visualizer>,
        config: &SystemConfig,
    ) -> Result<Self> {
        let detector = FeatureDetector::new(
            config.frontend.num_features,
            config.frontend.detector_quality,
            config.frontend.detector_min_distance,
        )?;
        Ok(Self {
            status: FrontendStatus::default(),
            camera_left,
            camera_right,
            map,
            backend,
            viewer,
            detector,
            flow: FlowTracker::new(&config.flow),
            last_frame: None,
            relative_motion: None,
            tracking_inliers: 0,
            num_features_init: config.frontend.num_features_init,
            num_features_tracking: config.frontend.num_features_tracking,
            num_features_tracking_bad: config.frontend.num_features_tracking_bad,
            num_features_needed_for_keyframe: config.frontend.num_features_needed_for_keyframe,
        })
    }

    pub fn status(&self) -> FrontendStatus {
        self.status
    }

    /// Pose of the most recently processed frame (world-to-camera).
    pub fn current_pose(&self) -> Option<SE3> {
        self.last_frame.as_ref().map(|f| f.pose.clone())
    }

    /// Process one stereo frame and return the status after it.
    pub fn add_frame(&mut self, mut frame: Frame) -> Result<FrontendStatus> {
        match self.status {
            FrontendStatus::Initing => {
                self.stereo_init(&mut frame)?;
                self.last_frame = Some(frame);
            }
            FrontendStatus::TrackingGood | FrontendStatus::TrackingBad => {
                self.track(&mut frame)?;
                self.last_frame = Some(frame);
            }
            FrontendStatus::Lost => {
                // The triggering frame is consumed; the next one starts
                // initialization over on the retained map.
                self.reset();
            }
        }
        Ok(self.status)
    }

    // ── initialization ─────────────────────────────────────────────────

    fn stereo_init(&mut self, frame: &mut Frame) -> Result<()> {
        self.detect_features(frame)?;
        let num_matches = self.find_features_in_right(frame)?;
        if num_matches < self.num_features_init {
            info!(
                "Stereo init needs {} matches, found {}",
                self.num_features_init, num_matches
            );
            return Ok(());
        }

        let num_landmarks = self.triangulate_new_points(frame);
        self.promote_to_keyframe(frame);
        info!("Initial map created with {} landmarks", num_landmarks);

        self.status = FrontendStatus::TrackingGood;
        if let Some(backend) = &self.backend {
            backend.update_map();
        }
        if let Some(viewer) = &self.viewer {
            viewer.add_current_frame(frame);
            viewer.update_map();
        }
        Ok(())
    }

    // ── tracking ───────────────────────────────────────────────────────

    fn track(&mut self, frame: &mut Frame) -> Result<()> {
        if let Some(last) = &self.last_frame {
            frame.pose = match &self.relative_motion {
                Some(rel) => rel.compose(&last.pose),
                None => last.pose.clone(),
            };
        }

        let num_tracked = self.track_last_frame(frame)?;
        self.tracking_inliers = self.estimate_current_pose(frame);
        info!(
            "Tracked {} features, {} inliers after pose refinement",
            num_tracked, self.tracking_inliers
        );

        self.status = if self.tracking_inliers > self.num_features_tracking {
            FrontendStatus::TrackingGood
        } else if self.tracking_inliers > self.num_features_tracking_bad {
            FrontendStatus::TrackingBad
        } else {
            FrontendStatus::Lost
        };

        self.insert_keyframe(frame)?;

        if let Some(last) = &self.last_frame {
            self.relative_motion = Some(frame.pose.compose(&last.pose.inverse()));
        }
        if let Some(viewer) = &self.viewer {
            viewer.add_current_frame(frame);
        }
        Ok(())
    }

    /// Propagate last frame's features into the current one by LK flow,
    /// seeding the search with landmark projections where available.
    fn track_last_frame(&mut self, frame: &mut Frame) -> Result<usize> {
        let last = match &self.last_frame {
            Some(last) => last,
            None => return Ok(0),
        };

        let mut kps_last = Vec::with_capacity(last.features_left.len());
        let mut kps_current = Vec::with_capacity(last.features_left.len());
        {
            let map = self.map.read();
            for feat in &last.features_left {
                let seed = feat
                    .map_point
                    .and_then(|id| map.landmark(id))
                    .map(|mp| {
                        let px = self.camera_left.world_to_pixel(&mp.position, &frame.pose);
                        Point2f::new(px.x as f32, px.y as f32)
                    })
                    .unwrap_or(feat.position);
                kps_last.push(feat.position);
                kps_current.push(seed);
            }
        }

        let tracked = self.flow.track(&last.left, &frame.left, &kps_last, &kps_current)?;

        let mut num_good = 0;
        for (i, (position, ok)) in tracked.into_iter().enumerate() {
            if !ok {
                continue;
            }
            let source = &last.features_left[i];
            let mut feat = crate::map::Feature::new(position, source.scale);
            feat.map_point = source.map_point;
            frame.features_left.push(feat);
            num_good += 1;
        }
        Ok(num_good)
    }

    /// Refine the frame pose against its live 2D-3D correspondences.
    /// Outlier features lose their landmark link but keep the slot; the
    /// scratch flag is cleared so they may be re-associated later.
    fn estimate_current_pose(&mut self, frame: &mut Frame) -> usize {
        let mut landmarks = Vec::new();
        let mut measurements = Vec::new();
        let mut indices = Vec::new();
        {
            let map = self.map.read();
            for (i, feat) in frame.features_left.iter().enumerate() {
                if let Some(mp) = feat.map_point.and_then(|id| map.landmark(id)) {
                    landmarks.push(mp.position);
                    measurements.push(Vector2::new(
                        feat.position.x as f64,
                        feat.position.y as f64,
                    ));
                    indices.push(i);
                }
            }
        }

        if landmarks.is_empty() {
            return 0;
        }

        let result = optimize_pose(&self.camera_left, &frame.pose, &landmarks, &measurements);
        info!(
            "Outlier/inlier in pose estimation: {}/{}",
            landmarks.len() - result.num_inliers,
            result.num_inliers
        );

        frame.pose = result.pose;
        for (k, &i) in indices.iter().enumerate() {
            frame.features_left[i].is_outlier = result.outliers[k];
        }
        for &i in &indices {
            let feat = &mut frame.features_left[i];
            if feat.is_outlier {
                feat.map_point = None;
                // The feature itself may still be re-associated later.
                feat.is_outlier = false;
            }
        }
        result.num_inliers
    }

    // ── keyframes ──────────────────────────────────────────────────────

    /// Promote the current frame when tracking has thinned out, then
    /// replenish its features, triangulate new landmarks, and notify the
    /// backend and viewer.
    fn insert_keyframe(&mut self, frame: &mut Frame) -> Result<bool> {
        if self.tracking_inliers >= self.num_features_needed_for_keyframe {
            return Ok(false);
        }

        self.detect_features(frame)?;
        self.find_features_in_right(frame)?;
        let num_landmarks = self.triangulate_new_points(frame);
        let keyframe_id = self.promote_to_keyframe(frame);
        info!(
            "Set frame {} as keyframe {} ({} new landmarks)",
            frame.id, keyframe_id, num_landmarks
        );

        if let Some(backend) = &self.backend {
            backend.update_map();
        }
        if let Some(viewer) = &self.viewer {
            viewer.update_map();
        }
        Ok(true)
    }

    /// Detect additional corners on the left image, masking out current
    /// feature positions.
    fn detect_features(&mut self, frame: &mut Frame) -> Result<usize> {
        let existing: Vec<Point2f> = frame.features_left.iter().map(|f| f.position).collect();
        let detections = self.detector.detect(&frame.left, &existing)?;
        let num_detected = detections.len();
        for (position, scale) in detections {
            frame.features_left.push(crate::map::Feature::new(position, scale));
        }
        info!("Detected {} new features", num_detected);
        Ok(num_detected)
    }

    /// Find stereo correspondences for every left feature by LK flow into
    /// the right image. Rebuilds `features_right` in parallel with
    /// `features_left`; failures leave a hole.
    fn find_features_in_right(&mut self, frame: &mut Frame) -> Result<usize> {
        let mut kps_left = Vec::with_capacity(frame.features_left.len());
        let mut kps_right = Vec::with_capacity(frame.features_left.len());
        {
            let map = self.map.read();
            for feat in &frame.features_left {
                let seed = feat
                    .map_point
                    .and_then(|id| map.landmark(id))
                    .map(|mp| {
                        let px = self.camera_right.world_to_pixel(&mp.position, &frame.pose);
                        Point2f::new(px.x as f32, px.y as f32)
                    })
                    .unwrap_or(feat.position);
                kps_left.push(feat.position);
                kps_right.push(seed);
            }
        }

        let tracked = self.flow.track(&frame.left, &frame.right, &kps_left, &kps_right)?;

        frame.features_right.clear();
        let mut num_good = 0;
        for (i, (position, ok)) in tracked.into_iter().enumerate() {
            if ok {
                let scale = frame.features_left[i].scale;
                frame
                    .features_right
                    .push(Some(crate::map::Feature::on_right(position, scale)));
                num_good += 1;
            } else {
                frame.features_right.push(None);
            }
        }
        info!("Found {} features in the right image", num_good);
        Ok(num_good)
    }

    /// Triangulate a world landmark for every stereo pair whose left
    /// feature does not already observe a live one. Returns the number of
    /// landmarks inserted.
    fn triangulate_new_points(&self, frame: &mut Frame) -> usize {
        let poses = [
            self.camera_left.pose().clone(),
            self.camera_right.pose().clone(),
        ];
        let current_twc = frame.pose.inverse();
        let mut num_triangulated = 0;

        let mut map = self.map.write();
        for i in 0..frame.features_left.len() {
            let alive = frame.features_left[i]
                .map_point
                .map_or(false, |id| map.landmark(id).is_some());
            if alive {
                continue;
            }
            let right = match frame.features_right.get(i) {
                Some(Some(feat)) => feat.position,
                _ => continue,
            };
            let left = frame.features_left[i].position;

            let points = [
                self.camera_left
                    .pixel_to_camera(&Vector2::new(left.x as f64, left.y as f64), 1.0),
                self.camera_right
                    .pixel_to_camera(&Vector2::new(right.x as f64, right.y as f64), 1.0),
            ];

            let p_rig = match triangulate(&poses, &points) {
                Some(p) if p.z > 0.0 => p,
                _ => continue,
            };
            let p_world: Vector3<f64> = current_twc.transform_point(&p_rig);

            let id = map.insert_map_point(p_world);
            frame.features_left[i].map_point = Some(id);
            if let Some(Some(feat)) = frame.features_right.get_mut(i) {
                feat.map_point = Some(id);
            }
            num_triangulated += 1;
        }
        num_triangulated
    }

    /// Register the frame as a keyframe and record observations for every
    /// feature with a live landmark, on both images.
    fn promote_to_keyframe(&self, frame: &mut Frame) -> crate::map::KeyFrameId {
        let mut map = self.map.write();
        let keyframe_id = map.insert_keyframe(frame);
        for (i, feat) in frame.features_left.iter().enumerate() {
            if let Some(mp) = feat.map_point {
                map.add_observation(
                    mp,
                    Observation {
                        keyframe_id,
                        feature_index: i,
                        on_left_image: true,
                    },
                );
            }
            if let Some(Some(right)) = frame.features_right.get(i) {
                if let Some(mp) = right.map_point {
                    map.add_observation(
                        mp,
                        Observation {
                            keyframe_id,
                            feature_index: i,
                            on_left_image: false,
                        },
                    );
                }
            }
        }
        keyframe_id
    }

    // ── recovery ───────────────────────────────────────────────────────

    /// Soft reset: drop the temporal state and return to initialization.
    /// The map is left intact.
    fn reset(&mut self) {
        info!("Tracking lost, resetting frontend");
        self.last_frame = None;
        self.relative_motion = None;
        self.tracking_inliers = 0;
        self.status = FrontendStatus::Initing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;
    use opencv::core::{Mat, Rect, Scalar};
    use opencv::imgproc;

    const BASELINE: f64 = 0.2;
    const DEPTH: f64 = 8.0;

    fn cameras() -> (Camera, Camera) {
        let left = Camera::new(400.0, 400.0, 320.0, 240.0, BASELINE, SE3::identity());
        let right = Camera::new(
            400.0,
            400.0,
            320.0,
            240.0,
            BASELINE,
            SE3::new(
                UnitQuaternion::identity(),
                Vector3::new(-BASELINE, 0.0, 0.0),
            ),
        );
        (left, right)
    }

    /// Fronto-parallel grid of world points whose left projections land
    /// on integer pixels when the camera sits at the origin.
    fn world_grid() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for u in (40..=600).step_by(40) {
            for v in (40..=440).step_by(40) {
                points.push(Vector3::new(
                    (u as f64 - 320.0) * DEPTH / 400.0,
                    (v as f64 - 240.0) * DEPTH / 400.0,
                    DEPTH,
                ));
            }
        }
        points
    }

    /// Black canvas with a bright square at each projected point; the
    /// square corners are what GFTT latches onto.
    fn render(points: &[Vector3<f64>], camera: &Camera, pose: &SE3) -> Mat {
        let mut img = Mat::new_rows_cols_with_default(
            480,
            640,
            opencv::core::CV_8UC1,
            Scalar::all(0.0),
        )
        .unwrap();
        for p in points {
            let px = camera.world_to_pixel(p, pose);
            let (u, v) = (px.x.round() as i32, px.y.round() as i32);
            if u < 6 || v < 6 || u > 633 || v > 473 {
                continue;
            }
            imgproc::rectangle(
                &mut img,
                Rect::new(u - 5, v - 5, 10, 10),
                Scalar::all(255.0),
                imgproc::FILLED,
                imgproc::LINE_8,
                0,
            )
            .unwrap();
        }
        img
    }

    fn stereo_frame(id: u64, points: &[Vector3<f64>], pose: &SE3) -> Frame {
        let (left_cam, right_cam) = cameras();
        Frame::new(
            id,
            render(points, &left_cam, pose),
            render(points, &right_cam, pose),
        )
        .unwrap()
    }

    fn make_frontend(map: Arc<RwLock<Map>>) -> Frontend {
        let (left, right) = cameras();
        Frontend::new(left, right, map, None, None, &SystemConfig::default()).unwrap()
    }

    #[test]
    fn stereo_initialization_builds_map() {
        let map = Arc::new(RwLock::new(Map::new()));
        let mut frontend = make_frontend(map.clone());

        let points = world_grid();
        let status = frontend
            .add_frame(stereo_frame(0, &points, &SE3::identity()))
            .unwrap();

        assert_eq!(status, FrontendStatus::TrackingGood);
        let map = map.read();
        assert_eq!(map.num_keyframes(), 1);
        assert!(map.num_landmarks() >= 100, "only {} landmarks", map.num_landmarks());

        // Every landmark sits on the scene plane; depth from a known
        // baseline must come out near the true value.
        let close = map
            .landmarks()
            .filter(|mp| (mp.position.z - DEPTH).abs() < 0.02 * DEPTH)
            .count();
        assert!(
            close * 10 >= map.num_landmarks() * 9,
            "{}/{} landmarks near the true depth",
            close,
            map.num_landmarks()
        );
    }

    #[test]
    fn stationary_rig_tracks_without_new_keyframes() {
        let map = Arc::new(RwLock::new(Map::new()));
        let mut frontend = make_frontend(map.clone());
        let points = world_grid();

        frontend
            .add_frame(stereo_frame(0, &points, &SE3::identity()))
            .unwrap();
        for id in 1..4 {
            let status = frontend
                .add_frame(stereo_frame(id, &points, &SE3::identity()))
                .unwrap();
            assert_eq!(status, FrontendStatus::TrackingGood);
        }

        // Dense tracking keeps the inlier count above the keyframe
        // threshold, so only the initial keyframe exists.
        assert_eq!(map.read().num_keyframes(), 1);
        let pose = frontend.current_pose().unwrap();
        assert!(pose.translation.norm() < 0.01);
        let rel = frontend.relative_motion.as_ref().unwrap();
        assert!(rel.translation.norm() < 0.01);
        assert!(rel.rotation.angle() < 0.01);
    }

    #[test]
    fn pure_translation_is_recovered() {
        let map = Arc::new(RwLock::new(Map::new()));
        let mut frontend = make_frontend(map);
        let points = world_grid();

        frontend
            .add_frame(stereo_frame(0, &points, &SE3::identity()))
            .unwrap();

        // Camera slides along +x in steps that keep projections on
        // integer pixels (2 px of uniform image shift per step).
        let step = 0.04;
        for id in 1..4 {
            let x = step * id as f64;
            let pose_cw = SE3::new(UnitQuaternion::identity(), Vector3::new(-x, 0.0, 0.0));
            let status = frontend
                .add_frame(stereo_frame(id, &points, &pose_cw))
                .unwrap();
            assert_eq!(status, FrontendStatus::TrackingGood);

            let center = frontend.current_pose().unwrap().inverse().translation;
            assert!(
                (center.x - x).abs() < 0.02,
                "frame {}: estimated x={:.4}, truth {:.4}",
                id,
                center.x,
                x
            );
            assert!(center.y.abs() < 0.02 && center.z.abs() < 0.02);
        }
    }

    #[test]
    fn unrelated_frame_loses_tracking_then_resets() {
        let map = Arc::new(RwLock::new(Map::new()));
        let mut frontend = make_frontend(map.clone());
        let points = world_grid();

        frontend
            .add_frame(stereo_frame(0, &points, &SE3::identity()))
            .unwrap();
        assert_eq!(frontend.status(), FrontendStatus::TrackingGood);

        // An unrelated scene: every square jumps by its own pseudo-random
        // offset, so no rigid pose explains the correspondences.
        let scrambled = |id: u64| {
            let shifted: Vec<Vector3<f64>> = points
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let du = ((i * 37) % 41) as f64 - 20.0;
                    let dv = ((i * 23) % 37) as f64 - 18.0;
                    p + Vector3::new(du * DEPTH / 400.0, dv * DEPTH / 400.0, 0.0)
                })
                .collect();
            stereo_frame(id, &shifted, &SE3::identity())
        };
        let status = frontend.add_frame(scrambled(1)).unwrap();
        assert_eq!(status, FrontendStatus::Lost);

        // The next frame triggers the soft reset, and the one after that
        // re-initializes on the retained map.
        let status = frontend.add_frame(scrambled(2)).unwrap();
        assert_eq!(status, FrontendStatus::Initing);

        let landmarks_before = map.read().num_landmarks();
        let status = frontend
            .add_frame(stereo_frame(3, &points, &SE3::identity()))
            .unwrap();
        assert_eq!(status, FrontendStatus::TrackingGood);
        assert!(map.read().num_landmarks() >= landmarks_before);
    }

    #[test]
    fn outlier_features_are_detached_and_cleared_after_pose_estimation() {
        let map = Arc::new(RwLock::new(Map::new()));
        let mut frontend = make_frontend(map.clone());
        let points = world_grid();

        frontend
            .add_frame(stereo_frame(0, &points, &SE3::identity()))
            .unwrap();

        // Shift a third of the squares far off their landmark projections;
        // those correspondences must come out of pose estimation flagged,
        // detached, and with the scratch flag cleared again.
        let corrupted: Vec<Vector3<f64>> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if i % 3 == 0 {
                    p + Vector3::new(12.0 * DEPTH / 400.0, 0.0, 0.0)
                } else {
                    *p
                }
            })
            .collect();
        frontend
            .add_frame(stereo_frame(1, &corrupted, &SE3::identity()))
            .unwrap();

        let frame = frontend.last_frame.as_ref().unwrap();
        assert!(frame.features_left.iter().all(|f| !f.is_outlier));
        let detached = frame
            .features_left
            .iter()
            .filter(|f| f.map_point.is_none())
            .count();
        assert!(detached > 0, "no correspondences were rejected");
    }
}
