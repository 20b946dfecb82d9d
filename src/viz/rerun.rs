//! Rerun-based visualization.
//!
//! Entity hierarchy:
//!     camera/image           - current left image
//!     camera/image/tracked   - features with a live landmark (green)
//!     camera/image/candidates - features without one (gray)
//!     world/camera           - current camera center
//!     world/trajectory       - keyframe positions
//!     world/landmarks        - active landmark cloud

use std::sync::Arc;

use anyhow::{Context, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use parking_lot::RwLock;
use rerun::RecordingStream;

use crate::map::{Frame, Map};

pub struct Visualizer {
    rec: RecordingStream,
    map: Arc<RwLock<Map>>,
}

impl Visualizer {
    pub fn new(app_name: &str, map: Arc<RwLock<Map>>) -> Result<Self> {
        let rec = rerun::RecordingStreamBuilder::new(app_name.to_string())
            .spawn()
            .context("Failed to spawn rerun viewer")?;
        rec.log_static("world", &rerun::ViewCoordinates::RDF()).ok();
        Ok(Self { rec, map })
    }

    /// Show the current frame: image, feature overlay, camera center.
    pub fn add_current_frame(&self, frame: &Frame) {
        self.rec.set_time_sequence("frame", frame.id as i64);

        if let Ok((data, width, height)) = mat_to_gray_bytes(&frame.left) {
            self.rec
                .log("camera/image", &rerun::Image::from_l8(data, [width, height]))
                .ok();
        }

        let mut tracked: Vec<[f32; 2]> = Vec::new();
        let mut candidates: Vec<[f32; 2]> = Vec::new();
        for feat in &frame.features_left {
            let p = [feat.position.x, feat.position.y];
            if feat.map_point.is_some() {
                tracked.push(p);
            } else {
                candidates.push(p);
            }
        }
        self.rec
            .log(
                "camera/image/tracked",
                &rerun::Points2D::new(tracked).with_colors([[0u8, 255, 0]]),
            )
            .ok();
        self.rec
            .log(
                "camera/image/candidates",
                &rerun::Points2D::new(candidates).with_colors([[160u8, 160, 160]]),
            )
            .ok();

        let center = frame.pose.inverse().translation;
        self.rec
            .log(
                "world/camera",
                &rerun::Points3D::new([[center.x as f32, center.y as f32, center.z as f32]])
                    .with_colors([[255u8, 80, 80]])
                    .with_radii([0.1]),
            )
            .ok();
    }

    /// Refresh the map view from a read snapshot.
    pub fn update_map(&self) {
        let (landmarks, keyframes) = {
            let map = self.map.read();
            let landmarks: Vec<[f32; 3]> = map
                .active_landmarks()
                .map(|mp| {
                    [
                        mp.position.x as f32,
                        mp.position.y as f32,
                        mp.position.z as f32,
                    ]
                })
                .collect();
            let mut keyframes: Vec<(u64, [f32; 3])> = map
                .keyframes()
                .filter_map(|kf| {
                    let id = kf.keyframe_id?;
                    let c = kf.pose.inverse().translation;
                    Some((id.0, [c.x as f32, c.y as f32, c.z as f32]))
                })
                .collect();
            keyframes.sort_by_key(|(id, _)| *id);
            (landmarks, keyframes)
        };

        self.rec
            .log(
                "world/landmarks",
                &rerun::Points3D::new(landmarks).with_colors([[200u8, 200, 255]]),
            )
            .ok();
        let trajectory: Vec<[f32; 3]> = keyframes.into_iter().map(|(_, c)| c).collect();
        self.rec
            .log(
                "world/trajectory",
                &rerun::LineStrips3D::new([trajectory]).with_colors([[90u8, 90, 90]]),
            )
            .ok();
    }
}

fn mat_to_gray_bytes(image: &Mat) -> Result<(Vec<u8>, u32, u32)> {
    let data = image.data_bytes()?.to_vec();
    Ok((data, image.cols() as u32, image.rows() as u32))
}
