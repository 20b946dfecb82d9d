//! Top-level system: wires the frontend, backend thread, map, and viewer.

use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;

use crate::backend::Backend;
use crate::camera::Camera;
use crate::config::SystemConfig;
use crate::geometry::SE3;
use crate::map::{Frame, Map};
use crate::tracking::{Frontend, FrontendStatus};
use crate::viz::Visualizer;

/// Owns the shared map, the tracking frontend (driven by the caller's
/// thread), and the backend optimization thread.
pub struct SlamSystem {
    map: Arc<RwLock<Map>>,
    frontend: Frontend,
    backend: Option<Backend>,
}

impl SlamSystem {
    /// Validates configuration and calibration up front; tracking assumes
    /// both are sound from here on.
    pub fn new(config: &SystemConfig, camera_left: Camera, camera_right: Camera) -> Result<Self> {
        config.validate()?;
        if camera_left.fx <= 0.0 || camera_right.fx <= 0.0 {
            bail!("camera focal length must be positive");
        }
        if camera_right.baseline <= 0.0 {
            bail!("stereo baseline must be positive");
        }

        let map = Arc::new(RwLock::new(Map::new()));
        let backend = Backend::new(camera_left.clone(), camera_right.clone(), map.clone());
        let viewer = if config.viewer {
            Some(Visualizer::new("stereo-vslam", map.clone())?)
        } else {
            None
        };
        let frontend = Frontend::new(
            camera_left,
            camera_right,
            map.clone(),
            Some(backend.handle()),
            viewer,
            config,
        )?;

        Ok(Self {
            map,
            frontend,
            backend: Some(backend),
        })
    }

    /// Process one stereo frame in the calling thread.
    pub fn add_frame(&mut self, frame: Frame) -> Result<FrontendStatus> {
        self.frontend.add_frame(frame)
    }

    pub fn status(&self) -> FrontendStatus {
        self.frontend.status()
    }

    /// World-to-camera pose of the most recent frame.
    pub fn current_pose(&self) -> Option<SE3> {
        self.frontend.current_pose()
    }

    pub fn map(&self) -> &Arc<RwLock<Map>> {
        &self.map
    }

    /// Cooperative shutdown: stop feeding frames, then drain the backend.
    pub fn shutdown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cameras() -> (Camera, Camera) {
        let left = Camera::new(400.0, 400.0, 320.0, 240.0, 0.5, SE3::identity());
        let right = Camera::new(
            400.0,
            400.0,
            320.0,
            240.0,
            0.5,
            SE3::new(
                nalgebra::UnitQuaternion::identity(),
                nalgebra::Vector3::new(-0.5, 0.0, 0.0),
            ),
        );
        (left, right)
    }

    #[test]
    fn construction_rejects_bad_baseline() {
        let (left, right) = cameras();
        let broken = Camera::new(400.0, 400.0, 320.0, 240.0, 0.0, right.pose().clone());
        let config = SystemConfig::default();
        assert!(SlamSystem::new(&config, left.clone(), broken).is_err());
        assert!(SlamSystem::new(&config, left, right).is_ok());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (left, right) = cameras();
        let mut system = SlamSystem::new(&SystemConfig::default(), left, right).unwrap();
        system.shutdown();
        system.shutdown();
    }
}
