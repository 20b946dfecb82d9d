//! Pinhole camera model with a fixed rig extrinsic.
//!
//! Each camera of the stereo rig carries its intrinsics and the transform
//! from the rig body to this camera (`pose`). The left camera typically has
//! an identity extrinsic; the right one a baseline translation. All world
//! conversions additionally take the frame's world-to-camera transform.

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::geometry::SE3;

#[derive(Debug, Clone)]
pub struct Camera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Stereo baseline in meters.
    pub baseline: f64,
    /// Extrinsic: rig body to this camera.
    pose: SE3,
    pose_inv: SE3,
}

impl Camera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, baseline: f64, pose: SE3) -> Self {
        let pose_inv = pose.inverse();
        Self {
            fx,
            fy,
            cx,
            cy,
            baseline,
            pose,
            pose_inv,
        }
    }

    /// The fixed extrinsic from rig body to this camera.
    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn world_to_camera(&self, p_w: &Vector3<f64>, t_cw: &SE3) -> Vector3<f64> {
        self.pose.transform_point(&t_cw.transform_point(p_w))
    }

    pub fn camera_to_world(&self, p_c: &Vector3<f64>, t_cw: &SE3) -> Vector3<f64> {
        t_cw.inverse()
            .transform_point(&self.pose_inv.transform_point(p_c))
    }

    pub fn camera_to_pixel(&self, p_c: &Vector3<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * p_c.x / p_c.z + self.cx,
            self.fy * p_c.y / p_c.z + self.cy,
        )
    }

    pub fn pixel_to_camera(&self, p_px: &Vector2<f64>, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (p_px.x - self.cx) / self.fx * depth,
            (p_px.y - self.cy) / self.fy * depth,
            depth,
        )
    }

    pub fn world_to_pixel(&self, p_w: &Vector3<f64>, t_cw: &SE3) -> Vector2<f64> {
        self.camera_to_pixel(&self.world_to_camera(p_w, t_cw))
    }

    pub fn pixel_to_world(&self, p_px: &Vector2<f64>, t_cw: &SE3, depth: f64) -> Vector3<f64> {
        self.camera_to_world(&self.pixel_to_camera(p_px, depth), t_cw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn test_camera() -> Camera {
        Camera::new(400.0, 400.0, 320.0, 240.0, 0.5, SE3::identity())
    }

    #[test]
    fn pixel_camera_round_trip() {
        let cam = test_camera();
        let px = Vector2::new(100.0, 333.0);
        let p_c = cam.pixel_to_camera(&px, 4.0);
        assert_relative_eq!(p_c.z, 4.0);
        assert_relative_eq!(cam.camera_to_pixel(&p_c), px, epsilon = 1e-10);
    }

    #[test]
    fn principal_point_projects_to_center() {
        let cam = test_camera();
        let px = cam.camera_to_pixel(&Vector3::new(0.0, 0.0, 3.0));
        assert_relative_eq!(px, Vector2::new(320.0, 240.0), epsilon = 1e-12);
    }

    #[test]
    fn world_to_pixel_honors_frame_pose() {
        let cam = test_camera();
        // Camera translated one meter along +x: world point shifts left in image.
        let t_cw = SE3::new(UnitQuaternion::identity(), Vector3::new(-1.0, 0.0, 0.0));
        let p_w = Vector3::new(1.0, 0.0, 5.0);
        let px = cam.world_to_pixel(&p_w, &t_cw);
        assert_relative_eq!(px, Vector2::new(320.0, 240.0), epsilon = 1e-10);
    }

    #[test]
    fn extrinsic_offsets_projection() {
        let extrinsic = SE3::new(UnitQuaternion::identity(), Vector3::new(-0.5, 0.0, 0.0));
        let right = Camera::new(400.0, 400.0, 320.0, 240.0, 0.5, extrinsic);
        let p_w = Vector3::new(0.0, 0.0, 10.0);
        let px = right.world_to_pixel(&p_w, &SE3::identity());
        // Disparity fx * b / z = 400 * 0.5 / 10 = 20 px.
        assert_relative_eq!(px.x, 300.0, epsilon = 1e-10);
    }

    #[test]
    fn world_round_trip_through_pixel() {
        let cam = test_camera();
        let t_cw = SE3::new(
            UnitQuaternion::from_euler_angles(0.02, -0.01, 0.03),
            Vector3::new(0.3, -0.2, 0.1),
        );
        let p_w = Vector3::new(1.0, -0.5, 7.0);
        let p_c = cam.world_to_camera(&p_w, &t_cw);
        let px = cam.camera_to_pixel(&p_c);
        let back = cam.pixel_to_world(&px, &t_cw, p_c.z);
        assert_relative_eq!(back, p_w, epsilon = 1e-9);
    }
}
