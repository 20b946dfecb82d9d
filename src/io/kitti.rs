//! KITTI odometry sequence reader.
//!
//! A sequence directory contains `calib.txt` with the rectified projection
//! matrices `P0`/`P1`, `times.txt` with one timestamp per frame, and the
//! grayscale pairs under `image_0/` and `image_1/` named `000000.png` on.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Vector3};
use opencv::core::Mat;
use opencv::imgcodecs::{self, IMREAD_GRAYSCALE};

use crate::camera::Camera;
use crate::geometry::SE3;

#[derive(Debug)]
pub struct StereoImagePair {
    pub left: Mat,
    pub right: Mat,
    pub timestamp: f64,
}

pub struct KittiDataset {
    root: PathBuf,
    times: Vec<f64>,
    camera_left: Camera,
    camera_right: Camera,
}

impl KittiDataset {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let projections = load_projections(&root.join("calib.txt"))?;
        let times = load_times(&root.join("times.txt"))?;
        if times.is_empty() {
            bail!("dataset {:?} has no frames", root);
        }

        let camera_left = camera_from_projection(&projections[0])?;
        let camera_right = camera_from_projection(&projections[1])?;
        if camera_right.baseline <= 0.0 {
            bail!("calibration yields a non-positive stereo baseline");
        }

        Ok(Self {
            root,
            times,
            camera_left,
            camera_right,
        })
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn cameras(&self) -> (Camera, Camera) {
        (self.camera_left.clone(), self.camera_right.clone())
    }

    pub fn stereo_pair(&self, index: usize) -> Result<StereoImagePair> {
        let timestamp = *self
            .times
            .get(index)
            .with_context(|| format!("No frame at index {}", index))?;
        let left_path = self.root.join(format!("image_0/{:06}.png", index));
        let right_path = self.root.join(format!("image_1/{:06}.png", index));

        let left = imgcodecs::imread(left_path.to_str().unwrap(), IMREAD_GRAYSCALE)
            .with_context(|| format!("Failed to read left image {:?}", left_path))?;
        let right = imgcodecs::imread(right_path.to_str().unwrap(), IMREAD_GRAYSCALE)
            .with_context(|| format!("Failed to read right image {:?}", right_path))?;

        Ok(StereoImagePair {
            left,
            right,
            timestamp,
        })
    }
}

/// A 3x4 rectified projection matrix from `calib.txt`.
#[derive(Debug, Clone)]
struct Projection {
    values: [f64; 12],
}

impl Projection {
    fn at(&self, row: usize, col: usize) -> f64 {
        self.values[row * 4 + col]
    }
}

fn load_projections(path: &Path) -> Result<Vec<Projection>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut projections = Vec::new();
    for line in text.lines() {
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        if !label.starts_with('P') {
            continue;
        }
        let fields: Vec<f64> = rest
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("Malformed projection line {:?}", label))?;
        if fields.len() != 12 {
            bail!("projection {} has {} values, expected 12", label, fields.len());
        }
        let mut values = [0.0; 12];
        values.copy_from_slice(&fields);
        projections.push(Projection { values });
    }
    if projections.len() < 2 {
        bail!("calibration {:?} lists {} projections, need P0 and P1", path, projections.len());
    }
    Ok(projections)
}

/// Split a rectified projection `K [I | t']` into intrinsics and the rig
/// extrinsic `t = K^-1 t'`, whose norm is the baseline to camera 0.
fn camera_from_projection(p: &Projection) -> Result<Camera> {
    let fx = p.at(0, 0);
    let fy = p.at(1, 1);
    let cx = p.at(0, 2);
    let cy = p.at(1, 2);
    if fx <= 0.0 || fy <= 0.0 {
        bail!("projection has non-positive focal length");
    }

    let k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);
    let t_prime = Vector3::new(p.at(0, 3), p.at(1, 3), p.at(2, 3));
    let t = k
        .try_inverse()
        .context("projection intrinsics are singular")?
        * t_prime;

    let pose = SE3::new(nalgebra::UnitQuaternion::identity(), t);
    Ok(Camera::new(fx, fy, cx, cy, t.norm(), pose))
}

fn load_times(path: &Path) -> Result<Vec<f64>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to open {:?}", path))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            l.trim()
                .parse::<f64>()
                .with_context(|| format!("Malformed timestamp {:?}", l))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn write_sequence(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        let calib = "\
P0: 718.856 0.0 607.1928 0.0 0.0 718.856 185.2157 0.0 0.0 0.0 1.0 0.0
P1: 718.856 0.0 607.1928 -386.1448 0.0 718.856 185.2157 0.0 0.0 0.0 1.0 0.0
";
        fs::write(dir.join("calib.txt"), calib).unwrap();
        fs::write(dir.join("times.txt"), "0.0\n0.1\n0.2\n").unwrap();
    }

    #[test]
    fn parses_calibration_and_baseline() {
        let dir = std::env::temp_dir().join("stereo_vslam_kitti_calib_test");
        write_sequence(&dir);

        let dataset = KittiDataset::new(&dir).unwrap();
        assert_eq!(dataset.len(), 3);

        let (left, right) = dataset.cameras();
        assert_relative_eq!(left.fx, 718.856);
        assert_relative_eq!(left.pose().translation.norm(), 0.0, epsilon = 1e-12);
        // Baseline of KITTI sequence 00: ~0.537 m.
        assert_relative_eq!(right.baseline, 386.1448 / 718.856, epsilon = 1e-9);
        assert!(right.pose().translation.x < 0.0);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_projection_is_an_error() {
        let dir = std::env::temp_dir().join("stereo_vslam_kitti_missing_p1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("calib.txt"),
            "P0: 718.856 0.0 607.1928 0.0 0.0 718.856 185.2157 0.0 0.0 0.0 1.0 0.0\n",
        )
        .unwrap();
        fs::write(dir.join("times.txt"), "0.0\n").unwrap();

        assert!(KittiDataset::new(&dir).is_err());
        fs::remove_dir_all(&dir).ok();
    }
}
