//! Motion-only pose refinement.
//!
//! Minimizes the robustified reprojection error of the current frame's
//! 2D-3D correspondences over a single world-to-camera transform. The
//! solver is a hand-rolled Levenberg-Marquardt on the SE(3) tangent space
//! (left perturbation, translation first), run in four outer rounds:
//! each round restarts from the prior, refits on the currently included
//! edges, then reclassifies every edge against the chi-square gate.
//! Excluded edges stay out of the fit but are re-tested each round, so a
//! correspondence can recover. The final round drops the Huber kernel and
//! fits the surviving inliers with a pure quadratic cost.

use nalgebra::{Matrix2x6, Matrix6, Vector2, Vector3, Vector6};

use crate::camera::Camera;
use crate::geometry::SE3;

/// 95th percentile of chi-square with 2 degrees of freedom.
pub const CHI2_THRESHOLD: f64 = 5.991;

const OUTER_ITERATIONS: usize = 4;
const INNER_ITERATIONS: usize = 10;

/// Result of one pose refinement.
pub struct PoseOptimization {
    /// Refined world-to-camera transform.
    pub pose: SE3,
    /// Per-correspondence outlier classification from the final round.
    pub outliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Refine `prior` against world-frame `landmarks` and their measured
/// pixels. Both slices are index-aligned and must be non-empty for the
/// result to be meaningful; with no correspondences the prior is
/// returned unchanged.
pub fn optimize_pose(
    camera: &Camera,
    prior: &SE3,
    landmarks: &[Vector3<f64>],
    measurements: &[Vector2<f64>],
) -> PoseOptimization {
    debug_assert_eq!(landmarks.len(), measurements.len());
    let n = landmarks.len();

    let mut excluded = vec![false; n];
    let mut outliers = vec![false; n];
    let mut pose = prior.clone();

    for outer in 0..OUTER_ITERATIONS {
        // Restart from the motion prior; only the edge set and kernel
        // change between rounds.
        pose = prior.clone();
        let use_kernel = outer < OUTER_ITERATIONS - 1;
        pose = refine(camera, pose, landmarks, measurements, &excluded, use_kernel);

        for i in 0..n {
            let chi2 = edge_chi2(camera, &pose, &landmarks[i], &measurements[i]);
            if chi2 > CHI2_THRESHOLD {
                outliers[i] = true;
                excluded[i] = true;
            } else {
                outliers[i] = false;
                excluded[i] = false;
            }
        }
    }

    let num_inliers = outliers.iter().filter(|&&o| !o).count();
    PoseOptimization {
        pose,
        outliers,
        num_inliers,
    }
}

/// One Levenberg-Marquardt fit over the included edges.
fn refine(
    camera: &Camera,
    mut pose: SE3,
    landmarks: &[Vector3<f64>],
    measurements: &[Vector2<f64>],
    excluded: &[bool],
    use_kernel: bool,
) -> SE3 {
    let huber_delta = CHI2_THRESHOLD.sqrt();
    let mut lambda = 1e-3;
    let mut cost = total_cost(camera, &pose, landmarks, measurements, excluded, use_kernel);

    for _ in 0..INNER_ITERATIONS {
        let mut h = Matrix6::<f64>::zeros();
        let mut b = Vector6::<f64>::zeros();

        for i in 0..landmarks.len() {
            if excluded[i] {
                continue;
            }
            let p_cam = pose.transform_point(&landmarks[i]);
            if p_cam.z < 1e-6 {
                continue;
            }
            let residual = measurements[i] - camera.camera_to_pixel(&p_cam);
            let jac = jacobian_pose(camera, &p_cam);

            let weight = if use_kernel {
                huber_weight(residual.norm(), huber_delta)
            } else {
                1.0
            };
            h += weight * jac.transpose() * jac;
            b += weight * jac.transpose() * residual;
        }

        let mut damped = h;
        for i in 0..6 {
            let d = damped[(i, i)];
            damped[(i, i)] = d + lambda * d.max(1e-9);
        }
        let delta = match damped.lu().solve(&(-b)) {
            Some(d) => d,
            None => break,
        };
        if delta.norm() < 1e-10 {
            break;
        }

        let trial = SE3::exp(&delta).compose(&pose);
        let trial_cost = total_cost(camera, &trial, landmarks, measurements, excluded, use_kernel);
        if trial_cost < cost {
            pose = trial;
            cost = trial_cost;
            lambda = (lambda * 0.1).max(1e-10);
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    pose
}

/// Squared pixel residual of one correspondence; points at or behind the
/// camera plane count as gross outliers.
fn edge_chi2(camera: &Camera, pose: &SE3, landmark: &Vector3<f64>, measured: &Vector2<f64>) -> f64 {
    let p_cam = pose.transform_point(landmark);
    if p_cam.z < 1e-6 {
        return f64::INFINITY;
    }
    (measured - camera.camera_to_pixel(&p_cam)).norm_squared()
}

fn total_cost(
    camera: &Camera,
    pose: &SE3,
    landmarks: &[Vector3<f64>],
    measurements: &[Vector2<f64>],
    excluded: &[bool],
    use_kernel: bool,
) -> f64 {
    let huber_delta = CHI2_THRESHOLD.sqrt();
    let mut cost = 0.0;
    for i in 0..landmarks.len() {
        if excluded[i] {
            continue;
        }
        let chi2 = edge_chi2(camera, pose, &landmarks[i], &measurements[i]);
        if !chi2.is_finite() {
            continue;
        }
        cost += if use_kernel {
            huber_cost(chi2, huber_delta)
        } else {
            chi2
        };
    }
    cost
}

/// Jacobian of the residual `z - proj(p_cam)` with respect to a left
/// perturbation `[rho, phi]` of the world-to-camera transform.
fn jacobian_pose(camera: &Camera, p_cam: &Vector3<f64>) -> Matrix2x6<f64> {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let (fx, fy) = (camera.fx, camera.fy);

    Matrix2x6::new(
        -fx * invz,
        0.0,
        fx * x * invz2,
        fx * x * y * invz2,
        -fx - fx * x * x * invz2,
        fx * y * invz,
        0.0,
        -fy * invz,
        fy * y * invz2,
        fy + fy * y * y * invz2,
        -fy * x * y * invz2,
        -fy * x * invz,
    )
}

fn huber_weight(residual_norm: f64, delta: f64) -> f64 {
    if residual_norm <= delta {
        1.0
    } else {
        delta / residual_norm
    }
}

fn huber_cost(chi2: f64, delta: f64) -> f64 {
    if chi2 <= delta * delta {
        chi2
    } else {
        2.0 * delta * chi2.sqrt() - delta * delta
    }
}
