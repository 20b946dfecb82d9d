//! SE(3) rigid transforms built on nalgebra's unit quaternions.
//!
//! The tangent-space parametrization follows the Sophus convention:
//! a 6-vector `[rho, phi]` with translation first, rotation second.
//! `exp`/`log` are exact, with first-order fallbacks near zero angle.

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3, Vector6};

/// Angle below which the closed-form exp/log coefficients are replaced
/// by their series expansions.
const SMALL_ANGLE: f64 = 1e-8;

/// A rigid transform in 3D: rotation followed by translation.
///
/// `transform_point` computes `R * p + t`. Composition is `self ∘ other`,
/// i.e. `other` is applied first.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a w-first quaternion and a translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a 4x4 homogeneous matrix. The upper-left 3x3 block is
    /// assumed to be a proper rotation.
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let rot = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let rotation = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(rot),
        );
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self {
            rotation,
            translation,
        }
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        mat.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        mat
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Compose two transforms: `(self ∘ other)(p) = self(other(p))`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.inverse();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Exponential map from the tangent space, `xi = [rho, phi]`.
    pub fn exp(xi: &Vector6<f64>) -> SE3 {
        let rho = Vector3::new(xi[0], xi[1], xi[2]);
        let phi = Vector3::new(xi[3], xi[4], xi[5]);

        let theta = phi.norm();
        let rotation = if theta < SMALL_ANGLE {
            UnitQuaternion::identity()
        } else {
            UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(phi), theta)
        };

        let translation = left_jacobian(&phi) * rho;
        SE3 {
            rotation,
            translation,
        }
    }

    /// Logarithm map into the tangent space, inverse of [`SE3::exp`].
    pub fn log(&self) -> Vector6<f64> {
        let phi = self.rotation.scaled_axis();
        let rho = left_jacobian_inv(&phi) * self.translation;
        Vector6::new(rho.x, rho.y, rho.z, phi.x, phi.y, phi.z)
    }
}

/// Skew-symmetric matrix `[v]x` with `[v]x u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Left Jacobian of SO(3), the `V` matrix coupling translation and
/// rotation in the SE(3) exponential.
fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew_phi = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * skew_phi;
    }
    let theta_sq = theta * theta;
    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / (theta_sq * theta)) * skew_phi * skew_phi
}

fn left_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew_phi = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * skew_phi + (1.0 / 12.0) * skew_phi * skew_phi;
    }
    let theta_sq = theta * theta;
    let coeff = 1.0 / theta_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() - 0.5 * skew_phi + coeff * skew_phi * skew_phi
}
