//! Linear triangulation of a 3D point from two or more views.

use nalgebra::{DMatrix, Vector3};

use super::SE3;

/// A solution is accepted only when the smallest singular value is well
/// separated from the next one; otherwise the constraint matrix is close
/// to rank-deficient and the point is unreliable.
const SINGULAR_VALUE_RATIO: f64 = 1e-2;

/// Triangulate a point from `poses[i]` (world-to-camera) and the matching
/// normalized image coordinates `points[i]` on the z=1 plane.
///
/// Stacks two DLT constraints per view and solves for the homogeneous
/// point via SVD. Returns `None` for degenerate configurations (near-rank
/// loss, or a homogeneous solution at infinity). Cheirality is left to
/// the caller, which knows the relevant camera frame.
pub fn triangulate(poses: &[SE3], points: &[Vector3<f64>]) -> Option<Vector3<f64>> {
    assert_eq!(poses.len(), points.len());
    if poses.len() < 2 {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(2 * poses.len(), 4);
    for (i, (pose, pt)) in poses.iter().zip(points.iter()).enumerate() {
        let rot = pose.rotation_matrix();
        let t = &pose.translation;
        // Projection rows [R | t] of this view.
        let row = |k: usize| -> [f64; 4] { [rot[(k, 0)], rot[(k, 1)], rot[(k, 2)], t[k]] };
        let (r0, r1, r2) = (row(0), row(1), row(2));
        for j in 0..4 {
            a[(2 * i, j)] = pt.x * r2[j] - r0[j];
            a[(2 * i + 1, j)] = pt.y * r2[j] - r1[j];
        }
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let sv = &svd.singular_values;

    // nalgebra orders singular values descending; sv[3] is the smallest.
    // Written to fail closed: a NaN ratio (rank-2 system) is rejected too.
    if !(sv[3] / sv[2] < SINGULAR_VALUE_RATIO) {
        return None;
    }

    let h = v_t.row(3);
    if h[3].abs() < 1e-10 {
        return None;
    }
    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}
