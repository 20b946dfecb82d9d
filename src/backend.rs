//! Bundle-adjustment backend.
//!
//! Runs in its own thread and wakes on `update_map` notifications from
//! the frontend. Each pass snapshots the map's active window (keyframe
//! poses, landmark positions, and their pixel observations) under a read
//! lock, refines poses and positions jointly with a robustified
//! Levenberg-Marquardt, and writes the result back under a write lock.
//! No lock is held while optimizing.
//!
//! The normal equations are accumulated in blocks and the landmark block
//! is eliminated per point (its Hessian is 3x3 block diagonal), leaving a
//! dense system only over the handful of free poses. The oldest keyframe
//! in the window is held fixed to pin the gauge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, Matrix6, Vector2, Vector3};
use nalgebra::{Matrix2x6, SMatrix};
use parking_lot::RwLock;
use tracing::debug;

use crate::camera::Camera;
use crate::geometry::{se3::skew, SE3};
use crate::map::{KeyFrameId, Map, MapPointId, Observation};
use crate::tracking::pose_optimizer::CHI2_THRESHOLD;

const MAX_ITERATIONS: usize = 10;

/// Cheap handle the frontend uses to poke the backend.
#[derive(Clone)]
pub struct BackendHandle {
    tx: Sender<()>,
}

impl BackendHandle {
    /// Non-blocking notification that map contents changed. Coalesces
    /// with any wakeup already pending.
    pub fn update_map(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Owner of the optimization thread.
pub struct Backend {
    handle: BackendHandle,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Backend {
    pub fn new(camera_left: Camera, camera_right: Camera, map: Arc<RwLock<Map>>) -> Self {
        let (tx, rx) = bounded::<()>(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let shutdown = shutdown.clone();
            thread::spawn(move || backend_loop(rx, shutdown, camera_left, camera_right, map))
        };

        Self {
            handle: BackendHandle { tx },
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> BackendHandle {
        self.handle.clone()
    }

    /// Signal the thread to drain and exit, then join it.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.handle.tx.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.close();
    }
}

fn backend_loop(
    rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    camera_left: Camera,
    camera_right: Camera,
    map: Arc<RwLock<Map>>,
) {
    while rx.recv().is_ok() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        optimize_active_map(&camera_left, &camera_right, &map);
    }
}

/// One observation in the snapshot, resolved to window indices.
struct Edge {
    kf_idx: usize,
    mp_idx: usize,
    pixel: Vector2<f64>,
    on_left: bool,
    /// Original record, kept for pruning outliers afterwards.
    source: Observation,
}

/// Refine the active window once. Public mainly so the end of a run (or
/// a test) can trigger a synchronous pass.
pub fn optimize_active_map(camera_left: &Camera, camera_right: &Camera, map: &Arc<RwLock<Map>>) {
    // Snapshot the active window.
    let (kf_ids, mut poses, mp_ids, mut points, edges) = {
        let map = map.read();

        let mut kfs: Vec<(KeyFrameId, SE3)> = map
            .active_keyframes()
            .filter_map(|f| f.keyframe_id.map(|id| (id, f.pose.clone())))
            .collect();
        kfs.sort_by_key(|(id, _)| *id);
        let kf_index: HashMap<KeyFrameId, usize> =
            kfs.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();

        let mut mp_ids: Vec<MapPointId> = Vec::new();
        let mut points: Vec<Vector3<f64>> = Vec::new();
        let mut edges: Vec<Edge> = Vec::new();
        for mp in map.active_landmarks() {
            let mp_idx = mp_ids.len();
            let mut mp_edges = Vec::new();
            for obs in mp.observations() {
                let Some(&kf_idx) = kf_index.get(&obs.keyframe_id) else {
                    continue;
                };
                let Some(kf) = map.keyframe(obs.keyframe_id) else {
                    continue;
                };
                let position = if obs.on_left_image {
                    match kf.features_left.get(obs.feature_index) {
                        Some(feat) => feat.position,
                        None => continue,
                    }
                } else {
                    match kf.features_right.get(obs.feature_index) {
                        Some(Some(feat)) => feat.position,
                        _ => continue,
                    }
                };
                mp_edges.push(Edge {
                    kf_idx,
                    mp_idx,
                    pixel: Vector2::new(position.x as f64, position.y as f64),
                    on_left: obs.on_left_image,
                    source: *obs,
                });
            }
            if !mp_edges.is_empty() {
                mp_ids.push(mp.id);
                points.push(mp.position);
                edges.append(&mut mp_edges);
            }
        }

        let kf_ids: Vec<KeyFrameId> = kfs.iter().map(|(id, _)| *id).collect();
        let poses: Vec<SE3> = kfs.into_iter().map(|(_, pose)| pose).collect();
        (kf_ids, poses, mp_ids, points, edges)
    };

    if kf_ids.len() < 2 || edges.is_empty() {
        return;
    }

    solve(camera_left, camera_right, &mut poses, &mut points, &edges);

    // Classify outliers at the refined state.
    let mut pruned: Vec<(MapPointId, Observation)> = Vec::new();
    for edge in &edges {
        let camera = if edge.on_left { camera_left } else { camera_right };
        let chi2 = edge_chi2(camera, &poses[edge.kf_idx], &points[edge.mp_idx], &edge.pixel);
        if chi2 > CHI2_THRESHOLD {
            pruned.push((mp_ids[edge.mp_idx], edge.source));
        }
    }

    // Write back.
    {
        let mut map = map.write();
        // The first (oldest) keyframe is the fixed anchor.
        for (i, id) in kf_ids.iter().enumerate().skip(1) {
            if let Some(kf) = map.keyframe_mut(*id) {
                kf.pose = poses[i].clone();
            }
        }
        for (i, id) in mp_ids.iter().enumerate() {
            if let Some(mp) = map.landmark_mut(*id) {
                mp.position = points[i];
            }
        }
        for (mp_id, obs) in &pruned {
            map.remove_observation(*mp_id, obs);
        }
    }

    debug!(
        "Backend pass: {} keyframes, {} landmarks, {} edges, {} observations pruned",
        kf_ids.len(),
        mp_ids.len(),
        edges.len(),
        pruned.len()
    );
}

/// Joint LM over free poses (all but index 0) and all points.
fn solve(
    camera_left: &Camera,
    camera_right: &Camera,
    poses: &mut [SE3],
    points: &mut [Vector3<f64>],
    edges: &[Edge],
) {
    let num_free = poses.len() - 1;
    let huber_delta = CHI2_THRESHOLD.sqrt();
    let mut lambda = 1e-4;
    let mut cost = total_cost(camera_left, camera_right, poses, points, edges, huber_delta);

    for _ in 0..MAX_ITERATIONS {
        let mut h_pp = DMatrix::<f64>::zeros(6 * num_free, 6 * num_free);
        let mut b_p = DVector::<f64>::zeros(6 * num_free);
        let mut h_ll: Vec<Matrix3<f64>> = vec![Matrix3::zeros(); points.len()];
        let mut b_l: Vec<Vector3<f64>> = vec![Vector3::zeros(); points.len()];
        let mut h_pl: HashMap<(usize, usize), SMatrix<f64, 6, 3>> = HashMap::new();

        for edge in edges {
            let camera = if edge.on_left { camera_left } else { camera_right };
            let pose = &poses[edge.kf_idx];
            let point = &points[edge.mp_idx];

            let p_t = pose.transform_point(point);
            let p_c = camera.pose().transform_point(&p_t);
            if p_c.z < 1e-6 {
                continue;
            }
            let residual = edge.pixel - camera.camera_to_pixel(&p_c);
            let weight = huber_weight(residual.norm(), huber_delta);

            let d_proj = Matrix2x3::new(
                camera.fx / p_c.z,
                0.0,
                -camera.fx * p_c.x / (p_c.z * p_c.z),
                0.0,
                camera.fy / p_c.z,
                -camera.fy * p_c.y / (p_c.z * p_c.z),
            );
            let r_ext = camera.pose().rotation_matrix();

            let j_point: Matrix2x3<f64> = -d_proj * r_ext * pose.rotation_matrix();
            h_ll[edge.mp_idx] += weight * j_point.transpose() * j_point;
            b_l[edge.mp_idx] += weight * j_point.transpose() * residual;

            if edge.kf_idx > 0 {
                let p = edge.kf_idx - 1;
                let mut d_pt = SMatrix::<f64, 3, 6>::zeros();
                d_pt.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());
                d_pt.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-skew(&p_t)));
                let j_pose: Matrix2x6<f64> = -d_proj * r_ext * d_pt;

                let block: Matrix6<f64> = weight * j_pose.transpose() * j_pose;
                for r in 0..6 {
                    for c in 0..6 {
                        h_pp[(6 * p + r, 6 * p + c)] += block[(r, c)];
                    }
                }
                let grad = weight * j_pose.transpose() * residual;
                for r in 0..6 {
                    b_p[6 * p + r] += grad[r];
                }
                *h_pl
                    .entry((p, edge.mp_idx))
                    .or_insert_with(SMatrix::<f64, 6, 3>::zeros) +=
                    weight * j_pose.transpose() * j_point;
            }
        }

        // Damping on both diagonals.
        for i in 0..6 * num_free {
            let d = h_pp[(i, i)];
            h_pp[(i, i)] = d + lambda * d.max(1e-9);
        }
        let h_ll_inv: Vec<Option<Matrix3<f64>>> = h_ll
            .iter()
            .map(|h| {
                let mut damped = *h;
                for i in 0..3 {
                    let d = damped[(i, i)];
                    damped[(i, i)] = d + lambda * d.max(1e-9);
                }
                damped.try_inverse()
            })
            .collect();

        // Schur complement: eliminate points, solve for poses.
        let mut s = h_pp.clone();
        let mut b_s = b_p.clone();
        for (&(p, l), w_pl) in &h_pl {
            let Some(inv) = h_ll_inv[l] else { continue };
            for (&(q, l2), w_ql) in &h_pl {
                if l2 != l {
                    continue;
                }
                let block = w_pl * inv * w_ql.transpose();
                for r in 0..6 {
                    for c in 0..6 {
                        s[(6 * p + r, 6 * q + c)] -= block[(r, c)];
                    }
                }
            }
            let rhs = w_pl * inv * b_l[l];
            for r in 0..6 {
                b_s[6 * p + r] -= rhs[r];
            }
        }

        let Some(delta_p) = s.lu().solve(&(-b_s)) else {
            break;
        };

        // Back-substitute point updates.
        let mut delta_l: Vec<Vector3<f64>> = vec![Vector3::zeros(); points.len()];
        for (l, inv) in h_ll_inv.iter().enumerate() {
            let Some(inv) = inv else { continue };
            let mut rhs = -b_l[l];
            for (&(p, l2), w_pl) in &h_pl {
                if l2 != l {
                    continue;
                }
                let dp = nalgebra::Vector6::new(
                    delta_p[6 * p],
                    delta_p[6 * p + 1],
                    delta_p[6 * p + 2],
                    delta_p[6 * p + 3],
                    delta_p[6 * p + 4],
                    delta_p[6 * p + 5],
                );
                rhs -= w_pl.transpose() * dp;
            }
            delta_l[l] = inv * rhs;
        }

        let step_norm: f64 = delta_p.norm_squared()
            + delta_l.iter().map(|d| d.norm_squared()).sum::<f64>();
        if step_norm.sqrt() < 1e-10 {
            break;
        }

        // Trial state.
        let mut trial_poses = poses.to_vec();
        for p in 0..num_free {
            let xi = nalgebra::Vector6::new(
                delta_p[6 * p],
                delta_p[6 * p + 1],
                delta_p[6 * p + 2],
                delta_p[6 * p + 3],
                delta_p[6 * p + 4],
                delta_p[6 * p + 5],
            );
            trial_poses[p + 1] = SE3::exp(&xi).compose(&trial_poses[p + 1]);
        }
        let trial_points: Vec<Vector3<f64>> = points
            .iter()
            .zip(delta_l.iter())
            .map(|(p, d)| p + d)
            .collect();

        let trial_cost = total_cost(
            camera_left,
            camera_right,
            &trial_poses,
            &trial_points,
            edges,
            huber_delta,
        );
        if trial_cost < cost {
            poses.clone_from_slice(&trial_poses);
            points.copy_from_slice(&trial_points);
            cost = trial_cost;
            lambda = (lambda * 0.1).max(1e-10);
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }
}

fn edge_chi2(camera: &Camera, pose: &SE3, point: &Vector3<f64>, pixel: &Vector2<f64>) -> f64 {
    let p_c = camera.pose().transform_point(&pose.transform_point(point));
    if p_c.z < 1e-6 {
        return f64::INFINITY;
    }
    (pixel - camera.camera_to_pixel(&p_c)).norm_squared()
}

fn total_cost(
    camera_left: &Camera,
    camera_right: &Camera,
    poses: &[SE3],
    points: &[Vector3<f64>],
    edges: &[Edge],
    huber_delta: f64,
) -> f64 {
    let mut cost = 0.0;
    for edge in edges {
        let camera = if edge.on_left { camera_left } else { camera_right };
        let chi2 = edge_chi2(camera, &poses[edge.kf_idx], &points[edge.mp_idx], &edge.pixel);
        if !chi2.is_finite() {
            continue;
        }
        cost += if chi2 <= huber_delta * huber_delta {
            chi2
        } else {
            2.0 * huber_delta * chi2.sqrt() - huber_delta * huber_delta
        };
    }
    cost
}

fn huber_weight(residual_norm: f64, delta: f64) -> f64 {
    if residual_norm <= delta {
        1.0
    } else {
        delta / residual_norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Frame;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use opencv::core::{Mat, Point2f, Scalar};

    fn cameras() -> (Camera, Camera) {
        let left = Camera::new(400.0, 400.0, 320.0, 240.0, 0.5, SE3::identity());
        let right = Camera::new(
            400.0,
            400.0,
            320.0,
            240.0,
            0.5,
            SE3::new(UnitQuaternion::identity(), Vector3::new(-0.5, 0.0, 0.0)),
        );
        (left, right)
    }

    fn blank() -> Mat {
        Mat::new_rows_cols_with_default(480, 640, opencv::core::CV_8UC1, Scalar::all(0.0)).unwrap()
    }

    /// Two keyframes observing a grid of landmarks; the second pose and
    /// one landmark are perturbed and must be pulled back by the backend.
    #[test]
    fn refines_perturbed_window() {
        let (camera_left, camera_right) = cameras();
        let map = Arc::new(RwLock::new(Map::new()));

        let landmarks: Vec<Vector3<f64>> = (0..30)
            .map(|i| {
                Vector3::new(
                    ((i % 6) as f64 - 2.5) * 1.2,
                    ((i / 6) as f64 - 2.0) * 1.0,
                    8.0 + (i % 5) as f64,
                )
            })
            .collect();

        let true_poses = [
            SE3::identity(),
            SE3::new(UnitQuaternion::identity(), Vector3::new(-0.3, 0.0, -0.1)),
        ];

        let mut mp_ids = Vec::new();
        {
            let mut map = map.write();
            for p in &landmarks {
                mp_ids.push(map.insert_map_point(*p));
            }
            for pose in &true_poses {
                let mut frame = Frame::new(0, blank(), blank()).unwrap();
                frame.pose = pose.clone();
                for (i, p) in landmarks.iter().enumerate() {
                    let px = camera_left.world_to_pixel(p, pose);
                    let mut feat =
                        crate::map::Feature::new(Point2f::new(px.x as f32, px.y as f32), 7.0);
                    feat.map_point = Some(mp_ids[i]);
                    frame.features_left.push(feat);
                    frame.features_right.push(None);
                }
                let kf_id = map.insert_keyframe(&mut frame);
                for i in 0..landmarks.len() {
                    map.add_observation(
                        mp_ids[i],
                        Observation {
                            keyframe_id: kf_id,
                            feature_index: i,
                            on_left_image: true,
                        },
                    );
                }
            }

            // Perturb what the backend should fix.
            let second_id = map.current_keyframe_id().unwrap();
            map.keyframe_mut(second_id).unwrap().pose = SE3::new(
                UnitQuaternion::from_euler_angles(0.01, -0.005, 0.008),
                Vector3::new(-0.25, 0.03, -0.15),
            );
            map.landmark_mut(mp_ids[0]).unwrap().position += Vector3::new(0.2, -0.1, 0.3);
        }

        optimize_active_map(&camera_left, &camera_right, &map);

        let map = map.read();
        let second_id = map.current_keyframe_id().unwrap();
        let refined = map.keyframe(second_id).unwrap().pose.clone();
        assert_relative_eq!(
            refined.translation,
            true_poses[1].translation,
            epsilon = 1e-4
        );
        let refined_point = map.landmark(mp_ids[0]).unwrap().position;
        assert_relative_eq!(refined_point, landmarks[0], epsilon = 1e-3);
    }

    #[test]
    fn close_is_idempotent_and_joins() {
        let (camera_left, camera_right) = cameras();
        let map = Arc::new(RwLock::new(Map::new()));
        let mut backend = Backend::new(camera_left, camera_right, map);
        let handle = backend.handle();
        handle.update_map();
        backend.close();
        backend.close();
        // Notifications after shutdown must not panic.
        handle.update_map();
    }
}
