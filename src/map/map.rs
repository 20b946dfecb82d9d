//! The map: shared store of keyframes and landmarks.
//!
//! The map exclusively owns both tables and is the single source of id
//! assignment, so keyframe and landmark ids are globally monotonic. The
//! frontend inserts, the backend refines poses and positions; callers
//! serialize access through the `RwLock` the system wraps around this
//! type.
//!
//! Besides the full tables the map maintains an *active window* of the
//! most recent keyframes (and the landmarks they observe), which is what
//! the backend optimizes. When the window overflows, either the keyframe
//! closest to the current one (if closer than a minimum distance) or the
//! farthest one is retired; retiring removes its observations, and
//! landmarks left without observers drop out of the active set.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;
use tracing::debug;

use super::frame::Frame;
use super::map_point::{MapPoint, Observation};
use super::types::{KeyFrameId, MapPointId};

/// Size of the active keyframe window.
pub const NUM_ACTIVE_KEYFRAMES: usize = 7;

/// Below this pose distance to the current keyframe, the nearest active
/// keyframe is retired instead of the farthest.
const MIN_KEYFRAME_DISTANCE: f64 = 0.2;

#[derive(Default)]
pub struct Map {
    keyframes: HashMap<KeyFrameId, Frame>,
    active_keyframe_ids: HashSet<KeyFrameId>,
    landmarks: HashMap<MapPointId, MapPoint>,
    active_landmark_ids: HashSet<MapPointId>,
    next_keyframe_id: u64,
    next_landmark_id: u64,
    current_keyframe_id: Option<KeyFrameId>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    // ── keyframes ──────────────────────────────────────────────────────

    /// Promote a frame to keyframe: assign the next id, store a copy, and
    /// maintain the active window.
    pub fn insert_keyframe(&mut self, frame: &mut Frame) -> KeyFrameId {
        let id = KeyFrameId(self.next_keyframe_id);
        self.next_keyframe_id += 1;
        frame.keyframe_id = Some(id);

        self.keyframes.insert(id, frame.clone());
        self.active_keyframe_ids.insert(id);
        self.current_keyframe_id = Some(id);

        if self.active_keyframe_ids.len() > NUM_ACTIVE_KEYFRAMES {
            self.retire_keyframe();
            self.clean_active_landmarks();
        }
        id
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&Frame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut Frame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &Frame> {
        self.keyframes.values()
    }

    pub fn active_keyframes(&self) -> impl Iterator<Item = &Frame> {
        self.active_keyframe_ids
            .iter()
            .filter_map(|id| self.keyframes.get(id))
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn num_active_keyframes(&self) -> usize {
        self.active_keyframe_ids.len()
    }

    pub fn current_keyframe_id(&self) -> Option<KeyFrameId> {
        self.current_keyframe_id
    }

    // ── landmarks ──────────────────────────────────────────────────────

    pub fn insert_map_point(&mut self, position: Vector3<f64>) -> MapPointId {
        let id = MapPointId(self.next_landmark_id);
        self.next_landmark_id += 1;
        self.landmarks.insert(id, MapPoint::new(id, position));
        self.active_landmark_ids.insert(id);
        id
    }

    pub fn landmark(&self, id: MapPointId) -> Option<&MapPoint> {
        self.landmarks.get(&id)
    }

    pub fn landmark_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.landmarks.get_mut(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &MapPoint> {
        self.landmarks.values()
    }

    pub fn active_landmarks(&self) -> impl Iterator<Item = &MapPoint> {
        self.active_landmark_ids
            .iter()
            .filter_map(|id| self.landmarks.get(id))
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn num_active_landmarks(&self) -> usize {
        self.active_landmark_ids.len()
    }

    // ── observations ───────────────────────────────────────────────────

    /// Record that a keyframe feature observes a landmark.
    pub fn add_observation(&mut self, id: MapPointId, obs: Observation) -> bool {
        match self.landmarks.get_mut(&id) {
            Some(mp) => {
                mp.add_observation(obs);
                true
            }
            None => false,
        }
    }

    /// Remove one observation and detach the corresponding feature's
    /// landmark link in the stored keyframe.
    pub fn remove_observation(&mut self, id: MapPointId, obs: &Observation) {
        if let Some(mp) = self.landmarks.get_mut(&id) {
            mp.remove_observation(obs);
        }
        if let Some(kf) = self.keyframes.get_mut(&obs.keyframe_id) {
            if obs.on_left_image {
                if let Some(feat) = kf.features_left.get_mut(obs.feature_index) {
                    feat.map_point = None;
                }
            } else if let Some(Some(feat)) = kf.features_right.get_mut(obs.feature_index) {
                feat.map_point = None;
            }
        }
    }

    // ── housekeeping ───────────────────────────────────────────────────

    /// Retire one keyframe from the active window. The candidate is the
    /// nearest active keyframe when it sits closer than
    /// `MIN_KEYFRAME_DISTANCE` to the current one, otherwise the farthest.
    fn retire_keyframe(&mut self) {
        let current_id = match self.current_keyframe_id {
            Some(id) => id,
            None => return,
        };
        let current_twc = match self.keyframes.get(&current_id) {
            Some(kf) => kf.pose.inverse(),
            None => return,
        };

        let mut nearest: Option<(KeyFrameId, f64)> = None;
        let mut farthest: Option<(KeyFrameId, f64)> = None;
        for &id in &self.active_keyframe_ids {
            if id == current_id {
                continue;
            }
            let kf = match self.keyframes.get(&id) {
                Some(kf) => kf,
                None => continue,
            };
            let dist = kf.pose.compose(&current_twc).log().norm();
            if nearest.map_or(true, |(_, d)| dist < d) {
                nearest = Some((id, dist));
            }
            if farthest.map_or(true, |(_, d)| dist > d) {
                farthest = Some((id, dist));
            }
        }

        let retired = match (nearest, farthest) {
            (Some((near_id, near_dist)), Some((far_id, _))) => {
                if near_dist < MIN_KEYFRAME_DISTANCE {
                    near_id
                } else {
                    far_id
                }
            }
            _ => return,
        };

        debug!("Retiring keyframe {} from the active window", retired);
        self.active_keyframe_ids.remove(&retired);
        for mp in self.landmarks.values_mut() {
            mp.remove_keyframe_observations(retired);
        }
    }

    /// Drop active landmarks that no longer have any observers.
    fn clean_active_landmarks(&mut self) {
        let landmarks = &self.landmarks;
        let before = self.active_landmark_ids.len();
        self.active_landmark_ids
            .retain(|id| landmarks.get(id).map_or(false, |mp| mp.observed_times > 0));
        let dropped = before - self.active_landmark_ids.len();
        if dropped > 0 {
            debug!("Dropped {} landmarks from the active window", dropped);
        }
    }
}
