//! Landmarks: 3D points in world coordinates.

use nalgebra::Vector3;

use super::types::{KeyFrameId, MapPointId};

/// A weak back-reference from a landmark to one observing feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub keyframe_id: KeyFrameId,
    /// Index into the keyframe's parallel feature vectors.
    pub feature_index: usize,
    pub on_left_image: bool,
}

/// A 3D landmark created by stereo triangulation.
///
/// Observations are weak: dropping one leaves the landmark alive with
/// fewer observers, and the backend only optimizes what is still
/// recorded here.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,
    /// Position in world coordinates; refined by the backend.
    pub position: Vector3<f64>,
    observations: Vec<Observation>,
    /// Number of currently live observations.
    pub observed_times: u32,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Vector3<f64>) -> Self {
        Self {
            id,
            position,
            observations: Vec::new(),
            observed_times: 0,
        }
    }

    pub fn add_observation(&mut self, obs: Observation) {
        self.observations.push(obs);
        self.observed_times += 1;
    }

    /// Remove one exact observation, if present.
    pub fn remove_observation(&mut self, obs: &Observation) -> bool {
        let before = self.observations.len();
        self.observations.retain(|o| o != obs);
        let removed = before - self.observations.len();
        self.observed_times = self.observed_times.saturating_sub(removed as u32);
        removed > 0
    }

    /// Drop every observation made from the given keyframe.
    pub fn remove_keyframe_observations(&mut self, keyframe_id: KeyFrameId) -> usize {
        let before = self.observations.len();
        self.observations.retain(|o| o.keyframe_id != keyframe_id);
        let removed = before - self.observations.len();
        self.observed_times = self.observed_times.saturating_sub(removed as u32);
        removed
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> MapPoint {
        MapPoint::new(MapPointId(3), Vector3::new(1.0, 2.0, 3.0))
    }

    fn obs(kf: u64, idx: usize, left: bool) -> Observation {
        Observation {
            keyframe_id: KeyFrameId(kf),
            feature_index: idx,
            on_left_image: left,
        }
    }

    #[test]
    fn observations_tracked_per_side() {
        let mut mp = point();
        mp.add_observation(obs(0, 4, true));
        mp.add_observation(obs(0, 4, false));
        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observed_times, 2);

        // Removing the left observation leaves the right one alone.
        assert!(mp.remove_observation(&obs(0, 4, true)));
        assert_eq!(mp.num_observations(), 1);
        assert_eq!(mp.observed_times, 1);
        assert!(!mp.observations()[0].on_left_image);
    }

    #[test]
    fn removing_missing_observation_is_noop() {
        let mut mp = point();
        assert!(!mp.remove_observation(&obs(9, 0, true)));
        assert_eq!(mp.observed_times, 0);
    }

    #[test]
    fn keyframe_retirement_drops_only_its_observations() {
        let mut mp = point();
        for kf in 0..3u64 {
            mp.add_observation(obs(kf, 0, true));
        }
        assert_eq!(mp.remove_keyframe_observations(KeyFrameId(1)), 1);
        assert_eq!(mp.num_observations(), 2);
        assert!(mp
            .observations()
            .iter()
            .all(|o| o.keyframe_id != KeyFrameId(1)));
    }
}
