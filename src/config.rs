//! System configuration, loaded from a YAML file.
//!
//! Every field has a default so a partial file (or none at all for tests)
//! is enough to construct a working system. Validation happens once at
//! construction time; tracking itself never re-checks these.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Thresholds of the tracking frontend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Detection target per frame.
    pub num_features: i32,
    /// Minimum stereo matches needed to initialize the map.
    pub num_features_init: usize,
    /// Inlier count above which tracking is considered good.
    pub num_features_tracking: usize,
    /// Inlier count above which tracking is merely bad (below: lost).
    pub num_features_tracking_bad: usize,
    /// Below this many inliers the current frame becomes a keyframe.
    pub num_features_needed_for_keyframe: usize,
    /// GFTT quality level.
    pub detector_quality: f64,
    /// Minimum pixel distance between detected corners; also the half
    /// extent of the exclusion boxes painted around tracked features.
    pub detector_min_distance: f64,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            num_features: 150,
            num_features_init: 100,
            num_features_tracking: 50,
            num_features_tracking_bad: 20,
            num_features_needed_for_keyframe: 80,
            detector_quality: 0.01,
            detector_min_distance: 20.0,
        }
    }
}

/// Parameters of the pyramidal Lucas-Kanade tracker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub window_size: i32,
    pub pyramid_levels: i32,
    pub max_iterations: i32,
    pub epsilon: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window_size: 11,
            pyramid_levels: 3,
            max_iterations: 30,
            epsilon: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// KITTI odometry sequence directory.
    pub dataset_dir: PathBuf,
    /// Spawn the rerun viewer.
    pub viewer: bool,
    pub frontend: FrontendConfig,
    pub flow: FlowConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("data/kitti/00"),
            viewer: false,
            frontend: FrontendConfig::default(),
            flow: FlowConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open config {:?}", path))?;
        let config: SystemConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.frontend;
        if f.num_features <= 0 {
            bail!("num_features must be positive, got {}", f.num_features);
        }
        if f.num_features_tracking_bad >= f.num_features_tracking {
            bail!(
                "num_features_tracking_bad ({}) must be below num_features_tracking ({})",
                f.num_features_tracking_bad,
                f.num_features_tracking
            );
        }
        if f.detector_quality <= 0.0 || f.detector_min_distance <= 0.0 {
            bail!("detector quality and min distance must be positive");
        }
        let lk = &self.flow;
        if lk.window_size < 3 || lk.pyramid_levels < 0 || lk.max_iterations <= 0 {
            bail!("invalid optical flow parameters");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frontend.num_features, 150);
        assert_eq!(config.frontend.num_features_init, 100);
        assert_eq!(config.frontend.num_features_needed_for_keyframe, 80);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "frontend:\n  num_features: 200\n";
        let config: SystemConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.frontend.num_features, 200);
        assert_eq!(config.frontend.num_features_tracking, 50);
        assert_eq!(config.flow.window_size, 11);
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let mut config = SystemConfig::default();
        config.frontend.num_features_tracking_bad = 60;
        assert!(config.validate().is_err());
    }
}
