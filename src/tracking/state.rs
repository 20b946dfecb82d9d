//! Frontend tracking states.

/// State of the tracking frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontendStatus {
    /// Waiting for a stereo pair with enough matches to build the map.
    #[default]
    Initing,
    /// Tracking with a comfortable inlier margin.
    TrackingGood,
    /// Tracking with few inliers; keyframes are inserted aggressively.
    TrackingBad,
    /// Tracking failed; the next frame triggers a reset.
    Lost,
}
