//! Map structures: frames, landmarks, and the shared store.

pub mod frame;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use frame::{Feature, Frame};
pub use map::{Map, NUM_ACTIVE_KEYFRAMES};
pub use map_point::{MapPoint, Observation};
pub use types::{KeyFrameId, MapPointId};
