//! Dataset ingest.

pub mod kitti;

pub use kitti::{KittiDataset, StereoImagePair};
