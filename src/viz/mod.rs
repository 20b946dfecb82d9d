//! Visualization.

pub mod rerun;

pub use self::rerun::Visualizer;
