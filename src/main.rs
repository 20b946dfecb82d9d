use anyhow::Result;
use tracing::info;

use stereo_vslam::config::SystemConfig;
use stereo_vslam::io::kitti::KittiDataset;
use stereo_vslam::map::Frame;
use stereo_vslam::system::SlamSystem;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/kitti.yaml".to_string());
    let config = SystemConfig::from_yaml(&config_path)?;

    let dataset = KittiDataset::new(&config.dataset_dir)?;
    info!(
        "Loaded {} stereo frames from {:?}",
        dataset.len(),
        config.dataset_dir
    );

    let (camera_left, camera_right) = dataset.cameras();
    let mut system = SlamSystem::new(&config, camera_left, camera_right)?;

    for i in 0..dataset.len() {
        let pair = dataset.stereo_pair(i)?;
        let frame = Frame::new(i as u64, pair.left, pair.right)?;
        let status = system.add_frame(frame)?;

        if i % 50 == 0 {
            let map = system.map().read();
            info!(
                "Frame {}/{}: status={:?}, {} keyframes, {} landmarks",
                i,
                dataset.len(),
                status,
                map.num_keyframes(),
                map.num_landmarks()
            );
        }
    }

    if let Some(pose) = system.current_pose() {
        let center = pose.inverse().translation;
        info!(
            "Final camera position: [{:.3}, {:.3}, {:.3}]",
            center.x, center.y, center.z
        );
    }

    info!("Done, processed {} frames", dataset.len());
    system.shutdown();
    Ok(())
}
