use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;

use anyhow::{Context, Result};
use nalgebra::{Matrix4, Matrix6, UnitQuaternion, Vector3, Vector4};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_rgbd_slam::config::SlamConfig;
use rust_rgbd_slam::features::{DetectedFeatures, DetectedKeyPoint, DetectedKeypoints, DetectedPlane, Descriptor};
use rust_rgbd_slam::geometry::{PlaneWorldCoordinates, Pose, ScreenCoordinate, WorldCoordinate};
use rust_rgbd_slam::map::YamlMapWriter;
use rust_rgbd_slam::system::RgbdSlam;

const FRAME_COUNT: usize = 120;
const POINT_COUNT: usize = 300;

/// Noise applied to the synthetic observations.
const PIXEL_NOISE: f64 = 0.5;
const DEPTH_NOISE_RATIO: f64 = 0.002;

/// Static synthetic room: textured points and its walls.
struct SyntheticScene {
    points: Vec<(Vector3<f64>, Descriptor)>,
    planes: Vec<(PlaneWorldCoordinates, Vector3<f64>)>,
}

impl SyntheticScene {
    fn new(rng: &mut SmallRng) -> Result<Self> {
        let points = (0..POINT_COUNT)
            .map(|_| {
                let position = Vector3::new(
                    rng.gen_range(-2000.0..2000.0),
                    rng.gen_range(-1200.0..1200.0),
                    rng.gen_range(1500.0..4500.0),
                );
                (position, Descriptor::random(rng))
            })
            .collect();
        let planes = vec![
            (
                PlaneWorldCoordinates::new(Vector3::new(0.0, 0.0, -1.0), 5000.0)?,
                Vector3::new(0.0, 0.0, 5000.0),
            ),
            (
                PlaneWorldCoordinates::new(Vector3::new(0.0, -1.0, 0.0), 1400.0)?,
                Vector3::new(0.0, 1400.0, 3000.0),
            ),
            (
                PlaneWorldCoordinates::new(Vector3::new(1.0, 0.0, 0.0), 2500.0)?,
                Vector3::new(-2500.0, 0.0, 3000.0),
            ),
        ];
        Ok(Self { points, planes })
    }

    fn observe(&self, config: &SlamConfig, pose: &Pose, rng: &mut SmallRng) -> Result<DetectedFeatures> {
        let w2c = pose.world_to_camera();
        let pixel_noise = Normal::new(0.0, PIXEL_NOISE)?;
        let depth_noise = Normal::new(0.0, DEPTH_NOISE_RATIO)?;

        let keypoints = self
            .points
            .iter()
            .filter_map(|(position, descriptor)| {
                let camera = WorldCoordinate(*position).to_camera(&w2c);
                let screen = camera.to_screen(&config.camera).ok()?;
                let depth = camera.0.z * (1.0 + depth_noise.sample(rng));
                Some(DetectedKeyPoint::new(
                    ScreenCoordinate::new(
                        screen.u + pixel_noise.sample(rng),
                        screen.v + pixel_noise.sample(rng),
                        depth,
                    ),
                    Some(*descriptor),
                ))
            })
            .collect();
        let planes = self
            .planes
            .iter()
            .map(|(plane, centroid)| {
                DetectedPlane::new(
                    plane.to_camera(&w2c),
                    Matrix4::from_diagonal(&Vector4::new(1e-4, 1e-4, 1e-4, 25.0)),
                    WorldCoordinate(*centroid).to_camera(&w2c),
                )
            })
            .collect();
        Ok(DetectedFeatures {
            keypoints: DetectedKeypoints::new(keypoints, HashMap::new()),
            planes,
        })
    }
}

/// Ground truth: a slow arc with a small yaw.
fn ground_truth(frame: usize) -> Pose {
    let t = frame as f64 / FRAME_COUNT as f64;
    let angle = t * std::f64::consts::FRAC_PI_4;
    Pose::new(
        Vector3::new(600.0 * angle.sin(), 50.0 * (3.0 * angle).sin(), 400.0 * (1.0 - angle.cos())),
        UnitQuaternion::from_euler_angles(0.0, angle * 0.3, 0.0),
        Matrix6::zeros(),
    )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SlamConfig::from_yaml_file(&path).with_context(|| format!("Failed to load {}", path))?,
        None => SlamConfig::default(),
    };
    let map_output = args.next();

    let mut rng = SmallRng::seed_from_u64(config.optimization.random_seed);
    let scene = SyntheticScene::new(&mut rng)?;
    let mut slam = RgbdSlam::with_initial_pose(config.clone(), ground_truth(0))?;

    let mut position_errors = Vec::with_capacity(FRAME_COUNT);
    for frame in 0..FRAME_COUNT {
        let true_pose = ground_truth(frame);
        let features = scene.observe(&config, &true_pose, &mut rng)?;
        let result = slam.process_frame(&features)?;

        let error = result.pose.position_error(&true_pose);
        if result.pose_optimized {
            position_errors.push(error);
        } else if frame > 0 {
            warn!("Frame {}: no optimized pose, drift {:.1} mm", frame, error);
        }
        info!(
            "Frame {} {}: error {:.2} mm / {:.4} rad, {:.1} ms",
            frame,
            result.state,
            error,
            result.pose.angle_error(&true_pose),
            result.timing.total_ms
        );
    }

    let mean_error = position_errors.iter().sum::<f64>() / position_errors.len().max(1) as f64;
    info!(
        "Replayed {} frames, {} optimized, mean position error {:.2} mm",
        FRAME_COUNT,
        position_errors.len(),
        mean_error
    );

    if let Some(path) = map_output {
        let file = File::create(&path).with_context(|| format!("Failed to create {}", path))?;
        let mut writer = YamlMapWriter::new(BufWriter::new(file));
        slam.write_map(&mut writer)?;
        info!("Local map written to {}", path);
    }
    Ok(())
}
