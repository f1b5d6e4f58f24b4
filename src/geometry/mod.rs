//! Geometry: rigid transforms, camera model, coordinate frames, planes,
//! inverse-depth points and covariance propagation.

pub mod camera;
pub mod coordinates;
pub mod covariance;
pub mod inverse_depth;
pub mod planes;
pub mod pose;
pub mod se3;
pub mod so3;

pub use camera::CameraModel;
pub use coordinates::{CameraCoordinate, ScreenCoordinate, ScreenCoordinate2D, WorldCoordinate};
pub use covariance::{check_covariance, is_covariance_valid, propagate_covariance};
pub use inverse_depth::InverseDepthWorldPoint;
pub use planes::{PlaneCameraCoordinates, PlaneDistance, PlaneWorldCoordinates};
pub use pose::Pose;
pub use se3::{CameraToWorld, SE3, WorldToCamera};
