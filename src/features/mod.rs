//! Detected features of the current frame, as handed to the local map.

pub mod detection;
pub mod keypoints;
pub mod planes;

pub use detection::{DetectedFeatures, KeypointDetector, PlaneDetector, TrackingHint, detect_features};
pub use keypoints::{DetectedKeyPoint, DetectedKeypoints, Descriptor, KeypointMatch};
pub use planes::DetectedPlane;
