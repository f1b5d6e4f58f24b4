//! Frame level orchestration of the SLAM core.

mod slam_system;

pub use slam_system::RgbdSlam;
