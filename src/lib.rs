pub mod config;
pub mod error;
pub mod features;
pub mod geometry;
pub mod map;
pub mod optimizer;
pub mod system;
pub mod tracking;
