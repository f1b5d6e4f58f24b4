//! Landmark storage: the three landmark kinds, their shared staged/local
//! lifecycle and the local map gathering them.

pub mod feature;
pub mod feature_map;
pub mod local_map;
pub mod map_plane;
pub mod map_point;
pub mod map_point2d;
pub mod types;
pub mod writer;

pub use feature::{LifecycleCounters, MapFeature, MatchSearch, ScreenFootprint};
pub use feature_map::{FeatureMap, MapBucket, MapEntry, MapUpdateStats};
pub use local_map::LocalMap;
pub use map_plane::MapPlane;
pub use map_point::MapPoint;
pub use map_point2d::MapPoint2D;
pub use types::{Color, FeatureId, FeatureKind, PerKind};
pub use writer::{Landmark, LandmarkGeometry, LandmarkRecord, MapWriter, YamlMapWriter};
