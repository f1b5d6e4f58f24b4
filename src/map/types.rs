//! Core identifier and tag types shared by the map and the optimizer.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Process wide source of landmark identifiers. 0 is never handed out.
static NEXT_FEATURE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a landmark.
///
/// Ids are allocated once, when a detection first enters the staged map, and
/// survive promotion and upgrade. They are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureId(pub u64);

impl FeatureId {
    /// Reserved value, never produced by [`FeatureId::next`].
    pub const INVALID: Self = Self(0);

    /// Create a FeatureId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        Self(NEXT_FEATURE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Closed set of landmark kinds handled by the map and the pose optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    /// Point with a resolved world position.
    Point,
    /// Point with unknown depth, stored in inverse-depth form.
    Point2D,
    /// Infinite plane.
    Plane,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 3] = [FeatureKind::Point, FeatureKind::Point2D, FeatureKind::Plane];
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureKind::Point => write!(f, "point"),
            FeatureKind::Point2D => write!(f, "point2d"),
            FeatureKind::Plane => write!(f, "plane"),
        }
    }
}

/// One value per [`FeatureKind`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, bound(deserialize = "T: Deserialize<'de> + Default"))]
pub struct PerKind<T> {
    pub point: T,
    pub point_2d: T,
    pub plane: T,
}

impl<T> PerKind<T> {
    pub fn new(point: T, point_2d: T, plane: T) -> Self {
        Self { point, point_2d, plane }
    }

    pub fn get(&self, kind: FeatureKind) -> &T {
        match kind {
            FeatureKind::Point => &self.point,
            FeatureKind::Point2D => &self.point_2d,
            FeatureKind::Plane => &self.plane,
        }
    }

    pub fn get_mut(&mut self, kind: FeatureKind) -> &mut T {
        match kind {
            FeatureKind::Point => &mut self.point,
            FeatureKind::Point2D => &mut self.point_2d,
            FeatureKind::Plane => &mut self.plane,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(FeatureKind, &T) -> U) -> PerKind<U> {
        PerKind {
            point: f(FeatureKind::Point, &self.point),
            point_2d: f(FeatureKind::Point2D, &self.point_2d),
            plane: f(FeatureKind::Plane, &self.plane),
        }
    }

    /// Iterate over `(kind, value)` pairs in [`FeatureKind::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (FeatureKind, &T)> {
        FeatureKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }
}

/// Display color of a local map landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Color(pub [u8; 3]);

impl Color {
    /// Draw a random, reasonably bright color.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self([
            rng.gen_range(32..=255),
            rng.gen_range(32..=255),
            rng.gen_range(32..=255),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    #[test]
    fn test_feature_id_next_is_unique_and_valid() {
        let a = FeatureId::next();
        let b = FeatureId::next();

        assert!(a.is_valid());
        assert!(b.is_valid());
        assert!(b > a);
    }

    #[test]
    fn test_feature_id_display() {
        assert_eq!(format!("{}", FeatureId::new(12)), "F12");
        assert!(!FeatureId::INVALID.is_valid());
    }

    #[test]
    fn test_per_kind_access() {
        let mut counts = PerKind::new(1usize, 2, 3);
        *counts.get_mut(FeatureKind::Plane) += 1;

        assert_eq!(*counts.get(FeatureKind::Point), 1);
        assert_eq!(*counts.get(FeatureKind::Point2D), 2);
        assert_eq!(*counts.get(FeatureKind::Plane), 4);

        let doubled = counts.map(|_, c| c * 2);
        let total: usize = doubled.iter().map(|(_, c)| *c).sum();
        assert_eq!(total, 14);
    }

    #[test]
    fn test_random_color_is_not_dark() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..32 {
            let Color(rgb) = Color::random(&mut rng);
            assert!(rgb.iter().all(|&c| c >= 32));
        }
    }
}
