//! Keypoints detected in the current frame, as consumed by the local map.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::geometry::{ScreenCoordinate, ScreenCoordinate2D};
use crate::map::FeatureId;

/// Size of a binary descriptor in bytes (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// 256 bit binary descriptor, compared by Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    /// Number of differing bits.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }
}

/// One detected keypoint. The depth may be invalid, in which case the
/// keypoint can only feed inverse-depth landmarks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedKeyPoint {
    pub coordinates: ScreenCoordinate,
    pub descriptor: Option<Descriptor>,
}

impl DetectedKeyPoint {
    pub fn new(coordinates: ScreenCoordinate, descriptor: Option<Descriptor>) -> Self {
        Self {
            coordinates,
            descriptor,
        }
    }

    pub fn get_2d(&self) -> ScreenCoordinate2D {
        self.coordinates.get_2d()
    }
}

/// Candidate returned by a descriptor search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeypointMatch {
    pub index: usize,
    pub descriptor_distance: u32,
}

/// All keypoints of a frame plus the detector's tracking carry-over: the
/// keypoint index that continues each tracked landmark.
#[derive(Debug, Clone, Default)]
pub struct DetectedKeypoints {
    keypoints: Vec<DetectedKeyPoint>,
    tracking: HashMap<FeatureId, usize>,
}

impl DetectedKeypoints {
    pub fn new(keypoints: Vec<DetectedKeyPoint>, tracking: HashMap<FeatureId, usize>) -> Self {
        // drop carry-overs pointing outside of the keypoint list
        let count = keypoints.len();
        let tracking = tracking.into_iter().filter(|(_, index)| *index < count).collect();
        Self { keypoints, tracking }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DetectedKeyPoint> {
        self.keypoints.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectedKeyPoint> {
        self.keypoints.iter()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracking.len()
    }

    /// Keypoint continuing the track of a landmark, if it is still free.
    pub fn get_tracking_match_index(&self, id: FeatureId, is_matched: &[bool]) -> Option<usize> {
        self.tracking
            .get(&id)
            .copied()
            .filter(|index| !is_matched.get(*index).copied().unwrap_or(true))
    }

    /// Best free keypoint within `radius` px of a projected position.
    pub fn get_match_index(
        &self,
        projected: &ScreenCoordinate2D,
        radius: f64,
        descriptor: &Descriptor,
        maximum_descriptor_distance: u32,
        is_matched: &[bool],
    ) -> Option<KeypointMatch> {
        self.search(
            |keypoint| keypoint.distance(projected),
            radius,
            descriptor,
            maximum_descriptor_distance,
            is_matched,
        )
    }

    /// Best free keypoint within `radius` px of any position of a screen
    /// segment.
    pub fn get_match_index_on_segment(
        &self,
        segment: &crate::tracking::ScreenSegment,
        radius: f64,
        descriptor: &Descriptor,
        maximum_descriptor_distance: u32,
        is_matched: &[bool],
    ) -> Option<KeypointMatch> {
        self.search(
            |keypoint| segment.distance_to(keypoint),
            radius,
            descriptor,
            maximum_descriptor_distance,
            is_matched,
        )
    }

    /// Lowest descriptor distance among the free keypoints inside the search
    /// window, ties broken by screen distance.
    fn search(
        &self,
        screen_distance: impl Fn(&ScreenCoordinate2D) -> f64,
        radius: f64,
        descriptor: &Descriptor,
        maximum_descriptor_distance: u32,
        is_matched: &[bool],
    ) -> Option<KeypointMatch> {
        let mut best: Option<(KeypointMatch, f64)> = None;
        for (index, keypoint) in self.keypoints.iter().enumerate() {
            if is_matched.get(index).copied().unwrap_or(true) {
                continue;
            }
            let Some(candidate) = keypoint.descriptor else {
                continue;
            };
            let distance = screen_distance(&keypoint.get_2d());
            if distance > radius {
                continue;
            }
            let descriptor_distance = descriptor.distance(&candidate);
            if descriptor_distance > maximum_descriptor_distance {
                continue;
            }
            let is_better = match &best {
                None => true,
                Some((current, current_distance)) => {
                    descriptor_distance < current.descriptor_distance
                        || (descriptor_distance == current.descriptor_distance && distance < *current_distance)
                }
            };
            if is_better {
                best = Some((
                    KeypointMatch {
                        index,
                        descriptor_distance,
                    },
                    distance,
                ));
            }
        }
        best.map(|(found, _)| found)
    }
}
