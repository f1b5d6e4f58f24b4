//! Generic staged/local container for one landmark kind.

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::LifecycleConfig;
use crate::geometry::Pose;
use crate::map::feature::{LifecycleCounters, MapFeature, MatchSearch};
use crate::map::types::{Color, FeatureId};
use crate::tracking::TrackingContext;

/// Bucket owning a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapBucket {
    Staged,
    Local,
}

/// A landmark with its lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry<F> {
    pub feature: F,
    pub counters: LifecycleCounters,
    /// Display color, assigned on promotion.
    pub color: Color,
}

impl<F> MapEntry<F> {
    pub fn new(feature: F) -> Self {
        Self {
            feature,
            counters: LifecycleCounters::default(),
            color: Color::default(),
        }
    }
}

/// Changes applied by one map update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapUpdateStats {
    pub tracked: usize,
    pub failed: usize,
    pub lost: usize,
    pub promoted: usize,
    pub discarded: usize,
    pub added: usize,
}

/// Staged and local landmarks of one kind, ordered by id.
#[derive(Debug, Clone)]
pub struct FeatureMap<F: MapFeature> {
    staged: BTreeMap<FeatureId, MapEntry<F>>,
    local: BTreeMap<FeatureId, MapEntry<F>>,
    lifecycle: LifecycleConfig,
}

impl<F: MapFeature> FeatureMap<F> {
    pub fn new(lifecycle: LifecycleConfig) -> Self {
        Self {
            staged: BTreeMap::new(),
            local: BTreeMap::new(),
            lifecycle,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn local(&self) -> impl Iterator<Item = &MapEntry<F>> {
        self.local.values()
    }

    pub fn staged(&self) -> impl Iterator<Item = &MapEntry<F>> {
        self.staged.values()
    }

    pub fn get_local(&self, id: FeatureId) -> Option<&MapEntry<F>> {
        self.local.get(&id)
    }

    pub fn get_staged(&self, id: FeatureId) -> Option<&MapEntry<F>> {
        self.staged.get(&id)
    }

    pub fn bucket_of(&self, id: FeatureId) -> Option<MapBucket> {
        if self.local.contains_key(&id) {
            Some(MapBucket::Local)
        } else if self.staged.contains_key(&id) {
            Some(MapBucket::Staged)
        } else {
            None
        }
    }

    pub fn insert(&mut self, bucket: MapBucket, entry: MapEntry<F>) {
        let id = entry.feature.id();
        match bucket {
            MapBucket::Staged => self.staged.insert(id, entry),
            MapBucket::Local => self.local.insert(id, entry),
        };
    }

    pub fn clear(&mut self) {
        self.staged.clear();
        self.local.clear();
    }

    /// Forget every match of the previous frame.
    pub fn reset_matches(&mut self) {
        for entry in self.staged.values_mut().chain(self.local.values_mut()) {
            entry.feature.set_matched_index(None);
        }
    }

    /// Flag every detection currently matched by a landmark of either bucket.
    pub fn mark_matched(&self, is_matched: &mut [bool]) {
        for entry in self.staged.values().chain(self.local.values()) {
            if let Some(flag) = entry.feature.matched_index().and_then(|index| is_matched.get_mut(index)) {
                *flag = true;
            }
        }
    }

    /// Match local landmarks, in id order. Each matched detection is marked
    /// in `is_matched` and yields one optimizer match.
    pub fn match_local(
        &mut self,
        detections: &F::Detections,
        search: &MatchSearch<'_>,
        is_matched: &mut [bool],
    ) -> Vec<F::Match> {
        let mut matches = Vec::new();
        for entry in self.local.values_mut() {
            let Some(index) = find_and_mark(&mut entry.feature, detections, search, is_matched) else {
                continue;
            };
            match entry.feature.make_match(detections, index) {
                Some(m) => matches.push(m),
                None => {
                    // unusable by the optimizer, but the detection stays reserved
                    debug!("[LocalMap] {} {} matched without an optimization feature", F::KIND, entry.feature.id());
                }
            }
        }
        matches
    }

    /// Match staged landmarks on the remaining detections. Returns the match count.
    pub fn match_staged(&mut self, detections: &F::Detections, search: &MatchSearch<'_>, is_matched: &mut [bool]) -> usize {
        self.staged
            .values_mut()
            .filter_map(|entry| find_and_mark(&mut entry.feature, detections, search, is_matched))
            .count()
    }

    /// Track matched landmarks with the optimized pose and apply the
    /// lifecycle transitions. Landmarks listed in `outliers` count as
    /// unmatched.
    pub fn update<R: Rng + ?Sized>(
        &mut self,
        detections: &F::Detections,
        pose: &Pose,
        outliers: &HashSet<FeatureId>,
        context: &TrackingContext,
        rng: &mut R,
    ) -> MapUpdateStats {
        let mut stats = MapUpdateStats::default();
        let lifecycle = self.lifecycle;

        for entry in self.local.values_mut() {
            if track_entry(entry, detections, pose, outliers, context) {
                entry.counters.mark_local_matched();
                stats.tracked += 1;
            } else {
                entry.counters.mark_local_unmatched(&lifecycle);
                stats.failed += 1;
            }
        }
        let lost: Vec<FeatureId> = self
            .local
            .iter()
            .filter(|(_, entry)| entry.counters.is_lost(&lifecycle))
            .map(|(id, _)| *id)
            .collect();
        for id in &lost {
            self.local.remove(id);
        }
        stats.lost = lost.len();

        for entry in self.staged.values_mut() {
            if track_entry(entry, detections, pose, outliers, context) {
                entry.counters.mark_staged_matched();
            } else {
                entry.counters.mark_staged_unmatched(&lifecycle);
            }
        }
        let (promoted, discarded) = self.promote_and_discard_staged(rng);
        stats.promoted = promoted;
        stats.discarded = discarded;
        stats
    }

    /// Update without a pose: matches are dropped, staged landmarks decay and
    /// local landmarks are left as they are.
    pub fn update_no_pose(&mut self) -> MapUpdateStats {
        let lifecycle = self.lifecycle;
        self.reset_matches();
        for entry in self.staged.values_mut() {
            entry.counters.mark_staged_unmatched(&lifecycle);
        }
        let before = self.staged.len();
        self.staged.retain(|_, entry| !entry.counters.should_discard_staged(&lifecycle));
        MapUpdateStats {
            discarded: before - self.staged.len(),
            ..MapUpdateStats::default()
        }
    }

    /// Create landmarks from the free detections this kind accepts. They go
    /// to the local map directly when `add_to_local` is set.
    pub fn add_features<R: Rng + ?Sized>(
        &mut self,
        detections: &F::Detections,
        pose: &Pose,
        is_matched: &mut [bool],
        add_to_local: bool,
        context: &TrackingContext,
        rng: &mut R,
    ) -> usize {
        let mut added = 0;
        for index in 0..F::detection_count(detections) {
            if is_matched.get(index).copied().unwrap_or(true) || !F::can_add_to_map(detections, index, context) {
                continue;
            }
            let feature = match F::from_detection(detections, index, pose, context) {
                Ok(feature) => feature,
                Err(e) => {
                    debug!("[LocalMap] Could not create {} from detection {}: {}", F::KIND, index, e);
                    continue;
                }
            };
            is_matched[index] = true;

            let mut entry = MapEntry::new(feature);
            if add_to_local {
                entry.color = Color::random(rng);
                self.insert(MapBucket::Local, entry);
            } else {
                self.insert(MapBucket::Staged, entry);
            }
            added += 1;
        }
        added
    }

    /// Remove every landmark for which `upgrade` returns a replacement,
    /// keeping the bucket, counters and color.
    pub fn drain_upgrades<G>(&mut self, mut upgrade: impl FnMut(&F) -> Option<G>) -> Vec<(MapBucket, MapEntry<G>)> {
        let mut upgraded = Vec::new();
        for (bucket, entries) in [(MapBucket::Staged, &mut self.staged), (MapBucket::Local, &mut self.local)] {
            let ids: Vec<FeatureId> = entries.keys().copied().collect();
            for id in ids {
                let Some(replacement) = entries.get(&id).and_then(|entry| upgrade(&entry.feature)) else {
                    continue;
                };
                if let Some(entry) = entries.remove(&id) {
                    upgraded.push((
                        bucket,
                        MapEntry {
                            feature: replacement,
                            counters: entry.counters,
                            color: entry.color,
                        },
                    ));
                }
            }
        }
        upgraded
    }

    fn promote_and_discard_staged<R: Rng + ?Sized>(&mut self, rng: &mut R) -> (usize, usize) {
        let lifecycle = self.lifecycle;
        let mut promoted = 0;
        let mut discarded = 0;

        let ids: Vec<FeatureId> = self.staged.keys().copied().collect();
        for id in ids {
            let Some(entry) = self.staged.get(&id) else {
                continue;
            };
            if entry.counters.should_promote(&lifecycle) {
                if let Some(mut entry) = self.staged.remove(&id) {
                    entry.color = Color::random(rng);
                    self.local.insert(id, entry);
                    promoted += 1;
                }
            } else if entry.counters.should_discard_staged(&lifecycle) {
                self.staged.remove(&id);
                discarded += 1;
            }
        }
        (promoted, discarded)
    }
}

fn find_and_mark<F: MapFeature>(
    feature: &mut F,
    detections: &F::Detections,
    search: &MatchSearch<'_>,
    is_matched: &mut [bool],
) -> Option<usize> {
    let index = feature.find_match(detections, search, is_matched)?;
    match is_matched.get_mut(index) {
        Some(flag) if !*flag => {
            *flag = true;
            feature.set_matched_index(Some(index));
            Some(index)
        }
        _ => {
            warn!("[LocalMap] {} {} matched an unavailable detection {}", F::KIND, feature.id(), index);
            None
        }
    }
}

/// Track a matched, non outlier entry. False when the entry counts as
/// unmatched this frame.
fn track_entry<F: MapFeature>(
    entry: &mut MapEntry<F>,
    detections: &F::Detections,
    pose: &Pose,
    outliers: &HashSet<FeatureId>,
    context: &TrackingContext,
) -> bool {
    let Some(index) = entry.feature.matched_index() else {
        return false;
    };
    let id = entry.feature.id();
    if outliers.contains(&id) {
        entry.feature.set_matched_index(None);
        return false;
    }
    match entry.feature.track(detections, index, pose, context) {
        Ok(()) => true,
        Err(e) => {
            debug!("[LocalMap] Tracking of {} {} failed: {}", F::KIND, id, e);
            entry.feature.set_matched_index(None);
            false
        }
    }
}
