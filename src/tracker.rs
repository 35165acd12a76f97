//! Centroid tracker.
//!
//! Collapses per-frame detections into distinct physical objects so a vehicle
//! visible for many frames is counted and persisted once. Matching is
//! nearest-centroid within a distance threshold, restricted to the same class.
//! Tracks not seen for `ttl` are dropped; a later detection of the same object
//! becomes a new track.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::detect::Detection;

pub const DEFAULT_TRACK_TTL: Duration = Duration::from_secs(1);
pub const DEFAULT_MATCH_THRESHOLD: f32 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerConfig {
    /// A track expires once `now - last_seen >= ttl`.
    pub ttl: Duration,
    /// Matches need a centroid distance strictly below this, in source pixels.
    pub match_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TRACK_TTL,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub track_id: u64,
    /// Lower-cased class label.
    pub class_name: String,
    pub last_center: (f32, f32),
    pub first_seen: Duration,
    pub last_seen: Duration,
    pub best_confidence: f32,
}

/// A track created during this update, with the detection that created it.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmedTrack {
    pub track_id: u64,
    pub detection: Detection,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackUpdate {
    /// Running per-class counts after this update.
    pub counts: BTreeMap<String, u64>,
    /// Tracks created by this update that were never emitted before.
    pub newly_confirmed: Vec<ConfirmedTrack>,
}

pub struct Tracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
    /// Highest track id handed out in `newly_confirmed`. Ids only grow, so
    /// this replaces a per-track record of what was emitted.
    emitted_through: u64,
    counts: BTreeMap<String, u64>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
            emitted_through: 0,
            counts: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    /// Fold one frame's detections into the track set.
    ///
    /// `now` is any monotonic clock reading; only differences matter.
    pub fn update(&mut self, detections: &[Detection], now: Duration) -> TrackUpdate {
        let ttl = self.config.ttl;
        self.tracks
            .retain(|t| now.saturating_sub(t.last_seen) < ttl);

        let mut newly_confirmed = Vec::new();
        for det in detections {
            if !det.is_well_formed() {
                log::debug!("tracker: skipping malformed detection {:?}", det);
                continue;
            }
            let class_name = det.class_name.trim().to_lowercase();
            let center = det.centroid();

            match self.nearest(&class_name, center) {
                Some(idx) => {
                    let track = &mut self.tracks[idx];
                    track.last_center = center;
                    track.last_seen = now;
                    track.best_confidence = track.best_confidence.max(det.confidence);
                }
                None => {
                    let track_id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        track_id,
                        class_name: class_name.clone(),
                        last_center: center,
                        first_seen: now,
                        last_seen: now,
                        best_confidence: det.confidence,
                    });
                    *self.counts.entry(class_name).or_insert(0) += 1;
                    if track_id > self.emitted_through {
                        self.emitted_through = track_id;
                        newly_confirmed.push(ConfirmedTrack {
                            track_id,
                            detection: det.clone(),
                        });
                    }
                }
            }
        }

        TrackUpdate {
            counts: self.counts.clone(),
            newly_confirmed,
        }
    }

    fn nearest(&self, class_name: &str, center: (f32, f32)) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (idx, track) in self.tracks.iter().enumerate() {
            if track.class_name != class_name {
                continue;
            }
            let dx = track.last_center.0 - center.0;
            let dy = track.last_center.1 - center.1;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist >= self.config.match_threshold {
                continue;
            }
            // Strict comparison keeps the first track on ties.
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((idx, dist));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Forget live tracks and counts. IDs keep increasing so records written
    /// before the reset never collide with later ones.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.counts.clear();
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    pub fn total_count(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn live_tracks(&self) -> &[Track] {
        &self.tracks
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn det(class: &str, cx: f32, cy: f32) -> Detection {
        Detection::new(
            BoundingBox {
                cx,
                cy,
                w: 40.0,
                h: 30.0,
            },
            class,
            0.8,
        )
    }

    fn secs(s: f32) -> Duration {
        Duration::from_secs_f32(s)
    }

    #[test]
    fn nearby_detection_within_ttl_is_the_same_object() {
        let mut tracker = Tracker::default();
        let first = tracker.update(&[det("car", 100.0, 100.0)], secs(0.0));
        assert_eq!(first.newly_confirmed.len(), 1);

        let second = tracker.update(&[det("car", 110.0, 105.0)], secs(0.5));
        assert!(second.newly_confirmed.is_empty());
        assert_eq!(second.counts.get("car"), Some(&1));
        assert_eq!(tracker.live_tracks().len(), 1);
        assert_eq!(tracker.live_tracks()[0].last_center, (110.0, 105.0));
    }

    #[test]
    fn expired_track_reemerges_as_new_object() {
        let mut tracker = Tracker::default();
        tracker.update(&[det("car", 100.0, 100.0)], secs(0.0));
        let later = tracker.update(&[det("car", 110.0, 105.0)], secs(1.5));
        assert_eq!(later.newly_confirmed.len(), 1);
        assert_eq!(later.newly_confirmed[0].track_id, 2);
        assert_eq!(later.counts.get("car"), Some(&2));
    }

    #[test]
    fn ttl_boundary_expires() {
        let mut tracker = Tracker::default();
        tracker.update(&[det("car", 100.0, 100.0)], secs(0.0));
        let at_ttl = tracker.update(&[det("car", 100.0, 100.0)], secs(1.0));
        assert_eq!(at_ttl.newly_confirmed.len(), 1);
    }

    #[test]
    fn classes_never_match_each_other() {
        let mut tracker = Tracker::default();
        tracker.update(&[det("car", 100.0, 100.0)], secs(0.0));
        let update = tracker.update(&[det("Truck", 102.0, 100.0)], secs(0.1));
        assert_eq!(update.newly_confirmed.len(), 1);
        assert_eq!(update.counts.get("truck"), Some(&1));
        assert_eq!(tracker.total_count(), 2);
    }

    #[test]
    fn distance_threshold_is_strict() {
        let mut tracker = Tracker::new(TrackerConfig {
            ttl: DEFAULT_TRACK_TTL,
            match_threshold: 10.0,
        });
        tracker.update(&[det("car", 0.0, 0.0)], secs(0.0));
        let update = tracker.update(&[det("car", 10.0, 0.0)], secs(0.1));
        assert_eq!(update.newly_confirmed.len(), 1);
    }

    #[test]
    fn each_track_is_emitted_once_across_many_frames() {
        let mut tracker = Tracker::default();
        let mut emitted = Vec::new();
        for step in 0..50 {
            let x = 10.0 + step as f32 * 4.0;
            let update = tracker.update(
                &[det("car", x, 50.0), det("bus", x, 300.0)],
                Duration::from_millis(step * 100),
            );
            emitted.extend(update.newly_confirmed.into_iter().map(|c| c.track_id));
        }
        assert_eq!(emitted, vec![1, 2]);
        assert_eq!(tracker.total_count(), 2);
    }

    #[test]
    fn expired_tracks_leave_nothing_behind() {
        let mut tracker = Tracker::default();
        let ttl = tracker.config().ttl;
        let mut emitted = 0;
        for step in 0..500u32 {
            let now = ttl * (step * 2);
            let update = tracker.update(&[det("car", 50.0, 50.0)], now);
            emitted += update.newly_confirmed.len();
            assert_eq!(tracker.live_tracks().len(), 1);
        }
        assert_eq!(emitted, 500);
        assert_eq!(tracker.emitted_through, 500);
    }

    #[test]
    fn malformed_detections_are_skipped() {
        let mut tracker = Tracker::default();
        let mut bad = det("car", f32::NAN, 0.0);
        let update = tracker.update(&[bad.clone()], secs(0.0));
        assert!(update.newly_confirmed.is_empty());
        bad = det("  ", 1.0, 1.0);
        assert!(tracker.update(&[bad], secs(0.0)).counts.is_empty());
    }

    #[test]
    fn reset_keeps_ids_monotonic() {
        let mut tracker = Tracker::default();
        tracker.update(&[det("car", 0.0, 0.0)], secs(0.0));
        tracker.reset();
        assert_eq!(tracker.total_count(), 0);
        let update = tracker.update(&[det("car", 0.0, 0.0)], secs(0.1));
        assert_eq!(update.newly_confirmed.len(), 1);
        assert_eq!(update.newly_confirmed[0].track_id, 2);
    }
}
