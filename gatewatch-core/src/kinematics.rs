//! SOG/COG estimation from successive position samples.
//!
//! Speed Over Ground and Course Over Ground are derived per athlete with
//! finite differences over a small sliding window of raw fixes. Falls back
//! to "no estimate" when the data is too sparse or too old.

use ahash::AHashMap;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Conversion factor: m/s to knots.
const MPS_TO_KNOTS: f64 = 1.94384;

/// Approximate meters per degree of latitude. Longitude is scaled by
/// cos(latitude) at the sample midpoint.
pub(crate) const METERS_PER_DEG_LAT: f64 = 111_320.0;

/// Time delta floor below which finite differences are numerically useless.
const MIN_DT_S: f64 = 0.001;

/// A timestamped fix used for velocity computation.
#[derive(Debug, Clone, Copy)]
struct Sample {
    lat: f64,
    lon: f64,
    ts_s: f64,
}

/// Computed SOG and COG, rounded to one decimal place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityEstimate {
    /// Speed over ground in knots.
    pub sog_kn: f64,
    /// Course over ground in degrees, [0, 360) clockwise from true north.
    pub cog_deg: f64,
}

/// Per-athlete sliding window and finite-difference computation.
#[derive(Debug)]
struct Estimator {
    max_samples: usize,
    max_age_s: f64,
    samples: VecDeque<Sample>,
}

impl Estimator {
    fn new(max_samples: usize, max_age_s: f64) -> Self {
        Self {
            max_samples,
            max_age_s,
            samples: VecDeque::with_capacity(max_samples),
        }
    }

    fn add_sample(&mut self, lat: f64, lon: f64, ts_s: f64) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { lat, lon, ts_s });
    }

    /// Compute SOG/COG from the two most recent samples younger than the
    /// age window relative to `now_s` (wall clock, not sample time).
    fn compute_at(&self, now_s: f64) -> Option<VelocityEstimate> {
        if self.samples.len() < 2 {
            return None;
        }

        let recent: Vec<&Sample> = self
            .samples
            .iter()
            .filter(|s| now_s - s.ts_s <= self.max_age_s)
            .collect();
        if recent.len() < 2 {
            return None;
        }

        let p0 = recent[recent.len() - 2];
        let p1 = recent[recent.len() - 1];

        let dt = p1.ts_s - p0.ts_s;
        if dt <= MIN_DT_S {
            return None;
        }

        let cos_lat = ((p0.lat + p1.lat) / 2.0).to_radians().cos();
        let meters_per_deg_lon = METERS_PER_DEG_LAT * cos_lat;

        let dn_m = (p1.lat - p0.lat) * METERS_PER_DEG_LAT;
        let de_m = (p1.lon - p0.lon) * meters_per_deg_lon;

        let vel_n = dn_m / dt;
        let vel_e = de_m / dt;

        let speed_mps = (vel_e * vel_e + vel_n * vel_n).sqrt();
        let sog_kn = speed_mps * MPS_TO_KNOTS;

        let cog_deg = vel_e.atan2(vel_n).to_degrees().rem_euclid(360.0);

        Some(VelocityEstimate {
            sog_kn: round1(sog_kn),
            cog_deg: round1(cog_deg),
        })
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Manages SOG/COG estimation for all athletes, one window per device.
#[derive(Debug)]
pub struct SogCogManager {
    max_samples: usize,
    max_age_s: f64,
    estimators: AHashMap<u32, Estimator>,
}

impl SogCogManager {
    pub fn new(max_samples: usize, max_age_s: f64) -> Self {
        Self {
            max_samples,
            max_age_s,
            estimators: AHashMap::new(),
        }
    }

    /// Add a sample for a device and return the latest velocity estimate.
    pub fn update(&mut self, device_id: u32, lat: f64, lon: f64, ts_s: f64) -> Option<VelocityEstimate> {
        let now_s = unix_now_s();
        self.update_at(device_id, lat, lon, ts_s, now_s)
    }

    /// As [`Self::update`], with the wall clock injected for tests.
    pub fn update_at(
        &mut self,
        device_id: u32,
        lat: f64,
        lon: f64,
        ts_s: f64,
        now_s: f64,
    ) -> Option<VelocityEstimate> {
        let estimator = self
            .estimators
            .entry(device_id)
            .or_insert_with(|| Estimator::new(self.max_samples, self.max_age_s));

        estimator.add_sample(lat, lon, ts_s);
        estimator.compute_at(now_s)
    }

    /// Number of devices with at least one sample.
    pub fn tracked_count(&self) -> usize {
        self.estimators.len()
    }
}

fn unix_now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_northward_motion() {
        let mut mgr = SogCogManager::new(5, 2.0);
        assert!(mgr.update_at(1, 22.0000, 114.0000, 0.0, 1.0).is_none());
        let vel = mgr.update_at(1, 22.0001, 114.0000, 1.0, 1.0).unwrap();

        // 0.0001 deg lat over 1 s = 11.132 m/s north = 21.639.. kn
        let expected_kn = 0.0001 * METERS_PER_DEG_LAT * MPS_TO_KNOTS;
        assert_eq!(vel.sog_kn, round1(expected_kn));
        assert_eq!(vel.cog_deg, 0.0);
    }

    #[test]
    fn test_eastward_motion_course_90() {
        let mut mgr = SogCogManager::new(5, 2.0);
        mgr.update_at(1, 22.0, 114.0000, 0.0, 1.0);
        let vel = mgr.update_at(1, 22.0, 114.0001, 1.0, 1.0).unwrap();
        assert_eq!(vel.cog_deg, 90.0);
    }

    #[test]
    fn test_southward_motion_course_180() {
        let mut mgr = SogCogManager::new(5, 2.0);
        mgr.update_at(1, 22.0001, 114.0, 0.0, 1.0);
        let vel = mgr.update_at(1, 22.0000, 114.0, 1.0, 1.0).unwrap();
        assert_eq!(vel.cog_deg, 180.0);
    }

    #[test]
    fn test_insufficient_samples() {
        let mut mgr = SogCogManager::new(5, 2.0);
        assert!(mgr.update_at(1, 22.0, 114.0, 0.0, 0.0).is_none());
    }

    #[test]
    fn test_stale_samples_rejected() {
        let mut mgr = SogCogManager::new(5, 2.0);
        mgr.update_at(1, 22.0000, 114.0, 0.0, 0.5);
        // Second sample arrives, but by now the first is 10 s old.
        let vel = mgr.update_at(1, 22.0001, 114.0, 1.0, 10.0);
        assert!(vel.is_none());
    }

    #[test]
    fn test_tiny_dt_rejected() {
        let mut mgr = SogCogManager::new(5, 2.0);
        mgr.update_at(1, 22.0000, 114.0, 1.0000, 1.0);
        let vel = mgr.update_at(1, 22.0001, 114.0, 1.0005, 1.0);
        assert!(vel.is_none());
    }

    #[test]
    fn test_window_overflow_drops_oldest() {
        let mut mgr = SogCogManager::new(2, 100.0);
        mgr.update_at(1, 22.0000, 114.0, 0.0, 3.0);
        mgr.update_at(1, 22.0001, 114.0, 1.0, 3.0);
        // Third sample evicts the first; estimate uses samples 2 and 3.
        let vel = mgr.update_at(1, 22.0001, 114.0001, 2.0, 3.0).unwrap();
        assert_eq!(vel.cog_deg, 90.0);
    }

    #[test]
    fn test_devices_are_independent() {
        let mut mgr = SogCogManager::new(5, 2.0);
        mgr.update_at(1, 22.0000, 114.0, 0.0, 1.0);
        // A sample for a different device must not complete device 1's pair.
        assert!(mgr.update_at(2, 22.0001, 114.0, 1.0, 1.0).is_none());
        assert_eq!(mgr.tracked_count(), 2);
    }
}
