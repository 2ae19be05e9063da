//! Status classification engine.
//!
//! Classifies each athlete into SAFE / APPROACHING / RISK / CROSSED / OCS /
//! STALE from gate metrics, per-device staleness, and an optional
//! start-signal time. Rules live in an explicit ordered table; the first
//! matching rule wins, so the priority contract is verifiable in isolation.

use ahash::AHashMap;
use gatewatch_model::{AthleteStatus, CrossingEvent};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Speed-toward-line floor for APPROACHING (m/s).
const APPROACH_SPEED_FLOOR_MPS: f64 = 0.5;

/// One gate observation for a single athlete, as seen by the classifier.
///
/// `d_perp_signed_m` must already carry the configured sign convention.
#[derive(Debug, Clone, Copy)]
pub struct GateObservation {
    pub d_perp_signed_m: f64,
    pub speed_to_line_mps: f64,
    pub time_to_line_s: Option<f64>,
    pub crossing_event: CrossingEvent,
    pub crossing_time_us: Option<i64>,
}

struct RuleCtx<'a> {
    device_id: u32,
    obs: &'a GateObservation,
    now_s: f64,
}

type Rule = fn(&StatusClassifier, &RuleCtx<'_>) -> Option<AthleteStatus>;

/// Priority-ordered rule table. Staleness outranks everything, including
/// an active crossing.
const RULES: &[(&str, Rule)] = &[
    ("stale", StatusClassifier::rule_stale),
    ("crossed", StatusClassifier::rule_crossed),
    ("risk", StatusClassifier::rule_risk),
    ("approaching", StatusClassifier::rule_approaching),
];

/// Classifies athlete status from gate metrics and timing.
///
/// Owns the per-device last-seen timestamps and the process-wide
/// start-signal time; both change only through explicit calls.
#[derive(Debug)]
pub struct StatusClassifier {
    distance_threshold_m: f64,
    time_threshold_s: f64,
    stale_threshold_s: f64,
    start_signal_ts_ms: Option<i64>,
    last_seen_s: AHashMap<u32, f64>,
}

impl StatusClassifier {
    pub fn new(distance_threshold_m: f64, time_threshold_s: f64, stale_threshold_s: f64) -> Self {
        Self {
            distance_threshold_m,
            time_threshold_s,
            stale_threshold_s,
            start_signal_ts_ms: None,
            last_seen_s: AHashMap::new(),
        }
    }

    /// Record the start signal time (ms since the Unix epoch).
    pub fn set_start_signal(&mut self, ts_ms: i64) {
        self.start_signal_ts_ms = Some(ts_ms);
        info!(ts_ms, "Start signal recorded");
    }

    /// Clear the start signal, e.g. for a new race.
    pub fn clear_start_signal(&mut self) {
        self.start_signal_ts_ms = None;
    }

    pub fn start_signal(&self) -> Option<i64> {
        self.start_signal_ts_ms
    }

    /// Mark a device as freshly observed (called on every parsed position).
    pub fn update_last_seen(&mut self, device_id: u32) {
        self.update_last_seen_at(device_id, unix_now_s());
    }

    /// As [`Self::update_last_seen`], with the clock injected for tests.
    pub fn update_last_seen_at(&mut self, device_id: u32, now_s: f64) {
        self.last_seen_s.insert(device_id, now_s);
    }

    /// Classify an athlete's status. First matching rule in the priority
    /// table wins; the default is SAFE.
    pub fn classify(&self, device_id: u32, obs: &GateObservation) -> AthleteStatus {
        self.classify_at(device_id, obs, unix_now_s())
    }

    /// As [`Self::classify`], with the clock injected for tests.
    pub fn classify_at(&self, device_id: u32, obs: &GateObservation, now_s: f64) -> AthleteStatus {
        let ctx = RuleCtx {
            device_id,
            obs,
            now_s,
        };
        for (_, rule) in RULES {
            if let Some(status) = rule(self, &ctx) {
                return status;
            }
        }
        AthleteStatus::Safe
    }

    fn rule_stale(&self, ctx: &RuleCtx<'_>) -> Option<AthleteStatus> {
        let last_seen = self.last_seen_s.get(&ctx.device_id)?;
        if ctx.now_s - last_seen > self.stale_threshold_s {
            Some(AthleteStatus::Stale)
        } else {
            None
        }
    }

    fn rule_crossed(&self, ctx: &RuleCtx<'_>) -> Option<AthleteStatus> {
        if !ctx.obs.crossing_event.is_crossing() {
            return None;
        }
        // OCS: crossed before the start signal.
        if let (Some(start_ms), Some(crossing_us)) =
            (self.start_signal_ts_ms, ctx.obs.crossing_time_us)
        {
            if crossing_us / 1000 < start_ms {
                return Some(AthleteStatus::Ocs);
            }
        }
        Some(AthleteStatus::Crossed)
    }

    fn rule_risk(&self, ctx: &RuleCtx<'_>) -> Option<AthleteStatus> {
        let eta = ctx.obs.time_to_line_s?;
        let start_ms = self.start_signal_ts_ms?;
        let now_ms = (ctx.now_s * 1000.0) as i64;
        if eta < self.time_threshold_s && now_ms < start_ms {
            Some(AthleteStatus::Risk)
        } else {
            None
        }
    }

    fn rule_approaching(&self, ctx: &RuleCtx<'_>) -> Option<AthleteStatus> {
        if ctx.obs.d_perp_signed_m.abs() < self.distance_threshold_m
            && ctx.obs.speed_to_line_mps > APPROACH_SPEED_FLOOR_MPS
        {
            Some(AthleteStatus::Approaching)
        } else {
            None
        }
    }
}

fn unix_now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
