//! Relay service configuration.
//!
//! Defaults mirror a single-start-line deployment; every field can be
//! overridden through `GATEWATCH_`-prefixed environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the relay service.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream position stream endpoint (WebSocket URL).
    pub position_endpoint: String,

    /// Upstream gate metric stream endpoint (WebSocket URL).
    pub gate_endpoint: String,

    /// Topic filter for the position stream.
    pub position_topic: String,

    /// Topic filter for the gate metric stream.
    pub gate_topic: String,

    /// Bind address for the fan-out WebSocket listener.
    pub listen_addr: String,

    /// Athlete registry JSON file.
    pub athlete_registry_path: PathBuf,

    /// Start-line anchor device ids (left, right endpoints).
    pub anchor_left_device_id: u32,
    pub anchor_right_device_id: u32,

    /// Distance threshold for APPROACHING (meters).
    pub threshold_distance_m: f64,

    /// ETA threshold for RISK (seconds).
    pub threshold_time_s: f64,

    /// Staleness timeout (seconds).
    pub threshold_stale_s: f64,

    /// Samples retained per athlete for SOG/COG.
    pub sog_cog_max_samples: usize,

    /// Maximum sample age used in SOG/COG computation (seconds).
    pub sog_cog_max_age_s: f64,

    /// Heartbeat broadcast interval.
    pub heartbeat_interval: Duration,

    /// Session recording directory.
    pub session_data_dir: PathBuf,

    /// Reconnect backoff bounds.
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,

    /// Capacity of each subscriber-to-dispatch handoff channel.
    pub channel_capacity: usize,

    /// Negate d_perp_signed_m so that positive means pre-start side.
    pub gate_sign_flip: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            position_endpoint: "ws://localhost:5000".to_string(),
            gate_endpoint: "ws://localhost:5001".to_string(),
            position_topic: "position".to_string(),
            gate_topic: "gate".to_string(),
            listen_addr: "0.0.0.0:8000".to_string(),
            athlete_registry_path: PathBuf::from("data/athletes.json"),
            anchor_left_device_id: 101,
            anchor_right_device_id: 102,
            threshold_distance_m: 50.0,
            threshold_time_s: 5.0,
            threshold_stale_s: 3.0,
            sog_cog_max_samples: 5,
            sog_cog_max_age_s: 2.0,
            heartbeat_interval: Duration::from_secs(5),
            session_data_dir: PathBuf::from("data/session_packs"),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            channel_capacity: 1024,
            gate_sign_flip: false,
        }
    }
}

impl RelayConfig {
    /// Build a configuration from the environment, starting from defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("GATEWATCH_POSITION_ENDPOINT") {
            cfg.position_endpoint = v;
        }
        if let Ok(v) = std::env::var("GATEWATCH_GATE_ENDPOINT") {
            cfg.gate_endpoint = v;
        }
        if let Ok(v) = std::env::var("GATEWATCH_POSITION_TOPIC") {
            cfg.position_topic = v;
        }
        if let Ok(v) = std::env::var("GATEWATCH_GATE_TOPIC") {
            cfg.gate_topic = v;
        }
        if let Ok(v) = std::env::var("GATEWATCH_LISTEN_ADDR") {
            cfg.listen_addr = v;
        }
        if let Ok(v) = std::env::var("GATEWATCH_REGISTRY_PATH") {
            cfg.athlete_registry_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GATEWATCH_SESSION_DIR") {
            cfg.session_data_dir = PathBuf::from(v);
        }
        if let Some(v) = parse_env("GATEWATCH_THRESHOLD_DISTANCE_M") {
            cfg.threshold_distance_m = v;
        }
        if let Some(v) = parse_env("GATEWATCH_THRESHOLD_TIME_S") {
            cfg.threshold_time_s = v;
        }
        if let Some(v) = parse_env("GATEWATCH_THRESHOLD_STALE_S") {
            cfg.threshold_stale_s = v;
        }
        if let Some(v) = parse_env::<f64>("GATEWATCH_RECONNECT_MIN_S") {
            cfg.reconnect_min = Duration::from_secs_f64(v);
        }
        if let Some(v) = parse_env::<f64>("GATEWATCH_RECONNECT_MAX_S") {
            cfg.reconnect_max = Duration::from_secs_f64(v);
        }
        if let Some(v) = parse_env::<f64>("GATEWATCH_HEARTBEAT_INTERVAL_S") {
            cfg.heartbeat_interval = Duration::from_secs_f64(v);
        }
        if let Some(v) = parse_env("GATEWATCH_ANCHOR_LEFT_ID") {
            cfg.anchor_left_device_id = v;
        }
        if let Some(v) = parse_env("GATEWATCH_ANCHOR_RIGHT_ID") {
            cfg.anchor_right_device_id = v;
        }
        if let Ok(v) = std::env::var("GATEWATCH_GATE_SIGN_FLIP") {
            cfg.gate_sign_flip = matches!(v.as_str(), "1" | "true" | "yes");
        }

        cfg
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.threshold_distance_m, 50.0);
        assert_eq!(cfg.threshold_time_s, 5.0);
        assert_eq!(cfg.threshold_stale_s, 3.0);
        assert_eq!(cfg.sog_cog_max_samples, 5);
        assert!(!cfg.gate_sign_flip);
    }

    #[test]
    fn test_default_backoff_bounds() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.reconnect_min, Duration::from_secs(1));
        assert_eq!(cfg.reconnect_max, Duration::from_secs(30));
    }
}
