//! Gatewatch Data Model
//!
//! This module defines the broadcast envelope and all payload types relayed
//! to monitoring clients (schema_version "1.0"). Every message sent over the
//! fan-out, and every line written to a session log, is one [`Envelope`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope schema version stamped on every message.
pub const SCHEMA_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Broadcast message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    PositionUpdate,
    GateMetrics,
    StartLineDefinition,
    DeviceHealth,
    Event,
    Heartbeat,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvelopeKind::PositionUpdate => "position_update",
            EnvelopeKind::GateMetrics => "gate_metrics",
            EnvelopeKind::StartLineDefinition => "start_line_definition",
            EnvelopeKind::DeviceHealth => "device_health",
            EnvelopeKind::Event => "event",
            EnvelopeKind::Heartbeat => "heartbeat",
        };
        f.write_str(s)
    }
}

/// Coaching status classification for one athlete.
///
/// Exactly one status holds per athlete per evaluation; the classifier
/// guarantees the priority ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AthleteStatus {
    Safe,
    Approaching,
    Risk,
    Crossed,
    Ocs,
    Stale,
}

impl std::fmt::Display for AthleteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AthleteStatus::Safe => "SAFE",
            AthleteStatus::Approaching => "APPROACHING",
            AthleteStatus::Risk => "RISK",
            AthleteStatus::Crossed => "CROSSED",
            AthleteStatus::Ocs => "OCS",
            AthleteStatus::Stale => "STALE",
        };
        f.write_str(s)
    }
}

/// Line-crossing event reported by the upstream gate engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossingEvent {
    #[default]
    NoCrossing,
    CrossingLeft,
    CrossingRight,
}

impl CrossingEvent {
    /// Whether this value represents an actual crossing.
    pub fn is_crossing(self) -> bool {
        !matches!(self, CrossingEvent::NoCrossing)
    }
}

/// Discrete event kinds carried by [`EventPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Crossing,
    Ocs,
    RiskAlert,
    StartSignal,
    DeviceOffline,
    DeviceOnline,
}

/// Device categories in the tracking network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Anchor,
    Tag,
    Gateway,
}

/// Start-line quality assessment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateQuality {
    Good,
    Degraded,
    #[default]
    Unknown,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A single athlete position within a `position_update` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub athlete_id: String,
    pub device_id: u32,
    pub name: String,
    pub team: String,
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
    pub sog_kn: Option<f64>,
    pub cog_deg: Option<f64>,
    pub source_mask: u32,
    pub device_ts_ms: i64,
    pub data_age_ms: i64,
}

/// Payload for `position_update` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdatePayload {
    pub positions: Vec<PositionEntry>,
}

/// A single athlete's gate metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateMetricEntry {
    pub athlete_id: String,
    pub device_id: u32,
    pub name: String,
    pub dist_to_line_m: f64,
    pub s_along: f64,
    pub eta_to_line_s: Option<f64>,
    pub speed_to_line_mps: f64,
    pub gate_length_m: f64,
    pub status: AthleteStatus,
    #[serde(default)]
    pub crossing_event: CrossingEvent,
    #[serde(default)]
    pub crossing_confidence: f64,
    #[serde(default)]
    pub position_quality: f64,
}

/// A crossing alert within a `gate_metrics` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateAlert {
    pub athlete_id: String,
    pub name: String,
    pub event: CrossingEvent,
    pub crossing_ts_ms: i64,
    pub confidence: f64,
}

/// Payload for `gate_metrics` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateMetricsPayload {
    pub metrics: Vec<GateMetricEntry>,
    #[serde(default)]
    pub alerts: Vec<GateAlert>,
}

/// An anchor endpoint of the start line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorPoint {
    pub device_id: u32,
    pub anchor_id: String,
    pub lat: f64,
    pub lon: f64,
}

/// Payload for `start_line_definition` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartLineDefinitionPayload {
    pub anchor_left: AnchorPoint,
    pub anchor_right: AnchorPoint,
    pub gate_length_m: f64,
    #[serde(default)]
    pub quality: GateQuality,
}

/// Payload for `device_health` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealthPayload {
    pub device_id: String,
    pub device_type: DeviceType,
    pub online: bool,
    pub last_seen_ms: i64,
    pub battery_pct: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub rssi_dbm: Option<f64>,
    pub time_sync_offset_ms: Option<f64>,
}

/// Payload for discrete `event` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_kind: EventKind,
    #[serde(default)]
    pub athlete_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Payload for periodic `heartbeat` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub uptime_s: i64,
    pub connected_clients: usize,
    pub position_stream_connected: bool,
    pub gate_stream_connected: bool,
    pub athletes_tracked: usize,
    pub messages_relayed: u64,
}

/// Kind-specific envelope payload.
///
/// Untagged on the wire: the envelope's `type` field names the kind, and
/// every variant has a disjoint set of required fields, so deserialization
/// is unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    PositionUpdate(PositionUpdatePayload),
    GateMetrics(GateMetricsPayload),
    StartLineDefinition(StartLineDefinitionPayload),
    DeviceHealth(DeviceHealthPayload),
    Event(EventPayload),
    Heartbeat(HeartbeatPayload),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Common broadcast message envelope.
///
/// `seq` is process-wide monotonic; `ts_ms` is wall clock at assembly time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub schema_version: String,
    pub seq: u64,
    pub ts_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: Payload,
}

impl Envelope {
    /// Create an envelope with the current schema version.
    pub fn new(
        kind: EnvelopeKind,
        seq: u64,
        ts_ms: i64,
        session_id: Option<String>,
        payload: Payload,
    ) -> Self {
        Self {
            kind,
            schema_version: SCHEMA_VERSION.to_string(),
            seq,
            ts_ms,
            session_id,
            payload,
        }
    }

    /// Serialize to a single-line JSON string for transmission and recording.
    pub fn to_json(&self) -> Result<String, ModelError> {
        serde_json::to_string(self).map_err(ModelError::Serialize)
    }

    /// Parse an envelope from a JSON line.
    pub fn from_json(line: &str) -> Result<Self, ModelError> {
        serde_json::from_str(line).map_err(ModelError::Deserialize)
    }
}

/// Errors from envelope (de)serialization.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to serialize envelope: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to deserialize envelope: {0}")]
    Deserialize(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position_envelope() -> Envelope {
        Envelope::new(
            EnvelopeKind::PositionUpdate,
            7,
            1_700_000_000_123,
            Some("S2024-01-01-120000".to_string()),
            Payload::PositionUpdate(PositionUpdatePayload {
                positions: vec![PositionEntry {
                    athlete_id: "T00".to_string(),
                    device_id: 1,
                    name: "Tag 0".to_string(),
                    team: "HKG".to_string(),
                    lat: 22.302,
                    lon: 114.171,
                    alt_m: 1.5,
                    sog_kn: Some(4.2),
                    cog_deg: Some(180.0),
                    source_mask: 3,
                    device_ts_ms: 1_700_000_000_000,
                    data_age_ms: 123,
                }],
            }),
        )
    }

    #[test]
    fn test_envelope_round_trip() {
        let env = sample_position_envelope();
        let json = env.to_json().unwrap();
        let parsed = Envelope::from_json(&json).unwrap();

        assert_eq!(parsed.kind, EnvelopeKind::PositionUpdate);
        assert_eq!(parsed.seq, 7);
        assert_eq!(parsed.schema_version, SCHEMA_VERSION);
        match parsed.payload {
            Payload::PositionUpdate(p) => {
                assert_eq!(p.positions.len(), 1);
                assert_eq!(p.positions[0].athlete_id, "T00");
            }
            other => panic!("Wrong payload variant: {other:?}"),
        }
    }

    #[test]
    fn test_envelope_wire_field_names() {
        let json = sample_position_envelope().to_json().unwrap();
        assert!(json.contains("\"type\":\"position_update\""));
        assert!(json.contains("\"schema_version\":\"1.0\""));
        assert!(json.contains("\"session_id\":\"S2024-01-01-120000\""));
    }

    #[test]
    fn test_session_id_omitted_when_none() {
        let mut env = sample_position_envelope();
        env.session_id = None;
        let json = env.to_json().unwrap();
        assert!(!json.contains("session_id"));
    }

    #[test]
    fn test_status_serialization_uppercase() {
        assert_eq!(
            serde_json::to_string(&AthleteStatus::Ocs).unwrap(),
            "\"OCS\""
        );
        assert_eq!(
            serde_json::to_string(&AthleteStatus::Approaching).unwrap(),
            "\"APPROACHING\""
        );
        let parsed: AthleteStatus = serde_json::from_str("\"STALE\"").unwrap();
        assert_eq!(parsed, AthleteStatus::Stale);
    }

    #[test]
    fn test_crossing_event_default() {
        assert_eq!(CrossingEvent::default(), CrossingEvent::NoCrossing);
        assert!(!CrossingEvent::NoCrossing.is_crossing());
        assert!(CrossingEvent::CrossingLeft.is_crossing());
        let parsed: CrossingEvent = serde_json::from_str("\"CROSSING_RIGHT\"").unwrap();
        assert_eq!(parsed, CrossingEvent::CrossingRight);
    }

    #[test]
    fn test_heartbeat_payload_deserializes_as_heartbeat() {
        let env = Envelope::new(
            EnvelopeKind::Heartbeat,
            1,
            0,
            None,
            Payload::Heartbeat(HeartbeatPayload {
                uptime_s: 60,
                connected_clients: 2,
                position_stream_connected: true,
                gate_stream_connected: false,
                athletes_tracked: 4,
                messages_relayed: 100,
            }),
        );
        let parsed = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        match parsed.payload {
            Payload::Heartbeat(hb) => assert_eq!(hb.connected_clients, 2),
            other => panic!("Wrong payload variant: {other:?}"),
        }
    }

    #[test]
    fn test_gate_metrics_alerts_default_empty() {
        let json = r#"{"type":"gate_metrics","schema_version":"1.0","seq":2,"ts_ms":5,
            "payload":{"metrics":[]}}"#;
        let parsed = Envelope::from_json(json).unwrap();
        match parsed.payload {
            Payload::GateMetrics(g) => assert!(g.alerts.is_empty()),
            other => panic!("Wrong payload variant: {other:?}"),
        }
    }
}
