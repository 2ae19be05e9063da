//! Relay dispatch core.
//!
//! Everything downstream of the subscriber handoff runs here, on one task:
//! parse, enrich (registry, SOG/COG, status), assemble envelopes, record,
//! and broadcast. The loop selects over the two stream channels, the
//! control channel, and the heartbeat interval.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

use gatewatch_model::{
    AnchorPoint, Envelope, EnvelopeKind, EventKind, EventPayload, GateAlert, GateMetricEntry,
    GateMetricsPayload, GateQuality, HeartbeatPayload, Payload, PositionEntry,
    PositionUpdatePayload, StartLineDefinitionPayload,
};

use crate::broadcaster::Broadcaster;
use crate::classifier::{GateObservation, StatusClassifier};
use crate::config::RelayConfig;
use crate::kinematics::{SogCogManager, METERS_PER_DEG_LAT};
use crate::parser::{GateMetricsParser, PositionParser};
use crate::recorder::{RecorderError, SessionRecorder, SessionSummary};
use crate::registry::AthleteRegistry;
use crate::subscriber::{StreamMessage, SubscriberStats};

/// Device ids at or above this are start-line anchors, not athletes.
const ANCHOR_DEVICE_ID_MIN: u32 = 100;

/// Endpoint movement below this does not republish the start line.
const LINE_CHANGE_THRESHOLD_M: f64 = 0.5;

/// Errors raised while building or running the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),
}

/// A control command sent by a monitoring client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    StartSession {
        #[serde(default)]
        session_id: Option<String>,
    },
    StopSession,
    StartSignal {
        ts_ms: i64,
    },
    ClearStartSignal,
}

impl ControlCommand {
    pub fn from_json(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Map a metric tag id (`"T0"`, `"T1"`, ...) to its numeric device id.
/// Tag numbering is zero-based, device ids start at 1.
fn tag_to_device_id(tag: &str) -> u32 {
    match tag.strip_prefix('T').and_then(|n| n.parse::<u32>().ok()) {
        Some(n) => n + 1,
        None => {
            warn!(tag, "Unparseable tag id, mapping to device 0");
            0
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Planar distance between two anchor fixes in meters.
fn anchor_distance_m(a: &AnchorPoint, b: &AnchorPoint) -> f64 {
    let mean_lat = ((a.lat + b.lat) / 2.0).to_radians();
    let north = (b.lat - a.lat) * METERS_PER_DEG_LAT;
    let east = (b.lon - a.lon) * METERS_PER_DEG_LAT * mean_lat.cos();
    (north * north + east * east).sqrt()
}

/// The relay pipeline state. One instance, driven by [`Relay::run`] or
/// directly through the `on_*` methods in tests.
pub struct Relay {
    config: RelayConfig,
    registry: AthleteRegistry,
    position_parser: PositionParser,
    gate_parser: GateMetricsParser,
    sog_cog: SogCogManager,
    classifier: StatusClassifier,
    recorder: SessionRecorder,
    broadcaster: Arc<Mutex<Broadcaster>>,
    anchor_left: Option<AnchorPoint>,
    anchor_right: Option<AnchorPoint>,
    published_line: Option<(AnchorPoint, AnchorPoint)>,
    seq: u64,
    messages_relayed: u64,
    started: Instant,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        broadcaster: Arc<Mutex<Broadcaster>>,
    ) -> Result<Self, RelayError> {
        let mut registry = AthleteRegistry::new();
        match registry.load(&config.athlete_registry_path) {
            Ok(count) => info!(count, "Athlete registry loaded"),
            Err(e) => warn!(
                path = %config.athlete_registry_path.display(),
                error = %e,
                "Athlete registry unavailable, using synthetic entries"
            ),
        }

        let recorder = SessionRecorder::new(config.session_data_dir.clone())?;
        let classifier = StatusClassifier::new(
            config.threshold_distance_m,
            config.threshold_time_s,
            config.threshold_stale_s,
        );
        let sog_cog = SogCogManager::new(config.sog_cog_max_samples, config.sog_cog_max_age_s);

        Ok(Self {
            config,
            registry,
            position_parser: PositionParser::new(),
            gate_parser: GateMetricsParser::new(),
            sog_cog,
            classifier,
            recorder,
            broadcaster,
            anchor_left: None,
            anchor_right: None,
            published_line: None,
            seq: 0,
            messages_relayed: 0,
            started: Instant::now(),
        })
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn messages_relayed(&self) -> u64 {
        self.messages_relayed
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn envelope(&mut self, kind: EnvelopeKind, ts_ms: i64, payload: Payload) -> Envelope {
        let seq = self.next_seq();
        let session_id = self.recorder.session_id().map(str::to_string);
        Envelope::new(kind, seq, ts_ms, session_id, payload)
    }

    /// Process one raw position frame into zero or more envelopes.
    pub fn on_position_text(&mut self, text: &str) -> Vec<Envelope> {
        self.on_position_text_at(text, now_ms())
    }

    pub fn on_position_text_at(&mut self, text: &str, now_ms: i64) -> Vec<Envelope> {
        let batch = self.position_parser.parse(text);
        let now_s = now_ms as f64 / 1000.0;

        let mut entries = Vec::new();
        for pos in &batch.positions {
            if pos.device_id >= ANCHOR_DEVICE_ID_MIN {
                self.track_anchor(pos.device_id, pos.latitude, pos.longitude);
                continue;
            }

            let info = self.registry.get_or_default(pos.device_id);
            let estimate = self.sog_cog.update_at(
                pos.device_id,
                pos.latitude,
                pos.longitude,
                pos.device_timestamp_us as f64 / 1_000_000.0,
                now_s,
            );
            self.classifier.update_last_seen_at(pos.device_id, now_s);

            let device_ts_ms = pos.device_timestamp_us / 1000;
            entries.push(PositionEntry {
                athlete_id: info.athlete_id,
                device_id: pos.device_id,
                name: info.name,
                team: info.team,
                lat: pos.latitude,
                lon: pos.longitude,
                alt_m: pos.altitude,
                sog_kn: estimate.map(|e| e.sog_kn),
                cog_deg: estimate.map(|e| e.cog_deg),
                source_mask: pos.source_mask,
                device_ts_ms,
                data_age_ms: (now_ms - device_ts_ms).max(0),
            });
        }

        let mut envelopes = Vec::new();
        if let Some(line) = self.start_line_if_changed() {
            envelopes.push(self.envelope(
                EnvelopeKind::StartLineDefinition,
                now_ms,
                Payload::StartLineDefinition(line),
            ));
        }
        if !entries.is_empty() {
            envelopes.push(self.envelope(
                EnvelopeKind::PositionUpdate,
                now_ms,
                Payload::PositionUpdate(PositionUpdatePayload { positions: entries }),
            ));
        }
        envelopes
    }

    fn track_anchor(&mut self, device_id: u32, lat: f64, lon: f64) {
        let slot = if device_id == self.config.anchor_left_device_id {
            (&mut self.anchor_left, "left")
        } else if device_id == self.config.anchor_right_device_id {
            (&mut self.anchor_right, "right")
        } else {
            debug!(device_id, "Position from unconfigured anchor");
            return;
        };
        *slot.0 = Some(AnchorPoint {
            device_id,
            anchor_id: slot.1.to_string(),
            lat,
            lon,
        });
    }

    /// Build a start-line payload when both endpoints are known and either
    /// moved since the last published line.
    fn start_line_if_changed(&mut self) -> Option<StartLineDefinitionPayload> {
        let left = self.anchor_left.clone()?;
        let right = self.anchor_right.clone()?;

        if let Some((pub_left, pub_right)) = &self.published_line {
            let moved = anchor_distance_m(pub_left, &left) > LINE_CHANGE_THRESHOLD_M
                || anchor_distance_m(pub_right, &right) > LINE_CHANGE_THRESHOLD_M;
            if !moved {
                return None;
            }
        }

        let gate_length_m = anchor_distance_m(&left, &right);
        self.published_line = Some((left.clone(), right.clone()));
        info!(gate_length_m, "Start line updated");

        Some(StartLineDefinitionPayload {
            anchor_left: left,
            anchor_right: right,
            gate_length_m,
            quality: GateQuality::Good,
        })
    }

    /// Process one raw gate metrics frame into zero or more envelopes.
    pub fn on_gate_text(&mut self, text: &str) -> Vec<Envelope> {
        self.on_gate_text_at(text, now_ms())
    }

    pub fn on_gate_text_at(&mut self, text: &str, now_ms: i64) -> Vec<Envelope> {
        let Some(batch) = self.gate_parser.parse(text) else {
            return Vec::new();
        };
        let now_s = now_ms as f64 / 1000.0;
        let sign = if self.config.gate_sign_flip { -1.0 } else { 1.0 };

        let mut metrics = Vec::new();
        for m in &batch.metrics {
            let device_id = tag_to_device_id(&m.tag_id);
            let info = self.registry.get_or_default(device_id);
            let d_perp = sign * m.d_perp_signed_m;

            let obs = GateObservation {
                d_perp_signed_m: d_perp,
                speed_to_line_mps: m.speed_to_line_mps,
                time_to_line_s: m.time_to_line_s,
                crossing_event: m.crossing_event,
                crossing_time_us: m.crossing_time_us,
            };
            let status = self.classifier.classify_at(device_id, &obs, now_s);

            metrics.push(GateMetricEntry {
                athlete_id: info.athlete_id,
                device_id,
                name: info.name,
                dist_to_line_m: d_perp,
                s_along: m.s_along,
                eta_to_line_s: m.time_to_line_s,
                speed_to_line_mps: m.speed_to_line_mps,
                gate_length_m: m.gate_length_m,
                status,
                crossing_event: m.crossing_event,
                crossing_confidence: m.crossing_confidence,
                position_quality: m.tag_position_quality,
            });
        }

        let mut alerts = Vec::new();
        let mut events = Vec::new();
        for a in &batch.alerts {
            let device_id = tag_to_device_id(&a.tag_id);
            let info = self.registry.get_or_default(device_id);
            let crossing_ts_ms = a.crossing_time_us / 1000;

            alerts.push(GateAlert {
                athlete_id: info.athlete_id.clone(),
                name: info.name.clone(),
                event: a.event,
                crossing_ts_ms,
                confidence: a.confidence,
            });
            events.push(EventPayload {
                event_kind: EventKind::Crossing,
                athlete_id: Some(info.athlete_id),
                name: Some(info.name),
                details: serde_json::json!({
                    "gate_id": a.gate_id,
                    "event": a.event,
                    "crossing_ts_ms": crossing_ts_ms,
                    "confidence": a.confidence,
                }),
            });
        }

        // Discrete crossing events go out first; the batch envelope is
        // skipped entirely when the batch carried alerts but no metrics.
        let mut envelopes = Vec::new();
        for event in events {
            envelopes.push(self.envelope(EnvelopeKind::Event, now_ms, Payload::Event(event)));
        }
        if !metrics.is_empty() {
            envelopes.push(self.envelope(
                EnvelopeKind::GateMetrics,
                now_ms,
                Payload::GateMetrics(GateMetricsPayload { metrics, alerts }),
            ));
        }
        envelopes
    }

    fn heartbeat(
        &mut self,
        connected_clients: usize,
        position_connected: bool,
        gate_connected: bool,
    ) -> Envelope {
        let payload = HeartbeatPayload {
            uptime_s: self.started.elapsed().as_secs() as i64,
            connected_clients,
            position_stream_connected: position_connected,
            gate_stream_connected: gate_connected,
            athletes_tracked: self.sog_cog.tracked_count(),
            messages_relayed: self.messages_relayed,
        };
        self.envelope(EnvelopeKind::Heartbeat, now_ms(), Payload::Heartbeat(payload))
    }

    /// Apply one control command; session transitions are returned for
    /// logging by the caller.
    pub fn handle_control(&mut self, cmd: ControlCommand) -> Option<SessionSummary> {
        match cmd {
            ControlCommand::StartSession { session_id } => {
                match self.recorder.start_session(session_id) {
                    Ok(id) => info!(session_id = id, "Session started by client"),
                    Err(e) => error!(error = %e, "Failed to start session"),
                }
                None
            }
            ControlCommand::StopSession => match self.recorder.stop_session() {
                Ok(summary) => summary,
                Err(e) => {
                    error!(error = %e, "Failed to stop session");
                    None
                }
            },
            ControlCommand::StartSignal { ts_ms } => {
                self.classifier.set_start_signal(ts_ms);
                info!(ts_ms, "Start signal set");
                None
            }
            ControlCommand::ClearStartSignal => {
                self.classifier.clear_start_signal();
                info!("Start signal cleared");
                None
            }
        }
    }

    /// Record and broadcast one envelope. Recording failures are logged
    /// and do not interrupt the relay. Only data envelopes count toward
    /// `messages_relayed`; heartbeats are excluded.
    async fn emit(&mut self, envelope: Envelope) {
        let is_heartbeat = envelope.kind == EnvelopeKind::Heartbeat;
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize envelope");
                return;
            }
        };

        if let Err(e) = self.recorder.record(&envelope, &json) {
            error!(error = %e, "Recording failed, session aborted");
        }

        self.broadcaster.lock().await.broadcast(&json).await;
        if !is_heartbeat {
            self.messages_relayed += 1;
        }
    }

    /// Drive the dispatch loop until shutdown.
    pub async fn run(
        &mut self,
        mut position_rx: mpsc::Receiver<StreamMessage>,
        mut gate_rx: mpsc::Receiver<StreamMessage>,
        mut control_rx: mpsc::Receiver<ControlCommand>,
        position_stats: Arc<SubscriberStats>,
        gate_stats: Arc<SubscriberStats>,
        shutdown: Arc<Notify>,
    ) -> Result<(), RelayError> {
        // First heartbeat fires one full interval after startup, not
        // immediately.
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut position_open = true;
        let mut gate_open = true;

        info!("Dispatch loop running");
        loop {
            tokio::select! {
                msg = position_rx.recv(), if position_open => match msg {
                    Some(msg) => {
                        for env in self.on_position_text(&msg.payload) {
                            self.emit(env).await;
                        }
                    }
                    None => position_open = false,
                },
                msg = gate_rx.recv(), if gate_open => match msg {
                    Some(msg) => {
                        for env in self.on_gate_text(&msg.payload) {
                            self.emit(env).await;
                        }
                    }
                    None => gate_open = false,
                },
                cmd = control_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(summary) = self.handle_control(cmd) {
                            info!(
                                session_id = summary.session_id,
                                messages = summary.message_count,
                                "Session stopped by client"
                            );
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    let clients = self.broadcaster.lock().await.client_count();
                    if clients == 0 {
                        continue;
                    }
                    let env = self.heartbeat(
                        clients,
                        position_stats.connected(),
                        gate_stats.connected(),
                    );
                    self.emit(env).await;
                }
                _ = shutdown.notified() => break,
            }
        }

        if let Some(summary) = self.recorder.stop_session()? {
            info!(session_id = summary.session_id, "Session closed on shutdown");
        }
        info!(relayed = self.messages_relayed, "Dispatch loop stopped");
        Ok(())
    }
}
