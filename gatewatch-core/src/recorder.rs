//! Session recording engine.
//!
//! Records broadcast envelopes to newline-delimited JSON logs for replay
//! and export. Each session is a directory under the data dir:
//!
//! ```text
//! <data_dir>/<session_id>/messages.jsonl   one envelope per line
//! <data_dir>/<session_id>/meta.json        session summary
//! ```
//!
//! Legacy single-file `<data_dir>/<id>.jsonl` packs are still discoverable
//! and replayable; they carry no summary. At most one session is active at
//! a time; starting a new one finalizes the current one first.

use chrono::{DateTime, SecondsFormat, Utc};
use gatewatch_model::{Envelope, Payload};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

/// Recorder error types.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// Persisted session summary. Entries discovered without a `meta.json`
/// (legacy packs) leave the unknown fields empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub start_time_utc: Option<String>,
    pub end_time_utc: Option<String>,
    pub duration_s: Option<f64>,
    pub message_count: Option<u64>,
    pub athlete_count: Option<usize>,
    #[serde(default)]
    pub athlete_ids: Vec<String>,
    #[serde(default)]
    pub schema_version: Option<String>,
    /// Set when the session was finalized because of a write failure.
    #[serde(default)]
    pub errored: bool,
    #[serde(default)]
    pub has_messages: bool,
    #[serde(default)]
    pub legacy_pack: bool,
}

struct ActiveSession {
    session_id: String,
    dir: PathBuf,
    file: File,
    message_count: u64,
    start: DateTime<Utc>,
    athlete_ids: BTreeSet<String>,
}

/// Append-only session recorder.
///
/// Every `record` call appends one line and flushes immediately, so each
/// message is durable on its own. A write failure finalizes the session
/// with `errored: true` and leaves the live relay untouched.
pub struct SessionRecorder {
    data_dir: PathBuf,
    active: Option<ActiveSession>,
}

impl SessionRecorder {
    pub fn new(data_dir: PathBuf) -> Result<Self, RecorderError> {
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            active: None,
        })
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.session_id.as_str())
    }

    pub fn message_count(&self) -> u64 {
        self.active.as_ref().map(|s| s.message_count).unwrap_or(0)
    }

    /// Start recording a new session, finalizing any active one first.
    /// A missing id is auto-generated from the UTC start time.
    pub fn start_session(&mut self, session_id: Option<String>) -> Result<String, RecorderError> {
        if self.is_recording() {
            self.stop_session()?;
        }

        let start = Utc::now();
        let session_id =
            session_id.unwrap_or_else(|| format!("S{}", start.format("%Y-%m-%d-%H%M%S")));

        let dir = self.data_dir.join(&session_id);
        std::fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("messages.jsonl"))?;

        info!(session_id, dir = %dir.display(), "Session recording started");

        self.active = Some(ActiveSession {
            session_id: session_id.clone(),
            dir,
            file,
            message_count: 0,
            start,
            athlete_ids: BTreeSet::new(),
        });

        Ok(session_id)
    }

    /// Record one broadcast envelope. A no-op when no session is active.
    ///
    /// On write failure the session is finalized with `errored: true` and
    /// the error is returned; subsequent calls are no-ops until a new
    /// session starts.
    pub fn record(&mut self, envelope: &Envelope, json_line: &str) -> Result<(), RecorderError> {
        let Some(session) = self.active.as_mut() else {
            return Ok(());
        };

        let write_result = session
            .file
            .write_all(json_line.as_bytes())
            .and_then(|_| session.file.write_all(b"\n"))
            .and_then(|_| session.file.flush());

        if let Err(e) = write_result {
            error!(
                session_id = session.session_id,
                error = %e,
                "Session write failed, finalizing session as errored"
            );
            self.finalize(true);
            return Err(e.into());
        }

        session.message_count += 1;

        // Only the two athlete-bearing kinds contribute to the id set.
        match &envelope.payload {
            Payload::PositionUpdate(p) => {
                for pos in &p.positions {
                    session.athlete_ids.insert(pos.athlete_id.clone());
                }
            }
            Payload::GateMetrics(g) => {
                for m in &g.metrics {
                    session.athlete_ids.insert(m.athlete_id.clone());
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Stop recording, persist the summary, and return it.
    /// Returns `None` when no session was active.
    pub fn stop_session(&mut self) -> Result<Option<SessionSummary>, RecorderError> {
        Ok(self.finalize(false))
    }

    fn finalize(&mut self, errored: bool) -> Option<SessionSummary> {
        let session = self.active.take()?;
        let end = Utc::now();
        let duration_s = (end - session.start).num_milliseconds() as f64 / 1000.0;

        let summary = SessionSummary {
            session_id: session.session_id.clone(),
            start_time_utc: Some(session.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            end_time_utc: Some(end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            duration_s: Some((duration_s * 10.0).round() / 10.0),
            message_count: Some(session.message_count),
            athlete_count: Some(session.athlete_ids.len()),
            athlete_ids: session.athlete_ids.into_iter().collect(),
            schema_version: Some(gatewatch_model::SCHEMA_VERSION.to_string()),
            errored,
            has_messages: true,
            legacy_pack: false,
        };

        let meta_path = session.dir.join("meta.json");
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&meta_path, json) {
                    warn!(path = %meta_path.display(), error = %e, "Failed to write session summary");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize session summary"),
        }

        info!(
            session_id = summary.session_id,
            messages = session.message_count,
            duration_s,
            errored,
            "Session recording stopped"
        );

        Some(summary)
    }

    /// List all recorded sessions, newest first; sessions without a known
    /// start time sort last.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions = Vec::new();

        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(_) => return sessions,
        };

        for entry in entries.flatten() {
            let path = entry.path();

            if path.is_dir() {
                let meta_path = path.join("meta.json");
                if meta_path.exists() {
                    match std::fs::read_to_string(&meta_path)
                        .map_err(RecorderError::Io)
                        .and_then(|raw| Ok(serde_json::from_str::<SessionSummary>(&raw)?))
                    {
                        Ok(mut summary) => {
                            summary.has_messages = path.join("messages.jsonl").exists();
                            sessions.push(summary);
                        }
                        Err(e) => {
                            warn!(path = %meta_path.display(), error = %e, "Failed to read session summary")
                        }
                    }
                } else if dir_has_jsonl(&path) {
                    // Session directory without a summary.
                    sessions.push(stub_summary(
                        entry.file_name().to_string_lossy().into_owned(),
                        false,
                    ));
                }
            } else if path.extension().is_some_and(|ext| ext == "jsonl") {
                // Legacy flat single-file pack.
                if let Some(stem) = path.file_stem() {
                    sessions.push(stub_summary(stem.to_string_lossy().into_owned(), true));
                }
            }
        }

        sessions.sort_by(|a, b| match (&a.start_time_utc, &b.start_time_utc) {
            (Some(x), Some(y)) => y.cmp(x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.session_id.cmp(&b.session_id),
        });

        sessions
    }

    /// Summary for a single session, if it exists.
    pub fn get_session(&self, session_id: &str) -> Option<SessionSummary> {
        let dir = self.data_dir.join(session_id);
        let meta_path = dir.join("meta.json");
        if meta_path.exists() {
            let raw = std::fs::read_to_string(&meta_path).ok()?;
            let mut summary: SessionSummary = serde_json::from_str(&raw).ok()?;
            summary.has_messages = dir.join("messages.jsonl").exists();
            return Some(summary);
        }

        if self.data_dir.join(format!("{session_id}.jsonl")).exists() {
            return Some(stub_summary(session_id.to_string(), true));
        }

        None
    }

    fn messages_path(&self, session_id: &str) -> Option<PathBuf> {
        let dir_path = self.data_dir.join(session_id).join("messages.jsonl");
        if dir_path.exists() {
            return Some(dir_path);
        }

        let legacy_path = self.data_dir.join(format!("{session_id}.jsonl"));
        if legacy_path.exists() {
            return Some(legacy_path);
        }

        None
    }

    /// All recorded envelopes for a session, in file order. Blank lines and
    /// non-envelope metadata lines are skipped.
    pub fn get_session_messages(&self, session_id: &str) -> Result<Vec<Envelope>, RecorderError> {
        let path = self
            .messages_path(session_id)
            .ok_or_else(|| RecorderError::SessionNotFound(session_id.to_string()))?;

        let reader = BufReader::new(File::open(path)?);
        let mut messages = Vec::new();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(envelope) = Envelope::from_json(line) {
                messages.push(envelope);
            }
        }

        Ok(messages)
    }

    /// Export a session as CSV, joining position and gate-metric envelopes
    /// on `(ts_ms, athlete_id)`. Unmatched columns stay empty; rows come
    /// out sorted by the join key.
    pub fn export_csv(&self, session_id: &str) -> Result<String, RecorderError> {
        let messages = self.get_session_messages(session_id)?;

        let mut rows: BTreeMap<(i64, String), CsvRow> = BTreeMap::new();

        for msg in &messages {
            let sid = msg.session_id.clone().unwrap_or_default();
            match &msg.payload {
                Payload::PositionUpdate(p) => {
                    for pos in &p.positions {
                        let key = (msg.ts_ms, pos.athlete_id.clone());
                        let row = rows.entry(key).or_insert_with(|| {
                            CsvRow::new(msg.ts_ms, &sid, &pos.athlete_id)
                        });
                        row.device_id = pos.device_id.to_string();
                        row.name = pos.name.clone();
                        row.team = pos.team.clone();
                        row.lat = pos.lat.to_string();
                        row.lon = pos.lon.to_string();
                        row.alt_m = pos.alt_m.to_string();
                        row.speed = fmt_opt(pos.sog_kn);
                        row.course = fmt_opt(pos.cog_deg);
                        row.data_age_ms = pos.data_age_ms.to_string();
                    }
                }
                Payload::GateMetrics(g) => {
                    for m in &g.metrics {
                        let key = (msg.ts_ms, m.athlete_id.clone());
                        let row = rows.entry(key).or_insert_with(|| {
                            let mut row = CsvRow::new(msg.ts_ms, &sid, &m.athlete_id);
                            row.device_id = m.device_id.to_string();
                            row.name = m.name.clone();
                            row
                        });
                        row.dist_to_line_m = m.dist_to_line_m.to_string();
                        row.eta_to_line_s = fmt_opt(m.eta_to_line_s);
                        row.speed_to_line_mps = m.speed_to_line_mps.to_string();
                        row.status = m.status.to_string();
                    }
                }
                _ => {}
            }
        }

        let mut out = String::from(
            "ts,session_id,entity_id,device_id,name,team,lat,lon,alt_m,speed,course,\
             dist_to_line_m,eta_to_line_s,speed_to_line_mps,status,data_age_ms",
        );
        for row in rows.values() {
            out.push('\n');
            out.push_str(&row.to_line());
        }

        Ok(out)
    }
}

fn dir_has_jsonl(dir: &std::path::Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
        })
        .unwrap_or(false)
}

fn stub_summary(session_id: String, legacy_pack: bool) -> SessionSummary {
    SessionSummary {
        session_id,
        start_time_utc: None,
        end_time_utc: None,
        duration_s: None,
        message_count: None,
        athlete_count: None,
        athlete_ids: Vec::new(),
        schema_version: None,
        errored: false,
        has_messages: true,
        legacy_pack,
    }
}

#[derive(Debug, Default)]
struct CsvRow {
    ts: String,
    session_id: String,
    athlete_id: String,
    device_id: String,
    name: String,
    team: String,
    lat: String,
    lon: String,
    alt_m: String,
    speed: String,
    course: String,
    dist_to_line_m: String,
    eta_to_line_s: String,
    speed_to_line_mps: String,
    status: String,
    data_age_ms: String,
}

impl CsvRow {
    fn new(ts_ms: i64, session_id: &str, athlete_id: &str) -> Self {
        Self {
            ts: ts_ms.to_string(),
            session_id: session_id.to_string(),
            athlete_id: athlete_id.to_string(),
            ..Self::default()
        }
    }

    fn to_line(&self) -> String {
        [
            self.ts.as_str(),
            self.session_id.as_str(),
            self.athlete_id.as_str(),
            self.device_id.as_str(),
            &csv_field(&self.name),
            &csv_field(&self.team),
            self.lat.as_str(),
            self.lon.as_str(),
            self.alt_m.as_str(),
            self.speed.as_str(),
            self.course.as_str(),
            self.dist_to_line_m.as_str(),
            self.eta_to_line_s.as_str(),
            self.speed_to_line_mps.as_str(),
            self.status.as_str(),
            self.data_age_ms.as_str(),
        ]
        .join(",")
    }
}

/// Quote a text field only when it contains a comma.
fn csv_field(s: &str) -> String {
    if s.contains(',') {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}
