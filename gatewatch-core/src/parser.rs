//! Wire-format decoders for the two upstream streams.
//!
//! The position stream is a line-oriented text format; the gate metric
//! stream is JSON. Both decoders are total-failure-tolerant: they never
//! propagate an error past this boundary. Text-format failures are
//! recoverable per line; JSON failures drop the whole batch. Diagnostic
//! counters are owned by the parser instance, not by globals.

use gatewatch_model::CrossingEvent;
use serde::Deserialize;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Position batch — line-oriented text format
// ---------------------------------------------------------------------------

/// A single position line from the upstream text format.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPosition {
    pub device_id: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub source_mask: u32,
    pub device_timestamp_us: i64,
}

/// A parsed position batch.
#[derive(Debug, Clone, Default)]
pub struct RawPositionBatch {
    pub server_timestamp_us: i64,
    pub positions: Vec<RawPosition>,
}

/// Diagnostic counters for the position decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionParserCounters {
    pub batches_parsed: u64,
    pub lines_parsed: u64,
    pub parse_errors: u64,
}

/// Decoder for the line-oriented position format.
///
/// Expected input:
/// ```text
/// SERVER_TS:<server_timestamp_us>
/// COUNT:<num_positions>
/// POS:<device_id>:<lat>:<lon>:<alt_m>:<source_mask>:<device_timestamp_us>
/// ```
///
/// `COUNT:` is informational only; the batch's position count derives from
/// the well-formed `POS:` lines. Malformed lines are skipped and counted.
#[derive(Debug, Default)]
pub struct PositionParser {
    counters: PositionParserCounters,
}

impl PositionParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the diagnostic counters.
    pub fn counters(&self) -> PositionParserCounters {
        self.counters
    }

    /// Parse one position batch. Always returns a batch; malformed lines
    /// are dropped individually.
    pub fn parse(&mut self, raw_text: &str) -> RawPositionBatch {
        let mut batch = RawPositionBatch::default();

        for line in raw_text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(value) = line.strip_prefix("SERVER_TS:") {
                match value.parse::<i64>() {
                    Ok(ts) => batch.server_timestamp_us = ts,
                    Err(_) => {
                        warn!(line, "Malformed SERVER_TS line");
                        self.counters.parse_errors += 1;
                    }
                }
            } else if line.starts_with("COUNT:") {
                // Informational; positions are counted from POS lines.
            } else if line.starts_with("POS:") {
                match Self::parse_pos_line(line) {
                    Some(pos) => {
                        batch.positions.push(pos);
                        self.counters.lines_parsed += 1;
                    }
                    None => {
                        warn!(line, "Malformed POS line");
                        self.counters.parse_errors += 1;
                    }
                }
            } else {
                debug!(line, "Ignoring unknown line prefix");
            }
        }

        self.counters.batches_parsed += 1;
        batch
    }

    fn parse_pos_line(line: &str) -> Option<RawPosition> {
        let mut fields = line.split(':');
        fields.next(); // "POS" prefix

        let device_id = fields.next()?.parse().ok()?;
        let latitude = fields.next()?.parse().ok()?;
        let longitude = fields.next()?.parse().ok()?;
        let altitude = fields.next()?.parse().ok()?;
        let source_mask = fields.next()?.parse().ok()?;
        let device_timestamp_us = fields.next()?.parse().ok()?;

        Some(RawPosition {
            device_id,
            latitude,
            longitude,
            altitude,
            source_mask,
            device_timestamp_us,
        })
    }
}

// ---------------------------------------------------------------------------
// Gate metrics batch — JSON
// ---------------------------------------------------------------------------

fn default_gate_id() -> String {
    "start_line".to_string()
}

/// A single gate metric from the upstream JSON output.
///
/// Optional fields default at the decode boundary; a missing `tag_id`
/// fails the entire batch.
#[derive(Debug, Clone, Deserialize)]
pub struct RawGateMetric {
    pub tag_id: String,
    #[serde(default = "default_gate_id")]
    pub gate_id: String,
    #[serde(default)]
    pub d_perp_signed_m: f64,
    #[serde(default)]
    pub s_along: f64,
    #[serde(default)]
    pub gate_length_m: f64,
    #[serde(default)]
    pub crossing_event: CrossingEvent,
    #[serde(default)]
    pub crossing_time_us: Option<i64>,
    #[serde(default)]
    pub crossing_confidence: f64,
    #[serde(default)]
    pub tag_position_quality: f64,
    #[serde(default)]
    pub time_to_line_s: Option<f64>,
    #[serde(default)]
    pub speed_to_line_mps: f64,
}

/// A crossing alert within a gate metrics batch.
#[derive(Debug, Clone, Deserialize)]
pub struct RawGateAlert {
    pub tag_id: String,
    #[serde(default = "default_gate_id")]
    pub gate_id: String,
    #[serde(default)]
    pub event: CrossingEvent,
    #[serde(default)]
    pub crossing_time_us: i64,
    #[serde(default)]
    pub confidence: f64,
}

/// A parsed gate metrics batch.
#[derive(Debug, Clone, Deserialize)]
pub struct RawGateMetricsBatch {
    #[serde(default)]
    pub server_timestamp_us: i64,
    #[serde(default)]
    pub metrics: Vec<RawGateMetric>,
    #[serde(default)]
    pub alerts: Vec<RawGateAlert>,
}

/// Diagnostic counters for the gate metric decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateParserCounters {
    pub batches_parsed: u64,
    pub parse_errors: u64,
}

/// Decoder for the JSON gate metric format.
#[derive(Debug, Default)]
pub struct GateMetricsParser {
    counters: GateParserCounters,
}

impl GateMetricsParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the diagnostic counters.
    pub fn counters(&self) -> GateParserCounters {
        self.counters
    }

    /// Parse one gate metrics batch. Any decode failure drops the whole
    /// batch and increments the error counter.
    pub fn parse(&mut self, raw_json: &str) -> Option<RawGateMetricsBatch> {
        match serde_json::from_str::<RawGateMetricsBatch>(raw_json) {
            Ok(batch) => {
                self.counters.batches_parsed += 1;
                Some(batch)
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse gate metrics batch");
                self.counters.parse_errors += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_batch_well_formed() {
        let mut parser = PositionParser::new();
        let batch = parser.parse(
            "SERVER_TS:1700000000000000\n\
             COUNT:2\n\
             POS:1:22.302:114.171:1.5:3:1700000000000000\n\
             POS:2:22.303:114.172:1.6:1:1700000000100000\n",
        );

        assert_eq!(batch.server_timestamp_us, 1_700_000_000_000_000);
        assert_eq!(batch.positions.len(), 2);
        assert_eq!(batch.positions[0].device_id, 1);
        assert_eq!(batch.positions[1].source_mask, 1);
        assert_eq!(parser.counters().lines_parsed, 2);
        assert_eq!(parser.counters().parse_errors, 0);
    }

    #[test]
    fn test_position_malformed_line_skipped() {
        let mut parser = PositionParser::new();
        let batch = parser.parse(
            "SERVER_TS:1000\n\
             POS:1:22.302:114.171:1.5:3:1000\n\
             POS:2:22.3:114.1\n\
             POS:3:22.304:114.173:1.7:3:2000\n",
        );

        // The malformed line is skipped; the batch keeps the valid ones.
        assert_eq!(batch.positions.len(), 2);
        assert_eq!(parser.counters().parse_errors, 1);
        assert_eq!(parser.counters().lines_parsed, 2);
    }

    #[test]
    fn test_position_count_header_ignored() {
        let mut parser = PositionParser::new();
        let batch = parser.parse("SERVER_TS:1\nCOUNT:99\nPOS:1:22.0:114.0:0.0:1:1\n");
        assert_eq!(batch.positions.len(), 1);
    }

    #[test]
    fn test_position_unknown_prefix_ignored() {
        let mut parser = PositionParser::new();
        let batch = parser.parse("SERVER_TS:1\nWHATEVER:foo\nPOS:1:22.0:114.0:0.0:1:1\n");
        assert_eq!(batch.positions.len(), 1);
        assert_eq!(parser.counters().parse_errors, 0);
    }

    #[test]
    fn test_position_bad_number_counted() {
        let mut parser = PositionParser::new();
        let batch = parser.parse("POS:1:not_a_float:114.0:0.0:1:1\n");
        assert!(batch.positions.is_empty());
        assert_eq!(parser.counters().parse_errors, 1);
    }

    #[test]
    fn test_position_malformed_server_ts() {
        let mut parser = PositionParser::new();
        let batch = parser.parse("SERVER_TS:abc\nPOS:1:22.0:114.0:0.0:1:1\n");
        assert_eq!(batch.server_timestamp_us, 0);
        assert_eq!(batch.positions.len(), 1);
        assert_eq!(parser.counters().parse_errors, 1);
    }

    #[test]
    fn test_gate_batch_with_defaults() {
        let mut parser = GateMetricsParser::new();
        let batch = parser
            .parse(r#"{"server_timestamp_us": 42, "metrics": [{"tag_id": "T0"}]}"#)
            .unwrap();

        assert_eq!(batch.server_timestamp_us, 42);
        let m = &batch.metrics[0];
        assert_eq!(m.tag_id, "T0");
        assert_eq!(m.gate_id, "start_line");
        assert_eq!(m.d_perp_signed_m, 0.0);
        assert_eq!(m.crossing_event, CrossingEvent::NoCrossing);
        assert!(m.crossing_time_us.is_none());
        assert!(m.time_to_line_s.is_none());
        assert!(batch.alerts.is_empty());
        assert_eq!(parser.counters().batches_parsed, 1);
    }

    #[test]
    fn test_gate_missing_tag_id_fails_batch() {
        let mut parser = GateMetricsParser::new();
        let result = parser.parse(r#"{"metrics": [{"d_perp_signed_m": 5.0}]}"#);
        assert!(result.is_none());
        assert_eq!(parser.counters().parse_errors, 1);
        assert_eq!(parser.counters().batches_parsed, 0);
    }

    #[test]
    fn test_gate_invalid_json_fails_batch() {
        let mut parser = GateMetricsParser::new();
        assert!(parser.parse("{not json").is_none());
        assert_eq!(parser.counters().parse_errors, 1);
    }

    #[test]
    fn test_gate_full_metric_and_alert() {
        let mut parser = GateMetricsParser::new();
        let batch = parser
            .parse(
                r#"{"server_timestamp_us": 1700000000000000,
                    "metrics": [{"tag_id": "T1", "gate_id": "start_line",
                                 "d_perp_signed_m": -12.5, "s_along": 0.4,
                                 "gate_length_m": 120.0,
                                 "crossing_event": "CROSSING_LEFT",
                                 "crossing_time_us": 1700000000000000,
                                 "crossing_confidence": 0.9,
                                 "tag_position_quality": 0.8,
                                 "time_to_line_s": 3.2,
                                 "speed_to_line_mps": 2.1}],
                    "alerts": [{"tag_id": "T1", "event": "CROSSING_LEFT",
                                "crossing_time_us": 1700000000000000,
                                "confidence": 0.9}]}"#,
            )
            .unwrap();

        assert_eq!(batch.metrics.len(), 1);
        assert_eq!(batch.metrics[0].crossing_event, CrossingEvent::CrossingLeft);
        assert_eq!(batch.metrics[0].time_to_line_s, Some(3.2));
        assert_eq!(batch.alerts.len(), 1);
        assert_eq!(batch.alerts[0].confidence, 0.9);
    }
}
