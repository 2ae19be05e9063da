//! Gatewatch Core
//!
//! Relay machinery: stream subscribers, wire-format parsers, kinematics,
//! status classification, fan-out broadcasting, and session recording.

pub mod broadcaster;
pub mod classifier;
pub mod config;
pub mod kinematics;
pub mod parser;
pub mod recorder;
pub mod registry;
pub mod relay;
pub mod subscriber;

/// Re-export common types
pub use broadcaster::{Broadcaster, Sink, SinkError, SinkId, WsSink};
pub use classifier::{GateObservation, StatusClassifier};
pub use config::RelayConfig;
pub use kinematics::{SogCogManager, VelocityEstimate};
pub use parser::{
    GateMetricsParser, GateParserCounters, PositionParser, PositionParserCounters, RawPosition,
    RawPositionBatch,
};
pub use recorder::{RecorderError, SessionRecorder, SessionSummary};
pub use registry::{AthleteInfo, AthleteRegistry, RegistryError};
pub use relay::{ControlCommand, Relay, RelayError};
pub use subscriber::{StreamMessage, SubscriberConfig, SubscriberHandle, SubscriberStats};
