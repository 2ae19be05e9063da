//! Fan-out broadcaster.
//!
//! Maintains the ordered set of live client sinks and delivers each
//! serialized envelope to all of them. Delivery is fire-and-forget per
//! sink: failed sinks are collected during the pass and pruned only after
//! the pass completes, so one dead client never blocks the others.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

/// Error delivering to a single sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink closed: {0}")]
    Closed(String),
}

/// A broadcast destination. Implemented by WebSocket client connections;
/// tests substitute in-memory sinks.
#[async_trait]
pub trait Sink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), SinkError>;
}

/// Identifier for a registered sink; stable across removals of other sinks.
pub type SinkId = u64;

/// Ordered registry of live sinks with drop-tolerant broadcast.
#[derive(Default)]
pub struct Broadcaster {
    sinks: Vec<(SinkId, Box<dyn Sink>)>,
    next_id: SinkId,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink, returning its id.
    pub fn connect(&mut self, sink: Box<dyn Sink>) -> SinkId {
        let id = self.next_id;
        self.next_id += 1;
        self.sinks.push((id, sink));
        info!(sink_id = id, total = self.sinks.len(), "Client connected");
        id
    }

    /// Remove a sink. Idempotent: unknown ids are ignored.
    pub fn disconnect(&mut self, id: SinkId) {
        let before = self.sinks.len();
        self.sinks.retain(|(sid, _)| *sid != id);
        if self.sinks.len() != before {
            info!(sink_id = id, total = self.sinks.len(), "Client disconnected");
        }
    }

    /// Deliver one message to every sink. Sinks that fail during the pass
    /// are removed after the full pass completes.
    pub async fn broadcast(&mut self, text: &str) {
        let mut dead: Vec<SinkId> = Vec::new();

        for (id, sink) in self.sinks.iter_mut() {
            if let Err(e) = sink.send_text(text).await {
                debug!(sink_id = *id, error = %e, "Sink failed, marking for removal");
                dead.push(*id);
            }
        }

        for id in dead {
            self.disconnect(id);
        }
    }

    /// Number of currently connected sinks.
    pub fn client_count(&self) -> usize {
        self.sinks.len()
    }
}

/// WebSocket write half as a broadcast sink.
pub struct WsSink {
    writer: SplitSink<WebSocketStream<TcpStream>, Message>,
}

impl WsSink {
    pub fn new(writer: SplitSink<WebSocketStream<TcpStream>, Message>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl Sink for WsSink {
    async fn send_text(&mut self, text: &str) -> Result<(), SinkError> {
        self.writer
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| SinkError::Closed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        received: Arc<Mutex<Vec<String>>>,
        fail: bool,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn send_text(&mut self, text: &str) -> Result<(), SinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SinkError::Closed("test".to_string()));
            }
            self.received.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn recording_sink(fail: bool) -> (RecordingSink, Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            RecordingSink {
                received: received.clone(),
                fail,
                attempts: attempts.clone(),
            },
            received,
            attempts,
        )
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_sinks() {
        let mut bc = Broadcaster::new();
        let (s1, r1, _) = recording_sink(false);
        let (s2, r2, _) = recording_sink(false);
        bc.connect(Box::new(s1));
        bc.connect(Box::new(s2));

        bc.broadcast("hello").await;

        assert_eq!(r1.lock().unwrap().as_slice(), ["hello"]);
        assert_eq!(r2.lock().unwrap().as_slice(), ["hello"]);
    }

    #[tokio::test]
    async fn test_dead_sink_pruned_after_pass() {
        let mut bc = Broadcaster::new();
        let (s1, _, a1) = recording_sink(true);
        let (s2, r2, _) = recording_sink(false);
        bc.connect(Box::new(s1));
        bc.connect(Box::new(s2));

        bc.broadcast("one").await;
        // The healthy sink behind the failed one still got the message.
        assert_eq!(r2.lock().unwrap().as_slice(), ["one"]);
        assert_eq!(bc.client_count(), 1);

        bc.broadcast("two").await;
        assert_eq!(r2.lock().unwrap().as_slice(), ["one", "two"]);
        // The dead sink was only attempted during the first pass.
        assert_eq!(a1.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let mut bc = Broadcaster::new();
        let (s1, _, _) = recording_sink(false);
        let id = bc.connect(Box::new(s1));

        bc.disconnect(id);
        bc.disconnect(id);
        bc.disconnect(999);
        assert_eq!(bc.client_count(), 0);
    }
}
