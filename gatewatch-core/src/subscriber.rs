//! Upstream stream subscriber.
//!
//! Maintains a WebSocket subscription to one publisher endpoint, filtered
//! by topic, and forwards matching frames into the dispatch loop over a
//! bounded channel. Connection loss is handled with capped exponential
//! backoff; the subscriber runs until told to stop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Poll timeout on socket reads. A timeout is not an error; it just gives
/// the loop a chance to observe the stop flag.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on waiting for the subscriber task to wind down in `stop()`.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub name: &'static str,
    pub endpoint: String,
    pub topic: String,
    pub reconnect_min_s: f64,
    pub reconnect_max_s: f64,
}

/// One frame received from an upstream publisher, topic already matched.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub stream: &'static str,
    pub payload: String,
}

/// Shared counters, readable from outside the subscriber task.
///
/// `errors` is cumulative for the life of the subscriber;
/// `backoff_streak` counts consecutive failures only and resets to zero
/// on every successful connect.
#[derive(Debug, Default)]
pub struct SubscriberStats {
    connected: AtomicBool,
    messages_received: AtomicU64,
    errors: AtomicU64,
    backoff_streak: AtomicU32,
}

impl SubscriberStats {
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn backoff_streak(&self) -> u32 {
        self.backoff_streak.load(Ordering::Relaxed)
    }

    /// Count a failure and return the delay before the next attempt.
    /// Single writer: the subscriber task.
    fn bump_backoff(&self, config: &SubscriberConfig) -> Duration {
        let streak = self.backoff_streak.load(Ordering::Relaxed).saturating_add(1);
        self.backoff_streak.store(streak, Ordering::Relaxed);
        backoff_delay(streak, config.reconnect_min_s, config.reconnect_max_s)
    }
}

pub struct SubscriberHandle {
    name: &'static str,
    stats: Arc<SubscriberStats>,
    stop_flag: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    join: JoinHandle<()>,
}

impl SubscriberHandle {
    pub fn stats(&self) -> Arc<SubscriberStats> {
        self.stats.clone()
    }

    /// Signal the task to stop and wait for it, bounded. On timeout the
    /// task is left to die with the runtime.
    pub async fn stop(self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.stop_notify.notify_waiters();
        if timeout(STOP_JOIN_TIMEOUT, self.join).await.is_err() {
            warn!(stream = self.name, "Subscriber did not stop in time");
        }
    }
}

/// Spawn a subscriber task. Matching frames go out on `tx` with
/// `send().await`, so a full channel applies backpressure to this stream
/// rather than dropping.
pub fn spawn(config: SubscriberConfig, tx: mpsc::Sender<StreamMessage>) -> SubscriberHandle {
    let stats = Arc::new(SubscriberStats::default());
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_notify = Arc::new(Notify::new());

    let name = config.name;
    let join = tokio::spawn(run(
        config,
        tx,
        stats.clone(),
        stop_flag.clone(),
        stop_notify.clone(),
    ));

    SubscriberHandle {
        name,
        stats,
        stop_flag,
        stop_notify,
        join,
    }
}

/// Backoff before the next connection attempt, capped both in exponent
/// and in absolute duration.
fn backoff_delay(streak: u32, min_s: f64, max_s: f64) -> Duration {
    let factor = f64::from(1u32 << streak.min(10));
    Duration::from_secs_f64((min_s * factor).min(max_s))
}

/// Upstream frames carry the topic on the first line and the payload on
/// the rest.
fn split_frame(text: &str) -> Option<(&str, &str)> {
    text.split_once('\n')
}

enum ReadExit {
    Stop,
    Reconnect,
}

async fn run(
    config: SubscriberConfig,
    tx: mpsc::Sender<StreamMessage>,
    stats: Arc<SubscriberStats>,
    stop_flag: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
) {
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        info!(stream = config.name, endpoint = config.endpoint, "Connecting");
        let mut socket = match connect_async(&config.endpoint).await {
            Ok((socket, _response)) => socket,
            Err(err) => {
                warn!(stream = config.name, error = %err, "Connect failed");
                stats.errors.fetch_add(1, Ordering::Relaxed);
                let delay = stats.bump_backoff(&config);
                if wait_or_stop(delay, &stop_flag, &stop_notify).await {
                    break;
                }
                continue;
            }
        };

        if let Err(err) = socket.send(Message::Text(config.topic.clone().into())).await {
            warn!(stream = config.name, error = %err, "Subscribe failed");
            stats.errors.fetch_add(1, Ordering::Relaxed);
            let delay = stats.bump_backoff(&config);
            if wait_or_stop(delay, &stop_flag, &stop_notify).await {
                break;
            }
            continue;
        }

        // Fresh connect: the streak starts over, the cumulative error
        // counter does not.
        stats.backoff_streak.store(0, Ordering::Relaxed);
        stats.connected.store(true, Ordering::Relaxed);
        info!(stream = config.name, topic = config.topic, "Subscribed");

        let exit = read_loop(&config, &mut socket, &tx, &stats, &stop_flag, &stop_notify).await;
        stats.connected.store(false, Ordering::Relaxed);

        match exit {
            ReadExit::Stop => break,
            ReadExit::Reconnect => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                let delay = stats.bump_backoff(&config);
                if wait_or_stop(delay, &stop_flag, &stop_notify).await {
                    break;
                }
            }
        }
    }

    stats.connected.store(false, Ordering::Relaxed);
    info!(stream = config.name, "Subscriber stopped");
}

async fn read_loop(
    config: &SubscriberConfig,
    socket: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    tx: &mpsc::Sender<StreamMessage>,
    stats: &SubscriberStats,
    stop_flag: &AtomicBool,
    stop_notify: &Notify,
) -> ReadExit {
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            return ReadExit::Stop;
        }

        tokio::select! {
            res = timeout(READ_TIMEOUT, socket.next()) => match res {
                Ok(Some(Ok(Message::Text(text)))) => {
                    let Some((topic, payload)) = split_frame(&text) else {
                        debug!(stream = config.name, "Frame without topic line");
                        continue;
                    };
                    if topic != config.topic {
                        debug!(stream = config.name, topic, "Ignoring off-topic frame");
                        continue;
                    }
                    stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    let msg = StreamMessage {
                        stream: config.name,
                        payload: payload.to_string(),
                    };
                    if tx.send(msg).await.is_err() {
                        info!(stream = config.name, "Dispatch channel closed");
                        return ReadExit::Stop;
                    }
                }
                Ok(Some(Ok(_other))) => {}
                Ok(Some(Err(err))) => {
                    warn!(stream = config.name, error = %err, "Socket error");
                    return ReadExit::Reconnect;
                }
                Ok(None) => {
                    info!(stream = config.name, "Stream closed by publisher");
                    return ReadExit::Reconnect;
                }
                // Timeout with no data: not an error, go re-check the
                // stop flag.
                Err(_) => {}
            },
            _ = stop_notify.notified() => return ReadExit::Stop,
        }
    }
}

/// Sleep for `delay` unless stopped first. Returns true when stopping.
async fn wait_or_stop(delay: Duration, stop_flag: &AtomicBool, stop_notify: &Notify) -> bool {
    if stop_flag.load(Ordering::Relaxed) {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop_notify.notified() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_backoff_doubles_then_clamps() {
        assert_eq!(backoff_delay(1, 1.0, 30.0), Duration::from_secs_f64(2.0));
        assert_eq!(backoff_delay(2, 1.0, 30.0), Duration::from_secs_f64(4.0));
        assert_eq!(backoff_delay(5, 1.0, 30.0), Duration::from_secs_f64(30.0));
        // Exponent saturates at 10 even for long streaks.
        assert_eq!(backoff_delay(40, 1.0, 5000.0), Duration::from_secs_f64(1024.0));
    }

    #[test]
    fn test_split_frame() {
        assert_eq!(
            split_frame("position\nSERVER_TS:100"),
            Some(("position", "SERVER_TS:100"))
        );
        assert_eq!(
            split_frame("gate\n{\"a\":1}\nmore"),
            Some(("gate", "{\"a\":1}\nmore"))
        );
        assert_eq!(split_frame("no-newline"), None);
    }

    #[tokio::test]
    async fn test_subscribe_receive_and_topic_filter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            // Expect the topic-subscribe frame first.
            let sub = ws.next().await.unwrap().unwrap();
            assert_eq!(sub.into_text().unwrap().as_str(), "position");

            ws.send(Message::Text("other\nignored".into())).await.unwrap();
            ws.send(Message::Text("position\nSERVER_TS:1000".into()))
                .await
                .unwrap();

            // Hold the connection open until the client goes away.
            while ws.next().await.is_some() {}
        });

        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn(
            SubscriberConfig {
                name: "position",
                endpoint: format!("ws://{addr}"),
                topic: "position".to_string(),
                reconnect_min_s: 0.1,
                reconnect_max_s: 1.0,
            },
            tx,
        );

        let msg = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.stream, "position");
        assert_eq!(msg.payload, "SERVER_TS:1000");

        let stats = handle.stats();
        assert!(stats.connected());
        // The off-topic frame never counted.
        assert_eq!(stats.messages_received(), 1);
        assert_eq!(stats.errors(), 0);

        handle.stop().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_failure_counts_error() {
        // Nothing is listening here; the first attempt fails immediately.
        let (tx, _rx) = mpsc::channel(16);
        let handle = spawn(
            SubscriberConfig {
                name: "gate",
                endpoint: "ws://127.0.0.1:1".to_string(),
                topic: "gate".to_string(),
                reconnect_min_s: 5.0,
                reconnect_max_s: 30.0,
            },
            tx,
        );

        // Give the task a moment to fail the connect and enter backoff.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let stats = handle.stats();
        assert!(!stats.connected());
        assert!(stats.errors() >= 1);
        assert!(stats.backoff_streak() >= 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_resets_backoff_streak() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: take the subscribe frame, then hang up.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.next().await;
            drop(ws);

            // Second connection sticks and delivers a frame.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let sub = ws.next().await.unwrap().unwrap();
            assert_eq!(sub.into_text().unwrap().as_str(), "position");
            ws.send(Message::Text("position\nSERVER_TS:2000".into()))
                .await
                .unwrap();
            while ws.next().await.is_some() {}
        });

        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn(
            SubscriberConfig {
                name: "position",
                endpoint: format!("ws://{addr}"),
                topic: "position".to_string(),
                reconnect_min_s: 0.05,
                reconnect_max_s: 1.0,
            },
            tx,
        );

        // The frame only arrives on the second connection, after one
        // reconnect cycle.
        let msg = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, "SERVER_TS:2000");

        let stats = handle.stats();
        assert!(stats.connected());
        // The dropped connection stays in the cumulative error count, but
        // the fresh connect cleared the backoff streak.
        assert_eq!(stats.errors(), 1);
        assert_eq!(stats.backoff_streak(), 0);

        handle.stop().await;
        server.abort();
    }
}
