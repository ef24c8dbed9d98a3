//! WebSocket stream client with automatic reconnection
//!
//! Wraps tokio-tungstenite with exponential-backoff reconnection, ping/pong
//! keepalive, and an outbound send channel. Consumers receive `StreamEvent`s
//! and learn about connection transitions from the same channel, so they can
//! resubscribe after a reconnect.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Stream connection configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket URL
    pub url: String,
    /// Maximum reconnection attempts (0 = retry forever)
    pub max_reconnects: u32,
    /// Delay before the first reconnection attempt
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Keepalive ping interval
    pub ping_interval: Duration,
    /// Event channel capacity
    pub buffer: usize,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnects: 0,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            buffer: 1024,
        }
    }

    pub fn max_reconnects(mut self, n: u32) -> Self {
        self.max_reconnects = n;
        self
    }

    pub fn initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    pub fn max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = d;
        self
    }
}

/// Events delivered to stream consumers
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Connection established (or re-established); resubscribe now
    Connected,
    /// Text frame from the server
    Text(String),
    /// Connection lost; a reconnect attempt follows
    Reconnecting { attempt: u32 },
    /// Terminal disconnect; no further events
    Closed,
}

/// Reconnecting WebSocket client
pub struct StreamClient {
    config: StreamConfig,
}

impl StreamClient {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    /// Open the stream and return (event receiver, outbound sender).
    ///
    /// The background task runs until the server closes cleanly, the
    /// reconnect budget is exhausted, or every receiver is dropped. Outbound
    /// messages sent while disconnected are discarded; senders should wait
    /// for `Connected` before (re)subscribing.
    pub fn open(&self) -> (mpsc::Receiver<StreamEvent>, mpsc::Sender<String>) {
        let (event_tx, event_rx) = mpsc::channel(self.config.buffer);
        let (out_tx, out_rx) = mpsc::channel(256);
        let config = self.config.clone();

        tokio::spawn(run_stream(config, event_tx, out_rx));

        (event_rx, out_tx)
    }
}

async fn run_stream(
    config: StreamConfig,
    events: mpsc::Sender<StreamEvent>,
    mut outbound: mpsc::Receiver<String>,
) {
    let mut attempt = 0u32;
    let mut backoff = config.initial_backoff;

    loop {
        match connect_once(&config, &events, &mut outbound).await {
            Ok(()) => {
                tracing::info!(url = %config.url, "stream closed cleanly");
                let _ = events.send(StreamEvent::Closed).await;
                return;
            }
            Err(e) => {
                attempt += 1;
                tracing::warn!(url = %config.url, error = %e, attempt, "stream error");

                if config.max_reconnects > 0 && attempt >= config.max_reconnects {
                    tracing::error!(url = %config.url, "reconnect budget exhausted");
                    let _ = events.send(StreamEvent::Closed).await;
                    return;
                }
                if events.is_closed() {
                    return;
                }

                let _ = events.send(StreamEvent::Reconnecting { attempt }).await;
                sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
            }
        }
    }
}

/// One connection lifetime. Ok(()) means the server closed cleanly or all
/// consumers went away; Err means the connection dropped and should be
/// re-dialed.
async fn connect_once(
    config: &StreamConfig,
    events: &mpsc::Sender<StreamEvent>,
    outbound: &mut mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    tracing::debug!(url = %config.url, "dialing");
    let (ws, _response) = connect_async(&config.url).await?;
    let (mut write, mut read) = ws.split();

    if events.send(StreamEvent::Connected).await.is_err() {
        return Ok(());
    }

    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick fires immediately; consume it so the ping cadence starts
    // one interval from now.
    ping.tick().await;
    let mut awaiting_pong = false;
    // Read-only consumers may drop their sender; the connection stays up.
    let mut outbound_open = true;

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(StreamEvent::Text(text)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => anyhow::bail!("read error: {e}"),
                    None => anyhow::bail!("stream ended unexpectedly"),
                }
            }
            msg = outbound.recv(), if outbound_open => {
                match msg {
                    Some(text) => write.send(Message::Text(text)).await?,
                    None => outbound_open = false,
                }
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    anyhow::bail!("pong timeout");
                }
                write.send(Message::Ping(Vec::new())).await?;
                awaiting_pong = true;
            }
        }
    }
}
