//! Manages the single persistent WebSocket connection to the classifieds
//! event stream, with bounded-backoff reconnects and heartbeat pings.
//! Lifecycle transitions go to the durable event log; they never crash the
//! process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{RECONNECT_BACKOFF_MS, WS_PING_INTERVAL_SECS};
use crate::error::Result;
use crate::types::StreamEvent;
use crate::ws::event_log::EventLog;
use crate::ws::messages::parse_frame;

pub struct WsManager {
    url: String,
    event_tx: mpsc::Sender<StreamEvent>,
    event_log: EventLog,
    /// Total frames received since process start (for flow diagnostics).
    frames_received: Arc<AtomicU64>,
    /// Total events routed to the ingest pipeline.
    events_routed: Arc<AtomicU64>,
}

impl WsManager {
    pub fn new(url: String, event_tx: mpsc::Sender<StreamEvent>, event_log: EventLog) -> Self {
        Self {
            url,
            event_tx,
            event_log,
            frames_received: Arc::new(AtomicU64::new(0)),
            events_routed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn run(self) {
        let mut backoff_idx = 0usize;

        loop {
            info!("WS connecting to {}", self.url);
            match self.connect_once().await {
                Ok(()) => {
                    info!("WS connection closed cleanly");
                    self.event_log.append("Stream connection closed");
                    backoff_idx = 0;
                }
                Err(e) => {
                    error!("WS connection error: {e}");
                    self.event_log.append(&format!("Stream error: {e}"));
                }
            }

            let delay_ms = RECONNECT_BACKOFF_MS
                .get(backoff_idx)
                .copied()
                .unwrap_or(*RECONNECT_BACKOFF_MS.last().unwrap());
            backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len() - 1);

            warn!("WS reconnecting in {delay_ms}ms");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        let (mut write, mut read) = ws_stream.split();
        self.event_log.append("Connected to stream");

        let mut ping_interval = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping_interval.tick() => {
                    debug!("WS ping");
                    write.send(Message::Ping(vec![].into())).await?;
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let total_frames = self.frames_received.fetch_add(1, Ordering::Relaxed) + 1;
        if total_frames % 1000 == 0 {
            let routed = self.events_routed.load(Ordering::Relaxed);
            info!(
                frames = total_frames,
                routed,
                "[WS] {total_frames} frames received | {routed} events routed"
            );
        }

        for event in parse_frame(text) {
            self.events_routed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.event_tx.try_send(event) {
                warn!("event channel full, dropping message: {e}");
            }
        }
    }
}
