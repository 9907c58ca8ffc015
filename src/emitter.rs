//! Outbound dispatcher: a FIFO queue between bursty cycle finalization and
//! the subscriber publish channel. Enqueue never blocks; the drain task
//! releases exactly one price per tick.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::debug;

use crate::config::EMIT_INTERVAL_MS;
use crate::types::PricedItem;

/// Push boundary toward subscribers (trading bots, admin consumers).
pub trait PricePublisher: Send + Sync {
    fn publish(&self, item: &PricedItem);
}

/// Fan-out over a tokio broadcast channel. Lagging or absent subscribers
/// never block the dispatcher.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<PricedItem>,
}

impl BroadcastPublisher {
    pub fn new(tx: broadcast::Sender<PricedItem>) -> Self {
        Self { tx }
    }
}

impl PricePublisher for BroadcastPublisher {
    fn publish(&self, item: &PricedItem) {
        // Send only fails when no subscriber is currently listening.
        let _ = self.tx.send(item.clone());
    }
}

pub struct EmitQueue {
    queue: Mutex<VecDeque<PricedItem>>,
    publisher: Arc<dyn PricePublisher>,
}

impl EmitQueue {
    pub fn new(publisher: Arc<dyn PricePublisher>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            publisher,
        })
    }

    pub fn enqueue(&self, item: PricedItem) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(item);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Drain loop: one item per tick.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(EMIT_INTERVAL_MS));
        loop {
            ticker.tick().await;
            let item = match self.queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            if let Some(item) = item {
                debug!(item = %item.name, sku = %item.sku, "Publishing price");
                self.publisher.publish(&item);
            }
        }
    }
}
