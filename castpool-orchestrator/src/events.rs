use castpool_common::bus::{EventEnvelope, PoolEvent};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Typed lifecycle broadcast. Consumers subscribe; publishing never blocks and
/// never fails when nobody is listening.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: PoolEvent) {
        tracing::debug!(event = event.as_str(), "pool event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    /// Mirror every event onto a Redis channel as an [`EventEnvelope`].
    pub fn forward_to_redis(&self, client: redis::Client, channel: String, source: String) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            let mut conn = match client.get_multiplexed_async_connection().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, "event forwarder could not connect to redis");
                    return;
                }
            };
            tracing::info!(%channel, "📤 forwarding pool events");
            loop {
                let event = match rx.recv().await {
                    Ok(evt) => evt,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event forwarder lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let payload = match serde_json::to_string(&EventEnvelope::new(event, &source)) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode pool event");
                        continue;
                    }
                };
                if let Err(e) = conn.publish::<_, _, ()>(&channel, payload).await {
                    tracing::warn!(error = %e, %channel, "failed to publish pool event");
                }
            }
        })
    }
}
