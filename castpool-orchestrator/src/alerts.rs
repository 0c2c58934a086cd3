use async_trait::async_trait;
use castpool_common::bus::{AlertCommand, NewAlert};
use redis::AsyncCommands;

/// Consumed alerting contract. Storage and delivery belong to the implementor.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn create_alert(&self, workload_id: &str, alert: NewAlert) -> anyhow::Result<()>;

    async fn resolve_by_source_id(&self, workload_id: &str, source_id: &str, resolved_by: &str) -> anyhow::Result<()>;
}

/// Writes alerts to the log only.
#[derive(Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn create_alert(&self, workload_id: &str, alert: NewAlert) -> anyhow::Result<()> {
        tracing::warn!(
            workload_id,
            source_id = %alert.source_id,
            level = ?alert.level,
            category = %alert.category,
            "🚨 {}: {}",
            alert.title,
            alert.message
        );
        Ok(())
    }

    async fn resolve_by_source_id(&self, workload_id: &str, source_id: &str, resolved_by: &str) -> anyhow::Result<()> {
        tracing::debug!(workload_id, source_id, resolved_by, "alert resolve requested");
        Ok(())
    }
}

/// Publishes `CMD:CREATE_ALERT` / `CMD:RESOLVE_ALERT` envelopes for the alerting service.
pub struct RedisAlertSink {
    client: redis::Client,
    channel: String,
}

impl RedisAlertSink {
    pub fn new(client: redis::Client, channel: String) -> Self {
        Self { client, channel }
    }

    async fn send(&self, cmd: &AlertCommand) -> anyhow::Result<()> {
        let payload = serde_json::to_string(cmd)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(&self.channel, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl AlertSink for RedisAlertSink {
    async fn create_alert(&self, workload_id: &str, alert: NewAlert) -> anyhow::Result<()> {
        self.send(&AlertCommand::Create {
            workload_id: workload_id.to_string(),
            alert,
        })
        .await
    }

    async fn resolve_by_source_id(&self, workload_id: &str, source_id: &str, resolved_by: &str) -> anyhow::Result<()> {
        self.send(&AlertCommand::Resolve {
            workload_id: workload_id.to_string(),
            source_id: source_id.to_string(),
            resolved_by: resolved_by.to_string(),
        })
        .await
    }
}
