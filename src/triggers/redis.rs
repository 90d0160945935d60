use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;

use crate::config::RedisConfig;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::metrics::RedisMetrics;

use super::backoff::{Backoff, BackoffConfig};
use super::http::PublishRequest;

/// Channel listened on when none are configured
pub const DEFAULT_CHANNEL: &str = "gateway:publish";

/// Redis Pub/Sub subscriber. Every message is a JSON publish request, the
/// same body `POST /api/v1/publish` takes.
pub struct RedisSubscriber {
    config: RedisConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: broadcast::Sender<()>,
    backoff: BackoffConfig,
}

impl RedisSubscriber {
    pub fn new(config: RedisConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            dispatcher,
            shutdown,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Get a shutdown signal sender
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Run until shutdown, reconnecting with backoff after failures
    pub async fn start(&self) -> anyhow::Result<()> {
        let channels = self.channels();
        tracing::info!(channels = ?channels, "Starting Redis subscriber");

        let mut backoff = Backoff::new(self.backoff.clone());
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            match self.run_subscription_loop(&channels, &mut backoff).await {
                Ok(()) => {
                    tracing::info!("Redis subscriber stopped gracefully");
                    break;
                }
                Err(e) => {
                    RedisMetrics::set_connected(false);
                    let delay = backoff.next_delay();
                    tracing::error!(
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Redis subscription error, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(delay) => {
                            RedisMetrics::record_reconnection();
                        }
                    }
                }
            }
        }

        RedisMetrics::set_connected(false);
        Ok(())
    }

    fn channels(&self) -> Vec<String> {
        if self.config.channels.is_empty() {
            vec![DEFAULT_CHANNEL.to_string()]
        } else {
            self.config.channels.clone()
        }
    }

    async fn run_subscription_loop(
        &self,
        channels: &[String],
        backoff: &mut Backoff,
    ) -> anyhow::Result<()> {
        let client = redis::Client::open(self.config.url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;

        for channel in channels {
            if is_pattern(channel) {
                pubsub.psubscribe(channel).await?;
                tracing::debug!(pattern = %channel, "Subscribed to pattern");
            } else {
                pubsub.subscribe(channel).await?;
                tracing::debug!(channel = %channel, "Subscribed to channel");
            }
        }

        tracing::info!("Redis subscription established");
        RedisMetrics::set_connected(true);
        backoff.reset();

        let mut message_stream = pubsub.on_message();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Received shutdown signal");
                    return Ok(());
                }
                msg = message_stream.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("Redis message stream ended");
                    };
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to get message payload");
                            continue;
                        }
                    };
                    RedisMetrics::record_message_received();
                    self.handle_message(&channel, &payload);
                }
            }
        }
    }

    fn handle_message(&self, channel: &str, payload: &str) -> Option<DispatchReport> {
        let request: PublishRequest = match serde_json::from_str(payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    channel = %channel,
                    "Failed to parse Redis message"
                );
                return None;
            }
        };

        match self.dispatcher.publish_event(request.into_draft()) {
            Ok(report) => {
                tracing::debug!(
                    channel = %channel,
                    topic = %report.topic,
                    seq = report.seq,
                    delivered = report.delivered,
                    "Published event from Redis"
                );
                Some(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, channel = %channel, "Rejected event from Redis");
                None
            }
        }
    }
}

fn is_pattern(channel: &str) -> bool {
    channel.contains('*') || channel.contains('?') || channel.contains('[')
}
