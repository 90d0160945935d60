use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub otel: OtelConfig,
    #[serde(default)]
    pub webtransport: WebTransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// What happens to undelivered reliable events when a connection resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// Deliver everything still queued for the connection, in order.
    #[default]
    Replay,
    /// Discard the queue on resume; the client sees a gap.
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Heartbeat interval in seconds (SSE comment, WebSocket ping)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Seconds a RECONNECTING connection waits for its client
    #[serde(default = "default_reconnect_grace")]
    pub reconnect_grace: u64,
    /// Bounded reliable outbound queue per connection
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Bounded datagram queue per WebTransport connection
    #[serde(default = "default_datagram_queue_capacity")]
    pub datagram_queue_capacity: usize,
    /// Retries after a Backpressure result before the event is dropped for that connection
    #[serde(default = "default_backpressure_retry_count")]
    pub backpressure_retry_count: u32,
    #[serde(default = "default_backpressure_retry_delay_ms")]
    pub backpressure_retry_delay_ms: u64,
    /// Heartbeat intervals without a pong before a WebSocket is closed
    #[serde(default = "default_missed_pong_threshold")]
    pub missed_pong_threshold: u32,
    /// Disconnect if no activity for this many seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Supervisor sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_subscriptions_per_connection")]
    pub max_subscriptions_per_connection: usize,
    /// Largest inbound frame accepted on WebSocket and WebTransport streams
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Upper bound for outbound datagrams; a lower session limit wins
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

/// HTTP/3 listener for WebTransport sessions (UDP)
#[derive(Debug, Clone, Deserialize)]
pub struct WebTransportConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_webtransport_port")]
    pub port: u16,
    /// PEM certificate chain. Without `cert` and `key` a self-signed
    /// certificate for localhost is generated.
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_webtransport_port() -> u16 {
    4433
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_reconnect_grace() -> u64 {
    30
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_datagram_queue_capacity() -> usize {
    64
}

fn default_backpressure_retry_count() -> u32 {
    1
}

fn default_backpressure_retry_delay_ms() -> u64 {
    50
}

fn default_missed_pong_threshold() -> u32 {
    2
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_subscriptions_per_connection() -> usize {
    64
}

fn default_max_frame_size() -> usize {
    1024 * 1024
}

fn default_max_datagram_size() -> usize {
    1200
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-realtime-gateway".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("gateway.heartbeat_interval", default_heartbeat_interval())?
            .set_default("gateway.reconnect_grace", default_reconnect_grace())?
            .set_default("redis.url", default_redis_url())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // SERVER_PORT, GATEWAY_HEARTBEAT_INTERVAL, REDIS_URL, ...
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn webtransport_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.webtransport.port)
    }
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    pub fn backpressure_retry_delay(&self) -> Duration {
        Duration::from_millis(self.backpressure_retry_delay_ms)
    }

    /// Events one connection may have waiting for a retry: a queue's worth
    /// per attempt.
    pub fn retry_backlog_capacity(&self) -> usize {
        let attempts = self.backpressure_retry_count.saturating_add(1) as usize;
        self.outbound_queue_capacity.max(1).saturating_mul(attempts)
    }

    /// How long a WebSocket may go without a pong before it is closed.
    pub fn pong_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_pong_threshold.max(1)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            redis: RedisConfig::default(),
            otel: OtelConfig::default(),
            webtransport: WebTransportConfig::default(),
        }
    }
}

impl Default for WebTransportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_webtransport_port(),
            cert: None,
            key: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            reconnect_grace: default_reconnect_grace(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            datagram_queue_capacity: default_datagram_queue_capacity(),
            backpressure_retry_count: default_backpressure_retry_count(),
            backpressure_retry_delay_ms: default_backpressure_retry_delay_ms(),
            missed_pong_threshold: default_missed_pong_threshold(),
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions_per_connection(),
            max_frame_size: default_max_frame_size(),
            max_datagram_size: default_max_datagram_size(),
            replay_policy: ReplayPolicy::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            channels: vec![],
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8081);

        let gateway = GatewayConfig::default();
        assert_eq!(gateway.outbound_queue_capacity, 64);
        assert_eq!(gateway.backpressure_retry_count, 1);
        assert_eq!(gateway.replay_policy, ReplayPolicy::Replay);
        assert_eq!(gateway.retry_backlog_capacity(), 128);

        let webtransport = WebTransportConfig::default();
        assert!(!webtransport.enabled);
        assert_eq!(webtransport.port, 4433);
        assert!(webtransport.cert.is_none());
    }

    #[test]
    fn test_pong_timeout_scales_with_threshold() {
        let gateway = GatewayConfig {
            heartbeat_interval: 10,
            missed_pong_threshold: 3,
            ..Default::default()
        };
        assert_eq!(gateway.pong_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_replay_policy_deserialize() {
        let policy: ReplayPolicy = serde_json::from_str(r#""none""#).unwrap();
        assert_eq!(policy, ReplayPolicy::None);
        let policy: ReplayPolicy = serde_json::from_str(r#""replay""#).unwrap();
        assert_eq!(policy, ReplayPolicy::Replay);
    }
}
