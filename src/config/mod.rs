mod settings;

pub use settings::{
    GatewayConfig, OtelConfig, RedisConfig, ReplayPolicy, ServerConfig, Settings,
    WebTransportConfig,
};
