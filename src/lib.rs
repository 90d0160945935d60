// Shared components
pub mod config;
pub mod error;
pub mod metrics;

// Core (transport-agnostic)
pub mod connection;
pub mod dispatcher;
pub mod event;
pub mod inbound;
pub mod protocol;
pub mod registry;
pub mod supervisor;

// Transport adapters
pub mod sse;
pub mod websocket;
pub mod webtransport;

// Application layer
pub mod api;
pub mod server;
pub mod triggers;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
