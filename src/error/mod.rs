use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::connection::{ConnectionId, ConnectionState};

/// Failures inside the gateway core. Every variant is scoped to a single
/// connection or request; none of them is process-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("outbound queue full")]
    Backpressure,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection closed")]
    Closed,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("subscription limit exceeded ({current}/{max})")]
    SubscriptionLimit { current: usize, max: usize },

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::HandshakeFailed(_) => "HANDSHAKE_FAILED",
            GatewayError::Backpressure => "BACKPRESSURE",
            GatewayError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            GatewayError::Closed => "CLOSED",
            GatewayError::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            GatewayError::InvalidTopic(_) => "INVALID_TOPIC",
            GatewayError::SubscriptionLimit { .. } => "SUBSCRIPTION_LIMIT",
            GatewayError::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }
}

/// Errors surfaced by the HTTP API.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = match &self {
            AppError::Config(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Configuration error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", client_msg, log_msg)
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Internal(e) => {
                let log_msg = e.clone();
                let client_msg = if is_production() {
                    "Internal server error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", client_msg, log_msg)
            }
            AppError::Gateway(e) => {
                let status = match e {
                    GatewayError::UnknownConnection(_) => StatusCode::NOT_FOUND,
                    GatewayError::InvalidTopic(_) | GatewayError::ProtocolViolation(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    GatewayError::SubscriptionLimit { .. } | GatewayError::Backpressure => {
                        StatusCode::TOO_MANY_REQUESTS
                    }
                    GatewayError::HandshakeFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
                    GatewayError::Closed | GatewayError::InvalidTransition { .. } => {
                        StatusCode::CONFLICT
                    }
                };
                (status, e.code(), e.to_string(), e.to_string())
            }
        };

        if status.is_server_error() {
            tracing::error!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API error"
            );
        } else {
            tracing::debug!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API request rejected"
            );
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_codes() {
        assert_eq!(GatewayError::Backpressure.code(), "BACKPRESSURE");
        assert_eq!(
            GatewayError::HandshakeFailed("limit".into()).code(),
            "HANDSHAKE_FAILED"
        );
        assert_eq!(
            GatewayError::SubscriptionLimit { current: 2, max: 2 }.to_string(),
            "subscription limit exceeded (2/2)"
        );
    }

    #[test]
    fn test_unknown_connection_maps_to_404() {
        let err = AppError::from(GatewayError::UnknownConnection(ConnectionId::new()));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validation_maps_to_400() {
        let response = AppError::Validation("bad".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
