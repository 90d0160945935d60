use bytes::Bytes;

use crate::connection::ConnectionId;
use crate::error::GatewayError;
use crate::registry::{is_valid_topic, SubscriptionRegistry};

use super::message::{ClientMessage, ServerMessage};

/// What an adapter should do with a parsed client message
#[derive(Debug, PartialEq)]
pub enum Control {
    /// Write these replies back to the client
    Reply(Vec<ServerMessage>),
    /// Hand the payload to the inbound handler
    Forward(Bytes),
}

/// Apply a control message on behalf of `connection_id`
#[tracing::instrument(
    name = "control.message",
    skip(registry, msg),
    fields(connection_id = %connection_id)
)]
pub fn handle_control(
    registry: &SubscriptionRegistry,
    connection_id: ConnectionId,
    msg: ClientMessage,
) -> Control {
    match msg {
        ClientMessage::Subscribe { topics } => {
            Control::Reply(handle_subscribe(registry, connection_id, topics))
        }
        ClientMessage::Unsubscribe { topics } => {
            let unsubscribed: Vec<String> = topics
                .into_iter()
                .filter(|topic| registry.unsubscribe(topic, connection_id))
                .collect();
            tracing::debug!(topics = ?unsubscribed, "Unsubscribed from topics");
            Control::Reply(vec![ServerMessage::unsubscribed(unsubscribed)])
        }
        ClientMessage::Ping => Control::Reply(vec![ServerMessage::Pong]),
        ClientMessage::Message { data } => match serde_json::to_vec(&data) {
            Ok(payload) => Control::Forward(Bytes::from(payload)),
            Err(e) => Control::Reply(vec![ServerMessage::error("INVALID_MESSAGE", e.to_string())]),
        },
    }
}

/// Subscribe to each topic, replying with the accepted ones and one error
/// covering the rest.
pub fn handle_subscribe(
    registry: &SubscriptionRegistry,
    connection_id: ConnectionId,
    topics: Vec<String>,
) -> Vec<ServerMessage> {
    let mut subscribed = Vec::new();
    let mut errors = Vec::new();

    for topic in topics {
        match registry.subscribe(&topic, connection_id) {
            Ok(_) => subscribed.push(topic),
            Err(e) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    topic = %topic,
                    error = %e,
                    "Failed to subscribe to topic"
                );
                errors.push(e.to_string());
            }
        }
    }

    let mut replies = Vec::new();
    if !subscribed.is_empty() {
        tracing::info!(connection_id = %connection_id, topics = ?subscribed, "Subscribed to topics");
        replies.push(ServerMessage::subscribed(subscribed));
    }
    if !errors.is_empty() {
        replies.push(ServerMessage::error("SUBSCRIPTION_ERROR", errors.join("; ")));
    }
    replies
}

/// Check topics requested at connect time before any connection exists
pub fn validate_topics(topics: &[String], max: usize) -> Result<(), GatewayError> {
    if let Some(bad) = topics.iter().find(|t| !is_valid_topic(t)) {
        return Err(GatewayError::InvalidTopic(bad.clone()));
    }
    if topics.len() > max {
        return Err(GatewayError::SubscriptionLimit {
            current: topics.len(),
            max,
        });
    }
    Ok(())
}

/// Split a comma-separated `topics` query parameter
pub fn parse_topic_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}
