//! Request/response channel between the page context and the dashboard or
//! background collaborators. Messages are `{type, payload, timestamp}` JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    /// Re-read every feature flag from the store and apply it.
    ReloadFeatures,
    GetFeatureStates,
    FeatureStates,
    /// Payload `{ "id": .., "enabled": .. }`; persisted through the store.
    SetFeatureState,
    Ack,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: u64,
}

impl RuntimeMessage {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::json!({ "message": message.into() }),
        )
    }

    pub fn from_json(raw: &str) -> Result<Self, MessagingError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, MessagingError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetFeatureStatePayload {
    pub id: String,
    pub enabled: bool,
}

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("page context is gone")]
    Closed,
    #[error("page context dropped the request")]
    NoReply,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub struct MessageRequest {
    pub message: RuntimeMessage,
    pub reply: oneshot::Sender<RuntimeMessage>,
}

/// Sending half, cloneable for every collaborator that talks to the page.
#[derive(Clone)]
pub struct MessageClient {
    tx: mpsc::Sender<MessageRequest>,
}

impl MessageClient {
    pub async fn request(&self, message: RuntimeMessage) -> Result<RuntimeMessage, MessagingError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(MessageRequest { message, reply })
            .await
            .map_err(|_| MessagingError::Closed)?;
        response.await.map_err(|_| MessagingError::NoReply)
    }

    pub async fn send(&self, kind: MessageType, payload: Value) -> Result<RuntimeMessage, MessagingError> {
        self.request(RuntimeMessage::new(kind, payload)).await
    }
}

pub type MessageReceiver = mpsc::Receiver<MessageRequest>;

pub fn channel(capacity: usize) -> (MessageClient, MessageReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MessageClient { tx }, rx)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
