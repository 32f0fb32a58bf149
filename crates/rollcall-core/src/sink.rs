//! Contracts between the frame pipeline and the outside world: the durable
//! attendance log and the best-effort notification channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One first-sighting-per-window of an enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    /// Unique per emission; lets a sink treat a retried write as a no-op.
    pub id: Uuid,
    pub identity: String,
    pub camera_id: String,
    pub occurred_at: DateTime<Utc>,
    pub similarity: f32,
}

impl AttendanceEvent {
    pub fn new(identity: &str, camera_id: &str, occurred_at: DateTime<Utc>, similarity: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            camera_id: camera_id.to_string(),
            occurred_at,
            similarity,
        }
    }

    pub fn notification(&self) -> Notification {
        Notification {
            identity: self.identity.clone(),
            camera_id: self.camera_id.clone(),
            occurred_at: self.occurred_at,
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("store write failed: {0}")]
    Write(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable attendance log.
///
/// Must accept the first write of any event; may ignore an exact retry.
pub trait EventSink: Send + Sync {
    fn log_event(&self, event: &AttendanceEvent) -> Result<(), SinkError>;
}

/// Push message for a recognised person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub identity: String,
    pub camera_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Nobody is registered to receive messages for this identity.
    NoRecipient,
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification transport: {0}")]
    Transport(String),
    #[error("recipient registry: {0}")]
    Registry(String),
}

/// Best-effort push channel. Never retried by the caller.
pub trait Notifier: Send {
    fn notify(&self, notification: &Notification) -> Result<Delivery, NotifyError>;
}
