//! Job queue/bus port.
//!
//! The logical contract over the persistent bus: FIFO-with-priority,
//! bounded, with pause/resume/drain and explicit acknowledgement. Five
//! logical queues exist by default; the implementation behind this port is
//! deliberately unspecified.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::JobPriority;

/// The default logical queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    JobExecution,
    ContainerManagement,
    Monitoring,
    WebhookProcessing,
    Cleanup,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobExecution => "job-execution",
            Self::ContainerManagement => "container-management",
            Self::Monitoring => "monitoring",
            Self::WebhookProcessing => "webhook-processing",
            Self::Cleanup => "cleanup",
        }
    }

    pub const ALL: [QueueName; 5] = [
        Self::JobExecution,
        Self::ContainerManagement,
        Self::Monitoring,
        Self::WebhookProcessing,
        Self::Cleanup,
    ];
}

/// An enqueued message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
}

/// Port to the persistent FIFO-with-priority bus.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a message; fails when the queue is at its bound.
    async fn enqueue(
        &self,
        queue: QueueName,
        priority: JobPriority,
        payload: serde_json::Value,
    ) -> Result<Uuid>;

    /// Pop the next message: highest priority first, FIFO within a
    /// priority. Returns None when the queue is empty or paused.
    async fn dequeue(&self, queue: QueueName) -> Result<Option<QueueMessage>>;

    /// Acknowledge a dequeued message so it is not redelivered.
    async fn ack(&self, queue: QueueName, message_id: Uuid) -> Result<()>;

    /// Return an unacknowledged message to the queue head.
    async fn nack(&self, queue: QueueName, message_id: Uuid) -> Result<()>;

    async fn pause(&self, queue: QueueName) -> Result<()>;

    async fn resume(&self, queue: QueueName) -> Result<()>;

    /// Remove every queued message; in-flight messages still need acks.
    async fn drain(&self, queue: QueueName) -> Result<usize>;

    async fn len(&self, queue: QueueName) -> Result<usize>;
}
