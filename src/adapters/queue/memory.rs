//! In-memory bounded job queue.
//!
//! Implements the bus contract for tests and single-node deployments:
//! FIFO within a priority, higher priority first, explicit acks with
//! redelivery on nack.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::models::JobPriority;
use crate::domain::ports::{JobQueue, QueueMessage, QueueName};

struct Queue {
    /// Kept ordered by (priority rank, seq).
    messages: Vec<(u64, QueueMessage)>,
    in_flight: HashMap<Uuid, (u64, QueueMessage)>,
    paused: bool,
}

impl Queue {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            in_flight: HashMap::new(),
            paused: false,
        }
    }
}

/// Bounded in-memory queue set.
pub struct InMemoryJobQueue {
    capacity: usize,
    seq: Mutex<u64>,
    queues: Mutex<HashMap<QueueName, Queue>>,
}

impl InMemoryJobQueue {
    pub fn new(capacity: usize) -> Self {
        let mut queues = HashMap::new();
        for name in QueueName::ALL {
            queues.insert(name, Queue::new());
        }
        Self {
            capacity,
            seq: Mutex::new(0),
            queues: Mutex::new(queues),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        priority: JobPriority,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let seq = {
            let mut seq = self.seq.lock().await;
            *seq += 1;
            *seq
        };
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(&queue)
            .ok_or_else(|| anyhow!("unknown queue"))?;
        if q.messages.len() >= self.capacity {
            return Err(anyhow!("queue {} full", queue.as_str()));
        }
        let message = QueueMessage {
            id: Uuid::new_v4(),
            priority,
            payload,
        };
        let id = message.id;
        let key = (priority.rank(), seq);
        let pos = q
            .messages
            .iter()
            .position(|(s, m)| (m.priority.rank(), *s) > key)
            .unwrap_or(q.messages.len());
        q.messages.insert(pos, (seq, message));
        Ok(id)
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<QueueMessage>> {
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(&queue)
            .ok_or_else(|| anyhow!("unknown queue"))?;
        if q.paused || q.messages.is_empty() {
            return Ok(None);
        }
        let (seq, message) = q.messages.remove(0);
        q.in_flight.insert(message.id, (seq, message.clone()));
        Ok(Some(message))
    }

    async fn ack(&self, queue: QueueName, message_id: Uuid) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(&queue)
            .ok_or_else(|| anyhow!("unknown queue"))?;
        q.in_flight
            .remove(&message_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("message {message_id} not in flight"))
    }

    async fn nack(&self, queue: QueueName, message_id: Uuid) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(&queue)
            .ok_or_else(|| anyhow!("unknown queue"))?;
        let (seq, message) = q
            .in_flight
            .remove(&message_id)
            .ok_or_else(|| anyhow!("message {message_id} not in flight"))?;
        // Redelivered at its original position.
        let key = (message.priority.rank(), seq);
        let pos = q
            .messages
            .iter()
            .position(|(s, m)| (m.priority.rank(), *s) > key)
            .unwrap_or(q.messages.len());
        q.messages.insert(pos, (seq, message));
        Ok(())
    }

    async fn pause(&self, queue: QueueName) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .get_mut(&queue)
            .ok_or_else(|| anyhow!("unknown queue"))?
            .paused = true;
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .get_mut(&queue)
            .ok_or_else(|| anyhow!("unknown queue"))?
            .paused = false;
        Ok(())
    }

    async fn drain(&self, queue: QueueName) -> Result<usize> {
        let mut queues = self.queues.lock().await;
        let q = queues
            .get_mut(&queue)
            .ok_or_else(|| anyhow!("unknown queue"))?;
        let drained = q.messages.len();
        q.messages.clear();
        Ok(drained)
    }

    async fn len(&self, queue: QueueName) -> Result<usize> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(&queue)
            .ok_or_else(|| anyhow!("unknown queue"))?
            .messages
            .len())
    }
}
