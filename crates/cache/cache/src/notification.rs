//! Best-effort publish/subscribe fan-out.
//!
//! Every subscription owns a bounded output buffer and one drain task that
//! moves messages from the backing stream into that buffer. Delivery into
//! the buffer never blocks: when a consumer falls behind, new messages are
//! dropped and counted in
//! [`NotificationMetricsSnapshot::dropped_messages`](crate::NotificationMetricsSnapshot::dropped_messages).
//! Publishers are never slowed down by subscribers.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::backend::{MessageStream, PubSubBackend, RawMessage};
use crate::config::NotificationConfig;
use crate::error::CacheError;
use crate::events::{
    TASK_PATTERN, TaskEvent, WORKFLOW_PATTERN, WorkflowEvent, task_channel, workflow_channel,
};
use crate::metrics::{NotificationMetrics, NotificationMetricsSnapshot};

/// A message delivered to a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    /// The pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Deserialize the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            CacheError::Serialization(format!("decode message on {}: {e}", self.channel))
        })
    }
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Self {
        Self {
            channel: raw.channel,
            pattern: raw.pattern,
            payload: raw.payload,
            received_at: Utc::now(),
        }
    }
}

/// A live subscription.
///
/// Dropping the handle or calling [`close`](Self::close) stops its drain
/// task and closes the backing subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Wait for the next message. Returns `None` once the subscription has
    /// been closed and its buffer drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take a buffered message without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Stop delivery. Messages already buffered can still be received.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether delivery has stopped.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Publishes messages and manages fan-out subscriptions over a
/// [`PubSubBackend`].
pub struct NotificationSystem {
    backend: Arc<dyn PubSubBackend>,
    buffer_size: usize,
    metrics: Arc<NotificationMetrics>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    closed: tokio::sync::Mutex<bool>,
}

impl NotificationSystem {
    /// Create a notification system over `backend`.
    pub fn new(backend: Arc<dyn PubSubBackend>, config: &NotificationConfig) -> Self {
        Self {
            backend,
            buffer_size: config.buffer_size.max(1),
            metrics: Arc::new(NotificationMetrics::default()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            closed: tokio::sync::Mutex::new(false),
        }
    }

    /// Capacity of each subscription's output buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Serialize `message` as JSON and publish it on `channel`.
    ///
    /// Returns the number of backing subscriptions the message reached.
    pub async fn publish<T>(&self, channel: &str, message: &T) -> Result<u64, CacheError>
    where
        T: Serialize + ?Sized,
    {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.record_publish_error();
                return Err(CacheError::Serialization(format!(
                    "encode message for {channel}: {e}"
                )));
            }
        };

        let started = Instant::now();
        match self.backend.publish(channel, &payload).await {
            Ok(receivers) => {
                self.metrics.record_published(started.elapsed());
                Ok(receivers)
            }
            Err(e) => {
                self.metrics.record_publish_error();
                Err(e)
            }
        }
    }

    /// Subscribe to one or more exact channels.
    pub async fn subscribe<I, S>(&self, channels: I) -> Result<Subscription, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        if channels.is_empty() {
            return Err(CacheError::Validation(
                "at least one channel is required".into(),
            ));
        }
        self.ensure_open()?;

        let stream = self
            .backend
            .subscribe(&channels)
            .await
            .inspect_err(|_| self.metrics.record_subscribe_error())?;
        // close() may have run while the backend was subscribing.
        self.ensure_open()?;

        debug!(?channels, "subscribed");
        Ok(self.spawn_drain(stream))
    }

    /// Subscribe to one or more glob patterns.
    pub async fn subscribe_pattern<I, S>(&self, patterns: I) -> Result<Subscription, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        if patterns.is_empty() {
            return Err(CacheError::Validation(
                "at least one pattern is required".into(),
            ));
        }
        self.ensure_open()?;

        let stream = self
            .backend
            .psubscribe(&patterns)
            .await
            .inspect_err(|_| self.metrics.record_subscribe_error())?;
        self.ensure_open()?;

        debug!(?patterns, "pattern subscribed");
        Ok(self.spawn_drain(stream))
    }

    /// Publish a workflow lifecycle event on `workflow:<id>`.
    pub async fn publish_workflow_event(
        &self,
        workflow_id: &str,
        event: &str,
        status: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), CacheError> {
        let payload = WorkflowEvent {
            workflow_id: workflow_id.to_owned(),
            event: event.to_owned(),
            status: status.to_owned(),
            data,
            timestamp: Utc::now(),
        };
        self.publish(&workflow_channel(workflow_id), &payload)
            .await
            .map(|_| ())
    }

    /// Publish a task lifecycle event on `task:<id>`, mirrored onto
    /// `workflow:<workflow_id>` when a workflow id is given.
    pub async fn publish_task_event(
        &self,
        task_id: &str,
        workflow_id: Option<&str>,
        event: &str,
        status: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), CacheError> {
        let payload = TaskEvent {
            task_id: task_id.to_owned(),
            workflow_id: workflow_id.map(str::to_owned),
            event: event.to_owned(),
            status: status.to_owned(),
            data,
            timestamp: Utc::now(),
        };
        self.publish(&task_channel(task_id), &payload).await?;

        if let Some(workflow_id) = workflow_id {
            self.publish(&workflow_channel(workflow_id), &payload)
                .await?;
        }
        Ok(())
    }

    /// Subscribe to events of one workflow.
    pub async fn subscribe_to_workflow(&self, workflow_id: &str) -> Result<Subscription, CacheError> {
        self.subscribe([workflow_channel(workflow_id)]).await
    }

    /// Subscribe to events of one task.
    pub async fn subscribe_to_task(&self, task_id: &str) -> Result<Subscription, CacheError> {
        self.subscribe([task_channel(task_id)]).await
    }

    /// Subscribe to events of every workflow.
    pub async fn subscribe_to_all_workflows(&self) -> Result<Subscription, CacheError> {
        self.subscribe_pattern([WORKFLOW_PATTERN]).await
    }

    /// Subscribe to events of every task.
    pub async fn subscribe_to_all_tasks(&self) -> Result<Subscription, CacheError> {
        self.subscribe_pattern([TASK_PATTERN]).await
    }

    /// Point-in-time copy of the pub/sub counters.
    pub fn metrics(&self) -> NotificationMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop every subscription and wait for all drain tasks to exit.
    ///
    /// Idempotent. Later subscribe calls fail with [`CacheError::Closed`].
    pub async fn close(&self) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("notification system closed");
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.shutdown.is_cancelled() {
            return Err(CacheError::Closed("notification system".into()));
        }
        Ok(())
    }

    fn spawn_drain(&self, stream: MessageStream) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let cancel = self.shutdown.child_token();

        self.metrics.subscription_opened();
        let metrics = Arc::clone(&self.metrics);
        self.tasks
            .spawn(drain(stream, tx, cancel.clone(), metrics));

        Subscription { rx, cancel }
    }
}

/// Move messages from the backing stream into one subscription's buffer
/// until cancelled, the consumer goes away, or the stream ends.
async fn drain(
    mut stream: MessageStream,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    metrics: Arc<NotificationMetrics>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tx.closed() => break,
            next = stream.next() => {
                let Some(raw) = next else {
                    debug!("backing subscription ended");
                    break;
                };
                match tx.try_send(Message::from(raw)) {
                    Ok(()) => metrics.record_received(),
                    Err(TrySendError::Full(msg)) => {
                        metrics.record_dropped();
                        warn!(channel = %msg.channel, "subscriber buffer full, dropping message");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }

    drop(stream);
    metrics.subscription_closed();
}
