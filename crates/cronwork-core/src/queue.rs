// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue consumer.
//!
//! A thin loop over an external queue primitive: listen for as long as the
//! budget allows, hand each message to a handler, ack on success and
//! release it back on failure.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cronwork_store::{InsertOptions, Predicate, Row, SelectOptions, SortOrder, Store};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorCause, Result};
use crate::logs::{LogIngestor, LogRecord};
use crate::runtime::{Job, JobContext, StepOutcome};

/// `queue-consumer` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConsumerConfig {
    /// Queue table.
    pub queue_table: String,
    /// Topic to consume.
    pub topic: String,
    /// Longest single listen.
    pub listen_timeout_secs: u64,
    /// Budget kept back from every listen.
    pub safety_margin_secs: u64,
    /// Poll interval while listening.
    pub poll_interval_ms: u64,
    /// Finish the job after a listen that received nothing.
    pub exit_when_idle: bool,
    /// Finish the job after this many handler failures.
    pub max_failures: u32,
    /// Log table written by the ingest handler.
    pub log_table: String,
}

impl Default for QueueConsumerConfig {
    fn default() -> Self {
        Self {
            queue_table: "job_queue".to_string(),
            topic: "default".to_string(),
            listen_timeout_secs: 20,
            safety_margin_secs: 5,
            poll_interval_ms: 500,
            exit_when_idle: true,
            max_failures: 10,
            log_table: "logs".to_string(),
        }
    }
}

impl QueueConsumerConfig {
    /// Listen cap.
    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.listen_timeout_secs)
    }

    /// Margin kept back from the budget.
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A received message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMessage {
    /// Queue-assigned id.
    pub id: i64,
    /// Topic.
    pub topic: String,
    /// Opaque payload.
    pub payload: String,
    /// Enqueue time, epoch seconds.
    pub created_at: f64,
}

impl QueueMessage {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.get("id")?.as_i64()?,
            topic: row.get("topic")?.as_str()?.to_string(),
            payload: row.get("payload")?.as_str()?.to_string(),
            created_at: row.get("created_at").and_then(Value::as_f64).unwrap_or(0.0),
        })
    }
}

/// The external queue primitive.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Wait up to `wait` for a message.
    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>>;

    /// The message was handled.
    async fn ack(&self, message: &QueueMessage) -> Result<()>;

    /// The message was not handled; make it available again.
    async fn release(&self, message: &QueueMessage) -> Result<()>;

    /// Details of entries removed since the last call because they could
    /// not be read as messages.
    fn take_discarded(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Queue over a store table with `id`, `topic`, `payload`, `created_at`.
///
/// The oldest row is claimed by deleting it; a delete that removes nothing
/// means another consumer got there first. A released message is inserted
/// again behind the rest of the topic.
///
/// A head row that is not a message (no integer `id`, or no text `payload`)
/// is deleted and reported through [`MessageQueue::take_discarded`] so it
/// cannot block the topic.
pub struct StoreQueue {
    store: Arc<dyn Store>,
    table: String,
    topic: String,
    poll_interval: Duration,
    discarded: Mutex<Vec<String>>,
}

impl StoreQueue {
    /// Consume `topic` from `table`.
    pub fn new(
        store: Arc<dyn Store>,
        table: impl Into<String>,
        topic: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            topic: topic.into(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            discarded: Mutex::default(),
        }
    }

    /// Append a message.
    pub async fn enqueue(&self, payload: impl Into<String>, created_at: f64) -> Result<()> {
        let mut row = Row::new();
        row.insert("topic".into(), Value::String(self.topic.clone()));
        row.insert("payload".into(), Value::String(payload.into()));
        row.insert("created_at".into(), json!(created_at));
        self.store
            .insert(&self.table, &[row], &InsertOptions::default())
            .await?;
        Ok(())
    }

    async fn try_claim(&self) -> Result<Option<QueueMessage>> {
        loop {
            let rows = self
                .store
                .select(
                    &self.table,
                    &Predicate::eq("topic", self.topic.clone()),
                    &SelectOptions::default()
                        .order_by("id", SortOrder::Asc)
                        .limit(1),
                )
                .await?;
            let Some(row) = rows.first() else {
                return Ok(None);
            };
            let Some(message) = QueueMessage::from_row(row) else {
                self.discard(row).await?;
                continue;
            };

            let deleted = self
                .store
                .delete(&self.table, &Predicate::eq("id", message.id))
                .await?;
            if deleted > 0 {
                return Ok(Some(message));
            }
            debug!(id = message.id, "Message claimed by another consumer");
        }
    }

    /// Remove a malformed head row.
    async fn discard(&self, row: &Row) -> Result<()> {
        let predicate = match row.get("id") {
            Some(id) if !id.is_null() => Predicate::eq("id", id.clone()),
            // No id to go by: match the row on every column it has
            _ => {
                let columns: Vec<Predicate> = row
                    .iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(column, value)| Predicate::eq(column.clone(), value.clone()))
                    .collect();
                if columns.len() < 2 {
                    return Err(Error::Queue(format!(
                        "malformed row in {} cannot be identified",
                        self.table
                    )));
                }
                Predicate::And(columns)
            }
        };

        let deleted = self.store.delete(&self.table, &predicate).await?;
        if deleted > 0 {
            let detail = format!(
                "removed {} malformed row(s) from {}: {}",
                deleted,
                self.table,
                Value::Object(row.clone().into_iter().collect())
            );
            warn!(table = %self.table, topic = %self.topic, deleted, "Discarded malformed queue row");
            self.discarded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(detail);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for StoreQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(message) = self.try_claim().await? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, _message: &QueueMessage) -> Result<()> {
        Ok(())
    }

    async fn release(&self, message: &QueueMessage) -> Result<()> {
        self.enqueue(message.payload.clone(), message.created_at)
            .await
    }

    fn take_discarded(&self) -> Vec<String> {
        std::mem::take(&mut *self.discarded.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for StoreQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreQueue")
            .field("backend", &self.store.backend())
            .field("table", &self.table)
            .field("topic", &self.topic)
            .finish()
    }
}

/// Processes one message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `Err` leaves the message un-acked.
    async fn handle(&self, message: &QueueMessage) -> Result<()>;
}

/// Treats each payload as one JSON log line and writes it to the log store.
#[derive(Debug, Clone)]
pub struct IngestHandler {
    ingestor: LogIngestor,
    node: String,
}

impl IngestHandler {
    /// Write through `ingestor`; lines without a node get `node`.
    pub fn new(ingestor: LogIngestor, node: impl Into<String>) -> Self {
        Self {
            ingestor,
            node: node.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for IngestHandler {
    async fn handle(&self, message: &QueueMessage) -> Result<()> {
        let record = LogRecord::parse_line(&message.payload, &self.node)
            .map_err(|e| Error::Queue(format!("message {}: {}", message.id, e)))?;
        if record.is_ingest_failure() {
            debug!(id = message.id, "Dropping ingest-failure record");
            return Ok(());
        }
        self.ingestor.ingest(std::slice::from_ref(&record)).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct ConsumerStats {
    handled: u64,
    failed: u64,
}

/// Listens on a queue within the budget and dispatches to a handler.
pub struct QueueConsumerJob {
    config: QueueConsumerConfig,
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn MessageHandler>,
    stats: ConsumerStats,
    discarded: u64,
}

impl QueueConsumerJob {
    /// Job identifier.
    pub const ID: &'static str = "queue-consumer";

    /// Consume `queue` with `handler`.
    pub fn new(
        config: QueueConsumerConfig,
        queue: Arc<dyn MessageQueue>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            config,
            queue,
            handler,
            stats: ConsumerStats::default(),
            discarded: 0,
        }
    }

    fn record_discarded(&mut self, ctx: &mut JobContext) {
        for detail in self.queue.take_discarded() {
            self.discarded += 1;
            let key = format!("{}#discarded-{}", Self::ID, self.discarded);
            ctx.record_error(ErrorCause::QueueMessageDiscarded, &key, detail);
        }
    }

    fn result(&self) -> Value {
        let mut result = BTreeMap::new();
        result.insert(self.config.topic.clone(), self.stats);
        serde_json::to_value(result).unwrap_or_default()
    }
}

#[async_trait]
impl Job for QueueConsumerJob {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&mut self, ctx: &mut JobContext) -> Result<StepOutcome> {
        if ctx.dry_run {
            debug!("Dry run, not receiving");
            return Ok(StepOutcome::exit(self.result()));
        }
        let Some(wait) = ctx
            .budget
            .listen_window(self.config.listen_timeout(), self.config.safety_margin())
        else {
            debug!("No budget left to listen");
            return Ok(StepOutcome::exit(self.result()));
        };

        let received = self.queue.receive(wait).await;
        self.record_discarded(ctx);
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                let result = self.result();
                return Ok(if self.config.exit_when_idle {
                    StepOutcome::exit(result)
                } else {
                    StepOutcome::proceed(result)
                });
            }
            Err(e) => {
                ctx.record_error(ErrorCause::QueueReceiveFailed, Self::ID, e.to_string());
                return Ok(StepOutcome::exit(self.result()));
            }
        };

        let key = format!("{}#{}", Self::ID, message.id);
        match self.handler.handle(&message).await {
            Ok(()) => {
                self.stats.handled += 1;
                if let Err(e) = self.queue.ack(&message).await {
                    ctx.record_error(ErrorCause::QueueReceiveFailed, &key, e.to_string());
                }
                ctx.progress(&format!("{}: handled", key));
            }
            Err(e) => {
                self.stats.failed += 1;
                ctx.record_error(ErrorCause::QueueHandlerFailed, &key, e.to_string());
                if let Err(e) = self.queue.release(&message).await {
                    ctx.record_error(ErrorCause::QueueReceiveFailed, &key, e.to_string());
                }
            }
        }

        let exit = self.stats.failed >= u64::from(self.config.max_failures);
        if exit {
            info!(failed = self.stats.failed, "Too many handler failures, stopping");
        }
        Ok(StepOutcome {
            exit,
            result: self.result(),
        })
    }

    async fn after(&mut self, _ctx: &mut JobContext, _last: Option<Value>) -> Value {
        self.result()
    }
}

impl std::fmt::Debug for QueueConsumerJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumerJob")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::TimeBudget;
    use crate::runtime::JobRuntime;
    use cronwork_store::MemoryStore;

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, message: &QueueMessage) -> Result<()> {
            Err(Error::Queue(format!("cannot handle {}", message.payload)))
        }
    }

    async fn queue_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.create_table("job_queue", &["id"]).await;
        store.create_table("logs", &[]).await;
        store
    }

    async fn push(store: &MemoryStore, id: i64, payload: &str) {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("topic".into(), json!("default"));
        row.insert("payload".into(), json!(payload));
        row.insert("created_at".into(), json!(id as f64));
        store
            .insert("job_queue", &[row], &InsertOptions::default())
            .await
            .unwrap();
    }

    fn config() -> QueueConsumerConfig {
        QueueConsumerConfig {
            listen_timeout_secs: 1,
            safety_margin_secs: 0,
            poll_interval_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_receive_claims_oldest_message() {
        let store = queue_store().await;
        push(&store, 2, "second").await;
        push(&store, 1, "first").await;
        let queue = StoreQueue::new(store.clone(), "job_queue", "default", Duration::from_millis(5));

        let message = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(message.payload, "first");
        assert_eq!(store.rows("job_queue").await.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_queue() {
        let store = queue_store().await;
        let queue = StoreQueue::new(store, "job_queue", "default", Duration::from_millis(5));

        assert!(queue.receive(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_ingests_log_messages() {
        let store = queue_store().await;
        push(
            &store,
            1,
            r#"{"channel":"app","level":300,"created":10,"message":"queued"}"#,
        )
        .await;

        let queue = Arc::new(StoreQueue::new(
            store.clone(),
            "job_queue",
            "default",
            Duration::from_millis(5),
        ));
        let handler = Arc::new(IngestHandler::new(
            LogIngestor::new(store.clone(), "logs", 100),
            "queue",
        ));
        let mut job = QueueConsumerJob::new(config(), queue, handler);

        let ctx = JobContext::new(TimeBudget::new(Duration::from_secs(5)));
        let report = JobRuntime::new().execute(&mut job, ctx).await;

        assert!(!report.has_errors());
        assert_eq!(report.result["queue-consumer"]["default"]["handled"], 1);
        let logs = store.rows("logs").await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["Node"], "queue");
        assert!(store.rows("job_queue").await.is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_releases_message() {
        let store = queue_store().await;
        push(&store, 1, "poison").await;

        let queue = Arc::new(StoreQueue::new(
            store.clone(),
            "job_queue",
            "default",
            Duration::from_millis(5),
        ));
        let mut cfg = config();
        cfg.max_failures = 1;
        let mut job = QueueConsumerJob::new(cfg, queue, Arc::new(FailingHandler));

        let ctx = JobContext::new(TimeBudget::new(Duration::from_secs(5)));
        let report = JobRuntime::new().execute(&mut job, ctx).await;

        assert_eq!(
            report.errors.get(ErrorCause::QueueHandlerFailed, "queue-consumer#1"),
            Some("Queue error: cannot handle poison")
        );
        let remaining = store.rows("job_queue").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["payload"], "poison");
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_row_without_id_does_not_block_topic() {
        let store = queue_store().await;
        push(&store, 1, "poison").await;
        push(
            &store,
            2,
            r#"{"channel":"app","level":300,"created":10,"message":"behind"}"#,
        )
        .await;

        let queue = Arc::new(StoreQueue::new(
            store.clone(),
            "job_queue",
            "default",
            Duration::from_millis(5),
        ));
        let handler = Arc::new(IngestHandler::new(
            LogIngestor::new(store.clone(), "logs", 100),
            "queue",
        ));
        let mut job = QueueConsumerJob::new(config(), queue, handler);

        let ctx = JobContext::new(TimeBudget::new(Duration::from_secs(5)));
        let report = JobRuntime::new().execute(&mut job, ctx).await;

        assert!(
            report
                .errors
                .get(ErrorCause::QueueHandlerFailed, "queue-consumer#1")
                .is_some()
        );
        let discarded = report
            .errors
            .get(ErrorCause::QueueMessageDiscarded, "queue-consumer#discarded-1")
            .unwrap();
        assert!(discarded.contains("poison"));
        assert_eq!(
            report.result["queue-consumer"]["default"],
            json!({"handled": 1, "failed": 1})
        );
        assert_eq!(store.rows("logs").await.len(), 1);
        assert!(store.rows("job_queue").await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_row_with_id_is_removed_by_id() {
        let store = queue_store().await;
        let mut broken = Row::new();
        broken.insert("id".into(), json!(1));
        broken.insert("topic".into(), json!("default"));
        broken.insert("payload".into(), Value::Null);
        store
            .insert("job_queue", &[broken], &InsertOptions::default())
            .await
            .unwrap();
        push(&store, 2, "next").await;
        let queue = StoreQueue::new(store.clone(), "job_queue", "default", Duration::from_millis(5));

        let message = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(message.id, 2);
        let discarded = queue.take_discarded();
        assert_eq!(discarded.len(), 1);
        assert!(discarded[0].starts_with("removed 1 malformed row(s) from job_queue"));
        assert!(queue.take_discarded().is_empty());
        assert!(store.rows("job_queue").await.is_empty());
    }

    #[tokio::test]
    async fn test_unidentifiable_row_is_a_receive_error() {
        let store = queue_store().await;
        let mut bare = Row::new();
        bare.insert("topic".into(), json!("default"));
        store
            .insert("job_queue", &[bare], &InsertOptions::default())
            .await
            .unwrap();
        let queue = StoreQueue::new(store.clone(), "job_queue", "default", Duration::from_millis(5));

        assert!(matches!(
            queue.receive(Duration::ZERO).await,
            Err(Error::Queue(_))
        ));
        assert_eq!(store.rows("job_queue").await.len(), 1);
    }
}
