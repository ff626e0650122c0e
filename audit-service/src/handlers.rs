use anyhow::Result;
use async_trait::async_trait;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use shared::EventEnvelope;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

/// Destination of audit rows.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Returns `false` when the event was already recorded.
    async fn store(&self, row: &NewAuditLog) -> Result<bool>;
}

pub struct PgAuditSink {
    pool: DbPool,
}

impl PgAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn store(&self, row: &NewAuditLog) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let inserted = diesel::insert_into(audit_log::table)
            .values(row)
            .on_conflict(audit_log::event_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(inserted > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Recorded,
    Duplicate,
    /// Payload that can never be decoded; committing past it is safe.
    Skipped,
}

/// Writes one audit row per storefront event. Redelivered events hit the
/// unique `event_id` and are skipped. An offset is committed only once its
/// event is stored or known to be undecodable.
pub struct EventConsumer<S> {
    sink: S,
    retry_backoff: Duration,
    max_backoff: Duration,
}

impl<S: AuditSink> EventConsumer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            retry_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    match m.payload_view::<str>() {
                        Some(Ok(json_str)) => {
                            self.handle_payload(json_str).await;
                        }
                        Some(Err(e)) => warn!("Skipping payload that is not UTF-8: {}", e),
                        None => warn!("Skipping event without payload"),
                    }
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    /// Decodes and stores one event, retrying storage failures until they
    /// succeed so that the caller never commits past an unrecorded event.
    pub async fn handle_payload(&self, json_str: &str) -> Handled {
        let envelope = match serde_json::from_str::<EventEnvelope>(json_str) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Skipping undecodable event: {}", e);
                return Handled::Skipped;
            }
        };
        let row = match NewAuditLog::from_envelope(&envelope) {
            Ok(row) => row,
            Err(e) => {
                warn!("Skipping event {} with unencodable payload: {}", envelope.id, e);
                return Handled::Skipped;
            }
        };

        let mut backoff = self.retry_backoff;
        loop {
            match self.sink.store(&row).await {
                Ok(true) => {
                    info!("Audited {} on {} by account {}", row.action, row.essence, row.account_id);
                    return Handled::Recorded;
                }
                Ok(false) => {
                    info!("Event {} already audited", envelope.id);
                    return Handled::Duplicate;
                }
                Err(e) => {
                    error!("Error recording event {}, retrying in {:?}: {}", envelope.id, backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }
}
