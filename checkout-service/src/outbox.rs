use anyhow::Result;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::EventEnvelope;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::models::*;
use crate::schema::*;
use crate::store::postgres::DbPool;

const BATCH_SIZE: i64 = 100;

/// Relays committed outbox rows to Kafka, oldest first. A row is only marked
/// processed after the broker acknowledged it, so delivery is at-least-once.
pub struct OutboxProcessor {
    pool: DbPool,
    producer: FutureProducer,
    topic: String,
    interval: Duration,
}

impl OutboxProcessor {
    pub fn new(pool: DbPool, producer: FutureProducer, topic: String, interval: Duration) -> Self {
        Self {
            pool,
            producer,
            topic,
            interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    async fn process_outbox_events(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let unprocessed_events = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(BATCH_SIZE)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        for event in unprocessed_events {
            let id = event.id;
            if let Err(e) = self.publish_event(event).await {
                error!("Failed to publish event {}: {}", id, e);
                continue;
            }

            diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
                .set(outbox_events::processed.eq(true))
                .execute(&mut conn)
                .await?;

            info!("Published outbox event: {}", id);
        }

        Ok(())
    }

    async fn publish_event(&self, event: DbOutboxEvent) -> Result<()> {
        let key = event.aggregate_id.clone();
        let envelope = EventEnvelope::try_from(event)?;
        let json = serde_json::to_string(&envelope)?;
        let record = FutureRecord::to(&self.topic).payload(&json).key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}
