use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::EventEnvelope;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = crate::schema::audit_log)]
pub struct NewAuditLog {
    pub event_id: Uuid,
    /// `Entity:id` of the audited record.
    pub essence: String,
    pub action: String,
    pub account_id: i64,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl NewAuditLog {
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: envelope.id,
            essence: envelope.aggregate_id.clone(),
            action: envelope.event.audit_action().to_string(),
            account_id: envelope.event.actor(),
            payload: serde_json::to_value(&envelope.event)?,
            recorded_at: envelope.occurred_at,
        })
    }
}
