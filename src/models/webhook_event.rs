//! Inbound payment-provider callback ledger.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::webhook_events;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = webhook_events)]
pub struct WebhookEvent {
    pub id: String,
    pub escrow_id: String,
    pub provider: String,
    pub payload_json: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub external_txid: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = webhook_events)]
pub struct NewWebhookEvent {
    pub id: String,
    pub escrow_id: String,
    pub provider: String,
    pub payload_json: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub external_txid: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Default for NewWebhookEvent {
    fn default() -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: String::new(),
            escrow_id: String::new(),
            provider: String::new(),
            payload_json: "{}".to_string(),
            amount_minor: 0,
            currency: "NGN".to_string(),
            status: "processing".to_string(),
            external_txid: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl WebhookEvent {
    pub fn create(conn: &mut SqliteConnection, new_event: NewWebhookEvent) -> Result<WebhookEvent> {
        let event_id = new_event.id.clone();
        diesel::insert_into(webhook_events::table)
            .values(&new_event)
            .execute(conn)
            .with_context(|| format!("Failed to insert webhook event {event_id}"))?;
        Self::find_by_id(conn, &event_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, event_id: &str) -> Result<WebhookEvent> {
        webhook_events::table
            .filter(webhook_events::id.eq(event_id))
            .first(conn)
            .with_context(|| format!("Webhook event {event_id} not found"))
    }

    /// Events still awaiting processing, oldest first. Events left in
    /// `processing` by a crash or a rate outage are picked up here.
    pub fn find_processing(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<WebhookEvent>> {
        webhook_events::table
            .filter(webhook_events::status.eq("processing"))
            .order(webhook_events::created_at.asc())
            .limit(limit)
            .load(conn)
            .context("Failed to load processing webhook events")
    }

    pub fn mark_completed(conn: &mut SqliteConnection, event_id: &str) -> Result<()> {
        diesel::update(webhook_events::table.filter(webhook_events::id.eq(event_id)))
            .set((
                webhook_events::status.eq("completed"),
                webhook_events::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to complete webhook event {event_id}"))?;
        Ok(())
    }

    pub fn mark_failed(conn: &mut SqliteConnection, event_id: &str) -> Result<()> {
        diesel::update(webhook_events::table.filter(webhook_events::id.eq(event_id)))
            .set((
                webhook_events::status.eq("failed"),
                webhook_events::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to fail webhook event {event_id}"))?;
        Ok(())
    }
}
