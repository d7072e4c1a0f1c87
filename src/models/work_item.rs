//! Outbound work queue.
//!
//! Follow-up effects (buyer refunds, notifications, operator alerts) are
//! decoupled from the transactional state change that produced them: the
//! producer enqueues a row and the outbox worker delivers it later,
//! at-least-once.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::work_items;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    RefundBuyer,
    NotifyBuyer,
    OperatorAlert,
}

impl WorkItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefundBuyer => "refund_buyer",
            Self::NotifyBuyer => "notify_buyer",
            Self::OperatorAlert => "operator_alert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refund_buyer" => Some(Self::RefundBuyer),
            "notify_buyer" => Some(Self::NotifyBuyer),
            "operator_alert" => Some(Self::OperatorAlert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = work_items)]
pub struct WorkItem {
    pub id: String,
    pub kind: String,
    pub escrow_id: Option<String>,
    pub payload_json: String,
    pub status: String,
    pub attempts: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = work_items)]
struct NewWorkItem<'a> {
    id: &'a str,
    kind: &'a str,
    escrow_id: Option<&'a str>,
    payload_json: &'a str,
    status: &'a str,
    attempts: i32,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl WorkItem {
    pub fn enqueue(
        conn: &mut SqliteConnection,
        kind: WorkItemKind,
        escrow_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().naive_utc();
        let payload_json = payload.to_string();
        diesel::insert_into(work_items::table)
            .values(&NewWorkItem {
                id: &id,
                kind: kind.as_str(),
                escrow_id,
                payload_json: &payload_json,
                status: "queued",
                attempts: 0,
                created_at: now,
                updated_at: now,
            })
            .execute(conn)
            .context("Failed to enqueue work item")?;
        Ok(id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, item_id: &str) -> Result<WorkItem> {
        work_items::table
            .filter(work_items::id.eq(item_id))
            .first(conn)
            .with_context(|| format!("Work item {item_id} not found"))
    }

    /// Oldest queued items first.
    pub fn claim_batch(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<WorkItem>> {
        work_items::table
            .filter(work_items::status.eq("queued"))
            .order(work_items::created_at.asc())
            .limit(limit)
            .load(conn)
            .context("Failed to load queued work items")
    }

    pub fn mark_done(conn: &mut SqliteConnection, item_id: &str) -> Result<()> {
        diesel::update(work_items::table.filter(work_items::id.eq(item_id)))
            .set((
                work_items::status.eq("done"),
                work_items::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to mark work item {item_id} done"))?;
        Ok(())
    }

    /// Bump the attempt counter; give up after `max_attempts`.
    pub fn record_failure(
        conn: &mut SqliteConnection,
        item_id: &str,
        max_attempts: i32,
    ) -> Result<()> {
        let item = Self::find_by_id(conn, item_id)?;
        let attempts = item.attempts + 1;
        let status = if attempts >= max_attempts { "failed" } else { "queued" };
        diesel::update(work_items::table.filter(work_items::id.eq(item_id)))
            .set((
                work_items::attempts.eq(attempts),
                work_items::status.eq(status),
                work_items::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to record failure for work item {item_id}"))?;
        Ok(())
    }
}
