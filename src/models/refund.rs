//! Refund model: a compensating credit back to a user.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::refunds;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = refunds)]
pub struct Refund {
    pub id: String,
    pub escrow_id: Option<String>,
    pub user_id: String,
    pub source: String,
    pub amount_minor: i64,
    pub status: String,
    pub fingerprint: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = refunds)]
pub struct NewRefund {
    pub id: String,
    pub escrow_id: Option<String>,
    pub user_id: String,
    pub source: String,
    pub amount_minor: i64,
    pub status: String,
    pub fingerprint: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Default for NewRefund {
    fn default() -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: String::new(),
            escrow_id: None,
            user_id: String::new(),
            source: "escrow_expiry".to_string(),
            amount_minor: 0,
            status: "pending".to_string(),
            fingerprint: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Refund {
    pub fn create(conn: &mut SqliteConnection, new_refund: NewRefund) -> Result<Refund> {
        let refund_id = new_refund.id.clone();
        diesel::insert_into(refunds::table)
            .values(&new_refund)
            .execute(conn)
            .with_context(|| format!("Failed to insert refund {refund_id}"))?;
        Self::find_by_id(conn, &refund_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, refund_id: &str) -> Result<Refund> {
        refunds::table
            .filter(refunds::id.eq(refund_id))
            .first(conn)
            .with_context(|| format!("Refund {refund_id} not found"))
    }

    /// Replay lookup by idempotency fingerprint.
    pub fn find_by_fingerprint(
        conn: &mut SqliteConnection,
        fingerprint: &str,
    ) -> Result<Option<Refund>> {
        refunds::table
            .filter(refunds::fingerprint.eq(fingerprint))
            .first(conn)
            .optional()
            .context("Failed to query refund by fingerprint")
    }

    /// Raw status write. Only `services::refund_state` calls this, after
    /// validating the transition.
    pub(crate) fn write_status(
        conn: &mut SqliteConnection,
        refund_id: &str,
        new_status: &str,
    ) -> Result<()> {
        diesel::update(refunds::table.filter(refunds::id.eq(refund_id)))
            .set((
                refunds::status.eq(new_status),
                refunds::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update status for refund {refund_id}"))?;
        Ok(())
    }
}
