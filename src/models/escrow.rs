//! Escrow model and queries.
//!
//! Escrows are append-only from an audit standpoint: rows are never
//! deleted, and `payment_confirmed_at` is written at most once. All status
//! writes go through `services::escrow_state`, which validates the
//! transition inside the same database transaction.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::escrows;

/// Statuses before the trade goes ACTIVE. Escrows stuck past their
/// deadline in one of these are the expiry processor's phase-1 input.
pub const PRE_ACTIVE_STATUSES: [&str; 3] =
    ["payment_pending", "partial_payment", "payment_confirmed"];

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = escrows)]
pub struct Escrow {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub fee_minor: i64,
    pub status: String,
    pub payment_confirmed_at: Option<NaiveDateTime>,
    pub expires_at: Option<NaiveDateTime>,
    pub processed_for_refund: bool,
    pub notified_buyers: bool,
    pub cancel_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = escrows)]
pub struct NewEscrow {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub fee_minor: i64,
    pub status: String,
    pub payment_confirmed_at: Option<NaiveDateTime>,
    pub expires_at: Option<NaiveDateTime>,
    pub processed_for_refund: bool,
    pub notified_buyers: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Default for NewEscrow {
    fn default() -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: String::new(),
            buyer_id: String::new(),
            seller_id: String::new(),
            amount_minor: 0,
            currency: "NGN".to_string(),
            fee_minor: 0,
            status: "payment_pending".to_string(),
            payment_confirmed_at: None,
            expires_at: None,
            processed_for_refund: false,
            notified_buyers: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Escrow {
    pub fn create(conn: &mut SqliteConnection, new_escrow: NewEscrow) -> Result<Escrow> {
        let escrow_id = new_escrow.id.clone();
        diesel::insert_into(escrows::table)
            .values(&new_escrow)
            .execute(conn)
            .with_context(|| format!("Failed to insert escrow {escrow_id}"))?;
        Self::find_by_id(conn, &escrow_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, escrow_id: &str) -> Result<Escrow> {
        escrows::table
            .filter(escrows::id.eq(escrow_id))
            .first(conn)
            .with_context(|| format!("Escrow {escrow_id} not found"))
    }

    pub fn find_by_id_optional(
        conn: &mut SqliteConnection,
        escrow_id: &str,
    ) -> Result<Option<Escrow>> {
        escrows::table
            .filter(escrows::id.eq(escrow_id))
            .first(conn)
            .optional()
            .with_context(|| format!("Failed to query escrow {escrow_id}"))
    }

    /// Phase-1 input: past deadline, still pre-ACTIVE.
    pub fn find_expired_pre_active(
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<Escrow>> {
        escrows::table
            .filter(escrows::expires_at.is_not_null())
            .filter(escrows::expires_at.lt(now))
            .filter(escrows::status.eq_any(PRE_ACTIVE_STATUSES))
            .order(escrows::expires_at.asc())
            .limit(limit)
            .load(conn)
            .context("Failed to load expired pre-active escrows")
    }

    /// Phase-2 input: already EXPIRED but a follow-up was never enqueued.
    pub fn find_expired_needing_followups(
        conn: &mut SqliteConnection,
        limit: i64,
    ) -> Result<Vec<Escrow>> {
        escrows::table
            .filter(escrows::status.eq("expired"))
            .filter(
                escrows::processed_for_refund
                    .eq(false)
                    .or(escrows::notified_buyers.eq(false)),
            )
            .order(escrows::updated_at.asc())
            .limit(limit)
            .load(conn)
            .context("Failed to load expired escrows with unfinished follow-ups")
    }

    /// Raw status write. Only `services::escrow_state` calls this, after
    /// validating the transition inside the surrounding transaction.
    pub(crate) fn write_status(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        new_status: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        diesel::update(escrows::table.filter(escrows::id.eq(escrow_id)))
            .set((
                escrows::status.eq(new_status),
                escrows::cancel_reason.eq(reason),
                escrows::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update status for escrow {escrow_id}"))?;
        Ok(())
    }

    /// Set `payment_confirmed_at` if and only if it is still null. Returns
    /// whether this call performed the write; a false result means the
    /// timestamp was already set and remains untouched.
    pub fn confirm_payment_at(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        at: NaiveDateTime,
    ) -> Result<bool> {
        let updated = diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::payment_confirmed_at.is_null()),
        )
        .set((
            escrows::payment_confirmed_at.eq(Some(at)),
            escrows::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(conn)
        .with_context(|| format!("Failed to confirm payment for escrow {escrow_id}"))?;
        Ok(updated > 0)
    }

    pub fn mark_refund_enqueued(conn: &mut SqliteConnection, escrow_id: &str) -> Result<()> {
        diesel::update(escrows::table.filter(escrows::id.eq(escrow_id)))
            .set((
                escrows::processed_for_refund.eq(true),
                escrows::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to set processed_for_refund for escrow {escrow_id}"))?;
        Ok(())
    }

    pub fn mark_buyers_notified(conn: &mut SqliteConnection, escrow_id: &str) -> Result<()> {
        diesel::update(escrows::table.filter(escrows::id.eq(escrow_id)))
            .set((
                escrows::notified_buyers.eq(true),
                escrows::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to set notified_buyers for escrow {escrow_id}"))?;
        Ok(())
    }

    pub fn is_past_deadline(&self, now: NaiveDateTime) -> bool {
        self.expires_at.map(|deadline| deadline < now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_conn;
    use chrono::Duration;

    fn seed(conn: &mut SqliteConnection, id: &str, status: &str, expired: bool) -> Escrow {
        let now = chrono::Utc::now().naive_utc();
        let expires = if expired { now - Duration::hours(1) } else { now + Duration::hours(1) };
        Escrow::create(
            conn,
            NewEscrow {
                id: id.to_string(),
                buyer_id: "buyer".to_string(),
                seller_id: "seller".to_string(),
                amount_minor: 10_000,
                status: status.to_string(),
                expires_at: Some(expires),
                ..NewEscrow::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn expired_pre_active_query_ignores_active_and_future() {
        let mut conn = memory_conn();
        seed(&mut conn, "e1", "payment_pending", true);
        seed(&mut conn, "e2", "active", true);
        seed(&mut conn, "e3", "payment_pending", false);
        seed(&mut conn, "e4", "partial_payment", true);

        let now = chrono::Utc::now().naive_utc();
        let found = Escrow::find_expired_pre_active(&mut conn, now, 50).unwrap();
        let ids: Vec<&str> = found.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e4"]);
        assert!(found.iter().all(|e| e.is_past_deadline(now)));
    }

    #[test]
    fn payment_confirmed_at_is_write_once() {
        let mut conn = memory_conn();
        seed(&mut conn, "e1", "payment_pending", false);

        let first = chrono::Utc::now().naive_utc();
        assert!(Escrow::confirm_payment_at(&mut conn, "e1", first).unwrap());
        let later = first + Duration::hours(2);
        assert!(!Escrow::confirm_payment_at(&mut conn, "e1", later).unwrap());

        let escrow = Escrow::find_by_id(&mut conn, "e1").unwrap();
        assert_eq!(escrow.payment_confirmed_at, Some(first));
    }

    #[test]
    fn followup_query_only_returns_unfinished_expired() {
        let mut conn = memory_conn();
        seed(&mut conn, "e1", "expired", true);
        seed(&mut conn, "e2", "expired", true);
        Escrow::mark_refund_enqueued(&mut conn, "e2").unwrap();
        Escrow::mark_buyers_notified(&mut conn, "e2").unwrap();
        seed(&mut conn, "e3", "cancelled", true);

        let found = Escrow::find_expired_needing_followups(&mut conn, 50).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "e1");
    }
}
