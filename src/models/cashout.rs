//! Cashout (withdrawal) model and queries.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::cashouts;

/// Statuses that place a hold on funds. The duplicate-prevention window
/// considers exactly these: `otp_pending` holds funds while awaiting OTP
/// confirmation and must be included, while `failed`/`cancelled` hold
/// nothing and must not block a legitimate retry.
pub const HOLD_STATUSES: [&str; 3] = ["pending", "otp_pending", "admin_pending"];

/// Terminal statuses. Once reached, only the audited admin retry path
/// (status `success` with `backend_pending` still set) touches the row.
pub const TERMINAL_STATUSES: [&str; 3] = ["success", "failed", "cancelled"];

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = cashouts)]
pub struct Cashout {
    pub id: String,
    pub user_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub destination_json: String,
    pub backend_pending: bool,
    pub external_txid: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = cashouts)]
pub struct NewCashout {
    pub id: String,
    pub user_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub destination_json: String,
    pub backend_pending: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Default for NewCashout {
    fn default() -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: String::new(),
            user_id: String::new(),
            amount_minor: 0,
            currency: "NGN".to_string(),
            status: "pending".to_string(),
            destination_json: "{}".to_string(),
            backend_pending: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Cashout {
    pub fn create(conn: &mut SqliteConnection, new_cashout: NewCashout) -> Result<Cashout> {
        let cashout_id = new_cashout.id.clone();
        diesel::insert_into(cashouts::table)
            .values(&new_cashout)
            .execute(conn)
            .with_context(|| format!("Failed to insert cashout {cashout_id}"))?;
        Self::find_by_id(conn, &cashout_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, cashout_id: &str) -> Result<Cashout> {
        cashouts::table
            .filter(cashouts::id.eq(cashout_id))
            .first(conn)
            .with_context(|| format!("Cashout {cashout_id} not found"))
    }

    /// Duplicate-prevention window check: does this user have a cashout in
    /// a hold status created at or after `since`?
    pub fn has_recent_hold(
        conn: &mut SqliteConnection,
        user_id: &str,
        since: NaiveDateTime,
    ) -> Result<bool> {
        let count: i64 = cashouts::table
            .filter(cashouts::user_id.eq(user_id))
            .filter(cashouts::status.eq_any(HOLD_STATUSES))
            .filter(cashouts::created_at.ge(since))
            .count()
            .get_result(conn)
            .with_context(|| format!("Failed to count recent hold cashouts for user {user_id}"))?;
        Ok(count > 0)
    }

    /// Failure-cooldown check input.
    pub fn count_failed_since(
        conn: &mut SqliteConnection,
        user_id: &str,
        since: NaiveDateTime,
    ) -> Result<i64> {
        cashouts::table
            .filter(cashouts::user_id.eq(user_id))
            .filter(cashouts::status.eq("failed"))
            .filter(cashouts::updated_at.ge(since))
            .count()
            .get_result(conn)
            .with_context(|| format!("Failed to count failed cashouts for user {user_id}"))
    }

    /// Failed cashouts in the reconciliation look-back window.
    pub fn find_failed_since(
        conn: &mut SqliteConnection,
        since: NaiveDateTime,
    ) -> Result<Vec<Cashout>> {
        cashouts::table
            .filter(cashouts::status.eq("failed"))
            .filter(cashouts::updated_at.ge(since))
            .load(conn)
            .context("Failed to load failed cashouts")
    }

    /// The rail accepted the request: record its transaction id and flag
    /// the cashout as awaiting backend confirmation.
    pub fn mark_submitted(
        conn: &mut SqliteConnection,
        cashout_id: &str,
        external_txid: &str,
    ) -> Result<()> {
        diesel::update(cashouts::table.filter(cashouts::id.eq(cashout_id)))
            .set((
                cashouts::external_txid.eq(Some(external_txid)),
                cashouts::backend_pending.eq(true),
                cashouts::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to mark cashout {cashout_id} submitted"))?;
        Ok(())
    }

    /// Auto-approval after rail acceptance. `backend_pending` stays set
    /// until the rail confirms completion.
    pub fn mark_approved(conn: &mut SqliteConnection, cashout_id: &str) -> Result<()> {
        diesel::update(cashouts::table.filter(cashouts::id.eq(cashout_id)))
            .set((
                cashouts::status.eq("success"),
                cashouts::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to approve cashout {cashout_id}"))?;
        Ok(())
    }

    pub fn mark_failed(
        conn: &mut SqliteConnection,
        cashout_id: &str,
        reason: &str,
    ) -> Result<()> {
        diesel::update(cashouts::table.filter(cashouts::id.eq(cashout_id)))
            .set((
                cashouts::status.eq("failed"),
                cashouts::backend_pending.eq(false),
                cashouts::failure_reason.eq(Some(reason)),
                cashouts::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to mark cashout {cashout_id} failed"))?;
        Ok(())
    }

    /// Backend confirmed completion.
    pub fn clear_backend_pending(conn: &mut SqliteConnection, cashout_id: &str) -> Result<()> {
        diesel::update(cashouts::table.filter(cashouts::id.eq(cashout_id)))
            .set((
                cashouts::backend_pending.eq(false),
                cashouts::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to clear backend_pending for cashout {cashout_id}"))?;
        Ok(())
    }

    pub fn update_external_txid(
        conn: &mut SqliteConnection,
        cashout_id: &str,
        external_txid: &str,
    ) -> Result<()> {
        diesel::update(cashouts::table.filter(cashouts::id.eq(cashout_id)))
            .set((
                cashouts::external_txid.eq(Some(external_txid)),
                cashouts::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update external_txid for cashout {cashout_id}"))?;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATUSES.contains(&self.status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_conn;
    use chrono::Duration;

    fn seed(conn: &mut SqliteConnection, id: &str, user: &str, status: &str) -> Cashout {
        Cashout::create(
            conn,
            NewCashout {
                id: id.to_string(),
                user_id: user.to_string(),
                amount_minor: 2_500,
                status: status.to_string(),
                ..NewCashout::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn hold_window_counts_otp_pending_but_not_failed() {
        let mut conn = memory_conn();
        let since = chrono::Utc::now().naive_utc() - Duration::minutes(10);

        seed(&mut conn, "c1", "u1", "failed");
        seed(&mut conn, "c2", "u1", "cancelled");
        assert!(!Cashout::has_recent_hold(&mut conn, "u1", since).unwrap());

        seed(&mut conn, "c3", "u1", "otp_pending");
        assert!(Cashout::has_recent_hold(&mut conn, "u1", since).unwrap());
    }

    #[test]
    fn failure_count_is_scoped_per_user() {
        let mut conn = memory_conn();
        let since = chrono::Utc::now().naive_utc() - Duration::hours(1);

        seed(&mut conn, "c1", "u1", "failed");
        seed(&mut conn, "c2", "u1", "failed");
        seed(&mut conn, "c3", "u2", "failed");

        assert_eq!(Cashout::count_failed_since(&mut conn, "u1", since).unwrap(), 2);
        assert_eq!(Cashout::count_failed_since(&mut conn, "u2", since).unwrap(), 1);
    }

    #[test]
    fn submitted_then_approved_keeps_backend_pending() {
        let mut conn = memory_conn();
        seed(&mut conn, "c1", "u1", "pending");

        Cashout::mark_submitted(&mut conn, "c1", "rail-tx-9").unwrap();
        Cashout::mark_approved(&mut conn, "c1").unwrap();

        let cashout = Cashout::find_by_id(&mut conn, "c1").unwrap();
        assert_eq!(cashout.status, "success");
        assert!(cashout.backend_pending);
        assert!(cashout.is_terminal());
        assert_eq!(cashout.external_txid.as_deref(), Some("rail-tx-9"));

        // Backend confirmation releases the pending flag, status unchanged.
        Cashout::clear_backend_pending(&mut conn, "c1").unwrap();
        let cashout = Cashout::find_by_id(&mut conn, "c1").unwrap();
        assert_eq!(cashout.status, "success");
        assert!(!cashout.backend_pending);
    }
}
