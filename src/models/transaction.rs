//! Transaction ledger: the source of truth for replay detection.
//!
//! Exactly one row may exist per `(escrow_id, external_id)` pair, enforced
//! by a unique index. A webhook retry whose pair already has a row is a
//! duplicate and must not reapply the payment.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::transactions;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = transactions)]
pub struct Transaction {
    pub id: String,
    pub escrow_id: Option<String>,
    pub external_id: String,
    pub user_id: String,
    pub kind: String,
    pub amount_minor: i64,
    pub currency: String,
    pub usd_rate: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = transactions)]
pub struct NewTransaction {
    pub id: String,
    pub escrow_id: Option<String>,
    pub external_id: String,
    pub user_id: String,
    pub kind: String,
    pub amount_minor: i64,
    pub currency: String,
    pub usd_rate: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Default for NewTransaction {
    fn default() -> Self {
        Self {
            id: String::new(),
            escrow_id: None,
            external_id: String::new(),
            user_id: String::new(),
            kind: "credit".to_string(),
            amount_minor: 0,
            currency: "NGN".to_string(),
            usd_rate: None,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

impl Transaction {
    pub fn create(conn: &mut SqliteConnection, new_tx: NewTransaction) -> Result<Transaction> {
        let tx_id = new_tx.id.clone();
        diesel::insert_into(transactions::table)
            .values(&new_tx)
            .execute(conn)
            .with_context(|| format!("Failed to insert transaction {tx_id}"))?;
        transactions::table
            .filter(transactions::id.eq(&tx_id))
            .first(conn)
            .with_context(|| format!("Transaction {tx_id} not found after insert"))
    }

    /// The replay-detection lookup.
    pub fn find_by_escrow_external(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        external_id: &str,
    ) -> Result<Option<Transaction>> {
        transactions::table
            .filter(transactions::escrow_id.eq(Some(escrow_id)))
            .filter(transactions::external_id.eq(external_id))
            .first(conn)
            .optional()
            .context("Failed to query transaction ledger")
    }

    /// Cumulative credited amount for an escrow, for partial-payment
    /// detection.
    pub fn total_credited(conn: &mut SqliteConnection, escrow_id: &str) -> Result<i64> {
        let total: Option<i64> = transactions::table
            .filter(transactions::escrow_id.eq(Some(escrow_id)))
            .filter(transactions::kind.eq("credit"))
            .select(diesel::dsl::sql::<diesel::sql_types::Nullable<diesel::sql_types::BigInt>>(
                "SUM(amount_minor)",
            ))
            .get_result(conn)
            .with_context(|| format!("Failed to sum credits for escrow {escrow_id}"))?;
        Ok(total.unwrap_or(0))
    }

    /// Debits in the duplicate-scan window, ordered so same-user
    /// same-amount rows are adjacent.
    pub fn find_recent_debits(
        conn: &mut SqliteConnection,
        since: NaiveDateTime,
    ) -> Result<Vec<Transaction>> {
        transactions::table
            .filter(transactions::kind.eq("debit"))
            .filter(transactions::created_at.ge(since))
            .order((
                transactions::user_id.asc(),
                transactions::amount_minor.asc(),
                transactions::created_at.asc(),
            ))
            .load(conn)
            .context("Failed to load recent debit transactions")
    }

    /// Debits matching a failed cashout's user and amount in the window.
    pub fn count_matching_debits(
        conn: &mut SqliteConnection,
        user_id: &str,
        amount_minor: i64,
        since: NaiveDateTime,
    ) -> Result<i64> {
        transactions::table
            .filter(transactions::kind.eq("debit"))
            .filter(transactions::user_id.eq(user_id))
            .filter(transactions::amount_minor.eq(amount_minor))
            .filter(transactions::created_at.ge(since))
            .count()
            .get_result(conn)
            .context("Failed to count matching debits")
    }
}
