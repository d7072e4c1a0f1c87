//! Admin-initiated cashout retry.
//!
//! For the narrow case where the rail accepted a cashout but the backend
//! lost it: the row is `success` with `backend_pending` still set. Any
//! other state is refused without touching the rail, and the idempotency
//! guard caps a valid retry at exactly one rail call even if the admin
//! double-clicks.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::db::DbPool;
use crate::models::cashout::Cashout;
use crate::models::destination::Destination;
use crate::rails::{PaymentRail, RailOutcome};
use crate::services::idempotency_guard::{self, Admission};

const GUARD_SCOPE: &str = "cashout_retry";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Rail accepted the resubmission; the new transaction id is recorded.
    Completed { external_txid: String },
    /// The cashout already reached the backend; nothing to resubmit.
    AlreadyCompleted,
    /// Retry refused: wrong state, duplicate request, or rail decline.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    AlreadyCompleted,
    NotRetryable(String),
}

/// Pure eligibility check, applied before any side effect.
pub fn eligibility(cashout: &Cashout) -> Eligibility {
    if !cashout.is_terminal() {
        return Eligibility::NotRetryable(format!(
            "cashout still in flight (status '{}')",
            cashout.status
        ));
    }
    match (cashout.status.as_str(), cashout.backend_pending) {
        ("success", true) => Eligibility::Eligible,
        ("success", false) => Eligibility::AlreadyCompleted,
        (status, _) => {
            Eligibility::NotRetryable(format!("cashout in status '{status}' is not retryable"))
        }
    }
}

pub async fn retry(
    db: &DbPool,
    rail: Arc<dyn PaymentRail>,
    cashout_id: &str,
) -> Result<RetryOutcome> {
    let pool = db.clone();
    let id = cashout_id.to_string();
    let cashout = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().context("Failed to get DB connection")?;
        Cashout::find_by_id(&mut conn, &id)
    })
    .await
    .context("Task join error")??;

    match eligibility(&cashout) {
        Eligibility::Eligible => {}
        Eligibility::AlreadyCompleted => {
            info!(cashout_id = %cashout_id, "cashout already confirmed by backend, nothing to retry");
            return Ok(RetryOutcome::AlreadyCompleted);
        }
        Eligibility::NotRetryable(reason) => {
            info!(cashout_id = %cashout_id, reason = %reason, "cashout retry refused before rail call");
            return Ok(RetryOutcome::Rejected(reason));
        }
    }

    let destination: Destination = serde_json::from_str(&cashout.destination_json)
        .with_context(|| format!("Cashout {cashout_id} has malformed destination"))?;

    let key = idempotency_guard::cashout_key(
        &cashout.user_id,
        cashout.amount_minor,
        &cashout.currency,
        &format!("{}:retry", cashout.id),
    );
    let pool = db.clone();
    let admit_key = key.clone();
    let admission = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().context("Failed to get DB connection")?;
        idempotency_guard::admit(&mut conn, &admit_key, GUARD_SCOPE, idempotency_guard::default_ttl())
    })
    .await
    .context("Task join error")??;
    match admission {
        Admission::Admitted => {}
        Admission::AlreadyCompleted(_) => return Ok(RetryOutcome::AlreadyCompleted),
        Admission::Rejected(_) => {
            return Ok(RetryOutcome::Rejected("retry already in flight".to_string()))
        }
    }

    let outcome = rail
        .submit_withdrawal(&cashout.currency, cashout.amount_minor, &destination)
        .await;

    let pool = db.clone();
    let id = cashout.id.clone();
    match outcome {
        Ok(RailOutcome::Accepted { external_txid }) => {
            let txid = external_txid.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut conn = pool.get().context("Failed to get DB connection")?;
                Cashout::update_external_txid(&mut conn, &id, &txid)?;
                idempotency_guard::complete(&mut conn, &key, GUARD_SCOPE, Some(&txid))?;
                Ok(())
            })
            .await
            .context("Task join error")??;
            info!(cashout_id = %cashout_id, txid = %external_txid, "cashout retry accepted by rail");
            Ok(RetryOutcome::Completed { external_txid })
        }
        Ok(RailOutcome::Declined { reason }) => {
            tokio::task::spawn_blocking(move || {
                let mut conn = pool.get().context("Failed to get DB connection")?;
                idempotency_guard::fail(&mut conn, &key, GUARD_SCOPE)
            })
            .await
            .context("Task join error")??;
            warn!(cashout_id = %cashout_id, reason = %reason, "cashout retry declined by rail");
            Ok(RetryOutcome::Rejected(reason))
        }
        Err(e) => {
            tokio::task::spawn_blocking(move || {
                let mut conn = pool.get().context("Failed to get DB connection")?;
                idempotency_guard::fail(&mut conn, &key, GUARD_SCOPE)
            })
            .await
            .context("Task join error")??;
            Err(e).with_context(|| format!("Rail call failed for cashout retry {cashout_id}"))
        }
    }
}
