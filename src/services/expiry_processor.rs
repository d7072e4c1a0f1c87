//! Escrow expiry processor.
//!
//! Two phases per run. Phase 1 sweeps past-deadline pre-ACTIVE escrows and
//! applies the cancel-or-expire branch. Phase 2 catches EXPIRED escrows
//! whose follow-ups were never enqueued, which happens when a previous run
//! crashed between the status write and the enqueue. Both phases are safe
//! to re-run: the `processed_for_refund` and `notified_buyers` flags are
//! flipped in the same transaction as the enqueue, so a crash can only
//! leave work undone, never done twice.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::Connection;
use tokio::time::interval;
use tracing::{error, info};

use crate::config::MonitorConfig;
use crate::db::DbPool;
use crate::models::escrow::Escrow;
use crate::models::work_item::{WorkItem, WorkItemKind};
use crate::services::escrow_state::{self, ExpiryOutcome};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExpirySummary {
    pub cancelled: usize,
    pub expired: usize,
    pub followups_enqueued: usize,
    pub errors: usize,
}

pub struct ExpiryProcessor {
    db: DbPool,
    config: MonitorConfig,
}

impl ExpiryProcessor {
    pub fn new(db: DbPool, config: MonitorConfig) -> Self {
        info!(
            "ExpiryProcessor initialized with poll_interval={}s batch_size={}",
            config.expiry_poll_secs, config.batch_size
        );
        Self { db, config }
    }

    pub async fn start_monitoring(self: Arc<Self>) {
        let mut poll_timer = interval(self.config.expiry_poll_interval());
        info!("Starting escrow expiry monitoring loop");
        loop {
            poll_timer.tick().await;
            match self.run_once().await {
                Ok(summary) => {
                    if summary != ExpirySummary::default() {
                        info!(
                            cancelled = summary.cancelled,
                            expired = summary.expired,
                            followups = summary.followups_enqueued,
                            errors = summary.errors,
                            "expiry sweep finished"
                        );
                    }
                }
                Err(e) => error!("Expiry sweep failed: {e:#}"),
            }
        }
    }

    pub async fn run_once(&self) -> Result<ExpirySummary> {
        let db = self.db.clone();
        let batch_size = self.config.batch_size;
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get().context("Failed to get DB connection")?;
            let now = chrono::Utc::now().naive_utc();
            run_phases(&mut conn, batch_size, now)
        })
        .await
        .context("Task join error")?
    }
}

/// One full sweep at a fixed `now`. Split out from the monitor so the
/// batch logic is testable on a plain connection.
pub fn run_phases(
    conn: &mut SqliteConnection,
    batch_size: i64,
    now: NaiveDateTime,
) -> Result<ExpirySummary> {
    let mut summary = ExpirySummary::default();

    // Phase 1: past-deadline pre-ACTIVE escrows.
    for escrow in Escrow::find_expired_pre_active(conn, now, batch_size)? {
        if let Err(e) = process_expired(conn, &escrow, &mut summary) {
            error!(escrow_id = %escrow.id, "expiry processing failed: {e:#}");
            summary.errors += 1;
        }
    }

    // Phase 2: EXPIRED escrows a previous run left without follow-ups.
    for escrow in Escrow::find_expired_needing_followups(conn, batch_size)? {
        match enqueue_followups(conn, &escrow) {
            Ok(enqueued) => summary.followups_enqueued += enqueued,
            Err(e) => {
                error!(escrow_id = %escrow.id, "follow-up enqueue failed: {e:#}");
                summary.errors += 1;
            }
        }
    }

    Ok(summary)
}

fn process_expired(
    conn: &mut SqliteConnection,
    escrow: &Escrow,
    summary: &mut ExpirySummary,
) -> Result<()> {
    let outcome = escrow_state::expiry_outcome(escrow);
    let updated =
        escrow_state::transition(conn, &escrow.id, outcome.target(), Some(outcome.reason()))?;

    match outcome {
        ExpiryOutcome::CancelPaymentTimeout => {
            // Nothing was paid in, so nothing is owed back.
            summary.cancelled += 1;
        }
        ExpiryOutcome::ExpireDeliveryTimeout => {
            summary.expired += 1;
            summary.followups_enqueued += enqueue_followups(conn, &updated)?;
        }
    }
    Ok(())
}

/// Enqueue whichever follow-ups this EXPIRED escrow still lacks. The flag
/// flip and the enqueue share one transaction so the pair is all-or-nothing.
fn enqueue_followups(conn: &mut SqliteConnection, escrow: &Escrow) -> Result<usize> {
    conn.transaction::<usize, anyhow::Error, _>(|conn| {
        let mut enqueued = 0;

        if !escrow.processed_for_refund {
            WorkItem::enqueue(
                conn,
                WorkItemKind::RefundBuyer,
                Some(&escrow.id),
                &serde_json::json!({
                    "escrow_id": escrow.id,
                    "user_id": escrow.buyer_id,
                    "amount_minor": escrow.amount_minor,
                    "currency": escrow.currency,
                    "source": "escrow_expiry",
                }),
            )?;
            Escrow::mark_refund_enqueued(conn, &escrow.id)?;
            enqueued += 1;
        }

        if !escrow.notified_buyers {
            WorkItem::enqueue(
                conn,
                WorkItemKind::NotifyBuyer,
                Some(&escrow.id),
                &serde_json::json!({
                    "escrow_id": escrow.id,
                    "user_id": escrow.buyer_id,
                    "event": "escrow_expired",
                }),
            )?;
            Escrow::mark_buyers_notified(conn, &escrow.id)?;
            enqueued += 1;
        }

        Ok(enqueued)
    })
    .with_context(|| format!("Failed to enqueue follow-ups for escrow {}", escrow.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_conn;
    use crate::models::escrow::NewEscrow;
    use chrono::Duration;

    fn seed_expired(
        conn: &mut SqliteConnection,
        id: &str,
        status: &str,
        paid: bool,
    ) -> Escrow {
        let now = chrono::Utc::now().naive_utc();
        Escrow::create(
            conn,
            NewEscrow {
                id: id.to_string(),
                buyer_id: "buyer".to_string(),
                seller_id: "seller".to_string(),
                amount_minor: 10_000,
                status: status.to_string(),
                payment_confirmed_at: paid.then(|| now - Duration::hours(3)),
                expires_at: Some(now - Duration::hours(1)),
                ..NewEscrow::default()
            },
        )
        .unwrap()
    }

    fn items_for(conn: &mut SqliteConnection, escrow_id: &str) -> Vec<WorkItem> {
        use crate::schema::work_items::dsl::{kind, work_items};
        work_items
            .filter(crate::schema::work_items::escrow_id.eq(Some(escrow_id)))
            .order(kind.asc())
            .load(conn)
            .unwrap()
    }

    #[test]
    fn unpaid_deadline_cancels_without_followups() {
        let mut conn = memory_conn();
        seed_expired(&mut conn, "e1", "payment_pending", false);

        let now = chrono::Utc::now().naive_utc();
        let summary = run_phases(&mut conn, 50, now).unwrap();
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.expired, 0);
        assert_eq!(summary.followups_enqueued, 0);

        let escrow = Escrow::find_by_id(&mut conn, "e1").unwrap();
        assert_eq!(escrow.status, "cancelled");
        assert_eq!(escrow.cancel_reason.as_deref(), Some("payment_timeout"));
        assert!(!escrow.processed_for_refund);
        assert!(items_for(&mut conn, "e1").is_empty());
    }

    #[test]
    fn paid_deadline_expires_and_enqueues_both_followups() {
        let mut conn = memory_conn();
        seed_expired(&mut conn, "e1", "payment_confirmed", true);

        let now = chrono::Utc::now().naive_utc();
        let summary = run_phases(&mut conn, 50, now).unwrap();
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.followups_enqueued, 2);

        let escrow = Escrow::find_by_id(&mut conn, "e1").unwrap();
        assert_eq!(escrow.status, "expired");
        assert_eq!(escrow.cancel_reason.as_deref(), Some("delivery_timeout"));
        assert!(escrow.processed_for_refund);
        assert!(escrow.notified_buyers);

        let items = items_for(&mut conn, "e1");
        let kinds: Vec<&str> = items.iter().map(|i| i.kind.as_str()).collect();
        assert_eq!(kinds, vec!["notify_buyer", "refund_buyer"]);
    }

    #[test]
    fn rerun_enqueues_nothing_new() {
        let mut conn = memory_conn();
        seed_expired(&mut conn, "e1", "payment_confirmed", true);

        let now = chrono::Utc::now().naive_utc();
        run_phases(&mut conn, 50, now).unwrap();
        let summary = run_phases(&mut conn, 50, now).unwrap();
        assert_eq!(summary, ExpirySummary::default());
        assert_eq!(items_for(&mut conn, "e1").len(), 2);
    }

    #[test]
    fn phase_two_backfills_missing_followups_only() {
        let mut conn = memory_conn();
        // Simulates a crash after the status write: EXPIRED, refund already
        // enqueued, notification missing.
        seed_expired(&mut conn, "e1", "expired", true);
        Escrow::mark_refund_enqueued(&mut conn, "e1").unwrap();

        let now = chrono::Utc::now().naive_utc();
        let summary = run_phases(&mut conn, 50, now).unwrap();
        assert_eq!(summary.followups_enqueued, 1);

        let items = items_for(&mut conn, "e1");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "notify_buyer");
        assert!(Escrow::find_by_id(&mut conn, "e1").unwrap().notified_buyers);
    }

    #[test]
    fn batch_size_bounds_one_run() {
        let mut conn = memory_conn();
        seed_expired(&mut conn, "e1", "payment_pending", false);
        seed_expired(&mut conn, "e2", "payment_pending", false);
        seed_expired(&mut conn, "e3", "payment_pending", false);

        let now = chrono::Utc::now().naive_utc();
        let summary = run_phases(&mut conn, 2, now).unwrap();
        assert_eq!(summary.cancelled, 2);

        // The remainder is picked up next run.
        let summary = run_phases(&mut conn, 2, now).unwrap();
        assert_eq!(summary.cancelled, 1);
    }
}
