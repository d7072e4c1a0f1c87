//! Webhook reconciler.
//!
//! Applies inbound payment-provider events to escrows. The transaction
//! ledger is the source of truth for replay detection: one row per
//! `(escrow_id, external_id)` pair, and the ledger insert shares a database
//! transaction with the event completion, so an event is either fully
//! applied or fully untouched.
//!
//! A rate outage is a first-class outcome. The event stays `processing`
//! and is retried on the next pass; it is never marked failed because of a
//! rate that will come back.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use diesel::prelude::*;
use diesel::Connection;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::db::DbPool;
use crate::models::cashout::Cashout;
use crate::models::escrow::Escrow;
use crate::models::idempotency::IdempotencyKey;
use crate::models::transaction::{NewTransaction, Transaction};
use crate::models::webhook_event::WebhookEvent;
use crate::models::work_item::{WorkItem, WorkItemKind};
use crate::rails::{RateQuote, RateService};
use crate::services::escrow_state::{self, EscrowStatus};
use crate::services::idempotency_guard::{self, Admission};

const GUARD_SCOPE: &str = "payment_webhook";
const ALERT_SCOPE: &str = "duplicate_alert";

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Payment applied: ledger row inserted, escrow advanced.
    Applied,
    /// Ledger already has this `(escrow_id, external_id)` pair.
    AlreadyProcessed,
    /// Another worker holds this event's idempotency key right now.
    DuplicateInFlight,
    /// No rate quote; the event stays retryable.
    RateUnavailable,
    /// The event cannot ever apply (unknown escrow, terminal escrow).
    Rejected(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DuplicateScanSummary {
    pub debit_pair_alerts: usize,
    pub failed_cashout_alerts: usize,
}

pub struct WebhookReconciler {
    db: DbPool,
    rates: Arc<dyn RateService>,
    config: MonitorConfig,
}

impl WebhookReconciler {
    pub fn new(db: DbPool, rates: Arc<dyn RateService>, config: MonitorConfig) -> Self {
        info!(
            "WebhookReconciler initialized with poll_interval={}s",
            config.reconcile_poll_secs
        );
        Self { db, rates, config }
    }

    pub async fn start_monitoring(self: Arc<Self>) {
        let mut poll_timer = interval(self.config.reconcile_poll_interval());
        info!("Starting webhook reconciliation loop");
        loop {
            poll_timer.tick().await;
            if let Err(e) = self.process_pending().await {
                error!("Webhook reconciliation pass failed: {e:#}");
            }
            if let Err(e) = self.run_duplicate_scan().await {
                error!("Duplicate scan failed: {e:#}");
            }
            if let Err(e) = self.purge_expired_keys().await {
                error!("Idempotency purge failed: {e:#}");
            }
        }
    }

    /// Housekeeping: drop idempotency records past the TTL so the table
    /// does not grow without bound.
    async fn purge_expired_keys(&self) -> Result<()> {
        let db = self.db.clone();
        let ttl_secs = self.config.idempotency_ttl_secs;
        let purged = tokio::task::spawn_blocking(move || {
            let mut conn = db.get().context("Failed to get DB connection")?;
            let cutoff = chrono::Utc::now().naive_utc() - Duration::seconds(ttl_secs);
            IdempotencyKey::purge_older_than(&mut conn, cutoff)
        })
        .await
        .context("Task join error")??;
        if purged > 0 {
            info!(purged, "expired idempotency keys purged");
        }
        Ok(())
    }

    /// Drain pending events, oldest first. Per-event failures are logged
    /// and the pass continues.
    pub async fn process_pending(&self) -> Result<usize> {
        let db = self.db.clone();
        let batch_size = self.config.batch_size;
        let events = tokio::task::spawn_blocking(move || {
            let mut conn = db.get().context("Failed to get DB connection")?;
            WebhookEvent::find_processing(&mut conn, batch_size)
        })
        .await
        .context("Task join error")??;

        let mut applied = 0;
        for event in events {
            let event_id = event.id.clone();
            match self.process_event(event).await {
                Ok(EventOutcome::Applied) => applied += 1,
                Ok(outcome) => {
                    info!(event_id = %event_id, ?outcome, "webhook event not applied");
                }
                Err(e) => error!(event_id = %event_id, "webhook event failed: {e:#}"),
            }
        }
        Ok(applied)
    }

    /// Fetch the rate up front (the only async dependency), then apply the
    /// event on a blocking connection.
    pub async fn process_event(&self, event: WebhookEvent) -> Result<EventOutcome> {
        let quote = self
            .rates
            .get_rate(&event.currency)
            .await
            .unwrap_or(RateQuote::Unavailable);

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get().context("Failed to get DB connection")?;
            apply_event(&mut conn, &event, &quote)
        })
        .await
        .context("Task join error")?
    }

    pub async fn run_duplicate_scan(&self) -> Result<DuplicateScanSummary> {
        let db = self.db.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get().context("Failed to get DB connection")?;
            let now = chrono::Utc::now().naive_utc();
            scan_for_duplicates(&mut conn, &config, now)
        })
        .await
        .context("Task join error")?
    }
}

/// Apply one event against a prefetched rate quote.
pub fn apply_event(
    conn: &mut SqliteConnection,
    event: &WebhookEvent,
    quote: &RateQuote,
) -> Result<EventOutcome> {
    let key =
        idempotency_guard::payment_webhook_key(&event.provider, "payment.confirmed", &event.external_txid);

    match idempotency_guard::admit(conn, &key, GUARD_SCOPE, idempotency_guard::default_ttl())? {
        Admission::Rejected(_) => return Ok(EventOutcome::DuplicateInFlight),
        Admission::AlreadyCompleted(_) => {
            WebhookEvent::mark_completed(conn, &event.id)?;
            return Ok(EventOutcome::AlreadyProcessed);
        }
        Admission::Admitted => {}
    }

    // Rate check before any writes: an outage must leave the event exactly
    // as it was found.
    let rate = match quote {
        RateQuote::Available(rate) => *rate,
        RateQuote::Unavailable => {
            idempotency_guard::fail(conn, &key, GUARD_SCOPE)?;
            warn!(event_id = %event.id, "rate unavailable, leaving event retryable");
            return Ok(EventOutcome::RateUnavailable);
        }
    };

    let outcome = conn.transaction::<EventOutcome, anyhow::Error, _>(|conn| {
        // Ledger first: a replay must not touch the escrow.
        if Transaction::find_by_escrow_external(conn, &event.escrow_id, &event.external_txid)?
            .is_some()
        {
            WebhookEvent::mark_completed(conn, &event.id)?;
            return Ok(EventOutcome::AlreadyProcessed);
        }

        let escrow = match Escrow::find_by_id_optional(conn, &event.escrow_id)? {
            Some(escrow) => escrow,
            None => {
                WebhookEvent::mark_failed(conn, &event.id)?;
                return Ok(EventOutcome::Rejected(format!(
                    "unknown escrow {}",
                    event.escrow_id
                )));
            }
        };
        let status = EscrowStatus::parse(&escrow.status);
        if !matches!(status, Some(s) if s.is_pre_active()) {
            WebhookEvent::mark_failed(conn, &event.id)?;
            return Ok(EventOutcome::Rejected(format!(
                "escrow {} not accepting payments in status {}",
                escrow.id, escrow.status
            )));
        }

        Transaction::create(
            conn,
            NewTransaction {
                id: Uuid::new_v4().to_string(),
                escrow_id: Some(event.escrow_id.clone()),
                external_id: event.external_txid.clone(),
                user_id: escrow.buyer_id.clone(),
                kind: "credit".to_string(),
                amount_minor: event.amount_minor,
                currency: event.currency.clone(),
                usd_rate: Some(rate.to_string()),
                ..NewTransaction::default()
            },
        )?;

        let total = Transaction::total_credited(conn, &escrow.id)?;
        if total >= escrow.amount_minor {
            escrow_state::confirm_payment(conn, &escrow.id, event.created_at)?;
        } else if status == Some(EscrowStatus::PaymentPending) {
            escrow_state::transition(conn, &escrow.id, EscrowStatus::PartialPayment, None)?;
        }

        WebhookEvent::mark_completed(conn, &event.id)?;
        Ok(EventOutcome::Applied)
    })?;

    match &outcome {
        EventOutcome::Applied | EventOutcome::AlreadyProcessed => {
            idempotency_guard::complete(conn, &key, GUARD_SCOPE, Some(&event.id))?;
            if outcome == EventOutcome::Applied {
                info!(
                    event_id = %event.id,
                    escrow_id = %event.escrow_id,
                    amount_minor = event.amount_minor,
                    "payment event applied"
                );
            }
        }
        EventOutcome::Rejected(reason) => {
            idempotency_guard::complete(conn, &key, GUARD_SCOPE, None)?;
            warn!(event_id = %event.id, reason = %reason, "payment event rejected");
        }
        EventOutcome::RateUnavailable | EventOutcome::DuplicateInFlight => {}
    }

    Ok(outcome)
}

/// Integrity sweep over recent debits: same-user same-amount pairs closer
/// together than the configured gap, and failed cashouts whose user has
/// more than one matching debit in the window. Raises operator alerts
/// only; correction is always a human decision.
pub fn scan_for_duplicates(
    conn: &mut SqliteConnection,
    config: &MonitorConfig,
    now: NaiveDateTime,
) -> Result<DuplicateScanSummary> {
    let mut summary = DuplicateScanSummary::default();
    let since = now - Duration::seconds(config.duplicate_scan_window_secs);

    let debits = Transaction::find_recent_debits(conn, since)?;
    for pair in debits.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.user_id == b.user_id
            && a.amount_minor == b.amount_minor
            && (b.created_at - a.created_at).num_seconds() <= config.duplicate_pair_gap_secs
        {
            if raise_alert(
                conn,
                "duplicate_debit_pair",
                &[&a.id, &b.id],
                serde_json::json!({
                    "kind": "duplicate_debit_pair",
                    "user_id": a.user_id,
                    "amount_minor": a.amount_minor,
                    "transaction_ids": [a.id, b.id],
                }),
            )? {
                warn!(
                    user_id = %a.user_id,
                    amount_minor = a.amount_minor,
                    "duplicate debit pair detected"
                );
                summary.debit_pair_alerts += 1;
            }
        }
    }

    for cashout in Cashout::find_failed_since(conn, since)? {
        let matching =
            Transaction::count_matching_debits(conn, &cashout.user_id, cashout.amount_minor, since)?;
        if matching > 1 {
            if raise_alert(
                conn,
                "failed_cashout_with_debits",
                &[&cashout.id],
                serde_json::json!({
                    "kind": "failed_cashout_with_debits",
                    "cashout_id": cashout.id,
                    "user_id": cashout.user_id,
                    "amount_minor": cashout.amount_minor,
                    "matching_debits": matching,
                }),
            )? {
                warn!(
                    cashout_id = %cashout.id,
                    matching,
                    "failed cashout has multiple matching debits"
                );
                summary.failed_cashout_alerts += 1;
            }
        }
    }

    Ok(summary)
}

/// Enqueue an operator alert once per finding: the finding's identity is
/// an idempotency key, so re-running the scan does not re-alert.
fn raise_alert(
    conn: &mut SqliteConnection,
    kind: &str,
    entity_ids: &[&str],
    payload: serde_json::Value,
) -> Result<bool> {
    let key = idempotency_guard::escrow_op_key(&entity_ids.join("|"), kind, None);
    match idempotency_guard::admit(conn, &key, ALERT_SCOPE, idempotency_guard::default_ttl())? {
        Admission::Admitted => {
            WorkItem::enqueue(conn, WorkItemKind::OperatorAlert, None, &payload)?;
            idempotency_guard::complete(conn, &key, ALERT_SCOPE, None)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
