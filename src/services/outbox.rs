//! Outbox worker: drains the `work_items` queue.
//!
//! Producers enqueue follow-ups inside the transaction that made them
//! necessary; this worker delivers them afterwards, at-least-once. Refunds
//! are additionally guarded by an idempotency key so at-least-once delivery
//! still credits the buyer exactly once. Notifications and alerts are
//! fire-and-forget.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use diesel::prelude::*;
use diesel::Connection;
use serde::Deserialize;
use tokio::time::interval;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::db::DbPool;
use crate::models::refund::{NewRefund, Refund};
use crate::models::user::User;
use crate::models::work_item::{WorkItem, WorkItemKind};
use crate::rails::Notifier;
use crate::services::escrow_state::{self, EscrowStatus};
use crate::services::idempotency_guard::{self, Admission};
use crate::services::refund_state::{self, RefundStatus};

const GUARD_SCOPE: &str = "outbox_refund";
const MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Deserialize)]
struct RefundPayload {
    escrow_id: String,
    user_id: String,
    amount_minor: i64,
    #[serde(default)]
    source: Option<String>,
}

pub struct OutboxWorker {
    db: DbPool,
    notifier: Arc<dyn Notifier>,
    config: MonitorConfig,
}

impl OutboxWorker {
    pub fn new(db: DbPool, notifier: Arc<dyn Notifier>, config: MonitorConfig) -> Self {
        info!(
            "OutboxWorker initialized with poll_interval={}s",
            config.outbox_poll_secs
        );
        Self { db, notifier, config }
    }

    pub async fn start_monitoring(self: Arc<Self>) {
        let mut poll_timer = interval(self.config.outbox_poll_interval());
        info!("Starting outbox drain loop");
        loop {
            poll_timer.tick().await;
            if let Err(e) = self.run_once().await {
                error!("Outbox drain failed: {e:#}");
            }
        }
    }

    /// Drain one batch. Item failures bump the attempt counter and the
    /// drain continues.
    pub async fn run_once(&self) -> Result<usize> {
        let db = self.db.clone();
        let batch_size = self.config.batch_size;
        let items = tokio::task::spawn_blocking(move || {
            let mut conn = db.get().context("Failed to get DB connection")?;
            WorkItem::claim_batch(&mut conn, batch_size)
        })
        .await
        .context("Task join error")??;

        let mut delivered = 0;
        for item in items {
            let item_id = item.id.clone();
            match self.deliver(item).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    error!(item_id = %item_id, "work item delivery failed: {e:#}");
                    let db = self.db.clone();
                    let id = item_id.clone();
                    tokio::task::spawn_blocking(move || {
                        let mut conn = db.get().context("Failed to get DB connection")?;
                        WorkItem::record_failure(&mut conn, &id, MAX_ATTEMPTS)
                    })
                    .await
                    .context("Task join error")??;
                }
            }
        }
        Ok(delivered)
    }

    async fn deliver(&self, item: WorkItem) -> Result<()> {
        let kind = WorkItemKind::parse(&item.kind)
            .ok_or_else(|| anyhow!("unknown work item kind '{}'", item.kind))?;
        match kind {
            WorkItemKind::RefundBuyer => {
                let db = self.db.clone();
                tokio::task::spawn_blocking(move || {
                    let mut conn = db.get().context("Failed to get DB connection")?;
                    deliver_refund(&mut conn, &item)
                })
                .await
                .context("Task join error")?
            }
            WorkItemKind::NotifyBuyer | WorkItemKind::OperatorAlert => {
                let payload: serde_json::Value = serde_json::from_str(&item.payload_json)
                    .with_context(|| format!("Work item {} has malformed payload", item.id))?;
                self.notifier.notify(kind.as_str(), payload).await;

                let db = self.db.clone();
                tokio::task::spawn_blocking(move || {
                    let mut conn = db.get().context("Failed to get DB connection")?;
                    WorkItem::mark_done(&mut conn, &item.id)
                })
                .await
                .context("Task join error")?
            }
        }
    }
}

/// Execute a buyer refund exactly once. The refund row, the wallet credit,
/// the refund completion, and the escrow's move to REFUNDED share one
/// database transaction.
fn deliver_refund(conn: &mut SqliteConnection, item: &WorkItem) -> Result<()> {
    let payload: RefundPayload = serde_json::from_str(&item.payload_json)
        .with_context(|| format!("Work item {} has malformed refund payload", item.id))?;

    let key = idempotency_guard::escrow_op_key(&payload.escrow_id, "refund_buyer", None);

    // The refund row outlives the guard record's TTL, so a very late
    // redelivery is still caught here.
    if Refund::find_by_fingerprint(conn, &key)?.is_some() {
        WorkItem::mark_done(conn, &item.id)?;
        return Ok(());
    }

    match idempotency_guard::admit(conn, &key, GUARD_SCOPE, idempotency_guard::default_ttl())? {
        Admission::AlreadyCompleted(_) => {
            // A previous item (or a redelivery) already paid this refund.
            WorkItem::mark_done(conn, &item.id)?;
            return Ok(());
        }
        Admission::Rejected(_) => {
            // In-flight elsewhere; leave the item queued for the next pass.
            return Ok(());
        }
        Admission::Admitted => {}
    }

    let result = conn.transaction::<String, anyhow::Error, _>(|conn| {
        let refund_id = Uuid::new_v4().to_string();
        Refund::create(
            conn,
            NewRefund {
                id: refund_id.clone(),
                escrow_id: Some(payload.escrow_id.clone()),
                user_id: payload.user_id.clone(),
                source: payload.source.clone().unwrap_or_else(|| "escrow_expiry".to_string()),
                amount_minor: payload.amount_minor,
                status: "pending".to_string(),
                fingerprint: key.clone(),
                ..NewRefund::default()
            },
        )?;
        User::credit_balance(conn, &payload.user_id, payload.amount_minor)?;
        refund_state::apply_transition(conn, &refund_id, RefundStatus::Completed, false)?;
        escrow_state::transition(conn, &payload.escrow_id, EscrowStatus::Refunded, None)?;
        WorkItem::mark_done(conn, &item.id)?;
        Ok(refund_id)
    });

    match result {
        Ok(refund_id) => {
            idempotency_guard::complete(conn, &key, GUARD_SCOPE, Some(&refund_id))?;
            info!(
                escrow_id = %payload.escrow_id,
                refund_id = %refund_id,
                amount_minor = payload.amount_minor,
                "buyer refund delivered"
            );
            Ok(())
        }
        Err(e) => {
            idempotency_guard::fail(conn, &key, GUARD_SCOPE)?;
            Err(e)
        }
    }
}
