//! Auto-cashout background monitor.
//!
//! Periodically scans users with auto-cashout enabled and drives eligible
//! balances out through the payment rail. Each user is processed in
//! isolation: one user's failure is logged and the scan moves on.
//!
//! Eligibility is decided by [`evaluate_user`], a pure function over the
//! user row and two precomputed facts (recent hold, failure count), so the
//! rules are unit-testable without IO.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use diesel::Connection;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{CashoutPolicy, MonitorConfig, PlatformFlags};
use crate::db::DbPool;
use crate::models::cashout::{Cashout, NewCashout};
use crate::models::destination::Destination;
use crate::models::refund::{NewRefund, Refund};
use crate::models::transaction::{NewTransaction, Transaction};
use crate::models::user::User;
use crate::rails::{PaymentRail, RailOutcome};
use crate::services::idempotency_guard::{self, Admission};
use crate::services::refund_state::{self, RefundStatus};
use crate::validation::{validate_destination, DestinationError};

const GUARD_SCOPE: &str = "cashout_submit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A hold-status cashout exists inside the duplicate-prevention window.
    HoldInWindow,
    /// Balance below the user's minimum plus the retained buffer.
    BelowMinimum,
    /// Three or more failed cashouts within the cooldown window.
    FailureCooldown,
    /// No destination configured, or none permitted by the enabled rails.
    NoEligibleDestination,
}

/// Outcome of evaluating one user against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CashoutDecision {
    Skip(SkipReason),
    /// Destination is configured but malformed: disable the user's
    /// auto-cashout flag immediately (fail closed) and skip.
    DisableAutoCashout(DestinationError),
    Submit {
        destination: Destination,
        amount_minor: i64,
    },
}

/// Apply the eligibility rules in order: duplicate window, minimum
/// balance, failure cooldown, destination validation. Bank is preferred
/// over crypto when both are configured and enabled.
pub fn evaluate_user(
    user: &User,
    flags: &PlatformFlags,
    has_recent_hold: bool,
    failed_in_window: i64,
    policy: &CashoutPolicy,
) -> CashoutDecision {
    if has_recent_hold {
        return CashoutDecision::Skip(SkipReason::HoldInWindow);
    }

    let min = user.min_balance_minor(policy.default_min_balance_minor);
    if user.balance_minor < min + policy.buffer_minor {
        return CashoutDecision::Skip(SkipReason::BelowMinimum);
    }

    if failed_in_window >= policy.failure_cooldown_threshold {
        return CashoutDecision::Skip(SkipReason::FailureCooldown);
    }

    // Destination preference order, filtered by the enabled rails. A
    // partially configured bank destination still wins the preference so
    // validation can fail closed instead of quietly falling back to crypto.
    let destination = match (user.bank_destination(), user.crypto_destination()) {
        (Some(bank), _) if flags.ngn_auto_cashout_enabled => Some(bank),
        (_, Some(crypto)) if flags.crypto_auto_cashout_enabled => Some(crypto),
        _ => None,
    };
    let destination = match destination {
        Some(dest) => dest,
        None => return CashoutDecision::Skip(SkipReason::NoEligibleDestination),
    };

    if let Err(e) = validate_destination(&destination) {
        return CashoutDecision::DisableAutoCashout(e);
    }

    CashoutDecision::Submit {
        destination,
        amount_minor: user.balance_minor - policy.buffer_minor,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub scanned: usize,
    pub submitted: usize,
    pub skipped: usize,
    pub disabled: usize,
    pub errors: usize,
}

pub struct AutoCashoutMonitor {
    db: DbPool,
    rail: Arc<dyn PaymentRail>,
    policy: CashoutPolicy,
    config: MonitorConfig,
}

impl AutoCashoutMonitor {
    pub fn new(
        db: DbPool,
        rail: Arc<dyn PaymentRail>,
        policy: CashoutPolicy,
        config: MonitorConfig,
    ) -> Self {
        info!(
            "AutoCashoutMonitor initialized with poll_interval={}s",
            config.cashout_poll_secs
        );
        Self { db, rail, policy, config }
    }

    /// Background loop. Takes a fresh flag snapshot per tick so a flag flip
    /// mid-scan only affects the next run.
    pub async fn start_monitoring(self: Arc<Self>) {
        let mut poll_timer = interval(self.config.cashout_poll_interval());
        info!("Starting auto-cashout monitoring loop");
        loop {
            poll_timer.tick().await;
            let flags = PlatformFlags::from_env();
            match self.run_once(&flags).await {
                Ok(summary) => {
                    if summary.submitted > 0 || summary.errors > 0 {
                        info!(
                            scanned = summary.scanned,
                            submitted = summary.submitted,
                            skipped = summary.skipped,
                            disabled = summary.disabled,
                            errors = summary.errors,
                            "auto-cashout scan finished"
                        );
                    }
                }
                Err(e) => error!("Auto-cashout scan failed: {e:#}"),
            }
        }
    }

    /// One full scan against a flag snapshot.
    pub async fn run_once(&self, flags: &PlatformFlags) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();

        // Global gate: manual-approval mode platform-wide.
        if !flags.any_enabled() {
            return Ok(summary);
        }

        let db = self.db.clone();
        let candidates = tokio::task::spawn_blocking(move || {
            let mut conn = db.get().context("Failed to get DB connection")?;
            User::find_auto_cashout_candidates(&mut conn)
        })
        .await
        .context("Task join error")??;

        for user in candidates {
            summary.scanned += 1;
            let user_id = user.id.clone();
            match self.process_user(user, flags).await {
                Ok(UserOutcome::Submitted) => summary.submitted += 1,
                Ok(UserOutcome::Skipped(reason)) => {
                    tracing::debug!(user_id = %user_id, ?reason, "auto-cashout skipped");
                    summary.skipped += 1;
                }
                Ok(UserOutcome::Disabled) => summary.disabled += 1,
                Err(e) => {
                    // One user must never abort the scan for the rest.
                    error!(user_id = %user_id, "auto-cashout failed for user: {e:#}");
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn process_user(&self, user: User, flags: &PlatformFlags) -> Result<UserOutcome> {
        let db = self.db.clone();
        let policy = self.policy.clone();
        let user_id = user.id.clone();

        let (has_hold, failed_count) = tokio::task::spawn_blocking(move || -> Result<(bool, i64)> {
            let mut conn = db.get().context("Failed to get DB connection")?;
            let now = chrono::Utc::now().naive_utc();
            let hold = Cashout::has_recent_hold(
                &mut conn,
                &user_id,
                now - Duration::seconds(policy.duplicate_window_secs),
            )?;
            let failed = Cashout::count_failed_since(
                &mut conn,
                &user_id,
                now - Duration::seconds(policy.failure_window_secs),
            )?;
            Ok((hold, failed))
        })
        .await
        .context("Task join error")??;

        match evaluate_user(&user, flags, has_hold, failed_count, &self.policy) {
            CashoutDecision::Skip(reason) => Ok(UserOutcome::Skipped(reason)),
            CashoutDecision::DisableAutoCashout(e) => {
                warn!(
                    user_id = %user.id,
                    "invalid cashout destination ({e}); disabling auto-cashout"
                );
                let db = self.db.clone();
                let user_id = user.id.clone();
                tokio::task::spawn_blocking(move || {
                    let mut conn = db.get().context("Failed to get DB connection")?;
                    User::set_auto_cashout(&mut conn, &user_id, false)
                })
                .await
                .context("Task join error")??;
                Ok(UserOutcome::Disabled)
            }
            CashoutDecision::Submit { destination, amount_minor } => {
                self.submit_for_user(&user, destination, amount_minor).await?;
                Ok(UserOutcome::Submitted)
            }
        }
    }

    /// Create the cashout, place the hold, and drive it through the rail.
    /// Rail acceptance is followed immediately by auto-approval: this path
    /// is only reachable when the admin enable switch is on, so there is
    /// no manual step.
    async fn submit_for_user(
        &self,
        user: &User,
        destination: Destination,
        amount_minor: i64,
    ) -> Result<()> {
        let cashout_id = Uuid::new_v4().to_string();
        let destination_json =
            serde_json::to_string(&destination).context("Failed to serialize destination")?;

        // Hold phase: cashout row + balance debit in one transaction.
        let db = self.db.clone();
        let (cid, uid, currency) = (cashout_id.clone(), user.id.clone(), user.currency.clone());
        let dest_json = destination_json.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = db.get().context("Failed to get DB connection")?;
            conn.transaction::<(), anyhow::Error, _>(|conn| {
                Cashout::create(
                    conn,
                    NewCashout {
                        id: cid.clone(),
                        user_id: uid.clone(),
                        amount_minor,
                        currency: currency.clone(),
                        status: "pending".to_string(),
                        destination_json: dest_json,
                        ..NewCashout::default()
                    },
                )?;
                User::debit_balance(conn, &uid, amount_minor)?;
                Ok(())
            })
        })
        .await
        .context("Task join error")??;

        // Guard the rail call so a retry of this same cashout can never
        // double-submit.
        let guard_key =
            idempotency_guard::cashout_key(&user.id, amount_minor, &user.currency, &cashout_id);
        let db = self.db.clone();
        let key = guard_key.clone();
        let admission = tokio::task::spawn_blocking(move || {
            let mut conn = db.get().context("Failed to get DB connection")?;
            idempotency_guard::admit(&mut conn, &key, GUARD_SCOPE, idempotency_guard::default_ttl())
        })
        .await
        .context("Task join error")??;
        if admission != Admission::Admitted {
            warn!(cashout_id = %cashout_id, "cashout submission already in flight or done");
            return Ok(());
        }

        let outcome = self
            .rail
            .submit_withdrawal(&user.currency, amount_minor, &destination)
            .await;

        let db = self.db.clone();
        let (cid, uid, currency) = (cashout_id.clone(), user.id.clone(), user.currency.clone());
        match outcome {
            Ok(RailOutcome::Accepted { external_txid }) => {
                tokio::task::spawn_blocking(move || -> Result<()> {
                    let mut conn = db.get().context("Failed to get DB connection")?;
                    conn.transaction::<(), anyhow::Error, _>(|conn| {
                        Cashout::mark_submitted(conn, &cid, &external_txid)?;
                        Transaction::create(
                            conn,
                            NewTransaction {
                                id: Uuid::new_v4().to_string(),
                                external_id: external_txid.clone(),
                                user_id: uid.clone(),
                                kind: "debit".to_string(),
                                amount_minor,
                                currency: currency.clone(),
                                ..NewTransaction::default()
                            },
                        )?;
                        Cashout::mark_approved(conn, &cid)?;
                        Ok(())
                    })?;
                    idempotency_guard::complete(&mut conn, &guard_key, GUARD_SCOPE, Some(&cid))?;
                    Ok(())
                })
                .await
                .context("Task join error")??;
                info!(cashout_id = %cashout_id, amount_minor, "auto-cashout submitted and approved");
                Ok(())
            }
            Ok(RailOutcome::Declined { reason }) => {
                tokio::task::spawn_blocking(move || -> Result<()> {
                    let mut conn = db.get().context("Failed to get DB connection")?;
                    conn.transaction::<(), anyhow::Error, _>(|conn| {
                        Cashout::mark_failed(conn, &cid, &reason)?;
                        // Release the hold via the refund path so the credit
                        // is auditable.
                        let refund_id = Uuid::new_v4().to_string();
                        Refund::create(
                            conn,
                            NewRefund {
                                id: refund_id.clone(),
                                user_id: uid.clone(),
                                source: "cashout_failure".to_string(),
                                amount_minor,
                                status: "pending".to_string(),
                                fingerprint: idempotency_guard::cashout_key(
                                    &uid,
                                    amount_minor,
                                    &currency,
                                    &cid,
                                ),
                                ..NewRefund::default()
                            },
                        )?;
                        User::credit_balance(conn, &uid, amount_minor)?;
                        refund_state::apply_transition(conn, &refund_id, RefundStatus::Completed, false)?;
                        Ok(())
                    })?;
                    idempotency_guard::complete(&mut conn, &guard_key, GUARD_SCOPE, None)?;
                    Ok(())
                })
                .await
                .context("Task join error")??;
                warn!(cashout_id = %cashout_id, "rail declined auto-cashout");
                Ok(())
            }
            Err(e) => {
                // Rail outcome unknown: keep the hold (the row stays
                // `pending` and blocks duplicates) and free the guard for a
                // later retry.
                tokio::task::spawn_blocking(move || {
                    let mut conn = db.get().context("Failed to get DB connection")?;
                    idempotency_guard::fail(&mut conn, &guard_key, GUARD_SCOPE)
                })
                .await
                .context("Task join error")??;
                Err(e).with_context(|| format!("Rail call failed for cashout {cashout_id}"))
            }
        }
    }
}

#[derive(Debug)]
enum UserOutcome {
    Submitted,
    Skipped(SkipReason),
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::rails::mock::MockRail;
    use diesel::prelude::*;

    fn enabled_flags() -> PlatformFlags {
        PlatformFlags {
            ngn_auto_cashout_enabled: true,
            crypto_auto_cashout_enabled: true,
        }
    }

    fn user_with_bank(id: &str, balance: i64) -> User {
        let now = chrono::Utc::now().naive_utc();
        User {
            id: id.to_string(),
            balance_minor: balance,
            currency: "NGN".to_string(),
            auto_cashout_enabled: true,
            min_cashout_minor: 2_500,
            bank_account_number: Some("0123456789".to_string()),
            bank_code: Some("058".to_string()),
            bank_account_name: Some("Ada Obi".to_string()),
            crypto_address: None,
            crypto_currency: None,
            crypto_network: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn balance_just_below_minimum_is_skipped() {
        // $24.99 against a $25 minimum.
        let user = User { balance_minor: 2_499, ..user_with_bank("u1", 0) };
        let decision = evaluate_user(&user, &enabled_flags(), false, 0, &CashoutPolicy::default());
        assert_eq!(decision, CashoutDecision::Skip(SkipReason::BelowMinimum));
    }

    #[test]
    fn withdrawal_is_balance_minus_buffer() {
        // $30 balance, $25 minimum, $5 buffer: withdraw exactly $25.00.
        let user = User { balance_minor: 3_000, ..user_with_bank("u1", 0) };
        match evaluate_user(&user, &enabled_flags(), false, 0, &CashoutPolicy::default()) {
            CashoutDecision::Submit { amount_minor, destination } => {
                assert_eq!(amount_minor, 2_500);
                assert_eq!(destination.kind(), "bank");
            }
            other => panic!("expected Submit, got {other:?}"),
        }
    }

    #[test]
    fn three_failures_in_window_trigger_cooldown() {
        let user = User { balance_minor: 100_000, ..user_with_bank("u1", 0) };
        let decision = evaluate_user(&user, &enabled_flags(), false, 3, &CashoutPolicy::default());
        assert_eq!(decision, CashoutDecision::Skip(SkipReason::FailureCooldown));
    }

    #[test]
    fn recent_hold_blocks_regardless_of_balance() {
        let user = User { balance_minor: 100_000, ..user_with_bank("u1", 0) };
        let decision = evaluate_user(&user, &enabled_flags(), true, 0, &CashoutPolicy::default());
        assert_eq!(decision, CashoutDecision::Skip(SkipReason::HoldInWindow));
    }

    #[test]
    fn malformed_bank_destination_fails_closed() {
        let user = User {
            balance_minor: 10_000,
            bank_account_number: Some("12345".to_string()),
            ..user_with_bank("u1", 0)
        };
        match evaluate_user(&user, &enabled_flags(), false, 0, &CashoutPolicy::default()) {
            CashoutDecision::DisableAutoCashout(DestinationError::BadAccountNumber) => {}
            other => panic!("expected DisableAutoCashout, got {other:?}"),
        }
    }

    #[test]
    fn bank_preferred_over_crypto_when_both_configured() {
        let user = User {
            balance_minor: 10_000,
            crypto_address: Some("bc1qxyz".to_string()),
            crypto_currency: Some("BTC".to_string()),
            crypto_network: Some("bitcoin".to_string()),
            ..user_with_bank("u1", 0)
        };
        match evaluate_user(&user, &enabled_flags(), false, 0, &CashoutPolicy::default()) {
            CashoutDecision::Submit { destination, .. } => assert_eq!(destination.kind(), "bank"),
            other => panic!("expected Submit, got {other:?}"),
        }
    }

    #[test]
    fn crypto_used_when_bank_rail_disabled() {
        let flags = PlatformFlags {
            ngn_auto_cashout_enabled: false,
            crypto_auto_cashout_enabled: true,
        };
        let user = User {
            balance_minor: 10_000,
            crypto_address: Some("bc1qxyz".to_string()),
            crypto_currency: Some("BTC".to_string()),
            crypto_network: Some("bitcoin".to_string()),
            ..user_with_bank("u1", 0)
        };
        match evaluate_user(&user, &flags, false, 0, &CashoutPolicy::default()) {
            CashoutDecision::Submit { destination, .. } => assert_eq!(destination.kind(), "crypto"),
            other => panic!("expected Submit, got {other:?}"),
        }
    }

    fn temp_pool() -> (DbPool, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("paylock-test-{}.db", Uuid::new_v4()));
        let pool = db::init_pool(path.to_str().unwrap()).unwrap();
        let mut conn = pool.get().unwrap();
        db::init_schema(&mut conn).unwrap();
        (pool, path)
    }

    fn seed_user(pool: &DbPool, id: &str, balance: i64) {
        use crate::models::user::NewUser;
        let mut conn = pool.get().unwrap();
        User::create(
            &mut conn,
            NewUser {
                id: id.to_string(),
                balance_minor: balance,
                auto_cashout_enabled: true,
                bank_account_number: Some("0123456789".to_string()),
                bank_code: Some("058".to_string()),
                bank_account_name: Some("Ada Obi".to_string()),
                ..NewUser::default()
            },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn scan_submits_once_and_window_blocks_second_run() {
        let (pool, path) = temp_pool();
        seed_user(&pool, "u1", 3_000);

        let rail = Arc::new(MockRail::accepting("rail-tx-1"));
        let monitor = AutoCashoutMonitor::new(
            pool.clone(),
            rail.clone(),
            CashoutPolicy::default(),
            MonitorConfig::default(),
        );

        let summary = monitor.run_once(&enabled_flags()).await.unwrap();
        assert_eq!(summary.submitted, 1);
        assert_eq!(rail.call_count(), 1);
        assert_eq!(rail.submissions.lock().unwrap()[0].amount_minor, 2_500);

        // Buffer stays in the wallet; the cashout is approved but still
        // backend-pending.
        {
            let mut conn = pool.get().unwrap();
            let user = User::find_by_id(&mut conn, "u1").unwrap();
            assert_eq!(user.balance_minor, 500);
            use crate::schema::cashouts::dsl::*;
            let rows: Vec<Cashout> = cashouts.load(&mut conn).unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status, "success");
            assert!(rows[0].backend_pending);
        }

        // Second scan: the fresh success releases no hold, but balance is
        // now just the buffer, so the user is skipped either way and the
        // rail is not called again.
        let summary = monitor.run_once(&enabled_flags()).await.unwrap();
        assert_eq!(summary.submitted, 0);
        assert_eq!(rail.call_count(), 1);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn declined_submission_restores_balance_via_refund() {
        let (pool, path) = temp_pool();
        seed_user(&pool, "u1", 3_000);

        let rail = Arc::new(MockRail::declining("insufficient float"));
        let monitor = AutoCashoutMonitor::new(
            pool.clone(),
            rail.clone(),
            CashoutPolicy::default(),
            MonitorConfig::default(),
        );

        monitor.run_once(&enabled_flags()).await.unwrap();
        assert_eq!(rail.call_count(), 1);

        let mut conn = pool.get().unwrap();
        let user = User::find_by_id(&mut conn, "u1").unwrap();
        assert_eq!(user.balance_minor, 3_000);

        use crate::schema::refunds::dsl::*;
        let rows: Vec<Refund> = refunds.load(&mut conn).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[0].source, "cashout_failure");

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn disabled_flags_gate_the_whole_scan() {
        let (pool, path) = temp_pool();
        seed_user(&pool, "u1", 100_000);

        let rail = Arc::new(MockRail::accepting("rail-tx-1"));
        let monitor = AutoCashoutMonitor::new(
            pool.clone(),
            rail.clone(),
            CashoutPolicy::default(),
            MonitorConfig::default(),
        );

        let summary = monitor.run_once(&PlatformFlags::disabled()).await.unwrap();
        assert_eq!(summary.scanned, 0);
        assert_eq!(rail.call_count(), 0);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn invalid_destination_disables_flag_immediately() {
        let (pool, path) = temp_pool();
        {
            use crate::models::user::NewUser;
            let mut conn = pool.get().unwrap();
            User::create(
                &mut conn,
                NewUser {
                    id: "u1".to_string(),
                    balance_minor: 10_000,
                    auto_cashout_enabled: true,
                    bank_account_number: Some("12345".to_string()),
                    ..NewUser::default()
                },
            )
            .unwrap();
        }

        let rail = Arc::new(MockRail::accepting("rail-tx-1"));
        let monitor = AutoCashoutMonitor::new(
            pool.clone(),
            rail.clone(),
            CashoutPolicy::default(),
            MonitorConfig::default(),
        );

        let summary = monitor.run_once(&enabled_flags()).await.unwrap();
        assert_eq!(summary.disabled, 1);
        assert_eq!(rail.call_count(), 0);

        let mut conn = pool.get().unwrap();
        let user = User::find_by_id(&mut conn, "u1").unwrap();
        assert!(!user.auto_cashout_enabled);

        let _ = std::fs::remove_file(path);
    }
}
