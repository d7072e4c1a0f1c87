//! Polling intervals and batch limits for the background workers.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub cashout_poll_secs: u64,
    pub expiry_poll_secs: u64,
    pub reconcile_poll_secs: u64,
    pub outbox_poll_secs: u64,
    /// Max escrows handled per expiry phase per run.
    pub batch_size: i64,
    /// Idempotency records older than this are expired regardless of status.
    pub idempotency_ttl_secs: i64,
    /// Look-back window for the duplicate-debit scan.
    pub duplicate_scan_window_secs: i64,
    /// Two debits for the same user and amount closer together than this are
    /// flagged as a suspected duplicate pair.
    pub duplicate_pair_gap_secs: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cashout_poll_secs: 300,
            expiry_poll_secs: 60,
            reconcile_poll_secs: 600,
            outbox_poll_secs: 15,
            batch_size: 50,
            idempotency_ttl_secs: 86_400,
            duplicate_scan_window_secs: 3_600,
            duplicate_pair_gap_secs: 300,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cashout_poll_secs: env_u64("CASHOUT_POLL_SECS", defaults.cashout_poll_secs),
            expiry_poll_secs: env_u64("EXPIRY_POLL_SECS", defaults.expiry_poll_secs),
            reconcile_poll_secs: env_u64("RECONCILE_POLL_SECS", defaults.reconcile_poll_secs),
            outbox_poll_secs: env_u64("OUTBOX_POLL_SECS", defaults.outbox_poll_secs),
            batch_size: env_u64("EXPIRY_BATCH_SIZE", defaults.batch_size as u64) as i64,
            idempotency_ttl_secs: env_u64(
                "IDEMPOTENCY_TTL_SECS",
                defaults.idempotency_ttl_secs as u64,
            ) as i64,
            duplicate_scan_window_secs: defaults.duplicate_scan_window_secs,
            duplicate_pair_gap_secs: defaults.duplicate_pair_gap_secs,
        }
    }

    pub fn cashout_poll_interval(&self) -> Duration {
        Duration::from_secs(self.cashout_poll_secs)
    }

    pub fn expiry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_poll_secs)
    }

    pub fn reconcile_poll_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_poll_secs)
    }

    pub fn outbox_poll_interval(&self) -> Duration {
        Duration::from_secs(self.outbox_poll_secs)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
