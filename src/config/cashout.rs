//! Auto-cashout eligibility policy.

/// Rules applied to every user during the auto-cashout scan.
///
/// Amounts are minor units (cents/kobo). The buffer stays in the wallet on
/// every withdrawal; the submitted amount is always `balance - buffer`.
#[derive(Debug, Clone)]
pub struct CashoutPolicy {
    /// Minimum balance for users who never configured their own threshold.
    pub default_min_balance_minor: i64,
    /// Retained in-wallet on every auto-cashout.
    pub buffer_minor: i64,
    /// Duplicate-prevention window: skip a user with a hold-status cashout
    /// created within this many seconds.
    pub duplicate_window_secs: i64,
    /// Skip a user with at least this many failed cashouts...
    pub failure_cooldown_threshold: i64,
    /// ...within this many seconds.
    pub failure_window_secs: i64,
}

impl Default for CashoutPolicy {
    fn default() -> Self {
        Self {
            default_min_balance_minor: 2_500,
            buffer_minor: 500,
            duplicate_window_secs: 600,
            failure_cooldown_threshold: 3,
            failure_window_secs: 3_600,
        }
    }
}

impl CashoutPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_min_balance_minor: env_i64(
                "CASHOUT_MIN_BALANCE_MINOR",
                defaults.default_min_balance_minor,
            ),
            buffer_minor: env_i64("CASHOUT_BUFFER_MINOR", defaults.buffer_minor),
            duplicate_window_secs: env_i64(
                "CASHOUT_DUPLICATE_WINDOW_SECS",
                defaults.duplicate_window_secs,
            ),
            failure_cooldown_threshold: env_i64(
                "CASHOUT_FAILURE_THRESHOLD",
                defaults.failure_cooldown_threshold,
            ),
            failure_window_secs: env_i64("CASHOUT_FAILURE_WINDOW_SECS", defaults.failure_window_secs),
        }
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
