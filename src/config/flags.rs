//! Platform-wide administrative switches.

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

/// Snapshot of the admin enable switches, taken once per batch run.
///
/// The auto-cashout scan receives this by reference instead of reading a
/// live global, so an operator flipping a switch mid-scan affects the next
/// run, never the one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformFlags {
    pub ngn_auto_cashout_enabled: bool,
    pub crypto_auto_cashout_enabled: bool,
}

impl PlatformFlags {
    pub fn from_env() -> Self {
        Self {
            ngn_auto_cashout_enabled: env_bool("AUTO_CASHOUT_NGN_ENABLED", false),
            crypto_auto_cashout_enabled: env_bool("AUTO_CASHOUT_CRYPTO_ENABLED", false),
        }
    }

    /// When neither rail is enabled the platform is in manual-approval mode
    /// and the scan does nothing.
    pub fn any_enabled(&self) -> bool {
        self.ngn_auto_cashout_enabled || self.crypto_auto_cashout_enabled
    }

    pub fn disabled() -> Self {
        Self {
            ngn_auto_cashout_enabled: false,
            crypto_auto_cashout_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_snapshot_gates_everything() {
        assert!(!PlatformFlags::disabled().any_enabled());
    }

    #[test]
    fn single_rail_is_enough() {
        let flags = PlatformFlags {
            ngn_auto_cashout_enabled: true,
            crypto_auto_cashout_enabled: false,
        };
        assert!(flags.any_enabled());
    }
}
