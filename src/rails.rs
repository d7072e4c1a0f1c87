//! Seams to the external collaborators: payment rails, FX rates, and the
//! notification service. The core only sees these traits; provider HTTP
//! clients live behind them.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::destination::Destination;

/// Result of submitting a withdrawal to a rail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RailOutcome {
    /// The rail accepted the request. Completion is confirmed later via
    /// webhook; until then the cashout is backend-pending.
    Accepted { external_txid: String },
    /// The rail refused the request outright.
    Declined { reason: String },
}

#[async_trait]
pub trait PaymentRail: Send + Sync {
    async fn submit_withdrawal(
        &self,
        currency: &str,
        amount_minor: i64,
        destination: &Destination,
    ) -> anyhow::Result<RailOutcome>;

    async fn create_payment_address(&self, currency: &str) -> anyhow::Result<String>;
}

/// A rate quote. `Unavailable` is a first-class outcome: callers must keep
/// the triggering operation retryable instead of swallowing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateQuote {
    Available(Decimal),
    Unavailable,
}

#[async_trait]
pub trait RateService: Send + Sync {
    async fn get_rate(&self, currency: &str) -> anyhow::Result<RateQuote>;
}

/// Fire-and-forget notification delivery. At-least-once; never awaited for
/// correctness.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &str, payload: serde_json::Value);
}

/// Rail used when no provider is configured: declines every request so
/// nothing silently pretends to move money.
pub struct UnconfiguredRail;

#[async_trait]
impl PaymentRail for UnconfiguredRail {
    async fn submit_withdrawal(
        &self,
        _currency: &str,
        _amount_minor: i64,
        _destination: &Destination,
    ) -> anyhow::Result<RailOutcome> {
        Ok(RailOutcome::Declined {
            reason: "payment rail not configured".to_string(),
        })
    }

    async fn create_payment_address(&self, _currency: &str) -> anyhow::Result<String> {
        anyhow::bail!("payment rail not configured")
    }
}

/// Rate service used when no provider is configured.
pub struct UnavailableRates;

#[async_trait]
impl RateService for UnavailableRates {
    async fn get_rate(&self, _currency: &str) -> anyhow::Result<RateQuote> {
        Ok(RateQuote::Unavailable)
    }
}

/// Notifier that only logs. Delivery to a real channel is wired in by the
/// embedding application.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &str, payload: serde_json::Value) {
        tracing::info!(event = %event, payload = %payload, "notification emitted");
    }
}

#[cfg(test)]
pub mod mock {
    //! Recording doubles for service tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct SubmittedWithdrawal {
        pub currency: String,
        pub amount_minor: i64,
        pub destination: Destination,
    }

    /// Rail that records every submission and replies from a script.
    pub struct MockRail {
        pub submissions: Mutex<Vec<SubmittedWithdrawal>>,
        pub outcome: RailOutcome,
    }

    impl MockRail {
        pub fn accepting(txid: &str) -> Self {
            Self {
                submissions: Mutex::new(Vec::new()),
                outcome: RailOutcome::Accepted {
                    external_txid: txid.to_string(),
                },
            }
        }

        pub fn declining(reason: &str) -> Self {
            Self {
                submissions: Mutex::new(Vec::new()),
                outcome: RailOutcome::Declined {
                    reason: reason.to_string(),
                },
            }
        }

        pub fn call_count(&self) -> usize {
            self.submissions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PaymentRail for MockRail {
        async fn submit_withdrawal(
            &self,
            currency: &str,
            amount_minor: i64,
            destination: &Destination,
        ) -> anyhow::Result<RailOutcome> {
            self.submissions.lock().unwrap().push(SubmittedWithdrawal {
                currency: currency.to_string(),
                amount_minor,
                destination: destination.clone(),
            });
            Ok(self.outcome.clone())
        }

        async fn create_payment_address(&self, _currency: &str) -> anyhow::Result<String> {
            Ok("mock-address".to_string())
        }
    }

    /// Fixed-rate quote service.
    pub struct FixedRates(pub RateQuote);

    #[async_trait]
    impl RateService for FixedRates {
        async fn get_rate(&self, _currency: &str) -> anyhow::Result<RateQuote> {
            Ok(self.0.clone())
        }
    }

    /// Notifier that records emitted events.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &str, payload: serde_json::Value) {
            self.events.lock().unwrap().push((event.to_string(), payload));
        }
    }
}
