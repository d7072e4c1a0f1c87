//! Escrow lifecycle state machine.
//!
//! Owns the escrow status field. Every status write funnels through
//! [`transition`], which re-reads the row and validates the move inside a
//! single database transaction, so a concurrent writer attempting an
//! illegal transition is rejected rather than merged.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::Connection;
use thiserror::Error;
use tracing::info;

use crate::models::escrow::Escrow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowStatus {
    PaymentPending,
    PartialPayment,
    PaymentConfirmed,
    Active,
    Completed,
    Disputed,
    Cancelled,
    Expired,
    Refunded,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentPending => "payment_pending",
            Self::PartialPayment => "partial_payment",
            Self::PaymentConfirmed => "payment_confirmed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Disputed => "disputed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment_pending" => Some(Self::PaymentPending),
            "partial_payment" => Some(Self::PartialPayment),
            "payment_confirmed" => Some(Self::PaymentConfirmed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "disputed" => Some(Self::Disputed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    /// Legal targets from this status. CANCELLED and EXPIRED are reachable
    /// from any pre-ACTIVE status; REFUNDED only from DISPUTED or EXPIRED.
    pub fn allowed_targets(&self) -> &'static [EscrowStatus] {
        use EscrowStatus::*;
        match self {
            PaymentPending => &[PartialPayment, PaymentConfirmed, Cancelled, Expired],
            PartialPayment => &[PaymentConfirmed, Cancelled, Expired],
            PaymentConfirmed => &[Active, Cancelled, Expired],
            Active => &[Completed, Disputed],
            Disputed => &[Refunded],
            Expired => &[Refunded],
            Completed | Cancelled | Refunded => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Refunded)
    }

    pub fn is_pre_active(&self) -> bool {
        matches!(
            self,
            Self::PaymentPending | Self::PartialPayment | Self::PaymentConfirmed
        )
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal escrow transition {from} -> {to}")]
    IllegalTransition { from: EscrowStatus, to: EscrowStatus },
    #[error("unknown escrow status '{0}'")]
    UnknownStatus(String),
}

/// Why a past-deadline escrow left the pre-ACTIVE phase. The distinction
/// decides whether a refund is owed, so it must never be collapsed into a
/// single generic "expired".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Buyer never paid: cancel, nobody is owed anything.
    CancelPaymentTimeout,
    /// Buyer paid, seller never delivered: expire, buyer is owed a refund.
    ExpireDeliveryTimeout,
}

impl ExpiryOutcome {
    pub fn target(&self) -> EscrowStatus {
        match self {
            Self::CancelPaymentTimeout => EscrowStatus::Cancelled,
            Self::ExpireDeliveryTimeout => EscrowStatus::Expired,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::CancelPaymentTimeout => "payment_timeout",
            Self::ExpireDeliveryTimeout => "delivery_timeout",
        }
    }
}

pub fn validate(from: EscrowStatus, to: EscrowStatus) -> Result<(), TransitionError> {
    if from.allowed_targets().contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalTransition { from, to })
    }
}

/// Classify a past-deadline escrow: the same condition produces different
/// targets depending on whether payment was ever confirmed.
pub fn expiry_outcome(escrow: &Escrow) -> ExpiryOutcome {
    if escrow.payment_confirmed_at.is_some() {
        ExpiryOutcome::ExpireDeliveryTimeout
    } else {
        ExpiryOutcome::CancelPaymentTimeout
    }
}

/// Atomically move an escrow to `target`. Re-reads the row inside the
/// transaction so the decision is made against the current status, not a
/// stale one read before any suspension point.
pub fn transition(
    conn: &mut SqliteConnection,
    escrow_id: &str,
    target: EscrowStatus,
    reason: Option<&str>,
) -> Result<Escrow> {
    conn.transaction::<Escrow, anyhow::Error, _>(|conn| {
        let escrow = Escrow::find_by_id(conn, escrow_id)?;
        let from = EscrowStatus::parse(&escrow.status)
            .ok_or_else(|| TransitionError::UnknownStatus(escrow.status.clone()))?;
        validate(from, target)?;

        Escrow::write_status(conn, escrow_id, target.as_str(), reason)?;
        info!(
            escrow_id = %escrow_id,
            from = %from,
            to = %target,
            reason = reason.unwrap_or("-"),
            "escrow transition applied"
        );
        Escrow::find_by_id(conn, escrow_id)
    })
    .with_context(|| format!("Escrow transition to {target} failed for {escrow_id}"))
}

/// Record payment confirmation: writes `payment_confirmed_at` once (it is
/// immutable afterwards) and moves the escrow to PAYMENT_CONFIRMED if it
/// is not there already. Safe to call on a replay.
pub fn confirm_payment(
    conn: &mut SqliteConnection,
    escrow_id: &str,
    at: NaiveDateTime,
) -> Result<Escrow> {
    conn.transaction::<Escrow, anyhow::Error, _>(|conn| {
        let escrow = Escrow::find_by_id(conn, escrow_id)?;
        let from = EscrowStatus::parse(&escrow.status)
            .ok_or_else(|| TransitionError::UnknownStatus(escrow.status.clone()))?;

        Escrow::confirm_payment_at(conn, escrow_id, at)?;
        if from != EscrowStatus::PaymentConfirmed {
            validate(from, EscrowStatus::PaymentConfirmed)?;
            Escrow::write_status(conn, escrow_id, EscrowStatus::PaymentConfirmed.as_str(), None)?;
        }
        Escrow::find_by_id(conn, escrow_id)
    })
    .with_context(|| format!("Payment confirmation failed for escrow {escrow_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_conn;
    use crate::models::escrow::NewEscrow;
    use chrono::Duration;

    fn seed(conn: &mut SqliteConnection, id: &str, status: &str) -> Escrow {
        Escrow::create(
            conn,
            NewEscrow {
                id: id.to_string(),
                buyer_id: "buyer".to_string(),
                seller_id: "seller".to_string(),
                amount_minor: 10_000,
                status: status.to_string(),
                ..NewEscrow::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn table_permits_forward_moves_only() {
        use EscrowStatus::*;
        assert!(validate(PaymentPending, PartialPayment).is_ok());
        assert!(validate(PaymentPending, PaymentConfirmed).is_ok());
        assert!(validate(PaymentConfirmed, Active).is_ok());
        assert!(validate(Active, Completed).is_ok());
        assert!(validate(Active, Disputed).is_ok());
        assert!(validate(Disputed, Refunded).is_ok());
        assert!(validate(Expired, Refunded).is_ok());

        // Backwards and sideways moves are rejected.
        assert!(validate(PaymentConfirmed, PaymentPending).is_err());
        assert!(validate(Active, Cancelled).is_err());
        assert!(validate(Completed, Refunded).is_err());
        assert!(validate(Cancelled, PaymentPending).is_err());

        // Terminal states have no outgoing edges at all.
        for terminal in [Completed, Cancelled, Refunded] {
            assert!(terminal.is_terminal());
            assert!(terminal.allowed_targets().is_empty());
        }
    }

    #[test]
    fn cancelled_and_expired_reachable_from_all_pre_active() {
        use EscrowStatus::*;
        for from in [PaymentPending, PartialPayment, PaymentConfirmed] {
            assert!(validate(from, Cancelled).is_ok());
            assert!(validate(from, Expired).is_ok());
        }
    }

    #[test]
    fn illegal_transition_leaves_status_unchanged() {
        let mut conn = memory_conn();
        seed(&mut conn, "e1", "completed");

        let result = transition(&mut conn, "e1", EscrowStatus::Refunded, None);
        assert!(result.is_err());
        assert_eq!(Escrow::find_by_id(&mut conn, "e1").unwrap().status, "completed");
    }

    #[test]
    fn transition_writes_status_and_reason() {
        let mut conn = memory_conn();
        seed(&mut conn, "e1", "payment_pending");

        let escrow =
            transition(&mut conn, "e1", EscrowStatus::Cancelled, Some("payment_timeout")).unwrap();
        assert_eq!(escrow.status, "cancelled");
        assert_eq!(escrow.cancel_reason.as_deref(), Some("payment_timeout"));
    }

    #[test]
    fn expiry_branch_depends_on_payment_confirmation() {
        let mut conn = memory_conn();
        let unpaid = seed(&mut conn, "e1", "payment_pending");
        assert_eq!(expiry_outcome(&unpaid), ExpiryOutcome::CancelPaymentTimeout);
        assert_eq!(expiry_outcome(&unpaid).target(), EscrowStatus::Cancelled);
        assert_eq!(expiry_outcome(&unpaid).reason(), "payment_timeout");

        let paid_at = chrono::Utc::now().naive_utc() - Duration::hours(2);
        Escrow::confirm_payment_at(&mut conn, "e1", paid_at).unwrap();
        let paid = Escrow::find_by_id(&mut conn, "e1").unwrap();
        assert_eq!(expiry_outcome(&paid), ExpiryOutcome::ExpireDeliveryTimeout);
        assert_eq!(expiry_outcome(&paid).target(), EscrowStatus::Expired);
        assert_eq!(expiry_outcome(&paid).reason(), "delivery_timeout");
    }

    #[test]
    fn confirm_payment_is_replay_safe() {
        let mut conn = memory_conn();
        seed(&mut conn, "e1", "payment_pending");

        let first = chrono::Utc::now().naive_utc();
        let escrow = confirm_payment(&mut conn, "e1", first).unwrap();
        assert_eq!(escrow.status, "payment_confirmed");
        assert_eq!(escrow.payment_confirmed_at, Some(first));

        // Replay: timestamp untouched, status unchanged, no error.
        let escrow = confirm_payment(&mut conn, "e1", first + Duration::hours(1)).unwrap();
        assert_eq!(escrow.payment_confirmed_at, Some(first));
        assert_eq!(escrow.status, "payment_confirmed");
    }
}
