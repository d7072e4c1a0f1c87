//! Refund state transitions.
//!
//! Stricter than the escrow table: COMPLETED is absolutely terminal. The
//! rule this enforces is "a refund marked COMPLETED can never be reset to
//! PENDING by a retried job", which would otherwise risk a double payout.

use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel::Connection;
use thiserror::Error;
use tracing::{error, info};

use crate::models::refund::Refund;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundStatus {
    Pending,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefundTransitionError {
    #[error("illegal refund transition {from} -> {to}")]
    IllegalTransition { from: RefundStatus, to: RefundStatus },
    #[error("unknown refund status '{0}'")]
    UnknownStatus(String),
}

/// PENDING -> {COMPLETED, FAILED}; FAILED -> PENDING (retry);
/// COMPLETED -> nothing.
pub fn validate(from: RefundStatus, to: RefundStatus) -> Result<(), RefundTransitionError> {
    use RefundStatus::*;
    let ok = matches!((from, to), (Pending, Completed) | (Pending, Failed) | (Failed, Pending));
    if ok {
        Ok(())
    } else {
        Err(RefundTransitionError::IllegalTransition { from, to })
    }
}

/// Apply a refund transition. An illegal move is an error unless `force`
/// is set, in which case it is applied anyway and logged at the highest
/// severity for audit. `force` is an admin-only escape hatch; automated
/// code paths never pass it.
pub fn apply_transition(
    conn: &mut SqliteConnection,
    refund_id: &str,
    to: RefundStatus,
    force: bool,
) -> Result<Refund> {
    conn.transaction::<Refund, anyhow::Error, _>(|conn| {
        let refund = Refund::find_by_id(conn, refund_id)?;
        let from = RefundStatus::parse(&refund.status)
            .ok_or_else(|| RefundTransitionError::UnknownStatus(refund.status.clone()))?;

        match validate(from, to) {
            Ok(()) => {
                Refund::write_status(conn, refund_id, to.as_str())?;
                info!(refund_id = %refund_id, from = %from, to = %to, "refund transition applied");
            }
            Err(e) if force => {
                Refund::write_status(conn, refund_id, to.as_str())?;
                error!(
                    refund_id = %refund_id,
                    from = %from,
                    to = %to,
                    "FORCED refund transition applied despite validation failure: {e}"
                );
            }
            Err(e) => return Err(e.into()),
        }
        Refund::find_by_id(conn, refund_id)
    })
    .with_context(|| format!("Refund transition to {to} failed for {refund_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_conn;
    use crate::models::refund::NewRefund;

    fn seed(conn: &mut SqliteConnection, id: &str, status: &str) -> Refund {
        Refund::create(
            conn,
            NewRefund {
                id: id.to_string(),
                user_id: "u1".to_string(),
                amount_minor: 5_000,
                status: status.to_string(),
                fingerprint: format!("fp-{id}"),
                ..NewRefund::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn pending_reaches_both_outcomes() {
        use RefundStatus::*;
        assert!(validate(Pending, Completed).is_ok());
        assert!(validate(Pending, Failed).is_ok());
    }

    #[test]
    fn failed_can_retry_but_completed_is_terminal() {
        use RefundStatus::*;
        assert!(validate(Failed, Pending).is_ok());
        assert!(validate(Completed, Pending).is_err());
        assert!(validate(Completed, Failed).is_err());
    }

    #[test]
    fn completed_to_pending_rejected_without_force() {
        let mut conn = memory_conn();
        seed(&mut conn, "r1", "completed");

        let result = apply_transition(&mut conn, "r1", RefundStatus::Pending, false);
        assert!(result.is_err());
        assert_eq!(Refund::find_by_id(&mut conn, "r1").unwrap().status, "completed");
    }

    #[test]
    fn force_applies_illegal_transition() {
        let mut conn = memory_conn();
        seed(&mut conn, "r1", "completed");

        let refund = apply_transition(&mut conn, "r1", RefundStatus::Pending, true).unwrap();
        assert_eq!(refund.status, "pending");
    }

    #[test]
    fn retry_cycle_failed_to_pending_to_completed() {
        let mut conn = memory_conn();
        seed(&mut conn, "r1", "pending");

        apply_transition(&mut conn, "r1", RefundStatus::Failed, false).unwrap();
        apply_transition(&mut conn, "r1", RefundStatus::Pending, false).unwrap();
        let refund = apply_transition(&mut conn, "r1", RefundStatus::Completed, false).unwrap();
        assert_eq!(refund.status, "completed");
    }
}
