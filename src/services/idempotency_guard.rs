//! At-most-once execution guard.
//!
//! Every money-moving entry point asks the guard for admission before doing
//! anything. The guard's records live in the shared store, so it works
//! across processes; a worker that crashes mid-operation leaves a stale
//! `in_progress` record that self-heals via the staleness rule.
//!
//! Keys are derived purely from logical operation identity. They must never
//! include wall-clock time: a time-bucketed key lets a retry that crosses
//! the bucket boundary through as a "new" operation, which is exactly the
//! double-submit this layer exists to prevent.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use diesel::prelude::*;
use diesel::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::models::idempotency::IdempotencyKey;

/// Keys are valid for 24 hours by default.
pub fn default_ttl() -> Duration {
    Duration::hours(24)
}

/// An `in_progress` record older than this belongs to a crashed caller and
/// is reclaimed.
pub fn stale_after() -> Duration {
    Duration::minutes(10)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Proceed; the caller must later call `complete` or `fail`.
    Admitted,
    /// The operation already ran to completion; the digest of its result,
    /// if one was recorded.
    AlreadyCompleted(Option<String>),
    /// Another caller is currently executing this operation.
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DuplicateInFlight,
}

/// Try to admit the operation identified by `(key, scope)`.
pub fn admit(
    conn: &mut SqliteConnection,
    key: &str,
    scope: &str,
    ttl: Duration,
) -> Result<Admission> {
    let now = chrono::Utc::now().naive_utc();
    admit_at(conn, key, scope, ttl, now)
}

/// Clock-injected variant of [`admit`], used directly by tests.
pub fn admit_at(
    conn: &mut SqliteConnection,
    key: &str,
    scope: &str,
    ttl: Duration,
    now: NaiveDateTime,
) -> Result<Admission> {
    conn.transaction::<Admission, anyhow::Error, _>(|conn| {
        let existing = IdempotencyKey::find(conn, key, scope)?;

        let record = match existing {
            None => {
                IdempotencyKey::insert_in_progress(conn, key, scope, now)?;
                return Ok(Admission::Admitted);
            }
            Some(record) => record,
        };

        // TTL expiry applies regardless of status.
        if now - record.created_at > ttl {
            debug!(key = %key, scope = %scope, "idempotency key past TTL, re-admitting");
            IdempotencyKey::delete(conn, key, scope)?;
            IdempotencyKey::insert_in_progress(conn, key, scope, now)?;
            return Ok(Admission::Admitted);
        }

        match record.status.as_str() {
            "completed" => Ok(Admission::AlreadyCompleted(record.result_digest)),
            "failed" => {
                // A failed run rolled back its writes; a retry is legitimate.
                IdempotencyKey::delete(conn, key, scope)?;
                IdempotencyKey::insert_in_progress(conn, key, scope, now)?;
                Ok(Admission::Admitted)
            }
            "in_progress" => {
                if now - record.created_at > stale_after() {
                    warn!(
                        key = %key,
                        scope = %scope,
                        "reclaiming stale in-progress idempotency key"
                    );
                    IdempotencyKey::delete(conn, key, scope)?;
                    IdempotencyKey::insert_in_progress(conn, key, scope, now)?;
                    Ok(Admission::Admitted)
                } else {
                    Ok(Admission::Rejected(RejectReason::DuplicateInFlight))
                }
            }
            other => {
                warn!(key = %key, scope = %scope, status = %other, "idempotency key in unknown status, reclaiming");
                IdempotencyKey::delete(conn, key, scope)?;
                IdempotencyKey::insert_in_progress(conn, key, scope, now)?;
                Ok(Admission::Admitted)
            }
        }
    })
    .context("Idempotency admit failed")
}

/// Mark the admitted operation completed. Subsequent admits return
/// `AlreadyCompleted` until the TTL expires the record.
pub fn complete(
    conn: &mut SqliteConnection,
    key: &str,
    scope: &str,
    result_digest: Option<&str>,
) -> Result<()> {
    IdempotencyKey::mark(conn, key, scope, "completed", result_digest)
}

/// Mark the admitted operation failed, permitting a future retry.
pub fn fail(conn: &mut SqliteConnection, key: &str, scope: &str) -> Result<()> {
    IdempotencyKey::mark(conn, key, scope, "failed", None)
}

fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Key for an inbound payment-provider event.
pub fn payment_webhook_key(provider: &str, event_type: &str, external_id: &str) -> String {
    fingerprint(&[provider, event_type, external_id])
}

/// Key for an operation on a single escrow, optionally stage-qualified.
pub fn escrow_op_key(escrow_id: &str, operation: &str, stage: Option<&str>) -> String {
    match stage {
        Some(stage) => fingerprint(&[escrow_id, operation, stage]),
        None => fingerprint(&[escrow_id, operation]),
    }
}

/// Key for a cashout submission. `request_id` is the caller-supplied
/// logical id (the cashout row id), so a retry of the same cashout
/// collides with the original while distinct cashouts never do.
pub fn cashout_key(user_id: &str, amount_minor: i64, currency: &str, request_id: &str) -> String {
    fingerprint(&[user_id, &amount_minor.to_string(), currency, request_id])
}
