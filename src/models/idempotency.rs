//! Idempotency-key records. The admit/complete/fail protocol lives in
//! `services::idempotency_guard`; this module is just the row access.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::schema::idempotency_keys;

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = idempotency_keys)]
pub struct IdempotencyKey {
    pub key: String,
    pub scope: String,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub result_digest: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = idempotency_keys)]
pub struct NewIdempotencyKey<'a> {
    pub key: &'a str,
    pub scope: &'a str,
    pub status: &'a str,
    pub created_at: NaiveDateTime,
}

impl IdempotencyKey {
    pub fn find(
        conn: &mut SqliteConnection,
        key: &str,
        scope: &str,
    ) -> Result<Option<IdempotencyKey>> {
        idempotency_keys::table
            .filter(idempotency_keys::key.eq(key))
            .filter(idempotency_keys::scope.eq(scope))
            .first(conn)
            .optional()
            .context("Failed to query idempotency key")
    }

    pub fn insert_in_progress(
        conn: &mut SqliteConnection,
        key: &str,
        scope: &str,
        at: NaiveDateTime,
    ) -> Result<()> {
        diesel::insert_into(idempotency_keys::table)
            .values(&NewIdempotencyKey {
                key,
                scope,
                status: "in_progress",
                created_at: at,
            })
            .execute(conn)
            .context("Failed to insert idempotency key")?;
        Ok(())
    }

    pub fn delete(conn: &mut SqliteConnection, key: &str, scope: &str) -> Result<()> {
        diesel::delete(
            idempotency_keys::table
                .filter(idempotency_keys::key.eq(key))
                .filter(idempotency_keys::scope.eq(scope)),
        )
        .execute(conn)
        .context("Failed to delete idempotency key")?;
        Ok(())
    }

    pub fn mark(
        conn: &mut SqliteConnection,
        key: &str,
        scope: &str,
        status: &str,
        result_digest: Option<&str>,
    ) -> Result<()> {
        diesel::update(
            idempotency_keys::table
                .filter(idempotency_keys::key.eq(key))
                .filter(idempotency_keys::scope.eq(scope)),
        )
        .set((
            idempotency_keys::status.eq(status),
            idempotency_keys::completed_at.eq(Some(chrono::Utc::now().naive_utc())),
            idempotency_keys::result_digest.eq(result_digest),
        ))
        .execute(conn)
        .context("Failed to mark idempotency key")?;
        Ok(())
    }

    /// Housekeeping: drop every record older than the TTL.
    pub fn purge_older_than(conn: &mut SqliteConnection, cutoff: NaiveDateTime) -> Result<usize> {
        diesel::delete(idempotency_keys::table.filter(idempotency_keys::created_at.lt(cutoff)))
            .execute(conn)
            .context("Failed to purge expired idempotency keys")
    }
}
