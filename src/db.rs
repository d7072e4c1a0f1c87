//! Connection pool and schema bootstrap for the coordination store.

use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::sql_query;

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

/// Per-connection PRAGMAs.
///
/// `busy_timeout` matters here: the background monitors and the webhook
/// ingest path all write to the same SQLite file, and without a timeout a
/// second writer fails immediately with SQLITE_BUSY instead of queueing.
#[derive(Debug, Clone)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        for pragma in [
            "PRAGMA foreign_keys = ON;",
            "PRAGMA journal_mode = WAL;",
            "PRAGMA busy_timeout = 5000;",
        ] {
            sql_query(pragma)
                .execute(conn)
                .map_err(diesel::r2d2::Error::QueryError)?;
        }
        Ok(())
    }
}

/// Build the shared r2d2 pool.
pub fn init_pool(database_url: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    r2d2::Pool::builder()
        .max_size(8)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .context("Failed to build database pool")
}

/// DDL applied at startup. Each statement is idempotent so restarts and
/// test setups share the same path.
const SCHEMA_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY NOT NULL,
        balance_minor BIGINT NOT NULL DEFAULT 0,
        currency TEXT NOT NULL,
        auto_cashout_enabled BOOLEAN NOT NULL DEFAULT 0,
        min_cashout_minor BIGINT NOT NULL DEFAULT 2500,
        bank_account_number TEXT,
        bank_code TEXT,
        bank_account_name TEXT,
        crypto_address TEXT,
        crypto_currency TEXT,
        crypto_network TEXT,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS escrows (
        id TEXT PRIMARY KEY NOT NULL,
        buyer_id TEXT NOT NULL,
        seller_id TEXT NOT NULL,
        amount_minor BIGINT NOT NULL,
        currency TEXT NOT NULL,
        fee_minor BIGINT NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'payment_pending',
        payment_confirmed_at TIMESTAMP,
        expires_at TIMESTAMP,
        processed_for_refund BOOLEAN NOT NULL DEFAULT 0,
        notified_buyers BOOLEAN NOT NULL DEFAULT 0,
        cancel_reason TEXT,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS cashouts (
        id TEXT PRIMARY KEY NOT NULL,
        user_id TEXT NOT NULL,
        amount_minor BIGINT NOT NULL,
        currency TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        destination_json TEXT NOT NULL,
        backend_pending BOOLEAN NOT NULL DEFAULT 0,
        external_txid TEXT,
        failure_reason TEXT,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS refunds (
        id TEXT PRIMARY KEY NOT NULL,
        escrow_id TEXT,
        user_id TEXT NOT NULL,
        source TEXT NOT NULL,
        amount_minor BIGINT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        fingerprint TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS idempotency_keys (
        key TEXT NOT NULL,
        scope TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'in_progress',
        created_at TIMESTAMP NOT NULL,
        completed_at TIMESTAMP,
        result_digest TEXT,
        PRIMARY KEY (key, scope)
    )",
    "CREATE TABLE IF NOT EXISTS webhook_events (
        id TEXT PRIMARY KEY NOT NULL,
        escrow_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        amount_minor BIGINT NOT NULL,
        currency TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'processing',
        external_txid TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transactions (
        id TEXT PRIMARY KEY NOT NULL,
        escrow_id TEXT,
        external_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        amount_minor BIGINT NOT NULL,
        currency TEXT NOT NULL,
        usd_rate TEXT,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_escrow_external
        ON transactions (escrow_id, external_id)",
    "CREATE TABLE IF NOT EXISTS work_items (
        id TEXT PRIMARY KEY NOT NULL,
        kind TEXT NOT NULL,
        escrow_id TEXT,
        payload_json TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        attempts INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_cashouts_user_status
        ON cashouts (user_id, status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_escrows_status_expires
        ON escrows (status, expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_work_items_status
        ON work_items (status, created_at)",
];

/// Apply the schema to a connection. Safe to call on every startup.
pub fn init_schema(conn: &mut SqliteConnection) -> Result<()> {
    for ddl in SCHEMA_DDL {
        sql_query(*ddl)
            .execute(conn)
            .with_context(|| format!("Failed to apply schema statement: {}", &ddl[..40.min(ddl.len())]))?;
    }
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Fresh in-memory database with the full schema applied.
    pub fn memory_conn() -> SqliteConnection {
        let mut conn =
            SqliteConnection::establish(":memory:").expect("in-memory sqlite should open");
        init_schema(&mut conn).expect("schema bootstrap should succeed");
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_bootstrap_is_idempotent() {
        let mut conn = test_support::memory_conn();
        // A second pass must not fail.
        init_schema(&mut conn).unwrap();
    }
}
