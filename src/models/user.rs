//! User wallet model: balance and auto-cashout settings.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::destination::Destination;
use crate::schema::users;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: String,
    pub balance_minor: i64,
    pub currency: String,
    pub auto_cashout_enabled: bool,
    pub min_cashout_minor: i64,
    pub bank_account_number: Option<String>,
    pub bank_code: Option<String>,
    pub bank_account_name: Option<String>,
    pub crypto_address: Option<String>,
    pub crypto_currency: Option<String>,
    pub crypto_network: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: String,
    pub balance_minor: i64,
    pub currency: String,
    pub auto_cashout_enabled: bool,
    pub min_cashout_minor: i64,
    pub bank_account_number: Option<String>,
    pub bank_code: Option<String>,
    pub bank_account_name: Option<String>,
    pub crypto_address: Option<String>,
    pub crypto_currency: Option<String>,
    pub crypto_network: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Default for NewUser {
    fn default() -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: String::new(),
            balance_minor: 0,
            currency: "NGN".to_string(),
            auto_cashout_enabled: false,
            min_cashout_minor: 2_500,
            bank_account_number: None,
            bank_code: None,
            bank_account_name: None,
            crypto_address: None,
            crypto_currency: None,
            crypto_network: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl User {
    pub fn create(conn: &mut SqliteConnection, new_user: NewUser) -> Result<User> {
        let user_id = new_user.id.clone();
        diesel::insert_into(users::table)
            .values(&new_user)
            .execute(conn)
            .with_context(|| format!("Failed to insert user {user_id}"))?;
        Self::find_by_id(conn, &user_id)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, user_id: &str) -> Result<User> {
        users::table
            .filter(users::id.eq(user_id))
            .first(conn)
            .with_context(|| format!("User {user_id} not found"))
    }

    /// Users the auto-cashout scan considers: flag enabled. Destination
    /// presence and validity are checked per user by the scan itself.
    pub fn find_auto_cashout_candidates(conn: &mut SqliteConnection) -> Result<Vec<User>> {
        users::table
            .filter(users::auto_cashout_enabled.eq(true))
            .order(users::id.asc())
            .load(conn)
            .context("Failed to load auto-cashout candidates")
    }

    /// Bank destination, if any bank field is configured. Partially filled
    /// destinations are returned as-is so validation can reject them (and
    /// the scan can fail closed) instead of silently falling through to
    /// crypto.
    pub fn bank_destination(&self) -> Option<Destination> {
        if self.bank_account_number.is_none()
            && self.bank_code.is_none()
            && self.bank_account_name.is_none()
        {
            return None;
        }
        Some(Destination::Bank {
            account_number: self.bank_account_number.clone().unwrap_or_default(),
            bank_code: self.bank_code.clone().unwrap_or_default(),
            account_name: self.bank_account_name.clone().unwrap_or_default(),
        })
    }

    pub fn crypto_destination(&self) -> Option<Destination> {
        if self.crypto_address.is_none()
            && self.crypto_currency.is_none()
            && self.crypto_network.is_none()
        {
            return None;
        }
        Some(Destination::Crypto {
            address: self.crypto_address.clone().unwrap_or_default(),
            currency: self.crypto_currency.clone().unwrap_or_default(),
            network: self.crypto_network.clone().unwrap_or_default(),
        })
    }

    /// Bank wins over crypto when both are configured.
    pub fn preferred_destination(&self) -> Option<Destination> {
        self.bank_destination().or_else(|| self.crypto_destination())
    }

    /// Effective minimum balance for the auto-cashout check.
    pub fn min_balance_minor(&self, default_min: i64) -> i64 {
        if self.min_cashout_minor > 0 {
            self.min_cashout_minor
        } else {
            default_min
        }
    }

    pub fn credit_balance(conn: &mut SqliteConnection, user_id: &str, amount_minor: i64) -> Result<()> {
        diesel::update(users::table.filter(users::id.eq(user_id)))
            .set((
                users::balance_minor.eq(users::balance_minor + amount_minor),
                users::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to credit balance for user {user_id}"))?;
        Ok(())
    }

    pub fn debit_balance(conn: &mut SqliteConnection, user_id: &str, amount_minor: i64) -> Result<()> {
        diesel::update(users::table.filter(users::id.eq(user_id)))
            .set((
                users::balance_minor.eq(users::balance_minor - amount_minor),
                users::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to debit balance for user {user_id}"))?;
        Ok(())
    }

    /// Persisted immediately by the scan when a destination fails
    /// validation (fail closed).
    pub fn set_auto_cashout(conn: &mut SqliteConnection, user_id: &str, enabled: bool) -> Result<()> {
        diesel::update(users::table.filter(users::id.eq(user_id)))
            .set((
                users::auto_cashout_enabled.eq(enabled),
                users::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .with_context(|| format!("Failed to update auto_cashout flag for user {user_id}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_conn;

    #[test]
    fn prefers_bank_over_crypto() {
        let user = User {
            bank_account_number: Some("0123456789".to_string()),
            bank_code: Some("058".to_string()),
            bank_account_name: Some("Ada Obi".to_string()),
            crypto_address: Some("bc1qxyz".to_string()),
            crypto_currency: Some("BTC".to_string()),
            crypto_network: Some("bitcoin".to_string()),
            ..test_user("u1", 0)
        };
        assert_eq!(user.preferred_destination().unwrap().kind(), "bank");
    }

    #[test]
    fn partial_bank_config_is_surfaced_not_skipped() {
        let user = User {
            bank_account_number: Some("0123456789".to_string()),
            ..test_user("u1", 0)
        };
        // Must come back as a (invalid) bank destination so the scan can
        // disable auto-cashout instead of quietly using crypto.
        assert_eq!(user.preferred_destination().unwrap().kind(), "bank");
    }

    #[test]
    fn credit_and_debit_round_trip() {
        let mut conn = memory_conn();
        User::create(
            &mut conn,
            NewUser {
                id: "u1".to_string(),
                balance_minor: 1_000,
                ..NewUser::default()
            },
        )
        .unwrap();

        User::credit_balance(&mut conn, "u1", 500).unwrap();
        User::debit_balance(&mut conn, "u1", 200).unwrap();
        let user = User::find_by_id(&mut conn, "u1").unwrap();
        assert_eq!(user.balance_minor, 1_300);
    }

    fn test_user(id: &str, balance: i64) -> User {
        let now = chrono::Utc::now().naive_utc();
        User {
            id: id.to_string(),
            balance_minor: balance,
            currency: "NGN".to_string(),
            auto_cashout_enabled: true,
            min_cashout_minor: 2_500,
            bank_account_number: None,
            bank_code: None,
            bank_account_name: None,
            crypto_address: None,
            crypto_currency: None,
            crypto_network: None,
            created_at: now,
            updated_at: now,
        }
    }
}
