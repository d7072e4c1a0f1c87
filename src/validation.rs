//! Destination validation.
//!
//! Malformed destinations are a validation error, never coerced. The
//! auto-cashout scan reacts to these by disabling the user's auto-cashout
//! flag (fail closed) rather than retrying a destination that can never
//! succeed.

use thiserror::Error;

use crate::models::destination::Destination;

/// Account numbers for the supported bank region are exactly 10 digits.
pub const BANK_ACCOUNT_NUMBER_LEN: usize = 10;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DestinationError {
    #[error("bank destination missing {0}")]
    MissingBankField(&'static str),
    #[error("bank account number must be exactly 10 digits")]
    BadAccountNumber,
    #[error("crypto destination missing {0}")]
    MissingCryptoField(&'static str),
}

pub fn validate_destination(dest: &Destination) -> Result<(), DestinationError> {
    match dest {
        Destination::Bank {
            account_number,
            bank_code,
            account_name,
        } => {
            if account_number.is_empty() {
                return Err(DestinationError::MissingBankField("account_number"));
            }
            if bank_code.is_empty() {
                return Err(DestinationError::MissingBankField("bank_code"));
            }
            if account_name.is_empty() {
                return Err(DestinationError::MissingBankField("account_name"));
            }
            if account_number.len() != BANK_ACCOUNT_NUMBER_LEN
                || !account_number.chars().all(|c| c.is_ascii_digit())
            {
                return Err(DestinationError::BadAccountNumber);
            }
            Ok(())
        }
        Destination::Crypto {
            address,
            currency,
            network,
        } => {
            if address.is_empty() {
                return Err(DestinationError::MissingCryptoField("address"));
            }
            if currency.is_empty() {
                return Err(DestinationError::MissingCryptoField("currency"));
            }
            if network.is_empty() {
                return Err(DestinationError::MissingCryptoField("network"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(number: &str, code: &str, name: &str) -> Destination {
        Destination::Bank {
            account_number: number.to_string(),
            bank_code: code.to_string(),
            account_name: name.to_string(),
        }
    }

    #[test]
    fn accepts_valid_bank_destination() {
        assert_eq!(validate_destination(&bank("0123456789", "058", "Ada Obi")), Ok(()));
    }

    #[test]
    fn rejects_short_account_number() {
        assert_eq!(
            validate_destination(&bank("12345", "058", "Ada Obi")),
            Err(DestinationError::BadAccountNumber)
        );
    }

    #[test]
    fn rejects_non_numeric_account_number() {
        assert_eq!(
            validate_destination(&bank("012345678x", "058", "Ada Obi")),
            Err(DestinationError::BadAccountNumber)
        );
    }

    #[test]
    fn rejects_missing_bank_code() {
        assert_eq!(
            validate_destination(&bank("0123456789", "", "Ada Obi")),
            Err(DestinationError::MissingBankField("bank_code"))
        );
    }

    #[test]
    fn validates_crypto_fields() {
        let dest = Destination::Crypto {
            address: "bc1qxyz".to_string(),
            currency: "BTC".to_string(),
            network: String::new(),
        };
        assert_eq!(
            validate_destination(&dest),
            Err(DestinationError::MissingCryptoField("network"))
        );
    }
}
