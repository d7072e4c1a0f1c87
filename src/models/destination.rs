//! Cashout destination descriptors.
//!
//! Bank and crypto destinations have different shapes; they are stored as a
//! tagged JSON variant so every consumer matches exhaustively instead of
//! probing for fields.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    Bank {
        account_number: String,
        bank_code: String,
        account_name: String,
    },
    Crypto {
        address: String,
        currency: String,
        network: String,
    },
}

impl Destination {
    pub fn kind(&self) -> &'static str {
        match self {
            Destination::Bank { .. } => "bank",
            Destination::Crypto { .. } => "crypto",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_tagged_json() {
        let dest = Destination::Bank {
            account_number: "0123456789".to_string(),
            bank_code: "058".to_string(),
            account_name: "Ada Obi".to_string(),
        };
        let json = serde_json::to_string(&dest).unwrap();
        assert!(json.contains("\"type\":\"bank\""));
        let back: Destination = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dest);
    }
}
