//! Core value types shared by every component

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BedrockError, Result};

/// Transaction identifier.
///
/// An opaque 128-bit id minted by the caller or coordinator. It is the only
/// context threaded through lock and storage calls; it carries no state of its own.
/// Rendered as 32 lowercase hex digits, which is also the form written to the
/// commit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(u128);

impl TxnId {
    /// Reserved "no owner" id used by index entries
    pub const NIL: TxnId = TxnId(0);

    /// Mint a fresh random transaction id (never NIL)
    pub fn generate() -> Self {
        loop {
            let raw: u128 = rand::random();
            if raw != 0 {
                return TxnId(raw);
            }
        }
    }

    pub const fn from_u128(raw: u128) -> Self {
        TxnId(raw)
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for TxnId {
    type Err = BedrockError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(BedrockError::Encoding(format!(
                "Transaction id '{}' must be 32 hex digits",
                s
            )));
        }
        u128::from_str_radix(s, 16)
            .map(TxnId)
            .map_err(|e| BedrockError::Encoding(format!("Bad transaction id '{}': {}", s, e)))
    }
}

/// Lockable resource key: resource kind plus name.
///
/// Only ever used as a lock-table key; the lock manager never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Inventory resource record (a flight, car or room type, ...)
///
/// Mutated only while `id` is write-locked by the mutating transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub count: i64,
    pub price: i64,
}

impl Resource {
    pub fn new(id: impl Into<String>, count: i64, price: i64) -> Self {
        Self {
            id: id.into(),
            count,
            price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_display_parse() {
        let id = TxnId::from_u128(0xdead_beef);
        let text = id.to_string();
        assert_eq!(text, "000000000000000000000000deadbeef");
        assert_eq!(text.parse::<TxnId>().unwrap(), id);
    }

    #[test]
    fn test_txn_id_rejects_short_text() {
        assert!("abc".parse::<TxnId>().is_err());
        assert!("zz".repeat(16).parse::<TxnId>().is_err());
    }

    #[test]
    fn test_generated_ids_are_distinct_and_not_nil() {
        let a = TxnId::generate();
        let b = TxnId::generate();
        assert_ne!(a, b);
        assert!(!a.is_nil());
        assert!(TxnId::NIL.is_nil());
    }

    #[test]
    fn test_resource_key_display() {
        assert_eq!(ResourceKey::new("flight", "AA100").to_string(), "flight:AA100");
    }
}
