//! Aggregate keys: one variant per aggregation dimension

use std::fmt;

/// Identity of one live aggregate
///
/// Equality is by value. The `Address` variant with `for_oep = true` is a
/// counters-only shadow tracked independently of the token-keyed entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregateKey {
    Address {
        address: String,
        token_contract_hash: String,
        for_oep: bool,
    },
    Token {
        token_contract_hash: String,
    },
    Contract {
        called_contract_hash: String,
        token_contract_hash: String,
    },
}

impl AggregateKey {
    pub fn address(address: impl Into<String>, token_contract_hash: impl Into<String>) -> Self {
        AggregateKey::Address {
            address: address.into(),
            token_contract_hash: token_contract_hash.into(),
            for_oep: false,
        }
    }

    pub fn address_shadow(address: impl Into<String>, contract_hash: impl Into<String>) -> Self {
        AggregateKey::Address {
            address: address.into(),
            token_contract_hash: contract_hash.into(),
            for_oep: true,
        }
    }

    pub fn token(token_contract_hash: impl Into<String>) -> Self {
        AggregateKey::Token {
            token_contract_hash: token_contract_hash.into(),
        }
    }

    pub fn contract(
        called_contract_hash: impl Into<String>,
        token_contract_hash: impl Into<String>,
    ) -> Self {
        AggregateKey::Contract {
            called_contract_hash: called_contract_hash.into(),
            token_contract_hash: token_contract_hash.into(),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateKey::Address { address, token_contract_hash, for_oep } => {
                write!(f, "address({}, {}, oep={})", address, token_contract_hash, for_oep)
            }
            AggregateKey::Token { token_contract_hash } => {
                write!(f, "token({})", token_contract_hash)
            }
            AggregateKey::Contract { called_contract_hash, token_contract_hash } => {
                write!(f, "contract({}, {})", called_contract_hash, token_contract_hash)
            }
        }
    }
}
