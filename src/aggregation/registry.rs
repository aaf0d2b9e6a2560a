//! Contract classification used for virtual token bucket selection

use super::db::ContractDirectory;
use moka::sync::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Token standards that map to a virtual bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenStandard {
    Oep4,
    Orc20,
}

impl TokenStandard {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStandard::Oep4 => "oep4",
            TokenStandard::Orc20 => "orc20",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "oep4" | "oep-4" => Some(TokenStandard::Oep4),
            "orc20" | "orc-20" => Some(TokenStandard::Orc20),
            _ => None,
        }
    }
}

pub trait ContractRegistry: Send + Sync {
    fn is_native(&self, hash: &str) -> bool;
    fn is_token_standard(&self, hash: &str, standard: TokenStandard) -> bool;
}

/// Registry backed by the contract directory with a short-lived cache
///
/// Native contracts are fixed at startup. Token standards are looked up per
/// hash and cached; lookup failures are not cached and classify the contract
/// as non-standard for that transaction.
pub struct CachedContractRegistry {
    native: HashSet<String>,
    directory: Arc<dyn ContractDirectory>,
    standards: Cache<String, Option<TokenStandard>>,
}

impl CachedContractRegistry {
    pub fn new(
        native: impl IntoIterator<Item = String>,
        directory: Arc<dyn ContractDirectory>,
        ttl: Duration,
    ) -> Self {
        Self {
            native: native.into_iter().collect(),
            directory,
            standards: Cache::builder()
                .max_capacity(16_384)
                .time_to_live(ttl)
                .build(),
        }
    }

    fn standard_of(&self, hash: &str) -> Option<TokenStandard> {
        if let Some(cached) = self.standards.get(hash) {
            return cached;
        }
        match self.directory.token_standard(hash) {
            Ok(standard) => {
                self.standards.insert(hash.to_string(), standard);
                standard
            }
            Err(e) => {
                log::warn!("⚠️  Token standard lookup failed for {}: {}", hash, e);
                None
            }
        }
    }
}

impl ContractRegistry for CachedContractRegistry {
    fn is_native(&self, hash: &str) -> bool {
        self.native.contains(hash)
    }

    fn is_token_standard(&self, hash: &str, standard: TokenStandard) -> bool {
        if self.is_native(hash) {
            return false;
        }
        self.standard_of(hash) == Some(standard)
    }
}
