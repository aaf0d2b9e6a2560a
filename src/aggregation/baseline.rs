//! Baseline cache: lazily materialized aggregates seeded from persisted rows
//!
//! Bounded by entry count and expired by access time. A key leaves the
//! cache when the engine takes it into the current epoch, and comes back
//! when its staged state is acknowledged as durable.

use super::context::AggregationRules;
use super::db::BaselineStore;
use super::entity::{AddressAggregate, Aggregate, ContractAggregate, TokenAggregate};
use super::error::StoreError;
use super::keys::AggregateKey;
use super::rows::OEP_AGGREGATION_DATE_ID;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

pub struct BaselineCache {
    cache: Cache<AggregateKey, Aggregate>,
    store: Arc<dyn BaselineStore>,
}

impl BaselineCache {
    pub fn new(store: Arc<dyn BaselineStore>, capacity: u64, time_to_idle: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(time_to_idle)
                .build(),
            store,
        }
    }

    /// Remove the cached aggregate for `key`, loading it from the store if absent
    pub fn take(
        &self,
        key: &AggregateKey,
        epoch: i32,
        rules: &AggregationRules,
    ) -> Result<Aggregate, StoreError> {
        if let Some(aggregate) = self.cache.remove(key) {
            return Ok(aggregate);
        }
        self.load(key, epoch, rules)
    }

    /// Put an aggregate back once its staged state is durable
    pub fn restore(&self, key: AggregateKey, aggregate: Aggregate) {
        self.cache.insert(key, aggregate);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Most recent daily row before `epoch` plus the standing lifetime row
    fn load(
        &self,
        key: &AggregateKey,
        epoch: i32,
        rules: &AggregationRules,
    ) -> Result<Aggregate, StoreError> {
        log::debug!("Loading baseline for {} before {}", key, epoch);
        let aggregate = match key {
            AggregateKey::Address {
                address,
                token_contract_hash,
                for_oep,
            } => {
                let baseline =
                    self.store
                        .load_address_baseline(address, token_contract_hash, epoch)?;
                let total_date_id = if *for_oep {
                    OEP_AGGREGATION_DATE_ID
                } else {
                    rules.total_date_id
                };
                let total =
                    self.store
                        .load_address_total(address, token_contract_hash, total_date_id)?;
                Aggregate::Address(AddressAggregate::populate(
                    address.as_str(),
                    token_contract_hash.as_str(),
                    *for_oep,
                    baseline.as_ref(),
                    total.as_ref(),
                ))
            }
            AggregateKey::Token {
                token_contract_hash,
            } => {
                let total = self
                    .store
                    .load_token_total(token_contract_hash, rules.total_date_id)?;
                Aggregate::Token(TokenAggregate::populate(
                    token_contract_hash.as_str(),
                    total.as_ref(),
                ))
            }
            AggregateKey::Contract {
                called_contract_hash,
                token_contract_hash,
            } => {
                let total = self.store.load_contract_total(
                    called_contract_hash,
                    token_contract_hash,
                    rules.total_date_id,
                )?;
                Aggregate::Contract(ContractAggregate::populate(
                    called_contract_hash.as_str(),
                    token_contract_hash.as_str(),
                    total.as_ref(),
                ))
            }
        };
        Ok(aggregate)
    }
}
