//! Aggregation configuration from environment variables

use super::error::ConfigError;
use std::env;
use std::time::Duration;

pub const ONT_CONTRACT_HASH: &str = "0100000000000000000000000000000000000000";
pub const ONG_CONTRACT_HASH: &str = "0200000000000000000000000000000000000000";

/// Configuration for the aggregation runtime
///
/// Loaded from environment variables with defaults matching production.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding `.sql` schema migrations
    pub schema_dir: String,

    /// Dispatcher queue bound (events)
    pub queue_capacity: usize,

    /// Lifetime totals flush tick in milliseconds
    pub tick_interval_ms: u64,

    /// Delay between live polling passes in milliseconds
    pub poll_interval_ms: u64,

    /// Blocks per source page
    pub block_batch_size: i64,

    /// Dispatched transactions per second, 0 disables the limiter
    pub rate_limit: f64,

    pub baseline_capacity: u64,
    pub baseline_ttl: Duration,

    /// Date id of lifetime rows
    pub total_date_id: i32,

    /// Contracts classified as native tokens
    pub native_contracts: Vec<String>,

    /// Token whose balance is re-queried past the activation block
    pub native_gas_contract: String,

    /// First block where the balance oracle is consulted, 0 disables it
    pub native_activation_block: i64,

    /// REST host of the chain node used by the balance oracle
    pub node_url: Option<String>,

    pub resync_enabled: bool,
    pub resync_interval: Duration,
    pub resync_timeout: Duration,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            db_path: "txagg.db".to_string(),
            schema_dir: "sql".to_string(),
            queue_capacity: 131_072,
            tick_interval_ms: 5_000,
            poll_interval_ms: 5_000,
            block_batch_size: 1_000,
            rate_limit: 300.0,
            baseline_capacity: 32_768,
            baseline_ttl: Duration::from_secs(3_600),
            total_date_id: -1,
            native_contracts: vec![ONT_CONTRACT_HASH.to_string(), ONG_CONTRACT_HASH.to_string()],
            native_gas_contract: ONG_CONTRACT_HASH.to_string(),
            native_activation_block: 0,
            node_url: None,
            resync_enabled: true,
            resync_interval: Duration::from_secs(600),
            resync_timeout: Duration::from_secs(600),
        }
    }
}

impl AggregationConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (see DESIGN.md for the full table):
    /// - `TXAGG_DB_PATH` (default: txagg.db)
    /// - `TXAGG_QUEUE_CAPACITY` (default: 131072)
    /// - `TXAGG_TICK_INTERVAL_MS` (default: 5000)
    /// - `TXAGG_RATE_LIMIT` (default: 300)
    /// - `TXAGG_NATIVE_ACTIVATION_BLOCK` (default: 0, disabled)
    /// - `TXAGG_RESYNC_TIMEOUT_SECS` (default: 600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let native_contracts = env::var("TXAGG_NATIVE_CONTRACTS")
            .map(|s| {
                s.split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.native_contracts);

        let config = Self {
            db_path: env::var("TXAGG_DB_PATH").unwrap_or(defaults.db_path),
            schema_dir: env::var("TXAGG_SCHEMA_DIR").unwrap_or(defaults.schema_dir),
            queue_capacity: parse_var("TXAGG_QUEUE_CAPACITY", defaults.queue_capacity),
            tick_interval_ms: parse_var("TXAGG_TICK_INTERVAL_MS", defaults.tick_interval_ms),
            poll_interval_ms: parse_var("TXAGG_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            block_batch_size: parse_var("TXAGG_BLOCK_BATCH_SIZE", defaults.block_batch_size),
            rate_limit: parse_var("TXAGG_RATE_LIMIT", defaults.rate_limit),
            baseline_capacity: parse_var("TXAGG_BASELINE_CAPACITY", defaults.baseline_capacity),
            baseline_ttl: Duration::from_secs(parse_var(
                "TXAGG_BASELINE_TTL_SECS",
                defaults.baseline_ttl.as_secs(),
            )),
            total_date_id: parse_var("TXAGG_TOTAL_DATE_ID", defaults.total_date_id),
            native_contracts,
            native_gas_contract: env::var("TXAGG_NATIVE_GAS_CONTRACT")
                .unwrap_or(defaults.native_gas_contract),
            native_activation_block: parse_var(
                "TXAGG_NATIVE_ACTIVATION_BLOCK",
                defaults.native_activation_block,
            ),
            node_url: env::var("TXAGG_NODE_URL").ok().filter(|s| !s.is_empty()),
            resync_enabled: parse_var("TXAGG_RESYNC_ENABLED", defaults.resync_enabled),
            resync_interval: Duration::from_secs(parse_var(
                "TXAGG_RESYNC_INTERVAL_SECS",
                defaults.resync_interval.as_secs(),
            )),
            resync_timeout: Duration::from_secs(parse_var(
                "TXAGG_RESYNC_TIMEOUT_SECS",
                defaults.resync_timeout.as_secs(),
            )),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "TXAGG_QUEUE_CAPACITY must be positive".to_string(),
            ));
        }
        if self.block_batch_size <= 0 {
            return Err(ConfigError::InvalidValue(
                "TXAGG_BLOCK_BATCH_SIZE must be positive".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "TXAGG_TICK_INTERVAL_MS must be positive".to_string(),
            ));
        }
        if self.total_date_id > 0 {
            return Err(ConfigError::InvalidValue(format!(
                "TXAGG_TOTAL_DATE_ID must not collide with daily date ids, got {}",
                self.total_date_id
            )));
        }
        if self.native_activation_block > 0 && self.node_url.is_none() {
            log::warn!(
                "Balance oracle activation block set to {} without TXAGG_NODE_URL, delta accounting will be used",
                self.native_activation_block
            );
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', using default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        // Test: defaults match the production deployment
        let config = AggregationConfig::default();

        assert_eq!(config.queue_capacity, 131_072);
        assert_eq!(config.tick_interval_ms, 5_000);
        assert_eq!(config.block_batch_size, 1_000);
        assert_eq!(config.total_date_id, -1);
        assert_eq!(config.native_contracts.len(), 2);
        assert_eq!(config.resync_timeout, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_config() {
        // Test: custom values and invalid fallbacks from env vars
        env::set_var("TXAGG_QUEUE_CAPACITY", "64");
        env::set_var("TXAGG_RATE_LIMIT", "not-a-number");
        env::set_var("TXAGG_NATIVE_CONTRACTS", "aa, bb ,");
        env::set_var("TXAGG_RESYNC_ENABLED", "FALSE");

        let config = AggregationConfig::from_env().unwrap();

        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.rate_limit, 300.0);
        assert_eq!(config.native_contracts, vec!["aa".to_string(), "bb".to_string()]);
        assert!(!config.resync_enabled);

        env::remove_var("TXAGG_QUEUE_CAPACITY");
        env::remove_var("TXAGG_RATE_LIMIT");
        env::remove_var("TXAGG_NATIVE_CONTRACTS");
        env::remove_var("TXAGG_RESYNC_ENABLED");
    }

    #[test]
    fn test_rejects_positive_total_date_id() {
        let config = AggregationConfig {
            total_date_id: 20230101,
            ..AggregationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
