//! Native gas token balance oracle
//!
//! Balance of the native gas token moves through two address spaces past the
//! activation block, so deltas seen in the transaction stream are not enough.
//! The engine re-reads the authoritative balance from a node for those keys.
//!
//! ## API Reference
//!
//! Endpoint: `{node_url}/api/v1/balancev2/{address}`
//! Returns: `{"Error": 0, "Result": {"ong": "<integer, 18 decimals>", ...}}`
//!
//! EVM-style `0x` addresses are converted to their base58 form first: the
//! 20 hex-encoded bytes are read in reverse order, prefixed with version
//! byte `0x17` and base58check encoded.
//!
//! Calls are blocking and made from the consumer thread only.

use super::error::OracleError;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

/// Scale of the `ong` field in balance responses
const GAS_TOKEN_DECIMALS: u32 = 18;

const EVM_PREFIX: &str = "0x";
const ADDRESS_VERSION: u8 = 0x17;
const ADDRESS_LEN: usize = 20;

/// Authoritative balance lookup for the native gas token
pub trait BalanceOracle: Send + Sync {
    fn query_balance(&self, address: &str) -> Result<Decimal, OracleError>;
}

/// Oracle for deployments without a node; every query fails and the engine
/// falls back to delta accounting
pub struct NoopBalanceOracle;

impl BalanceOracle for NoopBalanceOracle {
    fn query_balance(&self, _address: &str) -> Result<Decimal, OracleError> {
        Err(OracleError::NotConfigured)
    }
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(rename = "Error")]
    error: i64,
    #[serde(rename = "Result")]
    result: Option<BalanceResult>,
}

#[derive(Debug, Deserialize)]
struct BalanceResult {
    ong: String,
}

/// Node REST client
///
/// The blocking client is built on first use so it is created (and dropped)
/// on the consumer thread, outside any async runtime.
pub struct RestBalanceOracle {
    node_url: String,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl RestBalanceOracle {
    pub fn new(node_url: impl Into<String>) -> Self {
        Self {
            node_url: node_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, OracleError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl BalanceOracle for RestBalanceOracle {
    fn query_balance(&self, address: &str) -> Result<Decimal, OracleError> {
        let url = format!(
            "{}/api/v1/balancev2/{}",
            self.node_url,
            node_address(address)?
        );
        let response = self.client()?.get(&url).send()?;

        if !response.status().is_success() {
            return Err(OracleError::Malformed(format!(
                "node returned HTTP {}",
                response.status()
            )));
        }

        let bytes = response.bytes()?;
        let body: BalanceResponse = serde_json::from_slice(&bytes)
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        parse_balance(body)
    }
}

/// Address in the form the node accepts
pub fn node_address(address: &str) -> Result<String, OracleError> {
    let hex_form = match address.strip_prefix(EVM_PREFIX) {
        Some(hex_form) => hex_form,
        None => return Ok(address.to_string()),
    };
    let mut bytes = hex::decode(hex_form)
        .map_err(|e| OracleError::InvalidAddress(format!("{}: {}", address, e)))?;
    if bytes.len() != ADDRESS_LEN {
        return Err(OracleError::InvalidAddress(format!(
            "{}: expected {} bytes, got {}",
            address,
            ADDRESS_LEN,
            bytes.len()
        )));
    }
    // The hex form prints the address bytes little-endian
    bytes.reverse();
    Ok(bs58::encode(bytes)
        .with_check_version(ADDRESS_VERSION)
        .into_string())
}

fn parse_balance(body: BalanceResponse) -> Result<Decimal, OracleError> {
    if body.error != 0 {
        return Err(OracleError::Malformed(format!("node error code {}", body.error)));
    }
    let result = body
        .result
        .ok_or_else(|| OracleError::Malformed("missing Result".to_string()))?;
    let units: i128 = result
        .ong
        .trim()
        .parse()
        .map_err(|_| OracleError::Malformed(format!("invalid balance '{}'", result.ong)))?;
    Decimal::try_from_i128_with_scale(units, GAS_TOKEN_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|e| OracleError::Malformed(e.to_string()))
}
