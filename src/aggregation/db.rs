//! Persistence traits and their SQLite implementation
//!
//! Tables (see `/sql/` directory):
//! - `tx_detail` - source stream, read by the live poller and resync replay
//! - `address_daily_aggregation`, `token_daily_aggregation`,
//!   `contract_daily_aggregation` - snapshot rows, one per key and date id
//! - `current` - persisted watermark
//! - `contract` - token standards and resync requests
//!
//! Decimal columns are stored as TEXT so values round-trip without loss.

use super::error::StoreError;
use super::registry::TokenStandard;
use super::resync::{ResyncRequest, ResyncStatus};
use super::rows::{AddressRow, ContractRow, TokenRow, OEP_AGGREGATION_DATE_ID};
use super::snapshot::{AggregateSnapshot, SnapshotRows, TotalAggregationSnapshot};
use super::types::{EventKind, TransactionInfo, VIRTUAL_CONTRACT_ALL};
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Synchronous row lookups behind the baseline cache
///
/// Called on the consumer thread, once per key not yet materialized.
pub trait BaselineStore: Send + Sync {
    /// Most recent daily row strictly before `before_epoch`
    fn load_address_baseline(
        &self,
        address: &str,
        token_contract_hash: &str,
        before_epoch: i32,
    ) -> Result<Option<AddressRow>, StoreError>;

    fn load_address_total(
        &self,
        address: &str,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<AddressRow>, StoreError>;

    fn load_token_total(
        &self,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<TokenRow>, StoreError>;

    fn load_contract_total(
        &self,
        contract_hash: &str,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<ContractRow>, StoreError>;
}

pub trait WatermarkStore: Send + Sync {
    /// Block height covered by the last durable epoch snapshot
    fn load_watermark(&self) -> Result<i64, StoreError>;
}

pub trait ContractDirectory: Send + Sync {
    fn token_standard(&self, contract_hash: &str) -> Result<Option<TokenStandard>, StoreError>;
}

/// Trait for writing snapshot batches
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    /// Epoch snapshot
    ///
    /// Operation:
    /// - plain snapshot: UPSERT every row, then save the watermark
    /// - resync snapshot: merge every row with the stored one (MAX of each
    ///   counter), then record the replayed height on the resync request
    async fn write_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<(), StoreError>;

    /// Lifetime rows only; UPSERT, watermark untouched
    async fn write_totals(&self, snapshot: &TotalAggregationSnapshot) -> Result<(), StoreError>;
}

/// Ordered page reader over `tx_detail`
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn latest_block_height(&self) -> Result<Option<i64>, StoreError>;

    /// Rows in `(after, up_to]`, ordered by block height, block index, tx index
    async fn fetch_range(&self, query: &RangeQuery) -> Result<Vec<TransactionInfo>, StoreError>;
}

#[async_trait]
pub trait ResyncRequests: Send + Sync {
    async fn pending_requests(&self) -> Result<Vec<ResyncRequest>, StoreError>;
    async fn set_status(&self, contract_hash: &str, status: ResyncStatus) -> Result<(), StoreError>;

    /// Contracts whose lifetime tx counts wait for a repair
    async fn repair_requests(&self) -> Result<Vec<String>, StoreError>;

    /// Rebuild the lifetime tx counts of every address that transferred the
    /// contract from its daily rows; returns the number of rows rewritten
    async fn repair_tx_counts(
        &self,
        contract_hash: &str,
        total_date_id: i32,
    ) -> Result<usize, StoreError>;
}

/// Source page filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    /// Exclusive lower block bound
    pub after: i64,
    /// Inclusive upper block bound
    pub up_to: i64,
    pub kinds: Vec<EventKind>,
    pub called_contract: Option<String>,
}

impl RangeQuery {
    /// Live page: every gas and transfer event
    pub fn live(after: i64, up_to: i64) -> Self {
        Self {
            after,
            up_to,
            kinds: vec![EventKind::Gas, EventKind::Transfer],
            called_contract: None,
        }
    }

    /// Replay page: transfers invoking one contract
    pub fn resync(after: i64, up_to: i64, contract_hash: &str) -> Self {
        Self {
            after,
            up_to,
            kinds: vec![EventKind::Transfer],
            called_contract: Some(contract_hash.to_string()),
        }
    }
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir`, sorted by name (00_, 01_, ...),
/// and executes them. Every file must use "IF NOT EXISTS" clauses so the
/// migration is idempotent.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::Schema(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    // PRAGMA journal_mode returns a row, pragma_update handles that
    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)
            .map_err(|e| StoreError::Schema(format!("{}: {}", filename, e)))?;

        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// SQLite implementation of every persistence trait
///
/// One connection shared behind a mutex: the consumer thread reads
/// baselines while the writer task and the pollers run on the runtime.
pub struct SqliteAggregateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAggregateStore {
    /// Open an existing database; the schema must already be migrated
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    /// Append source rows, ignoring ones already present
    pub fn insert_transactions(&self, transactions: &[TransactionInfo]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT OR IGNORE INTO tx_detail (
                    tx_hash, block_height, block_index, tx_index, tx_time, event_type,
                    from_address, to_address, contract_hash, called_contract_hash,
                    amount, fee
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            for info in transactions {
                inserted += stmt.execute(params![
                    info.tx_hash,
                    info.block_height,
                    info.block_index,
                    info.tx_index,
                    info.timestamp,
                    info.event_kind.code(),
                    info.from_address,
                    info.to_address,
                    info.contract_hash,
                    info.called_contract_hash,
                    info.amount.to_string(),
                    info.fee.to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Register (or re-arm) a resync request for a contract
    pub fn request_resync(
        &self,
        contract_hash: &str,
        from_block: i64,
        to_block: i64,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO contract (
                contract_hash, re_sync_status, re_sync_from_block, re_sync_to_block, re_sync_stat_block
            ) VALUES (?1, ?2, ?3, ?4, 0)
            ON CONFLICT(contract_hash) DO UPDATE SET
                re_sync_status = excluded.re_sync_status,
                re_sync_from_block = excluded.re_sync_from_block,
                re_sync_to_block = excluded.re_sync_to_block,
                re_sync_stat_block = 0
            "#,
            params![
                contract_hash,
                ResyncStatus::Pending.code(),
                from_block,
                to_block
            ],
        )?;
        Ok(())
    }

    /// Flag a contract for a lifetime tx count repair
    pub fn request_tx_count_repair(&self, contract_hash: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO contract (contract_hash, re_sync_status) VALUES (?1, ?2)
            ON CONFLICT(contract_hash) DO UPDATE SET re_sync_status = excluded.re_sync_status
            "#,
            params![contract_hash, ResyncStatus::RepairPending.code()],
        )?;
        Ok(())
    }

    pub fn set_token_standard(
        &self,
        contract_hash: &str,
        standard: Option<TokenStandard>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO contract (contract_hash, token_standard) VALUES (?1, ?2)
            ON CONFLICT(contract_hash) DO UPDATE SET token_standard = excluded.token_standard
            "#,
            params![contract_hash, standard.map(|s| s.as_str())],
        )?;
        Ok(())
    }

    pub fn find_address_row(
        &self,
        address: &str,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<AddressRow>, StoreError> {
        let conn = self.lock()?;
        Ok(find_address(&conn, address, token_contract_hash, date_id)?)
    }

    pub fn find_token_row(
        &self,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<TokenRow>, StoreError> {
        let conn = self.lock()?;
        Ok(find_token(&conn, token_contract_hash, date_id)?)
    }

    pub fn find_contract_row(
        &self,
        contract_hash: &str,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<ContractRow>, StoreError> {
        let conn = self.lock()?;
        Ok(find_contract(&conn, contract_hash, token_contract_hash, date_id)?)
    }

    /// Last replayed height recorded on a contract's resync request
    pub fn resync_progress(&self, contract_hash: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.lock()?;
        let progress = conn
            .query_row(
                "SELECT re_sync_stat_block FROM contract WHERE contract_hash = ?",
                [contract_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(progress)
    }
}

impl BaselineStore for SqliteAggregateStore {
    fn load_address_baseline(
        &self,
        address: &str,
        token_contract_hash: &str,
        before_epoch: i32,
    ) -> Result<Option<AddressRow>, StoreError> {
        let conn = self.lock()?;
        // Lifetime rows use non-positive date ids and are never a baseline
        let sql = format!(
            "SELECT {} FROM address_daily_aggregation
             WHERE address = ?1 AND token_contract_hash = ?2 AND date_id > 0 AND date_id < ?3
             ORDER BY date_id DESC LIMIT 1",
            ADDRESS_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(params![address, token_contract_hash, before_epoch], read_address)
            .optional()?;
        Ok(row)
    }

    fn load_address_total(
        &self,
        address: &str,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<AddressRow>, StoreError> {
        let conn = self.lock()?;
        Ok(find_address(&conn, address, token_contract_hash, date_id)?)
    }

    fn load_token_total(
        &self,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<TokenRow>, StoreError> {
        let conn = self.lock()?;
        Ok(find_token(&conn, token_contract_hash, date_id)?)
    }

    fn load_contract_total(
        &self,
        contract_hash: &str,
        token_contract_hash: &str,
        date_id: i32,
    ) -> Result<Option<ContractRow>, StoreError> {
        let conn = self.lock()?;
        Ok(find_contract(&conn, contract_hash, token_contract_hash, date_id)?)
    }
}

impl WatermarkStore for SqliteAggregateStore {
    fn load_watermark(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let height: Option<i64> = conn
            .query_row(
                "SELECT last_stat_block_height FROM current WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(height.unwrap_or(0))
    }
}

impl ContractDirectory for SqliteAggregateStore {
    fn token_standard(&self, contract_hash: &str) -> Result<Option<TokenStandard>, StoreError> {
        let conn = self.lock()?;
        let standard: Option<Option<String>> = conn
            .query_row(
                "SELECT token_standard FROM contract WHERE contract_hash = ?",
                [contract_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(standard.flatten().and_then(|s| TokenStandard::parse(&s)))
    }
}

#[async_trait]
impl SnapshotWriter for SqliteAggregateStore {
    async fn write_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        match &snapshot.resync {
            Some(resync) => {
                reconcile_rows(&tx, &snapshot.rows)?;
                tx.execute(
                    "UPDATE contract SET re_sync_stat_block = ?1 WHERE contract_hash = ?2",
                    params![snapshot.last_block_height, resync.contract_hash],
                )?;
            }
            None => {
                upsert_rows(&tx, &snapshot.rows)?;
                tx.execute(
                    r#"
                    INSERT INTO current (id, last_stat_block_height) VALUES (1, ?1)
                    ON CONFLICT(id) DO UPDATE SET last_stat_block_height = excluded.last_stat_block_height
                    "#,
                    params![snapshot.last_block_height],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    async fn write_totals(&self, snapshot: &TotalAggregationSnapshot) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        upsert_rows(&tx, &snapshot.rows)?;
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl TransactionSource for SqliteAggregateStore {
    async fn latest_block_height(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.lock()?;
        let height: Option<i64> =
            conn.query_row("SELECT MAX(block_height) FROM tx_detail", [], |row| row.get(0))?;
        Ok(height)
    }

    async fn fetch_range(&self, query: &RangeQuery) -> Result<Vec<TransactionInfo>, StoreError> {
        if query.kinds.is_empty() || query.after >= query.up_to {
            return Ok(Vec::new());
        }
        let kinds = query
            .kinds
            .iter()
            .map(|k| k.code().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            r#"
            SELECT tx_hash, block_height, block_index, tx_index, tx_time, event_type,
                   from_address, to_address, contract_hash, called_contract_hash, amount, fee
            FROM tx_detail
            WHERE block_height > ?1 AND block_height <= ?2
              AND event_type IN ({})
              AND (?3 IS NULL OR called_contract_hash = ?3)
            ORDER BY block_height, block_index, tx_index
            "#,
            kinds
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![query.after, query.up_to, query.called_contract],
            read_transaction,
        )?;
        let mut transactions = Vec::new();
        for row in rows {
            transactions.push(row?);
        }
        Ok(transactions)
    }
}

#[async_trait]
impl ResyncRequests for SqliteAggregateStore {
    async fn pending_requests(&self) -> Result<Vec<ResyncRequest>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT contract_hash, re_sync_from_block, re_sync_to_block, re_sync_stat_block
            FROM contract
            WHERE re_sync_status = ?1
            ORDER BY contract_hash
            "#,
        )?;
        let rows = stmt.query_map([ResyncStatus::Pending.code()], |row| {
            Ok(ResyncRequest {
                contract_hash: row.get(0)?,
                status: ResyncStatus::Pending,
                from_block: row.get(1)?,
                to_block: row.get(2)?,
                last_replayed_block: row.get(3)?,
            })
        })?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    async fn set_status(&self, contract_hash: &str, status: ResyncStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE contract SET re_sync_status = ?1 WHERE contract_hash = ?2",
            params![status.code(), contract_hash],
        )?;
        Ok(())
    }

    async fn repair_requests(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT contract_hash FROM contract WHERE re_sync_status = ?1 ORDER BY contract_hash",
        )?;
        let rows = stmt.query_map([ResyncStatus::RepairPending.code()], |row| row.get(0))?;
        let mut contracts = Vec::new();
        for row in rows {
            contracts.push(row?);
        }
        Ok(contracts)
    }

    async fn repair_tx_counts(
        &self,
        contract_hash: &str,
        total_date_id: i32,
    ) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let addresses = transfer_addresses(&tx, contract_hash)?;
        let mut repaired = 0;
        for address in &addresses {
            repaired += repair_address_counts(&tx, address, contract_hash, total_date_id, true)?;
            repaired +=
                repair_address_counts(&tx, address, VIRTUAL_CONTRACT_ALL, total_date_id, false)?;
        }
        tx.commit()?;
        log::debug!(
            "Repaired {} lifetime rows over {} addresses of {}",
            repaired,
            addresses.len(),
            contract_hash
        );
        Ok(repaired)
    }
}

const ADDRESS_COLUMNS: &str = "address, token_contract_hash, date_id, balance, usd_price, \
    max_balance, min_balance, deposit_tx_count, withdraw_tx_count, deposit_amount, \
    withdraw_amount, deposit_address_count, withdraw_address_count, tx_address_count, \
    fee_amount, contract_count, is_virtual, previous_balance";

const TOKEN_COLUMNS: &str = "token_contract_hash, date_id, usd_price, tx_count, tx_amount, \
    deposit_address_count, withdraw_address_count, tx_address_count, fee_amount";

const CONTRACT_COLUMNS: &str = "contract_hash, token_contract_hash, date_id, usd_price, \
    tx_count, tx_amount, deposit_address_count, withdraw_address_count, tx_address_count, \
    fee_amount";

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(text.trim())
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn read_address(row: &Row<'_>) -> rusqlite::Result<AddressRow> {
    Ok(AddressRow {
        address: row.get(0)?,
        token_contract_hash: row.get(1)?,
        date_id: row.get(2)?,
        balance: decimal_at(row, 3)?,
        usd_price: decimal_at(row, 4)?,
        max_balance: decimal_at(row, 5)?,
        min_balance: decimal_at(row, 6)?,
        deposit_tx_count: row.get(7)?,
        withdraw_tx_count: row.get(8)?,
        deposit_amount: decimal_at(row, 9)?,
        withdraw_amount: decimal_at(row, 10)?,
        deposit_address_count: row.get(11)?,
        withdraw_address_count: row.get(12)?,
        tx_address_count: row.get(13)?,
        fee_amount: decimal_at(row, 14)?,
        contract_count: row.get(15)?,
        is_virtual: row.get(16)?,
        previous_balance: decimal_at(row, 17)?,
    })
}

fn read_token(row: &Row<'_>) -> rusqlite::Result<TokenRow> {
    Ok(TokenRow {
        token_contract_hash: row.get(0)?,
        date_id: row.get(1)?,
        usd_price: decimal_at(row, 2)?,
        tx_count: row.get(3)?,
        tx_amount: decimal_at(row, 4)?,
        deposit_address_count: row.get(5)?,
        withdraw_address_count: row.get(6)?,
        tx_address_count: row.get(7)?,
        fee_amount: decimal_at(row, 8)?,
    })
}

fn read_contract(row: &Row<'_>) -> rusqlite::Result<ContractRow> {
    Ok(ContractRow {
        contract_hash: row.get(0)?,
        token_contract_hash: row.get(1)?,
        date_id: row.get(2)?,
        usd_price: decimal_at(row, 3)?,
        tx_count: row.get(4)?,
        tx_amount: decimal_at(row, 5)?,
        deposit_address_count: row.get(6)?,
        withdraw_address_count: row.get(7)?,
        tx_address_count: row.get(8)?,
        fee_amount: decimal_at(row, 9)?,
    })
}

fn read_transaction(row: &Row<'_>) -> rusqlite::Result<TransactionInfo> {
    let code: i64 = row.get(5)?;
    let kind = EventKind::from_code(code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Integer,
            format!("unknown event type {}", code).into(),
        )
    })?;
    let timestamp: i64 = row.get(4)?;
    let from_address: String = row.get(6)?;
    let to_address: String = row.get(7)?;
    let contract_hash: String = row.get(8)?;
    let called_contract_hash: String = row.get(9)?;
    Ok(TransactionInfo::new(
        row.get::<_, String>(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        timestamp,
        kind,
        from_address,
        to_address,
        contract_hash,
        called_contract_hash,
        decimal_at(row, 10)?,
        decimal_at(row, 11)?,
    ))
}

fn find_address(
    conn: &Connection,
    address: &str,
    token_contract_hash: &str,
    date_id: i32,
) -> rusqlite::Result<Option<AddressRow>> {
    let sql = format!(
        "SELECT {} FROM address_daily_aggregation
         WHERE address = ?1 AND token_contract_hash = ?2 AND date_id = ?3",
        ADDRESS_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.query_row(params![address, token_contract_hash, date_id], read_address)
        .optional()
}

fn find_token(
    conn: &Connection,
    token_contract_hash: &str,
    date_id: i32,
) -> rusqlite::Result<Option<TokenRow>> {
    let sql = format!(
        "SELECT {} FROM token_daily_aggregation WHERE token_contract_hash = ?1 AND date_id = ?2",
        TOKEN_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.query_row(params![token_contract_hash, date_id], read_token)
        .optional()
}

fn find_contract(
    conn: &Connection,
    contract_hash: &str,
    token_contract_hash: &str,
    date_id: i32,
) -> rusqlite::Result<Option<ContractRow>> {
    let sql = format!(
        "SELECT {} FROM contract_daily_aggregation
         WHERE contract_hash = ?1 AND token_contract_hash = ?2 AND date_id = ?3",
        CONTRACT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.query_row(params![contract_hash, token_contract_hash, date_id], read_contract)
        .optional()
}

fn upsert_address(conn: &Connection, row: &AddressRow) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO address_daily_aggregation (
            address, token_contract_hash, date_id, balance, usd_price,
            max_balance, min_balance, deposit_tx_count, withdraw_tx_count, deposit_amount,
            withdraw_amount, deposit_address_count, withdraw_address_count, tx_address_count,
            fee_amount, contract_count, is_virtual, previous_balance
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(address, token_contract_hash, date_id) DO UPDATE SET
            balance = excluded.balance,
            usd_price = excluded.usd_price,
            max_balance = excluded.max_balance,
            min_balance = excluded.min_balance,
            deposit_tx_count = excluded.deposit_tx_count,
            withdraw_tx_count = excluded.withdraw_tx_count,
            deposit_amount = excluded.deposit_amount,
            withdraw_amount = excluded.withdraw_amount,
            deposit_address_count = excluded.deposit_address_count,
            withdraw_address_count = excluded.withdraw_address_count,
            tx_address_count = excluded.tx_address_count,
            fee_amount = excluded.fee_amount,
            contract_count = excluded.contract_count,
            is_virtual = excluded.is_virtual,
            previous_balance = excluded.previous_balance
        "#,
    )?;
    stmt.execute(params![
        row.address,
        row.token_contract_hash,
        row.date_id,
        row.balance.to_string(),
        row.usd_price.to_string(),
        row.max_balance.to_string(),
        row.min_balance.to_string(),
        row.deposit_tx_count,
        row.withdraw_tx_count,
        row.deposit_amount.to_string(),
        row.withdraw_amount.to_string(),
        row.deposit_address_count,
        row.withdraw_address_count,
        row.tx_address_count,
        row.fee_amount.to_string(),
        row.contract_count,
        row.is_virtual,
        row.previous_balance.to_string(),
    ])
}

fn upsert_token(conn: &Connection, row: &TokenRow) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO token_daily_aggregation (
            token_contract_hash, date_id, usd_price, tx_count, tx_amount,
            deposit_address_count, withdraw_address_count, tx_address_count, fee_amount
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(token_contract_hash, date_id) DO UPDATE SET
            usd_price = excluded.usd_price,
            tx_count = excluded.tx_count,
            tx_amount = excluded.tx_amount,
            deposit_address_count = excluded.deposit_address_count,
            withdraw_address_count = excluded.withdraw_address_count,
            tx_address_count = excluded.tx_address_count,
            fee_amount = excluded.fee_amount
        "#,
    )?;
    stmt.execute(params![
        row.token_contract_hash,
        row.date_id,
        row.usd_price.to_string(),
        row.tx_count,
        row.tx_amount.to_string(),
        row.deposit_address_count,
        row.withdraw_address_count,
        row.tx_address_count,
        row.fee_amount.to_string(),
    ])
}

fn upsert_contract(conn: &Connection, row: &ContractRow) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO contract_daily_aggregation (
            contract_hash, token_contract_hash, date_id, usd_price, tx_count, tx_amount,
            deposit_address_count, withdraw_address_count, tx_address_count, fee_amount
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(contract_hash, token_contract_hash, date_id) DO UPDATE SET
            usd_price = excluded.usd_price,
            tx_count = excluded.tx_count,
            tx_amount = excluded.tx_amount,
            deposit_address_count = excluded.deposit_address_count,
            withdraw_address_count = excluded.withdraw_address_count,
            tx_address_count = excluded.tx_address_count,
            fee_amount = excluded.fee_amount
        "#,
    )?;
    stmt.execute(params![
        row.contract_hash,
        row.token_contract_hash,
        row.date_id,
        row.usd_price.to_string(),
        row.tx_count,
        row.tx_amount.to_string(),
        row.deposit_address_count,
        row.withdraw_address_count,
        row.tx_address_count,
        row.fee_amount.to_string(),
    ])
}

fn upsert_rows(conn: &Connection, rows: &SnapshotRows) -> rusqlite::Result<()> {
    for row in &rows.address_rows {
        upsert_address(conn, row)?;
    }
    for row in &rows.token_rows {
        upsert_token(conn, row)?;
    }
    for row in &rows.contract_rows {
        upsert_contract(conn, row)?;
    }
    Ok(())
}

/// Non-empty senders and receivers of the contract's transfers
fn transfer_addresses(conn: &Connection, contract_hash: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT from_address FROM tx_detail
        WHERE event_type = ?1 AND called_contract_hash = ?2 AND from_address <> ''
        UNION
        SELECT to_address FROM tx_detail
        WHERE event_type = ?1 AND called_contract_hash = ?2 AND to_address <> ''
        ORDER BY 1
        "#,
    )?;
    let rows = stmt.query_map(params![EventKind::Transfer.code(), contract_hash], |row| {
        row.get(0)
    })?;
    let mut addresses = Vec::new();
    for row in rows {
        addresses.push(row?);
    }
    Ok(addresses)
}

/// Set the lifetime tx counts of one address to the sum of its daily rows
///
/// A missing lifetime row is created from the latest daily row. With
/// `with_shadow` the `OEP_AGGREGATION_DATE_ID` row gets the same counts.
/// Addresses without daily rows are left alone.
fn repair_address_counts(
    conn: &Connection,
    address: &str,
    token_contract_hash: &str,
    total_date_id: i32,
    with_shadow: bool,
) -> rusqlite::Result<usize> {
    let sql = format!(
        "SELECT {} FROM address_daily_aggregation
         WHERE address = ?1 AND token_contract_hash = ?2 AND date_id > 0
         ORDER BY date_id",
        ADDRESS_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![address, token_contract_hash], read_address)?;

    let mut latest: Option<AddressRow> = None;
    let (mut deposit_tx_count, mut withdraw_tx_count) = (0i64, 0i64);
    let (mut deposit_amount, mut withdraw_amount) = (Decimal::ZERO, Decimal::ZERO);
    for row in rows {
        let row = row?;
        deposit_tx_count += row.deposit_tx_count;
        withdraw_tx_count += row.withdraw_tx_count;
        deposit_amount += row.deposit_amount;
        withdraw_amount += row.withdraw_amount;
        latest = Some(row);
    }
    let latest = match latest {
        Some(row) => row,
        None => return Ok(0),
    };

    let mut targets = vec![total_date_id];
    if with_shadow {
        targets.push(OEP_AGGREGATION_DATE_ID);
    }
    for date_id in &targets {
        let mut row = match find_address(conn, address, token_contract_hash, *date_id)? {
            Some(existing) => existing,
            None => AddressRow {
                date_id: *date_id,
                deposit_address_count: 0,
                withdraw_address_count: 0,
                tx_address_count: 0,
                ..latest.clone()
            },
        };
        row.deposit_tx_count = deposit_tx_count;
        row.withdraw_tx_count = withdraw_tx_count;
        row.deposit_amount = deposit_amount;
        row.withdraw_amount = withdraw_amount;
        upsert_address(conn, &row)?;
    }
    Ok(targets.len())
}

/// Merge replayed rows into stored ones so repeating a replay changes nothing
///
/// Lifetime rows (date id <= 0) are written only when absent: the replay
/// seeds them from the stored lifetime row, so merging would count the
/// replayed range twice.
fn reconcile_rows(conn: &Connection, rows: &SnapshotRows) -> rusqlite::Result<()> {
    for row in &rows.address_rows {
        let merged = match find_address(conn, &row.address, &row.token_contract_hash, row.date_id)? {
            Some(_) if row.date_id <= 0 => continue,
            Some(existing) => reconcile_address(&existing, row),
            None => row.clone(),
        };
        upsert_address(conn, &merged)?;
    }
    for row in &rows.token_rows {
        let merged = match find_token(conn, &row.token_contract_hash, row.date_id)? {
            Some(_) if row.date_id <= 0 => continue,
            Some(existing) => reconcile_token(&existing, row),
            None => row.clone(),
        };
        upsert_token(conn, &merged)?;
    }
    for row in &rows.contract_rows {
        let merged = match find_contract(
            conn,
            &row.contract_hash,
            &row.token_contract_hash,
            row.date_id,
        )? {
            Some(_) if row.date_id <= 0 => continue,
            Some(existing) => reconcile_contract(&existing, row),
            None => row.clone(),
        };
        upsert_contract(conn, &merged)?;
    }
    Ok(())
}

fn reconcile_address(existing: &AddressRow, replayed: &AddressRow) -> AddressRow {
    let mut merged = existing.clone();
    merged.deposit_tx_count = existing.deposit_tx_count.max(replayed.deposit_tx_count);
    merged.withdraw_tx_count = existing.withdraw_tx_count.max(replayed.withdraw_tx_count);
    merged.deposit_amount = existing.deposit_amount.max(replayed.deposit_amount);
    merged.withdraw_amount = existing.withdraw_amount.max(replayed.withdraw_amount);
    merged.deposit_address_count = existing
        .deposit_address_count
        .max(replayed.deposit_address_count);
    merged.withdraw_address_count = existing
        .withdraw_address_count
        .max(replayed.withdraw_address_count);
    merged.tx_address_count = existing.tx_address_count.max(replayed.tx_address_count);
    merged.fee_amount = existing.fee_amount.max(replayed.fee_amount);
    merged.contract_count = existing.contract_count.max(replayed.contract_count);

    // Only a real daily balance is re-derived by the replay
    if replayed.date_id > 0 && !replayed.is_virtual {
        merged.balance = replayed.balance;
        merged.previous_balance = replayed.previous_balance;
        merged.max_balance = replayed.max_balance;
        merged.min_balance = replayed.min_balance;
    }
    merged
}

fn reconcile_token(existing: &TokenRow, replayed: &TokenRow) -> TokenRow {
    TokenRow {
        token_contract_hash: existing.token_contract_hash.clone(),
        date_id: existing.date_id,
        usd_price: existing.usd_price,
        tx_count: existing.tx_count.max(replayed.tx_count),
        tx_amount: existing.tx_amount.max(replayed.tx_amount),
        deposit_address_count: existing
            .deposit_address_count
            .max(replayed.deposit_address_count),
        withdraw_address_count: existing
            .withdraw_address_count
            .max(replayed.withdraw_address_count),
        tx_address_count: existing.tx_address_count.max(replayed.tx_address_count),
        fee_amount: existing.fee_amount.max(replayed.fee_amount),
    }
}

fn reconcile_contract(existing: &ContractRow, replayed: &ContractRow) -> ContractRow {
    ContractRow {
        contract_hash: existing.contract_hash.clone(),
        token_contract_hash: existing.token_contract_hash.clone(),
        date_id: existing.date_id,
        usd_price: existing.usd_price,
        tx_count: existing.tx_count.max(replayed.tx_count),
        tx_amount: existing.tx_amount.max(replayed.tx_amount),
        deposit_address_count: existing
            .deposit_address_count
            .max(replayed.deposit_address_count),
        withdraw_address_count: existing
            .withdraw_address_count
            .max(replayed.withdraw_address_count),
        tx_address_count: existing.tx_address_count.max(replayed.tx_address_count),
        fee_amount: existing.fee_amount.max(replayed.fee_amount),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::resync::ReSync;
    use crate::aggregation::test_support::{address_row, transfer};
    use tempfile::NamedTempFile;

    const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    /// Helper to create a migrated test database
    fn create_test_db() -> (NamedTempFile, SqliteAggregateStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();
        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();
        (temp_file, SqliteAggregateStore::from_connection(conn))
    }

    fn token_row(token: &str, date_id: i32, tx_count: i64, tx_amount: i64) -> TokenRow {
        TokenRow {
            token_contract_hash: token.to_string(),
            date_id,
            usd_price: Decimal::ZERO,
            tx_count,
            tx_amount: Decimal::from(tx_amount),
            deposit_address_count: 1,
            withdraw_address_count: 1,
            tx_address_count: 2,
            fee_amount: Decimal::ZERO,
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();
        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();
        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();

        let watermark: i64 = conn
            .query_row("SELECT last_stat_block_height FROM current WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(watermark, 0);
    }

    #[test]
    fn test_missing_schema_dir() {
        let mut conn = Connection::open_in_memory().unwrap();
        let result = run_schema_migrations(&mut conn, "/nonexistent/schema");
        assert!(matches!(result, Err(StoreError::Schema(_))));
    }

    #[tokio::test]
    async fn test_snapshot_upsert_and_watermark() {
        // Test: plain snapshots overwrite rows and advance the watermark
        let (_temp, store) = create_test_db();

        let mut snapshot = AggregateSnapshot::new(20230101, 10, None);
        snapshot.rows.address_rows.push(address_row("X", "T", 20230101, 100));
        snapshot.rows.token_rows.push(token_row("T", 20230101, 1, 100));
        store.write_snapshot(&snapshot).await.unwrap();

        let mut later = AggregateSnapshot::new(20230101, 12, None);
        later.rows.address_rows.push(address_row("X", "T", 20230101, 40));
        store.write_snapshot(&later).await.unwrap();

        let row = store.find_address_row("X", "T", 20230101).unwrap().unwrap();
        assert_eq!(row.balance, Decimal::from(40));
        assert_eq!(store.find_token_row("T", 20230101).unwrap().unwrap().tx_count, 1);
        assert_eq!(store.load_watermark().unwrap(), 12);
    }

    #[tokio::test]
    async fn test_totals_do_not_move_watermark() {
        let (_temp, store) = create_test_db();

        let mut totals = TotalAggregationSnapshot::default();
        totals.rows.token_rows.push(token_row("T", -1, 5, 500));
        store.write_totals(&totals).await.unwrap();

        assert_eq!(store.find_token_row("T", -1).unwrap().unwrap().tx_count, 5);
        assert_eq!(store.load_watermark().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_baseline_skips_lifetime_and_later_rows() {
        let (_temp, store) = create_test_db();

        let mut snapshot = AggregateSnapshot::new(20230103, 30, None);
        for (date_id, balance) in [(20230101, 10), (20230102, 20), (20230103, 30), (-1, 99)] {
            snapshot.rows.address_rows.push(address_row("X", "T", date_id, balance));
        }
        store.write_snapshot(&snapshot).await.unwrap();

        let baseline = store.load_address_baseline("X", "T", 20230103).unwrap().unwrap();
        assert_eq!(baseline.date_id, 20230102);
        assert_eq!(baseline.balance, Decimal::from(20));

        assert!(store.load_address_baseline("X", "T", 20230101).unwrap().is_none());
        assert_eq!(
            store.load_address_total("X", "T", -1).unwrap().unwrap().balance,
            Decimal::from(99)
        );
    }

    #[tokio::test]
    async fn test_resync_snapshot_reconciles() {
        // Test: replayed daily rows take the MAX of counters and the replayed balance
        let (_temp, store) = create_test_db();
        store.request_resync("C", 1, 100).unwrap();

        let mut live = AggregateSnapshot::new(20230101, 50, None);
        let mut daily = address_row("X", "T", 20230101, 100);
        daily.deposit_tx_count = 5;
        let mut lifetime = address_row("X", "T", -1, 100);
        lifetime.deposit_tx_count = 9;
        live.rows.address_rows.push(daily);
        live.rows.address_rows.push(lifetime);
        live.rows.token_rows.push(token_row("T", 20230101, 7, 700));
        store.write_snapshot(&live).await.unwrap();

        let mut replay = AggregateSnapshot::new(20230101, 40, Some(ReSync::new("C", 1, 100)));
        let mut daily = address_row("X", "T", 20230101, 80);
        daily.deposit_tx_count = 6;
        let mut lifetime = address_row("X", "T", -1, 80);
        lifetime.deposit_tx_count = 12;
        replay.rows.address_rows.push(daily);
        replay.rows.address_rows.push(lifetime);
        replay.rows.token_rows.push(token_row("T", 20230101, 3, 900));
        store.write_snapshot(&replay).await.unwrap();
        // Replaying the same snapshot again changes nothing
        store.write_snapshot(&replay).await.unwrap();

        let daily = store.find_address_row("X", "T", 20230101).unwrap().unwrap();
        assert_eq!(daily.deposit_tx_count, 6);
        assert_eq!(daily.balance, Decimal::from(80));

        // Stored lifetime rows are left alone
        let lifetime = store.find_address_row("X", "T", -1).unwrap().unwrap();
        assert_eq!(lifetime.deposit_tx_count, 9);
        assert_eq!(lifetime.balance, Decimal::from(100));

        let token = store.find_token_row("T", 20230101).unwrap().unwrap();
        assert_eq!(token.tx_count, 7);
        assert_eq!(token.tx_amount, Decimal::from(900));

        assert_eq!(store.resync_progress("C").unwrap(), Some(40));
        // Resync snapshots never move the live watermark
        assert_eq!(store.load_watermark().unwrap(), 50);
    }

    #[tokio::test]
    async fn test_fetch_range_filters_and_orders() {
        let (_temp, store) = create_test_db();

        let mut gas = transfer("g1", 11, "X", "G", "ONG", 0);
        gas.event_kind = EventKind::Gas;
        gas.fee = Decimal::new(5, 2);
        let mut other = transfer("h3", 12, "X", "Y", "T", 3);
        other.called_contract_hash = "OTHER".to_string();
        let mut second = transfer("h2", 11, "X", "Y", "T", 2);
        second.block_index = 1;
        store
            .insert_transactions(&[
                transfer("h1", 10, "X", "Y", "T", 1),
                second,
                gas,
                other,
                transfer("h4", 20, "X", "Y", "T", 4),
            ])
            .unwrap();

        assert_eq!(store.latest_block_height().await.unwrap(), Some(20));

        let live = store.fetch_range(&RangeQuery::live(9, 12)).await.unwrap();
        let hashes: Vec<_> = live.iter().map(|t| t.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["h1", "g1", "h2", "h3"]);
        assert_eq!(live[1].fee, Decimal::new(5, 2));
        assert_eq!(live[0].date_id, 20230101);

        let replay = store.fetch_range(&RangeQuery::resync(0, 20, "T")).await.unwrap();
        let hashes: Vec<_> = replay.iter().map(|t| t.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["h1", "h2", "h4"]);
    }

    #[tokio::test]
    async fn test_resync_requests_lifecycle() {
        let (_temp, store) = create_test_db();
        store.request_resync("B", 10, 20).unwrap();
        store.request_resync("A", 0, 0).unwrap();

        let pending = store.pending_requests().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].contract_hash, "A");
        assert_eq!(pending[1].from_block, 10);

        store.set_status("A", ResyncStatus::Done).await.unwrap();
        let pending = store.pending_requests().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].contract_hash, "B");
    }

    #[tokio::test]
    async fn test_tx_count_repair_rebuilds_lifetime_rows() {
        // Test: lifetime and shadow counts become the sum of the daily rows
        let (_temp, store) = create_test_db();
        store
            .insert_transactions(&[
                transfer("h1", 10, "X", "Y", "T", 1),
                transfer("h0", 5, "", "Z", "T", 1),
            ])
            .unwrap();

        let mut first = address_row("X", "T", 20230101, 10);
        first.deposit_tx_count = 2;
        first.withdraw_tx_count = 1;
        first.withdraw_amount = Decimal::from(4);
        let mut second = address_row("X", "T", 20230102, 5);
        second.withdraw_tx_count = 3;
        second.withdraw_amount = Decimal::from(6);
        let mut stale = address_row("X", "T", -1, 7);
        stale.deposit_tx_count = 99;
        let mut shadow = address_row("X", "T", OEP_AGGREGATION_DATE_ID, 0);
        shadow.deposit_tx_count = 50;

        let mut snapshot = AggregateSnapshot::new(20230102, 10, None);
        snapshot.rows.address_rows.extend([
            first,
            second,
            stale,
            shadow,
            address_row("X", VIRTUAL_CONTRACT_ALL, 20230101, 10),
            address_row("Y", "T", 20230101, 3),
        ]);
        store.write_snapshot(&snapshot).await.unwrap();

        store.request_tx_count_repair("T").unwrap();
        assert_eq!(store.repair_requests().await.unwrap(), vec!["T".to_string()]);
        assert!(store.pending_requests().await.unwrap().is_empty());

        // X: lifetime and shadow on T, lifetime on ALL; Y: lifetime and shadow on T
        assert_eq!(store.repair_tx_counts("T", -1).await.unwrap(), 5);

        let lifetime = store.find_address_row("X", "T", -1).unwrap().unwrap();
        assert_eq!(lifetime.deposit_tx_count, 3);
        assert_eq!(lifetime.withdraw_tx_count, 4);
        assert_eq!(lifetime.deposit_amount, Decimal::from(15));
        assert_eq!(lifetime.withdraw_amount, Decimal::from(10));
        assert_eq!(lifetime.balance, Decimal::from(7));

        let shadow = store
            .find_address_row("X", "T", OEP_AGGREGATION_DATE_ID)
            .unwrap()
            .unwrap();
        assert_eq!(shadow.deposit_tx_count, 3);

        // Missing lifetime rows are created from the latest daily row
        let all = store.find_address_row("X", VIRTUAL_CONTRACT_ALL, -1).unwrap().unwrap();
        assert_eq!(all.deposit_tx_count, 1);
        assert_eq!(all.deposit_address_count, 0);
        assert_eq!(all.balance, Decimal::from(10));
        assert!(store
            .find_address_row("Y", "T", OEP_AGGREGATION_DATE_ID)
            .unwrap()
            .is_some());
        assert!(store.find_address_row("Y", VIRTUAL_CONTRACT_ALL, -1).unwrap().is_none());
        assert!(store.find_address_row("Z", "T", -1).unwrap().is_none());

        // Running it again lands on the same counts
        store.repair_tx_counts("T", -1).await.unwrap();
        let again = store.find_address_row("X", "T", -1).unwrap().unwrap();
        assert_eq!(again.deposit_tx_count, 3);
    }

    #[test]
    fn test_token_standard_lookup() {
        let (_temp, store) = create_test_db();
        store.set_token_standard("T4", Some(TokenStandard::Oep4)).unwrap();
        store.set_token_standard("TX", None).unwrap();

        assert_eq!(store.token_standard("T4").unwrap(), Some(TokenStandard::Oep4));
        assert_eq!(store.token_standard("TX").unwrap(), None);
        assert_eq!(store.token_standard("unknown").unwrap(), None);
    }
}
