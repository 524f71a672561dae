use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use token_core::error::StoreError;
use token_core::holder::Holder;
use token_core::id::{IdentityKey, RecordId, SelectionId};
use token_core::locks::{LockFilter, StoreQuery, TokenPage, TokenStore};
use token_core::objects::{LedgerUpdate, TokenRecord, TokenType};
use uuid::Uuid;

/// SQL query constants to avoid repetition
mod sql {
    pub const CREATE_RECORDS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS token_records (
            tx_hash BLOB NOT NULL,
            output_index INTEGER NOT NULL,
            owner BLOB NOT NULL,
            owner_hash TEXT NOT NULL,
            issuer BLOB NOT NULL,
            token_class TEXT NOT NULL,
            token_identifier TEXT NOT NULL,
            fraction_digits INTEGER NOT NULL,
            quantity INTEGER NOT NULL,
            consumed INTEGER NOT NULL DEFAULT 0,
            lock_id TEXT,
            locked_at INTEGER,
            PRIMARY KEY (tx_hash, output_index)
        );
    "#;

    pub const CREATE_RECORDS_INDEX: &str = r#"
        CREATE INDEX IF NOT EXISTS idx_token_records_type
        ON token_records(token_class, token_identifier, consumed, lock_id);
    "#;

    pub const CREATE_EXTERNAL_IDS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS key_external_ids (
            key_hash TEXT PRIMARY KEY,
            external_id TEXT NOT NULL
        );
    "#;

    pub const INSERT_RECORD: &str = r#"
        INSERT OR IGNORE INTO token_records
            (tx_hash, output_index, owner, owner_hash, issuer, token_class,
             token_identifier, fraction_digits, quantity)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#;

    pub const CONSUME_RECORD: &str = r#"
        UPDATE token_records
        SET consumed = 1, lock_id = NULL, locked_at = NULL
        WHERE tx_hash = ? AND output_index = ?
    "#;

    pub const LOCK_RECORD: &str = r#"
        UPDATE token_records
        SET lock_id = ?, locked_at = ?
        WHERE tx_hash = ? AND output_index = ?
          AND consumed = 0
          AND (lock_id IS NULL OR lock_id = ?)
    "#;

    pub const UNLOCK_RECORD: &str = r#"
        UPDATE token_records
        SET lock_id = NULL, locked_at = NULL
        WHERE tx_hash = ? AND output_index = ? AND lock_id = ?
    "#;

    pub const GET_LOCK: &str = r#"
        SELECT lock_id FROM token_records
        WHERE tx_hash = ? AND output_index = ?
    "#;

    pub const RELEASE_EXPIRED_LOCKS: &str = r#"
        UPDATE token_records
        SET lock_id = NULL, locked_at = NULL
        WHERE lock_id IS NOT NULL AND locked_at <= ?
    "#;

    pub const UPSERT_EXTERNAL_ID: &str = r#"
        INSERT INTO key_external_ids (key_hash, external_id)
        VALUES (?, ?)
        ON CONFLICT(key_hash) DO UPDATE SET external_id = excluded.external_id
    "#;

    pub const GET_EXTERNAL_ID: &str = r#"
        SELECT external_id FROM key_external_ids WHERE key_hash = ?
    "#;

    pub const SELECT_RECORD_COLUMNS: &str = r#"
        SELECT tx_hash, output_index, owner, issuer, token_class,
               token_identifier, fraction_digits, quantity
        FROM token_records
    "#;
}

/// A SQLite-backed durable token store using sqlx.
///
/// Soft locks live in the `token_records` table itself, so a lock taken by one
/// selector is visible to every other querier of the same database.
pub struct SqliteTokenStore {
    pool: SqlitePool,
}

impl SqliteTokenStore {
    /// Open (or create) a database file and initialize its schema
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}", path.as_ref().to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| StoreError::Connectivity(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connectivity(format!("Failed to connect to database: {}", e)))?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Open a private in-memory database. A single connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connectivity(format!("Invalid database URL: {}", e)))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connectivity(format!("Failed to open database: {}", e)))?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The schema is not created; call `initialize`.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema
    pub async fn initialize(&self) -> Result<(), StoreError> {
        for statement in [
            sql::CREATE_RECORDS_TABLE,
            sql::CREATE_RECORDS_INDEX,
            sql::CREATE_EXTERNAL_IDS_TABLE,
        ] {
            sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                StoreError::Database(format!("Failed to initialize schema: {}", e))
            })?;
        }
        Ok(())
    }

    /// Close the pool. Later calls fail with a connectivity error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Record unconsumed records. Records already known are left untouched.
    pub async fn insert_records(&self, records: &[TokenRecord]) -> Result<(), StoreError> {
        self.record_update(&LedgerUpdate::produced(records.to_vec()))
            .await
    }

    /// Apply a ledger update: mark consumed records (dropping their locks)
    /// and insert produced ones, atomically.
    pub async fn record_update(&self, update: &LedgerUpdate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for record in &update.consumed {
            let result = sqlx::query(sql::CONSUME_RECORD)
                .bind(&record.id.tx_hash[..])
                .bind(record.id.index as i64)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                warn!("Consumed record {} was not known to the store", record.id);
            }
        }

        for record in &update.produced {
            let quantity = i64::try_from(record.quantity).map_err(|_| {
                StoreError::Serialization(format!(
                    "Quantity {} of record {} does not fit the store",
                    record.quantity, record.id
                ))
            })?;
            sqlx::query(sql::INSERT_RECORD)
                .bind(&record.id.tx_hash[..])
                .bind(record.id.index as i64)
                .bind(record.owner.bytes())
                .bind(record.owner.short_hash())
                .bind(record.issuer.bytes())
                .bind(record.token_type.token_class.as_str())
                .bind(record.token_type.token_identifier.as_str())
                .bind(record.token_type.fraction_digits as i64)
                .bind(quantity)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Register an owning key under an external id (account style ownership)
    pub async fn map_external_id(
        &self,
        key: &IdentityKey,
        external_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(sql::UPSERT_EXTERNAL_ID)
            .bind(key.short_hash())
            .bind(external_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Look up the external id an owning key is registered under
    pub async fn external_id_for_key(&self, key: &IdentityKey) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(sql::GET_EXTERNAL_ID)
            .bind(key.short_hash())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let text: String = row.try_get("external_id")?;
                let uuid = Uuid::parse_str(&text)
                    .map_err(|e| StoreError::Serialization(format!("Bad external id: {}", e)))?;
                Ok(Some(uuid))
            }
            None => Ok(None),
        }
    }

    /// The selection currently holding a soft lock on a record, if any
    pub async fn lock_holder(&self, record_id: &RecordId) -> Result<Option<SelectionId>, StoreError> {
        let row = sqlx::query(sql::GET_LOCK)
            .bind(&record_id.tx_hash[..])
            .bind(record_id.index as i64)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("record {}", record_id)));
        };
        let lock: Option<String> = row.try_get("lock_id")?;
        lock.map(|text| {
            SelectionId::from_str(&text)
                .map_err(|e| StoreError::Serialization(format!("Bad lock id: {}", e)))
        })
        .transpose()
    }

    /// Clear soft locks older than `max_age`
    ///
    /// # Returns
    /// The number of locks released
    pub async fn release_expired_locks(&self, max_age: Duration) -> Result<usize, StoreError> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(max_age_ms);

        let result = sqlx::query(sql::RELEASE_EXPIRED_LOCKS)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to release expired locks: {}", e)))?;

        let released = result.rows_affected() as usize;
        if released > 0 {
            debug!("Released {} expired soft locks", released);
        }
        Ok(released)
    }

    /// Append the WHERE clause shared by page and count queries
    fn push_filters<'a>(qb: &mut QueryBuilder<'a, Sqlite>, query: &'a StoreQuery) {
        qb.push(" WHERE consumed = 0 AND token_class = ");
        qb.push_bind(query.token_type.token_class.as_str());
        qb.push(" AND token_identifier = ");
        qb.push_bind(query.token_type.token_identifier.as_str());
        qb.push(" AND fraction_digits = ");
        qb.push_bind(query.token_type.fraction_digits as i64);

        if let Some(issuer) = &query.issuer {
            qb.push(" AND issuer = ");
            qb.push_bind(issuer.bytes());
        }

        if query.lock_filter == LockFilter::UnlockedOnly {
            match &query.lock_id {
                Some(lock_id) => {
                    qb.push(" AND (lock_id IS NULL OR lock_id = ");
                    qb.push_bind(lock_id.to_string());
                    qb.push(")");
                }
                None => {
                    qb.push(" AND lock_id IS NULL");
                }
            }
        }

        let holders = query.owner.holders();
        if holders.is_empty() {
            qb.push(" AND 0");
            return;
        }

        qb.push(" AND (");
        for (i, holder) in holders.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            match holder {
                Holder::KeyIdentity(key) => {
                    qb.push("owner = ");
                    qb.push_bind(key.bytes());
                }
                Holder::MappedIdentity(external_id) => {
                    qb.push("owner_hash IN (SELECT key_hash FROM key_external_ids WHERE external_id = ");
                    qb.push_bind(external_id.to_string());
                    qb.push(")");
                }
                Holder::UnmappedIdentity => {
                    qb.push("owner_hash NOT IN (SELECT key_hash FROM key_external_ids)");
                }
                Holder::TokenOnly => {
                    qb.push("1");
                }
            }
        }
        qb.push(")");
    }

    /// Convert a sqlx Row to a TokenRecord
    fn row_to_record(row: &SqliteRow) -> Result<TokenRecord, StoreError> {
        let tx_hash: Vec<u8> = row.try_get("tx_hash")?;
        let tx_hash: [u8; 32] = tx_hash.as_slice().try_into().map_err(|_| {
            StoreError::Serialization(format!("Invalid transaction hash length: {}", tx_hash.len()))
        })?;
        let index: i64 = row.try_get("output_index")?;
        let owner: Vec<u8> = row.try_get("owner")?;
        let issuer: Vec<u8> = row.try_get("issuer")?;
        let token_class: String = row.try_get("token_class")?;
        let token_identifier: String = row.try_get("token_identifier")?;
        let fraction_digits: i64 = row.try_get("fraction_digits")?;
        let quantity: i64 = row.try_get("quantity")?;

        let bad = |what: &str| StoreError::Serialization(format!("Invalid {} in token record row", what));

        Ok(TokenRecord {
            id: RecordId::new(tx_hash, u32::try_from(index).map_err(|_| bad("output index"))?),
            owner: IdentityKey::from_slice(&owner).ok_or_else(|| bad("owner"))?,
            issuer: IdentityKey::from_slice(&issuer).ok_or_else(|| bad("issuer"))?,
            token_type: TokenType::new(
                token_class,
                token_identifier,
                u32::try_from(fraction_digits).map_err(|_| bad("fraction digits"))?,
            ),
            quantity: u64::try_from(quantity)
                .ok()
                .filter(|q| *q > 0)
                .ok_or_else(|| bad("quantity"))?,
        })
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn query_unconsumed(
        &self,
        query: &StoreQuery,
        page: u32,
        page_size: u32,
    ) -> Result<TokenPage, StoreError> {
        let mut count = QueryBuilder::new("SELECT COUNT(*) AS total FROM token_records");
        Self::push_filters(&mut count, query);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("total")?;

        let mut select = QueryBuilder::new(sql::SELECT_RECORD_COLUMNS);
        Self::push_filters(&mut select, query);
        select.push(" ORDER BY tx_hash ASC, output_index ASC LIMIT ");
        select.push_bind(page_size as i64);
        select.push(" OFFSET ");
        select.push_bind(page as i64 * page_size as i64);

        let rows = select.build().fetch_all(&self.pool).await?;
        let records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TokenPage {
            records,
            total_available: total.max(0) as u64,
        })
    }

    async fn soft_lock(
        &self,
        lock_id: &SelectionId,
        record_ids: &[RecordId],
    ) -> Result<bool, StoreError> {
        if record_ids.is_empty() {
            return Ok(true);
        }

        let lock = lock_id.to_string();
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for record_id in record_ids {
            let result = sqlx::query(sql::LOCK_RECORD)
                .bind(lock.as_str())
                .bind(now)
                .bind(&record_id.tx_hash[..])
                .bind(record_id.index as i64)
                .bind(lock.as_str())
                .execute(&mut *tx)
                .await?;

            if result.rows_affected() == 0 {
                debug!(
                    "Soft lock for {} lost the race on record {}",
                    lock_id, record_id
                );
                tx.rollback().await?;
                return Ok(false);
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn soft_unlock(
        &self,
        lock_id: &SelectionId,
        record_ids: &[RecordId],
    ) -> Result<usize, StoreError> {
        let lock = lock_id.to_string();
        let mut tx = self.pool.begin().await?;
        let mut released = 0usize;

        for record_id in record_ids {
            let result = sqlx::query(sql::UNLOCK_RECORD)
                .bind(&record_id.tx_hash[..])
                .bind(record_id.index as i64)
                .bind(lock.as_str())
                .execute(&mut *tx)
                .await?;
            released += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(released)
    }
}

impl std::fmt::Debug for SqliteTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTokenStore").finish()
    }
}
