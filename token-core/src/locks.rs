use crate::error::StoreError;
use crate::holder::OwnerSelector;
use crate::id::{IdentityKey, RecordId, SelectionId};
use crate::objects::{TokenRecord, TokenType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per-record reservation state kept next to a cached record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationMarker {
    /// Nobody has claimed the record
    Free,
    /// The record is claimed by the given selection
    Reserved(SelectionId),
}

impl ReservationMarker {
    pub fn is_free(&self) -> bool {
        matches!(self, ReservationMarker::Free)
    }

    /// The selection holding the record, if any
    pub fn holder(&self) -> Option<SelectionId> {
        match self {
            ReservationMarker::Free => None,
            ReservationMarker::Reserved(id) => Some(*id),
        }
    }
}

/// Whether soft locked records are visible to a store query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockFilter {
    /// Only records without a soft lock
    UnlockedOnly,
    /// Locked and unlocked records alike
    IncludeLocked,
}

/// Filters for a store query over unconsumed records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreQuery {
    /// Whose records to return
    pub owner: OwnerSelector,

    /// Records must hold exactly this token type
    pub token_type: TokenType,

    /// Records must have been issued by this identity, if set
    pub issuer: Option<IdentityKey>,

    /// Whether soft locked records are returned
    pub lock_filter: LockFilter,

    /// The querying selection. Its own soft locks do not hide records from
    /// an `UnlockedOnly` query.
    pub lock_id: Option<SelectionId>,
}

/// One page of a store query, sorted by record id ascending
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPage {
    /// Records on this page
    pub records: Vec<TokenRecord>,

    /// Total number of records matching the query across all pages
    pub total_available: u64,
}

/// Durable store of unconsumed records with soft locks.
///
/// Concurrency control is delegated to the store: `soft_lock` must be a single
/// conditional update that other queriers observe.
#[async_trait]
pub trait TokenStore: std::fmt::Debug + Send + Sync {
    /// Query a page of unconsumed records
    ///
    /// # Parameters
    /// * `query` - Owner, token type, issuer and lock filters
    /// * `page` - Zero based page number
    /// * `page_size` - Maximum number of records per page
    ///
    /// # Returns
    /// The page of records ordered by record id ascending
    async fn query_unconsumed(
        &self,
        query: &StoreQuery,
        page: u32,
        page_size: u32,
    ) -> Result<TokenPage, StoreError>;

    /// Soft lock records for a selection
    ///
    /// # Parameters
    /// * `lock_id` - The selection claiming the records
    /// * `record_ids` - The records to lock
    ///
    /// # Returns
    /// * `Ok(true)` - Every record is now locked by `lock_id`
    /// * `Ok(false)` - At least one record was consumed or locked by another selection;
    ///   nothing was changed
    /// * `Err` - The store failed
    async fn soft_lock(
        &self,
        lock_id: &SelectionId,
        record_ids: &[RecordId],
    ) -> Result<bool, StoreError>;

    /// Release soft locks held by a selection
    ///
    /// # Parameters
    /// * `lock_id` - The selection releasing the records
    /// * `record_ids` - The records to release; records locked by others are left alone
    ///
    /// # Returns
    /// The number of locks released
    async fn soft_unlock(
        &self,
        lock_id: &SelectionId,
        record_ids: &[RecordId],
    ) -> Result<usize, StoreError>;
}
