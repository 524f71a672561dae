use crate::config::DatabaseSelectionConfig;
use crate::query::TokenQueryBy;
use crate::selection::{Selector, SelectorKind};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use token_core::error::SelectionError;
use token_core::holder::OwnerSelector;
use token_core::id::{RecordId, SelectionId};
use token_core::locks::{LockFilter, StoreQuery, TokenStore};
use token_core::objects::{Amount, TokenRecord, TokenType};
use tokio_util::sync::CancellationToken;

/// Selection against the durable store.
///
/// Each attempt pages through unlocked records in record id order until the
/// requested amount is covered, then soft locks them in one conditional
/// update. A short or contended attempt is retried after a randomized
/// exponential backoff. Nothing is held while sleeping.
pub struct PersistentSelector {
    store: Arc<dyn TokenStore>,
    config: DatabaseSelectionConfig,
}

impl PersistentSelector {
    pub fn new(
        store: Arc<dyn TokenStore>,
        config: DatabaseSelectionConfig,
    ) -> Result<Self, SelectionError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &DatabaseSelectionConfig {
        &self.config
    }

    /// Select and soft lock records covering `required`
    ///
    /// # Parameters
    /// * `lock_id` - The selection that will own the soft locks
    /// * `owner` - The holder or holders to select from
    /// * `required` - Quantity and exact token type to cover
    /// * `query` - Issuer (pushed into the store query), predicate (applied
    ///   after locking) and shortfall options
    /// * `cancel` - Aborts the backoff wait
    ///
    /// # Returns
    /// The locked records that pass the predicate. Records that fail it stay
    /// locked by `lock_id`.
    pub async fn select_tokens(
        &self,
        lock_id: &SelectionId,
        owner: &OwnerSelector,
        required: &Amount<TokenType>,
        query: &TokenQueryBy,
        cancel: &CancellationToken,
    ) -> Result<Vec<TokenRecord>, SelectionError> {
        if required.quantity == 0 {
            return Ok(Vec::new());
        }

        let store_query = StoreQuery {
            owner: owner.clone(),
            token_type: required.token.clone(),
            issuer: query.issuer,
            lock_filter: LockFilter::UnlockedOnly,
            lock_id: Some(*lock_id),
        };

        for attempt in 1..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(SelectionError::Cancelled);
            }

            let (candidates, total) = self.collect(&store_query, required.quantity).await?;
            let last_attempt = attempt == self.config.max_retries;
            let covered = total >= required.quantity;

            if covered || (last_attempt && query.allow_shortfall && !candidates.is_empty()) {
                let ids: Vec<RecordId> = candidates.iter().map(|r| r.id).collect();
                if self.store.soft_lock(lock_id, &ids).await? {
                    info!(
                        "Soft locked {} records totalling {} for {} on attempt {}",
                        ids.len(),
                        total,
                        lock_id,
                        attempt
                    );
                    return Ok(candidates.into_iter().filter(|r| query.matches(r)).collect());
                }
                debug!(
                    "Soft lock for {} lost a race on attempt {} of {}",
                    lock_id, attempt, self.config.max_retries
                );
            } else {
                debug!(
                    "Attempt {} of {} for {} found {} of {}",
                    attempt, self.config.max_retries, lock_id, total, required
                );
            }

            if last_attempt {
                break;
            }

            let delay = self.config.backoff_delay(attempt, rand::random::<f64>());
            tokio::select! {
                _ = cancel.cancelled() => return Err(SelectionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if query.allow_shortfall {
            warn!(
                "No records could be locked for {} after {} attempts",
                lock_id, self.config.max_retries
            );
            return Ok(Vec::new());
        }
        Err(self.insufficient(&store_query, required).await?)
    }

    /// Release soft locks held by `lock_id`
    pub async fn unlock(
        &self,
        lock_id: &SelectionId,
        records: &[TokenRecord],
    ) -> Result<usize, SelectionError> {
        let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        let released = self.store.soft_unlock(lock_id, &ids).await?;
        if released < ids.len() {
            debug!(
                "Released {} of {} soft locks for {}",
                released,
                ids.len(),
                lock_id
            );
        }
        Ok(released)
    }

    /// Page through the query until `target` is covered or records run out
    async fn collect(
        &self,
        query: &StoreQuery,
        target: u64,
    ) -> Result<(Vec<TokenRecord>, u64), SelectionError> {
        let page_size = self.config.page_size;
        let mut records = Vec::new();
        let mut total = 0u64;
        let mut page_number = 0u32;

        loop {
            let page = self
                .store
                .query_unconsumed(query, page_number, page_size)
                .await?;
            let fetched = page.records.len();

            for record in page.records {
                total = total
                    .checked_add(record.quantity)
                    .ok_or(SelectionError::AmountOverflow)?;
                records.push(record);
                if total >= target {
                    return Ok((records, total));
                }
            }

            let seen = u64::from(page_number + 1) * u64::from(page_size);
            if fetched < page_size as usize || seen >= page.total_available {
                return Ok((records, total));
            }
            page_number += 1;
        }
    }

    /// The error for a request that could not be met: unlocked shortfall if
    /// locked records would have covered it, plain shortfall otherwise
    async fn insufficient(
        &self,
        query: &StoreQuery,
        required: &Amount<TokenType>,
    ) -> Result<SelectionError, SelectionError> {
        let including_locked = StoreQuery {
            lock_filter: LockFilter::IncludeLocked,
            ..query.clone()
        };
        let (_, total) = self.collect(&including_locked, required.quantity).await?;

        let description = format!("{} held by {}", required, query.owner);
        if total >= required.quantity {
            Ok(SelectionError::InsufficientUnlockedBalance(description))
        } else {
            Ok(SelectionError::InsufficientBalance(description))
        }
    }
}

impl std::fmt::Debug for PersistentSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentSelector")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Selector for PersistentSelector {
    fn kind(&self) -> SelectorKind {
        SelectorKind::Database
    }

    async fn select_tokens(
        &self,
        selection_id: &SelectionId,
        owner: &OwnerSelector,
        required: &Amount<TokenType>,
        query: &TokenQueryBy,
        cancel: &CancellationToken,
    ) -> Result<Vec<TokenRecord>, SelectionError> {
        PersistentSelector::select_tokens(self, selection_id, owner, required, query, cancel).await
    }

    async fn release(
        &self,
        selection_id: &SelectionId,
        records: &[TokenRecord],
    ) -> Result<(), SelectionError> {
        self.unlock(selection_id, records).await.map(|_| ())
    }

    async fn restore(
        &self,
        selection_id: &SelectionId,
        records: &[TokenRecord],
    ) -> Result<(), SelectionError> {
        // Soft locks live in the store and survive the handle
        debug!(
            "Restored selection {} with {} store-held locks",
            selection_id,
            records.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use token_core::error::StoreError;
    use token_core::holder::Holder;
    use token_core::id::IdentityKey;
    use token_core::locks::TokenPage;

    fn gbp() -> TokenType {
        TokenType::new("FiatCurrency", "GBP", 2)
    }

    fn fast_config(max_retries: u32, page_size: u32) -> DatabaseSelectionConfig {
        DatabaseSelectionConfig {
            max_retries,
            retry_sleep_ms: 1,
            retry_cap_ms: 4,
            page_size,
        }
    }

    /// In-memory stand-in for the durable store
    #[derive(Debug, Default)]
    struct MockTokenStore {
        records: Mutex<Vec<(TokenRecord, Option<SelectionId>)>>,
        /// Number of leading queries answered with an empty page, as if the
        /// store view were stale
        stale_queries: AtomicUsize,
        /// Number of leading soft lock calls that lose to another selection
        lost_locks: AtomicUsize,
        offline: bool,
        queries: AtomicUsize,
        lock_calls: AtomicUsize,
    }

    impl MockTokenStore {
        fn with_records(records: Vec<TokenRecord>) -> Self {
            let mut records: Vec<_> = records.into_iter().map(|r| (r, None)).collect();
            records.sort_by_key(|(r, _)| r.id);
            Self {
                records: Mutex::new(records),
                ..Default::default()
            }
        }

        fn lock_of(&self, id: &RecordId) -> Option<SelectionId> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|(r, _)| r.id == *id)
                .and_then(|(_, lock)| *lock)
        }

        fn lock_all(&self, lock_id: SelectionId) {
            for (_, lock) in self.records.lock().unwrap().iter_mut() {
                *lock = Some(lock_id);
            }
        }

        fn matches(query: &StoreQuery, record: &TokenRecord, lock: &Option<SelectionId>) -> bool {
            let owned = query.owner.holders().iter().any(|holder| match holder {
                Holder::KeyIdentity(key) => record.owner == *key,
                Holder::TokenOnly => true,
                _ => false,
            });
            owned
                && record.token_type == query.token_type
                && query.issuer.map_or(true, |issuer| record.issuer == issuer)
                && (query.lock_filter == LockFilter::IncludeLocked
                    || lock.is_none()
                    || *lock == query.lock_id)
        }
    }

    #[async_trait]
    impl TokenStore for MockTokenStore {
        async fn query_unconsumed(
            &self,
            query: &StoreQuery,
            page: u32,
            page_size: u32,
        ) -> Result<TokenPage, StoreError> {
            if self.offline {
                return Err(StoreError::Connectivity("store unreachable".to_string()));
            }
            self.queries.fetch_add(1, Ordering::SeqCst);
            let stale = self
                .stale_queries
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stale {
                return Ok(TokenPage::default());
            }

            let records = self.records.lock().unwrap();
            let matching: Vec<TokenRecord> = records
                .iter()
                .filter(|(r, lock)| Self::matches(query, r, lock))
                .map(|(r, _)| r.clone())
                .collect();
            Ok(TokenPage {
                total_available: matching.len() as u64,
                records: matching
                    .into_iter()
                    .skip((page * page_size) as usize)
                    .take(page_size as usize)
                    .collect(),
            })
        }

        async fn soft_lock(
            &self,
            lock_id: &SelectionId,
            record_ids: &[RecordId],
        ) -> Result<bool, StoreError> {
            self.lock_calls.fetch_add(1, Ordering::SeqCst);
            let lost = self
                .lost_locks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lost {
                return Ok(false);
            }

            let mut records = self.records.lock().unwrap();
            let lockable = record_ids.iter().all(|id| {
                records
                    .iter()
                    .any(|(r, lock)| r.id == *id && lock.map_or(true, |l| l == *lock_id))
            });
            if !lockable {
                return Ok(false);
            }
            for (record, lock) in records.iter_mut() {
                if record_ids.contains(&record.id) {
                    *lock = Some(*lock_id);
                }
            }
            Ok(true)
        }

        async fn soft_unlock(
            &self,
            lock_id: &SelectionId,
            record_ids: &[RecordId],
        ) -> Result<usize, StoreError> {
            let mut released = 0;
            for (record, lock) in self.records.lock().unwrap().iter_mut() {
                if record_ids.contains(&record.id) && *lock == Some(*lock_id) {
                    *lock = None;
                    released += 1;
                }
            }
            Ok(released)
        }
    }

    fn records(owner: IdentityKey, quantities: &[u64]) -> Vec<TokenRecord> {
        quantities
            .iter()
            .map(|q| TokenRecord::new(RecordId::unique_for_tests(), owner, owner, gbp(), *q).unwrap())
            .collect()
    }

    async fn select(
        selector: &PersistentSelector,
        lock_id: &SelectionId,
        owner: IdentityKey,
        quantity: u64,
        query: &TokenQueryBy,
    ) -> Result<Vec<TokenRecord>, SelectionError> {
        selector
            .select_tokens(
                lock_id,
                &owner.into(),
                &Amount::new(quantity, gbp()),
                query,
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_pages_until_amount_is_covered() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[10, 10, 10, 10, 10])));
        let selector = PersistentSelector::new(store.clone(), fast_config(8, 2)).unwrap();
        let lock_id = SelectionId::random();

        let selected = select(&selector, &lock_id, owner, 25, &TokenQueryBy::new())
            .await
            .unwrap();
        assert_eq!(selected.len(), 3);
        // The first page of two records fell short, the second covered the rest
        assert_eq!(store.queries.load(Ordering::SeqCst), 2);
        let ids: Vec<RecordId> = selected.iter().map(|r| r.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        for record in &selected {
            assert_eq!(store.lock_of(&record.id), Some(lock_id));
        }
    }

    #[tokio::test]
    async fn test_stale_view_is_retried() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[100, 50, 25])));
        store.stale_queries.store(2, Ordering::SeqCst);
        let selector = PersistentSelector::new(store.clone(), fast_config(8, 200)).unwrap();

        let selected = select(&selector, &SelectionId::random(), owner, 160, &TokenQueryBy::new())
            .await
            .unwrap();
        assert_eq!(selected.iter().map(|r| r.quantity).sum::<u64>(), 175);
        assert_eq!(store.queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lost_soft_lock_race_is_retried() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[40])));
        store.lost_locks.store(1, Ordering::SeqCst);
        let selector = PersistentSelector::new(store.clone(), fast_config(3, 200)).unwrap();
        let lock_id = SelectionId::random();

        let selected = select(&selector, &lock_id, owner, 40, &TokenQueryBy::new())
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(store.lock_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.lock_of(&selected[0].id), Some(lock_id));
    }

    #[tokio::test]
    async fn test_insufficient_after_max_retries() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[100, 50, 25])));
        let selector = PersistentSelector::new(store.clone(), fast_config(4, 200)).unwrap();

        let err = select(&selector, &SelectionId::random(), owner, 176, &TokenQueryBy::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::InsufficientBalance(_)));
        // Four attempts plus the final check including locked records
        assert_eq!(store.queries.load(Ordering::SeqCst), 5);
        assert_eq!(store.lock_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_locked_records_give_unlocked_shortfall() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[100, 50])));
        store.lock_all(SelectionId::random());
        let selector = PersistentSelector::new(store, fast_config(2, 200)).unwrap();

        let err = select(&selector, &SelectionId::random(), owner, 120, &TokenQueryBy::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::InsufficientUnlockedBalance(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_records_already_locked_by_selection_are_reselected() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[100, 50])));
        let lock_id = SelectionId::random();
        store.lock_all(lock_id);
        let selector = PersistentSelector::new(store.clone(), fast_config(2, 200)).unwrap();

        let selected = select(&selector, &lock_id, owner, 120, &TokenQueryBy::new())
            .await
            .unwrap();
        assert_eq!(selected.iter().map(|r| r.quantity).sum::<u64>(), 150);
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_allow_shortfall_locks_partial_set() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[10, 20])));
        let selector = PersistentSelector::new(store.clone(), fast_config(2, 200)).unwrap();
        let lock_id = SelectionId::random();

        let selected = select(
            &selector,
            &lock_id,
            owner,
            100,
            &TokenQueryBy::new().allow_shortfall(),
        )
        .await
        .unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(store.lock_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_predicate_filters_after_locking() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[10, 20])));
        let selector = PersistentSelector::new(store.clone(), fast_config(2, 200)).unwrap();
        let lock_id = SelectionId::random();

        let selected = select(
            &selector,
            &lock_id,
            owner,
            30,
            &TokenQueryBy::new().predicate(|r| r.quantity == 20),
        )
        .await
        .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].quantity, 20);

        // The filtered out record is still locked by this selection
        let all = store.records.lock().unwrap().clone();
        assert!(all.iter().all(|(_, lock)| *lock == Some(lock_id)));
    }

    #[tokio::test]
    async fn test_connectivity_errors_are_not_retried() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore {
            offline: true,
            ..MockTokenStore::with_records(records(owner, &[10]))
        });
        let selector = PersistentSelector::new(store, fast_config(8, 200)).unwrap();

        let err = select(&selector, &SelectionId::random(), owner, 5, &TokenQueryBy::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SelectionError::Store(StoreError::Connectivity(_))
        ));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[10])));
        let config = DatabaseSelectionConfig {
            max_retries: 8,
            retry_sleep_ms: 60_000,
            retry_cap_ms: 120_000,
            page_size: 200,
        };
        let selector = PersistentSelector::new(store.clone(), config).unwrap();
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            selector.select_tokens(
                &SelectionId::random(),
                &owner.into(),
                &Amount::new(50, gbp()),
                &TokenQueryBy::new(),
                &cancel,
            ),
        )
        .await
        .unwrap();
        canceller.await.unwrap();

        assert!(matches!(result, Err(SelectionError::Cancelled)));
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_amount_does_not_touch_store() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[10])));
        let selector = PersistentSelector::new(store.clone(), fast_config(8, 200)).unwrap();

        let selected = select(&selector, &SelectionId::random(), owner, 0, &TokenQueryBy::new())
            .await
            .unwrap();
        assert!(selected.is_empty());
        assert_eq!(store.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let owner = IdentityKey::unique_for_tests();
        let store = Arc::new(MockTokenStore::with_records(records(owner, &[10, 20])));
        let selector = PersistentSelector::new(store.clone(), fast_config(8, 200)).unwrap();
        let lock_id = SelectionId::random();

        let selected = select(&selector, &lock_id, owner, 30, &TokenQueryBy::new())
            .await
            .unwrap();
        assert_eq!(selector.unlock(&lock_id, &selected).await.unwrap(), 2);
        assert_eq!(selector.unlock(&lock_id, &selected).await.unwrap(), 0);
        assert!(store.lock_of(&selected[0].id).is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store = Arc::new(MockTokenStore::default());
        assert!(matches!(
            PersistentSelector::new(store, fast_config(0, 200)),
            Err(SelectionError::Config(_))
        ));
    }
}
