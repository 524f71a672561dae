use crate::config::InMemorySelectionConfig;
use crate::index::{ReleaseOutcome, ReservationIndex, ReservationInvalidated};
use crate::indexing::OwnerResolver;
use crate::query::TokenQueryBy;
use crate::scheduler::UnlockScheduler;
use crate::selection::{Selector, SelectorKind};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use token_core::error::SelectionError;
use token_core::holder::{Holder, IndexKey, OwnerSelector};
use token_core::id::SelectionId;
use token_core::objects::{Amount, LedgerUpdate, TokenRecord, TokenType};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Snapshot of unconsumed records plus the feed of later ledger updates
#[derive(Debug)]
pub struct TokenObserver {
    pub initial: Vec<TokenRecord>,
    pub updates: mpsc::UnboundedReceiver<LedgerUpdate>,
}

impl TokenObserver {
    pub fn new(initial: Vec<TokenRecord>, updates: mpsc::UnboundedReceiver<LedgerUpdate>) -> Self {
        Self { initial, updates }
    }

    /// Observer over `initial`, with the sender that feeds it updates
    pub fn channel(initial: Vec<TokenRecord>) -> (mpsc::UnboundedSender<LedgerUpdate>, Self) {
        let (sender, updates) = mpsc::unbounded_channel();
        (sender, Self::new(initial, updates))
    }
}

/// Records reserved by an in-flight selection. Dropping the guard releases
/// them, so an early return or a panic in a predicate never leaves records
/// reserved.
struct PendingReservations<'a> {
    index: &'a ReservationIndex,
    selection_id: SelectionId,
    records: Vec<Arc<TokenRecord>>,
}

impl<'a> PendingReservations<'a> {
    fn new(index: &'a ReservationIndex, selection_id: SelectionId) -> Self {
        Self {
            index,
            selection_id,
            records: Vec::new(),
        }
    }

    fn push(&mut self, record: Arc<TokenRecord>) {
        self.records.push(record);
    }

    fn commit(mut self) -> Vec<TokenRecord> {
        std::mem::take(&mut self.records)
            .into_iter()
            .map(|record| (*record).clone())
            .collect()
    }
}

impl Drop for PendingReservations<'_> {
    fn drop(&mut self) {
        for record in &self.records {
            self.index.release(&record.id, &self.selection_id);
        }
    }
}

/// Low latency selection over an in-process cache of the ledger.
///
/// The cache is eventually consistent: a record can be selected shortly
/// before the feed reports it consumed. Every reservation expires after the
/// configured auto-unlock delay unless the record is consumed first.
pub struct InMemorySelector {
    index: Arc<ReservationIndex>,
    scheduler: UnlockScheduler,
    auto_unlock_delay: Duration,
    applied_updates: Arc<AtomicU64>,
    shutdown: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl InMemorySelector {
    /// Load the snapshot into a new index and start applying feed updates.
    /// Must be called from within a tokio runtime.
    ///
    /// # Parameters
    /// * `observer` - Snapshot and ledger update feed
    /// * `config` - Indexing strategies, capacity hint and auto-unlock delay
    /// * `resolver` - Maps records to holders for each indexing strategy
    pub fn start(
        observer: TokenObserver,
        config: &InMemorySelectionConfig,
        resolver: Arc<dyn OwnerResolver>,
    ) -> Result<Arc<Self>, SelectionError> {
        if !config.enabled {
            return Err(SelectionError::Config(
                "in-memory selection is disabled".to_string(),
            ));
        }
        let scheduler = UnlockScheduler::current()?;

        let index = Arc::new(ReservationIndex::new(
            &config.indexing_strategies,
            resolver,
            config.cache_size,
        ));
        let TokenObserver { initial, mut updates } = observer;
        let snapshot_size = initial.len();
        for record in initial {
            index.upsert(record);
        }
        info!(
            "In-memory selector loaded {} records, auto-unlock after {:?}",
            snapshot_size,
            config.auto_unlock_delay()
        );

        let applied_updates = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();
        let watcher = {
            let index = Arc::clone(&index);
            let applied = Arc::clone(&applied_updates);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        update = updates.recv() => match update {
                            Some(update) => {
                                apply_ledger_update(&index, update);
                                applied.fetch_add(1, Ordering::Release);
                            }
                            None => {
                                debug!("Ledger update feed closed");
                                break;
                            }
                        },
                    }
                }
            })
        };

        Ok(Arc::new(Self {
            index,
            scheduler,
            auto_unlock_delay: config.auto_unlock_delay(),
            applied_updates,
            shutdown,
            watcher: Mutex::new(Some(watcher)),
        }))
    }

    pub fn index(&self) -> &Arc<ReservationIndex> {
        &self.index
    }

    pub fn auto_unlock_delay(&self) -> Duration {
        self.auto_unlock_delay
    }

    /// Number of feed updates applied so far
    pub fn applied_updates(&self) -> u64 {
        self.applied_updates.load(Ordering::Acquire)
    }

    /// Apply one ledger update directly, bypassing the feed
    pub fn apply_update(&self, update: LedgerUpdate) {
        apply_ledger_update(&self.index, update);
    }

    /// Subscribe to reservations invalidated because the ledger consumed a
    /// reserved record
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<ReservationInvalidated> {
        self.index.subscribe_invalidations()
    }

    /// Select and reserve records of `required.token` held by `owner`.
    ///
    /// Every holder of `owner` is searched. Candidates are scanned in bucket
    /// order and the scan stops as soon as the reserved total covers the
    /// requested quantity.
    ///
    /// # Parameters
    /// * `selection_id` - Tags every reservation made by this call
    /// * `owner` - The holder or holders to select from
    /// * `required` - Quantity and exact token type to cover
    /// * `query` - Issuer, predicate and shortfall options
    /// * `auto_unlock_delay` - When the reservations are released if not consumed
    ///
    /// # Returns
    /// The reserved records, or `InsufficientBalance` with nothing left reserved
    pub fn select_tokens(
        &self,
        selection_id: &SelectionId,
        owner: &OwnerSelector,
        required: &Amount<TokenType>,
        query: &TokenQueryBy,
        auto_unlock_delay: Duration,
    ) -> Result<Vec<TokenRecord>, SelectionError> {
        if required.quantity == 0 {
            return Ok(Vec::new());
        }

        let mut pending = PendingReservations::new(&self.index, *selection_id);
        let mut total = 0u64;

        'holders: for holder in owner.holders() {
            for record in self.candidates(holder, &required.token) {
                if !record.matches_token_type(&required.token) || !query.matches(&record) {
                    continue;
                }
                if !self.index.try_reserve(&record.id, selection_id) {
                    continue;
                }
                total = total.saturating_add(record.quantity);
                pending.push(record);
                if total >= required.quantity {
                    break 'holders;
                }
            }
        }

        if total < required.quantity && !query.allow_shortfall {
            debug!(
                "Selection {} found {} of {} for {}, unwinding",
                selection_id, total, required, owner
            );
            return Err(SelectionError::InsufficientBalance(format!(
                "{} held by {} (found {})",
                required, owner, total
            )));
        }

        let records = pending.commit();
        if !records.is_empty() {
            self.scheduler.schedule(
                Arc::clone(&self.index),
                *selection_id,
                records.iter().map(|r| r.id).collect(),
                auto_unlock_delay,
            );
        }
        debug!(
            "Selection {} reserved {} records totalling {} for {}",
            selection_id,
            records.len(),
            total,
            owner
        );
        Ok(records)
    }

    /// Release one record reserved by `selection_id`
    pub fn unlock_token(&self, record: &TokenRecord, selection_id: &SelectionId) -> ReleaseOutcome {
        self.index.release(&record.id, selection_id)
    }

    /// Mark records as reserved by an already known selection
    ///
    /// # Returns
    /// The number of records now reserved by `selection_id`
    pub fn lock_tokens_external(&self, records: &[TokenRecord], selection_id: &SelectionId) -> usize {
        records
            .iter()
            .filter(|record| self.index.lock_external(&record.id, selection_id))
            .count()
    }

    /// Stop the feed watcher and drop pending auto-unlock timers
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.shutdown().await;
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!("Ledger feed watcher ended abnormally: {}", e);
            }
        }
        info!("In-memory selector shut down");
    }

    fn candidates(&self, holder: &Holder, token_type: &TokenType) -> Vec<Arc<TokenRecord>> {
        match holder {
            Holder::TokenOnly => self.index.all_records(),
            _ => self
                .index
                .bucket_for(&IndexKey::new(holder.clone(), token_type))
                .map(|bucket| bucket.records())
                .unwrap_or_default(),
        }
    }
}

fn apply_ledger_update(index: &ReservationIndex, update: LedgerUpdate) {
    for record in &update.consumed {
        index.remove(record);
    }
    for record in update.produced {
        index.upsert(record);
    }
}

impl std::fmt::Debug for InMemorySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySelector")
            .field("index", &self.index)
            .field("auto_unlock_delay", &self.auto_unlock_delay)
            .field("applied_updates", &self.applied_updates())
            .finish()
    }
}

#[async_trait]
impl Selector for InMemorySelector {
    fn kind(&self) -> SelectorKind {
        SelectorKind::InMemory
    }

    async fn select_tokens(
        &self,
        selection_id: &SelectionId,
        owner: &OwnerSelector,
        required: &Amount<TokenType>,
        query: &TokenQueryBy,
        cancel: &CancellationToken,
    ) -> Result<Vec<TokenRecord>, SelectionError> {
        if cancel.is_cancelled() {
            return Err(SelectionError::Cancelled);
        }
        InMemorySelector::select_tokens(
            self,
            selection_id,
            owner,
            required,
            query,
            self.auto_unlock_delay,
        )
    }

    async fn release(
        &self,
        selection_id: &SelectionId,
        records: &[TokenRecord],
    ) -> Result<(), SelectionError> {
        for record in records {
            self.unlock_token(record, selection_id);
        }
        Ok(())
    }

    async fn restore(
        &self,
        selection_id: &SelectionId,
        records: &[TokenRecord],
    ) -> Result<(), SelectionError> {
        let locked = self.lock_tokens_external(records, selection_id);
        if locked < records.len() {
            warn!(
                "Restored {} of {} reservations for selection {}",
                locked,
                records.len(),
                selection_id
            );
        }
        if locked > 0 {
            self.scheduler.schedule(
                Arc::clone(&self.index),
                *selection_id,
                records.iter().map(|r| r.id).collect(),
                self.auto_unlock_delay,
            );
        }
        Ok(())
    }
}
