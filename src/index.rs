//! Concurrent, multi-key index of cached token records.
//!
//! Every cached record has exactly one slot holding its [`ReservationMarker`].
//! Buckets keyed by [`IndexKey`] group the records of one holder and token type
//! for each indexing strategy; a record can appear in several buckets (one per
//! strategy) but its marker lives only in its slot, so a reservation made
//! through any view is seen by all of them.
//!
//! Marker transitions are compare-and-set operations on the slot map. There
//! is no lock layered over selection: two selectors racing for one record
//! both call [`ReservationIndex::try_reserve`] and exactly one of them wins.

use crate::indexing::OwnerResolver;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use token_core::holder::{IndexKey, IndexingType};
use token_core::id::{RecordId, SelectionId};
use token_core::locks::ReservationMarker;
use token_core::objects::TokenRecord;
use tokio::sync::broadcast;

const INVALIDATION_CHANNEL_CAPACITY: usize = 1024;

type IndexedView = DashMap<IndexKey, Arc<Bucket>>;

/// Records of one holder and token type
#[derive(Debug, Default)]
pub struct Bucket {
    records: DashMap<RecordId, Arc<TokenRecord>>,
}

impl Bucket {
    fn insert(&self, record: Arc<TokenRecord>) {
        self.records.insert(record.id, record);
    }

    fn remove(&self, id: &RecordId) {
        self.records.remove(id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    /// Snapshot of the bucket's records. Order is unspecified and may differ
    /// between calls.
    pub fn records(&self) -> Vec<Arc<TokenRecord>> {
        self.records.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

struct Slot {
    record: Arc<TokenRecord>,
    marker: ReservationMarker,
    /// Bucket the record was filed under in each view. Removal uses these
    /// rather than resolving again, since the holder mapping may have changed.
    keys: Vec<(IndexingType, IndexKey)>,
}

/// Result of releasing a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The record went from reserved to free
    Released,
    /// The record was already free
    AlreadyFree,
    /// The record is no longer in the index (consumed externally)
    NotFound,
    /// The record is reserved by a different selection
    HeldBy(SelectionId),
}

/// Published when a reserved record is removed from the index, which means
/// the ledger consumed it while a selection still held it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInvalidated {
    pub record: TokenRecord,
    pub selection_id: SelectionId,
}

/// Thread-safe storage and atomic reservation of token records
pub struct ReservationIndex {
    slots: DashMap<RecordId, Slot>,
    views: RwLock<HashMap<IndexingType, Arc<IndexedView>>>,
    resolver: Arc<dyn OwnerResolver>,
    invalidations: broadcast::Sender<ReservationInvalidated>,
}

impl ReservationIndex {
    /// Create an empty index
    ///
    /// # Parameters
    /// * `strategies` - Indexing strategies whose views are built eagerly; others
    ///   are built on first use
    /// * `resolver` - Derives the bucket holder of a record per strategy
    /// * `capacity_hint` - Expected number of cached records
    pub fn new(
        strategies: &[IndexingType],
        resolver: Arc<dyn OwnerResolver>,
        capacity_hint: usize,
    ) -> Self {
        let views = strategies
            .iter()
            .filter(|s| **s != IndexingType::ByTokenOnly)
            .map(|s| (*s, Arc::new(IndexedView::new())))
            .collect();
        let (invalidations, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);

        Self {
            slots: DashMap::with_capacity(capacity_hint),
            views: RwLock::new(views),
            resolver,
            invalidations,
        }
    }

    /// Insert a record with a free marker.
    ///
    /// # Returns
    /// `false` if the record was already present (the feed delivered a duplicate)
    pub fn upsert(&self, record: TokenRecord) -> bool {
        let views = self.views.read().unwrap_or_else(PoisonError::into_inner);
        let record = Arc::new(record);
        let keys: Vec<(IndexingType, IndexKey)> = views
            .keys()
            .map(|indexing| (*indexing, self.key_for(&record, *indexing)))
            .collect();

        match self.slots.entry(record.id) {
            Entry::Occupied(_) => {
                warn!(
                    "Attempted to overwrite existing token {}, this suggests incorrect ledger feed behaviour",
                    record.id
                );
                return false;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    record: Arc::clone(&record),
                    marker: ReservationMarker::Free,
                    keys: keys.clone(),
                });
            }
        }

        for (indexing, key) in keys {
            if let Some(view) = views.get(&indexing) {
                add_to_view(view, key, &record);
            }
        }
        true
    }

    /// Remove a record from the index.
    ///
    /// # Returns
    /// The marker the record carried, or `None` if it was not present
    pub fn remove(&self, record: &TokenRecord) -> Option<ReservationMarker> {
        let views = self.views.read().unwrap_or_else(PoisonError::into_inner);

        let Some((_, slot)) = self.slots.remove(&record.id) else {
            warn!(
                "Attempted to remove existing token {}, but it was not found this suggests incorrect ledger feed behaviour",
                record.id
            );
            return None;
        };

        for (indexing, key) in &slot.keys {
            if let Some(bucket) = views.get(indexing).and_then(|view| view.get(key)) {
                bucket.remove(&record.id);
            }
        }

        if let ReservationMarker::Reserved(selection_id) = slot.marker {
            debug!(
                "Record {} was consumed while reserved by selection {}",
                record.id, selection_id
            );
            // Nobody listening is fine
            let _ = self.invalidations.send(ReservationInvalidated {
                record: (*slot.record).clone(),
                selection_id,
            });
        }
        Some(slot.marker)
    }

    /// Atomically move a record from free to reserved by `selection_id`.
    ///
    /// # Returns
    /// `true` if this call won the record
    pub fn try_reserve(&self, id: &RecordId, selection_id: &SelectionId) -> bool {
        match self.slots.get_mut(id) {
            Some(mut slot) if slot.marker.is_free() => {
                slot.marker = ReservationMarker::Reserved(*selection_id);
                true
            }
            _ => false,
        }
    }

    /// Atomically move a record from reserved by `selection_id` back to free.
    ///
    /// Releasing twice, releasing a consumed record, or releasing a record held
    /// by someone else never fails; those cases are logged and reported.
    pub fn release(&self, id: &RecordId, selection_id: &SelectionId) -> ReleaseOutcome {
        let outcome = self.compare_and_release(id, selection_id);
        match outcome {
            ReleaseOutcome::Released => {}
            ReleaseOutcome::AlreadyFree => {
                warn!("Release of {} by {} ignored: record is already free", id, selection_id)
            }
            ReleaseOutcome::NotFound => {
                warn!("Release of {} by {} ignored: record is no longer indexed", id, selection_id)
            }
            ReleaseOutcome::HeldBy(holder) => warn!(
                "Invariant violation: selection {} tried to release {} which is reserved by {}",
                selection_id, id, holder
            ),
        }
        outcome
    }

    /// Release used by timed auto-unlock. Every outcome is expected here
    /// (the caller may have confirmed or rolled back long ago), so nothing is
    /// logged above trace level.
    pub fn expire(&self, id: &RecordId, selection_id: &SelectionId) -> bool {
        let outcome = self.compare_and_release(id, selection_id);
        trace!("Auto-unlock of {} for {}: {:?}", id, selection_id, outcome);
        outcome == ReleaseOutcome::Released
    }

    /// Re-mark a record as reserved by a known selection (restoring a handle).
    ///
    /// # Returns
    /// `true` if the record is now reserved by `selection_id`
    pub fn lock_external(&self, id: &RecordId, selection_id: &SelectionId) -> bool {
        let Some(mut slot) = self.slots.get_mut(id) else {
            warn!("Cannot restore reservation of {}: record is no longer indexed", id);
            return false;
        };
        match slot.marker {
            ReservationMarker::Free => {
                slot.marker = ReservationMarker::Reserved(*selection_id);
                true
            }
            ReservationMarker::Reserved(holder) if holder == *selection_id => true,
            ReservationMarker::Reserved(holder) => {
                warn!(
                    "Cannot restore reservation of {} for {}: reserved by {}",
                    id, selection_id, holder
                );
                false
            }
        }
    }

    /// The live bucket for `key`, building the view for its indexing strategy
    /// on first use. Token-only keys have no bucket; see [`Self::all_records`].
    pub fn bucket_for(&self, key: &IndexKey) -> Option<Arc<Bucket>> {
        let indexing = key.holder.indexing_type();
        if indexing == IndexingType::ByTokenOnly {
            return None;
        }
        let view = self.view_for(indexing);
        let bucket = view.get(key).map(|entry| Arc::clone(entry.value()));
        bucket
    }

    /// Snapshot of every cached record, in unspecified order
    pub fn all_records(&self) -> Vec<Arc<TokenRecord>> {
        self.slots
            .iter()
            .map(|entry| Arc::clone(&entry.value().record))
            .collect()
    }

    pub fn marker(&self, id: &RecordId) -> Option<ReservationMarker> {
        self.slots.get(id).map(|slot| slot.marker)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of records currently reserved by any selection
    pub fn reserved_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.marker.is_free()).count()
    }

    /// Subscribe to reservations invalidated by external consumption
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<ReservationInvalidated> {
        self.invalidations.subscribe()
    }

    fn compare_and_release(&self, id: &RecordId, selection_id: &SelectionId) -> ReleaseOutcome {
        let Some(mut slot) = self.slots.get_mut(id) else {
            return ReleaseOutcome::NotFound;
        };
        match slot.marker {
            ReservationMarker::Reserved(holder) if holder == *selection_id => {
                slot.marker = ReservationMarker::Free;
                ReleaseOutcome::Released
            }
            ReservationMarker::Reserved(holder) => ReleaseOutcome::HeldBy(holder),
            ReservationMarker::Free => ReleaseOutcome::AlreadyFree,
        }
    }

    fn key_for(&self, record: &TokenRecord, indexing: IndexingType) -> IndexKey {
        IndexKey::new(self.resolver.resolve(record, indexing), &record.token_type)
    }

    fn view_for(&self, indexing: IndexingType) -> Arc<IndexedView> {
        {
            let views = self.views.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(view) = views.get(&indexing) {
                return Arc::clone(view);
            }
        }

        let mut views = self.views.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(view) = views.get(&indexing) {
            return Arc::clone(view);
        }

        debug!("Building index view for {:?} over {} records", indexing, self.slots.len());
        let view = Arc::new(IndexedView::new());
        for mut entry in self.slots.iter_mut() {
            let slot = entry.value_mut();
            let key = self.key_for(&slot.record, indexing);
            add_to_view(&view, key.clone(), &slot.record);
            slot.keys.push((indexing, key));
        }
        views.insert(indexing, Arc::clone(&view));
        view
    }
}

fn add_to_view(view: &IndexedView, key: IndexKey, record: &Arc<TokenRecord>) {
    let bucket = Arc::clone(view.entry(key).or_default().value());
    bucket.insert(Arc::clone(record));
}

impl std::fmt::Debug for ReservationIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationIndex")
            .field("records", &self.slots.len())
            .finish()
    }
}
