use crate::movement::{plan_move, total_required, MovePlan, Payment};
use crate::query::TokenQueryBy;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use token_core::error::SelectionError;
use token_core::holder::{Holder, OwnerSelector};
use token_core::id::SelectionId;
use token_core::objects::{Amount, TokenRecord, TokenType};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Which backend a selector reserves against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectorKind {
    /// Reservations are markers in the in-process index, with auto-unlock
    InMemory,
    /// Reservations are soft locks held by the durable store
    Database,
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorKind::InMemory => write!(f, "in-memory"),
            SelectorKind::Database => write!(f, "database"),
        }
    }
}

/// A selection strategy
#[async_trait]
pub trait Selector: fmt::Debug + Send + Sync {
    /// The backend this selector reserves against
    fn kind(&self) -> SelectorKind;

    /// Select and reserve records covering `required`
    ///
    /// # Parameters
    /// * `selection_id` - Identifies the reservation; only it can release the records
    /// * `owner` - The holder or holders whose records are searched
    /// * `required` - Amount and token type to cover
    /// * `query` - Issuer, predicate and shortfall options
    /// * `cancel` - Aborts any wait inside the selection
    ///
    /// # Returns
    /// The reserved records. Their total covers `required` unless the query
    /// allows a shortfall.
    async fn select_tokens(
        &self,
        selection_id: &SelectionId,
        owner: &OwnerSelector,
        required: &Amount<TokenType>,
        query: &TokenQueryBy,
        cancel: &CancellationToken,
    ) -> Result<Vec<TokenRecord>, SelectionError>;

    /// Release reservations held by `selection_id`. Idempotent.
    async fn release(
        &self,
        selection_id: &SelectionId,
        records: &[TokenRecord],
    ) -> Result<(), SelectionError>;

    /// Re-attach reservations recorded in a captured handle, without selecting again
    async fn restore(
        &self,
        selection_id: &SelectionId,
        records: &[TokenRecord],
    ) -> Result<(), SelectionError>;
}

/// Lifecycle of a selection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleStage {
    /// Nothing selected yet
    Fresh,
    /// Records are reserved and owned by the caller
    Selected,
    /// The caller used the records; reservations are left to the ledger
    Confirmed,
    /// Reservations were released early
    RolledBack,
}

/// Captured bookkeeping of a selection handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleState {
    pub selection_id: SelectionId,
    pub kind: SelectorKind,
    pub stage: HandleStage,
    pub records: Vec<TokenRecord>,
}

impl HandleState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SelectionError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SelectionError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug)]
enum Stage {
    Fresh,
    Selected(Vec<TokenRecord>),
    Confirmed,
    RolledBack,
}

impl Stage {
    fn handle_stage(&self) -> HandleStage {
        match self {
            Stage::Fresh => HandleStage::Fresh,
            Stage::Selected(_) => HandleStage::Selected,
            Stage::Confirmed => HandleStage::Confirmed,
            Stage::RolledBack => HandleStage::RolledBack,
        }
    }
}

/// Single-use selection handle over one selector.
///
/// A handle selects at most once. Construct a new one for every logical
/// selection; its selection id tags every reservation it makes.
pub struct SelectionFacade {
    selector: Arc<dyn Selector>,
    selection_id: SelectionId,
    owner: OwnerSelector,
    stage: Mutex<Stage>,
}

impl SelectionFacade {
    /// Create a handle that selects from `owner` unless a query names another holder
    pub fn new(selector: Arc<dyn Selector>, owner: impl Into<OwnerSelector>) -> Self {
        Self::with_selection_id(selector, owner, SelectionId::random())
    }

    pub fn with_selection_id(
        selector: Arc<dyn Selector>,
        owner: impl Into<OwnerSelector>,
        selection_id: SelectionId,
    ) -> Self {
        Self {
            selector,
            selection_id,
            owner: owner.into(),
            stage: Mutex::new(Stage::Fresh),
        }
    }

    pub fn selection_id(&self) -> SelectionId {
        self.selection_id
    }

    pub fn kind(&self) -> SelectorKind {
        self.selector.kind()
    }

    pub async fn stage(&self) -> HandleStage {
        self.stage.lock().await.handle_stage()
    }

    /// Select records covering `required`.
    ///
    /// # Returns
    /// * `Err(DoubleSelection)` - This handle already produced a result
    /// * `Err(InsufficientBalance)` - Nothing was reserved; the handle stays usable
    pub async fn select(
        &self,
        required: &Amount<TokenType>,
        query: &TokenQueryBy,
    ) -> Result<Vec<TokenRecord>, SelectionError> {
        self.select_with_cancel(required, query, &CancellationToken::new())
            .await
    }

    /// Like [`Self::select`], aborting backoff waits when `cancel` fires
    pub async fn select_with_cancel(
        &self,
        required: &Amount<TokenType>,
        query: &TokenQueryBy,
        cancel: &CancellationToken,
    ) -> Result<Vec<TokenRecord>, SelectionError> {
        let mut stage = self.stage.lock().await;
        if !matches!(*stage, Stage::Fresh) {
            return Err(SelectionError::DoubleSelection);
        }

        let owner = query.holder.as_ref().unwrap_or(&self.owner);
        let records = self
            .selector
            .select_tokens(&self.selection_id, owner, required, query, cancel)
            .await?;

        debug!(
            "Selection {} reserved {} records for {}",
            self.selection_id,
            records.len(),
            required
        );
        *stage = Stage::Selected(records.clone());
        Ok(records)
    }

    /// Hand the reserved records over to the caller's transaction.
    ///
    /// Reservations are not released: the ledger consumes the records, or
    /// auto-unlock and store expiry reclaim them.
    pub async fn confirm(&self) -> Vec<TokenRecord> {
        let mut stage = self.stage.lock().await;
        match std::mem::replace(&mut *stage, Stage::Confirmed) {
            Stage::Selected(records) => records,
            Stage::Fresh => Vec::new(),
            previous @ Stage::RolledBack => {
                warn!("Selection {} confirmed after rollback", self.selection_id);
                *stage = previous;
                Vec::new()
            }
            Stage::Confirmed => Vec::new(),
        }
    }

    /// Release every reserved record. No-op if nothing was selected or the
    /// handle was already rolled back or confirmed.
    pub async fn rollback(&self) -> Result<(), SelectionError> {
        let mut stage = self.stage.lock().await;
        match std::mem::replace(&mut *stage, Stage::RolledBack) {
            Stage::Selected(records) => {
                if let Err(err) = self.selector.release(&self.selection_id, &records).await {
                    *stage = Stage::Selected(records);
                    return Err(err);
                }
                info!(
                    "Rolled back selection {} ({} records)",
                    self.selection_id,
                    records.len()
                );
            }
            Stage::Confirmed => {
                warn!("Rollback of confirmed selection {} ignored", self.selection_id);
                *stage = Stage::Confirmed;
            }
            Stage::Fresh | Stage::RolledBack => {}
        }
        Ok(())
    }

    /// Snapshot of this handle's bookkeeping
    pub async fn capture(&self) -> HandleState {
        let stage = self.stage.lock().await;
        let records = match &*stage {
            Stage::Selected(records) => records.clone(),
            _ => Vec::new(),
        };
        HandleState {
            selection_id: self.selection_id,
            kind: self.selector.kind(),
            stage: stage.handle_stage(),
            records,
        }
    }

    /// Rebuild a handle from captured state, re-attaching its reservations to
    /// `selector` without running selection again
    pub async fn restore(
        selector: Arc<dyn Selector>,
        owner: impl Into<OwnerSelector>,
        state: HandleState,
    ) -> Result<Self, SelectionError> {
        if state.kind != selector.kind() {
            return Err(SelectionError::Config(format!(
                "handle {} was captured from a {} selector, cannot restore onto {}",
                state.selection_id,
                state.kind,
                selector.kind()
            )));
        }

        let stage = match state.stage {
            HandleStage::Fresh => Stage::Fresh,
            HandleStage::Selected => {
                selector.restore(&state.selection_id, &state.records).await?;
                Stage::Selected(state.records)
            }
            HandleStage::Confirmed => Stage::Confirmed,
            HandleStage::RolledBack => Stage::RolledBack,
        };

        debug!("Restored selection handle {}", state.selection_id);
        Ok(Self {
            selector,
            selection_id: state.selection_id,
            owner: owner.into(),
            stage: Mutex::new(stage),
        })
    }

    /// Select enough records for every payment and plan the outputs of the
    /// move, sending change to `change_holder`. If planning fails the
    /// selection is rolled back.
    pub async fn generate_move(
        &self,
        payments: &[Payment],
        change_holder: &Holder,
        query: &TokenQueryBy,
    ) -> Result<MovePlan, SelectionError> {
        let required = total_required(payments)?;
        let inputs = self.select(&required, query).await?;

        match plan_move(inputs, payments, change_holder) {
            Ok(plan) => Ok(plan),
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(
                        "Rollback of selection {} after a failed move plan also failed: {}",
                        self.selection_id, rollback_err
                    );
                }
                Err(err)
            }
        }
    }
}

impl fmt::Debug for SelectionFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionFacade")
            .field("selection_id", &self.selection_id)
            .field("kind", &self.selector.kind())
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use token_core::error::StoreError;
    use token_core::id::{IdentityKey, RecordId};

    fn gbp() -> TokenType {
        TokenType::new("FiatCurrency", "GBP", 2)
    }

    /// Selector that hands out its records once and remembers releases
    #[derive(Debug, Default)]
    struct RecordingSelector {
        records: Vec<TokenRecord>,
        released: StdMutex<Vec<(SelectionId, Vec<TokenRecord>)>>,
        restored: StdMutex<Vec<(SelectionId, Vec<TokenRecord>)>>,
        release_fails: bool,
    }

    #[async_trait]
    impl Selector for RecordingSelector {
        fn kind(&self) -> SelectorKind {
            SelectorKind::InMemory
        }

        async fn select_tokens(
            &self,
            _selection_id: &SelectionId,
            _owner: &OwnerSelector,
            required: &Amount<TokenType>,
            query: &TokenQueryBy,
            _cancel: &CancellationToken,
        ) -> Result<Vec<TokenRecord>, SelectionError> {
            let total: u64 = self.records.iter().map(|r| r.quantity).sum();
            if total < required.quantity && !query.allow_shortfall {
                return Err(SelectionError::InsufficientBalance(required.to_string()));
            }
            Ok(self.records.clone())
        }

        async fn release(
            &self,
            selection_id: &SelectionId,
            records: &[TokenRecord],
        ) -> Result<(), SelectionError> {
            if self.release_fails {
                return Err(SelectionError::Store(StoreError::Connectivity(
                    "store unreachable".to_string(),
                )));
            }
            self.released
                .lock()
                .unwrap()
                .push((*selection_id, records.to_vec()));
            Ok(())
        }

        async fn restore(
            &self,
            selection_id: &SelectionId,
            records: &[TokenRecord],
        ) -> Result<(), SelectionError> {
            self.restored
                .lock()
                .unwrap()
                .push((*selection_id, records.to_vec()));
            Ok(())
        }
    }

    fn selector_with(quantities: &[u64]) -> (Arc<RecordingSelector>, IdentityKey) {
        let owner = IdentityKey::unique_for_tests();
        let records = quantities
            .iter()
            .map(|q| TokenRecord::new(RecordId::unique_for_tests(), owner, owner, gbp(), *q).unwrap())
            .collect();
        (
            Arc::new(RecordingSelector {
                records,
                ..Default::default()
            }),
            owner,
        )
    }

    #[tokio::test]
    async fn test_second_select_is_rejected() {
        let (selector, owner) = selector_with(&[100]);
        let facade = SelectionFacade::new(selector, owner);
        let amount = Amount::new(50, gbp());

        facade.select(&amount, &TokenQueryBy::new()).await.unwrap();
        let err = facade.select(&amount, &TokenQueryBy::new()).await.unwrap_err();
        assert!(matches!(err, SelectionError::DoubleSelection));
    }

    #[tokio::test]
    async fn test_failed_select_leaves_handle_usable() {
        let (selector, owner) = selector_with(&[10]);
        let facade = SelectionFacade::new(selector, owner);

        let err = facade
            .select(&Amount::new(50, gbp()), &TokenQueryBy::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::InsufficientBalance(_)));
        assert_eq!(facade.stage().await, HandleStage::Fresh);

        let records = facade
            .select(&Amount::new(5, gbp()), &TokenQueryBy::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_releases_once() {
        let (selector, owner) = selector_with(&[100, 50]);
        let facade = SelectionFacade::new(selector.clone(), owner);
        let records = facade
            .select(&Amount::new(120, gbp()), &TokenQueryBy::new())
            .await
            .unwrap();

        facade.rollback().await.unwrap();
        facade.rollback().await.unwrap();

        let released = selector.released.lock().unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, facade.selection_id());
        assert_eq!(released[0].1, records);
        drop(released);

        // Rolled back handles stay used
        let err = facade
            .select(&Amount::new(1, gbp()), &TokenQueryBy::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::DoubleSelection));
    }

    #[tokio::test]
    async fn test_failed_move_plan_error_survives_failed_rollback() {
        let owner = IdentityKey::unique_for_tests();
        let selector = Arc::new(RecordingSelector {
            records: vec![
                TokenRecord::new(RecordId::unique_for_tests(), owner, owner, gbp(), 30).unwrap(),
            ],
            release_fails: true,
            ..Default::default()
        });
        let facade = SelectionFacade::new(selector.clone(), owner);
        let recipient = Holder::KeyIdentity(IdentityKey::unique_for_tests());

        let err = facade
            .generate_move(
                &[Payment::new(recipient, Amount::new(50, gbp()))],
                &Holder::KeyIdentity(owner),
                &TokenQueryBy::new().allow_shortfall(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::InvalidMove(_)));
        assert!(selector.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_without_selection_is_noop() {
        let (selector, owner) = selector_with(&[100]);
        let facade = SelectionFacade::new(selector.clone(), owner);
        facade.rollback().await.unwrap();
        assert!(selector.released.lock().unwrap().is_empty());
        assert_eq!(facade.stage().await, HandleStage::RolledBack);
    }

    #[tokio::test]
    async fn test_confirm_keeps_reservation() {
        let (selector, owner) = selector_with(&[100]);
        let facade = SelectionFacade::new(selector.clone(), owner);
        let records = facade
            .select(&Amount::new(100, gbp()), &TokenQueryBy::new())
            .await
            .unwrap();

        assert_eq!(facade.confirm().await, records);
        facade.rollback().await.unwrap();
        assert!(selector.released.lock().unwrap().is_empty());
        assert_eq!(facade.stage().await, HandleStage::Confirmed);
    }

    #[tokio::test]
    async fn test_capture_and_restore_does_not_reselect() {
        let (selector, owner) = selector_with(&[100, 25]);
        let facade = SelectionFacade::new(selector.clone(), owner);
        let records = facade
            .select(&Amount::new(110, gbp()), &TokenQueryBy::new())
            .await
            .unwrap();

        let bytes = facade.capture().await.to_bytes().unwrap();
        let state = HandleState::from_bytes(&bytes).unwrap();
        assert_eq!(state.stage, HandleStage::Selected);
        assert_eq!(state.records, records);

        let restored = SelectionFacade::restore(selector.clone(), owner, state)
            .await
            .unwrap();
        assert_eq!(restored.selection_id(), facade.selection_id());
        assert_eq!(selector.restored.lock().unwrap().len(), 1);

        // Still single-use after restore
        let err = restored
            .select(&Amount::new(1, gbp()), &TokenQueryBy::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::DoubleSelection));

        restored.rollback().await.unwrap();
        assert_eq!(selector.released.lock().unwrap()[0].1, records);
    }

    #[tokio::test]
    async fn test_restore_rejects_other_backend() {
        let (selector, owner) = selector_with(&[100]);
        let state = HandleState {
            selection_id: SelectionId::random(),
            kind: SelectorKind::Database,
            stage: HandleStage::Selected,
            records: Vec::new(),
        };
        let err = SelectionFacade::restore(selector, owner, state)
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::Config(_)));
    }

    #[test]
    fn test_corrupt_handle_state_is_a_serialization_error() {
        let err = HandleState::from_bytes(&[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, SelectionError::Serialization(_)));
    }
}
