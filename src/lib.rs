pub mod config;
pub mod database_selector;
pub mod index;
pub mod indexing;
pub mod memory_selector;
pub mod movement;
pub mod query;
pub mod scheduler;
pub mod selection;

// Re-export the main types for convenience
pub use config::{
    DatabaseSelectionConfig,
    InMemorySelectionConfig,
    PreferredSelection,
    SelectionConfig,
    SelectionServices,
    StateSelectionConfig,
};
pub use database_selector::PersistentSelector;
pub use index::{Bucket, ReleaseOutcome, ReservationIndex, ReservationInvalidated};
pub use indexing::{ExternalIdMapping, OwnerResolver};
pub use memory_selector::{InMemorySelector, TokenObserver};
pub use movement::{generate_exit, plan_move, MovePlan, Payment, TokenOutput};
pub use query::{RecordPredicate, TokenQueryBy};
pub use scheduler::UnlockScheduler;
pub use selection::{HandleStage, HandleState, SelectionFacade, Selector, SelectorKind};

pub use token_core::{
    Amount,
    Holder,
    IdentityKey,
    IndexKey,
    IndexingType,
    IssuedTokenType,
    LedgerUpdate,
    OwnerSelector,
    RecordId,
    ReservationMarker,
    SelectionError,
    SelectionId,
    StoreError,
    TokenRecord,
    TokenStore,
    TokenType,
};

// Re-export the durable store implementation
#[cfg(feature = "sqlite")]
pub use token_store::SqliteTokenStore;
