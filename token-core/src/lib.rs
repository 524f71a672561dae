pub mod error;
pub mod holder;
pub mod id;
pub mod locks;
pub mod objects;

// Re-export the main types for convenience
pub use error::{SelectionError, StoreError};
pub use holder::{Holder, IndexKey, IndexingType, OwnerSelector};
pub use id::{IdentityKey, RecordId, SelectionId};
pub use locks::{LockFilter, ReservationMarker, StoreQuery, TokenPage, TokenStore};
pub use objects::{total_quantity, Amount, IssuedTokenType, LedgerUpdate, TokenRecord, TokenType};
