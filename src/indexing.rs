use dashmap::DashMap;
use token_core::holder::{Holder, IndexingType};
use token_core::id::IdentityKey;
use token_core::objects::TokenRecord;
use uuid::Uuid;

/// Derives the holder a record is bucketed under for a given indexing strategy
pub trait OwnerResolver: Send + Sync {
    fn resolve(&self, record: &TokenRecord, indexing: IndexingType) -> Holder;
}

/// In-process registry of owning keys to external ids (account style ownership).
///
/// Used as the default resolver: by owner key, by mapped identifier, or token only.
/// Registering a key after its records were indexed does not move those records.
#[derive(Debug, Default)]
pub struct ExternalIdMapping {
    keys: DashMap<IdentityKey, Uuid>,
}

impl ExternalIdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` under `external_id`, replacing any earlier mapping
    pub fn register(&self, key: IdentityKey, external_id: Uuid) {
        self.keys.insert(key, external_id);
    }

    pub fn unregister(&self, key: &IdentityKey) -> Option<Uuid> {
        self.keys.remove(key).map(|(_, uuid)| uuid)
    }

    pub fn external_id(&self, key: &IdentityKey) -> Option<Uuid> {
        self.keys.get(key).map(|entry| *entry.value())
    }
}

impl OwnerResolver for ExternalIdMapping {
    fn resolve(&self, record: &TokenRecord, indexing: IndexingType) -> Holder {
        match indexing {
            IndexingType::ByOwnerKey => Holder::KeyIdentity(record.owner),
            IndexingType::ByMappedIdentifier => {
                Holder::from_external_id(self.external_id(&record.owner))
            }
            IndexingType::ByTokenOnly => Holder::TokenOnly,
        }
    }
}
