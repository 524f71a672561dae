use crate::id::IdentityKey;
use crate::objects::TokenType;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Who a selection is made on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Holder {
    /// A single owning key
    KeyIdentity(IdentityKey),
    /// Every key registered to an external id (account style ownership)
    MappedIdentity(Uuid),
    /// Every key that is not registered to an external id
    UnmappedIdentity,
    /// Any holder: only the token class and identifier matter
    TokenOnly,
}

impl Holder {
    pub fn from_external_id(external_id: Option<Uuid>) -> Self {
        match external_id {
            Some(uuid) => Holder::MappedIdentity(uuid),
            None => Holder::UnmappedIdentity,
        }
    }

    /// The indexing strategy that buckets records by this kind of holder
    pub fn indexing_type(&self) -> IndexingType {
        match self {
            Holder::KeyIdentity(_) => IndexingType::ByOwnerKey,
            Holder::MappedIdentity(_) | Holder::UnmappedIdentity => {
                IndexingType::ByMappedIdentifier
            }
            Holder::TokenOnly => IndexingType::ByTokenOnly,
        }
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::KeyIdentity(key) => write!(f, "{}", key),
            Holder::MappedIdentity(uuid) => write!(f, "ext:{}", uuid),
            Holder::UnmappedIdentity => write!(f, "unmapped"),
            Holder::TokenOnly => write!(f, "any"),
        }
    }
}

/// How records are bucketed for selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexingType {
    /// Bucket by the raw owning key
    #[serde(alias = "PUBLIC_KEY")]
    ByOwnerKey,
    /// Bucket by the external id the owning key is mapped to
    #[serde(alias = "EXTERNAL_ID")]
    ByMappedIdentifier,
    /// No owner bucketing; selection scans all records of the token type
    #[serde(alias = "TOKEN_ONLY")]
    ByTokenOnly,
}

/// Composite key of an index bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub holder: Holder,
    pub token_class: String,
    pub token_identifier: String,
}

impl IndexKey {
    pub fn new(holder: Holder, token_type: &TokenType) -> Self {
        Self {
            holder,
            token_class: token_type.token_class.clone(),
            token_identifier: token_type.token_identifier.clone(),
        }
    }
}

/// The owner side of a selection request: one holder, or a set of holders
/// that are all searched (for example the confidential keys of one party)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerSelector {
    Single(Holder),
    Set(Vec<Holder>),
}

impl OwnerSelector {
    pub fn holders(&self) -> &[Holder] {
        match self {
            OwnerSelector::Single(holder) => std::slice::from_ref(holder),
            OwnerSelector::Set(holders) => holders,
        }
    }

    /// A selector over several owning keys
    pub fn keys<I: IntoIterator<Item = IdentityKey>>(keys: I) -> Self {
        OwnerSelector::Set(keys.into_iter().map(Holder::KeyIdentity).collect())
    }
}

impl From<Holder> for OwnerSelector {
    fn from(holder: Holder) -> Self {
        OwnerSelector::Single(holder)
    }
}

impl From<IdentityKey> for OwnerSelector {
    fn from(key: IdentityKey) -> Self {
        OwnerSelector::Single(Holder::KeyIdentity(key))
    }
}

impl fmt::Display for OwnerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerSelector::Single(holder) => write!(f, "{}", holder),
            OwnerSelector::Set(holders) => {
                let parts: Vec<String> = holders.iter().map(|h| h.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}
