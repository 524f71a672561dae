use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static TEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

// IdentityKey is the opaque 32 byte key of an owner or issuer.
// It resembles a public key, but nothing here interprets it as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey([u8; 32]);

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = hex::encode(&self.0[0..6]);
        write!(f, "key:{}", prefix)
    }
}

impl Deref for IdentityKey {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IdentityKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        IdentityKey(bytes)
    }

    /// Get a reference to the internal bytes
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Create an IdentityKey from a byte slice, if it has the right length
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(IdentityKey(array))
    }

    /// Short, stable hash of the key used when mapping keys to external ids
    pub fn short_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"TOKEN_IdentityKey");
        hasher.update(self.0);
        hex::encode(hasher.finalize())
    }

    /// Derive a key from a human readable label (handy for fixtures and tests)
    pub fn from_label(label: &str) -> Self {
        IdentityKey(derive_bytes(&[b"TOKEN_Label", label.as_bytes()]))
    }

    /// Generate a unique IdentityKey for testing purposes - exposed for testing in other crates
    pub fn unique_for_tests() -> Self {
        let n = TEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        IdentityKey(derive_bytes(&[b"TOKEN_TestKey", &n.to_le_bytes(), &nanos()]))
    }
}

/// Reference to a single spendable record: the hash of the transaction that
/// produced it plus the index of the output within that transaction.
///
/// Ordering is by transaction hash, then output index. Stores sort on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub tx_hash: [u8; 32],
    pub index: u32,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", hex::encode(&self.tx_hash[0..8]), self.index)
    }
}

impl RecordId {
    pub fn new(tx_hash: [u8; 32], index: u32) -> Self {
        Self { tx_hash, index }
    }

    /// Generate a unique RecordId for testing purposes - exposed for testing in other crates
    pub fn unique_for_tests() -> Self {
        let n = TEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tx_hash = derive_bytes(&[b"TOKEN_TestTx", &n.to_le_bytes(), &nanos()]);
        Self { tx_hash, index: 0 }
    }
}

/// Identifier of one logical selection. Every reservation made by a selection
/// carries it, so that only the same selection can release what it reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionId(Uuid);

impl SelectionId {
    pub fn new(uuid: Uuid) -> Self {
        SelectionId(uuid)
    }

    pub fn random() -> Self {
        SelectionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SelectionId {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Display for SelectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SelectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SelectionId(Uuid::parse_str(s)?))
    }
}

fn derive_bytes(seeds: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for seed in seeds {
        hasher.update(seed);
    }
    hasher.finalize().into()
}

fn nanos() -> [u8; 16] {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_le_bytes()
}
