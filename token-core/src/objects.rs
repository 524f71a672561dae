use crate::error::SelectionError;
use crate::id::{IdentityKey, RecordId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Describes what kind of token a record holds
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenType {
    /// Class of the token (for example "FiatCurrency")
    pub token_class: String,

    /// Identifier within the class (for example "GBP")
    pub token_identifier: String,

    /// Number of fractional digits of the smallest denomination
    pub fraction_digits: u32,
}

impl TokenType {
    pub fn new(
        token_class: impl Into<String>,
        token_identifier: impl Into<String>,
        fraction_digits: u32,
    ) -> Self {
        Self {
            token_class: token_class.into(),
            token_identifier: token_identifier.into(),
            fraction_digits,
        }
    }

    /// Attach an issuer to this token type
    pub fn issued_by(&self, issuer: IdentityKey) -> IssuedTokenType {
        IssuedTokenType {
            issuer,
            token_type: self.clone(),
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.token_class, self.token_identifier)
    }
}

/// A token type together with the identity that issued it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssuedTokenType {
    pub issuer: IdentityKey,
    pub token_type: TokenType,
}

impl fmt::Display for IssuedTokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} issued by {}", self.token_type, self.issuer)
    }
}

/// A quantity of some token, in the smallest denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount<T> {
    pub quantity: u64,
    pub token: T,
}

impl<T> Amount<T> {
    pub fn new(quantity: u64, token: T) -> Self {
        Self { quantity, token }
    }
}

impl<T: fmt::Display> fmt::Display for Amount<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.quantity, self.token)
    }
}

/// One spendable, fungible unit of value, analogous to an unspent output.
///
/// Records are immutable. Spending a record removes it and its id is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Unique reference: producing transaction plus output index
    pub id: RecordId,

    /// The identity that controls this record
    pub owner: IdentityKey,

    /// The identity that issued the token
    pub issuer: IdentityKey,

    /// The kind of token held
    pub token_type: TokenType,

    /// Quantity in the smallest denomination, always greater than zero
    pub quantity: u64,
}

impl TokenRecord {
    /// Create a new record, rejecting zero quantities
    pub fn new(
        id: RecordId,
        owner: IdentityKey,
        issuer: IdentityKey,
        token_type: TokenType,
        quantity: u64,
    ) -> Result<Self, SelectionError> {
        if quantity == 0 {
            return Err(SelectionError::InvalidRecord(format!(
                "record {} has zero quantity",
                id
            )));
        }
        Ok(Self {
            id,
            owner,
            issuer,
            token_type,
            quantity,
        })
    }

    /// The issued token type of this record
    pub fn issued_token_type(&self) -> IssuedTokenType {
        self.token_type.issued_by(self.issuer)
    }

    /// The amount held by this record, including its issuer
    pub fn amount(&self) -> Amount<IssuedTokenType> {
        Amount::new(self.quantity, self.issued_token_type())
    }

    /// Whether this record holds exactly the given token type
    pub fn matches_token_type(&self, token_type: &TokenType) -> bool {
        self.token_type == *token_type
    }
}

/// Sum the quantities of a set of records, failing on overflow
pub fn total_quantity<'a, I>(records: I) -> Result<u64, SelectionError>
where
    I: IntoIterator<Item = &'a TokenRecord>,
{
    records
        .into_iter()
        .try_fold(0u64, |acc, r| acc.checked_add(r.quantity))
        .ok_or(SelectionError::AmountOverflow)
}

/// A change reported by the ledger: records consumed and records produced
/// by one transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerUpdate {
    pub consumed: Vec<TokenRecord>,
    pub produced: Vec<TokenRecord>,
}

impl LedgerUpdate {
    pub fn new(consumed: Vec<TokenRecord>, produced: Vec<TokenRecord>) -> Self {
        Self { consumed, produced }
    }

    pub fn produced(produced: Vec<TokenRecord>) -> Self {
        Self {
            consumed: Vec::new(),
            produced,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty() && self.produced.is_empty()
    }
}
