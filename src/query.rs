use std::fmt;
use std::sync::Arc;
use token_core::holder::OwnerSelector;
use token_core::id::IdentityKey;
use token_core::objects::TokenRecord;

/// Caller supplied filter over candidate records
pub type RecordPredicate = Arc<dyn Fn(&TokenRecord) -> bool + Send + Sync>;

/// Options narrowing a selection request
#[derive(Clone, Default)]
pub struct TokenQueryBy {
    /// Select from this holder instead of the selector's default owner
    pub holder: Option<OwnerSelector>,

    /// Only records issued by this identity
    pub issuer: Option<IdentityKey>,

    /// Extra filter applied to each candidate
    pub predicate: Option<RecordPredicate>,

    /// Return what was found instead of failing when the total falls short
    pub allow_shortfall: bool,
}

impl TokenQueryBy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(mut self, holder: impl Into<OwnerSelector>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    pub fn issuer(mut self, issuer: IdentityKey) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TokenRecord) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn allow_shortfall(mut self) -> Self {
        self.allow_shortfall = true;
        self
    }

    /// Whether `record` passes the issuer and predicate filters
    pub fn matches(&self, record: &TokenRecord) -> bool {
        if let Some(issuer) = &self.issuer {
            if record.issuer != *issuer {
                return false;
            }
        }
        self.predicate.as_ref().map_or(true, |p| p(record))
    }
}

impl fmt::Debug for TokenQueryBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenQueryBy")
            .field("holder", &self.holder)
            .field("issuer", &self.issuer)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("allow_shortfall", &self.allow_shortfall)
            .finish()
    }
}
