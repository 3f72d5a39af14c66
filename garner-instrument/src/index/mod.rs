use crate::{
    Keyed,
    index::{builder::IndexedSecuritiesBuilder, error::IndexError},
    security::{Security, SecurityId, SecurityIndex},
};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

pub mod builder;

/// Contains error variants that can occur when working with an [`IndexedSecurities`] collection.
pub mod error;

/// Indexed collection of securities.
///
/// Initialise incrementally via the [`IndexedSecuritiesBuilder`], or all at once via the
/// constructor.
///
/// The indexed collection is useful for creating efficient O(1) constant lookup state
/// management systems where state is keyed on a security. Engine state vectors are generated
/// from this collection and addressed by [`SecurityIndex`].
///
/// # Index Relationships
/// - `SecurityIndex`: Unique index for each [`Security`] added during initialisation.
/// - External identifiers (ISIN, CUSIP, SEDOL, ticker) map onto the same index.
///
/// Note that once an `IndexedSecurities` has been constructed, securities cannot be added or
/// removed (this could invalidate existing index lookup tables). Mutable per-security engine
/// state lives outside this collection, keyed by [`SecurityIndex`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IndexedSecurities {
    securities: Vec<Keyed<SecurityIndex, Security>>,
    by_id: FnvHashMap<SecurityId, SecurityIndex>,
    by_external: FnvHashMap<SmolStr, SecurityIndex>,
}

impl IndexedSecurities {
    /// Initialises a new `IndexedSecurities` from an iterator of [`Security`]s.
    pub fn new<Iter>(securities: Iter) -> Self
    where
        Iter: IntoIterator<Item = Security>,
    {
        securities
            .into_iter()
            .fold(Self::builder(), IndexedSecuritiesBuilder::add_security)
            .build()
    }

    /// Returns a new [`IndexedSecuritiesBuilder`] useful for incremental initialisation.
    pub fn builder() -> IndexedSecuritiesBuilder {
        IndexedSecuritiesBuilder::default()
    }

    pub(super) fn from_parts(securities: Vec<Keyed<SecurityIndex, Security>>) -> Self {
        let by_id = securities
            .iter()
            .map(|keyed| (keyed.value.id.clone(), keyed.key))
            .collect();

        let by_external = securities
            .iter()
            .flat_map(|keyed| {
                keyed
                    .value
                    .identifiers
                    .iter()
                    .map(|identifier| (identifier.clone(), keyed.key))
            })
            .collect();

        Self {
            securities,
            by_id,
            by_external,
        }
    }

    /// Returns a reference to the [`SecurityIndex`] <--> [`Security`] associations.
    pub fn securities(&self) -> &[Keyed<SecurityIndex, Security>] {
        &self.securities
    }

    /// Number of indexed securities.
    pub fn len(&self) -> usize {
        self.securities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.securities.is_empty()
    }

    /// Find the [`SecurityIndex`] associated with the provided [`SecurityId`].
    pub fn find_index(&self, id: &SecurityId) -> Result<SecurityIndex, IndexError> {
        self.by_id
            .get(id)
            .copied()
            .ok_or_else(|| IndexError::SecurityIndex(format!("no security with id: {id}")))
    }

    /// Find the [`SecurityIndex`] associated with the provided external identifier
    /// (ISIN, CUSIP, SEDOL or ticker).
    pub fn find_index_by_external(&self, identifier: &str) -> Result<SecurityIndex, IndexError> {
        self.by_external
            .get(identifier)
            .copied()
            .ok_or_else(|| {
                IndexError::ExternalIdentifier(format!("no security with identifier: {identifier}"))
            })
    }

    /// Returns the [`Security`] associated with the provided [`SecurityIndex`].
    ///
    /// Panics if the index was not produced by this collection.
    pub fn security(&self, index: SecurityIndex) -> &Security {
        &self.securities[index.index()].value
    }

    /// Find the [`Security`] associated with the provided [`SecurityId`].
    pub fn find_security(&self, id: &SecurityId) -> Result<&Security, IndexError> {
        self.find_index(id).map(|index| self.security(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{market::Market, test_utils::security};
    use smol_str::SmolStr;

    #[test]
    fn test_find_index_by_id_and_external() {
        let mut aapl = security("AAPL", Market::Us);
        aapl.identifiers.isin = Some(SmolStr::new("US0378331005"));
        let msft = security("MSFT", Market::Us);

        let indexed = IndexedSecurities::new([aapl, msft]);
        assert_eq!(indexed.len(), 2);

        let aapl_index = indexed.find_index(&SecurityId::new("AAPL")).unwrap();
        assert_eq!(indexed.security(aapl_index).id, SecurityId::new("AAPL"));

        let by_isin = indexed.find_index_by_external("US0378331005").unwrap();
        assert_eq!(by_isin, aapl_index);

        assert!(indexed.find_index(&SecurityId::new("TSLA")).is_err());
        assert!(indexed.find_index_by_external("GB0000000000").is_err());
    }

    #[test]
    fn test_duplicate_ids_deduplicated_on_build() {
        let indexed = IndexedSecurities::new([
            security("AAPL", Market::Us),
            security("AAPL", Market::Us),
        ]);
        assert_eq!(indexed.len(), 1);
    }
}
