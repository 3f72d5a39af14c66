use crate::{
    Keyed,
    index::IndexedSecurities,
    security::{Security, SecurityIndex},
};

/// Incremental builder for an [`IndexedSecurities`] collection.
///
/// Securities are deduplicated by [`SecurityId`](crate::security::SecurityId) during
/// `build` - the first occurrence wins.
#[derive(Debug, Default)]
pub struct IndexedSecuritiesBuilder {
    securities: Vec<Security>,
}

impl IndexedSecuritiesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_security(mut self, security: Security) -> Self {
        self.securities.push(security);
        self
    }

    pub fn build(self) -> IndexedSecurities {
        // Dedup by id, first occurrence wins
        let mut seen = fnv::FnvHashSet::default();
        let securities = self
            .securities
            .into_iter()
            .filter(|security| seen.insert(security.id.clone()))
            .enumerate()
            .map(|(index, security)| Keyed::new(SecurityIndex(index), security))
            .collect::<Vec<_>>();

        IndexedSecurities::from_parts(securities)
    }
}
