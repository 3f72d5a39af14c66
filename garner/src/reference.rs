use crate::error::{CoreError, ValidationError};
use chrono::NaiveDate;
use fnv::FnvHashMap;
use garner_instrument::{
    Timed,
    aggregation::{AggregationUnit, AggregationUnitId},
    basket::{Compositions, IndexComposition},
    counterparty::{Counterparty, CounterpartyId},
    index::IndexedSecurities,
    market::Market,
    security::{Security, SecurityId, SecurityIndex, Temperature},
};
use rust_decimal::Decimal;

/// Current reference-data state shared by all engines.
///
/// The security universe is indexed once at construction; per-security state (price, status,
/// temperature) then mutates in place behind fine-grained locks, addressed by
/// [`SecurityIndex`]. A reference update for a security outside the indexed universe is a
/// validation error - universes are rebuilt at start-of-day, not extended intraday.
#[derive(Debug)]
pub struct ReferenceData {
    indexed: IndexedSecurities,
    securities: Vec<parking_lot::RwLock<Security>>,
    compositions: parking_lot::RwLock<Compositions>,
    counterparties: parking_lot::RwLock<FnvHashMap<CounterpartyId, Counterparty>>,
    aggregation_units: parking_lot::RwLock<FnvHashMap<AggregationUnitId, AggregationUnit>>,
}

impl ReferenceData {
    pub fn from_universe(indexed: IndexedSecurities) -> Self {
        let securities = indexed
            .securities()
            .iter()
            .map(|keyed| parking_lot::RwLock::new(keyed.value.clone()))
            .collect();

        Self {
            indexed,
            securities,
            compositions: parking_lot::RwLock::new(Compositions::default()),
            counterparties: parking_lot::RwLock::new(FnvHashMap::default()),
            aggregation_units: parking_lot::RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn indexed(&self) -> &IndexedSecurities {
        &self.indexed
    }

    pub fn find_index(&self, id: &SecurityId) -> Result<SecurityIndex, CoreError> {
        self.indexed
            .find_index(id)
            .map_err(|_| ValidationError::UnknownSecurity(id.to_string()).into())
    }

    /// Snapshot of the current state of a security.
    pub fn security(&self, index: SecurityIndex) -> Security {
        self.securities[index.index()].read().clone()
    }

    pub fn market(&self, index: SecurityIndex) -> Market {
        self.securities[index.index()].read().market
    }

    pub fn temperature(&self, index: SecurityIndex) -> Temperature {
        self.securities[index.index()].read().temperature
    }

    /// Overwrite the state of an already-indexed security.
    pub fn apply_security(&self, security: Security) -> Result<SecurityIndex, CoreError> {
        let index = self.find_index(&security.id)?;
        *self.securities[index.index()].write() = security;
        Ok(index)
    }

    /// Record a new last price for a security.
    pub fn apply_price(
        &self,
        id: &SecurityId,
        price: Timed<Decimal>,
    ) -> Result<SecurityIndex, CoreError> {
        let index = self.find_index(id)?;
        self.securities[index.index()].write().last_price = Some(price);
        Ok(index)
    }

    pub fn upsert_composition(&self, composition: IndexComposition) {
        self.compositions.write().upsert(composition);
    }

    pub fn composition_on(&self, parent: &SecurityId, date: NaiveDate) -> Option<IndexComposition> {
        self.compositions.read().composition_on(parent, date).cloned()
    }

    pub fn upsert_counterparty(&self, counterparty: Counterparty) {
        self.counterparties
            .write()
            .insert(counterparty.id.clone(), counterparty);
    }

    pub fn counterparty(&self, id: &CounterpartyId) -> Option<Counterparty> {
        self.counterparties.read().get(id).cloned()
    }

    pub fn upsert_aggregation_unit(&self, unit: AggregationUnit) {
        self.aggregation_units.write().insert(unit.id.clone(), unit);
    }

    pub fn aggregation_unit(&self, id: &AggregationUnitId) -> Option<AggregationUnit> {
        self.aggregation_units.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use garner_instrument::{security::SecurityStatus, test_utils::security};
    use rust_decimal_macros::dec;

    #[test]
    fn test_apply_security_rejects_unknown_universe_member() {
        let reference = ReferenceData::from_universe(IndexedSecurities::new([security(
            "AAPL",
            Market::Us,
        )]));

        let mut update = security("AAPL", Market::Us);
        update.status = SecurityStatus::Suspended;
        let index = reference.apply_security(update).unwrap();
        assert_eq!(
            reference.security(index).status,
            SecurityStatus::Suspended
        );

        let unknown = security("TSLA", Market::Us);
        assert!(matches!(
            reference.apply_security(unknown),
            Err(CoreError::Validation(ValidationError::UnknownSecurity(_)))
        ));
    }

    #[test]
    fn test_apply_price_updates_snapshot() {
        let reference = ReferenceData::from_universe(IndexedSecurities::new([security(
            "AAPL",
            Market::Us,
        )]));

        let index = reference
            .apply_price(&SecurityId::new("AAPL"), Timed::new(dec!(187.5), Utc::now()))
            .unwrap();
        assert_eq!(
            reference.security(index).last_price.map(|price| price.value),
            Some(dec!(187.5))
        );
    }
}
