use crate::rule::{DecisionStatus, RuleName};
use chrono::NaiveDate;
use garner_instrument::{
    Audit,
    aggregation::AggregationUnitId,
    counterparty::CounterpartyId,
    market::Market,
    security::{SecurityId, SecurityIndex, Temperature},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Availability calculation families.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationType {
    ForLoan,
    ForPledge,
    ShortSell,
    LongSell,
    Locate,
    Overborrow,
}

/// Canonical availability record key.
///
/// Counterparty and aggregation unit dimensions are optional: firm-level records carry
/// neither.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct AvailabilityKey {
    pub security: SecurityIndex,
    pub counterparty: Option<CounterpartyId>,
    pub aggregation_unit: Option<AggregationUnitId>,
    pub calculation: CalculationType,
    pub business_date: NaiveDate,
}

impl AvailabilityKey {
    /// Firm-level key without counterparty or aggregation unit dimensions.
    pub fn firm(
        security: SecurityIndex,
        calculation: CalculationType,
        business_date: NaiveDate,
    ) -> Self {
        Self {
            security,
            counterparty: None,
            aggregation_unit: None,
            calculation,
            business_date,
        }
    }
}

/// Violation of the availability accounting invariants.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum AvailabilityError {
    #[error("insufficient availability: requested {requested}, available {available}")]
    Insufficient {
        requested: Decimal,
        available: Decimal,
    },

    #[error("release of {released} exceeds reserved {reserved}")]
    OverRelease { released: Decimal, reserved: Decimal },
}

/// Derived availability of a security for one calculation type on a business date.
///
/// Owned and mutated by the inventory engine only. At the end of any atomic update:
/// `available_quantity + reserved_quantity <= gross_quantity` and
/// `available_quantity >= 0`.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct InventoryAvailability {
    pub security: SecurityIndex,
    pub security_id: SecurityId,
    pub counterparty: Option<CounterpartyId>,
    pub aggregation_unit: Option<AggregationUnitId>,
    pub calculation: CalculationType,
    pub business_date: NaiveDate,

    pub gross_quantity: Decimal,
    pub net_quantity: Decimal,
    pub available_quantity: Decimal,
    pub reserved_quantity: Decimal,
    pub decrement_quantity: Decimal,

    pub market: Market,
    pub temperature: Temperature,
    pub borrow_rate: Option<Decimal>,
    /// `(name, version)` of the rule that shaped this record, if any matched.
    pub applied_rule: Option<(RuleName, u32)>,
    pub status: DecisionStatus,
    /// True when external lender availability contributed to the quantities.
    pub external_source: bool,

    pub audit: Audit,
}

impl InventoryAvailability {
    pub fn key(&self) -> AvailabilityKey {
        AvailabilityKey {
            security: self.security,
            counterparty: self.counterparty.clone(),
            aggregation_unit: self.aggregation_unit.clone(),
            calculation: self.calculation,
            business_date: self.business_date,
        }
    }

    /// Move quantity from available to reserved.
    pub fn reserve(&mut self, quantity: Decimal) -> Result<(), AvailabilityError> {
        if quantity > self.available_quantity {
            return Err(AvailabilityError::Insufficient {
                requested: quantity,
                available: self.available_quantity,
            });
        }
        self.available_quantity -= quantity;
        self.reserved_quantity += quantity;
        self.decrement_quantity += quantity;
        Ok(())
    }

    /// Return previously reserved quantity to available.
    pub fn release(&mut self, quantity: Decimal) -> Result<(), AvailabilityError> {
        if quantity > self.reserved_quantity {
            return Err(AvailabilityError::OverRelease {
                released: quantity,
                reserved: self.reserved_quantity,
            });
        }
        self.reserved_quantity -= quantity;
        self.available_quantity += quantity;
        self.decrement_quantity -= quantity;
        Ok(())
    }

    /// Accounting invariants that must hold after every atomic update.
    pub fn invariants_hold(&self) -> bool {
        self.available_quantity >= Decimal::ZERO
            && self.available_quantity + self.reserved_quantity <= self.gross_quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn record(gross: Decimal) -> InventoryAvailability {
        InventoryAvailability {
            security: SecurityIndex(0),
            security_id: SecurityId::new("AAPL"),
            counterparty: None,
            aggregation_unit: None,
            calculation: CalculationType::Locate,
            business_date: "2024-06-03".parse().unwrap(),
            gross_quantity: gross,
            net_quantity: gross,
            available_quantity: gross,
            reserved_quantity: Decimal::ZERO,
            decrement_quantity: Decimal::ZERO,
            market: Market::Us,
            temperature: Temperature::Unknown,
            borrow_rate: None,
            applied_rule: None,
            status: DecisionStatus::Approved,
            external_source: false,
            audit: Audit::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    #[test]
    fn test_reserve_release_accounting() {
        let mut record = record(dec!(1000));

        record.reserve(dec!(300)).unwrap();
        assert_eq!(record.available_quantity, dec!(700));
        assert_eq!(record.reserved_quantity, dec!(300));
        assert!(record.invariants_hold());

        assert!(matches!(
            record.reserve(dec!(701)),
            Err(AvailabilityError::Insufficient { .. })
        ));

        record.release(dec!(300)).unwrap();
        assert_eq!(record.available_quantity, dec!(1000));
        assert_eq!(record.reserved_quantity, dec!(0));
        assert!(matches!(
            record.release(dec!(1)),
            Err(AvailabilityError::OverRelease { .. })
        ));
    }
}
