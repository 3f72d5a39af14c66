#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Garner-Instrument
//! Garner-Instrument contains core Security, Counterparty and AggregationUnit reference data
//! structures and associated utilities.
//!
//! These entities are deliberately flat: shared audit fields are composed via the [`Audit`]
//! header rather than any entity hierarchy. Every other Garner crate references these entities
//! by id or by index only.

use chrono::{DateTime, Utc};
use derive_more::Constructor;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Defines the [`Market`](market::Market) enum covering all supported trading markets, and
/// per-market settlement conventions.
pub mod market;

/// [`Security`](security::Security) related data structures.
///
/// eg/ `SecurityKind`, `SecurityStatus`, `Temperature`, cross-source identifiers, etc.
pub mod security;

/// [`Counterparty`](counterparty::Counterparty) related data structures.
pub mod counterparty;

/// [`AggregationUnit`](aggregation::AggregationUnit) regulatory reporting unit.
pub mod aggregation;

/// [`BookId`](book::BookId) trading book identifier.
pub mod book;

/// Effective-dated [`IndexComposition`](basket::IndexComposition) linkage used for basket
/// product expansion.
pub mod basket;

/// Indexed collection of securities. Provides a builder utility for indexing non-indexed
/// collections.
pub mod index;

/// A keyed value.
///
/// eg/ Keyed<SecurityIndex, Security>
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
pub struct Keyed<Key, Value> {
    pub key: Key,
    pub value: Value,
}

impl<Key, Value> AsRef<Value> for Keyed<Key, Value> {
    fn as_ref(&self) -> &Value {
        &self.value
    }
}

impl<Key, Value> Display for Keyed<Key, Value>
where
    Key: Display,
    Value: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {}", self.key, self.value)
    }
}

/// A timed value.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Deserialize,
    Serialize,
    Constructor,
)]
pub struct Timed<T> {
    pub value: T,
    pub time: DateTime<Utc>,
}

/// Shared audit header composed into every persisted reference entity.
///
/// The `version` drives optimistic concurrency checks at the store boundary.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct Audit {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Audit {
    /// Construct a first-version `Audit` header stamped with the provided time.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            version: 1,
            created_at: time,
            updated_at: time,
        }
    }

    /// Increment the entity version, stamping the update time.
    pub fn touch(&mut self, time: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = time;
    }
}

pub mod test_utils {
    use crate::{
        Audit, Timed,
        market::Market,
        security::{
            Security, SecurityId, SecurityIdentifiers, SecurityKind, SecurityStatus, Temperature,
        },
    };
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;

    /// Construct an active equity [`Security`] with the provided internal id and market.
    pub fn security(id: &str, market: Market) -> Security {
        Security {
            id: SecurityId::new(id),
            kind: SecurityKind::Equity,
            issuer: id.into(),
            market,
            status: SecurityStatus::Active,
            is_basket: false,
            identifiers: SecurityIdentifiers::default(),
            last_price: None,
            temperature: Temperature::Unknown,
            lot_size: Decimal::ONE,
            audit: Audit::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Construct a basket (index) [`Security`] with the provided internal id and market.
    pub fn basket_security(id: &str, market: Market) -> Security {
        Security {
            kind: SecurityKind::Index,
            is_basket: true,
            ..security(id, market)
        }
    }

    /// Construct a [`Timed`] price value.
    pub fn priced(value: Decimal, time: DateTime<Utc>) -> Timed<Decimal> {
        Timed::new(value, time)
    }
}
