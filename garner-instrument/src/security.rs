use crate::{Audit, Timed, market::Market};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Unique internal identifier for a [`Security`].
///
/// All cross-entity references use this id (or a [`SecurityIndex`]) - never an external
/// identifier, which may be ambiguous across sources.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct SecurityId(SmolStr);

impl SecurityId {
    pub fn new<Id>(id: Id) -> Self
    where
        Id: Into<SmolStr>,
    {
        Self(id.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SecurityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Unique index for a [`Security`] in an
/// [`IndexedSecurities`](crate::index::IndexedSecurities) collection.
///
/// Used to key engine state in a memory efficient way.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct SecurityIndex(pub usize);

impl SecurityIndex {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Classification of a [`Security`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityKind {
    Equity,
    Bond,
    Etf,
    Index,
    Other,
}

impl SecurityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityKind::Equity => "equity",
            SecurityKind::Bond => "bond",
            SecurityKind::Etf => "etf",
            SecurityKind::Index => "index",
            SecurityKind::Other => "other",
        }
    }
}

/// Reference status of a [`Security`].
///
/// Only `Active` securities participate in availability calculations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityStatus {
    Active,
    Inactive,
    Suspended,
}

/// Borrow temperature classification of a [`Security`].
///
/// Hard-To-Borrow vs General Collateral, driving locate decrement policy and borrow rates.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Temperature {
    Htb,
    Gc,
    Unknown,
}

/// Cross-source identifiers for a [`Security`].
///
/// Any subset may be present; sources disagree on coverage.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize)]
pub struct SecurityIdentifiers {
    pub isin: Option<SmolStr>,
    pub cusip: Option<SmolStr>,
    pub sedol: Option<SmolStr>,
    pub ticker: Option<SmolStr>,
}

impl SecurityIdentifiers {
    /// Iterate all present identifiers.
    pub fn iter(&self) -> impl Iterator<Item = &SmolStr> {
        [&self.isin, &self.cusip, &self.sedol, &self.ticker]
            .into_iter()
            .filter_map(Option::as_ref)
    }
}

/// Immutable reference entity describing a tradable security.
///
/// Created and updated by reference-data ingress only; all other components read it via the
/// indexed collection and reference it by [`SecurityId`] / [`SecurityIndex`].
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Security {
    pub id: SecurityId,
    pub kind: SecurityKind,
    pub issuer: SmolStr,
    pub market: Market,
    pub status: SecurityStatus,
    pub is_basket: bool,
    pub identifiers: SecurityIdentifiers,
    pub last_price: Option<Timed<Decimal>>,
    pub temperature: Temperature,
    /// Minimum tradable quantity increment, used when rounding basket expansions.
    pub lot_size: Decimal,
    pub audit: Audit,
}

impl Security {
    pub fn is_active(&self) -> bool {
        matches!(self.status, SecurityStatus::Active)
    }
}
