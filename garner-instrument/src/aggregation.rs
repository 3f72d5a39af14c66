use crate::{Audit, market::Market};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Unique identifier for an [`AggregationUnit`].
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct AggregationUnitId(SmolStr);

impl AggregationUnitId {
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

impl From<&str> for AggregationUnitId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Regulatory activity-segregation bucket used for short-sell limit tracking and reporting.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct AggregationUnit {
    pub id: AggregationUnitId,
    pub market: Market,
    /// Responsible officer accountable for the unit's regulatory reporting.
    pub officer: SmolStr,
    pub audit: Audit,
}
