use crate::Audit;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Unique identifier for a [`Counterparty`].
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct CounterpartyId(SmolStr);

impl CounterpartyId {
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

impl From<&str> for CounterpartyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Classification of a [`Counterparty`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterpartyKind {
    Client,
    InternalEntity,
    Broker,
    Other,
}

impl CounterpartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterpartyKind::Client => "client",
            CounterpartyKind::InternalEntity => "internal_entity",
            CounterpartyKind::Broker => "broker",
            CounterpartyKind::Other => "other",
        }
    }
}

/// KYC standing of a [`Counterparty`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    Approved,
    Pending,
    Rejected,
}

/// Counterparty reference entity.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Counterparty {
    pub id: CounterpartyId,
    pub kind: CounterpartyKind,
    pub name: SmolStr,
    pub kyc: KycStatus,
    pub audit: Audit,
}

impl Counterparty {
    pub fn is_client(&self) -> bool {
        matches!(self.kind, CounterpartyKind::Client)
    }
}
