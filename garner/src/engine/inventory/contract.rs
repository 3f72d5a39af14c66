use chrono::NaiveDate;
use derive_more::Display;
use garner_instrument::{Audit, counterparty::CounterpartyId, security::SecurityId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Unique identifier for a [`Contract`].
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct ContractId(SmolStr);

impl ContractId {
    pub fn new<Id>(id: Id) -> Self
    where
        Id: Into<SmolStr>,
    {
        Self(id.into())
    }
}

impl From<&str> for ContractId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Direction of a securities finance contract from the firm's perspective.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractDirection {
    Borrow,
    Loan,
    Pledge,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    Open,
    Closed,
}

/// Borrow/loan/pledge contract consumed by availability calculations.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Contract {
    pub id: ContractId,
    pub security: SecurityId,
    pub counterparty: CounterpartyId,
    pub direction: ContractDirection,
    pub quantity: Decimal,
    pub rate: Option<Decimal>,
    pub open_date: NaiveDate,
    pub close_date: Option<NaiveDate>,
    pub state: ContractState,
    pub audit: Audit,
}

impl Contract {
    /// True if the contract is open on the provided business date.
    pub fn is_open_on(&self, date: NaiveDate) -> bool {
        self.state == ContractState::Open
            && self.open_date <= date
            && self.close_date.is_none_or(|close| date < close)
    }
}
