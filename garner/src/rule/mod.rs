use crate::engine::inventory::availability::CalculationType;
use chrono::NaiveDate;
use derive_more::Display;
use fnv::FnvHashMap;
use garner_instrument::{market::Market, security::Temperature};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Compilation of [`CalculationRule`]s into an immutable evaluable form, and the atomically
/// swappable handle engines evaluate against.
pub mod compile;

/// Name of a [`CalculationRule`]; `(name, version)` is the rule key.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct RuleName(SmolStr);

impl RuleName {
    pub fn new<Name>(name: Name) -> Self
    where
        Name: Into<SmolStr>,
    {
        Self(name.into())
    }
}

impl From<&str> for RuleName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle state of a rule. Only `Active` rules compile into the evaluable set.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Active,
    Inactive,
    Draft,
}

/// Decision a rule chain can attach to the evaluated context.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Approved,
    Rejected,
    Pending,
}

/// Closed attribute set a rule condition may reference.
///
/// Attribute names compile to these dense ids on rule load - there is no reflective property
/// lookup at evaluation time.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Market,
    SecurityKind,
    SecurityStatus,
    Temperature,
    CounterpartyKind,
    PositionProvenance,
    SwapCash,
    LocateType,
    RequestedQuantity,
    IsBasket,
}

impl Attribute {
    /// Resolve a source-form attribute name. Accepts both snake_case and the upstream
    /// camelCase spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "market" => Some(Attribute::Market),
            "security_kind" | "securityType" => Some(Attribute::SecurityKind),
            "security_status" | "securityStatus" => Some(Attribute::SecurityStatus),
            "temperature" => Some(Attribute::Temperature),
            "counterparty_kind" | "counterpartyType" => Some(Attribute::CounterpartyKind),
            "position_provenance" | "positionProvenance" => Some(Attribute::PositionProvenance),
            "swap_cash" | "swapCashIndicator" => Some(Attribute::SwapCash),
            "locate_type" | "locateType" => Some(Attribute::LocateType),
            "requested_quantity" | "requestedQuantity" => Some(Attribute::RequestedQuantity),
            "is_basket" | "isBasketProduct" => Some(Attribute::IsBasket),
            _ => None,
        }
    }
}

/// A fact value a condition operand or context attribute can hold.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Text(SmolStr),
    Number(Decimal),
    Flag(bool),
}

impl Value {
    pub fn text<T>(text: T) -> Self
    where
        T: Into<SmolStr>,
    {
        Value::Text(text.into())
    }

    fn as_number(&self) -> Option<Decimal> {
        match self {
            Value::Number(number) => Some(*number),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Flag(value)
    }
}

impl From<Market> for Value {
    fn from(value: Market) -> Self {
        Value::text(value.as_str())
    }
}

impl From<Temperature> for Value {
    fn from(value: Temperature) -> Self {
        Value::text(match value {
            Temperature::Htb => "htb",
            Temperature::Gc => "gc",
            Temperature::Unknown => "unknown",
        })
    }
}

/// Condition operator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Matches,
    Exists,
}

/// Boolean operator joining a condition to the terms evaluated before it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
}

/// Operand of a condition; `None` for operand-free operators (`Exists`).
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionValue {
    #[default]
    None,
    One(Value),
    Many(Vec<Value>),
}

/// Single term of a rule's condition expression, in source (uncompiled) form.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Condition {
    pub attribute: SmolStr,
    pub op: Op,
    #[serde(default)]
    pub value: ConditionValue,
    /// Operator joining this term to the expression before it; `And` when unspecified.
    #[serde(default)]
    pub logical: Option<LogicalOp>,
}

/// Field a `Scale` action multiplies.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleField {
    Gross,
    Available,
}

/// Closed action set executed when a rule matches.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Include,
    Exclude,
    SetStatus(DecisionStatus),
    SetTemperature(Temperature),
    SetBorrowRate(Decimal),
    Scale { field: ScaleField, factor: Decimal },
    MarkOverborrow,
    Stop,
}

/// Prioritised conditional program applied during availability calculation and locate
/// decisioning.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CalculationRule {
    pub name: RuleName,
    pub version: u32,
    pub rule_type: CalculationType,
    /// Market the rule applies to; `None` applies to all markets.
    pub market: Option<Market>,
    /// Lower priority evaluates earlier.
    pub priority: u32,
    pub effective: NaiveDate,
    pub expiry: Option<NaiveDate>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub state: RuleState,
}

impl CalculationRule {
    /// True if `[effective, expiry]` brackets the provided business date.
    pub fn brackets(&self, date: NaiveDate) -> bool {
        self.effective <= date && self.expiry.is_none_or(|expiry| date <= expiry)
    }
}

/// Attribute -> value mapping a rule chain is evaluated against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactContext {
    values: FnvHashMap<Attribute, Value>,
}

impl FactContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attribute: Attribute, value: impl Into<Value>) -> Self {
        self.values.insert(attribute, value.into());
        self
    }

    pub fn get(&self, attribute: Attribute) -> Option<&Value> {
        self.values.get(&attribute)
    }
}
