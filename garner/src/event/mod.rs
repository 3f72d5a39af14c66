use crate::{
    engine::{
        inventory::{availability::InventoryAvailability, contract::Contract},
        position::{Position, PositionProvenance},
    },
    locate::{LocateRequestId, LocateSubmission},
    rule::CalculationRule,
    validate::RejectReason,
};
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::{Constructor, Display, From};
use garner_instrument::{
    aggregation::AggregationUnit,
    basket::IndexComposition,
    book::BookId,
    counterparty::Counterparty,
    security::{Security, SecurityId},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

/// Globally unique event identifier, used for at-least-once deduplication.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Common header carried by every ingress event.
///
/// `offset` is the producer offset within the event's topic partition; per-security ordering
/// follows it.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct EventHeader {
    pub id: EventId,
    pub time_effective: DateTime<Utc>,
    pub business_date: NaiveDate,
    pub source: SmolStr,
    pub offset: Option<u64>,
}

/// Ingress event processed by the dispatcher.
///
/// One variant per logical ingress topic. Variant payloads are already parsed - vendor file
/// formats are decoded upstream of the core.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, From)]
pub enum IngressEvent {
    Reference(ReferenceEvent),
    Market(MarketDataEvent),
    Trade(TradeEvent),
    Contract(ContractEvent),
    Position(PositionEvent),
    Inventory(InventoryEvent),
    Locate(LocateEvent),
    Workflow(WorkflowEvent),
}

impl IngressEvent {
    pub fn header(&self) -> &EventHeader {
        match self {
            IngressEvent::Reference(event) => &event.header,
            IngressEvent::Market(event) => &event.header,
            IngressEvent::Trade(event) => &event.header,
            IngressEvent::Contract(event) => &event.header,
            IngressEvent::Position(event) => &event.header,
            IngressEvent::Inventory(event) => &event.header,
            IngressEvent::Locate(event) => &event.header,
            IngressEvent::Workflow(event) => &event.header,
        }
    }

    /// Partition key: events carrying the same security are processed in producer order.
    pub fn security_id(&self) -> Option<&SecurityId> {
        match self {
            IngressEvent::Reference(event) => match &event.kind {
                ReferenceKind::Security(security) => Some(&security.id),
                ReferenceKind::Composition(composition) => Some(&composition.parent),
                ReferenceKind::Counterparty(_) | ReferenceKind::AggregationUnit(_) => None,
            },
            IngressEvent::Market(event) => Some(&event.security),
            IngressEvent::Trade(event) => Some(&event.security),
            IngressEvent::Contract(event) => Some(&event.contract.security),
            IngressEvent::Position(event) => match &event.kind {
                PositionEventKind::PositionUpdate { security, .. }
                | PositionEventKind::SettlementLadderUpdate { security, .. } => Some(security),
                PositionEventKind::StartOfDay { .. } => None,
            },
            IngressEvent::Inventory(event) => match &event.kind {
                InventoryEventKind::ExternalAvailability { security, .. }
                | InventoryEventKind::Recalculate { security } => Some(security),
            },
            IngressEvent::Locate(event) => match &event.kind {
                LocateEventKind::Submit(submission) => Some(&submission.security),
                _ => None,
            },
            IngressEvent::Workflow(_) => None,
        }
    }

    /// Stable subtype name for logs and metrics.
    pub fn sub_kind(&self) -> &'static str {
        match self {
            IngressEvent::Reference(event) => match event.kind {
                ReferenceKind::Security(_) => "reference.security",
                ReferenceKind::Composition(_) => "reference.composition",
                ReferenceKind::Counterparty(_) => "reference.counterparty",
                ReferenceKind::AggregationUnit(_) => "reference.aggregation_unit",
            },
            IngressEvent::Market(event) => match event.kind {
                MarketDataKind::Price(_) => "market.price",
                MarketDataKind::Nav(_) => "market.nav",
                MarketDataKind::Volatility(_) => "market.volatility",
            },
            IngressEvent::Trade(_) => "trade",
            IngressEvent::Contract(_) => "contract",
            IngressEvent::Position(event) => match event.kind {
                PositionEventKind::PositionUpdate { .. } => "position.update",
                PositionEventKind::SettlementLadderUpdate { .. } => "position.ladder",
                PositionEventKind::StartOfDay { .. } => "position.start_of_day",
            },
            IngressEvent::Inventory(event) => match event.kind {
                InventoryEventKind::ExternalAvailability { .. } => "inventory.external",
                InventoryEventKind::Recalculate { .. } => "inventory.recalculate",
            },
            IngressEvent::Locate(event) => match event.kind {
                LocateEventKind::Submit(_) => "locate.submit",
                LocateEventKind::Approve { .. } => "locate.approve",
                LocateEventKind::Reject { .. } => "locate.reject",
                LocateEventKind::Cancel { .. } => "locate.cancel",
            },
            IngressEvent::Workflow(event) => match event.kind {
                WorkflowEventKind::RuleSetUpdate(_) => "workflow.rule_set",
                WorkflowEventKind::QuarantineClear { .. } => "workflow.quarantine_clear",
            },
        }
    }
}

/// Reference-data update (already parsed upstream).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct ReferenceEvent {
    pub header: EventHeader,
    pub kind: ReferenceKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, From)]
pub enum ReferenceKind {
    Security(Security),
    Composition(IndexComposition),
    Counterparty(Counterparty),
    AggregationUnit(AggregationUnit),
}

/// Market data update for a single security.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct MarketDataEvent {
    pub header: EventHeader,
    pub security: SecurityId,
    pub kind: MarketDataKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub enum MarketDataKind {
    Price(Decimal),
    Nav(Decimal),
    Volatility(Decimal),
}

/// A booked trade affecting contractual quantity and the settlement ladder.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct TradeEvent {
    pub header: EventHeader,
    pub book: BookId,
    pub security: SecurityId,
    /// Signed quantity: positive buys, negative sells.
    pub quantity: Decimal,
    pub settlement_date: NaiveDate,
    /// Fan out to constituents when the security is a basket product.
    pub expand: bool,
    pub provenance: PositionProvenance,
}

/// Borrow/loan/pledge contract lifecycle event.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct ContractEvent {
    pub header: EventHeader,
    pub lifecycle: ContractLifecycle,
    pub contract: Contract,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum ContractLifecycle {
    Opened,
    Updated,
    Closed,
}

/// Direct position mutation (deltas, ladder updates, start-of-day).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct PositionEvent {
    pub header: EventHeader,
    pub kind: PositionEventKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum PositionEventKind {
    PositionUpdate {
        book: BookId,
        security: SecurityId,
        contractual_delta: Decimal,
        settled_delta: Decimal,
        provenance: PositionProvenance,
        expand: bool,
    },
    SettlementLadderUpdate {
        book: BookId,
        security: SecurityId,
        settlement_date: NaiveDate,
        receipt: Decimal,
        deliver: Decimal,
    },
    StartOfDay {
        /// Restrict the roll to a single book, or all books when `None`.
        book: Option<BookId>,
    },
}

/// Inventory-side input event.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct InventoryEvent {
    pub header: EventHeader,
    pub kind: InventoryEventKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum InventoryEventKind {
    /// External lender availability; last value wins per `(security, source)`.
    ExternalAvailability {
        security: SecurityId,
        quantity: Decimal,
        source: SmolStr,
    },
    /// Operational trigger to recompute all availability for a security.
    Recalculate { security: SecurityId },
}

/// Locate request lifecycle event.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct LocateEvent {
    pub header: EventHeader,
    pub kind: LocateEventKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum LocateEventKind {
    Submit(LocateSubmission),
    Approve {
        request: LocateRequestId,
        approved_quantity: Decimal,
    },
    Reject {
        request: LocateRequestId,
        reason: SmolStr,
    },
    Cancel {
        request: LocateRequestId,
    },
}

/// Administrative workflow event.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct WorkflowEvent {
    pub header: EventHeader,
    pub kind: WorkflowEventKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum WorkflowEventKind {
    /// Replace the active calculation rule-set atomically.
    RuleSetUpdate(Vec<CalculationRule>),
    /// Operator clearing of a quarantined limit key.
    QuarantineClear { key: String },
}

/// Derived event published for downstream consumers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, From)]
pub enum EgressEvent {
    PositionUpdated(PositionUpdated),
    InventoryUpdated(InventoryUpdated),
    LocateApproved(LocateApproved),
    LocateRejected(LocateRejected),
    OrderValidated(OrderValidated),
}

impl EgressEvent {
    /// Logical egress topic the event belongs to.
    pub fn topic(&self) -> &'static str {
        match self {
            EgressEvent::PositionUpdated(_) => "position.updated.v1",
            EgressEvent::InventoryUpdated(_) => "inventory.updated.v1",
            EgressEvent::LocateApproved(_) => "locate.approved.v1",
            EgressEvent::LocateRejected(_) => "locate.rejected.v1",
            EgressEvent::OrderValidated(_) => "order.validated.v1",
        }
    }

    pub fn id(&self) -> EventId {
        match self {
            EgressEvent::PositionUpdated(event) => event.id,
            EgressEvent::InventoryUpdated(event) => event.id,
            EgressEvent::LocateApproved(event) => event.id,
            EgressEvent::LocateRejected(event) => event.id,
            EgressEvent::OrderValidated(event) => event.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct PositionUpdated {
    pub id: EventId,
    pub time: DateTime<Utc>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct InventoryUpdated {
    pub id: EventId,
    pub time: DateTime<Utc>,
    pub availability: InventoryAvailability,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct LocateApproved {
    pub id: EventId,
    pub time: DateTime<Utc>,
    pub request: LocateRequestId,
    pub security: SecurityId,
    pub approved_quantity: Decimal,
    pub decrement_quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct LocateRejected {
    pub id: EventId,
    pub time: DateTime<Utc>,
    pub request: LocateRequestId,
    pub reason: SmolStr,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct OrderValidated {
    pub id: EventId,
    pub time: DateTime<Utc>,
    pub order_id: SmolStr,
    pub approved: bool,
    pub reason: Option<RejectReason>,
    pub latency_ms: u64,
}
