use crate::{
    engine::position::PositionProvenance,
    event::{EventHeader, EventId, TradeEvent},
};
use chrono::{DateTime, NaiveDate, Utc};
use garner_instrument::{
    book::BookId, index::IndexedSecurities, market::Market, security::SecurityId,
    test_utils::security,
};
use rust_decimal::Decimal;

/// Fixed wall-clock instant used across test suites: midday on 2024-06-03 (a Monday).
pub fn test_time() -> DateTime<Utc> {
    "2024-06-03T12:00:00Z".parse().unwrap()
}

pub fn test_date() -> NaiveDate {
    "2024-06-03".parse().unwrap()
}

/// Event header stamped with a fresh random id for the provided business date.
pub fn header_on(business_date: NaiveDate) -> EventHeader {
    EventHeader::new(
        EventId::random(),
        test_time(),
        business_date,
        "test-harness".into(),
        None,
    )
}

/// US equity universe from plain tickers.
pub fn universe(ids: &[&str]) -> IndexedSecurities {
    IndexedSecurities::new(ids.iter().map(|id| security(id, Market::Us)))
}

/// House-provenance trade with explicit settlement date.
pub fn trade(
    book: &str,
    security: &str,
    quantity: Decimal,
    business_date: NaiveDate,
    settlement_date: NaiveDate,
) -> TradeEvent {
    TradeEvent::new(
        header_on(business_date),
        BookId::new(book),
        SecurityId::new(security),
        quantity,
        settlement_date,
        false,
        PositionProvenance::House,
    )
}
