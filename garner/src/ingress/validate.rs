use crate::{
    clock::{BusinessCalendar, Clock},
    error::ValidationError,
    event::{EventId, IngressEvent, InventoryEventKind, LocateEventKind},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashSet;
use garner_instrument::market::Market;
use rust_decimal::Decimal;
use std::{collections::VecDeque, sync::Arc, time::Duration};

/// Sliding-window event id deduplicator.
///
/// Ids older than the window are pruned on observation; within the window a repeated id is
/// reported as a duplicate. The default window is 24 hours.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    inner: parking_lot::Mutex<DedupState>,
}

#[derive(Debug, Default)]
struct DedupState {
    seen: FnvHashSet<EventId>,
    order: VecDeque<(DateTime<Utc>, EventId)>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: parking_lot::Mutex::new(DedupState::default()),
        }
    }

    /// Record an id; returns false when it was already observed within the window.
    pub fn observe(&self, id: EventId, now: DateTime<Utc>) -> bool {
        let mut state = self.inner.lock();

        let horizon =
            now - chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::zero());
        while let Some((time, old)) = state.order.front().cloned() {
            if time >= horizon {
                break;
            }
            state.order.pop_front();
            state.seen.remove(&old);
        }

        if !state.seen.insert(id) {
            return false;
        }
        state.order.push_back((now, id));
        true
    }
}

/// Structural and temporal validation applied to every ingress event before dispatch.
#[derive(Debug)]
pub struct EventValidator<Ck> {
    clock: Arc<Ck>,
    calendar: BusinessCalendar,
    dedup: Deduplicator,
    business_date_window: u32,
}

impl<Ck> EventValidator<Ck>
where
    Ck: Clock,
{
    pub fn new(
        clock: Arc<Ck>,
        calendar: BusinessCalendar,
        dedup_window: Duration,
        business_date_window: u32,
    ) -> Self {
        Self {
            clock,
            calendar,
            dedup: Deduplicator::new(dedup_window),
            business_date_window,
        }
    }

    /// An event is valid iff its required fields are present, its business date falls within
    /// the configured window of today, and its id has not been seen before.
    ///
    /// Invalid events are rejected and never retried.
    pub fn validate(&self, event: &IngressEvent) -> Result<(), ValidationError> {
        self.validate_structure(event)?;

        let header = event.header();
        let today = self.clock.today(Market::Us);
        if !self.calendar.within_window(
            Market::Us,
            header.business_date,
            today,
            self.business_date_window,
        ) {
            return Err(ValidationError::BusinessDateOutOfWindow {
                date: header.business_date,
                today,
                window: self.business_date_window,
            });
        }

        if !self.dedup.observe(header.id, self.clock.now()) {
            return Err(ValidationError::DuplicateEvent(header.id));
        }

        Ok(())
    }

    fn validate_structure(&self, event: &IngressEvent) -> Result<(), ValidationError> {
        if event.header().source.is_empty() {
            return Err(ValidationError::MissingField("source".into()));
        }

        match event {
            IngressEvent::Trade(trade) => {
                if trade.quantity.is_zero() {
                    return Err(ValidationError::Invalid("zero-quantity trade".into()));
                }
            }
            IngressEvent::Locate(locate) => {
                if let LocateEventKind::Submit(submission) = &locate.kind
                    && submission.requested_quantity <= Decimal::ZERO
                {
                    return Err(ValidationError::Invalid(
                        "locate requested quantity must be positive".into(),
                    ));
                }
            }
            IngressEvent::Inventory(inventory) => {
                if let InventoryEventKind::ExternalAvailability { quantity, .. } = &inventory.kind
                    && *quantity < Decimal::ZERO
                {
                    return Err(ValidationError::Invalid(
                        "external availability must be non-negative".into(),
                    ));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::FrozenClock,
        event::{EventHeader, MarketDataEvent, MarketDataKind, TradeEvent},
    };
    use crate::engine::position::PositionProvenance;
    use garner_instrument::{book::BookId, security::SecurityId};
    use rust_decimal_macros::dec;

    fn clock() -> Arc<FrozenClock> {
        Arc::new(FrozenClock::new(
            "2024-06-03T12:00:00Z".parse::<DateTime<Utc>>().unwrap(),
        ))
    }

    fn header(business_date: &str) -> EventHeader {
        EventHeader::new(
            EventId::random(),
            "2024-06-03T12:00:00Z".parse().unwrap(),
            business_date.parse().unwrap(),
            "unit-test".into(),
            None,
        )
    }

    fn market_event(business_date: &str) -> IngressEvent {
        MarketDataEvent::new(
            header(business_date),
            SecurityId::new("AAPL"),
            MarketDataKind::Price(dec!(100)),
        )
        .into()
    }

    #[test]
    fn test_duplicate_event_rejected_within_window() {
        let validator = EventValidator::new(
            clock(),
            BusinessCalendar::default(),
            Duration::from_secs(24 * 60 * 60),
            5,
        );

        let event = market_event("2024-06-03");
        assert!(validator.validate(&event).is_ok());
        assert!(matches!(
            validator.validate(&event),
            Err(ValidationError::DuplicateEvent(_))
        ));

        // A distinct id passes
        assert!(validator.validate(&market_event("2024-06-03")).is_ok());
    }

    #[test]
    fn test_dedup_window_prunes_old_ids() {
        let dedup = Deduplicator::new(Duration::from_secs(60));
        let id = EventId::random();
        let start = "2024-06-03T12:00:00Z".parse::<DateTime<Utc>>().unwrap();

        assert!(dedup.observe(id, start));
        assert!(!dedup.observe(id, start + chrono::Duration::seconds(30)));
        // Outside the window the id is forgotten
        assert!(dedup.observe(id, start + chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_business_date_window() {
        let validator = EventValidator::new(
            clock(),
            BusinessCalendar::default(),
            Duration::from_secs(24 * 60 * 60),
            5,
        );

        assert!(validator.validate(&market_event("2024-06-10")).is_ok());
        assert!(matches!(
            validator.validate(&market_event("2024-06-11")),
            Err(ValidationError::BusinessDateOutOfWindow { .. })
        ));
        assert!(matches!(
            validator.validate(&market_event("2024-05-20")),
            Err(ValidationError::BusinessDateOutOfWindow { .. })
        ));
    }

    #[test]
    fn test_zero_quantity_trade_rejected() {
        let validator = EventValidator::new(
            clock(),
            BusinessCalendar::default(),
            Duration::from_secs(24 * 60 * 60),
            5,
        );

        let trade: IngressEvent = TradeEvent::new(
            header("2024-06-03"),
            BookId::new("B1"),
            SecurityId::new("AAPL"),
            dec!(0),
            "2024-06-05".parse().unwrap(),
            false,
            PositionProvenance::House,
        )
        .into();

        assert!(matches!(
            validator.validate(&trade),
            Err(ValidationError::Invalid(_))
        ));
    }
}
