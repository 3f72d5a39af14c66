use crate::{
    clock::{BusinessCalendar, Clock},
    engine::position::ladder::{LADDER_DEPTH, SettlementLadder, offset_for},
    error::{CoreError, ValidationError},
    event::{
        EventId, MarketDataEvent, MarketDataKind, PositionEvent, PositionEventKind,
        PositionUpdated, TradeEvent,
    },
    lock::KeyedLocks,
    metrics::Metrics,
    outbox::Outbox,
    reference::ReferenceData,
    store::Store,
};
use chrono::NaiveDate;
use garner_instrument::{
    Audit,
    book::BookId,
    security::{SecurityId, SecurityIndex},
};
use garner_integration::collection::OneOrMany;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tracing::{debug, warn};

pub mod ladder;

/// Origin of the quantity held in a position.
///
/// Taiwan availability rules exclude `Borrowed` positions (borrowed shares must not be
/// re-lent) and overborrow identification nets borrowed quantity against `House` longs.
#[derive(
    Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PositionProvenance {
    #[default]
    House,
    Borrowed,
    Client,
}

/// Recalculation state of a position record.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationStatus {
    Pending,
    Valid,
    Error,
}

/// Canonical position key: exactly one active record exists per key.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct PositionKey {
    pub book: BookId,
    pub security: SecurityIndex,
    pub business_date: NaiveDate,
}

/// Current position of a book in a security on a business date, plus its settlement ladder.
///
/// Mutated by the [`PositionEngine`] only. Derived fields are recomputed on every write and
/// always satisfy:
/// - `net_settlement_today == receipt[0] - deliver[0]`
/// - `total_deliveries == Σ deliver`, `total_receipts == Σ receipt`
/// - `projected_settled_qty == settled_qty + net_settlement_today`
/// - `current_net_position == settled_qty + contractual_qty` (trade-date view)
/// - `projected_net_position == settled_qty + total_receipts - total_deliveries`
///   (settlement view - the ladder already carries each unsettled trade, so contractual
///   quantity is not counted a second time)
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub book: BookId,
    pub security: SecurityIndex,
    pub security_id: SecurityId,
    pub business_date: NaiveDate,

    pub contractual_qty: Decimal,
    pub settled_qty: Decimal,
    pub deliver: [Decimal; LADDER_DEPTH],
    pub receipt: [Decimal; LADDER_DEPTH],

    pub is_hypothecatable: bool,
    pub is_reserved: bool,
    pub is_start_of_day: bool,
    /// Set by the first non-start-of-day mutation on this business date.
    pub has_intraday: bool,
    pub provenance: PositionProvenance,

    pub net_settlement_today: Decimal,
    pub total_deliveries: Decimal,
    pub total_receipts: Decimal,
    pub projected_settled_qty: Decimal,
    pub current_net_position: Decimal,
    pub projected_net_position: Decimal,

    /// Marked value at the security's last price, when one is known.
    pub market_value: Option<Decimal>,

    pub calculation_status: CalculationStatus,
    pub calculation_date: NaiveDate,
    pub audit: Audit,
}

impl Position {
    /// Construct an empty position for the key, pending its first calculation.
    pub fn empty(
        book: BookId,
        security: SecurityIndex,
        security_id: SecurityId,
        business_date: NaiveDate,
        audit: Audit,
    ) -> Self {
        Self {
            book,
            security,
            security_id,
            business_date,
            contractual_qty: Decimal::ZERO,
            settled_qty: Decimal::ZERO,
            deliver: [Decimal::ZERO; LADDER_DEPTH],
            receipt: [Decimal::ZERO; LADDER_DEPTH],
            is_hypothecatable: true,
            is_reserved: false,
            is_start_of_day: false,
            has_intraday: false,
            provenance: PositionProvenance::default(),
            net_settlement_today: Decimal::ZERO,
            total_deliveries: Decimal::ZERO,
            total_receipts: Decimal::ZERO,
            projected_settled_qty: Decimal::ZERO,
            current_net_position: Decimal::ZERO,
            projected_net_position: Decimal::ZERO,
            market_value: None,
            calculation_status: CalculationStatus::Pending,
            calculation_date: business_date,
            audit,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey {
            book: self.book.clone(),
            security: self.security,
            business_date: self.business_date,
        }
    }

    /// Recompute every derived field from the primary quantities.
    pub fn recompute_derived(&mut self) {
        self.net_settlement_today = self.receipt[0] - self.deliver[0];
        self.total_deliveries = self.deliver.iter().copied().sum();
        self.total_receipts = self.receipt.iter().copied().sum();
        self.projected_settled_qty = self.settled_qty + self.net_settlement_today;
        self.current_net_position = self.settled_qty + self.contractual_qty;
        self.projected_net_position =
            self.settled_qty + self.total_receipts - self.total_deliveries;
    }

    /// Add settlement quantities for a date; dates outside the ladder window are ignored.
    ///
    /// Returns false when the date was out of window.
    pub fn apply_settlement(
        &mut self,
        settlement_date: NaiveDate,
        receipt: Decimal,
        deliver: Decimal,
    ) -> bool {
        let Some(offset) = offset_for(self.business_date, settlement_date) else {
            return false;
        };
        self.receipt[offset] += receipt;
        self.deliver[offset] += deliver;
        true
    }

    /// Owned settlement ladder view.
    pub fn settlement_ladder(&self) -> SettlementLadder {
        SettlementLadder {
            business_date: self.business_date,
            deliver: self.deliver,
            receipt: self.receipt,
        }
    }

    pub fn is_long(&self) -> bool {
        self.current_net_position > Decimal::ZERO
    }

    /// Mark the position at the provided price.
    pub fn revalue(&mut self, price: Decimal) {
        self.market_value = Some(self.current_net_position * price);
    }

    /// Roll this end-of-day record into a start-of-day record for the next business date.
    ///
    /// Offset-0 settlements settle overnight into `settled_qty` and the ladder shifts left by
    /// one day; contractual quantity carries unchanged; intraday flags reset.
    pub fn roll_to(&self, business_date: NaiveDate, audit: Audit) -> Self {
        let mut rolled = self.clone();
        rolled.business_date = business_date;
        rolled.settled_qty = self.projected_settled_qty;
        for offset in 0..LADDER_DEPTH - 1 {
            rolled.deliver[offset] = self.deliver[offset + 1];
            rolled.receipt[offset] = self.receipt[offset + 1];
        }
        rolled.deliver[LADDER_DEPTH - 1] = Decimal::ZERO;
        rolled.receipt[LADDER_DEPTH - 1] = Decimal::ZERO;
        rolled.is_start_of_day = true;
        rolled.has_intraday = false;
        rolled.calculation_status = CalculationStatus::Valid;
        rolled.calculation_date = business_date;
        rolled.audit = audit;
        rolled.recompute_derived();
        rolled
    }
}

/// Round a basket-expanded quantity to the constituent's lot size with banker's rounding.
pub fn round_to_lot(quantity: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return quantity;
    }
    (quantity / lot_size).round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        * lot_size
}

/// The contractual/settled/settlement parts of a delta before basket expansion.
#[derive(Debug, Copy, Clone)]
struct DeltaParts {
    contractual: Decimal,
    settled: Decimal,
    settlement: Option<(NaiveDate, Decimal, Decimal)>,
}

/// A single keyed mutation extracted from an ingress event, post basket expansion.
#[derive(Debug, Clone)]
struct PositionDelta {
    book: BookId,
    security: SecurityIndex,
    security_id: SecurityId,
    business_date: NaiveDate,
    contractual: Decimal,
    settled: Decimal,
    settlement: Option<(NaiveDate, Decimal, Decimal)>,
    provenance: PositionProvenance,
}

/// Owns all position records and applies trade, position and start-of-day events.
///
/// Concurrent mutations for the same key are serialised by the per-key lock; ordering between
/// events follows the dispatcher's per-security producer ordering.
#[derive(Debug)]
pub struct PositionEngine<St, Ck> {
    reference: Arc<ReferenceData>,
    store: Arc<St>,
    locks: KeyedLocks<PositionKey>,
    outbox: Arc<Outbox>,
    clock: Arc<Ck>,
    calendar: BusinessCalendar,
    metrics: Arc<Metrics>,
}

impl<St, Ck> PositionEngine<St, Ck>
where
    St: Store<PositionKey, Position>,
    Ck: Clock,
{
    pub fn new(
        reference: Arc<ReferenceData>,
        store: Arc<St>,
        outbox: Arc<Outbox>,
        clock: Arc<Ck>,
        calendar: BusinessCalendar,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            reference,
            store,
            locks: KeyedLocks::new(),
            outbox,
            clock,
            calendar,
            metrics,
        }
    }

    /// Apply a booked trade: contractual quantity moves immediately, the settlement ladder
    /// picks up the receipt/delivery at the trade's settlement offset.
    ///
    /// Basket trades flagged `expand` fan out to one position per constituent.
    pub async fn on_trade(&self, event: &TradeEvent) -> Result<OneOrMany<Position>, CoreError> {
        let deltas = self.expand(
            &event.book,
            &event.security,
            event.header.business_date,
            DeltaParts {
                contractual: event.quantity,
                settled: Decimal::ZERO,
                settlement: Some((
                    event.settlement_date,
                    event.quantity.max(Decimal::ZERO),
                    (-event.quantity).max(Decimal::ZERO),
                )),
            },
            event.expand,
            event.provenance,
        )?;

        self.apply_deltas(deltas).await
    }

    /// Apply a position delta or settlement ladder update.
    pub async fn on_position_event(
        &self,
        event: &PositionEvent,
    ) -> Result<OneOrMany<Position>, CoreError> {
        let business_date = event.header.business_date;
        match &event.kind {
            PositionEventKind::PositionUpdate {
                book,
                security,
                contractual_delta,
                settled_delta,
                provenance,
                expand,
            } => {
                let deltas = self.expand(
                    book,
                    security,
                    business_date,
                    DeltaParts {
                        contractual: *contractual_delta,
                        settled: *settled_delta,
                        settlement: None,
                    },
                    *expand,
                    *provenance,
                )?;
                self.apply_deltas(deltas).await
            }
            PositionEventKind::SettlementLadderUpdate {
                book,
                security,
                settlement_date,
                receipt,
                deliver,
            } => {
                let index = self.reference.find_index(security)?;
                let delta = PositionDelta {
                    book: book.clone(),
                    security: index,
                    security_id: security.clone(),
                    business_date,
                    contractual: Decimal::ZERO,
                    settled: Decimal::ZERO,
                    settlement: Some((*settlement_date, *receipt, *deliver)),
                    provenance: PositionProvenance::default(),
                };
                self.apply_deltas(vec![delta]).await
            }
            PositionEventKind::StartOfDay { book } => {
                self.apply_start_of_day(book.as_ref(), business_date)
                    .await?;
                Ok(OneOrMany::Many(Vec::new()))
            }
        }
    }

    /// Revalue today's positions in the affected security at the new price.
    pub async fn on_market_data(&self, event: &MarketDataEvent) -> Result<(), CoreError> {
        let index = self.reference.find_index(&event.security)?;
        let price = match event.kind {
            MarketDataKind::Price(price) | MarketDataKind::Nav(price) => price,
            MarketDataKind::Volatility(_) => return Ok(()),
        };

        for (key, _) in self.store.scan().await? {
            if key.security != index || key.business_date != event.header.business_date {
                continue;
            }
            let _guard = self.acquire_timed(key.clone()).await;

            // Re-read under the lock: scan snapshots race with concurrent writers
            let Some(mut current) = self.store.get(&key).await? else {
                continue;
            };
            current.value.revalue(price);
            current.value.audit.touch(self.clock.now());
            let version = current.version;
            self.persist_and_publish(key, current.value, Some(version))
                .await?;
        }
        Ok(())
    }

    /// Snapshot end-of-day positions of the previous business day into start-of-day records.
    ///
    /// A start-of-day arriving after intraday activity for a key is a conflict - the roll
    /// must never clobber live updates.
    pub async fn apply_start_of_day(
        &self,
        book: Option<&BookId>,
        business_date: NaiveDate,
    ) -> Result<usize, CoreError> {
        let mut rolled = 0usize;

        for (key, versioned) in self.store.scan().await? {
            if let Some(book) = book
                && &key.book != book
            {
                continue;
            }

            let market = self.reference.market(key.security);
            let previous = self.calendar.add_business_days(market, business_date, -1);
            if key.business_date != previous {
                continue;
            }

            let target = PositionKey {
                book: key.book.clone(),
                security: key.security,
                business_date,
            };
            let _guard = self.acquire_timed(target.clone()).await;

            let existing = self.store.get(&target).await?;
            if let Some(existing) = &existing
                && existing.value.has_intraday
            {
                return Err(CoreError::Conflict(format!(
                    "start-of-day for {target:?} after intraday activity"
                )));
            }

            let audit = Audit::new(self.clock.now());
            let position = versioned.value.roll_to(business_date, audit);
            let expected = existing.map(|existing| existing.version);
            self.persist_and_publish(target, position, expected).await?;
            rolled += 1;
        }

        debug!(%business_date, rolled, "start-of-day applied");
        Ok(rolled)
    }

    /// Recompute derived fields for every position of a security on a business date.
    pub async fn calculate_positions_for_security(
        &self,
        security: &SecurityId,
        business_date: NaiveDate,
    ) -> Result<Vec<Position>, CoreError> {
        let index = self.reference.find_index(security)?;
        let mut calculated = Vec::new();

        for (key, _) in self.store.scan().await? {
            if key.security != index || key.business_date != business_date {
                continue;
            }
            let _guard = self.acquire_timed(key.clone()).await;
            let Some(mut current) = self.store.get(&key).await? else {
                continue;
            };

            current.value.recompute_derived();
            current.value.calculation_status = CalculationStatus::Valid;
            current.value.calculation_date = business_date;
            current.value.audit.touch(self.clock.now());

            let version = current.version;
            let position = current.value.clone();
            self.persist_and_publish(key, current.value, Some(version))
                .await?;
            calculated.push(position);
        }

        Ok(calculated)
    }

    pub async fn position(&self, key: &PositionKey) -> Result<Option<Position>, CoreError> {
        Ok(self
            .store
            .get(key)
            .await?
            .map(|versioned| versioned.value))
    }

    pub async fn settlement_ladder(
        &self,
        key: &PositionKey,
    ) -> Result<Option<SettlementLadder>, CoreError> {
        Ok(self
            .position(key)
            .await?
            .map(|position| position.settlement_ladder()))
    }

    /// Snapshot of all positions for a security on a business date.
    pub async fn positions_for(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
    ) -> Result<Vec<Position>, CoreError> {
        Ok(self
            .store
            .scan()
            .await?
            .into_iter()
            .filter(|(key, _)| key.security == security && key.business_date == business_date)
            .map(|(_, versioned)| versioned.value)
            .collect())
    }

    /// Expand an event's delta parts into per-key deltas, fanning out to basket constituents
    /// when requested.
    ///
    /// Each constituent receives the parent parts scaled by its composition weight, with
    /// receipts and deliveries rounded to the constituent's lot size.
    fn expand(
        &self,
        book: &BookId,
        security: &SecurityId,
        business_date: NaiveDate,
        parts: DeltaParts,
        expand: bool,
        provenance: PositionProvenance,
    ) -> Result<Vec<PositionDelta>, CoreError> {
        let index = self.reference.find_index(security)?;
        let parent = self.reference.security(index);

        if !(expand && parent.is_basket) {
            return Ok(vec![PositionDelta {
                book: book.clone(),
                security: index,
                security_id: security.clone(),
                business_date,
                contractual: parts.contractual,
                settled: parts.settled,
                settlement: parts.settlement,
                provenance,
            }]);
        }

        let composition = self
            .reference
            .composition_on(security, business_date)
            .ok_or_else(|| {
                CoreError::Validation(ValidationError::Invalid(format!(
                    "no composition effective for basket {security} on {business_date}"
                )))
            })?;

        composition
            .constituents
            .iter()
            .map(|constituent| {
                let child_index = self.reference.find_index(&constituent.security)?;
                let child = self.reference.security(child_index);
                let weigh = |quantity: Decimal| {
                    round_to_lot(quantity * constituent.weight, child.lot_size)
                };
                Ok(PositionDelta {
                    book: book.clone(),
                    security: child_index,
                    security_id: constituent.security.clone(),
                    business_date,
                    contractual: weigh(parts.contractual),
                    settled: weigh(parts.settled),
                    settlement: parts.settlement.map(|(date, receipt, deliver)| {
                        (date, weigh(receipt), weigh(deliver))
                    }),
                    provenance,
                })
            })
            .collect()
    }

    async fn apply_deltas(
        &self,
        deltas: Vec<PositionDelta>,
    ) -> Result<OneOrMany<Position>, CoreError> {
        let mut updated = Vec::with_capacity(deltas.len());
        for delta in deltas {
            updated.push(self.apply_delta(delta).await?);
        }
        Ok(match updated.len() {
            1 => OneOrMany::One(updated.remove(0)),
            _ => OneOrMany::Many(updated),
        })
    }

    async fn apply_delta(&self, delta: PositionDelta) -> Result<Position, CoreError> {
        let key = PositionKey {
            book: delta.book.clone(),
            security: delta.security,
            business_date: delta.business_date,
        };
        let _guard = self.acquire_timed(key.clone()).await;

        let now = self.clock.now();
        let (mut position, expected) = match self.store.get(&key).await? {
            Some(versioned) => (versioned.value, Some(versioned.version)),
            None => (
                Position::empty(
                    delta.book,
                    delta.security,
                    delta.security_id,
                    delta.business_date,
                    Audit::new(now),
                ),
                None,
            ),
        };

        position.contractual_qty += delta.contractual;
        position.settled_qty += delta.settled;
        if let Some((settlement_date, receipt, deliver)) = delta.settlement
            && !position.apply_settlement(settlement_date, receipt, deliver)
        {
            debug!(
                ?key,
                %settlement_date,
                "settlement outside ladder window ignored"
            );
        }
        // Provenance is fixed by the first mutation and never flips afterwards
        if !position.has_intraday {
            position.provenance = delta.provenance;
        }

        position.has_intraday = true;
        position.is_start_of_day = false;
        position.recompute_derived();
        if let Some(price) = self
            .reference
            .security(position.security)
            .last_price
            .map(|price| price.value)
        {
            position.revalue(price);
        }
        position.calculation_status = CalculationStatus::Valid;
        position.calculation_date = position.business_date;
        if expected.is_some() {
            position.audit.touch(now);
        }

        let published = position.clone();
        self.persist_and_publish(key, position, expected).await?;
        Ok(published)
    }

    async fn persist_and_publish(
        &self,
        key: PositionKey,
        position: Position,
        expected: Option<u64>,
    ) -> Result<(), CoreError> {
        let snapshot = position.clone();
        if let Err(error) = self.store.put(key, position, expected).await {
            warn!(%error, "position persist failed");
            return Err(error.into());
        }

        self.outbox.push(
            PositionUpdated::new(EventId::random(), self.clock.now(), snapshot).into(),
        );
        Ok(())
    }

    async fn acquire_timed(&self, key: PositionKey) -> tokio::sync::OwnedMutexGuard<()> {
        let started = Instant::now();
        let guard = self.locks.acquire(key).await;
        self.metrics.lock_wait.record(started.elapsed());
        guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn position(business_date: NaiveDate) -> Position {
        Position::empty(
            BookId::new("B1"),
            SecurityIndex(0),
            SecurityId::new("AAPL"),
            business_date,
            Audit::new(chrono::DateTime::<chrono::Utc>::MIN_UTC),
        )
    }

    #[test]
    fn test_derived_field_identities() {
        let mut position = position(date("2024-06-03"));
        position.contractual_qty = dec!(1000);
        position.settled_qty = dec!(250);
        position.receipt[0] = dec!(100);
        position.deliver[0] = dec!(40);
        position.receipt[2] = dec!(500);
        position.deliver[4] = dec!(60);
        position.recompute_derived();

        assert_eq!(position.net_settlement_today, dec!(60));
        assert_eq!(position.total_receipts, dec!(600));
        assert_eq!(position.total_deliveries, dec!(100));
        assert_eq!(position.projected_settled_qty, dec!(310));
        assert_eq!(position.current_net_position, dec!(1250));
        assert_eq!(position.projected_net_position, dec!(750));
    }

    #[test]
    fn test_apply_settlement_ignores_out_of_window() {
        let mut position = position(date("2024-06-03"));

        assert!(position.apply_settlement(date("2024-06-03"), dec!(10), dec!(0)));
        assert!(position.apply_settlement(date("2024-06-07"), dec!(5), dec!(0)));
        assert!(!position.apply_settlement(date("2024-06-08"), dec!(7), dec!(0)));
        assert!(!position.apply_settlement(date("2024-06-01"), dec!(7), dec!(0)));

        position.recompute_derived();
        assert_eq!(position.total_receipts, dec!(15));
    }

    #[test]
    fn test_add_then_subtract_restores_snapshot() {
        let mut position = position(date("2024-06-03"));
        position.contractual_qty = dec!(500);
        position.receipt[2] = dec!(500);
        position.recompute_derived();
        let snapshot = position.clone();

        position.contractual_qty += dec!(250);
        position.receipt[2] += dec!(250);
        position.recompute_derived();
        assert_ne!(position, snapshot);

        position.contractual_qty -= dec!(250);
        position.receipt[2] -= dec!(250);
        position.recompute_derived();
        assert_eq!(position, snapshot);
    }

    #[test]
    fn test_roll_to_shifts_ladder_and_settles_day_zero() {
        let mut eod = position(date("2024-06-03"));
        eod.settled_qty = dec!(100);
        eod.contractual_qty = dec!(40);
        eod.receipt[0] = dec!(30);
        eod.deliver[0] = dec!(10);
        eod.receipt[1] = dec!(7);
        eod.has_intraday = true;
        eod.recompute_derived();

        let sod = eod.roll_to(date("2024-06-04"), Audit::new(chrono::Utc::now()));

        assert_eq!(sod.business_date, date("2024-06-04"));
        assert_eq!(sod.settled_qty, dec!(120));
        assert_eq!(sod.contractual_qty, dec!(40));
        assert_eq!(sod.receipt[0], dec!(7));
        assert_eq!(sod.receipt[4], dec!(0));
        assert!(sod.is_start_of_day);
        assert!(!sod.has_intraday);
        assert_eq!(sod.calculation_status, CalculationStatus::Valid);
    }

    #[test]
    fn test_round_to_lot_uses_bankers_rounding() {
        struct TestCase {
            quantity: Decimal,
            lot: Decimal,
            expected: Decimal,
        }

        let cases = vec![
            // TC0: exact multiple unchanged
            TestCase {
                quantity: dec!(30),
                lot: dec!(1),
                expected: dec!(30),
            },
            // TC1: midpoint rounds to even (2.5 lots -> 2)
            TestCase {
                quantity: dec!(25),
                lot: dec!(10),
                expected: dec!(20),
            },
            // TC2: midpoint rounds to even (3.5 lots -> 4)
            TestCase {
                quantity: dec!(35),
                lot: dec!(10),
                expected: dec!(40),
            },
            // TC3: non-positive lot size leaves quantity untouched
            TestCase {
                quantity: dec!(33.3),
                lot: dec!(0),
                expected: dec!(33.3),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            assert_eq!(
                round_to_lot(test.quantity, test.lot),
                test.expected,
                "TC{index} failed"
            );
        }
    }
}
