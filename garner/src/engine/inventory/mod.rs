use crate::{
    cache::SingleFlightCache,
    clock::Clock,
    config::{CoreConfig, MarketConvention},
    engine::{
        inventory::{
            availability::{AvailabilityKey, CalculationType, InventoryAvailability},
            contract::{Contract, ContractDirection, ContractId},
            external::ExternalAvailability,
        },
        position::{Position, PositionEngine, PositionKey, PositionProvenance},
    },
    error::CoreError,
    event::{
        ContractEvent, ContractLifecycle, EventId, InventoryEvent, InventoryEventKind,
        InventoryUpdated, MarketDataEvent, PositionEvent, PositionEventKind,
    },
    lock::KeyedLocks,
    metrics::Metrics,
    outbox::Outbox,
    reference::ReferenceData,
    rule::{Attribute, DecisionStatus, FactContext, Value, compile::RuleSetHandle},
    store::Store,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use fnv::FnvHashMap;
use garner_instrument::{
    Audit,
    security::{Security, SecurityIndex},
};
use garner_integration::snapshot::Snapshot;
use itertools::Itertools;
use rust_decimal::Decimal;
use std::{sync::Arc, time::Instant};
use tracing::{debug, warn};

pub mod availability;
pub mod contract;
pub mod external;
pub mod limits;

/// Read seam over position state consumed by the inventory engine.
///
/// Returns a full [`Snapshot`] of the security's positions, never a delta.
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn positions_for(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
    ) -> Result<Snapshot<Vec<Position>>, CoreError>;
}

#[async_trait]
impl<St, Ck> PositionSource for PositionEngine<St, Ck>
where
    St: Store<PositionKey, Position>,
    Ck: Clock,
{
    async fn positions_for(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
    ) -> Result<Snapshot<Vec<Position>>, CoreError> {
        PositionEngine::positions_for(self, security, business_date)
            .await
            .map(Snapshot)
    }
}

/// Derives availability records by running market-parameterised calculation rules over
/// positions, contracts and external availability.
///
/// Owns all [`InventoryAvailability`] records. Recomputation per `(security, calculation,
/// date)` is serialised by a per-key lock; reads go through a TTL cache with single-flight
/// coalescing.
pub struct InventoryEngine<St, Ck> {
    reference: Arc<ReferenceData>,
    positions: Arc<dyn PositionSource>,
    store: Arc<St>,
    contracts: parking_lot::RwLock<FnvHashMap<ContractId, Contract>>,
    external: ExternalAvailability,
    rules: RuleSetHandle,
    cache: SingleFlightCache<AvailabilityKey, InventoryAvailability>,
    locks: KeyedLocks<(SecurityIndex, CalculationType, NaiveDate)>,
    outbox: Arc<Outbox>,
    clock: Arc<Ck>,
    config: CoreConfig,
    metrics: Arc<Metrics>,
}

impl<St, Ck> std::fmt::Debug for InventoryEngine<St, Ck>
where
    St: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryEngine")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<St, Ck> InventoryEngine<St, Ck>
where
    St: Store<AvailabilityKey, InventoryAvailability>,
    Ck: Clock,
{
    pub fn new(
        reference: Arc<ReferenceData>,
        positions: Arc<dyn PositionSource>,
        store: Arc<St>,
        rules: RuleSetHandle,
        outbox: Arc<Outbox>,
        clock: Arc<Ck>,
        config: CoreConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cache =
            SingleFlightCache::new(config.cache_ttl).with_metrics(Arc::clone(&metrics));
        Self {
            reference,
            positions,
            store,
            contracts: parking_lot::RwLock::new(FnvHashMap::default()),
            external: ExternalAvailability::new(),
            rules,
            cache,
            locks: KeyedLocks::new(),
            outbox,
            clock,
            config,
            metrics,
        }
    }

    pub fn rules(&self) -> &RuleSetHandle {
        &self.rules
    }

    /// Quantities of a security the firm may lend.
    pub async fn calculate_for_loan(
        &self,
        positions: &[Position],
        contracts: &[Contract],
        business_date: NaiveDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        self.calculate(CalculationType::ForLoan, positions, contracts, business_date)
            .await
    }

    /// Quantities of a security the firm may pledge.
    pub async fn calculate_for_pledge(
        &self,
        positions: &[Position],
        contracts: &[Contract],
        business_date: NaiveDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        self.calculate(
            CalculationType::ForPledge,
            positions,
            contracts,
            business_date,
        )
        .await
    }

    /// Short-sell availability: internal quantities plus external lender availability, with
    /// market conventions applied.
    pub async fn calculate_short_sell(
        &self,
        positions: &[Position],
        contracts: &[Contract],
        business_date: NaiveDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        self.calculate(
            CalculationType::ShortSell,
            positions,
            contracts,
            business_date,
        )
        .await
    }

    /// Long-sell availability from net long positions.
    pub async fn calculate_long_sell(
        &self,
        positions: &[Position],
        business_date: NaiveDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        self.calculate(CalculationType::LongSell, positions, &[], business_date)
            .await
    }

    /// Locate availability: for-loan availability plus external lender availability.
    pub async fn calculate_locate(
        &self,
        for_loan: &[InventoryAvailability],
        business_date: NaiveDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let mut produced = Vec::new();

        for record in for_loan {
            if record.calculation != CalculationType::ForLoan {
                continue;
            }
            let security = record.security;
            let seed = record.available_quantity + self.external.total(security, business_date);
            let external_source = self.external.total(security, business_date) > Decimal::ZERO;

            let snapshot = self.reference.security(security);
            if let Some(record) = self
                .produce_record(
                    CalculationType::Locate,
                    &snapshot,
                    security,
                    business_date,
                    seed,
                    external_source,
                )
                .await?
            {
                produced.push(record);
            }
        }

        Ok(produced)
    }

    /// Identify borrows no longer needed because of offsetting house purchases.
    ///
    /// For each security: `excess = min(borrowed quantity, house net long)`; an `Overborrow`
    /// record is emitted when the excess is positive.
    pub async fn identify_overborrow(
        &self,
        positions: &[Position],
        _contracts: &[Contract],
        business_date: NaiveDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let mut produced = Vec::new();

        for (security, group) in group_by_security(positions) {
            let excess = overborrow_excess(&group);
            if excess <= Decimal::ZERO {
                continue;
            }

            let snapshot = self.reference.security(security);
            if let Some(record) = self
                .produce_record(
                    CalculationType::Overborrow,
                    &snapshot,
                    security,
                    business_date,
                    excess,
                    false,
                )
                .await?
            {
                produced.push(record);
            }
        }

        Ok(produced)
    }

    /// Recompute the slice affected by a position event.
    pub async fn on_position_event(
        &self,
        event: &PositionEvent,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let security = match &event.kind {
            PositionEventKind::PositionUpdate { security, .. }
            | PositionEventKind::SettlementLadderUpdate { security, .. } => {
                self.reference.find_index(security)?
            }
            // A start-of-day roll touches everything; recomputation happens lazily via the
            // cache on the new business date
            PositionEventKind::StartOfDay { .. } => return Ok(Vec::new()),
        };

        self.recalculate_security(security, event.header.business_date)
            .await
    }

    /// Record external availability or recompute on operational request.
    pub async fn on_inventory_event(
        &self,
        event: &InventoryEvent,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        match &event.kind {
            InventoryEventKind::ExternalAvailability {
                security,
                quantity,
                source,
            } => {
                let index = self.reference.find_index(security)?;
                self.external.record(
                    index,
                    event.header.business_date,
                    source.clone(),
                    *quantity,
                );
                self.recalculate_security(index, event.header.business_date)
                    .await
            }
            InventoryEventKind::Recalculate { security } => {
                let index = self.reference.find_index(security)?;
                self.recalculate_security(index, event.header.business_date)
                    .await
            }
        }
    }

    /// Price and temperature moves change rule outcomes; recompute the security's slice.
    pub async fn on_market_data(
        &self,
        event: &MarketDataEvent,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let index = self.reference.find_index(&event.security)?;
        self.recalculate_security(index, event.header.business_date)
            .await
    }

    /// Track a contract lifecycle event and recompute the affected security.
    pub async fn on_contract(
        &self,
        event: &ContractEvent,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let index = self.reference.find_index(&event.contract.security)?;

        {
            let mut contracts = self.contracts.write();
            match event.lifecycle {
                ContractLifecycle::Opened | ContractLifecycle::Updated => {
                    contracts.insert(event.contract.id.clone(), event.contract.clone());
                }
                ContractLifecycle::Closed => {
                    contracts.remove(&event.contract.id);
                }
            }
        }

        self.recalculate_security(index, event.header.business_date)
            .await
    }

    /// Recompute every calculation type for a security on a business date.
    pub async fn recalculate_security(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let Snapshot(positions) = self.positions.positions_for(security, business_date).await?;
        let contracts = self.contracts_for(security);

        let mut produced = Vec::new();
        produced.extend(
            self.calculate_for_loan(&positions, &contracts, business_date)
                .await?,
        );
        produced.extend(
            self.calculate_for_pledge(&positions, &contracts, business_date)
                .await?,
        );
        produced.extend(
            self.calculate_short_sell(&positions, &contracts, business_date)
                .await?,
        );
        produced.extend(
            self.calculate_long_sell(&positions, business_date)
                .await?,
        );

        let for_loan = produced
            .iter()
            .filter(|record| record.calculation == CalculationType::ForLoan)
            .cloned()
            .collect::<Vec<_>>();
        produced.extend(self.calculate_locate(&for_loan, business_date).await?);
        produced.extend(
            self.identify_overborrow(&positions, &contracts, business_date)
                .await?,
        );

        debug!(
            %security,
            %business_date,
            records = produced.len(),
            "availability recalculated"
        );
        Ok(produced)
    }

    /// Cached read of an availability record, computing the security's slice on a miss.
    pub async fn availability(
        &self,
        key: &AvailabilityKey,
    ) -> Result<InventoryAvailability, CoreError> {
        let cache_key = key.clone();
        self.cache
            .get_or_compute(cache_key, || async {
                if let Some(stored) = self.store.get(key).await? {
                    return Ok(stored.value);
                }

                // Not yet calculated: compute the slice then re-read
                self.recalculate_security(key.security, key.business_date)
                    .await?;
                match self.store.get(key).await? {
                    Some(stored) => Ok(stored.value),
                    None => Ok(self.zero_record(key)),
                }
            })
            .await
    }

    /// Atomically reserve quantity against a Locate availability record.
    pub async fn reserve_locate(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
        quantity: Decimal,
    ) -> Result<InventoryAvailability, CoreError> {
        self.mutate_locate(security, business_date, |record| {
            record
                .reserve(quantity)
                .map_err(|error| CoreError::Conflict(error.to_string()))
        })
        .await
    }

    /// Release previously reserved Locate quantity (cancel/expiry paths).
    pub async fn release_locate(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
        quantity: Decimal,
    ) -> Result<InventoryAvailability, CoreError> {
        self.mutate_locate(security, business_date, |record| {
            record
                .release(quantity)
                .map_err(|error| CoreError::Conflict(error.to_string()))
        })
        .await
    }

    async fn mutate_locate(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
        mutate: impl FnOnce(&mut InventoryAvailability) -> Result<(), CoreError>,
    ) -> Result<InventoryAvailability, CoreError> {
        let key = AvailabilityKey::firm(security, CalculationType::Locate, business_date);
        let _guard = self
            .acquire_timed((security, CalculationType::Locate, business_date))
            .await;

        let (mut record, expected) = match self.store.get(&key).await? {
            Some(stored) => (stored.value, Some(stored.version)),
            None => (self.zero_record(&key), None),
        };

        mutate(&mut record)?;
        record.audit.touch(self.clock.now());
        debug_assert!(record.invariants_hold());

        self.persist_and_publish(key, record.clone(), expected)
            .await?;
        Ok(record)
    }

    fn contracts_for(&self, security: SecurityIndex) -> Vec<Contract> {
        let security_id = self.reference.security(security).id;
        self.contracts
            .read()
            .values()
            .filter(|contract| contract.security == security_id)
            .cloned()
            .collect()
    }

    /// Run one calculation family over a position snapshot, producing one firm-level record
    /// per security present.
    async fn calculate(
        &self,
        calculation: CalculationType,
        positions: &[Position],
        contracts: &[Contract],
        business_date: NaiveDate,
    ) -> Result<Vec<InventoryAvailability>, CoreError> {
        let mut produced = Vec::new();

        for (security, group) in group_by_security(positions) {
            let snapshot = self.reference.security(security);
            if !snapshot.is_active() {
                debug!(security = %snapshot.id, "inactive security skipped");
                continue;
            }

            let convention = self.config.convention(snapshot.market);
            let external_total = self.external.total(security, business_date);
            let seed = match calculation {
                CalculationType::ForLoan => lending_seed(&group, contracts, business_date, ContractDirection::Loan),
                CalculationType::ForPledge => lending_seed(&group, contracts, business_date, ContractDirection::Pledge),
                CalculationType::ShortSell => {
                    short_sell_seed(&group, contracts, business_date, convention, external_total)
                }
                CalculationType::LongSell => long_sell_seed(&group),
                // Locate and Overborrow have dedicated entry points
                CalculationType::Locate | CalculationType::Overborrow => continue,
            };

            let external_source = calculation == CalculationType::ShortSell
                && external_total > Decimal::ZERO;

            if let Some(record) = self
                .produce_record(
                    calculation,
                    &snapshot,
                    security,
                    business_date,
                    seed,
                    external_source,
                )
                .await?
            {
                produced.push(record);
            }
        }

        Ok(produced)
    }

    /// Evaluate rules for a seeded record, persist it and publish `InventoryUpdated`.
    ///
    /// Returns `None` when the rule chain excludes the record.
    async fn produce_record(
        &self,
        calculation: CalculationType,
        snapshot: &Security,
        security: SecurityIndex,
        business_date: NaiveDate,
        seed: Decimal,
        external_source: bool,
    ) -> Result<Option<InventoryAvailability>, CoreError> {
        let ctx = FactContext::new()
            .with(Attribute::Market, snapshot.market)
            .with(Attribute::Temperature, snapshot.temperature)
            .with(Attribute::IsBasket, snapshot.is_basket)
            .with(Attribute::SecurityKind, Value::text(snapshot.kind.as_str()));

        let outcome =
            self.rules
                .load()
                .evaluate(calculation, snapshot.market, business_date, &ctx);

        if !outcome.included {
            debug!(security = %snapshot.id, ?calculation, "record excluded by rule");
            return Ok(None);
        }

        let key = AvailabilityKey::firm(security, calculation, business_date);
        let _guard = self
            .acquire_timed((security, calculation, business_date))
            .await;

        let existing = self.store.get(&key).await?;
        let (reserved, decrement) = existing
            .as_ref()
            .map(|stored| {
                (
                    stored.value.reserved_quantity,
                    stored.value.decrement_quantity,
                )
            })
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        let gross = (seed * outcome.gross_factor).max(Decimal::ZERO);
        let available =
            ((seed * outcome.available_factor) - reserved).max(Decimal::ZERO);
        // Reservations survive recomputation; available shrinks before reserved does
        let available = available.min((gross - reserved).max(Decimal::ZERO));

        let record = InventoryAvailability {
            security,
            security_id: snapshot.id.clone(),
            counterparty: None,
            aggregation_unit: None,
            calculation,
            business_date,
            gross_quantity: gross,
            net_quantity: gross,
            available_quantity: available,
            reserved_quantity: reserved,
            decrement_quantity: decrement,
            market: snapshot.market,
            temperature: outcome.temperature.unwrap_or(snapshot.temperature),
            borrow_rate: outcome.borrow_rate,
            applied_rule: outcome.matched.clone(),
            status: outcome.decision.unwrap_or(DecisionStatus::Approved),
            external_source,
            audit: existing
                .as_ref()
                .map(|stored| {
                    let mut audit = stored.value.audit.clone();
                    audit.touch(self.clock.now());
                    audit
                })
                .unwrap_or_else(|| Audit::new(self.clock.now())),
        };

        if !record.invariants_hold() {
            warn!(?key, "availability invariants violated after recompute");
        }

        let expected = existing.map(|stored| stored.version);
        self.persist_and_publish(key, record.clone(), expected)
            .await?;
        Ok(Some(record))
    }

    fn zero_record(&self, key: &AvailabilityKey) -> InventoryAvailability {
        let snapshot = self.reference.security(key.security);
        InventoryAvailability {
            security: key.security,
            security_id: snapshot.id.clone(),
            counterparty: key.counterparty.clone(),
            aggregation_unit: key.aggregation_unit.clone(),
            calculation: key.calculation,
            business_date: key.business_date,
            gross_quantity: Decimal::ZERO,
            net_quantity: Decimal::ZERO,
            available_quantity: Decimal::ZERO,
            reserved_quantity: Decimal::ZERO,
            decrement_quantity: Decimal::ZERO,
            market: snapshot.market,
            temperature: snapshot.temperature,
            borrow_rate: None,
            applied_rule: None,
            status: DecisionStatus::Approved,
            external_source: false,
            audit: Audit::new(self.clock.now()),
        }
    }

    async fn persist_and_publish(
        &self,
        key: AvailabilityKey,
        record: InventoryAvailability,
        expected: Option<u64>,
    ) -> Result<(), CoreError> {
        self.store
            .put(key.clone(), record.clone(), expected)
            .await?;
        self.cache.put(key, record.clone());
        self.outbox.push(
            InventoryUpdated::new(EventId::random(), self.clock.now(), record).into(),
        );
        Ok(())
    }

    async fn acquire_timed(
        &self,
        key: (SecurityIndex, CalculationType, NaiveDate),
    ) -> tokio::sync::OwnedMutexGuard<()> {
        let started = Instant::now();
        let guard = self.locks.acquire(key).await;
        self.metrics.lock_wait.record(started.elapsed());
        guard
    }
}

fn group_by_security(positions: &[Position]) -> Vec<(SecurityIndex, Vec<&Position>)> {
    positions
        .iter()
        .into_group_map_by(|position| position.security)
        .into_iter()
        .sorted_by_key(|(security, _)| *security)
        .collect()
}

/// True if the position may back lending-style availability (For-Loan / For-Pledge).
fn lendable(position: &Position) -> bool {
    position.is_long() && position.is_hypothecatable && !position.is_reserved
}

/// For-Loan / For-Pledge seed: settled quantity of lendable positions, net of quantity
/// already out on open contracts in the same direction.
fn lending_seed(
    positions: &[&Position],
    contracts: &[Contract],
    business_date: NaiveDate,
    direction: ContractDirection,
) -> Decimal {
    let settled: Decimal = positions
        .iter()
        .filter(|position| lendable(position))
        .map(|position| position.settled_qty)
        .sum();

    let committed: Decimal = contracts
        .iter()
        .filter(|contract| contract.direction == direction && contract.is_open_on(business_date))
        .map(|contract| contract.quantity)
        .sum();

    (settled - committed).max(Decimal::ZERO)
}

/// Short-sell seed with market conventions applied.
///
/// Base is the settled quantity of lendable positions plus external availability. JP adds
/// open pledge contract quantities; TW excludes borrowed-provenance positions (borrowed
/// shares must not be re-lent).
fn short_sell_seed(
    positions: &[&Position],
    contracts: &[Contract],
    business_date: NaiveDate,
    convention: MarketConvention,
    external_total: Decimal,
) -> Decimal {
    let settled: Decimal = positions
        .iter()
        .filter(|position| lendable(position))
        .filter(|position| {
            !(convention.exclude_borrowed_relending
                && position.provenance == PositionProvenance::Borrowed)
        })
        .map(|position| position.settled_qty)
        .sum();

    let pledged: Decimal = if convention.include_pledge_in_short_sell {
        contracts
            .iter()
            .filter(|contract| {
                contract.direction == ContractDirection::Pledge
                    && contract.is_open_on(business_date)
            })
            .map(|contract| contract.quantity)
            .sum()
    } else {
        Decimal::ZERO
    };

    (settled + pledged + external_total).max(Decimal::ZERO)
}

/// Long-sell seed: sum of net long positions.
fn long_sell_seed(positions: &[&Position]) -> Decimal {
    positions
        .iter()
        .filter(|position| position.is_long())
        .map(|position| position.current_net_position)
        .sum()
}

/// Borrowed quantity no longer required given offsetting house longs.
fn overborrow_excess(positions: &[&Position]) -> Decimal {
    let borrowed: Decimal = positions
        .iter()
        .filter(|position| position.provenance == PositionProvenance::Borrowed)
        .map(|position| position.current_net_position.max(Decimal::ZERO))
        .sum();

    let house_long: Decimal = positions
        .iter()
        .filter(|position| position.provenance == PositionProvenance::House)
        .map(|position| position.current_net_position.max(Decimal::ZERO))
        .sum();

    borrowed.min(house_long)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use garner_instrument::{book::BookId, security::SecurityId};
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn position(settled: Decimal, provenance: PositionProvenance) -> Position {
        let mut position = Position::empty(
            BookId::new("B1"),
            SecurityIndex(0),
            SecurityId::new("AAPL"),
            date("2024-06-03"),
            Audit::new(DateTime::<Utc>::MIN_UTC),
        );
        position.settled_qty = settled;
        position.provenance = provenance;
        position.recompute_derived();
        position
    }

    fn pledge_contract(quantity: Decimal) -> Contract {
        Contract {
            id: ContractId::new("C1"),
            security: SecurityId::new("AAPL"),
            counterparty: garner_instrument::counterparty::CounterpartyId::new("CP1"),
            direction: ContractDirection::Pledge,
            quantity,
            rate: None,
            open_date: date("2024-06-01"),
            close_date: None,
            state: contract::ContractState::Open,
            audit: Audit::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    #[test]
    fn test_short_sell_seed_market_conventions() {
        struct TestCase {
            convention: MarketConvention,
            external: Decimal,
            expected: Decimal,
        }

        let house = position(dec!(1000), PositionProvenance::House);
        let borrowed = position(dec!(400), PositionProvenance::Borrowed);
        let positions = vec![&house, &borrowed];
        let contracts = vec![pledge_contract(dec!(250))];

        let cases = vec![
            // TC0: neutral market counts all settled
            TestCase {
                convention: MarketConvention::default(),
                external: dec!(0),
                expected: dec!(1400),
            },
            // TC1: TW excludes borrowed-provenance positions
            TestCase {
                convention: MarketConvention {
                    exclude_borrowed_relending: true,
                    include_pledge_in_short_sell: false,
                },
                external: dec!(0),
                expected: dec!(1000),
            },
            // TC2: JP adds open pledge contracts
            TestCase {
                convention: MarketConvention {
                    exclude_borrowed_relending: false,
                    include_pledge_in_short_sell: true,
                },
                external: dec!(0),
                expected: dec!(1650),
            },
            // TC3: external availability always adds
            TestCase {
                convention: MarketConvention::default(),
                external: dec!(300),
                expected: dec!(1700),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = short_sell_seed(
                &positions,
                &contracts,
                date("2024-06-03"),
                test.convention,
                test.external,
            );
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_lending_seed_filters_and_nets_contracts() {
        let long = position(dec!(1000), PositionProvenance::House);
        let mut reserved = position(dec!(500), PositionProvenance::House);
        reserved.is_reserved = true;
        let mut short = position(dec!(-200), PositionProvenance::House);
        short.recompute_derived();

        let positions = vec![&long, &reserved, &short];
        let contracts = vec![pledge_contract(dec!(300))];

        // Reserved and short positions are excluded; pledge contracts only net the
        // for-pledge direction
        assert_eq!(
            lending_seed(&positions, &contracts, date("2024-06-03"), ContractDirection::Loan),
            dec!(1000)
        );
        assert_eq!(
            lending_seed(
                &positions,
                &contracts,
                date("2024-06-03"),
                ContractDirection::Pledge
            ),
            dec!(700)
        );
    }

    #[test]
    fn test_overborrow_excess_nets_borrowed_against_house() {
        struct TestCase {
            borrowed: Decimal,
            house: Decimal,
            expected: Decimal,
        }

        let cases = vec![
            // TC0: house longs fully cover the borrow
            TestCase {
                borrowed: dec!(300),
                house: dec!(1000),
                expected: dec!(300),
            },
            // TC1: partial cover
            TestCase {
                borrowed: dec!(1000),
                house: dec!(250),
                expected: dec!(250),
            },
            // TC2: no house longs, no overborrow
            TestCase {
                borrowed: dec!(1000),
                house: dec!(0),
                expected: dec!(0),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let borrowed = position(test.borrowed, PositionProvenance::Borrowed);
            let house = position(test.house, PositionProvenance::House);
            let positions = vec![&borrowed, &house];

            assert_eq!(
                overborrow_excess(&positions),
                test.expected,
                "TC{index} failed"
            );
        }
    }
}
