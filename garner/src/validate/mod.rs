use crate::{
    cache::SingleFlightCache,
    clock::Clock,
    engine::inventory::limits::{
        AggregationUnitLimitKey, ClientLimitKey, SellSide, TradingLimit,
    },
    error::{CoreError, ValidationError},
    event::{EventId, OrderValidated},
    lock::KeyedLocks,
    metrics::Metrics,
    outbox::Outbox,
    reference::ReferenceData,
    store::Store,
};
use fnv::FnvHashSet;
use garner_instrument::{
    aggregation::AggregationUnitId,
    counterparty::CounterpartyId,
    security::{SecurityId, SecurityIndex},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    fmt::{Display, Formatter},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

/// Sell order submitted for pre-trade validation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrderRequest {
    pub order_id: SmolStr,
    pub security: SecurityId,
    pub client: CounterpartyId,
    pub aggregation_unit: AggregationUnitId,
    pub side: SellSide,
    pub quantity: Decimal,
}

/// Why an order was rejected.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ClientLimitExceeded,
    AuLimitExceeded,
    LimitMissing,
    UnknownSecurity,
    Quarantined,
    Timeout,
    Internal,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            RejectReason::ClientLimitExceeded => "client limit exceeded",
            RejectReason::AuLimitExceeded => "aggregation unit limit exceeded",
            RejectReason::LimitMissing => "no limit configured",
            RejectReason::UnknownSecurity => "unknown security",
            RejectReason::Quarantined => "limit key quarantined",
            RejectReason::Timeout => "validation deadline exceeded",
            RejectReason::Internal => "internal error",
        };
        write!(f, "{reason}")
    }
}

/// Validation outcome.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum Validation {
    Approved,
    Rejected(RejectReason),
}

impl Validation {
    pub fn is_approved(&self) -> bool {
        matches!(self, Validation::Approved)
    }
}

/// Outcome plus the correlation id and latency measurement returned to synchronous callers.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ValidationResponse {
    pub validation: Validation,
    pub correlation_id: EventId,
    pub latency: Duration,
}

/// Lock key over a limit counter pair.
///
/// The derived ordering (client keys before aggregation unit keys, then by id) is the
/// canonical total order for multi-key acquisition.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LimitLockKey {
    Client(CounterpartyId, SecurityIndex),
    AggregationUnit(AggregationUnitId, SecurityIndex),
}

impl Display for LimitLockKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitLockKey::Client(client, security) => write!(f, "client:{client}:{security}"),
            LimitLockKey::AggregationUnit(unit, security) => {
                write!(f, "au:{unit}:{security}")
            }
        }
    }
}

/// Pre-trade sell order validator.
///
/// The hot path: limit reads come from a warm single-flight cache, the authoritative
/// re-check and double increment happen under both keyed locks taken in canonical order, and
/// the whole operation runs under the short-sell deadline - expiry rejects with `Timeout`
/// and persists nothing.
pub struct ShortSellValidator<StC, StA, Ck> {
    reference: Arc<ReferenceData>,
    client_limits: Arc<StC>,
    au_limits: Arc<StA>,
    client_cache: SingleFlightCache<ClientLimitKey, TradingLimit>,
    au_cache: SingleFlightCache<AggregationUnitLimitKey, TradingLimit>,
    locks: KeyedLocks<LimitLockKey>,
    quarantined: parking_lot::RwLock<FnvHashSet<LimitLockKey>>,
    outbox: Arc<Outbox>,
    clock: Arc<Ck>,
    metrics: Arc<Metrics>,
    deadline: Duration,
}

impl<StC, StA, Ck> std::fmt::Debug for ShortSellValidator<StC, StA, Ck> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShortSellValidator")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<StC, StA, Ck> ShortSellValidator<StC, StA, Ck>
where
    StC: Store<ClientLimitKey, TradingLimit>,
    StA: Store<AggregationUnitLimitKey, TradingLimit>,
    Ck: Clock,
{
    pub fn new(
        reference: Arc<ReferenceData>,
        client_limits: Arc<StC>,
        au_limits: Arc<StA>,
        outbox: Arc<Outbox>,
        clock: Arc<Ck>,
        metrics: Arc<Metrics>,
        deadline: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            reference,
            client_limits,
            au_limits,
            client_cache: SingleFlightCache::new(cache_ttl).with_metrics(Arc::clone(&metrics)),
            au_cache: SingleFlightCache::new(cache_ttl).with_metrics(Arc::clone(&metrics)),
            locks: KeyedLocks::new(),
            quarantined: parking_lot::RwLock::new(FnvHashSet::default()),
            outbox,
            clock,
            metrics,
            deadline,
        }
    }

    /// Validate a sell order against client and aggregation unit limits.
    ///
    /// On approval both `used` counters are incremented atomically; on any rejection no state
    /// mutation is visible.
    pub async fn validate(&self, order: &OrderRequest) -> ValidationResponse {
        let started = Instant::now();
        let correlation_id = EventId::random();

        let validation = match tokio::time::timeout(self.deadline, self.validate_inner(order))
            .await
        {
            Ok(Ok(validation)) => validation,
            Ok(Err(err)) => Validation::Rejected(reject_reason(&err)),
            Err(_elapsed) => {
                debug!(order = %order.order_id, "validation deadline exceeded");
                Validation::Rejected(RejectReason::Timeout)
            }
        };

        let latency = started.elapsed();
        self.metrics.validation_latency.record(latency);
        match &validation {
            Validation::Approved => self.metrics.validations_approved.increment(),
            Validation::Rejected(_) => self.metrics.validations_rejected.increment(),
        }

        self.outbox.push(
            OrderValidated::new(
                correlation_id,
                self.clock.now(),
                order.order_id.clone(),
                validation.is_approved(),
                match &validation {
                    Validation::Approved => None,
                    Validation::Rejected(reason) => Some(reason.clone()),
                },
                latency.as_millis() as u64,
            )
            .into(),
        );

        ValidationResponse {
            validation,
            correlation_id,
            latency,
        }
    }

    async fn validate_inner(&self, order: &OrderRequest) -> Result<Validation, CoreError> {
        let security = self.reference.find_index(&order.security)?;
        let market = self.reference.market(security);
        let business_date = self.clock.today(market);

        let client_key = ClientLimitKey {
            client: order.client.clone(),
            security,
            business_date,
        };
        let au_key = AggregationUnitLimitKey {
            aggregation_unit: order.aggregation_unit.clone(),
            security,
            business_date,
        };
        let client_lock = LimitLockKey::Client(order.client.clone(), security);
        let au_lock = LimitLockKey::AggregationUnit(order.aggregation_unit.clone(), security);

        {
            let quarantined = self.quarantined.read();
            if quarantined.contains(&client_lock) || quarantined.contains(&au_lock) {
                return Ok(Validation::Rejected(RejectReason::Quarantined));
            }
        }

        // Warm pre-check from cache; the authoritative re-check happens under the locks
        let client_preview = self.cached_client_limit(&client_key).await?;
        if !client_preview.accommodates(order.side, order.quantity) {
            return Ok(Validation::Rejected(RejectReason::ClientLimitExceeded));
        }
        let au_preview = self.cached_au_limit(&au_key).await?;
        if !au_preview.accommodates(order.side, order.quantity) {
            return Ok(Validation::Rejected(RejectReason::AuLimitExceeded));
        }

        let _guards = self
            .locks
            .acquire_pair(client_lock.clone(), au_lock.clone())
            .await;

        let Some(mut client) = self.client_limits.get(&client_key).await? else {
            return Ok(Validation::Rejected(RejectReason::LimitMissing));
        };
        let Some(mut au) = self.au_limits.get(&au_key).await? else {
            return Ok(Validation::Rejected(RejectReason::LimitMissing));
        };

        // Re-check under the locks: the cached preview may have raced another approval
        if !client.value.accommodates(order.side, order.quantity) {
            return Ok(Validation::Rejected(RejectReason::ClientLimitExceeded));
        }
        if !au.value.accommodates(order.side, order.quantity) {
            return Ok(Validation::Rejected(RejectReason::AuLimitExceeded));
        }

        let now = self.clock.now();
        client.value.consume(order.side, order.quantity);
        client.value.audit.touch(now);
        au.value.consume(order.side, order.quantity);
        au.value.audit.touch(now);

        let client_version = self
            .client_limits
            .put(client_key.clone(), client.value.clone(), Some(client.version))
            .await?;

        if let Err(au_error) = self
            .au_limits
            .put(au_key.clone(), au.value.clone(), Some(au.version))
            .await
        {
            // Roll back the client increment in reverse order
            warn!(
                order = %order.order_id,
                error = %au_error,
                "aggregation unit persist failed, rolling back client usage"
            );
            client.value.restore(order.side, order.quantity);
            client.value.audit.touch(self.clock.now());
            if let Err(rollback_error) = self
                .client_limits
                .put(client_key.clone(), client.value.clone(), Some(client_version))
                .await
            {
                self.quarantine(client_lock, au_lock, &rollback_error);
                return Err(CoreError::Quarantined(format!(
                    "client:{}:{security}",
                    order.client
                )));
            }
            self.client_cache.invalidate(&client_key);
            return Err(au_error.into());
        }

        self.client_cache.put(client_key, client.value);
        self.au_cache.put(au_key, au.value);

        debug!(order = %order.order_id, side = ?order.side, quantity = %order.quantity, "order approved");
        Ok(Validation::Approved)
    }

    async fn cached_client_limit(&self, key: &ClientLimitKey) -> Result<TradingLimit, CoreError> {
        let store = Arc::clone(&self.client_limits);
        let lookup = key.clone();
        self.client_cache
            .get_or_compute(key.clone(), || async move {
                store
                    .get(&lookup)
                    .await?
                    .map(|versioned| versioned.value)
                    .ok_or_else(|| {
                        CoreError::Validation(ValidationError::Invalid(format!(
                            "no client limit for {}:{}",
                            lookup.client, lookup.security
                        )))
                    })
            })
            .await
    }

    async fn cached_au_limit(
        &self,
        key: &AggregationUnitLimitKey,
    ) -> Result<TradingLimit, CoreError> {
        let store = Arc::clone(&self.au_limits);
        let lookup = key.clone();
        self.au_cache
            .get_or_compute(key.clone(), || async move {
                store
                    .get(&lookup)
                    .await?
                    .map(|versioned| versioned.value)
                    .ok_or_else(|| {
                        CoreError::Validation(ValidationError::Invalid(format!(
                            "no aggregation unit limit for {}:{}",
                            lookup.aggregation_unit, lookup.security
                        )))
                    })
            })
            .await
    }

    fn quarantine(&self, client: LimitLockKey, au: LimitLockKey, cause: &crate::store::StoreError) {
        error!(
            %client,
            %au,
            %cause,
            "limit counter rollback failed - keys quarantined until operator clears"
        );
        let mut quarantined = self.quarantined.write();
        quarantined.insert(client);
        quarantined.insert(au);
    }

    /// Quarantined limit keys, for the operational surface.
    pub fn quarantined_keys(&self) -> Vec<String> {
        let mut keys = self
            .quarantined
            .read()
            .iter()
            .map(|key| key.to_string())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Operator clearing of a quarantined key (matched on its display form).
    pub fn clear_quarantine(&self, key: &str) -> bool {
        let mut quarantined = self.quarantined.write();
        let before = quarantined.len();
        quarantined.retain(|candidate| candidate.to_string() != key);
        quarantined.len() < before
    }
}

/// Operator quarantine control, consumed by the dispatcher for workflow events.
pub trait QuarantineControl: Send + Sync {
    fn clear_quarantine(&self, key: &str) -> bool;
}

impl<StC, StA, Ck> QuarantineControl for ShortSellValidator<StC, StA, Ck>
where
    StC: Store<ClientLimitKey, TradingLimit>,
    StA: Store<AggregationUnitLimitKey, TradingLimit>,
    Ck: Clock,
{
    fn clear_quarantine(&self, key: &str) -> bool {
        ShortSellValidator::clear_quarantine(self, key)
    }
}

/// Map an internal error onto the caller-visible rejection reason.
fn reject_reason(error: &CoreError) -> RejectReason {
    match error {
        CoreError::Validation(ValidationError::UnknownSecurity(_)) => RejectReason::UnknownSecurity,
        CoreError::Validation(_) => RejectReason::LimitMissing,
        CoreError::Quarantined(_) => RejectReason::Quarantined,
        CoreError::Timeout { .. } => RejectReason::Timeout,
        _ => RejectReason::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::FrozenClock,
        store::InMemoryStore,
    };
    use chrono::Utc;
    use garner_instrument::{Audit, index::IndexedSecurities, market::Market, test_utils::security};
    use rust_decimal_macros::dec;

    type ClientStore = InMemoryStore<ClientLimitKey, TradingLimit>;
    type AuStore = InMemoryStore<AggregationUnitLimitKey, TradingLimit>;

    struct Fixture {
        validator: ShortSellValidator<ClientStore, AuStore, FrozenClock>,
        client_store: Arc<ClientStore>,
        au_store: Arc<AuStore>,
        outbox: Arc<Outbox>,
        business_date: chrono::NaiveDate,
    }

    async fn fixture(short_limit: Decimal, short_used: Decimal) -> Fixture {
        let clock = FrozenClock::new(
            "2024-06-03T12:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap(),
        );
        let business_date = clock.today(Market::Us);

        let reference = Arc::new(ReferenceData::from_universe(IndexedSecurities::new([
            security("AAPL", Market::Us),
        ])));
        let security_index = reference.find_index(&SecurityId::new("AAPL")).unwrap();

        let client_store = Arc::new(ClientStore::new());
        let au_store = Arc::new(AuStore::new());
        let outbox = Arc::new(Outbox::new());

        let mut limit = TradingLimit::new(dec!(100000), short_limit, Audit::new(clock.now()));
        limit.short_sell_used = short_used;
        client_store
            .put(
                ClientLimitKey {
                    client: CounterpartyId::new("C1"),
                    security: security_index,
                    business_date,
                },
                limit,
                None,
            )
            .await
            .unwrap();
        au_store
            .put(
                AggregationUnitLimitKey {
                    aggregation_unit: AggregationUnitId::new("AU1"),
                    security: security_index,
                    business_date,
                },
                TradingLimit::new(dec!(100000), dec!(100000), Audit::new(clock.now())),
                None,
            )
            .await
            .unwrap();

        let validator = ShortSellValidator::new(
            reference,
            Arc::clone(&client_store),
            Arc::clone(&au_store),
            Arc::clone(&outbox),
            Arc::new(clock),
            Arc::new(Metrics::default()),
            Duration::from_millis(150),
            Duration::from_secs(60),
        );

        Fixture {
            validator,
            client_store,
            au_store,
            outbox,
            business_date,
        }
    }

    fn order(quantity: Decimal) -> OrderRequest {
        OrderRequest {
            order_id: "O1".into(),
            security: SecurityId::new("AAPL"),
            client: CounterpartyId::new("C1"),
            aggregation_unit: AggregationUnitId::new("AU1"),
            side: SellSide::ShortSell,
            quantity,
        }
    }

    #[tokio::test]
    async fn test_approve_then_reject_at_limit() {
        let fixture = fixture(dec!(10000), dec!(9500)).await;

        let first = fixture.validator.validate(&order(dec!(400))).await;
        assert_eq!(first.validation, Validation::Approved);

        let second = fixture.validator.validate(&order(dec!(200))).await;
        assert_eq!(
            second.validation,
            Validation::Rejected(RejectReason::ClientLimitExceeded)
        );

        // Used advanced exactly once, by the approved quantity
        let key = ClientLimitKey {
            client: CounterpartyId::new("C1"),
            security: SecurityIndex(0),
            business_date: fixture.business_date,
        };
        let stored = fixture.client_store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.value.short_sell_used, dec!(9900));

        // Both outcomes were published
        let published = fixture.outbox.drain();
        assert_eq!(published.len(), 2);
    }

    #[tokio::test]
    async fn test_exact_fit_approves() {
        let fixture = fixture(dec!(10000), dec!(9600)).await;
        let response = fixture.validator.validate(&order(dec!(400))).await;
        assert_eq!(response.validation, Validation::Approved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_rejects_with_timeout_without_mutation() {
        let fixture = fixture(dec!(10000), dec!(0)).await;
        fixture.client_store.set_read_delay(Duration::from_millis(200));

        let response = fixture.validator.validate(&order(dec!(100))).await;
        assert_eq!(
            response.validation,
            Validation::Rejected(RejectReason::Timeout)
        );

        fixture.client_store.set_read_delay(Duration::from_millis(0));
        let key = ClientLimitKey {
            client: CounterpartyId::new("C1"),
            security: SecurityIndex(0),
            business_date: fixture.business_date,
        };
        let stored = fixture.client_store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.value.short_sell_used, dec!(0));
    }

    #[tokio::test]
    async fn test_failed_rollback_quarantines_key() {
        let fixture = fixture(dec!(10000), dec!(0)).await;

        // First client write succeeds, the au write fails, and the client rollback fails too
        fixture.au_store.fail_next_writes(1);
        fixture.client_store.plan_writes([false, true]);

        let response = fixture.validator.validate(&order(dec!(100))).await;
        assert_eq!(
            response.validation,
            Validation::Rejected(RejectReason::Quarantined)
        );
        assert_eq!(fixture.validator.quarantined_keys().len(), 2);

        // Quarantined keys reject immediately until cleared
        let rejected = fixture.validator.validate(&order(dec!(1))).await;
        assert_eq!(
            rejected.validation,
            Validation::Rejected(RejectReason::Quarantined)
        );

        for key in fixture.validator.quarantined_keys() {
            assert!(fixture.validator.clear_quarantine(&key));
        }
        assert!(fixture.validator.quarantined_keys().is_empty());
    }
}
