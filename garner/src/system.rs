use crate::{
    clock::{BusinessCalendar, Clock},
    config::CoreConfig,
    engine::{
        inventory::{
            InventoryEngine,
            availability::{AvailabilityKey, InventoryAvailability},
            limits::{AggregationUnitLimitKey, ClientLimitKey, TradingLimit},
        },
        position::{Position, PositionEngine, PositionKey},
    },
    error::CoreError,
    event::EgressEvent,
    health::{Health, HealthRegistry, Subsystem},
    ingress::{Dispatcher, IngressRuntime, validate::EventValidator},
    locate::{LocateRequest, LocateRequestId, LocateWorkflow},
    metrics::Metrics,
    outbox::{Outbox, Publisher},
    reference::ReferenceData,
    rule::compile::RuleSetHandle,
    store::InMemoryStore,
    validate::ShortSellValidator,
};
use garner_instrument::index::IndexedSecurities;
use garner_integration::channel::Tx;
use std::{fmt::Display, sync::Arc};

pub type PositionStore = InMemoryStore<PositionKey, Position>;
pub type AvailabilityStore = InMemoryStore<AvailabilityKey, InventoryAvailability>;
pub type LocateStore = InMemoryStore<LocateRequestId, LocateRequest>;
pub type ClientLimitStore = InMemoryStore<ClientLimitKey, TradingLimit>;
pub type AuLimitStore = InMemoryStore<AggregationUnitLimitKey, TradingLimit>;

/// A fully wired Garner core over in-memory stores.
///
/// Engines receive their dependencies explicitly at construction - there is no runtime
/// container. Swap the store fields for durable implementations by constructing the engines
/// directly; this assembly exists for tests, tooling and single-process deployments.
pub struct System<Ck> {
    pub config: CoreConfig,
    pub clock: Arc<Ck>,
    pub reference: Arc<ReferenceData>,
    pub rules: RuleSetHandle,
    pub outbox: Arc<Outbox>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthRegistry>,

    pub position_store: Arc<PositionStore>,
    pub availability_store: Arc<AvailabilityStore>,
    pub locate_store: Arc<LocateStore>,
    pub client_limits: Arc<ClientLimitStore>,
    pub au_limits: Arc<AuLimitStore>,

    pub position: Arc<PositionEngine<PositionStore, Ck>>,
    pub inventory: Arc<InventoryEngine<AvailabilityStore, Ck>>,
    pub locate: Arc<LocateWorkflow<LocateStore, Ck>>,
    pub validator: Arc<ShortSellValidator<ClientLimitStore, AuLimitStore, Ck>>,
    pub dispatcher: Arc<Dispatcher<PositionStore, AvailabilityStore, LocateStore, Ck>>,
}

impl<Ck> std::fmt::Debug for System<Ck> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Ck> System<Ck>
where
    Ck: Clock + 'static,
{
    pub fn new(
        universe: IndexedSecurities,
        config: CoreConfig,
        clock: Arc<Ck>,
        calendar: BusinessCalendar,
    ) -> Self {
        let reference = Arc::new(ReferenceData::from_universe(universe));
        let rules = RuleSetHandle::default();
        let outbox = Arc::new(Outbox::new());
        let metrics = Arc::new(Metrics::default());
        let health = Arc::new(HealthRegistry::default());

        let position_store = Arc::new(PositionStore::new());
        let availability_store = Arc::new(AvailabilityStore::new());
        let locate_store = Arc::new(LocateStore::new());
        let client_limits = Arc::new(ClientLimitStore::new());
        let au_limits = Arc::new(AuLimitStore::new());

        let position = Arc::new(PositionEngine::new(
            Arc::clone(&reference),
            Arc::clone(&position_store),
            Arc::clone(&outbox),
            Arc::clone(&clock),
            calendar.clone(),
            Arc::clone(&metrics),
        ));

        let inventory = Arc::new(InventoryEngine::new(
            Arc::clone(&reference),
            Arc::clone(&position) as Arc<dyn crate::engine::inventory::PositionSource>,
            Arc::clone(&availability_store),
            rules.clone(),
            Arc::clone(&outbox),
            Arc::clone(&clock),
            config.clone(),
            Arc::clone(&metrics),
        ));

        let locate = Arc::new(LocateWorkflow::new(
            Arc::clone(&locate_store),
            Arc::clone(&inventory) as Arc<dyn crate::locate::LocateInventory>,
            Arc::clone(&reference),
            rules.clone(),
            config.locate.clone(),
            Arc::clone(&outbox),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));

        let validator = Arc::new(ShortSellValidator::new(
            Arc::clone(&reference),
            Arc::clone(&client_limits),
            Arc::clone(&au_limits),
            Arc::clone(&outbox),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            config.deadlines.short_sell,
            config.cache_ttl,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            EventValidator::new(
                Arc::clone(&clock),
                calendar,
                config.dedup_window,
                config.business_date_window,
            ),
            Arc::clone(&reference),
            Arc::clone(&position),
            Arc::clone(&inventory),
            Arc::clone(&locate),
            Arc::clone(&validator) as Arc<dyn crate::validate::QuarantineControl>,
            config.clone(),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));

        Self {
            config,
            clock,
            reference,
            rules,
            outbox,
            metrics,
            health,
            position_store,
            availability_store,
            locate_store,
            client_limits,
            au_limits,
            position,
            inventory,
            locate,
            validator,
            dispatcher,
        }
    }

    /// Spawn the bucketed ingress workers and return the submission handle.
    pub fn start_ingress(&self) -> IngressRuntime {
        IngressRuntime::start(Arc::clone(&self.dispatcher), &self.config)
    }

    /// Spawn the egress publisher over the provided transmitter.
    pub fn spawn_publisher<T>(&self, tx: T) -> tokio::task::JoinHandle<()>
    where
        T: Tx<Item = EgressEvent> + Send + 'static,
        T::Error: Display + Send,
    {
        let publisher = Publisher::new(Arc::clone(&self.outbox), tx, self.config.retry);
        tokio::spawn(publisher.run())
    }

    /// Spawn the periodic locate expiry sweeper.
    pub fn spawn_expiry_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let locate = Arc::clone(&self.locate);
        let interval = self.config.locate.expiry_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(error) = locate.expiry_sweep().await {
                    tracing::warn!(%error, "locate expiry sweep failed");
                }
            }
        })
    }

    /// Refresh the health registry from current queue and outbox depths.
    pub fn report_health(&self, ingress: &IngressRuntime) -> Result<(), CoreError> {
        let now = self.clock.now();
        let ingress_depth = ingress.depth();
        let ingress_health = if ingress_depth >= self.config.high_watermark {
            Health::Degraded
        } else {
            Health::Up
        };
        self.health
            .report(Subsystem::Ingress, ingress_health, None, ingress_depth, now);

        let outbox_depth = self.outbox.depth();
        let publisher_health = if outbox_depth >= self.config.high_watermark {
            Health::Degraded
        } else {
            Health::Up
        };
        self.health.report(
            Subsystem::Publisher,
            publisher_health,
            None,
            outbox_depth,
            now,
        );

        let quarantined = self.validator.quarantined_keys();
        let validator_health = if quarantined.is_empty() {
            Health::Up
        } else {
            Health::Degraded
        };
        self.health.report(
            Subsystem::ShortSellValidator,
            validator_health,
            quarantined.first().cloned(),
            0,
            now,
        );

        self.health
            .report(Subsystem::PositionEngine, Health::Up, None, 0, now);
        self.health
            .report(Subsystem::InventoryEngine, Health::Up, None, 0, now);
        self.health
            .report(Subsystem::LocateWorkflow, Health::Up, None, 0, now);
        Ok(())
    }
}
