use crate::{
    Sequence,
    clock::Clock,
    config::CoreConfig,
    engine::{
        inventory::{
            InventoryEngine,
            availability::{AvailabilityKey, InventoryAvailability},
        },
        position::{Position, PositionEngine, PositionKey},
    },
    error::{CoreError, RetryPolicy, ValidationError},
    event::{IngressEvent, MarketDataEvent, MarketDataKind, ReferenceKind, WorkflowEventKind},
    ingress::validate::EventValidator,
    locate::{LocateRequest, LocateRequestId, LocateWorkflow},
    metrics::Metrics,
    reference::ReferenceData,
    rule::compile,
    store::Store,
    validate::QuarantineControl,
};
use chrono::{DateTime, Utc};
use fnv::FnvBuildHasher;
use garner_instrument::Timed;
use garner_integration::{
    Terminal,
    channel::{Tx, UnboundedRx, UnboundedTx, mpsc_unbounded},
};
use std::{
    hash::BuildHasher,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub mod validate;

/// Result of dispatching a single event.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Durably handled (or dead-lettered); the offset may be committed.
    Handled,
    /// Failed validation; logged and never retried.
    Rejected(ValidationError),
    /// Transient failure; retry after the indicated backoff.
    Deferred { retry_after: Duration },
}

impl Terminal for DispatchOutcome {
    /// Handled and rejected outcomes end an event's processing; deferred outcomes do not.
    fn is_terminal(&self) -> bool {
        !matches!(self, DispatchOutcome::Deferred { .. })
    }
}

/// Permanently failed event, parked with its original payload for operator replay.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: IngressEvent,
    pub error: CoreError,
    pub time: DateTime<Utc>,
}

/// An event paired with its producer offset; `ack` commits the offset once the event is
/// durably handled.
#[derive(Debug)]
pub struct AckableEvent {
    pub event: IngressEvent,
    pub offset: Sequence,
    ack_tx: UnboundedTx<Sequence>,
}

impl AckableEvent {
    pub fn ack(self) {
        // The committed-offset consumer may have gone away during shutdown
        let _ = self.ack_tx.send(self.offset);
    }
}

/// Validates, deduplicates and routes ingress events to the owning engines.
///
/// Failure handling follows the error taxonomy: validation failures reject, transient
/// failures defer with exponential backoff, conflicts retry once, and exhausted or permanent
/// failures are dead-lettered with the offset committed so one poisoned event cannot block
/// its bucket.
pub struct Dispatcher<PSt, ISt, LSt, Ck> {
    validator: EventValidator<Ck>,
    reference: Arc<ReferenceData>,
    position: Arc<PositionEngine<PSt, Ck>>,
    inventory: Arc<InventoryEngine<ISt, Ck>>,
    locate: Arc<LocateWorkflow<LSt, Ck>>,
    quarantine: Arc<dyn QuarantineControl>,
    dead_letters: parking_lot::Mutex<Vec<DeadLetter>>,
    retry: RetryPolicy,
    config: CoreConfig,
    clock: Arc<Ck>,
    metrics: Arc<Metrics>,
}

impl<PSt, ISt, LSt, Ck> std::fmt::Debug for Dispatcher<PSt, ISt, LSt, Ck> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl<PSt, ISt, LSt, Ck> Dispatcher<PSt, ISt, LSt, Ck>
where
    PSt: Store<PositionKey, Position> + 'static,
    ISt: Store<AvailabilityKey, InventoryAvailability> + 'static,
    LSt: Store<LocateRequestId, LocateRequest> + 'static,
    Ck: Clock + 'static,
{
    pub fn new(
        validator: EventValidator<Ck>,
        reference: Arc<ReferenceData>,
        position: Arc<PositionEngine<PSt, Ck>>,
        inventory: Arc<InventoryEngine<ISt, Ck>>,
        locate: Arc<LocateWorkflow<LSt, Ck>>,
        quarantine: Arc<dyn QuarantineControl>,
        config: CoreConfig,
        clock: Arc<Ck>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            validator,
            reference,
            position,
            inventory,
            locate,
            quarantine,
            dead_letters: parking_lot::Mutex::new(Vec::new()),
            retry: config.retry,
            config,
            clock,
            metrics,
        }
    }

    /// Dispatch one event attempt. `attempt` counts prior deferrals of the same event.
    pub async fn dispatch(&self, event: &IngressEvent, attempt: u32) -> DispatchOutcome {
        if attempt == 0
            && let Err(validation) = self.validator.validate(event)
        {
            self.metrics.events_rejected.increment();
            warn!(sub_kind = event.sub_kind(), %validation, "event rejected");
            return DispatchOutcome::Rejected(validation);
        }

        let started = std::time::Instant::now();
        let budget = self.budget_for(event);
        let routed = match tokio::time::timeout(budget, self.route(event)).await {
            Ok(routed) => routed,
            Err(_elapsed) => Err(CoreError::timeout(event.sub_kind(), budget)),
        };

        match routed {
            Ok(()) => {
                self.metrics.events_processed.increment();
                self.metrics.event_latency.record(started.elapsed());
                DispatchOutcome::Handled
            }
            Err(err) => self.handle_failure(event, err, attempt),
        }
    }

    fn handle_failure(
        &self,
        event: &IngressEvent,
        err: CoreError,
        attempt: u32,
    ) -> DispatchOutcome {
        let next_attempt = attempt + 1;

        // Conflicts retry once; transients and timeouts follow the backoff schedule
        let retryable = match &err {
            CoreError::Conflict(_) => next_attempt <= 1,
            CoreError::Transient(_) | CoreError::Timeout { .. } => {
                !self.retry.is_exhausted(next_attempt)
            }
            _ => false,
        };

        if retryable {
            self.metrics.events_deferred.increment();
            let retry_after = self.retry.delay(next_attempt);
            debug!(
                sub_kind = event.sub_kind(),
                %err,
                attempt = next_attempt,
                ?retry_after,
                "event deferred"
            );
            return DispatchOutcome::Deferred { retry_after };
        }

        let permanent = err.into_permanent();
        error!(
            sub_kind = event.sub_kind(),
            error = %permanent,
            "event permanently failed, dead-lettering"
        );
        self.metrics.events_dead_lettered.increment();
        self.dead_letters.lock().push(DeadLetter {
            event: event.clone(),
            error: permanent,
            time: self.clock.now(),
        });
        // Offset commits so the bucket is not head-of-line blocked
        DispatchOutcome::Handled
    }

    /// Route an event to the owning engine(s), per the dispatch table.
    async fn route(&self, event: &IngressEvent) -> Result<(), CoreError> {
        match event {
            IngressEvent::Reference(reference) => match &reference.kind {
                ReferenceKind::Security(security) => self
                    .reference
                    .apply_security(security.clone())
                    .map(|_| ()),
                ReferenceKind::Composition(composition) => {
                    self.reference.upsert_composition(composition.clone());
                    Ok(())
                }
                ReferenceKind::Counterparty(counterparty) => {
                    self.reference.upsert_counterparty(counterparty.clone());
                    Ok(())
                }
                ReferenceKind::AggregationUnit(unit) => {
                    self.reference.upsert_aggregation_unit(unit.clone());
                    Ok(())
                }
            },
            IngressEvent::Market(market) => {
                match market.kind {
                    MarketDataKind::Price(price) | MarketDataKind::Nav(price) => {
                        self.reference.apply_price(
                            &market.security,
                            Timed::new(price, market.header.time_effective),
                        )?;
                    }
                    // Volatility feeds rules only; both engines still observe it
                    MarketDataKind::Volatility(_) => {}
                }
                self.fanout_market(market).await
            }
            IngressEvent::Trade(trade) => self.position.on_trade(trade).await.map(|_| ()),
            IngressEvent::Position(position) => {
                self.position.on_position_event(position).await?;
                self.inventory.on_position_event(position).await.map(|_| ())
            }
            IngressEvent::Contract(contract) => {
                self.inventory.on_contract(contract).await.map(|_| ())
            }
            IngressEvent::Inventory(inventory) => {
                self.inventory.on_inventory_event(inventory).await.map(|_| ())
            }
            IngressEvent::Locate(locate) => self.locate.on_locate_event(locate).await,
            IngressEvent::Workflow(workflow) => match &workflow.kind {
                WorkflowEventKind::RuleSetUpdate(rules) => {
                    let compiled = compile::compile(rules.clone())
                        .map_err(|err| CoreError::Permanent(err.to_string()))?;
                    self.inventory.rules().swap(compiled);
                    Ok(())
                }
                WorkflowEventKind::QuarantineClear { key } => {
                    if self.quarantine.clear_quarantine(key) {
                        info!(key, "quarantine cleared");
                    } else {
                        warn!(key, "quarantine clear for unknown key");
                    }
                    Ok(())
                }
            },
        }
    }

    /// Market data fans out to both engines concurrently under the shared deadline; the
    /// first failure cancels the sibling.
    async fn fanout_market(&self, market: &MarketDataEvent) -> Result<(), CoreError> {
        tokio::try_join!(self.position.on_market_data(market), async {
            self.inventory.on_market_data(market).await.map(|_| ())
        })
        .map(|_| ())
    }

    fn budget_for(&self, event: &IngressEvent) -> Duration {
        match event {
            IngressEvent::Locate(_) => self.config.deadlines.locate,
            IngressEvent::Contract(_) | IngressEvent::Inventory(_) => {
                self.config.deadlines.inventory
            }
            _ => self.config.deadlines.position,
        }
    }

    /// Drain accumulated dead letters (operational surface).
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().drain(..).collect()
    }
}

struct Bucket {
    tx: UnboundedTx<AckableEvent>,
    depth: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

/// Hash-bucketed ingress runtime.
///
/// Events are routed to a bucket by security id, so all events for one security process in
/// submission order while different securities proceed in parallel across the tokio worker
/// pool. Submission applies backpressure: when a bucket exceeds the high watermark the
/// submitter suspends until the bucket drains below the low watermark.
pub struct IngressRuntime {
    buckets: Vec<Bucket>,
    offsets: AtomicU64,
    ack_tx: UnboundedTx<Sequence>,
    committed_rx: parking_lot::Mutex<UnboundedRx<Sequence>>,
    high_watermark: usize,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for IngressRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressRuntime")
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

impl IngressRuntime {
    /// Spawn one worker task per bucket and return the submission handle.
    pub fn start<PSt, ISt, LSt, Ck>(
        dispatcher: Arc<Dispatcher<PSt, ISt, LSt, Ck>>,
        config: &CoreConfig,
    ) -> Self
    where
        PSt: Store<PositionKey, Position> + 'static,
        ISt: Store<AvailabilityKey, InventoryAvailability> + 'static,
        LSt: Store<LocateRequestId, LocateRequest> + 'static,
        Ck: Clock + 'static,
    {
        let (ack_tx, committed_rx) = mpsc_unbounded();
        let bucket_count = config.bucket_count();
        let low_watermark = config.low_watermark;

        let mut buckets = Vec::with_capacity(bucket_count);
        let mut workers = Vec::with_capacity(bucket_count);

        for bucket_index in 0..bucket_count {
            let (tx, mut rx) = mpsc_unbounded::<AckableEvent>();
            let depth = Arc::new(AtomicUsize::new(0));
            let drained = Arc::new(Notify::new());

            let worker_dispatcher = Arc::clone(&dispatcher);
            let worker_depth = Arc::clone(&depth);
            let worker_drained = Arc::clone(&drained);
            workers.push(tokio::spawn(async move {
                while let Some(ackable) = rx.recv().await {
                    let mut attempt = 0u32;
                    loop {
                        let outcome = worker_dispatcher.dispatch(&ackable.event, attempt).await;
                        if outcome.is_terminal() {
                            break;
                        }
                        if let DispatchOutcome::Deferred { retry_after } = outcome {
                            attempt += 1;
                            tokio::time::sleep(retry_after).await;
                        }
                    }

                    ackable.ack();
                    let remaining = worker_depth.fetch_sub(1, Ordering::SeqCst) - 1;
                    if remaining <= low_watermark {
                        worker_drained.notify_waiters();
                    }
                }
                debug!(bucket_index, "ingress bucket worker stopped");
            }));

            buckets.push(Bucket { tx, depth, drained });
        }

        Self {
            buckets,
            offsets: AtomicU64::new(0),
            ack_tx,
            committed_rx: parking_lot::Mutex::new(committed_rx),
            high_watermark: config.high_watermark,
            workers,
        }
    }

    /// Submit an event for processing, suspending under backpressure.
    ///
    /// Returns the assigned producer offset.
    pub async fn submit(&self, event: IngressEvent) -> Sequence {
        let bucket = self.bucket_for(&event);
        let offset = Sequence(self.offsets.fetch_add(1, Ordering::SeqCst));

        // Backpressure: pause while the bucket is above the high watermark
        loop {
            let notified = bucket.drained.notified();
            if bucket.depth.load(Ordering::SeqCst) < self.high_watermark {
                break;
            }
            notified.await;
        }

        bucket.depth.fetch_add(1, Ordering::SeqCst);
        let ackable = AckableEvent {
            event,
            offset,
            ack_tx: self.ack_tx.clone(),
        };
        if bucket.tx.send(ackable).is_err() {
            warn!("ingress bucket worker gone, event dropped");
        }
        offset
    }

    fn bucket_for(&self, event: &IngressEvent) -> &Bucket {
        let hash = match event.security_id() {
            Some(security) => FnvBuildHasher::default().hash_one(security),
            None => FnvBuildHasher::default().hash_one(event.sub_kind()),
        } as usize;
        &self.buckets[hash % self.buckets.len()]
    }

    /// Total queued events across buckets.
    pub fn depth(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.depth.load(Ordering::SeqCst))
            .sum()
    }

    /// Committed offsets accumulated since the last call.
    pub fn committed(&self) -> Vec<Sequence> {
        self.committed_rx.lock().drain()
    }

    /// Await until everything submitted so far has been processed.
    pub async fn quiesce(&self) {
        while self.depth() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}
