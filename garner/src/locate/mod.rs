use crate::{
    clock::Clock,
    config::LocateConfig,
    engine::inventory::{
        InventoryEngine,
        availability::{AvailabilityKey, CalculationType, InventoryAvailability},
    },
    error::{CoreError, ValidationError},
    event::{EventId, LocateApproved, LocateEvent, LocateEventKind, LocateRejected},
    metrics::Metrics,
    outbox::Outbox,
    reference::ReferenceData,
    rule::{Attribute, DecisionStatus, FactContext, Value, compile::RuleSetHandle},
    store::{Store, Versioned},
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::Display;
use garner_instrument::{
    Audit,
    aggregation::AggregationUnitId,
    counterparty::CounterpartyId,
    security::{SecurityId, SecurityIndex, Temperature},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, info, warn};

/// Unique identifier for a [`LocateRequest`].
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct LocateRequestId(SmolStr);

impl LocateRequestId {
    pub fn new<Id>(id: Id) -> Self
    where
        Id: Into<SmolStr>,
    {
        Self(id.into())
    }
}

impl From<&str> for LocateRequestId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateType {
    ShortSell,
    Borrow,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapCashIndicator {
    Swap,
    Cash,
}

/// Locate request lifecycle states.
///
/// Transitions are exclusive and irreversible:
/// `Pending -> Approved | Rejected | Cancelled`, `Approved -> Expired`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl LocateStatus {
    fn can_transition_to(&self, to: LocateStatus) -> bool {
        matches!(
            (self, to),
            (
                LocateStatus::Pending,
                LocateStatus::Approved | LocateStatus::Rejected | LocateStatus::Cancelled
            ) | (LocateStatus::Approved, LocateStatus::Expired)
        )
    }
}

/// Inbound locate submission payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LocateSubmission {
    pub request_id: LocateRequestId,
    pub security: SecurityId,
    pub requestor: CounterpartyId,
    pub client: CounterpartyId,
    pub aggregation_unit: Option<AggregationUnitId>,
    pub requested_quantity: Decimal,
    pub locate_type: LocateType,
    pub swap_cash: SwapCashIndicator,
    pub expiry: Option<DateTime<Utc>>,
}

/// Pre-trade permission to borrow shares for a short sale.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LocateRequest {
    pub id: LocateRequestId,
    pub security: SecurityId,
    pub requestor: CounterpartyId,
    pub client: CounterpartyId,
    pub aggregation_unit: Option<AggregationUnitId>,
    pub requested_quantity: Decimal,
    pub locate_type: LocateType,
    pub swap_cash: SwapCashIndicator,
    pub status: LocateStatus,
    pub approved_quantity: Option<Decimal>,
    pub decrement_quantity: Option<Decimal>,
    pub rejection_reason: Option<SmolStr>,
    pub expiry: Option<DateTime<Utc>>,
    pub business_date: NaiveDate,
    pub audit: Audit,
}

impl LocateRequest {
    pub fn from_submission(
        submission: LocateSubmission,
        business_date: NaiveDate,
        audit: Audit,
    ) -> Self {
        Self {
            id: submission.request_id,
            security: submission.security,
            requestor: submission.requestor,
            client: submission.client,
            aggregation_unit: submission.aggregation_unit,
            requested_quantity: submission.requested_quantity,
            locate_type: submission.locate_type,
            swap_cash: submission.swap_cash,
            status: LocateStatus::Pending,
            approved_quantity: None,
            decrement_quantity: None,
            rejection_reason: None,
            expiry: submission.expiry,
            business_date,
            audit,
        }
    }

    /// Move to a new lifecycle state, rejecting invalid transitions.
    pub fn transition(&mut self, to: LocateStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::Conflict(format!(
                "locate {} cannot transition {:?} -> {to:?}",
                self.id, self.status
            )));
        }
        self.status = to;
        Ok(())
    }
}

/// Decision returned to a locate submitter.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum LocateDecision {
    Approved {
        approved_quantity: Decimal,
        decrement_quantity: Decimal,
    },
    Rejected {
        reason: SmolStr,
    },
    Pending,
}

/// Locate-availability seam consumed by the workflow.
#[async_trait]
pub trait LocateInventory: Send + Sync {
    async fn locate_record(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
    ) -> Result<InventoryAvailability, CoreError>;

    async fn reserve(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
        quantity: Decimal,
    ) -> Result<(), CoreError>;

    async fn release(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
        quantity: Decimal,
    ) -> Result<(), CoreError>;
}

#[async_trait]
impl<St, Ck> LocateInventory for InventoryEngine<St, Ck>
where
    St: Store<AvailabilityKey, InventoryAvailability>,
    Ck: Clock,
{
    async fn locate_record(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
    ) -> Result<InventoryAvailability, CoreError> {
        self.availability(&AvailabilityKey::firm(
            security,
            CalculationType::Locate,
            business_date,
        ))
        .await
    }

    async fn reserve(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
        quantity: Decimal,
    ) -> Result<(), CoreError> {
        self.reserve_locate(security, business_date, quantity)
            .await
            .map(|_| ())
    }

    async fn release(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
        quantity: Decimal,
    ) -> Result<(), CoreError> {
        self.release_locate(security, business_date, quantity)
            .await
            .map(|_| ())
    }
}

/// Owns [`LocateRequest`] lifecycles: auto-approval on submission, manual decisions, and the
/// periodic expiry sweep.
pub struct LocateWorkflow<St, Ck> {
    requests: Arc<St>,
    inventory: Arc<dyn LocateInventory>,
    reference: Arc<ReferenceData>,
    rules: RuleSetHandle,
    policy: LocateConfig,
    manual_queue: parking_lot::Mutex<VecDeque<LocateRequestId>>,
    outbox: Arc<Outbox>,
    clock: Arc<Ck>,
    metrics: Arc<Metrics>,
}

impl<St, Ck> std::fmt::Debug for LocateWorkflow<St, Ck>
where
    St: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocateWorkflow")
            .field("requests", &self.requests)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<St, Ck> LocateWorkflow<St, Ck>
where
    St: Store<LocateRequestId, LocateRequest>,
    Ck: Clock,
{
    pub fn new(
        requests: Arc<St>,
        inventory: Arc<dyn LocateInventory>,
        reference: Arc<ReferenceData>,
        rules: RuleSetHandle,
        policy: LocateConfig,
        outbox: Arc<Outbox>,
        clock: Arc<Ck>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            requests,
            inventory,
            reference,
            rules,
            policy,
            manual_queue: parking_lot::Mutex::new(VecDeque::new()),
            outbox,
            clock,
            metrics,
        }
    }

    /// Route a locate lifecycle event to the matching operation.
    pub async fn on_locate_event(&self, event: &LocateEvent) -> Result<(), CoreError> {
        match &event.kind {
            LocateEventKind::Submit(submission) => {
                self.submit(submission.clone(), event.header.business_date)
                    .await
                    .map(|_| ())
            }
            LocateEventKind::Approve {
                request,
                approved_quantity,
            } => self
                .approve_manual(request, *approved_quantity)
                .await
                .map(|_| ()),
            LocateEventKind::Reject { request, reason } => {
                self.reject_manual(request, reason.clone()).await
            }
            LocateEventKind::Cancel { request } => self.cancel(request).await,
        }
    }

    /// Submit a locate request and attempt auto-approval.
    ///
    /// The locate rule chain decides: `Approved` proceeds to an availability check and an
    /// atomic reservation; `Rejected` records the reason; anything else (including an
    /// availability shortfall after rule approval) parks the request for manual review.
    pub async fn submit(
        &self,
        submission: LocateSubmission,
        business_date: NaiveDate,
    ) -> Result<LocateDecision, CoreError> {
        let security_index = self.reference.find_index(&submission.security)?;
        let security = self.reference.security(security_index);

        let mut request = LocateRequest::from_submission(
            submission,
            business_date,
            Audit::new(self.clock.now()),
        );
        self.requests
            .put(request.id.clone(), request.clone(), None)
            .await?;

        let ctx = FactContext::new()
            .with(Attribute::Market, security.market)
            .with(Attribute::Temperature, security.temperature)
            .with(Attribute::SecurityKind, Value::text(security.kind.as_str()))
            .with(Attribute::RequestedQuantity, request.requested_quantity)
            .with(
                Attribute::SwapCash,
                Value::text(match request.swap_cash {
                    SwapCashIndicator::Swap => "swap",
                    SwapCashIndicator::Cash => "cash",
                }),
            )
            .with(
                Attribute::LocateType,
                Value::text(match request.locate_type {
                    LocateType::ShortSell => "short_sell",
                    LocateType::Borrow => "borrow",
                }),
            );
        let ctx = match self
            .reference
            .counterparty(&request.client)
            .map(|counterparty| counterparty.kind)
        {
            Some(kind) => ctx.with(Attribute::CounterpartyKind, Value::text(kind.as_str())),
            None => ctx,
        };

        let outcome =
            self.rules
                .load()
                .evaluate(CalculationType::Locate, security.market, business_date, &ctx);
        let temperature = outcome.temperature.unwrap_or(security.temperature);

        match outcome.decision {
            Some(DecisionStatus::Approved) => {
                self.try_auto_approve(&mut request, security_index, temperature)
                    .await
            }
            Some(DecisionStatus::Rejected) => {
                let reason = outcome
                    .matched
                    .map(|(name, version)| SmolStr::new(format!("rule {name} v{version}")))
                    .unwrap_or_else(|| SmolStr::new_static("rejected by rule"));
                self.reject(&mut request, reason.clone()).await?;
                Ok(LocateDecision::Rejected { reason })
            }
            Some(DecisionStatus::Pending) | None => {
                self.park_for_review(&request);
                Ok(LocateDecision::Pending)
            }
        }
    }

    /// Manually approve a pending request. Mirrors auto-approval but never re-evaluates the
    /// rule chain.
    pub async fn approve_manual(
        &self,
        id: &LocateRequestId,
        approved_quantity: Decimal,
    ) -> Result<LocateDecision, CoreError> {
        let mut stored = self.load(id).await?;
        if approved_quantity > stored.value.requested_quantity {
            return Err(CoreError::Validation(ValidationError::Invalid(format!(
                "approved quantity {approved_quantity} exceeds requested {}",
                stored.value.requested_quantity
            ))));
        }

        let security_index = self.reference.find_index(&stored.value.security)?;
        let temperature = self.reference.temperature(security_index);
        let market = self.reference.market(security_index);

        let record = self
            .inventory
            .locate_record(security_index, stored.value.business_date)
            .await?;
        if record.available_quantity < approved_quantity {
            self.park_for_review(&stored.value);
            return Ok(LocateDecision::Pending);
        }

        let decrement = self
            .policy
            .decrement
            .decrement(approved_quantity, market, temperature);
        self.approve(&mut stored.value, Some(stored.version), security_index, approved_quantity, decrement)
            .await?;

        Ok(LocateDecision::Approved {
            approved_quantity,
            decrement_quantity: decrement,
        })
    }

    /// Manually reject a pending request.
    pub async fn reject_manual(
        &self,
        id: &LocateRequestId,
        reason: SmolStr,
    ) -> Result<(), CoreError> {
        let mut stored = self.load(id).await?;
        let version = stored.version;
        self.reject_versioned(&mut stored.value, Some(version), reason)
            .await
    }

    /// Cancel a pending request.
    pub async fn cancel(&self, id: &LocateRequestId) -> Result<(), CoreError> {
        let mut stored = self.load(id).await?;
        stored.value.transition(LocateStatus::Cancelled)?;
        stored.value.audit.touch(self.clock.now());
        self.requests
            .put(id.clone(), stored.value, Some(stored.version))
            .await?;
        info!(%id, "locate cancelled");
        Ok(())
    }

    /// Expire approved locates past their expiry and release residual reservations.
    ///
    /// Runs on a periodic tick (see [`LocateConfig::expiry_sweep_interval`]).
    pub async fn expiry_sweep(&self) -> Result<usize, CoreError> {
        let now = self.clock.now();
        let mut expired = 0usize;

        for (id, stored) in self.requests.scan().await? {
            if stored.value.status != LocateStatus::Approved {
                continue;
            }
            let Some(expiry) = stored.value.expiry else {
                continue;
            };
            if expiry > now {
                continue;
            }

            let mut request = stored.value;
            request.transition(LocateStatus::Expired)?;
            request.audit.touch(now);

            if let Some(decrement) = request.decrement_quantity {
                let security_index = self.reference.find_index(&request.security)?;
                self.inventory
                    .release(security_index, request.business_date, decrement)
                    .await?;
            }

            self.requests
                .put(id.clone(), request, Some(stored.version))
                .await?;
            expired += 1;
            debug!(%id, "locate expired");
        }

        Ok(expired)
    }

    /// Requests awaiting manual review, oldest first.
    pub fn manual_review_queue(&self) -> Vec<LocateRequestId> {
        self.manual_queue.lock().iter().cloned().collect()
    }

    pub async fn request(&self, id: &LocateRequestId) -> Result<Option<LocateRequest>, CoreError> {
        Ok(self
            .requests
            .get(id)
            .await?
            .map(|versioned| versioned.value))
    }

    async fn try_auto_approve(
        &self,
        request: &mut LocateRequest,
        security_index: SecurityIndex,
        temperature: Temperature,
    ) -> Result<LocateDecision, CoreError> {
        let record = self
            .inventory
            .locate_record(security_index, request.business_date)
            .await?;

        if record.available_quantity < request.requested_quantity {
            debug!(
                id = %request.id,
                requested = %request.requested_quantity,
                available = %record.available_quantity,
                "insufficient locate availability, parking for manual review"
            );
            self.park_for_review(request);
            return Ok(LocateDecision::Pending);
        }

        let market = self.reference.market(security_index);
        let approved_quantity = request.requested_quantity;
        let decrement = self
            .policy
            .decrement
            .decrement(approved_quantity, market, temperature);

        let stored = self.load(&request.id).await?;
        self.approve(request, Some(stored.version), security_index, approved_quantity, decrement)
            .await?;

        Ok(LocateDecision::Approved {
            approved_quantity,
            decrement_quantity: decrement,
        })
    }

    async fn approve(
        &self,
        request: &mut LocateRequest,
        expected: Option<u64>,
        security_index: SecurityIndex,
        approved_quantity: Decimal,
        decrement: Decimal,
    ) -> Result<(), CoreError> {
        request.transition(LocateStatus::Approved)?;
        request.approved_quantity = Some(approved_quantity);
        request.decrement_quantity = Some(decrement);
        request.audit.touch(self.clock.now());

        // Reserve first: if the reservation races away, the request stays Pending in store
        self.inventory
            .reserve(security_index, request.business_date, decrement)
            .await?;

        if let Err(error) = self
            .requests
            .put(request.id.clone(), request.clone(), expected)
            .await
        {
            // Compensate the reservation so inventory is not leaked
            warn!(id = %request.id, %error, "locate persist failed, releasing reservation");
            self.inventory
                .release(security_index, request.business_date, decrement)
                .await?;
            return Err(error.into());
        }

        self.remove_from_review(&request.id);
        self.outbox.push(
            LocateApproved::new(
                EventId::random(),
                self.clock.now(),
                request.id.clone(),
                request.security.clone(),
                approved_quantity,
                decrement,
            )
            .into(),
        );
        self.metrics.validations_approved.increment();
        info!(id = %request.id, %approved_quantity, %decrement, "locate approved");
        Ok(())
    }

    async fn reject(&self, request: &mut LocateRequest, reason: SmolStr) -> Result<(), CoreError> {
        let stored = self.load(&request.id).await?;
        self.reject_versioned(request, Some(stored.version), reason)
            .await
    }

    async fn reject_versioned(
        &self,
        request: &mut LocateRequest,
        expected: Option<u64>,
        reason: SmolStr,
    ) -> Result<(), CoreError> {
        request.transition(LocateStatus::Rejected)?;
        request.rejection_reason = Some(reason.clone());
        request.audit.touch(self.clock.now());
        self.requests
            .put(request.id.clone(), request.clone(), expected)
            .await?;

        self.remove_from_review(&request.id);
        self.outbox.push(
            LocateRejected::new(
                EventId::random(),
                self.clock.now(),
                request.id.clone(),
                reason,
            )
            .into(),
        );
        self.metrics.validations_rejected.increment();
        info!(id = %request.id, "locate rejected");
        Ok(())
    }

    fn park_for_review(&self, request: &LocateRequest) {
        let mut queue = self.manual_queue.lock();
        if !queue.contains(&request.id) {
            queue.push_back(request.id.clone());
        }
    }

    fn remove_from_review(&self, id: &LocateRequestId) {
        self.manual_queue.lock().retain(|queued| queued != id);
    }

    async fn load(
        &self,
        id: &LocateRequestId,
    ) -> Result<Versioned<LocateRequest>, CoreError> {
        self.requests.get(id).await?.ok_or_else(|| {
            CoreError::Validation(ValidationError::Invalid(format!(
                "unknown locate request: {id}"
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn request(status: LocateStatus) -> LocateRequest {
        LocateRequest {
            id: LocateRequestId::from("L1"),
            security: SecurityId::new("AAPL"),
            requestor: CounterpartyId::new("trader-1"),
            client: CounterpartyId::new("C1"),
            aggregation_unit: None,
            requested_quantity: dec!(500),
            locate_type: LocateType::ShortSell,
            swap_cash: SwapCashIndicator::Cash,
            status,
            approved_quantity: None,
            decrement_quantity: None,
            rejection_reason: None,
            expiry: None,
            business_date: "2024-06-03".parse().unwrap(),
            audit: Audit::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    #[test]
    fn test_transition_matrix() {
        struct TestCase {
            from: LocateStatus,
            to: LocateStatus,
            expected: bool,
        }

        let cases = vec![
            // TC0-2: pending moves to every terminal decision
            TestCase {
                from: LocateStatus::Pending,
                to: LocateStatus::Approved,
                expected: true,
            },
            TestCase {
                from: LocateStatus::Pending,
                to: LocateStatus::Rejected,
                expected: true,
            },
            TestCase {
                from: LocateStatus::Pending,
                to: LocateStatus::Cancelled,
                expected: true,
            },
            // TC3: approved can only expire
            TestCase {
                from: LocateStatus::Approved,
                to: LocateStatus::Expired,
                expected: true,
            },
            // TC4: no reverse transitions
            TestCase {
                from: LocateStatus::Approved,
                to: LocateStatus::Pending,
                expected: false,
            },
            // TC5: rejected is terminal
            TestCase {
                from: LocateStatus::Rejected,
                to: LocateStatus::Approved,
                expected: false,
            },
            // TC6: pending cannot expire directly
            TestCase {
                from: LocateStatus::Pending,
                to: LocateStatus::Expired,
                expected: false,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let mut request = request(test.from);
            let actual = request.transition(test.to).is_ok();
            assert_eq!(actual, test.expected, "TC{index} failed");
            if test.expected {
                assert_eq!(request.status, test.to, "TC{index} status");
            }
        }
    }
}
