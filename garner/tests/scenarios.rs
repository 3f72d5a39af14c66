use garner::{
    clock::{BusinessCalendar, FrozenClock},
    config::CoreConfig,
    engine::{
        inventory::{
            availability::{AvailabilityKey, CalculationType, InventoryAvailability},
            limits::{AggregationUnitLimitKey, ClientLimitKey, SellSide, TradingLimit},
        },
        position::{PositionKey, PositionProvenance},
    },
    event::{IngressEvent, PositionEvent, PositionEventKind},
    locate::{
        LocateDecision, LocateRequestId, LocateStatus, LocateSubmission, LocateType,
        SwapCashIndicator,
    },
    rule::{
        Action, CalculationRule, DecisionStatus, RuleName, RuleState,
        compile::{CompiledRuleSet, compile},
    },
    store::Store,
    system::System,
    test_utils::{header_on, test_date, test_time, trade},
    validate::{OrderRequest, RejectReason, Validation},
};
use chrono::NaiveDate;
use garner_instrument::{
    Audit,
    aggregation::AggregationUnitId,
    basket::{Constituent, IndexComposition},
    book::BookId,
    counterparty::CounterpartyId,
    index::IndexedSecurities,
    market::Market,
    security::{Security, SecurityId, Temperature},
    test_utils::{basket_security, security},
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{sync::Arc, time::Duration};

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn build_system(securities: Vec<Security>) -> (System<FrozenClock>, Arc<FrozenClock>) {
    let clock = Arc::new(FrozenClock::new(test_time()));
    let system = System::new(
        IndexedSecurities::new(securities),
        CoreConfig::default(),
        Arc::clone(&clock),
        BusinessCalendar::default(),
    );
    (system, clock)
}

fn locate_approval_rules() -> CompiledRuleSet {
    compile(vec![CalculationRule {
        name: RuleName::from("locate-auto-approve"),
        version: 1,
        rule_type: CalculationType::Locate,
        market: None,
        priority: 0,
        effective: date("2024-01-01"),
        expiry: None,
        conditions: vec![],
        actions: vec![Action::SetStatus(DecisionStatus::Approved)],
        state: RuleState::Active,
    }])
    .unwrap()
}

async fn seed_locate_availability(
    system: &System<FrozenClock>,
    ticker: &str,
    available: Decimal,
) -> AvailabilityKey {
    let index = system
        .reference
        .find_index(&SecurityId::new(ticker))
        .unwrap();
    let key = AvailabilityKey::firm(index, CalculationType::Locate, test_date());
    let snapshot = system.reference.security(index);
    let record = InventoryAvailability {
        security: index,
        security_id: snapshot.id.clone(),
        counterparty: None,
        aggregation_unit: None,
        calculation: CalculationType::Locate,
        business_date: test_date(),
        gross_quantity: available,
        net_quantity: available,
        available_quantity: available,
        reserved_quantity: Decimal::ZERO,
        decrement_quantity: Decimal::ZERO,
        market: snapshot.market,
        temperature: snapshot.temperature,
        borrow_rate: None,
        applied_rule: None,
        status: DecisionStatus::Approved,
        external_source: false,
        audit: Audit::new(test_time()),
    };
    system
        .availability_store
        .put(key.clone(), record, None)
        .await
        .unwrap();
    key
}

fn locate_submission(ticker: &str, quantity: Decimal) -> LocateSubmission {
    LocateSubmission {
        request_id: LocateRequestId::from("L1"),
        security: SecurityId::new(ticker),
        requestor: CounterpartyId::new("trader-1"),
        client: CounterpartyId::new("C1"),
        aggregation_unit: None,
        requested_quantity: quantity,
        locate_type: LocateType::ShortSell,
        swap_cash: SwapCashIndicator::Cash,
        expiry: None,
    }
}

async fn seed_limits(
    system: &System<FrozenClock>,
    ticker: &str,
    short_limit: Decimal,
    short_used: Decimal,
) {
    let index = system
        .reference
        .find_index(&SecurityId::new(ticker))
        .unwrap();

    let mut client_limit =
        TradingLimit::new(dec!(1000000), short_limit, Audit::new(test_time()));
    client_limit.short_sell_used = short_used;
    system
        .client_limits
        .put(
            ClientLimitKey {
                client: CounterpartyId::new("C1"),
                security: index,
                business_date: test_date(),
            },
            client_limit,
            None,
        )
        .await
        .unwrap();

    system
        .au_limits
        .put(
            AggregationUnitLimitKey {
                aggregation_unit: AggregationUnitId::new("AU1"),
                security: index,
                business_date: test_date(),
            },
            TradingLimit::new(dec!(1000000), dec!(1000000), Audit::new(test_time())),
            None,
        )
        .await
        .unwrap();
}

fn short_sell_order(ticker: &str, quantity: Decimal) -> OrderRequest {
    OrderRequest {
        order_id: "O1".into(),
        security: SecurityId::new(ticker),
        client: CounterpartyId::new("C1"),
        aggregation_unit: AggregationUnitId::new("AU1"),
        side: SellSide::ShortSell,
        quantity,
    }
}

#[tokio::test]
async fn s1_trade_builds_position_and_ladder() {
    let (system, _clock) = build_system(vec![security("AAPL", Market::Us)]);

    let trade = trade("B1", "AAPL", dec!(1000), test_date(), date("2024-06-05"));
    let updated = system.position.on_trade(&trade).await.unwrap().into_vec();
    assert_eq!(updated.len(), 1);

    let position = &updated[0];
    assert_eq!(position.settled_qty, dec!(0));
    assert_eq!(position.contractual_qty, dec!(1000));
    assert_eq!(position.receipt[2], dec!(1000));
    assert_eq!(position.total_receipts, dec!(1000));
    assert_eq!(position.projected_net_position, dec!(1000));
    assert_eq!(
        position.calculation_status,
        garner::engine::position::CalculationStatus::Valid
    );

    // Ladder view agrees
    let ladder = position.settlement_ladder();
    assert_eq!(ladder.net_for_day(2), dec!(1000));
    assert_eq!(ladder.settlement_date_for_day(2), Some(date("2024-06-05")));
}

#[tokio::test]
async fn s2_basket_trade_expands_to_constituents() {
    let (system, _clock) = build_system(vec![
        basket_security("SPY", Market::Us),
        security("AAPL", Market::Us),
        security("MSFT", Market::Us),
    ]);

    system.reference.upsert_composition(IndexComposition {
        parent: SecurityId::new("SPY"),
        constituents: vec![
            Constituent::new(SecurityId::new("AAPL"), dec!(0.3)),
            Constituent::new(SecurityId::new("MSFT"), dec!(0.7)),
        ],
        effective: date("2024-06-01"),
        expiry: None,
        audit: Audit::new(test_time()),
    });

    let mut spy_trade = trade("B1", "SPY", dec!(100), test_date(), test_date());
    spy_trade.expand = true;
    let updated = system.position.on_trade(&spy_trade).await.unwrap();
    assert_eq!(updated.len(), 2);

    let aapl = updated
        .iter()
        .find(|position| position.security_id == SecurityId::new("AAPL"))
        .unwrap();
    assert_eq!(aapl.receipt[0], dec!(30));
    let msft = updated
        .iter()
        .find(|position| position.security_id == SecurityId::new("MSFT"))
        .unwrap();
    assert_eq!(msft.receipt[0], dec!(70));

    // No SPY position is written
    let spy_index = system
        .reference
        .find_index(&SecurityId::new("SPY"))
        .unwrap();
    let spy_key = PositionKey {
        book: BookId::new("B1"),
        security: spy_index,
        business_date: test_date(),
    };
    assert!(system.position.position(&spy_key).await.unwrap().is_none());
}

#[tokio::test]
async fn s3_short_sell_validation_consumes_limits_once() {
    let (system, _clock) = build_system(vec![security("AAPL", Market::Us)]);
    seed_limits(&system, "AAPL", dec!(10000), dec!(9500)).await;

    let approved = system
        .validator
        .validate(&short_sell_order("AAPL", dec!(400)))
        .await;
    assert_eq!(approved.validation, Validation::Approved);

    let rejected = system
        .validator
        .validate(&short_sell_order("AAPL", dec!(200)))
        .await;
    assert_eq!(
        rejected.validation,
        Validation::Rejected(RejectReason::ClientLimitExceeded)
    );

    let index = system
        .reference
        .find_index(&SecurityId::new("AAPL"))
        .unwrap();
    let stored = system
        .client_limits
        .get(&ClientLimitKey {
            client: CounterpartyId::new("C1"),
            security: index,
            business_date: test_date(),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.value.short_sell_used, dec!(9900));
}

#[tokio::test]
async fn s4_locate_auto_approve_htb_decrements_in_full() {
    let mut htb = security("AAPL", Market::Us);
    htb.temperature = Temperature::Htb;
    let (system, _clock) = build_system(vec![htb]);
    system.rules.swap(locate_approval_rules());
    let key = seed_locate_availability(&system, "AAPL", dec!(1000)).await;

    let decision = system
        .locate
        .submit(locate_submission("AAPL", dec!(500)), test_date())
        .await
        .unwrap();
    assert_eq!(
        decision,
        LocateDecision::Approved {
            approved_quantity: dec!(500),
            decrement_quantity: dec!(500),
        }
    );

    let record = system
        .availability_store
        .get(&key)
        .await
        .unwrap()
        .unwrap()
        .value;
    assert_eq!(record.available_quantity, dec!(500));
    assert_eq!(record.reserved_quantity, dec!(500));
}

#[tokio::test]
async fn s5_locate_auto_approve_gc_decrements_twenty_percent() {
    let mut gc = security("AAPL", Market::Us);
    gc.temperature = Temperature::Gc;
    let (system, _clock) = build_system(vec![gc]);
    system.rules.swap(locate_approval_rules());
    let key = seed_locate_availability(&system, "AAPL", dec!(1000)).await;

    let decision = system
        .locate
        .submit(locate_submission("AAPL", dec!(500)), test_date())
        .await
        .unwrap();
    assert_eq!(
        decision,
        LocateDecision::Approved {
            approved_quantity: dec!(500),
            decrement_quantity: dec!(100.0),
        }
    );

    let record = system
        .availability_store
        .get(&key)
        .await
        .unwrap()
        .unwrap()
        .value;
    assert_eq!(record.available_quantity, dec!(900));
    assert_eq!(record.reserved_quantity, dec!(100));
}

#[tokio::test]
async fn s6_expiry_sweep_releases_residual_reservation() {
    let mut htb = security("AAPL", Market::Us);
    htb.temperature = Temperature::Htb;
    let (system, clock) = build_system(vec![htb]);
    system.rules.swap(locate_approval_rules());
    let key = seed_locate_availability(&system, "AAPL", dec!(1000)).await;

    let mut submission = locate_submission("AAPL", dec!(200));
    submission.expiry = Some(test_time() + chrono::Duration::hours(1));
    system
        .locate
        .submit(submission, test_date())
        .await
        .unwrap();

    // Nothing expires while the locate is still live
    assert_eq!(system.locate.expiry_sweep().await.unwrap(), 0);

    clock.advance(chrono::Duration::hours(2));
    assert_eq!(system.locate.expiry_sweep().await.unwrap(), 1);

    let request = system
        .locate
        .request(&LocateRequestId::from("L1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, LocateStatus::Expired);

    let record = system
        .availability_store
        .get(&key)
        .await
        .unwrap()
        .unwrap()
        .value;
    assert_eq!(record.available_quantity, dec!(1000));
    assert_eq!(record.reserved_quantity, dec!(0));
}

#[tokio::test(start_paused = true)]
async fn s7_slow_store_rejects_with_timeout_and_no_mutation() {
    let (system, _clock) = build_system(vec![security("AAPL", Market::Us)]);
    seed_limits(&system, "AAPL", dec!(10000), dec!(0)).await;
    system.client_limits.set_read_delay(Duration::from_millis(200));

    let response = system
        .validator
        .validate(&short_sell_order("AAPL", dec!(100)))
        .await;
    assert_eq!(
        response.validation,
        Validation::Rejected(RejectReason::Timeout)
    );

    system.client_limits.set_read_delay(Duration::from_millis(0));
    let index = system
        .reference
        .find_index(&SecurityId::new("AAPL"))
        .unwrap();
    let stored = system
        .client_limits
        .get(&ClientLimitKey {
            client: CounterpartyId::new("C1"),
            security: index,
            business_date: test_date(),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.value.short_sell_used, dec!(0));
}

#[tokio::test]
async fn duplicate_event_id_applies_exactly_once() {
    let (system, _clock) = build_system(vec![security("AAPL", Market::Us)]);

    let event: IngressEvent = trade("B1", "AAPL", dec!(1000), test_date(), date("2024-06-05")).into();
    let first = system.dispatcher.dispatch(&event, 0).await;
    assert!(matches!(first, garner::ingress::DispatchOutcome::Handled));

    let second = system.dispatcher.dispatch(&event, 0).await;
    assert!(matches!(
        second,
        garner::ingress::DispatchOutcome::Rejected(_)
    ));

    let index = system
        .reference
        .find_index(&SecurityId::new("AAPL"))
        .unwrap();
    let position = system
        .position
        .position(&PositionKey {
            book: BookId::new("B1"),
            security: index,
            business_date: test_date(),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.contractual_qty, dec!(1000));
}

#[tokio::test]
async fn start_of_day_rolls_eod_and_rejects_after_intraday() {
    let (system, _clock) = build_system(vec![security("AAPL", Market::Us)]);

    // Build an end-of-day position on Monday
    let monday_trade = trade("B1", "AAPL", dec!(1000), test_date(), test_date());
    system.position.on_trade(&monday_trade).await.unwrap();

    // Roll into Tuesday
    let rolled = system
        .position
        .apply_start_of_day(None, date("2024-06-04"))
        .await
        .unwrap();
    assert_eq!(rolled, 1);

    let index = system
        .reference
        .find_index(&SecurityId::new("AAPL"))
        .unwrap();
    let tuesday_key = PositionKey {
        book: BookId::new("B1"),
        security: index,
        business_date: date("2024-06-04"),
    };
    let tuesday = system
        .position
        .position(&tuesday_key)
        .await
        .unwrap()
        .unwrap();
    assert!(tuesday.is_start_of_day);
    assert!(!tuesday.has_intraday);
    // Monday's same-day receipt settled overnight
    assert_eq!(tuesday.settled_qty, dec!(1000));

    // Wednesday: intraday activity arrives before the roll
    let wednesday_trade = trade(
        "B1",
        "AAPL",
        dec!(50),
        date("2024-06-05"),
        date("2024-06-07"),
    );
    system.position.on_trade(&wednesday_trade).await.unwrap();

    let sod_after_intraday = system
        .position
        .apply_start_of_day(None, date("2024-06-05"))
        .await;
    assert!(matches!(
        sod_after_intraday,
        Err(garner::error::CoreError::Conflict(_))
    ));
}

#[tokio::test]
async fn position_update_recomputes_availability() {
    let (system, _clock) = build_system(vec![security("AAPL", Market::Us)]);

    let event = PositionEvent::new(
        header_on(test_date()),
        PositionEventKind::PositionUpdate {
            book: BookId::new("B1"),
            security: SecurityId::new("AAPL"),
            contractual_delta: dec!(0),
            settled_delta: dec!(800),
            provenance: PositionProvenance::House,
            expand: false,
        },
    );
    let ingress: IngressEvent = event.into();
    let outcome = system.dispatcher.dispatch(&ingress, 0).await;
    assert!(matches!(outcome, garner::ingress::DispatchOutcome::Handled));

    let index = system
        .reference
        .find_index(&SecurityId::new("AAPL"))
        .unwrap();
    let for_loan = system
        .inventory
        .availability(&AvailabilityKey::firm(
            index,
            CalculationType::ForLoan,
            test_date(),
        ))
        .await
        .unwrap();
    assert_eq!(for_loan.available_quantity, dec!(800));
    assert_eq!(for_loan.gross_quantity, dec!(800));
}

#[tokio::test]
async fn replaying_a_stream_reproduces_incremental_state() {
    let events: Vec<IngressEvent> = vec![
        trade("B1", "AAPL", dec!(100), test_date(), date("2024-06-05")).into(),
        trade("B1", "MSFT", dec!(200), test_date(), date("2024-06-05")).into(),
        trade("B1", "AAPL", dec!(-50), test_date(), date("2024-06-04")).into(),
        trade("B2", "AAPL", dec!(75), test_date(), test_date()).into(),
    ];

    let (incremental, _clock) = build_system(vec![
        security("AAPL", Market::Us),
        security("MSFT", Market::Us),
    ]);
    let (replay, _clock) = build_system(vec![
        security("AAPL", Market::Us),
        security("MSFT", Market::Us),
    ]);

    for event in &events {
        let outcome = incremental.dispatcher.dispatch(event, 0).await;
        assert!(matches!(outcome, garner::ingress::DispatchOutcome::Handled));
    }
    for event in &events {
        let outcome = replay.dispatcher.dispatch(event, 0).await;
        assert!(matches!(outcome, garner::ingress::DispatchOutcome::Handled));
    }

    let mut incremental_state = incremental.position_store.scan().await.unwrap();
    let mut replay_state = replay.position_store.scan().await.unwrap();
    incremental_state.sort_by(|(a, _), (b, _)| a.cmp(b));
    replay_state.sort_by(|(a, _), (b, _)| a.cmp(b));

    assert_eq!(incremental_state, replay_state);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingress_runtime_preserves_per_security_order() {
    let (system, _clock) = build_system(vec![security("AAPL", Market::Us)]);
    let runtime = system.start_ingress();

    for quantity in [dec!(100), dec!(-40), dec!(25)] {
        runtime
            .submit(trade("B1", "AAPL", quantity, test_date(), date("2024-06-05")).into())
            .await;
    }

    runtime.quiesce().await;

    let index = system
        .reference
        .find_index(&SecurityId::new("AAPL"))
        .unwrap();
    let position = system
        .position
        .position(&PositionKey {
            book: BookId::new("B1"),
            security: index,
            business_date: test_date(),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.contractual_qty, dec!(85));

    assert_eq!(runtime.committed().len(), 3);
    runtime.shutdown();
}

#[tokio::test]
async fn approved_locate_decrement_matches_reservation_exactly() {
    let mut htb = security("AAPL", Market::Us);
    htb.temperature = Temperature::Htb;
    let (system, _clock) = build_system(vec![htb]);
    system.rules.swap(locate_approval_rules());
    let key = seed_locate_availability(&system, "AAPL", dec!(750)).await;

    let decision = system
        .locate
        .submit(locate_submission("AAPL", dec!(750)), test_date())
        .await
        .unwrap();
    let LocateDecision::Approved {
        decrement_quantity, ..
    } = decision
    else {
        panic!("expected approval");
    };

    let record = system
        .availability_store
        .get(&key)
        .await
        .unwrap()
        .unwrap()
        .value;
    assert_eq!(
        record.available_quantity,
        dec!(750) - decrement_quantity
    );
    assert_eq!(record.reserved_quantity, decrement_quantity);

    // A second locate for more than the remaining availability parks for manual review
    let mut second = locate_submission("AAPL", dec!(1));
    second.request_id = LocateRequestId::from("L2");
    let pending = system.locate.submit(second, test_date()).await.unwrap();
    assert_eq!(pending, LocateDecision::Pending);
    assert_eq!(
        system.locate.manual_review_queue(),
        vec![LocateRequestId::from("L2")]
    );
}
