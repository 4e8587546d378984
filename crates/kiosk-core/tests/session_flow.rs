//! End-to-end session flow tests for kiosk-core.
//!
//! Every test runs the full core (reader polling, dispatcher, metering loop,
//! cache refresh) on mock hardware with tokio's clock paused, so minutes of
//! charging take no wall-clock time.

use std::sync::Arc;
use std::time::Duration;

use kiosk_core::{
    CardReader, Error, IdentityOutcome, Kiosk, KioskConfig, KioskEvent, LedgerStore, LedgerSync,
    MemoryLedger, MeterConfig, MockMeter, MockReader, MockRelay, PowerMeter, Relay, RetryConfig,
    SessionConfig, SessionStatus, StopReason, Subscription, UserAccount,
};
use tokio::time::timeout;

/// Upper bound on virtual time any single wait may take.
const WAIT: Duration = Duration::from_secs(3600);

struct Harness {
    kiosk: Kiosk,
    reader: Arc<MockReader>,
    relay: Arc<MockRelay>,
    ledger: Arc<MemoryLedger>,
}

fn accounts() -> Vec<UserAccount> {
    vec![
        UserAccount::new("RFID001", "Asha").with_balance(80.0),
        UserAccount::new("RFID002", "Ravi").with_balance(50.0),
        UserAccount::new("RFID003", "Meera"),
    ]
}

fn config(cost_per_kwh: f64) -> KioskConfig {
    KioskConfig {
        session: SessionConfig {
            meter: MeterConfig {
                cost_per_kwh,
                ..MeterConfig::default()
            },
            settlement_retry: RetryConfig::quick(),
            ..SessionConfig::default()
        },
        event_capacity: 4096,
        ..KioskConfig::default()
    }
}

fn harness(config: KioskConfig, power_w: f64) -> Harness {
    let reader = Arc::new(MockReader::new());
    let relay = Arc::new(MockRelay::new());
    let ledger = Arc::new(MemoryLedger::with_accounts(accounts()));
    let kiosk = Kiosk::builder()
        .reader(Arc::clone(&reader) as Arc<dyn CardReader>)
        .relay(Arc::clone(&relay) as Arc<dyn Relay>)
        .meter(Arc::new(MockMeter::new(230.0, power_w)) as Arc<dyn PowerMeter>)
        .ledger(Arc::clone(&ledger) as Arc<dyn LedgerStore>)
        .config(config)
        .start()
        .unwrap();
    Harness {
        kiosk,
        reader,
        relay,
        ledger,
    }
}

/// Receive events until one matches `pred`.
async fn wait_for(events: &mut Subscription, pred: impl Fn(&KioskEvent) -> bool) -> KioskEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("broadcaster closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is(kind: &'static str) -> impl Fn(&KioskEvent) -> bool {
    move |e| e.event_type() == kind
}

/// Count identity events arriving within `window`.
async fn identity_events_within(events: &mut Subscription, window: Duration) -> Vec<KioskEvent> {
    let deadline = tokio::time::Instant::now() + window;
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if event.event_type() == "identity_event" {
            seen.push(event);
        }
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn test_tap_starts_and_rescan_stops() {
    let h = harness(config(10.0), 3300.0);
    let mut events = h.kiosk.subscribe();
    h.kiosk.pricing().stage("RFID001", 40.0).await;

    h.reader.tap("RFID001").await;
    let started = wait_for(&mut events, is("session_started")).await;
    let session = started.session().unwrap();
    assert_eq!(session.paid_amount, 40.0);
    assert_eq!(session.start_battery, 35.0);
    assert!((session.target_battery - 75.0).abs() < 1e-9);
    assert!(h.relay.is_enabled());
    assert_eq!(h.ledger.balance("RFID001").await, Some(40.0));

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.reader.tap("RFID001").await;
    let ended = wait_for(&mut events, is("session_ended")).await;
    let session = ended.session().unwrap();

    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.stop_reason, Some(StopReason::UserRescan));
    assert_eq!(session.ledger_sync, LedgerSync::Synced);
    assert!(session.energy_delivered_wh > 0.0);
    assert!(!h.relay.is_enabled());
    // The settled balance is what the ledger holds
    assert_eq!(h.ledger.balance("RFID001").await, Some(session.remaining_balance));
    assert!(session.remaining_balance < 80.0);
    assert_eq!(h.ledger.writes().await.len(), 2);

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_same_token_within_window_is_one_event() {
    let h = harness(config(10.0), 3300.0);
    let mut events = h.kiosk.subscribe();

    h.reader.tap("RFID003").await;
    h.reader.tap("RFID003").await;
    let seen = identity_events_within(&mut events, Duration::from_secs(1)).await;
    assert_eq!(seen.len(), 1);

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_held_card_debits_exactly_once_within_window() {
    let h = harness(config(10.0), 3300.0);
    let mut events = h.kiosk.subscribe();

    h.reader.present("RFID001").await;
    let seen = identity_events_within(&mut events, Duration::from_millis(1900)).await;

    assert_eq!(seen.len(), 1);
    assert!(h.kiosk.machine().is_charging());
    assert_eq!(h.relay.enable_count(), 1);
    assert_eq!(h.ledger.writes().await.len(), 1);

    h.reader.remove().await;
    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_held_card_presents_again_after_window() {
    let h = harness(config(10.0), 3300.0);
    let mut events = h.kiosk.subscribe();

    h.reader.present("RFID001").await;
    wait_for(&mut events, is("session_started")).await;
    let started_at = tokio::time::Instant::now();

    // The owner's card is still there once the window has passed
    let ended = wait_for(&mut events, is("session_ended")).await;
    h.reader.remove().await;
    assert!(started_at.elapsed() >= Duration::from_millis(1500));
    assert_eq!(ended.session().unwrap().stop_reason, Some(StopReason::UserRescan));
    assert_eq!(h.relay.enable_count(), 1);

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_session_in_progress() {
    let h = harness(config(10.0), 3300.0);
    let mut events = h.kiosk.subscribe();

    h.reader.tap("RFID001").await;
    wait_for(&mut events, is("session_started")).await;

    h.reader.tap("RFID002").await;
    let seen = identity_events_within(&mut events, Duration::from_secs(2)).await;
    assert_eq!(seen.len(), 1);

    assert!(matches!(
        h.kiosk.machine().start_session("RFID002").await,
        Err(Error::ConcurrentSessionConflict { .. })
    ));
    let current = h.kiosk.machine().current_session().unwrap();
    assert_eq!(current.token_id, "RFID001");
    assert_eq!(h.relay.enable_count(), 1);
    assert_eq!(h.ledger.balance("RFID002").await, Some(50.0));

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_cards_never_enable_relay() {
    let h = harness(config(10.0), 3300.0);
    let mut events = h.kiosk.subscribe();

    h.reader.tap("UNKNOWN").await;
    h.reader.tap("RFID003").await;
    let seen = identity_events_within(&mut events, Duration::from_secs(2)).await;

    let outcomes: Vec<_> = seen
        .iter()
        .map(|e| match e {
            KioskEvent::Identity { payload, .. } => payload.outcome,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(
        outcomes,
        vec![
            IdentityOutcome::RejectedUnknown,
            IdentityOutcome::RejectedInsufficientBalance
        ]
    );
    assert_eq!(h.relay.enable_count(), 0);
    assert!(h.ledger.writes().await.is_empty());

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_credit_exhausted_before_target_completes() {
    // 40 per kWh: 40 paid buys 1 kWh, far short of the 75% target
    let h = harness(config(40.0), 36_000.0);
    let mut events = h.kiosk.subscribe();
    h.kiosk.pricing().stage("RFID001", 40.0).await;
    h.reader.tap("RFID001").await;

    let mut last_energy = 0.0;
    let mut last_battery = 0.0;
    let mut updates = 0;
    let ended = timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            match event.event_type() {
                "session_updated" => {
                    let s = event.session().unwrap();
                    assert!(s.energy_delivered_wh >= last_energy);
                    assert!(s.end_battery >= last_battery);
                    last_energy = s.energy_delivered_wh;
                    last_battery = s.end_battery;
                    updates += 1;
                }
                "session_ended" => return event,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    let session = ended.session().unwrap();
    assert!(updates > 1);
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.stop_reason, Some(StopReason::BalanceExhausted));
    assert_eq!(session.end_battery, last_battery);
    assert!(session.end_battery < session.target_battery);
    assert_eq!(session.credit_remaining, 0.0);
    assert!((session.remaining_balance - 40.0).abs() < 1e-9);
    assert_eq!(h.ledger.balance("RFID001").await, Some(session.remaining_balance));
    assert!(!h.relay.is_enabled());

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_target_reached_completes() {
    // 5 per kWh: credit outlasts the target
    let h = harness(config(5.0), 36_000.0);
    let mut events = h.kiosk.subscribe();
    h.kiosk.pricing().stage("RFID001", 40.0).await;
    h.reader.tap("RFID001").await;

    let ended = wait_for(&mut events, is("session_ended")).await;
    let session = ended.session().unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.stop_reason, Some(StopReason::TargetReached));
    assert!(session.end_battery >= 75.0);
    assert!(session.credit_remaining > 0.0);
    assert!(session.remaining_balance > 40.0);
    assert_eq!(h.ledger.balance("RFID001").await, Some(session.remaining_balance));

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_settlement_write_failure_recovers() {
    let h = harness(config(10.0), 3300.0);
    let mut events = h.kiosk.subscribe();
    h.kiosk.machine().start_session("RFID001").await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    h.ledger.fail_next_writes(1);
    let session = h.kiosk.machine().stop().await.unwrap();
    assert!(!h.relay.is_enabled());
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.ledger_sync, LedgerSync::Unsynced);

    wait_for(&mut events, is("operator_alert")).await;
    let resettled = wait_for(&mut events, |e| {
        e.session()
            .is_some_and(|s| e.event_type() == "session_settled" && s.ledger_sync == LedgerSync::Synced)
    })
    .await;
    let settled = resettled.session().unwrap();
    assert_eq!(settled.id, session.id);
    assert_eq!(h.ledger.balance("RFID001").await, Some(session.remaining_balance));

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_debit_supersedes_pending_settlement() {
    let mut cfg = config(10.0);
    cfg.session.settlement_retry = RetryConfig::new(3)
        .initial_delay(Duration::from_secs(600))
        .jitter(false);
    let h = harness(cfg, 3300.0);

    let first = h.kiosk.machine().start_session("RFID001").await.unwrap();
    h.ledger.fail_next_writes(1);
    let ended = h.kiosk.machine().stop().await.unwrap();
    assert_eq!(ended.ledger_sync, LedgerSync::Unsynced);
    // Ledger still holds the post-debit balance
    assert_eq!(
        h.ledger.balance("RFID001").await,
        Some(80.0 - first.paid_amount)
    );

    h.kiosk.pricing().stage("RFID001", 10.0).await;
    let second = h.kiosk.machine().start_session("RFID001").await.unwrap();
    assert_eq!(second.remaining_balance, ended.remaining_balance);
    assert_eq!(
        h.ledger.balance("RFID001").await,
        Some(ended.remaining_balance - 10.0)
    );
    assert!(h.kiosk.machine().unsynced_accounts().await.is_empty());
    assert_eq!(
        h.kiosk.machine().recent_sessions().await[0].ledger_sync,
        LedgerSync::Synced
    );

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_adjust_then_get_returns_written_value() {
    let h = harness(config(10.0), 3300.0);
    let cache = h.kiosk.ledger();
    cache.get("RFID002").await.unwrap();

    cache.adjust_balance("RFID002", 12.5).await.unwrap();
    assert_eq!(cache.get("RFID002").await.unwrap().unwrap().balance, 12.5);

    h.kiosk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_and_settles() {
    let h = harness(config(10.0), 3300.0);
    h.kiosk.machine().start_session("RFID001").await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    h.kiosk.shutdown().await;

    assert!(!h.relay.is_enabled());
    let last = h.kiosk.machine().recent_sessions().await.remove(0);
    assert_eq!(last.stop_reason, Some(StopReason::Shutdown));
    assert_eq!(last.ledger_sync, LedgerSync::Synced);
    assert_eq!(h.ledger.balance("RFID001").await, Some(last.remaining_balance));
}
