//! The charging session state machine.
//!
//! [`SessionMachine`] owns the single charging circuit. It is the only code
//! that switches the relay or mutates a session, and it serializes every
//! transition behind one async mutex:
//!
//! ```text
//!            accepted (funded)                     rescan / stop / metering / shutdown
//!   Idle ─────────────────────────▶ InProgress ─────────────────────────────▶ Settling
//!    ▲   quote → debit → relay on                  relay off → ledger write      │
//!    └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A start is fail-closed: if the debit fails nothing happens, and if the
//! relay refuses to close the debit is refunded and no session exists.
//! Settlement is fail-safe: the relay is opened first, whatever the ledger
//! does afterwards. A settlement write that fails is retried in the
//! background; a later debit or admin write for the same account carries the
//! pending balance and supersedes the retry.
//!
//! Queries never wait on a transition: the current state is published on a
//! [`tokio::sync::watch`] channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use kiosk_types::{
    AlertKind, ChargingSession, IdentityEvent, KioskEvent, LedgerSync, OperatorAlert,
    SessionStatus, StopReason, UserAccount,
};

use crate::error::{Error, Result};
use crate::events::EventBroadcaster;
use crate::ledger::LedgerCache;
use crate::metering::{MeterConfig, MeterSignal, advance};
use crate::pricing::Pricing;
use crate::retry::{RetryConfig, with_retry};
use crate::traits::{PowerMeter, PowerSample, Relay};

/// State of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    /// No session; the relay is open.
    Idle,
    /// A session holds the circuit and is being metered.
    InProgress,
    /// A session is being closed and settled.
    Settling,
}

impl MachineState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Settling => "settling",
        }
    }
}

/// Point-in-time view of the machine.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Machine state.
    pub state: MachineState,
    /// The session holding the circuit, if any.
    pub session: Option<ChargingSession>,
}

/// What an identity event did to the machine.
#[derive(Debug, Clone)]
pub enum Transition {
    /// A new session started.
    Started(ChargingSession),
    /// The active session ended and was settled.
    Ended(ChargingSession),
    /// Nothing changed.
    Ignored,
}

/// Session machine configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Metering parameters.
    pub meter: MeterConfig,
    /// Finished sessions kept in memory.
    pub history_limit: usize,
    /// Operator alerts kept in memory.
    pub alert_limit: usize,
    /// Backoff for settlement writes that failed.
    pub settlement_retry: RetryConfig,
    /// Backoff for refunds after an aborted start.
    pub refund_retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            meter: MeterConfig::default(),
            history_limit: 50,
            alert_limit: 100,
            settlement_retry: RetryConfig::for_settlement(),
            refund_retry: RetryConfig::for_refund(),
        }
    }
}

struct Inner {
    state: MachineState,
    current: Option<ChargingSession>,
    last_metered: Instant,
}

/// A balance the ledger still owes an account.
#[derive(Debug, Clone)]
struct PendingSettlement {
    seq: u64,
    balance: f64,
    session_id: Option<Uuid>,
}

/// The single-circuit session state machine.
pub struct SessionMachine {
    me: Weak<SessionMachine>,
    inner: Mutex<Inner>,
    relay: Arc<dyn Relay>,
    meter: Arc<dyn PowerMeter>,
    ledger: Arc<LedgerCache>,
    pricing: Arc<dyn Pricing>,
    events: EventBroadcaster,
    config: SessionConfig,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    history: RwLock<VecDeque<ChargingSession>>,
    alerts: RwLock<VecDeque<OperatorAlert>>,
    pending: Mutex<HashMap<String, PendingSettlement>>,
    next_seq: AtomicU64,
    retry_cancel: CancellationToken,
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot_tx.borrow();
        f.debug_struct("SessionMachine")
            .field("state", &snapshot.state)
            .field("session", &snapshot.session.as_ref().map(|s| s.id))
            .finish()
    }
}

impl SessionMachine {
    /// Create an idle machine.
    pub fn new(
        relay: Arc<dyn Relay>,
        meter: Arc<dyn PowerMeter>,
        ledger: Arc<LedgerCache>,
        pricing: Arc<dyn Pricing>,
        events: EventBroadcaster,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            state: MachineState::Idle,
            session: None,
        });
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: Mutex::new(Inner {
                state: MachineState::Idle,
                current: None,
                last_metered: Instant::now(),
            }),
            relay,
            meter,
            ledger,
            pricing,
            events,
            config,
            snapshot_tx,
            history: RwLock::new(VecDeque::new()),
            alerts: RwLock::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            retry_cancel: CancellationToken::new(),
        })
    }

    // ==================== Queries ====================

    /// Current state and session, without waiting on a transition.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// The session holding the circuit, if any.
    pub fn current_session(&self) -> Option<ChargingSession> {
        self.snapshot_tx.borrow().session.clone()
    }

    /// Whether a session is being metered.
    pub fn is_charging(&self) -> bool {
        self.snapshot_tx.borrow().state == MachineState::InProgress
    }

    /// Finished sessions, newest first.
    pub async fn recent_sessions(&self) -> Vec<ChargingSession> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Operator alerts, newest first.
    pub async fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.read().await.iter().cloned().collect()
    }

    /// Accounts whose settled balance has not reached the ledger yet.
    pub async fn unsynced_accounts(&self) -> Vec<(String, f64)> {
        let mut owed: Vec<_> = self
            .pending
            .lock()
            .await
            .iter()
            .map(|(token, p)| (token.clone(), p.balance))
            .collect();
        owed.sort_by(|a, b| a.0.cmp(&b.0));
        owed
    }

    /// The event broadcaster this machine publishes to.
    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    // ==================== Transitions ====================

    /// Handle one logical card presentation.
    ///
    /// The identity event is broadcast first. While idle an accepted account
    /// starts a session; while in progress the owner's card stops it and
    /// every other presentation is ignored.
    pub async fn handle_identity(&self, event: IdentityEvent) -> Result<Transition> {
        self.events.publish(KioskEvent::identity(event.clone()));

        let mut inner = self.inner.lock().await;
        match inner.state {
            MachineState::Idle => {
                let Some(user) = event.accepted_user() else {
                    debug!("Rejected card {} ({:?})", event.token_id, event.outcome);
                    return Ok(Transition::Ignored);
                };
                // The event may carry a stale account; the debit needs a fresh one
                let account = self
                    .ledger
                    .get_fresh(&user.token_id)
                    .await?
                    .ok_or_else(|| Error::UnknownIdentity(user.token_id.clone()))?;
                self.start_locked(&mut inner, account)
                    .await
                    .map(Transition::Started)
            }
            MachineState::InProgress => {
                let owner = inner.current.as_ref().map(|s| s.token_id.as_str());
                // The owner's own debit may have left a zero balance, so the
                // outcome does not matter here
                if owner == Some(event.token_id.as_str()) {
                    info!("Owner {} rescanned, stopping session", event.token_id);
                    self.finish_locked(&mut inner, StopReason::UserRescan)
                        .await
                        .map(Transition::Ended)
                } else {
                    debug!(
                        "Ignoring card {} while circuit is in use",
                        event.token_id
                    );
                    Ok(Transition::Ignored)
                }
            }
            MachineState::Settling => Ok(Transition::Ignored),
        }
    }

    /// Start a session for `token_id` directly (manual or UI start).
    ///
    /// Fails with [`Error::ConcurrentSessionConflict`] unless idle; starts
    /// are never queued.
    pub async fn start_session(&self, token_id: &str) -> Result<ChargingSession> {
        let mut inner = self.inner.lock().await;
        if let Some(conflict) = Self::conflict(&inner) {
            return Err(conflict);
        }
        let account = self
            .ledger
            .get_fresh(token_id)
            .await?
            .ok_or_else(|| Error::UnknownIdentity(token_id.to_string()))?;
        self.start_locked(&mut inner, account).await
    }

    /// Stop the active session on operator request.
    pub async fn stop(&self) -> Result<ChargingSession> {
        self.stop_with(StopReason::Operator).await
    }

    /// Stop the active session for `reason`.
    pub async fn stop_with(&self, reason: StopReason) -> Result<ChargingSession> {
        let mut inner = self.inner.lock().await;
        if inner.state != MachineState::InProgress {
            return Err(Error::NoActiveSession);
        }
        self.finish_locked(&mut inner, reason).await
    }

    /// Fold a meter sample into the active session.
    ///
    /// Publishes `session_updated` and, when metering signals the end,
    /// settles the session.
    pub async fn apply_sample(&self, sample: PowerSample) -> Result<Option<MeterSignal>> {
        let mut inner = self.inner.lock().await;
        if inner.state != MachineState::InProgress {
            return Ok(None);
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(inner.last_metered);
        inner.last_metered = now;

        let Some(session) = inner.current.as_mut() else {
            return Ok(None);
        };
        let signal = advance(session, sample, elapsed, &self.config.meter);
        debug!(
            "Session {}: {:.1} Wh, battery {:.1}%, credit {:.2}",
            session.id, session.energy_delivered_wh, session.end_battery, session.credit_remaining
        );
        let updated = session.clone();
        self.events.publish(KioskEvent::session_updated(updated));
        self.publish_snapshot(&inner);

        if let Some(signal) = signal {
            let reason = match signal {
                MeterSignal::TargetReached => StopReason::TargetReached,
                MeterSignal::BalanceExhausted => StopReason::BalanceExhausted,
            };
            self.finish_locked(&mut inner, reason).await?;
        }
        Ok(signal)
    }

    /// Write an absolute balance for an account from the admin surface.
    ///
    /// Refused while that account is charging. Supersedes any pending
    /// settlement retry for the account.
    pub async fn set_balance(&self, token_id: &str, balance: f64) -> Result<f64> {
        let inner = self.inner.lock().await;
        if let Some(session) = inner.current.as_ref() {
            if session.token_id == token_id {
                return Err(Error::ConcurrentSessionConflict {
                    active_session: session.id,
                    state: inner.state.as_str(),
                });
            }
        }

        let mut pending = self.pending.lock().await;
        let written = self.ledger.adjust_balance(token_id, balance).await?;
        if let Some(superseded) = pending.remove(token_id) {
            info!(
                "Admin balance write for {} supersedes pending settlement of {:.2}",
                token_id, superseded.balance
            );
            if let Some(id) = superseded.session_id {
                self.mark_ledger_sync(id, LedgerSync::Synced).await;
            }
        }
        Ok(written)
    }

    /// Stop any active session and cancel background settlement retries.
    pub async fn shutdown(&self) {
        match self.stop_with(StopReason::Shutdown).await {
            Ok(session) => info!("Session {} stopped for shutdown", session.id),
            Err(Error::NoActiveSession) => {
                // Open the relay regardless of what we think its state is
                if let Err(e) = self.relay.disable().await {
                    warn!("Relay disable at shutdown failed: {}", e);
                }
            }
            Err(e) => error!("Failed to stop session at shutdown: {}", e),
        }

        let owed = self.unsynced_accounts().await;
        if !owed.is_empty() {
            warn!(
                "{} account(s) still owe a ledger write at shutdown: {:?}",
                owed.len(),
                owed
            );
        }
        self.retry_cancel.cancel();
    }

    // ==================== Internals ====================

    fn conflict(inner: &Inner) -> Option<Error> {
        if inner.state == MachineState::Idle {
            return None;
        }
        Some(Error::ConcurrentSessionConflict {
            active_session: inner.current.as_ref().map(|s| s.id).unwrap_or_default(),
            state: inner.state.as_str(),
        })
    }

    async fn start_locked(&self, inner: &mut Inner, account: UserAccount) -> Result<ChargingSession> {
        if let Some(conflict) = Self::conflict(inner) {
            return Err(conflict);
        }

        // Hold the pending map so a settlement retry cannot interleave with the debit
        let mut pending = self.pending.lock().await;
        let owed = pending.get(&account.token_id).cloned();
        let balance = owed.as_ref().map_or(account.balance, |p| p.balance);
        if balance <= 0.0 {
            return Err(Error::InsufficientBalance {
                token_id: account.token_id.clone(),
                balance,
            });
        }
        let account = UserAccount { balance, ..account };

        let start_battery = match self.meter.state_of_charge().await {
            Ok(Some(percent)) => percent.clamp(0.0, 100.0),
            Ok(None) => self.config.meter.assumed_start_battery,
            Err(e) => {
                warn!("State of charge unavailable, assuming baseline: {}", e);
                self.config.meter.assumed_start_battery
            }
        };
        let quote = self.pricing.quote(&account, start_battery).await?;
        let after_debit = balance - quote.paid_amount;

        if let Err(e) = self.ledger.adjust_balance(&account.token_id, after_debit).await {
            warn!("Debit for {} failed, not starting: {}", account.token_id, e);
            return Err(e);
        }
        if let Some(owed) = pending.remove(&account.token_id) {
            info!(
                "Debit for {} carried pending settlement of {:.2}",
                account.token_id, owed.balance
            );
            if let Some(id) = owed.session_id {
                self.mark_ledger_sync(id, LedgerSync::Synced).await;
            }
        }
        drop(pending);

        if let Err(e) = self.relay.enable().await {
            error!("Relay enable failed for {}: {}", account.token_id, e);
            // Open a possibly half-closed contact
            if let Err(e) = self.relay.disable().await {
                warn!("Relay disable after failed enable also failed: {}", e);
            }
            self.refund(&account.token_id, balance).await;
            self.raise(
                OperatorAlert::new(AlertKind::RelayFault, format!("Relay did not close: {e}"))
                    .for_token(&account.token_id),
            )
            .await;
            return Err(e);
        }

        let session = ChargingSession {
            id: Uuid::new_v4(),
            token_id: account.token_id.clone(),
            user_name: account.name.clone(),
            paid_amount: quote.paid_amount,
            start_battery: quote.start_battery,
            target_battery: quote.target_battery,
            end_battery: quote.start_battery,
            energy_delivered_wh: 0.0,
            voltage: 0.0,
            current: 0.0,
            power_w: 0.0,
            credit_remaining: quote.paid_amount,
            remaining_balance: balance,
            status: SessionStatus::InProgress,
            stop_reason: None,
            ledger_sync: LedgerSync::Pending,
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
        };
        info!(
            "Session {} started for {}: paid {:.2}, {:.1}% -> {:.1}%",
            session.id,
            session.token_id,
            session.paid_amount,
            session.start_battery,
            session.target_battery
        );

        inner.state = MachineState::InProgress;
        inner.current = Some(session.clone());
        inner.last_metered = Instant::now();
        self.events.publish(KioskEvent::session_started(session.clone()));
        self.publish_snapshot(inner);
        Ok(session)
    }

    async fn refund(&self, token_id: &str, balance: f64) {
        let ledger = Arc::clone(&self.ledger);
        let result = with_retry(&self.config.refund_retry, "refund", || {
            let ledger = Arc::clone(&ledger);
            let token_id = token_id.to_string();
            async move { ledger.adjust_balance(&token_id, balance).await }
        })
        .await;

        match result {
            Ok(_) => info!("Refunded {} to {:.2}", token_id, balance),
            Err(e) => {
                self.raise(
                    OperatorAlert::new(
                        AlertKind::RefundFailed,
                        format!("Refund to {balance:.2} failed: {e}"),
                    )
                    .for_token(token_id),
                )
                .await;
                self.schedule_settlement(token_id, balance, None).await;
            }
        }
    }

    async fn finish_locked(&self, inner: &mut Inner, reason: StopReason) -> Result<ChargingSession> {
        let Some(mut session) = inner.current.take() else {
            return Err(Error::NoActiveSession);
        };
        inner.state = MachineState::Settling;
        inner.current = Some(session.clone());
        self.publish_snapshot(inner);

        if let Err(e) = self.relay.disable().await {
            self.raise(
                OperatorAlert::new(AlertKind::RelayFault, format!("Relay did not open: {e}"))
                    .for_session(&session),
            )
            .await;
        }

        session.status = reason.status();
        session.stop_reason = Some(reason);
        session.ended_at = Some(OffsetDateTime::now_utc());

        match self
            .ledger
            .adjust_balance(&session.token_id, session.remaining_balance)
            .await
        {
            Ok(_) => session.ledger_sync = LedgerSync::Synced,
            Err(e) => {
                session.ledger_sync = LedgerSync::Unsynced;
                self.raise(
                    OperatorAlert::new(
                        AlertKind::LedgerWriteFailed,
                        format!(
                            "Settlement of {:.2} failed, retrying: {e}",
                            session.remaining_balance
                        ),
                    )
                    .for_session(&session),
                )
                .await;
            }
        }

        info!(
            "Session {} {} ({}): {:.1} Wh, battery {:.1}%, balance {:.2} [{}]",
            session.id,
            session.status,
            reason,
            session.energy_delivered_wh,
            session.end_battery,
            session.remaining_balance,
            session.ledger_sync
        );

        {
            let mut history = self.history.write().await;
            history.push_front(session.clone());
            history.truncate(self.config.history_limit);
        }
        if session.ledger_sync == LedgerSync::Unsynced {
            self.schedule_settlement(
                &session.token_id,
                session.remaining_balance,
                Some(session.id),
            )
            .await;
        }
        self.events.publish(KioskEvent::session_ended(session.clone()));

        inner.state = MachineState::Idle;
        inner.current = None;
        self.publish_snapshot(inner);
        Ok(session)
    }

    async fn schedule_settlement(&self, token_id: &str, balance: f64, session_id: Option<Uuid>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().await.insert(
            token_id.to_string(),
            PendingSettlement {
                seq,
                balance,
                session_id,
            },
        );

        let Some(machine) = self.me.upgrade() else {
            return;
        };
        let token_id = token_id.to_string();
        let cancel = self.retry_cancel.clone();
        tokio::spawn(async move {
            let config = machine.config.settlement_retry.clone();
            let attempt = async {
                // The first write already failed; back off before trying again
                tokio::time::sleep(config.initial_delay).await;
                with_retry(&config, "settlement", || {
                    let machine = Arc::clone(&machine);
                    let token_id = token_id.clone();
                    async move { machine.settle_pending(&token_id, seq).await }
                })
                .await
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Settlement retry for {} cancelled, balance {:.2} unsynced", token_id, balance);
                    return;
                }
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(true) => {
                    info!("Settlement for {} written on retry", token_id);
                    if let Some(id) = session_id {
                        machine.mark_ledger_sync(id, LedgerSync::Synced).await;
                    }
                }
                Ok(false) => debug!("Settlement retry for {} superseded", token_id),
                Err(e) => {
                    if let Some(id) = session_id {
                        machine
                            .mark_ledger_sync(id, LedgerSync::NeedsReconciliation)
                            .await;
                    }
                    machine
                        .raise(
                            OperatorAlert::new(
                                AlertKind::ReconciliationRequired,
                                format!(
                                    "Ledger balance for {token_id} must be set to {balance:.2}: {e}"
                                ),
                            )
                            .for_token(&token_id),
                        )
                        .await;
                }
            }
        });
    }

    /// One settlement attempt. `Ok(false)` when superseded.
    async fn settle_pending(&self, token_id: &str, seq: u64) -> Result<bool> {
        let mut pending = self.pending.lock().await;
        let balance = match pending.get(token_id) {
            Some(entry) if entry.seq == seq => entry.balance,
            _ => return Ok(false),
        };
        self.ledger.adjust_balance(token_id, balance).await?;
        pending.remove(token_id);
        Ok(true)
    }

    async fn mark_ledger_sync(&self, session_id: Uuid, sync: LedgerSync) {
        let updated = {
            let mut history = self.history.write().await;
            history.iter_mut().find(|s| s.id == session_id).map(|s| {
                s.ledger_sync = sync;
                s.clone()
            })
        };
        if let Some(session) = updated {
            self.events.publish(KioskEvent::session_settled(session));
        }
    }

    async fn raise(&self, alert: OperatorAlert) {
        error!("Operator alert ({:?}): {}", alert.kind, alert.message);
        {
            let mut alerts = self.alerts.write().await;
            alerts.push_front(alert.clone());
            alerts.truncate(self.config.alert_limit);
        }
        self.events.publish(KioskEvent::alert(alert));
    }

    fn publish_snapshot(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            state: inner.state,
            session: inner.current.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CacheConfig;
    use crate::mock::{MemoryLedger, MockMeter, MockRelay};
    use crate::pricing::RatioPricing;
    use crate::traits::LedgerStore;
    use kiosk_types::IdentityOutcome;
    use std::time::Duration;

    struct Rig {
        machine: Arc<SessionMachine>,
        relay: Arc<MockRelay>,
        ledger: Arc<MemoryLedger>,
        pricing: Arc<RatioPricing>,
    }

    fn rig() -> Rig {
        let ledger = Arc::new(MemoryLedger::with_accounts([
            UserAccount::new("RFID001", "Asha").with_balance(80.0),
            UserAccount::new("RFID002", "Ravi").with_balance(50.0),
            UserAccount::new("RFID003", "Meera"),
        ]));
        let relay = Arc::new(MockRelay::new());
        let pricing = Arc::new(RatioPricing::new(100.0));
        let cache = Arc::new(LedgerCache::new(
            Arc::clone(&ledger) as Arc<dyn LedgerStore>,
            CacheConfig::default(),
        ));
        let config = SessionConfig {
            settlement_retry: RetryConfig::new(2)
                .initial_delay(Duration::from_millis(10))
                .jitter(false),
            refund_retry: RetryConfig::none(),
            ..SessionConfig::default()
        };
        let machine = SessionMachine::new(
            Arc::clone(&relay) as Arc<dyn Relay>,
            Arc::new(MockMeter::default()),
            cache,
            Arc::clone(&pricing) as Arc<dyn Pricing>,
            EventBroadcaster::new(32),
            config,
        );
        Rig {
            machine,
            relay,
            ledger,
            pricing,
        }
    }

    async fn accepted(rig: &Rig, token: &str) -> IdentityEvent {
        let ledger = rig.ledger.list_accounts().await.unwrap();
        let account = ledger.into_iter().find(|a| a.token_id == token);
        IdentityEvent::resolve(token, account)
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_card_starts_session() {
        let rig = rig();
        rig.pricing.stage("RFID001", 40.0).await;
        let event = accepted(&rig, "RFID001").await;

        let Transition::Started(session) = rig.machine.handle_identity(event).await.unwrap() else {
            panic!("expected a start");
        };
        assert_eq!(session.paid_amount, 40.0);
        assert_eq!(session.start_battery, 35.0);
        assert!((session.target_battery - 75.0).abs() < 1e-9);
        assert_eq!(session.remaining_balance, 80.0);
        assert!(rig.relay.is_enabled());
        assert_eq!(rig.ledger.balance("RFID001").await, Some(40.0));
        assert_eq!(rig.machine.snapshot().state, MachineState::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_card_never_enables_relay() {
        let rig = rig();
        for token in ["RFID003", "UNKNOWN"] {
            let event = accepted(&rig, token).await;
            let transition = rig.machine.handle_identity(event).await.unwrap();
            assert!(matches!(transition, Transition::Ignored));
        }
        assert_eq!(rig.relay.enable_count(), 0);
        assert_eq!(rig.ledger.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_by_owner_stops_and_settles() {
        let rig = rig();
        rig.pricing.stage("RFID001", 40.0).await;
        let event = accepted(&rig, "RFID001").await;
        rig.machine.handle_identity(event.clone()).await.unwrap();

        let Transition::Ended(session) = rig.machine.handle_identity(event).await.unwrap() else {
            panic!("expected an end");
        };
        assert_eq!(session.status, SessionStatus::Stopped);
        assert_eq!(session.stop_reason, Some(StopReason::UserRescan));
        assert_eq!(session.ledger_sync, LedgerSync::Synced);
        assert!(!rig.relay.is_enabled());
        // Nothing consumed, the whole payment comes back
        assert_eq!(rig.ledger.balance("RFID001").await, Some(80.0));
        assert_eq!(rig.machine.snapshot().state, MachineState::Idle);
        assert_eq!(rig.machine.recent_sessions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_rescan_stops_session_that_took_whole_balance() {
        let rig = rig();
        // Nothing staged: the whole balance of 50 is paid
        let started = rig.machine.start_session("RFID002").await.unwrap();
        assert_eq!(started.paid_amount, 50.0);
        assert_eq!(rig.ledger.balance("RFID002").await, Some(0.0));

        let rescan = accepted(&rig, "RFID002").await;
        assert_eq!(rescan.outcome, IdentityOutcome::RejectedInsufficientBalance);

        let Transition::Ended(session) = rig.machine.handle_identity(rescan).await.unwrap() else {
            panic!("expected an end");
        };
        assert_eq!(session.stop_reason, Some(StopReason::UserRescan));
        assert!(!rig.relay.is_enabled());
        assert_eq!(rig.ledger.balance("RFID002").await, Some(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_refused_when_balance_cannot_be_refreshed() {
        let rig = rig();
        rig.pricing.stage("RFID001", 40.0).await;
        rig.machine.start_session("RFID001").await.unwrap();
        rig.machine.stop().await.unwrap();
        assert_eq!(rig.ledger.balance("RFID001").await, Some(80.0));

        // The settlement write invalidated the snapshot; refetching now fails
        rig.ledger.set_reads_fail(true);
        rig.pricing.stage("RFID001", 60.0).await;
        let event = IdentityEvent::accepted(UserAccount::new("RFID001", "Asha").with_balance(120.0));

        assert!(matches!(
            rig.machine.handle_identity(event).await,
            Err(Error::LedgerUnavailable(_))
        ));
        assert!(matches!(
            rig.machine.start_session("RFID001").await,
            Err(Error::LedgerUnavailable(_))
        ));
        assert_eq!(rig.relay.enable_count(), 1);
        assert_eq!(rig.ledger.balance("RFID001").await, Some(80.0));
        assert_eq!(rig.machine.snapshot().state, MachineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_card_during_session_is_ignored() {
        let rig = rig();
        rig.machine.start_session("RFID001").await.unwrap();
        let other = accepted(&rig, "RFID002").await;

        let transition = rig.machine.handle_identity(other).await.unwrap();
        assert!(matches!(transition, Transition::Ignored));
        assert_eq!(rig.relay.enable_count(), 1);
        assert!(rig.relay.is_enabled());
        assert_eq!(rig.ledger.balance("RFID002").await, Some(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_busy_is_conflict() {
        let rig = rig();
        rig.machine.start_session("RFID001").await.unwrap();
        assert!(matches!(
            rig.machine.start_session("RFID002").await,
            Err(Error::ConcurrentSessionConflict { state: "in_progress", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debit_failure_aborts_start() {
        let rig = rig();
        rig.ledger.set_writes_fail(true);
        assert!(matches!(
            rig.machine.start_session("RFID001").await,
            Err(Error::LedgerWriteFailed { .. })
        ));
        assert_eq!(rig.relay.enable_count(), 0);
        assert_eq!(rig.machine.snapshot().state, MachineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_failure_refunds_and_alerts() {
        let rig = rig();
        rig.relay.set_enable_fails(true);
        assert!(matches!(
            rig.machine.start_session("RFID001").await,
            Err(Error::RelayFault { .. })
        ));
        assert_eq!(rig.ledger.balance("RFID001").await, Some(80.0));
        assert!(rig.machine.current_session().is_none());
        let alerts = rig.machine.alerts().await;
        assert_eq!(alerts[0].kind, AlertKind::RelayFault);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_stuck_both_ways_still_refunds() {
        let rig = rig();
        rig.relay.set_enable_fails(true);
        rig.relay.set_disable_fails(true);
        assert!(matches!(
            rig.machine.start_session("RFID001").await,
            Err(Error::RelayFault { operation: "enable", .. })
        ));
        assert_eq!(rig.relay.disable_count(), 1);
        assert_eq!(rig.ledger.balance("RFID001").await, Some(80.0));
        assert_eq!(rig.machine.snapshot().state, MachineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle() {
        let rig = rig();
        assert!(matches!(rig.machine.stop().await, Err(Error::NoActiveSession)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_failure_marks_unsynced_and_retries() {
        let rig = rig();
        rig.pricing.stage("RFID001", 40.0).await;
        rig.machine.start_session("RFID001").await.unwrap();

        let mut events = rig.machine.events().subscribe();
        rig.ledger.fail_next_writes(1);
        let session = rig.machine.stop().await.unwrap();
        assert!(!rig.relay.is_enabled());
        assert_eq!(session.status, SessionStatus::Stopped);
        assert_eq!(session.ledger_sync, LedgerSync::Unsynced);
        assert_eq!(rig.machine.unsynced_accounts().await.len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rig.ledger.balance("RFID001").await, Some(80.0));
        assert!(rig.machine.unsynced_accounts().await.is_empty());
        assert_eq!(
            rig.machine.recent_sessions().await[0].ledger_sync,
            LedgerSync::Synced
        );

        // One end per session; the late sync change is its own event
        let mut kinds = Vec::new();
        while let Some(event) = events.try_recv() {
            kinds.push(event.event_type());
        }
        assert_eq!(kinds.iter().filter(|k| **k == "session_ended").count(), 1);
        assert_eq!(kinds.last(), Some(&"session_settled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_need_reconciliation() {
        let rig = rig();
        rig.machine.start_session("RFID001").await.unwrap();
        rig.ledger.set_writes_fail(true);
        rig.machine.stop().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            rig.machine.recent_sessions().await[0].ledger_sync,
            LedgerSync::NeedsReconciliation
        );
        assert!(
            rig.machine
                .alerts()
                .await
                .iter()
                .any(|a| a.kind == AlertKind::ReconciliationRequired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_write_refused_while_owner_charges() {
        let rig = rig();
        rig.machine.start_session("RFID001").await.unwrap();
        assert!(matches!(
            rig.machine.set_balance("RFID001", 500.0).await,
            Err(Error::ConcurrentSessionConflict { .. })
        ));
        assert_eq!(rig.machine.set_balance("RFID002", 75.0).await.unwrap(), 75.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_active_session() {
        let rig = rig();
        rig.machine.start_session("RFID001").await.unwrap();
        rig.machine.shutdown().await;
        assert!(!rig.relay.is_enabled());
        let last = &rig.machine.recent_sessions().await[0];
        assert_eq!(last.stop_reason, Some(StopReason::Shutdown));
    }
}
