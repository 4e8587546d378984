//! Writes finished sessions to the session log.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kiosk_core::Subscription;
use kiosk_store::Store;
use kiosk_types::KioskEvent;

/// Background task recording finished sessions.
///
/// A session is logged on `session_ended` and its row is replaced on each
/// later `session_settled`.
pub struct SessionRecorder {
    store: Arc<Mutex<Store>>,
    events: Subscription,
    consecutive_failures: u32,
    reported_missed: u64,
}

impl SessionRecorder {
    /// Create a recorder over an event subscription.
    pub fn new(store: Arc<Mutex<Store>>, events: Subscription) -> Self {
        Self {
            store,
            events,
            consecutive_failures: 0,
            reported_missed: 0,
        }
    }

    /// Spawn the recorder. On cancellation it records whatever is already
    /// buffered, then stops.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!("Session recorder started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    while let Some(event) = self.events.try_recv() {
                        self.handle(event).await;
                    }
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        debug!("Session recorder stopped");
    }

    async fn handle(&mut self, event: KioskEvent) {
        let missed = self.events.missed();
        if missed > self.reported_missed {
            warn!(
                "Session recorder fell behind, {} event(s) dropped",
                missed - self.reported_missed
            );
            self.reported_missed = missed;
        }

        let session = match event {
            KioskEvent::SessionEnded { payload, .. }
            | KioskEvent::SessionSettled { payload, .. } => payload,
            _ => return,
        };

        let result = self.store.lock().await.record_session(&session);
        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                debug!("Logged session {} ({})", session.id, session.ledger_sync);
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures <= 3 {
                    warn!(
                        "Failed to log session {}: {} (attempt {})",
                        session.id, e, self.consecutive_failures
                    );
                } else if self.consecutive_failures == 4 {
                    error!(
                        "Failed to log {} sessions in a row, will continue trying silently",
                        self.consecutive_failures
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_core::EventBroadcaster;
    use kiosk_types::{ChargingSession, LedgerSync, SessionStatus, StopReason};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn ended(sync: LedgerSync) -> ChargingSession {
        ChargingSession {
            id: Uuid::new_v4(),
            token_id: "RFID001".to_string(),
            user_name: "Asha".to_string(),
            paid_amount: 40.0,
            start_battery: 35.0,
            target_battery: 75.0,
            end_battery: 75.0,
            energy_delivered_wh: 4000.0,
            voltage: 230.0,
            current: 14.3,
            power_w: 3300.0,
            credit_remaining: 0.0,
            remaining_balance: 40.0,
            status: SessionStatus::Completed,
            stop_reason: Some(StopReason::TargetReached),
            ledger_sync: sync,
            started_at: OffsetDateTime::now_utc(),
            ended_at: Some(OffsetDateTime::now_utc()),
        }
    }

    #[tokio::test]
    async fn test_settled_event_replaces_logged_row() {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let events = EventBroadcaster::new(16);
        let cancel = CancellationToken::new();
        let handle = SessionRecorder::new(Arc::clone(&store), events.subscribe())
            .spawn(cancel.clone());

        let mut session = ended(LedgerSync::Unsynced);
        events.publish(KioskEvent::session_updated(session.clone()));
        events.publish(KioskEvent::session_ended(session.clone()));
        session.ledger_sync = LedgerSync::Synced;
        events.publish(KioskEvent::session_settled(session.clone()));

        cancel.cancel();
        handle.await.unwrap();

        let store = store.lock().await;
        assert_eq!(store.count_sessions(None).unwrap(), 1);
        let logged = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(logged.ledger_sync, LedgerSync::Synced);
    }
}
