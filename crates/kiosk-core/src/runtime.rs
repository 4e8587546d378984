//! Wiring: builds the core from its collaborators and runs its tasks.
//!
//! [`Kiosk::builder`] takes the four capabilities (reader, relay, meter,
//! ledger store) and a [`KioskConfig`], and [`KioskBuilder::start`] spawns:
//!
//! - the identity source polling the reader,
//! - the dispatcher feeding identity events into the session machine,
//! - the metering loop,
//! - the ledger cache's background refresh.
//!
//! All of them stop on [`Kiosk::shutdown`], which also stops and settles an
//! active session.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kiosk_types::IdentityEvent;

use crate::error::{Error, Result};
use crate::events::{EventBroadcaster, Subscription};
use crate::identity::{IdentitySource, ReaderConfig};
use crate::ledger::{CacheConfig, LedgerCache};
use crate::metering::MeteringLoop;
use crate::pricing::{Pricing, RatioPricing};
use crate::session::{SessionConfig, SessionMachine, Transition};
use crate::traits::{CardReader, LedgerStore, PowerMeter, Relay};

/// Everything tunable in the core.
#[derive(Debug, Clone)]
pub struct KioskConfig {
    /// Reader polling and debounce.
    pub reader: ReaderConfig,
    /// Ledger cache timing.
    pub cache: CacheConfig,
    /// Session machine and metering.
    pub session: SessionConfig,
    /// Price of a full 0 → 100 % charge.
    pub full_charge_cost: f64,
    /// Per-subscriber event buffer.
    pub event_capacity: usize,
    /// Identity events buffered between the reader and the machine.
    pub identity_buffer: usize,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            reader: ReaderConfig::default(),
            cache: CacheConfig::default(),
            session: SessionConfig::default(),
            full_charge_cost: 100.0,
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
            identity_buffer: 16,
        }
    }
}

/// Builder for a running [`Kiosk`].
#[derive(Default)]
pub struct KioskBuilder {
    reader: Option<Arc<dyn CardReader>>,
    relay: Option<Arc<dyn Relay>>,
    meter: Option<Arc<dyn PowerMeter>>,
    ledger: Option<Arc<dyn LedgerStore>>,
    config: KioskConfig,
}

impl KioskBuilder {
    /// Set the card reader.
    #[must_use]
    pub fn reader(mut self, reader: Arc<dyn CardReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Set the relay.
    #[must_use]
    pub fn relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Set the power meter.
    #[must_use]
    pub fn meter(mut self, meter: Arc<dyn PowerMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Set the remote ledger store.
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: KioskConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the core and spawn its tasks. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<Kiosk> {
        let reader = self
            .reader
            .ok_or_else(|| Error::invalid_config("no card reader configured"))?;
        let relay = self
            .relay
            .ok_or_else(|| Error::invalid_config("no relay configured"))?;
        let meter = self
            .meter
            .ok_or_else(|| Error::invalid_config("no power meter configured"))?;
        let store = self
            .ledger
            .ok_or_else(|| Error::invalid_config("no ledger store configured"))?;
        let config = self.config;
        if config.full_charge_cost <= 0.0 {
            return Err(Error::invalid_config("full charge cost must be positive"));
        }

        let events = EventBroadcaster::new(config.event_capacity);
        let ledger = Arc::new(LedgerCache::new(store, config.cache.clone()));
        let pricing = Arc::new(RatioPricing::new(config.full_charge_cost));
        let machine = SessionMachine::new(
            relay,
            Arc::clone(&meter),
            Arc::clone(&ledger),
            Arc::clone(&pricing) as Arc<dyn Pricing>,
            events.clone(),
            config.session.clone(),
        );

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.identity_buffer.max(1));

        let tasks = vec![
            IdentitySource::new(reader, Arc::clone(&ledger), config.reader.clone(), tx)
                .spawn(cancel.child_token()),
            tokio::spawn(dispatch(Arc::clone(&machine), rx, cancel.child_token())),
            MeteringLoop::new(Arc::clone(&machine), meter, config.session.meter.tick)
                .spawn(cancel.child_token()),
            ledger.spawn_refresh(cancel.child_token()),
        ];
        info!("Kiosk core started");

        Ok(Kiosk {
            machine,
            ledger,
            pricing,
            events,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }
}

/// A running kiosk core.
pub struct Kiosk {
    machine: Arc<SessionMachine>,
    ledger: Arc<LedgerCache>,
    pricing: Arc<RatioPricing>,
    events: EventBroadcaster,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Kiosk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kiosk")
            .field("machine", &self.machine)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Kiosk {
    /// Start building a kiosk.
    pub fn builder() -> KioskBuilder {
        KioskBuilder::default()
    }

    /// The session state machine.
    pub fn machine(&self) -> &Arc<SessionMachine> {
        &self.machine
    }

    /// The ledger cache.
    pub fn ledger(&self) -> &Arc<LedgerCache> {
        &self.ledger
    }

    /// The pricing step, for staging payments.
    pub fn pricing(&self) -> &Arc<RatioPricing> {
        &self.pricing
    }

    /// The event broadcaster.
    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Stop every task, then stop and settle an active session.
    pub async fn shutdown(&self) {
        info!("Kiosk core shutting down");
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Kiosk task ended abnormally: {}", e);
            }
        }
        self.machine.shutdown().await;
    }
}

/// Feed identity events into the machine, one at a time.
async fn dispatch(
    machine: Arc<SessionMachine>,
    mut rx: mpsc::Receiver<IdentityEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let token = event.token_id.clone();
        match machine.handle_identity(event).await {
            Ok(Transition::Started(session)) => {
                debug!("Card {} started session {}", token, session.id)
            }
            Ok(Transition::Ended(session)) => {
                debug!("Card {} ended session {}", token, session.id)
            }
            Ok(Transition::Ignored) => {}
            Err(e) if e.is_user_facing() => info!("Card {} not started: {}", token, e),
            Err(e) => warn!("Card {} could not start a session: {}", token, e),
        }
    }
    debug!("Identity dispatcher stopped");
}
