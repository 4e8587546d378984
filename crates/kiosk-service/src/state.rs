//! Application state shared across handlers.
//!
//! # Broadcast Channel Behavior
//!
//! Kiosk events reach WebSocket clients and the session recorder through the
//! core's broadcast channel:
//!
//! - **Buffer size**: configurable via `server.broadcast_buffer` (default: 100)
//! - **Message loss**: a subscriber that falls behind loses the oldest events
//! - **No blocking**: publishing never waits on a subscriber

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kiosk_core::{
    CardReader, HttpLedgerStore, Kiosk, LedgerStore, MockMeter, MockReader, MockRelay, Result,
};
use kiosk_store::Store;

use crate::config::{Config, LedgerBackend};
use crate::ledger::SqliteLedger;
use crate::recorder::SessionRecorder;

/// Shared application state.
pub struct AppState {
    /// The running kiosk core.
    pub kiosk: Kiosk,
    /// The data store (wrapped in Mutex for thread-safe access).
    pub store: Arc<Mutex<Store>>,
    /// Configuration (RwLock for runtime updates).
    pub config: RwLock<Config>,
    /// Simulated card reader, when the kiosk runs on mock hardware.
    pub reader: Option<Arc<MockReader>>,
    /// When the service started.
    pub started_at: OffsetDateTime,
    recorder_cancel: CancellationToken,
    recorder: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Wrap a running kiosk and start the session recorder.
    pub fn new(
        kiosk: Kiosk,
        store: Arc<Mutex<Store>>,
        config: Config,
        reader: Option<Arc<MockReader>>,
    ) -> Arc<Self> {
        let recorder_cancel = CancellationToken::new();
        let recorder = SessionRecorder::new(Arc::clone(&store), kiosk.subscribe())
            .spawn(recorder_cancel.clone());

        Arc::new(Self {
            kiosk,
            store,
            config: RwLock::new(config),
            reader,
            started_at: OffsetDateTime::now_utc(),
            recorder_cancel,
            recorder: Mutex::new(Some(recorder)),
        })
    }

    /// Build the kiosk from `config` on simulated hardware and start it.
    ///
    /// The ledger is either the store's accounts table or a remote ledger
    /// service, as configured.
    pub fn start(store: Store, config: Config) -> Result<Arc<Self>> {
        let store = Arc::new(Mutex::new(store));

        let ledger: Arc<dyn LedgerStore> = match config.ledger.backend {
            LedgerBackend::Sqlite => Arc::new(SqliteLedger::new(Arc::clone(&store))),
            LedgerBackend::Http => {
                let url = config.ledger.url.as_deref().unwrap_or_default();
                Arc::new(HttpLedgerStore::new(url)?)
            }
        };
        info!("Using {} ledger", config.ledger.backend.as_str());

        let reader = Arc::new(MockReader::new());
        let meter = MockMeter::new(config.mock.voltage, config.mock.charge_power_w);
        warn!("Running on simulated reader, relay and meter");

        let kiosk = Kiosk::builder()
            .reader(Arc::clone(&reader) as Arc<dyn CardReader>)
            .relay(Arc::new(MockRelay::new()))
            .meter(Arc::new(meter))
            .ledger(ledger)
            .config(config.kiosk_config())
            .start()?;

        Ok(Self::new(kiosk, store, config, Some(reader)))
    }

    /// Stop the kiosk, then let the recorder log the final sessions.
    pub async fn shutdown(&self) {
        self.kiosk.shutdown().await;
        self.recorder_cancel.cancel();
        if let Some(handle) = self.recorder.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Session recorder ended abnormally: {}", e);
            }
        }
        info!("Service state shut down");
    }
}
