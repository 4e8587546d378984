//! HTTP REST and WebSocket service for the pay-before-charge EV kiosk.
//!
//! This crate provides a service that:
//! - Runs the kiosk core (card reader polling, session machine, metering)
//! - Keeps accounts in a local SQLite ledger or talks to a remote one
//! - Logs every finished session for reporting
//! - Exposes a REST API for operators and kiosk screens
//! - Pushes kiosk events to WebSocket clients
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Liveness
//! - `GET /api/status` - Machine state, cache freshness, alert count
//! - `GET /api/session` - Current session snapshot
//! - `POST /api/session/start` - Start without a card `{token_id, amount?}`
//! - `POST /api/session/stop` - Operator stop
//! - `GET /api/sessions` - Recently finished sessions (in memory)
//! - `GET /api/sessions/history` - Session log from the database
//! - `GET /api/sessions/stats` - Totals over the session log
//! - `POST /api/payments` - Stage the amount for a card's next session
//! - `GET /api/accounts` - Account list
//! - `GET /api/accounts/{token}` - One account
//! - `POST /api/accounts` - Create an account
//! - `PUT /api/accounts/{token}/balance` - Admin top-up
//! - `GET /api/cache` - Ledger cache freshness
//! - `GET /api/alerts` - Operator alerts
//! - `POST /api/reader/tap` - Present a card to the simulated reader
//! - `WS /api/ws` - Real-time event stream
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/kiosk/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [ledger]
//! backend = "sqlite"
//!
//! [metering]
//! full_charge_cost = 100.0
//!
//! [[seed_accounts]]
//! token_id = "RFID001"
//! name = "Demo User"
//! balance = 100.0
//! ```

pub mod api;
pub mod config;
pub mod ledger;
pub mod recorder;
pub mod state;
pub mod ws;

pub use config::{
    Config, ConfigError, LedgerBackend, LedgerConfig, MeteringConfig, MockConfig,
    ReaderSettings, SeedAccount, ServerConfig, StorageConfig, ValidationError,
};
pub use ledger::{SqliteLedger, seed_accounts};
pub use recorder::SessionRecorder;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// The full application router with tracing and CORS layers.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(api::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
