//! REST API endpoints for the kiosk-service.
//!
//! # Lock Acquisition
//!
//! Handlers never hold `state.store` across a call into the kiosk core: the
//! SQLite ledger backend takes the same lock for every ledger call.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. Core errors
//! map to 4xx for expected outcomes (unknown card, busy circuit, no session)
//! and to 503 when the ledger cannot be reached.
//!
//! # Ledger Contract
//!
//! `GET /api/accounts`, `POST /api/accounts` and
//! `PUT /api/accounts/{token}/balance` are the contract spoken by
//! [`kiosk_core::HttpLedgerStore`], so one kiosk can serve as another's ledger.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use kiosk_core::{CacheStatus, MachineState, SessionSnapshot};
use kiosk_store::{SessionQuery, SessionStats};
use kiosk_types::{ChargingSession, OperatorAlert, SessionStatus, UserAccount};

use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Health and status
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/cache", get(get_cache))
        .route("/api/alerts", get(get_alerts))
        // Sessions
        .route("/api/session", get(get_session))
        .route("/api/session/start", post(start_session))
        .route("/api/session/stop", post(stop_session))
        .route("/api/sessions", get(recent_sessions))
        .route("/api/sessions/history", get(session_history))
        .route("/api/sessions/stats", get(session_stats))
        .route("/api/payments", post(stage_payment))
        // Accounts
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route("/api/accounts/{token}", get(get_account))
        .route("/api/accounts/{token}/balance", put(set_balance))
        // Simulation
        .route("/api/reader/tap", post(reader_tap))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Service status.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Seconds since the service started.
    pub uptime_seconds: u64,
    /// Machine state.
    pub state: MachineState,
    /// The session holding the circuit, if any.
    pub session: Option<ChargingSession>,
    /// Ledger backend in use.
    pub ledger_backend: &'static str,
    /// Ledger cache freshness.
    pub cache: CacheStatus,
    /// Connected event subscribers.
    pub subscribers: usize,
    /// Operator alerts raised and retained.
    pub alerts: usize,
    /// Accounts still owed a settlement write.
    pub unsynced_accounts: usize,
}

/// Get service status.
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let machine = state.kiosk.machine();
    let snapshot = machine.snapshot();
    let now = OffsetDateTime::now_utc();
    let ledger_backend = state.config.read().await.ledger.backend.as_str();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now,
        uptime_seconds: (now - state.started_at).whole_seconds().max(0) as u64,
        state: snapshot.state,
        session: snapshot.session,
        ledger_backend,
        cache: state.kiosk.ledger().status().await,
        subscribers: state.kiosk.events().subscriber_count(),
        alerts: machine.alerts().await.len(),
        unsynced_accounts: machine.unsynced_accounts().await.len(),
    })
}

/// Ledger cache freshness.
async fn get_cache(State(state): State<Arc<AppState>>) -> Json<CacheStatus> {
    Json(state.kiosk.ledger().status().await)
}

/// Operator alerts, newest first.
async fn get_alerts(State(state): State<Arc<AppState>>) -> Json<Vec<OperatorAlert>> {
    Json(state.kiosk.machine().alerts().await)
}

/// Current machine snapshot.
async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    Json(state.kiosk.machine().snapshot())
}

/// Manual start request.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub token_id: String,
    /// Amount to pay; the cost to a full battery when omitted.
    #[serde(default)]
    pub amount: Option<f64>,
}

/// Start a session without a card presentation.
///
/// # Errors
///
/// - 400 if the amount is not positive or the balance is empty
/// - 404 if the token is unknown
/// - 409 if the circuit is busy
async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<ChargingSession>), AppError> {
    let pricing = state.kiosk.pricing();
    if let Some(amount) = request.amount {
        validate_amount(amount)?;
        pricing.stage(&request.token_id, amount).await;
    }

    match state.kiosk.machine().start_session(&request.token_id).await {
        Ok(session) => {
            info!("Session {} started from the API", session.id);
            Ok((StatusCode::CREATED, Json(session)))
        }
        Err(e) => {
            if request.amount.is_some() {
                pricing.clear_staged(&request.token_id).await;
            }
            Err(e.into())
        }
    }
}

/// Stop the active session.
async fn stop_session(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ChargingSession>, AppError> {
    let session = state.kiosk.machine().stop().await?;
    info!("Session {} stopped from the API", session.id);
    Ok(Json(session))
}

/// Finished sessions held in memory, newest first.
async fn recent_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<ChargingSession>> {
    Json(state.kiosk.machine().recent_sessions().await)
}

/// Query parameters for the session log.
#[derive(Debug, Deserialize, Default)]
pub struct HistoryParams {
    pub token: Option<String>,
    pub status: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl HistoryParams {
    /// Validate the parameters and build the store query.
    ///
    /// The limit is raised by one so the handler can tell whether more rows
    /// exist.
    fn to_query(&self) -> Result<SessionQuery, AppError> {
        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(AppError::BadRequest(format!(
                "Invalid time range: 'since' ({}) must be less than or equal to 'until' ({})",
                since, until
            )));
        }

        let mut query = SessionQuery::new();
        if let Some(token) = &self.token {
            query = query.token(token);
        }
        if let Some(status) = &self.status {
            let status: SessionStatus = status
                .parse()
                .map_err(|e: kiosk_types::ParseError| AppError::BadRequest(e.to_string()))?;
            query = query.status(status);
        }
        if let Some(since) = self.since
            && let Ok(dt) = OffsetDateTime::from_unix_timestamp(since)
        {
            query = query.since(dt);
        }
        if let Some(until) = self.until
            && let Ok(dt) = OffsetDateTime::from_unix_timestamp(until)
        {
            query = query.until(dt);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit.saturating_add(1));
        }
        if let Some(offset) = self.offset {
            query = query.offset(offset);
        }
        Ok(query)
    }
}

/// Paginated response wrapper with metadata.
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    /// The data items.
    pub data: Vec<T>,
    /// Pagination metadata.
    pub pagination: PaginationMeta,
}

/// Pagination metadata.
#[derive(Debug, Serialize)]
pub struct PaginationMeta {
    /// Number of items returned.
    pub count: usize,
    /// Offset from the beginning.
    pub offset: u32,
    /// Maximum items requested (if specified).
    pub limit: Option<u32>,
    /// Whether there are more items available.
    pub has_more: bool,
}

/// Session log from the database, newest first.
///
/// # Query Parameters
///
/// - `token`: only sessions of this card
/// - `status`: `completed` or `stopped`
/// - `since` / `until`: Unix timestamps bounding the start time
/// - `limit` / `offset`: pagination
async fn session_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<PaginatedResponse<ChargingSession>>, AppError> {
    let query = params.to_query()?;

    let mut sessions = state.store.lock().await.query_sessions(&query)?;

    let has_more = params.limit.is_some_and(|l| sessions.len() > l as usize);
    if has_more {
        sessions.pop();
    }

    Ok(Json(PaginatedResponse {
        pagination: PaginationMeta {
            count: sessions.len(),
            offset: params.offset.unwrap_or(0),
            limit: params.limit,
            has_more,
        },
        data: sessions,
    }))
}

/// Query parameters for session totals.
#[derive(Debug, Deserialize, Default)]
pub struct StatsParams {
    pub token: Option<String>,
}

/// Totals over the session log.
async fn session_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<SessionStats>, AppError> {
    let stats = state
        .store
        .lock()
        .await
        .session_stats(params.token.as_deref())?;
    Ok(Json(stats))
}

/// Payment staged for a card's next session.
#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub token_id: String,
    pub amount: f64,
}

/// Response to a staged payment.
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub token_id: String,
    /// Amount that will be debited, capped at the balance.
    pub amount: f64,
    /// Account balance at staging time.
    pub balance: f64,
}

/// Stage the amount a card pays when its next session starts.
async fn stage_payment(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PaymentRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), AppError> {
    validate_amount(request.amount)?;
    let account = state
        .kiosk
        .ledger()
        .get(&request.token_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Account not found: {}", request.token_id)))?;
    if !account.is_funded() {
        return Err(AppError::BadRequest(format!(
            "Account {} has no balance",
            account.token_id
        )));
    }

    state
        .kiosk
        .pricing()
        .stage(&request.token_id, request.amount)
        .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(PaymentResponse {
            token_id: account.token_id,
            amount: request.amount.min(account.balance),
            balance: account.balance,
        }),
    ))
}

/// Cached account list.
async fn list_accounts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<UserAccount>>, AppError> {
    Ok(Json(state.kiosk.ledger().accounts().await?))
}

/// One account.
async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<UserAccount>, AppError> {
    state
        .kiosk
        .ledger()
        .get(&token)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Account not found: {}", token)))
}

/// Request to create an account.
#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub token_id: String,
    pub name: String,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub balance: f64,
}

/// Create an account.
///
/// # Errors
///
/// - 400 for an empty token or name, or a negative balance
/// - 409 if the token already has an account
async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<UserAccount>), AppError> {
    if request.token_id.trim().is_empty() {
        return Err(AppError::BadRequest("token_id cannot be empty".to_string()));
    }
    if request.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }
    validate_balance(request.balance)?;

    let (account, created) = state
        .kiosk
        .ledger()
        .provision(
            &request.token_id,
            &request.name,
            request.contact.as_deref(),
            request.balance,
        )
        .await?;
    if !created {
        return Err(AppError::Conflict(format!(
            "Account already exists: {}",
            request.token_id
        )));
    }
    Ok((StatusCode::CREATED, Json(account)))
}

/// Request to set a balance.
#[derive(Debug, Deserialize)]
pub struct BalanceRequest {
    pub balance: f64,
}

/// Response to a balance write.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub token_id: String,
    pub balance: f64,
}

/// Overwrite an account balance (admin top-up).
///
/// Refused with 409 while that account is charging.
async fn set_balance(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(request): Json<BalanceRequest>,
) -> Result<Json<BalanceResponse>, AppError> {
    validate_balance(request.balance)?;
    let balance = state
        .kiosk
        .machine()
        .set_balance(&token, request.balance)
        .await?;
    info!("Balance of {} set to {:.2} from the API", token, balance);
    Ok(Json(BalanceResponse {
        token_id: token,
        balance,
    }))
}

/// Simulated card presentation.
#[derive(Debug, Deserialize)]
pub struct TapRequest {
    pub token_id: String,
    /// Keep the card on the reader for this long instead of a single read.
    /// Holding past the debounce window presents the card again.
    #[serde(default)]
    pub hold_ms: Option<u64>,
}

/// Present a card to the simulated reader.
async fn reader_tap(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TapRequest>,
) -> Result<StatusCode, AppError> {
    let reader = state
        .reader
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("No simulated reader is configured".to_string()))?;
    if request.token_id.trim().is_empty() {
        return Err(AppError::BadRequest("token_id cannot be empty".to_string()));
    }

    match request.hold_ms {
        Some(ms) => {
            reader.present(request.token_id.clone()).await;
            let reader = Arc::clone(reader);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                reader.remove().await;
            });
        }
        None => reader.tap(request.token_id.clone()).await,
    }
    info!("Simulated tap of {}", request.token_id);
    Ok(StatusCode::ACCEPTED)
}

fn validate_amount(amount: f64) -> Result<(), AppError> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "amount must be a positive number, got {}",
            amount
        )))
    }
}

fn validate_balance(balance: f64) -> Result<(), AppError> {
    if balance.is_finite() && balance >= 0.0 {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "balance cannot be negative, got {}",
            balance
        )))
    }
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Kiosk(kiosk_core::Error),
    Store(kiosk_store::Error),
}

impl From<kiosk_core::Error> for AppError {
    fn from(e: kiosk_core::Error) -> Self {
        AppError::Kiosk(e)
    }
}

impl From<kiosk_store::Error> for AppError {
    fn from(e: kiosk_store::Error) -> Self {
        AppError::Store(e)
    }
}

fn kiosk_status(e: &kiosk_core::Error) -> StatusCode {
    use kiosk_core::Error;
    match e {
        Error::UnknownIdentity(_) => StatusCode::NOT_FOUND,
        Error::InsufficientBalance { .. } | Error::NoActiveSession | Error::InvalidConfig(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::ConcurrentSessionConflict { .. } => StatusCode::CONFLICT,
        Error::LedgerUnavailable(_) | Error::LedgerWriteFailed { .. } | Error::Timeout { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Kiosk(e) => (kiosk_status(&e), e.to_string()),
            AppError::Store(kiosk_store::Error::AccountNotFound(token)) => {
                (StatusCode::NOT_FOUND, format!("Account not found: {}", token))
            }
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}
