//! HTTP client ledger store.
//!
//! Talks to a remote ledger over a small REST contract:
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | GET | `{base}/accounts` | |
//! | PUT | `{base}/accounts/{token}/balance` | `{"balance": f64}` |
//! | POST | `{base}/accounts` | `{"token_id", "name", "contact", "balance"}` |
//!
//! A `kiosk-service` instance serves this contract under `/api`, so one kiosk
//! can use another as its ledger.
//!
//! # Example
//!
//! ```no_run
//! use kiosk_core::remote::HttpLedgerStore;
//! use kiosk_core::LedgerStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = HttpLedgerStore::new("http://ledger.local/api")?;
//! let accounts = ledger.list_accounts().await?;
//! println!("{} accounts", accounts.len());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use kiosk_types::UserAccount;

use crate::error::{Error, Result};
use crate::traits::LedgerStore;

/// [`LedgerStore`] backed by a remote HTTP ledger.
#[derive(Debug, Clone)]
pub struct HttpLedgerStore {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct BalanceBody {
    balance: f64,
}

#[derive(Serialize)]
struct NewAccountBody<'a> {
    token_id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact: Option<&'a str>,
    balance: f64,
}

impl HttpLedgerStore {
    /// Create a client for the ledger at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::invalid_config(format!("HTTP client: {e}")))?;
        Self::with_client(base_url, client)
    }

    /// Create a client with a custom reqwest Client.
    pub fn with_client(base_url: &str, client: Client) -> Result<Self> {
        // Normalize URL (remove trailing slash)
        let base_url = base_url.trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::invalid_config(format!(
                "ledger URL must start with http:// or https://, got: {}",
                base_url
            )));
        }

        Ok(Self { client, base_url })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Pull the `{error}` message out of a failed response.
    async fn error_message(response: reqwest::Response) -> String {
        let status = response.status();
        response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| status.to_string())
    }

    async fn check_write(token_id: &str, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(Error::UnknownIdentity(token_id.to_string()));
        }
        let message = Self::error_message(response).await;
        Err(Error::ledger_write(
            token_id,
            format!("{}: {}", status.as_u16(), message),
        ))
    }
}

#[async_trait]
impl LedgerStore for HttpLedgerStore {
    async fn list_accounts(&self) -> Result<Vec<UserAccount>> {
        let url = format!("{}/accounts", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::LedgerUnavailable(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = Self::error_message(response).await;
            return Err(Error::LedgerUnavailable(format!(
                "{url}: {} {}",
                status.as_u16(),
                message
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::LedgerUnavailable(format!("{url}: invalid body: {e}")))
    }

    async fn write_balance(&self, token_id: &str, balance: f64) -> Result<()> {
        let url = format!("{}/accounts/{}/balance", self.base_url, token_id);
        let response = self
            .client
            .put(&url)
            .json(&BalanceBody { balance })
            .send()
            .await
            .map_err(|e| Error::ledger_write(token_id, e.to_string()))?;
        Self::check_write(token_id, response).await
    }

    async fn append_account(
        &self,
        token_id: &str,
        name: &str,
        contact: Option<&str>,
        balance: f64,
    ) -> Result<()> {
        let url = format!("{}/accounts", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&NewAccountBody {
                token_id,
                name,
                contact,
                balance,
            })
            .send()
            .await
            .map_err(|e| Error::ledger_write(token_id, e.to_string()))?;
        Self::check_write(token_id, response).await
    }
}
