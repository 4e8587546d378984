//! Pricing: how much a session costs and what battery level it buys.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use kiosk_types::UserAccount;

use crate::error::{Error, Result};

/// The terms of a session about to start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChargeQuote {
    /// Amount debited up front.
    pub paid_amount: f64,
    /// Battery level (%) at start.
    pub start_battery: f64,
    /// Battery level (%) the paid amount buys.
    pub target_battery: f64,
}

/// Decides the paid amount and target for a new session.
#[async_trait]
pub trait Pricing: Send + Sync {
    /// Quote a session for `account` starting at `start_battery` percent.
    ///
    /// Fails with [`Error::InsufficientBalance`] if the account cannot pay
    /// anything.
    async fn quote(&self, account: &UserAccount, start_battery: f64) -> Result<ChargeQuote>;
}

/// Linear pricing: a fixed cost buys 0 → 100 %.
///
/// The paid amount is the amount staged for the token by the payment screen,
/// or the cost of charging to full when nothing is staged. Either way it is
/// capped at the account balance.
#[derive(Debug)]
pub struct RatioPricing {
    full_charge_cost: f64,
    staged: RwLock<HashMap<String, f64>>,
}

impl RatioPricing {
    /// Create pricing where `full_charge_cost` buys a full charge.
    pub fn new(full_charge_cost: f64) -> Self {
        Self {
            full_charge_cost,
            staged: RwLock::new(HashMap::new()),
        }
    }

    /// Cost of a full 0 → 100 % charge.
    pub fn full_charge_cost(&self) -> f64 {
        self.full_charge_cost
    }

    /// Battery percentage `amount` buys on top of `start`, capped at 100.
    pub fn target_for(&self, start_battery: f64, amount: f64) -> f64 {
        if self.full_charge_cost <= 0.0 {
            return start_battery.clamp(0.0, 100.0);
        }
        (start_battery + amount / self.full_charge_cost * 100.0).min(100.0)
    }

    /// Cost of charging from `start_battery` to 100 %.
    pub fn cost_to_full(&self, start_battery: f64) -> f64 {
        ((100.0 - start_battery).max(0.0) / 100.0) * self.full_charge_cost
    }

    /// Stage the amount the next session for `token_id` should pay.
    pub async fn stage(&self, token_id: &str, amount: f64) {
        debug!("Staged payment of {:.2} for {}", amount, token_id);
        self.staged
            .write()
            .await
            .insert(token_id.to_string(), amount.max(0.0));
    }

    /// The amount staged for `token_id`, if any.
    pub async fn staged(&self, token_id: &str) -> Option<f64> {
        self.staged.read().await.get(token_id).copied()
    }

    /// Drop a staged amount.
    pub async fn clear_staged(&self, token_id: &str) {
        self.staged.write().await.remove(token_id);
    }
}

#[async_trait]
impl Pricing for RatioPricing {
    async fn quote(&self, account: &UserAccount, start_battery: f64) -> Result<ChargeQuote> {
        let requested = self
            .staged
            .write()
            .await
            .remove(&account.token_id)
            .unwrap_or_else(|| self.cost_to_full(start_battery));

        let paid_amount = requested.min(account.balance);
        if paid_amount <= 0.0 {
            return Err(Error::InsufficientBalance {
                token_id: account.token_id.clone(),
                balance: account.balance,
            });
        }

        Ok(ChargeQuote {
            paid_amount,
            start_battery,
            target_battery: self.target_for(start_battery, paid_amount),
        })
    }
}
