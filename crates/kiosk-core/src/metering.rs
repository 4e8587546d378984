//! Energy metering for the active session.
//!
//! [`advance`] is the pure step: it folds one power sample into a session's
//! running figures and reports whether the session should end. The
//! [`MeteringLoop`] task samples the charger on a fixed tick and hands each
//! sample to the [`SessionMachine`], which applies the step and alone decides
//! what happens to the relay.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kiosk_types::ChargingSession;

use crate::session::SessionMachine;
use crate::traits::{PowerMeter, PowerSample};

/// Slack for float comparisons against the target and the credit.
const EPSILON: f64 = 1e-9;

/// Metering parameters.
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Sampling period.
    pub tick: Duration,
    /// Usable battery capacity in kWh.
    pub pack_capacity_kwh: f64,
    /// Price of one delivered kWh.
    pub cost_per_kwh: f64,
    /// Start battery (%) used when the charger cannot report one.
    pub assumed_start_battery: f64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            pack_capacity_kwh: 10.0,
            cost_per_kwh: 10.0,
            assumed_start_battery: 35.0,
        }
    }
}

/// Why metering wants the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterSignal {
    /// The battery estimate reached the paid-for target.
    TargetReached,
    /// The paid credit is used up.
    BalanceExhausted,
}

/// Fold one sample, taken `elapsed` after the previous one, into `session`.
///
/// Energy and the battery estimate never decrease; negative power counts as
/// zero. The target is checked before the credit.
pub fn advance(
    session: &mut ChargingSession,
    sample: PowerSample,
    elapsed: Duration,
    config: &MeterConfig,
) -> Option<MeterSignal> {
    let power = if sample.power_w.is_finite() {
        sample.power_w.max(0.0)
    } else {
        0.0
    };
    let hours = elapsed.as_secs_f64() / 3600.0;

    session.voltage = sample.voltage;
    session.current = sample.current;
    session.power_w = power;
    session.energy_delivered_wh += power * hours;

    let energy_kwh = session.energy_delivered_wh / 1000.0;
    if config.pack_capacity_kwh > 0.0 {
        let estimate =
            (session.start_battery + energy_kwh / config.pack_capacity_kwh * 100.0).min(100.0);
        session.end_battery = session.end_battery.max(estimate);
    }

    let balance_after_debit = session.remaining_balance - session.credit_remaining;
    let consumed = energy_kwh * config.cost_per_kwh;
    session.credit_remaining = (session.paid_amount - consumed).max(0.0);
    session.remaining_balance = balance_after_debit + session.credit_remaining;

    if session.end_battery + EPSILON >= session.target_battery {
        Some(MeterSignal::TargetReached)
    } else if session.credit_remaining <= EPSILON {
        Some(MeterSignal::BalanceExhausted)
    } else {
        None
    }
}

/// Background task sampling the charger while a session is in progress.
pub struct MeteringLoop {
    machine: Arc<SessionMachine>,
    meter: Arc<dyn PowerMeter>,
    tick: Duration,
}

impl MeteringLoop {
    /// Create a loop feeding `machine` from `meter` every `tick`.
    pub fn new(machine: Arc<SessionMachine>, meter: Arc<dyn PowerMeter>, tick: Duration) -> Self {
        Self {
            machine,
            meter,
            tick,
        }
    }

    /// Spawn the loop. It runs until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        info!("Metering every {:?}", self.tick);
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Metering loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if !self.machine.is_charging() {
                consecutive_failures = 0;
                continue;
            }

            let sample = match self.meter.sample().await {
                Ok(sample) => {
                    consecutive_failures = 0;
                    sample
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures <= 3 {
                        warn!("Meter sample failed: {} (attempt {})", e, consecutive_failures);
                    } else if consecutive_failures == 4 {
                        error!(
                            "Meter sample failed {} times in a row, skipping ticks silently",
                            consecutive_failures
                        );
                    }
                    continue;
                }
            };

            match self.machine.apply_sample(sample).await {
                Ok(Some(signal)) => debug!("Metering signalled {:?}", signal),
                Ok(None) => {}
                Err(e) => warn!("Failed to apply meter sample: {}", e),
            }
        }
    }
}
