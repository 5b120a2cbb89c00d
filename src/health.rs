//! Channel health transitions for the physical links.
//!
//! A channel degrades on sustained loss, a burst gap, a high frame error rate
//! or an SNR below the configured floor, and recovers only once every signal
//! is back inside the clear thresholds. Each transition is reported once.
use serde::Serialize;

use crate::link_quality::LinkConditions;

const SUSTAINED_LOSS_THRESHOLD: f64 = 0.25;
const RECOVERY_CLEAR_LOSS_THRESHOLD: f64 = 0.05;
const BURST_LOSS_THRESHOLD: u64 = 3;
const RECOVERY_CLEAR_BURST_THRESHOLD: u64 = 1;
const FRAME_ERROR_THRESHOLD: f64 = 0.20;
const RECOVERY_CLEAR_FRAME_ERROR: f64 = 0.05;
const SNR_HYSTERESIS_DB: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    SustainedLoss,
    BurstLoss,
    FrameErrors,
    LowSnr,
}

impl DegradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradeReason::SustainedLoss => "sustained_loss",
            DegradeReason::BurstLoss => "burst_loss",
            DegradeReason::FrameErrors => "frame_errors",
            DegradeReason::LowSnr => "low_snr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Degraded(DegradeReason),
    Recovered(DegradeReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthState {
    Healthy,
    Degraded(DegradeReason),
}

#[derive(Debug)]
pub struct HealthMonitor {
    state: HealthState,
    snr_floor_db: f32,
}

impl HealthMonitor {
    pub fn new(snr_floor_db: f32) -> Self {
        Self {
            state: HealthState::Healthy,
            snr_floor_db,
        }
    }

    pub fn set_snr_floor(&mut self, snr_floor_db: f32) {
        self.snr_floor_db = snr_floor_db;
    }

    /// Feeds a metrics window plus the current SNR estimate.
    pub fn feed(&mut self, window: &LinkConditions, snr_db: Option<f32>) -> Option<HealthEvent> {
        let metrics = window.metrics();
        let gap = window.max_loss_gap();
        match self.state {
            HealthState::Healthy => {
                let reason = if gap >= BURST_LOSS_THRESHOLD {
                    Some(DegradeReason::BurstLoss)
                } else if metrics.loss_ratio >= SUSTAINED_LOSS_THRESHOLD {
                    Some(DegradeReason::SustainedLoss)
                } else if metrics.frame_error_rate >= FRAME_ERROR_THRESHOLD {
                    Some(DegradeReason::FrameErrors)
                } else if snr_db.map_or(false, |snr| snr < self.snr_floor_db) {
                    Some(DegradeReason::LowSnr)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    self.state = HealthState::Degraded(reason);
                    return Some(HealthEvent::Degraded(reason));
                }
            }
            HealthState::Degraded(reason) => {
                let snr_clear =
                    snr_db.map_or(true, |snr| snr >= self.snr_floor_db + SNR_HYSTERESIS_DB);
                if metrics.loss_ratio <= RECOVERY_CLEAR_LOSS_THRESHOLD
                    && gap <= RECOVERY_CLEAR_BURST_THRESHOLD
                    && metrics.frame_error_rate <= RECOVERY_CLEAR_FRAME_ERROR
                    && snr_clear
                {
                    self.state = HealthState::Healthy;
                    return Some(HealthEvent::Recovered(reason));
                }
            }
        }
        None
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.state, HealthState::Degraded(_))
    }

    pub fn active_reason(&self) -> Option<DegradeReason> {
        match self.state {
            HealthState::Degraded(reason) => Some(reason),
            HealthState::Healthy => None,
        }
    }
}
