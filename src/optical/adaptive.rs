//! Adaptive power decision logic.
//!
//! Pure function from the current adaptive state plus one range sample to the
//! next state. No side effects, no logging, no driver access; the engine
//! applies the outcome.
use crate::profile::{PowerProfile, RangeCategory};
use crate::range::{EnvironmentalConditions, Measurement};

use super::config::LaserConfig;
use super::safety::effective_limit_mw;

const DWELL_TICKS: u32 = 3;

const WEAK_SIGNAL: f32 = 0.4;
const STRONG_SIGNAL: f32 = 0.85;
const LOST_SIGNAL: f32 = 0.1;
const LOST_TICKS: u32 = 3;
const INTENSITY_STEP_PCT: f32 = 10.0;
const MIN_ADAPTIVE_INTENSITY_PCT: f32 = 10.0;

/// Multiplier on the optimal power for poor visibility.
pub fn visibility_factor(visibility_m: f32) -> f32 {
    if visibility_m < 100.0 {
        3.0
    } else if visibility_m < 500.0 {
        2.0
    } else if visibility_m < 1000.0 {
        1.5
    } else {
        1.0
    }
}

/// Intensity (percent of the effective limit) that yields the profile's
/// optimal power scaled for visibility.
pub fn operating_intensity(profile: &PowerProfile, laser: &LaserConfig, visibility_m: f32) -> f32 {
    let limit = effective_limit_mw(profile, laser);
    if limit <= 0.0 {
        return 0.0;
    }
    let wanted = (profile.optimal_power_mw * visibility_factor(visibility_m)).min(limit);
    (wanted / limit * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveSnapshot {
    category: Option<RangeCategory>,
    intensity_pct: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveState {
    pub category: Option<RangeCategory>,
    pub intensity_pct: f32,
    pub ticks_in_state: u32,
    pub weak_streak: u32,
    pub degraded_safe: bool,
    pub last_safe_snapshot: Option<AdaptiveSnapshot>,
}

impl AdaptiveState {
    pub fn baseline(intensity_pct: f32, category: Option<RangeCategory>) -> Self {
        Self {
            category,
            intensity_pct,
            ticks_in_state: DWELL_TICKS,
            weak_streak: 0,
            degraded_safe: false,
            last_safe_snapshot: None,
        }
    }

    fn snapshot(&self) -> AdaptiveSnapshot {
        AdaptiveSnapshot {
            category: self.category,
            intensity_pct: self.intensity_pct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdaptiveEvent {
    ProfileSwitched(RangeCategory),
    IntensityRaised(f32),
    IntensityLowered(f32),
    EnteredDegradedSafe,
    ExitedDegradedSafe,
}

#[derive(Debug)]
pub struct AdaptiveDecision {
    pub state: AdaptiveState,
    pub event: Option<AdaptiveEvent>,
}

pub fn decide_next_state(
    current: &AdaptiveState,
    sample: &Measurement,
    environment: &EnvironmentalConditions,
    laser: &LaserConfig,
) -> AdaptiveDecision {
    let mut next = current.clone();
    next.ticks_in_state = next.ticks_in_state.saturating_add(1);
    let strength = sample.signal_strength;
    if strength < LOST_SIGNAL {
        next.weak_streak = next.weak_streak.saturating_add(1);
    } else {
        next.weak_streak = 0;
    }

    if current.degraded_safe {
        if strength >= WEAK_SIGNAL {
            if let Some(snapshot) = current.last_safe_snapshot.clone() {
                next.category = snapshot.category;
                next.intensity_pct = snapshot.intensity_pct;
            }
            next.degraded_safe = false;
            next.ticks_in_state = 0;
            return AdaptiveDecision {
                state: next,
                event: Some(AdaptiveEvent::ExitedDegradedSafe),
            };
        }
        return AdaptiveDecision { state: next, event: None };
    }

    if next.weak_streak >= LOST_TICKS {
        next.degraded_safe = true;
        next.last_safe_snapshot = Some(current.snapshot());
        next.ticks_in_state = 0;
        return AdaptiveDecision {
            state: next,
            event: Some(AdaptiveEvent::EnteredDegradedSafe),
        };
    }

    if next.ticks_in_state < DWELL_TICKS {
        return AdaptiveDecision { state: next, event: None };
    }

    // a lost sample carries no trustworthy distance
    let category = sample.range_category();
    if strength >= LOST_SIGNAL && current.category != Some(category) {
        let profile = PowerProfile::for_range_category(category);
        next.category = Some(category);
        next.intensity_pct = operating_intensity(&profile, laser, environment.visibility_m);
        next.ticks_in_state = 0;
        return AdaptiveDecision {
            state: next,
            event: Some(AdaptiveEvent::ProfileSwitched(category)),
        };
    }

    if strength < WEAK_SIGNAL && current.intensity_pct < 100.0 {
        let pct = (current.intensity_pct + INTENSITY_STEP_PCT).min(100.0);
        next.intensity_pct = pct;
        next.ticks_in_state = 0;
        return AdaptiveDecision {
            state: next,
            event: Some(AdaptiveEvent::IntensityRaised(pct)),
        };
    }

    if strength > STRONG_SIGNAL && current.intensity_pct > MIN_ADAPTIVE_INTENSITY_PCT {
        let pct = (current.intensity_pct - INTENSITY_STEP_PCT).max(MIN_ADAPTIVE_INTENSITY_PCT);
        next.intensity_pct = pct;
        next.ticks_in_state = 0;
        return AdaptiveDecision {
            state: next,
            event: Some(AdaptiveEvent::IntensityLowered(pct)),
        };
    }

    AdaptiveDecision { state: next, event: None }
}
