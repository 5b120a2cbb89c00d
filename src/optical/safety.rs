//! Emitted-energy accounting and the emergency latch.
//!
//! Held output is integrated over time whenever the output level changes and
//! every transmitted frame adds its own energy. Any safety breach refuses the
//! operation that caused it; once breaches go past the configured limit the
//! engine latches into emergency shutdown.
use std::time::Instant;

use serde::Serialize;

use super::config::LaserConfig;
use crate::profile::PowerProfile;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyStats {
    pub total_energy_j: f64,
    pub breach_count: u32,
    pub last_shutdown_reason: Option<String>,
    pub latched: bool,
}

/// Highest output allowed for this laser under `profile`.
pub fn effective_limit_mw(profile: &PowerProfile, laser: &LaserConfig) -> f32 {
    let eye_safe = laser.laser_type.eye_safe_mw() * profile.safety_margin;
    profile.max_power_mw.min(laser.max_power_mw).min(eye_safe)
}

/// Outcome of a safety check that found a breach.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub reason: String,
    /// The breach pushed the count past the limit.
    pub latched: bool,
}

#[derive(Debug)]
pub struct SafetyMonitor {
    total_energy_j: f64,
    breach_count: u32,
    last_shutdown_reason: Option<String>,
    latched: bool,
    budget_j: f64,
    breach_limit: u32,
    held_mw: f32,
    held_since: Instant,
}

impl SafetyMonitor {
    pub fn new(laser: &LaserConfig) -> Self {
        Self {
            total_energy_j: 0.0,
            breach_count: 0,
            last_shutdown_reason: None,
            latched: false,
            budget_j: laser.max_energy_j,
            breach_limit: laser.breach_limit,
            held_mw: 0.0,
            held_since: Instant::now(),
        }
    }

    fn pending_j(&self, now: Instant) -> f64 {
        let secs = now.saturating_duration_since(self.held_since).as_secs_f64();
        self.held_mw as f64 / 1000.0 * secs
    }

    /// Closes the current hold interval and starts a new one at `power_mw`.
    pub fn set_output(&mut self, power_mw: f32, now: Instant) {
        self.total_energy_j += self.pending_j(now);
        self.held_mw = power_mw.max(0.0);
        self.held_since = now;
    }

    pub fn add_frame_energy(&mut self, power_mw: f32, duration_secs: f64) {
        self.total_energy_j += power_mw.max(0.0) as f64 / 1000.0 * duration_secs;
    }

    /// Checks a requested output level against the instantaneous limit and
    /// the energy budget.
    pub fn check(&mut self, power_mw: f32, limit_mw: f32, now: Instant) -> Result<(), Breach> {
        let reason = if power_mw > limit_mw {
            Some(format!("output {power_mw:.3} mW above safe limit {limit_mw:.3} mW"))
        } else if power_mw > 0.0 && self.total_energy_j + self.pending_j(now) > self.budget_j {
            Some(format!("energy budget of {:.3} J exceeded", self.budget_j))
        } else {
            None
        };
        match reason {
            None => Ok(()),
            Some(reason) => {
                self.breach_count = self.breach_count.saturating_add(1);
                let latched = self.breach_count > self.breach_limit;
                if latched {
                    self.latch(reason.clone(), now);
                }
                Err(Breach { reason, latched })
            }
        }
    }

    /// Latches emergency shutdown and zeroes the held output.
    pub fn latch(&mut self, reason: String, now: Instant) {
        self.set_output(0.0, now);
        self.latched = true;
        self.last_shutdown_reason = Some(reason);
    }

    /// Releases the latch; counters and the recorded reason stay.
    pub fn unlatch(&mut self) {
        self.latched = false;
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    pub fn last_reason(&self) -> Option<&str> {
        self.last_shutdown_reason.as_deref()
    }

    /// Clears every counter. Callers must refuse this while latched.
    pub fn reset(&mut self, now: Instant) {
        self.total_energy_j = 0.0;
        self.breach_count = 0;
        self.last_shutdown_reason = None;
        self.held_since = now;
    }

    pub fn stats(&self, now: Instant) -> SafetyStats {
        SafetyStats {
            total_energy_j: self.total_energy_j + self.pending_j(now),
            breach_count: self.breach_count,
            last_shutdown_reason: self.last_shutdown_reason.clone(),
            latched: self.latched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::optical::config::LaserType;

    #[test]
    fn limit_takes_the_tightest_bound() {
        let laser = LaserConfig::default();
        let far = PowerProfile::for_range_category(crate::profile::RangeCategory::Far);
        // infrared 10 mW x margin 2.0 beats profile max 50 and laser max 100
        assert_eq!(effective_limit_mw(&far, &laser), 20.0);
        let visible = LaserConfig {
            laser_type: LaserType::Visible,
            wavelength_nm: 650.0,
            ..Default::default()
        };
        assert_eq!(effective_limit_mw(&PowerProfile::default(), &visible), 1.0);
    }

    #[test]
    fn held_power_integrates_over_time() {
        let mut monitor = SafetyMonitor::new(&LaserConfig::default());
        let t0 = Instant::now();
        monitor.set_output(10.0, t0);
        monitor.set_output(0.0, t0 + Duration::from_secs(2));
        let stats = monitor.stats(t0 + Duration::from_secs(5));
        assert!((stats.total_energy_j - 0.02).abs() < 1e-9);
    }

    #[test]
    fn breaches_past_limit_latch() {
        let laser = LaserConfig {
            max_energy_j: 0.001,
            breach_limit: 2,
            ..Default::default()
        };
        let mut monitor = SafetyMonitor::new(&laser);
        let now = Instant::now();
        monitor.add_frame_energy(10.0, 1.0);
        assert!(!monitor.check(5.0, 10.0, now).unwrap_err().latched);
        assert!(!monitor.check(5.0, 10.0, now).unwrap_err().latched);
        assert!(monitor.check(5.0, 10.0, now).unwrap_err().latched);
        assert!(monitor.is_latched());
        assert_eq!(monitor.stats(now).breach_count, 3);
        assert!(monitor.check(0.0, 10.0, now).is_ok());
    }
}
