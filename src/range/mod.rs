//! Ultrasonic range detector with environmental compensation.
//!
//! Samples come from a [`RangingSensor`]; each one is converted to a distance
//! using the current atmospheric snapshot, scored for quality and (for the
//! regular measurement paths) appended to a bounded history.
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bounds::{self, BoundsError};
use crate::hal::{DriverFault, HardwareCapabilities, Modality, PulseSpec, RangingSensor};
use crate::profile::RangeCategory;

pub mod environment;
pub mod history;

pub use environment::EnvironmentalConditions;
pub use history::MeasurementHistory;

/// Speed of sound used by the uncompensated fast path.
pub const NOMINAL_SPEED_OF_SOUND: f64 = 343.0;
pub const MAX_AVERAGED_SAMPLES: u32 = 1000;
const QUALITY_REFERENCE_HZ: f32 = 40_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeState {
    Inactive,
    Active,
    Shutdown,
}

impl fmt::Display for RangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RangeState::Inactive => "inactive",
            RangeState::Active => "active",
            RangeState::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RangeError {
    #[error("{op} not allowed in state {state}")]
    WrongState { op: &'static str, state: RangeState },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Bounds(#[from] BoundsError),
    #[error("no usable signal: {0}")]
    NoSignal(String),
    #[error("sensor fault: {0}")]
    Sensor(#[from] DriverFault),
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("no measurement recorded yet")]
    NoMeasurement,
    #[error("history index {index} out of bounds (len {len})")]
    HistoryIndex { index: usize, len: usize },
}

/// One compensated distance sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub distance_m: f32,
    /// Echo strength in `[0, 1]`.
    pub signal_strength: f32,
    /// Strength relative to the expected attenuation at this distance, in `[0, 1]`.
    pub quality_score: f32,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Measurement {
    pub fn range_category(&self) -> RangeCategory {
        RangeCategory::from_distance(self.distance_m)
    }
}

/// Pulse and acceptance parameters for a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangingConfig {
    pub frequency_hz: f32,
    pub pulse_duration_us: f32,
    pub timeout_ms: u32,
    pub min_range_m: f32,
    pub max_range_m: f32,
    /// Echoes weaker than this carry no usable signal.
    pub signal_threshold: f32,
    pub history_capacity: usize,
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 40_000.0,
            pulse_duration_us: 200.0,
            timeout_ms: 1_200,
            min_range_m: 10.0,
            max_range_m: 200.0,
            signal_threshold: 0.3,
            history_capacity: 100,
        }
    }
}

impl RangingConfig {
    pub fn validate(&self) -> Result<(), RangeError> {
        bounds::check_f32("frequency_hz", self.frequency_hz, 20_000.0, 200_000.0)?;
        bounds::check_f32("pulse_duration_us", self.pulse_duration_us, 1.0, 10_000.0)?;
        bounds::check_range("timeout_ms", self.timeout_ms, 1, 30_000)?;
        bounds::check_f32("min_range_m", self.min_range_m, 0.0, 10_000.0)?;
        bounds::check_f32("max_range_m", self.max_range_m, 0.0, 10_000.0)?;
        if self.min_range_m >= self.max_range_m {
            return Err(RangeError::InvalidArgument(format!(
                "min_range_m {} must be below max_range_m {}",
                self.min_range_m, self.max_range_m
            )));
        }
        bounds::check_f32("signal_threshold", self.signal_threshold, 0.0, 1.0)?;
        bounds::check_range("history_capacity", self.history_capacity, 1, 100_000)?;
        Ok(())
    }

    fn pulse(&self) -> PulseSpec {
        PulseSpec {
            frequency_hz: self.frequency_hz,
            duration_us: self.pulse_duration_us,
            timeout_ms: self.timeout_ms,
        }
    }
}

struct RangeInner {
    state: RangeState,
    sensor: Box<dyn RangingSensor>,
    environment: EnvironmentalConditions,
    history: MeasurementHistory,
}

impl RangeInner {
    fn require(&self, op: &'static str, ok: bool) -> Result<(), RangeError> {
        if ok {
            Ok(())
        } else {
            Err(RangeError::WrongState {
                op,
                state: self.state,
            })
        }
    }

    fn require_active(&self, op: &'static str) -> Result<(), RangeError> {
        self.require(op, self.state == RangeState::Active)
    }

    fn require_alive(&self, op: &'static str) -> Result<(), RangeError> {
        self.require(op, self.state != RangeState::Shutdown)
    }
}

/// Distance sensor service.
///
/// # Guarantees
/// * A failed call never touches the environment snapshot or the history.
/// * The history never holds more than `history_capacity` samples.
pub struct RangeDetector {
    id: Uuid,
    config: RangingConfig,
    inner: Mutex<RangeInner>,
}

impl fmt::Debug for RangeDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeDetector")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl RangeDetector {
    pub fn new(sensor: Box<dyn RangingSensor>, config: RangingConfig) -> Result<Self, RangeError> {
        config.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(RangeInner {
                state: RangeState::Inactive,
                sensor,
                environment: EnvironmentalConditions::default(),
                history: MeasurementHistory::new(config.history_capacity),
            }),
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RangeState {
        self.inner.lock().state
    }

    pub fn config(&self) -> &RangingConfig {
        &self.config
    }

    /// `Inactive -> Active`; refuses when the host has no ultrasonic path.
    pub fn initialize(&self, caps: &HardwareCapabilities) -> Result<(), RangeError> {
        let mut inner = self.inner.lock();
        inner.require("initialize", inner.state == RangeState::Inactive)?;
        caps.require(Modality::Ultrasonic)
            .map_err(RangeError::HardwareUnavailable)?;
        inner.environment = EnvironmentalConditions::default();
        inner.state = RangeState::Active;
        info!(detector = %self.id, "range detector active");
        Ok(())
    }

    /// One compensated sample, recorded in the history.
    pub fn measure_distance(&self) -> Result<Measurement, RangeError> {
        let mut inner = self.inner.lock();
        inner.require_active("measure_distance")?;
        let sample = self.sample(&mut inner, true)?;
        inner.history.push(sample);
        Ok(sample)
    }

    /// Robust aggregate over `samples` raw pings.
    ///
    /// At least half the pings must succeed. The distance is a trimmed mean
    /// (a tenth dropped from each end), the strength the weakest seen and the
    /// quality the mean. Only the aggregate enters the history.
    pub fn measure_distance_averaged(&self, samples: u32) -> Result<Measurement, RangeError> {
        bounds::check_range("samples", samples, 1, MAX_AVERAGED_SAMPLES)?;
        let mut inner = self.inner.lock();
        inner.require_active("measure_distance_averaged")?;
        let mut good = Vec::with_capacity(samples as usize);
        for _ in 0..samples {
            match self.sample(&mut inner, true) {
                Ok(sample) => good.push(sample),
                Err(RangeError::NoSignal(reason)) => {
                    debug!(detector = %self.id, %reason, "discarding sample");
                }
                Err(RangeError::Sensor(fault)) => {
                    debug!(detector = %self.id, %fault, "discarding sample");
                }
                Err(other) => return Err(other),
            }
        }
        let needed = (samples as usize + 1) / 2;
        if good.len() < needed {
            return Err(RangeError::NoSignal(format!(
                "only {} of {} samples usable",
                good.len(),
                samples
            )));
        }
        good.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        let trim = good.len() / 10;
        let kept = &good[trim..good.len() - trim];
        let distance_m = kept.iter().map(|m| m.distance_m).sum::<f32>() / kept.len() as f32;
        let signal_strength = good
            .iter()
            .map(|m| m.signal_strength)
            .fold(f32::INFINITY, f32::min);
        let quality_score = good.iter().map(|m| m.quality_score).sum::<f32>() / good.len() as f32;
        let aggregate = Measurement {
            distance_m,
            signal_strength,
            quality_score,
            timestamp_ms: now_ms(),
        };
        inner.history.push(aggregate);
        Ok(aggregate)
    }

    /// Single uncompensated sample for control loops; never recorded.
    pub fn measure_distance_fast(&self) -> Result<Measurement, RangeError> {
        let mut inner = self.inner.lock();
        inner.require_active("measure_distance_fast")?;
        self.sample(&mut inner, false)
    }

    /// Replaces the atmospheric snapshot; rejected input keeps the prior one.
    pub fn update_environmental_conditions(
        &self,
        conditions: EnvironmentalConditions,
    ) -> Result<(), RangeError> {
        conditions.validate()?;
        let mut inner = self.inner.lock();
        inner.require_active("update_environmental_conditions")?;
        inner.environment = conditions;
        debug!(
            detector = %self.id,
            speed_of_sound = conditions.speed_of_sound(),
            "environment updated"
        );
        Ok(())
    }

    pub fn environment(&self) -> Result<EnvironmentalConditions, RangeError> {
        let inner = self.inner.lock();
        inner.require_alive("environment")?;
        Ok(inner.environment)
    }

    /// Bucket of the most recent recorded distance, `None` before the first one.
    pub fn current_range_category(&self) -> Result<Option<RangeCategory>, RangeError> {
        let inner = self.inner.lock();
        inner.require_alive("current_range_category")?;
        Ok(inner.history.latest().map(Measurement::range_category))
    }

    pub fn last_measurement(&self) -> Result<Measurement, RangeError> {
        let inner = self.inner.lock();
        inner.require_alive("last_measurement")?;
        inner.history.latest().copied().ok_or(RangeError::NoMeasurement)
    }

    pub fn history_len(&self) -> Result<usize, RangeError> {
        let inner = self.inner.lock();
        inner.require_alive("history_len")?;
        Ok(inner.history.len())
    }

    /// Index 0 is the oldest retained sample.
    pub fn history_get(&self, index: usize) -> Result<Measurement, RangeError> {
        let inner = self.inner.lock();
        inner.require_alive("history_get")?;
        inner
            .history
            .get(index)
            .copied()
            .ok_or(RangeError::HistoryIndex {
                index,
                len: inner.history.len(),
            })
    }

    /// `Active -> Shutdown`; terminal.
    pub fn shutdown(&self) -> Result<(), RangeError> {
        let mut inner = self.inner.lock();
        inner.require_active("shutdown")?;
        inner.state = RangeState::Shutdown;
        info!(detector = %self.id, "range detector shut down");
        Ok(())
    }

    fn sample(&self, inner: &mut RangeInner, compensated: bool) -> Result<Measurement, RangeError> {
        let echo = inner.sensor.ping(&self.config.pulse())?;
        if !echo.round_trip_us.is_finite() || echo.round_trip_us <= 0.0 {
            return Err(RangeError::NoSignal(format!(
                "implausible round trip {} us",
                echo.round_trip_us
            )));
        }
        if !echo.strength.is_finite() || echo.strength < self.config.signal_threshold {
            return Err(RangeError::NoSignal(format!(
                "echo strength {:.3} below threshold {:.3}",
                echo.strength, self.config.signal_threshold
            )));
        }
        let speed = if compensated {
            inner.environment.speed_of_sound()
        } else {
            NOMINAL_SPEED_OF_SOUND
        };
        let distance_m = (echo.round_trip_us * speed / 1e6 / 2.0) as f32;
        if distance_m < self.config.min_range_m || distance_m > self.config.max_range_m {
            return Err(RangeError::NoSignal(format!(
                "distance {distance_m:.2} m outside [{}, {}] m",
                self.config.min_range_m, self.config.max_range_m
            )));
        }
        let strength = echo.strength.min(1.0);
        Ok(Measurement {
            distance_m,
            signal_strength: strength,
            quality_score: quality_score(strength, distance_m, self.config.frequency_hz),
            timestamp_ms: now_ms(),
        })
    }
}

/// Echo strength relative to the attenuation expected at `distance_m`.
pub fn quality_score(strength: f32, distance_m: f32, frequency_hz: f32) -> f32 {
    let expected = 1.0 / (1.0 + 0.1 * distance_m * (frequency_hz / QUALITY_REFERENCE_HZ).sqrt());
    (strength / expected).clamp(0.0, 1.0)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::loopback::{ScriptedRanging, SimulatedTarget};
    use crate::hal::Echo;

    fn active(sensor: Box<dyn RangingSensor>, config: RangingConfig) -> RangeDetector {
        let detector = RangeDetector::new(sensor, config).unwrap();
        detector.initialize(&HardwareCapabilities::full()).unwrap();
        detector
    }

    fn echo_at(distance_m: f64, strength: f32) -> Result<Echo, DriverFault> {
        let speed = EnvironmentalConditions::default().speed_of_sound();
        Ok(Echo {
            round_trip_us: 2.0 * distance_m / speed * 1e6,
            strength,
        })
    }

    #[test]
    fn measures_compensated_distance() {
        let speed = EnvironmentalConditions::default().speed_of_sound();
        let target = SimulatedTarget::new(75.0, 0.8).with_speed_of_sound(speed);
        let detector = active(Box::new(target), RangingConfig::default());
        let m = detector.measure_distance().unwrap();
        assert!((m.distance_m - 75.0).abs() < 0.01);
        assert_eq!(detector.current_range_category().unwrap(), Some(RangeCategory::Medium));
        assert_eq!(detector.history_len().unwrap(), 1);
    }

    #[test]
    fn requires_activation_and_ultrasonic() {
        let detector =
            RangeDetector::new(Box::new(SimulatedTarget::new(50.0, 0.9)), RangingConfig::default())
                .unwrap();
        assert!(matches!(
            detector.measure_distance(),
            Err(RangeError::WrongState { .. })
        ));
        assert!(matches!(
            detector.initialize(&HardwareCapabilities::default()),
            Err(RangeError::HardwareUnavailable(_))
        ));
        assert_eq!(detector.state(), RangeState::Inactive);
    }

    #[test]
    fn weak_echo_is_no_signal() {
        let detector = active(
            Box::new(SimulatedTarget::new(50.0, 0.1)),
            RangingConfig::default(),
        );
        assert!(matches!(detector.measure_distance(), Err(RangeError::NoSignal(_))));
        assert_eq!(detector.history_len().unwrap(), 0);
        assert_eq!(detector.current_range_category().unwrap(), None);
    }

    #[test]
    fn averaged_trims_outliers_and_records_once() {
        let mut script: Vec<_> = (0..8).map(|_| echo_at(40.0, 0.9)).collect();
        script.push(echo_at(150.0, 0.5));
        script.push(echo_at(12.0, 0.95));
        let detector = active(Box::new(ScriptedRanging::new(script)), RangingConfig::default());
        let m = detector.measure_distance_averaged(10).unwrap();
        assert!((m.distance_m - 40.0).abs() < 0.01, "{}", m.distance_m);
        assert!((m.signal_strength - 0.5).abs() < f32::EPSILON);
        assert_eq!(detector.history_len().unwrap(), 1);
    }

    #[test]
    fn averaged_needs_half_the_samples() {
        let script = vec![
            echo_at(40.0, 0.9),
            Err(DriverFault::NoEcho),
            Err(DriverFault::NoEcho),
            echo_at(40.0, 0.1),
        ];
        let detector = active(Box::new(ScriptedRanging::new(script)), RangingConfig::default());
        assert!(matches!(
            detector.measure_distance_averaged(4),
            Err(RangeError::NoSignal(_))
        ));
        assert!(matches!(
            detector.measure_distance_averaged(0),
            Err(RangeError::Bounds(_))
        ));
        assert!(matches!(
            detector.measure_distance_averaged(1001),
            Err(RangeError::Bounds(_))
        ));
    }

    #[test]
    fn fast_path_skips_history_and_compensation() {
        let target = SimulatedTarget::new(34.3, 0.9);
        let detector = active(Box::new(target), RangingConfig::default());
        let m = detector.measure_distance_fast().unwrap();
        assert!((m.distance_m - 34.3).abs() < 0.001);
        assert_eq!(detector.history_len().unwrap(), 0);
    }

    #[test]
    fn history_caps_at_capacity() {
        let target = SimulatedTarget::new(20.0, 0.9);
        let config = RangingConfig {
            history_capacity: 3,
            ..Default::default()
        };
        let detector = active(Box::new(target.clone()), config);
        for d in [20.0, 30.0, 40.0, 50.0, 60.0] {
            target.set_distance(d);
            detector.measure_distance().unwrap();
        }
        assert_eq!(detector.history_len().unwrap(), 3);
        let oldest = detector.history_get(0).unwrap();
        assert!(oldest.distance_m > 39.0 && oldest.distance_m < 41.0);
        assert!(matches!(
            detector.history_get(3),
            Err(RangeError::HistoryIndex { index: 3, len: 3 })
        ));
    }

    #[test]
    fn rejected_environment_keeps_prior_snapshot() {
        let detector = active(
            Box::new(SimulatedTarget::new(50.0, 0.9)),
            RangingConfig::default(),
        );
        let warm = EnvironmentalConditions {
            temperature_c: 35.0,
            ..Default::default()
        };
        detector.update_environmental_conditions(warm).unwrap();
        let bad = EnvironmentalConditions {
            wind_speed_mps: 150.0,
            ..Default::default()
        };
        assert!(detector.update_environmental_conditions(bad).is_err());
        assert_eq!(detector.environment().unwrap(), warm);
    }

    #[test]
    fn shutdown_is_terminal() {
        let detector = active(
            Box::new(SimulatedTarget::new(50.0, 0.9)),
            RangingConfig::default(),
        );
        detector.shutdown().unwrap();
        assert!(detector.shutdown().is_err());
        assert!(detector.measure_distance_fast().is_err());
        assert!(detector.history_len().is_err());
        assert!(detector.current_range_category().is_err());
    }
}
