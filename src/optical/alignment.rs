//! Closed-loop beam alignment.
//!
//! Pattern search on `error = 1 - strength`: every attempt steers to one
//! candidate and takes one strength sample. Improvements move the best-known
//! position; a full ring of failed moves halves the step. The actuators always
//! end on the best position seen.
//!
//! [`AlignmentSearch`] holds the search state between attempts so a caller
//! can release its own locks while the sample is taken.
use serde::Serialize;

use crate::bounds::{self, BoundsError};
use crate::hal::{DriverFault, LaserDriver};
use crate::range::{RangeDetector, RangeError};

pub const ALIGNMENT_TOLERANCE: f32 = 0.05;
pub const MAX_ALIGNMENT_ATTEMPTS: u32 = 100;
const INITIAL_STEP: f32 = 0.25;
const MIN_STEP: f32 = 1.0 / 1024.0;
const DIRECTIONS: [(f32, f32); 4] = [(1.0, 0.0), (-1.0, 0.0), (0.0, 1.0), (0.0, -1.0)];

/// One received-strength sample per call, in `[0, 1]`.
pub trait SignalSource {
    fn sample_strength(&mut self) -> Result<f32, String>;
}

/// A detector that hears no usable echo reads as zero strength.
impl SignalSource for &RangeDetector {
    fn sample_strength(&mut self) -> Result<f32, String> {
        match self.measure_distance_fast() {
            Ok(sample) => Ok(sample.signal_strength),
            Err(RangeError::NoSignal(_)) | Err(RangeError::Sensor(DriverFault::NoEcho)) => Ok(0.0),
            Err(err) => Err(err.to_string()),
        }
    }
}

/// Adapts a closure into a [`SignalSource`].
pub struct FnSource<F>(pub F);

impl<F> SignalSource for FnSource<F>
where
    F: FnMut() -> f32,
{
    fn sample_strength(&mut self) -> Result<f32, String> {
        Ok((self.0)())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlignmentStatus {
    pub target_x: f32,
    pub target_y: f32,
    pub current_x: f32,
    pub current_y: f32,
    pub current_error: f32,
    pub locked: bool,
    pub attempts_used: u32,
}

impl Default for AlignmentStatus {
    fn default() -> Self {
        Self {
            target_x: 0.0,
            target_y: 0.0,
            current_x: 0.0,
            current_y: 0.0,
            current_error: 1.0,
            locked: false,
            attempts_used: 0,
        }
    }
}

impl AlignmentStatus {
    /// Points at a new target; any previous lock is void.
    pub fn retarget(&mut self, x: f32, y: f32) -> Result<(), BoundsError> {
        let x = bounds::check_f32("target_x", x, -1.0, 1.0)?;
        let y = bounds::check_f32("target_y", y, -1.0, 1.0)?;
        self.target_x = x;
        self.target_y = y;
        self.locked = false;
        self.current_error = 1.0;
        self.attempts_used = 0;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentError {
    Driver(DriverFault),
    Source(String),
    Exhausted { attempts: u32, error: f32 },
}

/// Outcome of recording one attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchStep {
    Continue,
    /// Converged; steer to [`AlignmentSearch::best`] if the last candidate
    /// was not it.
    Locked,
    /// Out of attempts; steer back to [`AlignmentSearch::best`].
    Exhausted,
}

/// Pattern-search state carried between attempts.
#[derive(Debug, Clone)]
pub struct AlignmentSearch {
    best: (f32, f32),
    best_error: f32,
    step: f32,
    direction: usize,
    failed_in_ring: usize,
    attempt: u32,
    max_attempts: u32,
}

impl AlignmentSearch {
    /// Starts a search around the current target and clears any lock.
    pub fn start(status: &mut AlignmentStatus, max_attempts: u32) -> Self {
        status.locked = false;
        status.attempts_used = 0;
        Self {
            best: (status.target_x, status.target_y),
            best_error: f32::INFINITY,
            step: INITIAL_STEP,
            direction: 0,
            failed_in_ring: 0,
            attempt: 0,
            max_attempts,
        }
    }

    /// Where the next attempt should steer.
    pub fn next_candidate(&self) -> (f32, f32) {
        if self.attempt == 0 {
            return self.best;
        }
        let (dx, dy) = DIRECTIONS[self.direction];
        (
            (self.best.0 + dx * self.step).clamp(-1.0, 1.0),
            (self.best.1 + dy * self.step).clamp(-1.0, 1.0),
        )
    }

    pub fn best(&self) -> (f32, f32) {
        self.best
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Records the strength sampled at `candidate` and updates `status`.
    pub fn record(
        &mut self,
        status: &mut AlignmentStatus,
        candidate: (f32, f32),
        strength: f32,
    ) -> SearchStep {
        self.attempt += 1;
        status.current_x = candidate.0;
        status.current_y = candidate.1;
        status.attempts_used = self.attempt;
        let error = 1.0 - strength.clamp(0.0, 1.0);
        status.current_error = error;

        if error < self.best_error {
            self.best = candidate;
            self.best_error = error;
            self.failed_in_ring = 0;
        } else if self.attempt > 1 {
            self.direction = (self.direction + 1) % DIRECTIONS.len();
            self.failed_in_ring += 1;
            if self.failed_in_ring == DIRECTIONS.len() {
                self.step = (self.step / 2.0).max(MIN_STEP);
                self.failed_in_ring = 0;
            }
        }

        if self.best_error < ALIGNMENT_TOLERANCE {
            status.current_x = self.best.0;
            status.current_y = self.best.1;
            status.current_error = self.best_error;
            status.locked = true;
            return SearchStep::Locked;
        }
        if self.attempt >= self.max_attempts {
            status.current_x = self.best.0;
            status.current_y = self.best.1;
            status.current_error = self.best_error.min(1.0);
            return SearchStep::Exhausted;
        }
        SearchStep::Continue
    }
}

/// Runs up to `max_attempts` steer-and-sample cycles, updating `status` as it goes.
pub fn run(
    driver: &mut dyn LaserDriver,
    source: &mut dyn SignalSource,
    status: &mut AlignmentStatus,
    max_attempts: u32,
) -> Result<(), AlignmentError> {
    let mut search = AlignmentSearch::start(status, max_attempts);
    loop {
        let candidate = search.next_candidate();
        driver
            .steer(candidate.0, candidate.1)
            .map_err(AlignmentError::Driver)?;
        let strength = source.sample_strength().map_err(AlignmentError::Source)?;
        match search.record(status, candidate, strength) {
            SearchStep::Continue => {}
            SearchStep::Locked => {
                let best = search.best();
                if candidate != best {
                    driver.steer(best.0, best.1).map_err(AlignmentError::Driver)?;
                }
                return Ok(());
            }
            SearchStep::Exhausted => {
                let best = search.best();
                driver.steer(best.0, best.1).map_err(AlignmentError::Driver)?;
                return Err(AlignmentError::Exhausted {
                    attempts: search.attempts(),
                    error: status.current_error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::loopback::SimulatedLaser;

    #[test]
    fn strictly_improving_signal_converges() {
        let mut laser = SimulatedLaser::new();
        let mut readings = vec![0.3f32, 0.5, 0.7, 0.9, 0.97].into_iter();
        let mut source = FnSource(move || readings.next().unwrap_or(0.0));
        let mut status = AlignmentStatus::default();
        run(&mut laser, &mut source, &mut status, 10).unwrap();
        assert!(status.locked);
        assert_eq!(status.attempts_used, 5);
        assert!(status.current_error < ALIGNMENT_TOLERANCE);
    }

    #[test]
    fn flat_signal_exhausts_attempts_and_keeps_best() {
        let mut laser = SimulatedLaser::new();
        let mut source = FnSource(|| 0.2f32);
        let mut status = AlignmentStatus::default();
        status.retarget(0.5, -0.5).unwrap();
        let err = run(&mut laser, &mut source, &mut status, 5).unwrap_err();
        assert!(matches!(err, AlignmentError::Exhausted { attempts: 5, .. }));
        assert_eq!(status.attempts_used, 5);
        assert!(!status.locked);
        assert_eq!(laser.position(), (0.5, -0.5));
    }

    #[test]
    fn search_steps_without_holding_the_driver() {
        let mut status = AlignmentStatus::default();
        let mut search = AlignmentSearch::start(&mut status, 3);
        assert_eq!(search.next_candidate(), (0.0, 0.0));
        assert_eq!(search.record(&mut status, (0.0, 0.0), 0.5), SearchStep::Continue);
        assert_eq!(search.next_candidate(), (0.25, 0.0));
        assert_eq!(search.record(&mut status, (0.25, 0.0), 0.6), SearchStep::Continue);
        assert_eq!(search.best(), (0.25, 0.0));
        assert_eq!(search.record(&mut status, (0.5, 0.0), 0.1), SearchStep::Exhausted);
        assert_eq!((status.current_x, status.current_y), (0.25, 0.0));
        assert_eq!(status.attempts_used, 3);
        assert!((status.current_error - 0.4).abs() < 1e-6);
    }

    #[test]
    fn finds_an_offset_receiver() {
        let mut laser = SimulatedLaser::new();
        let view = laser.clone();
        let mut source = FnSource(move || view.strength_toward((0.4, -0.2)));
        let mut status = AlignmentStatus::default();
        run(&mut laser, &mut source, &mut status, 100).unwrap();
        let (x, y) = laser.position();
        assert!((x - 0.4).abs() < 0.15 && (y + 0.2).abs() < 0.15, "{x} {y}");
    }
}
