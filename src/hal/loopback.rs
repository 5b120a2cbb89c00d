//! In-memory drivers standing in for real hardware.
//!
//! Every simulator is `Clone` and shares its state, so a test can keep one
//! copy to steer or inspect while the engine owns the other.
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use super::{AcousticTransducer, DriverFault, Echo, LaserDriver, PulseSpec, RangingSensor};
use crate::acoustic::modulation;

/// Speed of sound assumed by the simulated target when none is set.
pub const NOMINAL_SPEED_OF_SOUND: f64 = 343.0;

#[derive(Debug)]
struct TargetState {
    distance_m: f64,
    strength: f32,
    speed_of_sound: f64,
    jitter_us: f64,
    fault: Option<DriverFault>,
}

/// Reflector at a fixed, adjustable distance.
#[derive(Debug, Clone)]
pub struct SimulatedTarget {
    state: Arc<Mutex<TargetState>>,
}

impl SimulatedTarget {
    pub fn new(distance_m: f64, strength: f32) -> Self {
        Self {
            state: Arc::new(Mutex::new(TargetState {
                distance_m,
                strength,
                speed_of_sound: NOMINAL_SPEED_OF_SOUND,
                jitter_us: 0.0,
                fault: None,
            })),
        }
    }

    /// Speed of sound the echo physically travels at.
    pub fn with_speed_of_sound(self, meters_per_sec: f64) -> Self {
        self.state.lock().speed_of_sound = meters_per_sec;
        self
    }

    /// Spreads each round trip uniformly by up to `jitter_us` either way.
    pub fn with_jitter_us(self, jitter_us: f64) -> Self {
        self.state.lock().jitter_us = jitter_us.abs();
        self
    }

    pub fn set_distance(&self, distance_m: f64) {
        self.state.lock().distance_m = distance_m;
    }

    pub fn set_strength(&self, strength: f32) {
        self.state.lock().strength = strength;
    }

    /// Makes every ping fail until cleared with `None`.
    pub fn set_fault(&self, fault: Option<DriverFault>) {
        self.state.lock().fault = fault;
    }
}

impl RangingSensor for SimulatedTarget {
    fn ping(&mut self, pulse: &PulseSpec) -> Result<Echo, DriverFault> {
        let state = self.state.lock();
        if let Some(fault) = &state.fault {
            return Err(fault.clone());
        }
        let mut round_trip_us = 2.0 * state.distance_m / state.speed_of_sound * 1e6;
        if state.jitter_us > 0.0 {
            round_trip_us += rand::thread_rng().gen_range(-state.jitter_us..=state.jitter_us);
            round_trip_us = round_trip_us.max(0.0);
        }
        if round_trip_us > pulse.timeout_ms as f64 * 1000.0 {
            return Err(DriverFault::NoEcho);
        }
        Ok(Echo {
            round_trip_us,
            strength: state.strength,
        })
    }
}

/// Replays a fixed sequence of echoes, then reports silence.
#[derive(Debug, Clone)]
pub struct ScriptedRanging {
    script: Arc<Mutex<VecDeque<Result<Echo, DriverFault>>>>,
}

impl ScriptedRanging {
    pub fn new<I>(script: I) -> Self
    where
        I: IntoIterator<Item = Result<Echo, DriverFault>>,
    {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
        }
    }

    pub fn push(&self, echo: Result<Echo, DriverFault>) {
        self.script.lock().push_back(echo);
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl RangingSensor for ScriptedRanging {
    fn ping(&mut self, _pulse: &PulseSpec) -> Result<Echo, DriverFault> {
        self.script.lock().pop_front().unwrap_or(Err(DriverFault::NoEcho))
    }
}

const DEFAULT_NOISE_FLOOR: f32 = 0.001;

#[derive(Debug)]
struct Lane {
    bytes: Vec<u8>,
    energy: f32,
    noise: f32,
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            bytes: Vec::new(),
            energy: 0.0,
            noise: DEFAULT_NOISE_FLOOR,
        }
    }
}

/// Shared air between two loopback transducers. Lane `n` is what side `n`
/// hears.
#[derive(Debug, Clone, Default)]
pub struct AcousticMedium {
    lanes: Arc<Mutex<[Lane; 2]>>,
}

impl AcousticMedium {
    /// Appends raw demodulated bytes to what `side` will read.
    pub fn inject(&self, side: usize, bytes: &[u8]) {
        self.lanes.lock()[side & 1].bytes.extend_from_slice(bytes);
    }

    pub fn set_energy(&self, side: usize, energy: f32) {
        self.lanes.lock()[side & 1].energy = energy;
    }

    pub fn set_noise_floor(&self, side: usize, noise: f32) {
        self.lanes.lock()[side & 1].noise = noise;
    }

    /// Stops the carrier heard by `side`.
    pub fn silence(&self, side: usize) {
        self.lanes.lock()[side & 1].energy = 0.0;
    }

    pub fn pending(&self, side: usize) -> usize {
        self.lanes.lock()[side & 1].bytes.len()
    }
}

/// One end of a simulated ultrasonic link.
#[derive(Debug, Clone)]
pub struct LoopbackTransducer {
    medium: AcousticMedium,
    side: usize,
    samples_per_symbol: usize,
}

impl LoopbackTransducer {
    /// Two transducers facing each other through a fresh medium.
    pub fn pair(samples_per_symbol: usize) -> (Self, Self, AcousticMedium) {
        let medium = AcousticMedium::default();
        let a = Self {
            medium: medium.clone(),
            side: 0,
            samples_per_symbol,
        };
        let b = Self {
            medium: medium.clone(),
            side: 1,
            samples_per_symbol,
        };
        (a, b, medium)
    }

    pub fn side(&self) -> usize {
        self.side
    }
}

impl AcousticTransducer for LoopbackTransducer {
    fn emit(&mut self, samples: &[f32]) -> Result<(), DriverFault> {
        let bytes = modulation::demodulate(samples, self.samples_per_symbol);
        let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        let mut lanes = self.medium.lanes.lock();
        let peer = &mut lanes[self.side ^ 1];
        peer.bytes.extend_from_slice(&bytes);
        peer.energy = peak.min(1.0);
        Ok(())
    }

    fn carrier_energy(&mut self) -> Result<f32, DriverFault> {
        let lanes = self.medium.lanes.lock();
        let lane = &lanes[self.side];
        Ok(lane.energy.max(lane.noise))
    }

    fn noise_floor(&mut self) -> Result<f32, DriverFault> {
        Ok(self.medium.lanes.lock()[self.side].noise)
    }

    fn read_demodulated(&mut self) -> Result<Vec<u8>, DriverFault> {
        Ok(std::mem::take(&mut self.medium.lanes.lock()[self.side].bytes))
    }
}

#[derive(Debug, Default)]
struct LaserState {
    power_mw: f32,
    position: (f32, f32),
    emitted: Vec<(Vec<u8>, f32)>,
    fault: Option<DriverFault>,
}

/// Laser head with a steerable mirror, optionally wired to a peer receiver.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLaser {
    state: Arc<Mutex<LaserState>>,
    link: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl SimulatedLaser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers every emitted frame to `link`.
    pub fn linked(link: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            state: Arc::default(),
            link: Some(link),
        }
    }

    pub fn power_mw(&self) -> f32 {
        self.state.lock().power_mw
    }

    pub fn position(&self) -> (f32, f32) {
        self.state.lock().position
    }

    pub fn emitted(&self) -> Vec<(Vec<u8>, f32)> {
        self.state.lock().emitted.clone()
    }

    /// Makes every driver call fail until cleared with `None`.
    pub fn set_fault(&self, fault: Option<DriverFault>) {
        self.state.lock().fault = fault;
    }

    /// Received strength for a detector at `receiver`, falling off with the
    /// squared pointing error.
    pub fn strength_toward(&self, receiver: (f32, f32)) -> f32 {
        let (x, y) = self.position();
        let d2 = (x - receiver.0).powi(2) + (y - receiver.1).powi(2);
        (-d2 / 0.25).exp()
    }

    fn check(&self) -> Result<(), DriverFault> {
        match &self.state.lock().fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }
}

impl LaserDriver for SimulatedLaser {
    fn set_power_mw(&mut self, power_mw: f32) -> Result<(), DriverFault> {
        self.check()?;
        self.state.lock().power_mw = power_mw;
        Ok(())
    }

    fn steer(&mut self, x: f32, y: f32) -> Result<(), DriverFault> {
        self.check()?;
        self.state.lock().position = (x, y);
        Ok(())
    }

    fn emit_frame(&mut self, frame: &[u8], power_mw: f32) -> Result<(), DriverFault> {
        self.check()?;
        self.state.lock().emitted.push((frame.to_vec(), power_mw));
        if let Some(link) = &self.link {
            link.send(frame.to_vec())
                .map_err(|_| DriverFault::Disconnected)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse() -> PulseSpec {
        PulseSpec {
            frequency_hz: 40_000.0,
            duration_us: 200.0,
            timeout_ms: 1_200,
        }
    }

    #[test]
    fn target_echo_matches_distance() {
        let mut target = SimulatedTarget::new(34.3, 0.9);
        let echo = target.ping(&pulse()).unwrap();
        assert!((echo.round_trip_us - 200_000.0).abs() < 1e-6);
        target.set_distance(1_000.0);
        assert_eq!(target.ping(&pulse()), Err(DriverFault::NoEcho));
    }

    #[test]
    fn jittered_echoes_stay_within_spread() {
        let mut target = SimulatedTarget::new(34.3, 0.9).with_jitter_us(50.0);
        for _ in 0..100 {
            let echo = target.ping(&pulse()).unwrap();
            assert!((echo.round_trip_us - 200_000.0).abs() <= 50.0 + 1e-6);
        }
    }

    #[test]
    fn transducers_hear_each_other() {
        let (mut a, mut b, medium) = LoopbackTransducer::pair(16);
        let config = crate::profile::BeamConfig::default().compile().unwrap();
        let wave = modulation::synthesize(&config, b"ping");
        a.emit(&wave.samples).unwrap();
        assert_eq!(medium.pending(1), 4);
        assert!(b.carrier_energy().unwrap() > 0.05);
        assert_eq!(b.read_demodulated().unwrap(), b"ping");
        assert!(a.read_demodulated().unwrap().is_empty());
    }

    #[test]
    fn laser_forwards_frames_to_link() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut laser = SimulatedLaser::linked(tx);
        laser.emit_frame(b"beam", 2.0).unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"beam");
        assert_eq!(laser.emitted().len(), 1);
    }
}
