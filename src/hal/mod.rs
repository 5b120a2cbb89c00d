//! Driver seams for the physical modalities.
//!
//! Engines own their drivers behind these traits and never touch hardware
//! directly. Real device bindings live outside this crate; [`loopback`]
//! provides in-memory drivers for tests and demos.
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod loopback;
pub mod probe;

pub use probe::{HardwareCapabilities, HardwareProbe, Modality, StaticProbe};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverFault {
    #[error("no echo inside the listening window")]
    NoEcho,
    #[error("device timed out")]
    Timeout,
    #[error("device disconnected")]
    Disconnected,
    #[error("device fault: {0}")]
    Device(String),
}

/// Ranging pulse parameters handed to the sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseSpec {
    pub frequency_hz: f32,
    pub duration_us: f32,
    pub timeout_ms: u32,
}

/// Raw echo as reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Echo {
    pub round_trip_us: f64,
    /// Normalized echo strength in `[0, 1]`.
    pub strength: f32,
}

pub trait RangingSensor: Send {
    fn ping(&mut self, pulse: &PulseSpec) -> Result<Echo, DriverFault>;
}

pub trait AcousticTransducer: Send {
    /// Plays a sampled waveform.
    fn emit(&mut self, samples: &[f32]) -> Result<(), DriverFault>;
    /// In-band carrier energy currently heard, normalized to `[0, 1]`.
    fn carrier_energy(&mut self) -> Result<f32, DriverFault>;
    /// Background energy with no carrier present.
    fn noise_floor(&mut self) -> Result<f32, DriverFault>;
    /// Drains bytes recovered by the receive demodulator.
    fn read_demodulated(&mut self) -> Result<Vec<u8>, DriverFault>;
}

pub trait LaserDriver: Send {
    fn set_power_mw(&mut self, power_mw: f32) -> Result<(), DriverFault>;
    /// Steers the beam; both axes in `[-1, 1]`.
    fn steer(&mut self, x: f32, y: f32) -> Result<(), DriverFault>;
    fn emit_frame(&mut self, frame: &[u8], power_mw: f32) -> Result<(), DriverFault>;
}

#[async_trait]
pub trait PhotonReceiver: Send {
    /// Next frame recovered by the photodiode or camera; `None` once the
    /// receiver is gone.
    async fn next_frame(&mut self) -> Option<Vec<u8>>;
}

#[async_trait]
impl PhotonReceiver for mpsc::Receiver<Vec<u8>> {
    async fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.recv().await
    }
}

#[async_trait]
impl PhotonReceiver for mpsc::UnboundedReceiver<Vec<u8>> {
    async fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.recv().await
    }
}
