//! Free-space optical beam engine.
//!
//! Output power is always a percentage of the effective limit (the tightest
//! of profile maximum, laser maximum and eye-safe limit). Every change of
//! output and every frame goes through the safety monitor first; transmit
//! additionally requires an alignment lock.
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bounds::{self, BoundsError, MAX_PAYLOAD_BYTES};
use crate::channel::FrameTransport;
use crate::events::{EventBus, LinkEvent};
use crate::framing::{FrameCodec, FrameKind, RawFrame};
use crate::hal::{DriverFault, HardwareCapabilities, LaserDriver, Modality, PhotonReceiver};
use crate::health::{DegradeReason, HealthEvent, HealthMonitor};
use crate::link_quality::{LinkConditions, LinkMetrics, SequenceUnwrapper};
use crate::profile::{CompiledPowerProfile, PowerProfile, ProfileError, RangeCategory};
use crate::range::{EnvironmentalConditions, Measurement, RangeDetector, RangeError};

pub mod adaptive;
pub mod alignment;
pub mod config;
pub mod ecc;
pub mod safety;

pub use adaptive::{AdaptiveEvent, AdaptiveState};
pub use alignment::{
    AlignmentSearch, AlignmentStatus, FnSource, SearchStep, SignalSource, ALIGNMENT_TOLERANCE,
    MAX_ALIGNMENT_ATTEMPTS,
};
pub use config::{LaserConfig, LaserType, ReceptionConfig};
pub use safety::{effective_limit_mw, SafetyStats};

pub const MAX_RECEIVE_TIMEOUT_MS: u32 = 30_000;
pub const DEFAULT_INTENSITY_PCT: f32 = 50.0;
const HEALTH_WINDOW_FRAMES: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpticalState {
    Created,
    Initialized { adaptive: bool },
    EmergencyShutdown,
    Shutdown,
}

impl OpticalState {
    pub fn is_initialized(&self) -> bool {
        matches!(self, OpticalState::Initialized { .. })
    }
}

impl fmt::Display for OpticalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpticalState::Created => "created",
            OpticalState::Initialized { adaptive: true } => "initialized (adaptive on)",
            OpticalState::Initialized { adaptive: false } => "initialized (adaptive off)",
            OpticalState::EmergencyShutdown => "emergency_shutdown",
            OpticalState::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpticalError {
    #[error("{op} not allowed in state {state}")]
    WrongState { op: &'static str, state: OpticalState },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Bounds(#[from] BoundsError),
    #[error("power profile: {0}")]
    Profile(#[from] ProfileError),
    #[error("beam misaligned (error {error:.3}, tolerance {tolerance:.3})")]
    Misaligned { error: f32, tolerance: f32 },
    #[error("alignment did not converge after {attempts} attempts (error {error:.3})")]
    AlignmentFailed { attempts: u32, error: f32 },
    #[error("alignment signal source: {0}")]
    SignalSource(String),
    #[error("laser driver: {0}")]
    Driver(#[from] DriverFault),
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("no frame within {0} ms")]
    Timeout(u32),
    #[error("malformed optical frame")]
    MalformedFrame,
    #[error("safety trip: {0}")]
    SafetyTrip(String),
    #[error(transparent)]
    Ecc(#[from] ecc::EccError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpticalDiagnostics {
    pub engine_id: Uuid,
    pub state: OpticalState,
    pub power_profile: String,
    pub power_profile_id: String,
    pub intensity_pct: f32,
    pub output_power_mw: f32,
    pub effective_limit_mw: f32,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frame_errors: u64,
    pub ecc_parity_shards: usize,
    pub ecc_repaired_shards: u64,
    pub metrics: LinkMetrics,
    pub degraded: Option<DegradeReason>,
    pub alignment: AlignmentStatus,
    pub uptime_ms: u64,
}

struct OpticalInner {
    state: OpticalState,
    laser: LaserConfig,
    reception: ReceptionConfig,
    driver: Box<dyn LaserDriver>,
    profile: Arc<CompiledPowerProfile>,
    intensity_pct: f32,
    alignment: AlignmentStatus,
    safety: safety::SafetyMonitor,
    adaptive: AdaptiveState,
    codec: FrameCodec,
    ecc_parity: usize,
    ecc_repaired: u64,
    tx_seq: u16,
    rx_seq: SequenceUnwrapper,
    lifetime: LinkConditions,
    window: LinkConditions,
    health: HealthMonitor,
    frames_sent: u64,
}

impl OpticalInner {
    /// Latched engines answer with the trip reason, everything else with
    /// `WrongState`.
    fn require(&self, op: &'static str, ok: bool) -> Result<(), OpticalError> {
        if ok {
            return Ok(());
        }
        if self.state == OpticalState::EmergencyShutdown {
            return Err(OpticalError::SafetyTrip(
                self.safety
                    .last_reason()
                    .unwrap_or("emergency shutdown latched")
                    .to_string(),
            ));
        }
        Err(OpticalError::WrongState {
            op,
            state: self.state,
        })
    }

    fn require_initialized(&self, op: &'static str) -> Result<(), OpticalError> {
        self.require(op, self.state.is_initialized())
    }

    fn limit_for(&self, profile: &CompiledPowerProfile) -> f32 {
        effective_limit_mw(profile.profile(), &self.laser)
    }

    fn output_mw(&self) -> f32 {
        self.limit_for(&self.profile) * self.intensity_pct / 100.0
    }
}

/// Covert laser channel.
///
/// # Guarantees
/// * Output never exceeds the effective limit of the active profile.
/// * Once latched in emergency shutdown, transmit and energy reset fail with
///   `SafetyTrip` until [`OpticalBeamEngine::clear_emergency_latch`] runs.
/// * Rejected configuration or profile input leaves the prior snapshot active.
pub struct OpticalBeamEngine {
    id: Uuid,
    events: EventBus,
    started: Instant,
    inner: Mutex<OpticalInner>,
    receiver: tokio::sync::Mutex<Box<dyn PhotonReceiver>>,
}

impl fmt::Debug for OpticalBeamEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpticalBeamEngine")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl OpticalBeamEngine {
    /// Builds an engine; invalid configuration yields no engine at all.
    pub fn new(
        laser: LaserConfig,
        reception: ReceptionConfig,
        driver: Box<dyn LaserDriver>,
        receiver: Box<dyn PhotonReceiver>,
        events: EventBus,
    ) -> Result<Self, OpticalError> {
        laser.validate()?;
        reception.validate()?;
        let profile = Arc::new(PowerProfile::default().compile()?);
        let safety = safety::SafetyMonitor::new(&laser);
        Ok(Self {
            id: Uuid::new_v4(),
            events,
            started: Instant::now(),
            inner: Mutex::new(OpticalInner {
                state: OpticalState::Created,
                laser,
                reception,
                driver,
                profile,
                intensity_pct: DEFAULT_INTENSITY_PCT,
                alignment: AlignmentStatus::default(),
                safety,
                adaptive: AdaptiveState::baseline(DEFAULT_INTENSITY_PCT, None),
                codec: FrameCodec::new(MAX_PAYLOAD_BYTES),
                ecc_parity: ecc::parity_for(RangeCategory::Medium),
                ecc_repaired: 0,
                tx_seq: 0,
                rx_seq: SequenceUnwrapper::new(),
                lifetime: LinkConditions::new(),
                window: LinkConditions::new(),
                health: HealthMonitor::new(0.0),
                frames_sent: 0,
            }),
            receiver: tokio::sync::Mutex::new(receiver),
        })
    }

    /// Same as [`OpticalBeamEngine::new`] from boundary CBOR blobs.
    pub fn from_cbor(
        laser: &[u8],
        reception: &[u8],
        driver: Box<dyn LaserDriver>,
        receiver: Box<dyn PhotonReceiver>,
        events: EventBus,
    ) -> Result<Self, OpticalError> {
        let laser = LaserConfig::from_cbor(laser)?;
        let reception = ReceptionConfig::from_cbor(reception)?;
        Self::new(laser, reception, driver, receiver, events)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> OpticalState {
        self.inner.lock().state
    }

    pub fn laser_config(&self) -> LaserConfig {
        self.inner.lock().laser.clone()
    }

    pub fn reception_config(&self) -> ReceptionConfig {
        self.inner.lock().reception.clone()
    }

    /// `Created -> Initialized`; refuses when the laser or any configured
    /// detector is absent.
    pub fn initialize(&self, caps: &HardwareCapabilities) -> Result<(), OpticalError> {
        let mut inner = self.inner.lock();
        inner.require("initialize", inner.state == OpticalState::Created)?;
        caps.require(Modality::Laser)
            .map_err(OpticalError::HardwareUnavailable)?;
        for modality in inner.reception.modalities() {
            caps.require(modality)
                .map_err(OpticalError::HardwareUnavailable)?;
        }
        let now = Instant::now();
        let power = inner.output_mw();
        let limit = inner.limit_for(&inner.profile);
        if let Err(breach) = inner.safety.check(power, limit, now) {
            return Err(self.on_breach(&mut inner, breach));
        }
        let (x, y) = (inner.alignment.target_x, inner.alignment.target_y);
        inner.driver.steer(x, y)?;
        inner.driver.set_power_mw(power)?;
        inner.safety.set_output(power, now);
        inner.alignment.current_x = x;
        inner.alignment.current_y = y;
        inner.state = OpticalState::Initialized { adaptive: false };
        info!(engine = %self.id, power_mw = power, "optical engine initialized");
        Ok(())
    }

    /// Sets output as a percentage of the effective limit.
    pub fn set_intensity(&self, intensity_pct: f32) -> Result<(), OpticalError> {
        let intensity_pct = bounds::check_f32("intensity", intensity_pct, 0.0, 100.0)?;
        let mut inner = self.inner.lock();
        inner.require(
            "set_intensity",
            matches!(inner.state, OpticalState::Created | OpticalState::Initialized { .. }),
        )?;
        let profile = Arc::clone(&inner.profile);
        self.apply_output(&mut inner, &profile, intensity_pct)?;
        inner.intensity_pct = intensity_pct;
        inner.adaptive.intensity_pct = intensity_pct;
        debug!(engine = %self.id, intensity_pct, "intensity set");
        Ok(())
    }

    pub fn intensity(&self) -> f32 {
        self.inner.lock().intensity_pct
    }

    /// Seals `data` into a frame and emits it at the current output.
    pub fn transmit_data(&self, data: &[u8]) -> Result<(), OpticalError> {
        bounds::check_nonempty_payload("optical payload", data)?;
        let mut inner = self.inner.lock();
        inner.require_initialized("transmit_data")?;
        if !inner.alignment.locked {
            return Err(OpticalError::Misaligned {
                error: inner.alignment.current_error,
                tolerance: ALIGNMENT_TOLERANCE,
            });
        }
        let now = Instant::now();
        let power = inner.output_mw();
        let limit = inner.limit_for(&inner.profile);
        if let Err(breach) = inner.safety.check(power, limit, now) {
            return Err(self.on_breach(&mut inner, breach));
        }
        let seq = inner.tx_seq;
        let bytes = inner
            .codec
            .encode_to_vec(RawFrame::new(FrameKind::Data, seq, data.to_vec()))
            .map_err(|_| {
                OpticalError::Bounds(BoundsError::TooLarge {
                    what: "optical payload",
                    limit: MAX_PAYLOAD_BYTES,
                    len: data.len(),
                })
            })?;
        let block = ecc::encode_block(&bytes, inner.ecc_parity)?;
        inner.driver.emit_frame(&block, power)?;
        let rate = inner.profile.profile().data_rate_bps as f64;
        inner
            .safety
            .add_frame_energy(power, block.len() as f64 * 8.0 / rate);
        inner.tx_seq = seq.wrapping_add(1);
        inner.frames_sent += 1;
        Ok(())
    }

    /// Waits up to `timeout_ms` for the next inbound frame.
    pub async fn receive_data(&self, timeout_ms: u32) -> Result<Vec<u8>, OpticalError> {
        let timeout_ms = bounds::check_range("timeout_ms", timeout_ms, 0, MAX_RECEIVE_TIMEOUT_MS)?;
        {
            let inner = self.inner.lock();
            inner.require_initialized("receive_data")?;
        }
        let wait = async {
            let mut receiver = self.receiver.lock().await;
            receiver.next_frame().await
        };
        let limit = Duration::from_millis(timeout_ms as u64);
        let bytes = match tokio::time::timeout(limit, wait).await {
            Err(_) => return Err(OpticalError::Timeout(timeout_ms)),
            Ok(None) => {
                return Err(OpticalError::HardwareUnavailable(
                    "photon receiver closed".into(),
                ))
            }
            Ok(Some(bytes)) => bytes,
        };

        let (decoded, repaired) = match ecc::decode_block(&bytes) {
            Ok(block) => {
                let mut codec = FrameCodec::new(MAX_PAYLOAD_BYTES);
                let mut buf = BytesMut::from(&block.payload[..]);
                (codec.decode(&mut buf).ok().flatten(), block.repaired_shards)
            }
            Err(err) => {
                debug!(engine = %self.id, %err, "optical block unrecoverable");
                (None, 0)
            }
        };
        let arrival_us = self.started.elapsed().as_micros() as u64;
        let mut guard = self.inner.lock();
        // the engine may have latched or shut down while we waited
        guard.require_initialized("receive_data")?;
        let inner = &mut *guard;
        let result = match decoded {
            Some(frame) if frame.kind == FrameKind::Data => {
                if repaired > 0 {
                    inner.ecc_repaired += repaired as u64;
                    debug!(engine = %self.id, repaired, "rebuilt damaged shards");
                }
                let seq = inner.rx_seq.extend(frame.seq);
                inner.lifetime.record_frame(seq, arrival_us);
                inner.window.record_frame(seq, arrival_us);
                Ok(frame.payload)
            }
            _ => {
                inner.lifetime.record_corrupt(1);
                inner.window.record_corrupt(1);
                debug!(engine = %self.id, len = bytes.len(), "discarded malformed optical frame");
                Err(OpticalError::MalformedFrame)
            }
        };
        self.evaluate_health(inner);
        result
    }

    /// Sets the steering target and voids any lock.
    pub fn set_alignment_target(&self, x: f32, y: f32) -> Result<(), OpticalError> {
        let mut inner = self.inner.lock();
        inner.require(
            "set_alignment_target",
            matches!(inner.state, OpticalState::Created | OpticalState::Initialized { .. }),
        )?;
        inner.alignment.retarget(x, y)?;
        Ok(())
    }

    /// Closed-loop alignment; one steer-and-sample cycle per attempt.
    ///
    /// The engine lock is held only while steering and recording. `source`
    /// is sampled with it released, so a source may lock a detector or read
    /// this engine.
    ///
    /// # Errors
    /// * `AlignmentFailed` once `max_attempts` pass without converging; the
    ///   beam stays on the best position seen.
    /// * `WrongState`/`SafetyTrip` if the engine leaves the initialized state
    ///   between attempts.
    pub fn auto_align(
        &self,
        max_attempts: u32,
        source: &mut dyn SignalSource,
    ) -> Result<AlignmentStatus, OpticalError> {
        let max_attempts =
            bounds::check_range("max_attempts", max_attempts, 1, MAX_ALIGNMENT_ATTEMPTS)?;
        let mut search = {
            let mut inner = self.inner.lock();
            inner.require_initialized("auto_align")?;
            AlignmentSearch::start(&mut inner.alignment, max_attempts)
        };
        loop {
            let candidate = search.next_candidate();
            {
                let mut inner = self.inner.lock();
                inner.require_initialized("auto_align")?;
                inner.driver.steer(candidate.0, candidate.1)?;
            }
            let strength = source.sample_strength().map_err(OpticalError::SignalSource)?;

            let mut guard = self.inner.lock();
            guard.require_initialized("auto_align")?;
            let inner = &mut *guard;
            match search.record(&mut inner.alignment, candidate, strength) {
                SearchStep::Continue => {}
                SearchStep::Locked => {
                    let best = search.best();
                    if candidate != best {
                        inner.driver.steer(best.0, best.1)?;
                    }
                    let status = inner.alignment;
                    info!(
                        engine = %self.id,
                        attempts = status.attempts_used,
                        error = status.current_error,
                        "alignment locked"
                    );
                    self.events.publish(LinkEvent::AlignmentLocked {
                        source: self.id,
                        attempts: status.attempts_used,
                        error: status.current_error,
                    });
                    return Ok(status);
                }
                SearchStep::Exhausted => {
                    let best = search.best();
                    inner.driver.steer(best.0, best.1)?;
                    let attempts = search.attempts();
                    let error = inner.alignment.current_error;
                    warn!(engine = %self.id, attempts, error, "alignment did not converge");
                    return Err(OpticalError::AlignmentFailed { attempts, error });
                }
            }
        }
    }

    /// Aligns using fast samples from `detector`. The detector is never
    /// locked while this engine's lock is held.
    pub fn auto_align_with(
        &self,
        max_attempts: u32,
        detector: &RangeDetector,
    ) -> Result<AlignmentStatus, OpticalError> {
        let mut source = detector;
        self.auto_align(max_attempts, &mut source)
    }

    pub fn enable_adaptive_mode(&self) -> Result<(), OpticalError> {
        self.set_adaptive("enable_adaptive_mode", true)
    }

    pub fn disable_adaptive_mode(&self) -> Result<(), OpticalError> {
        self.set_adaptive("disable_adaptive_mode", false)
    }

    fn set_adaptive(&self, op: &'static str, on: bool) -> Result<(), OpticalError> {
        let mut inner = self.inner.lock();
        inner.require_initialized(op)?;
        if on {
            inner.adaptive = AdaptiveState::baseline(inner.intensity_pct, None);
        }
        inner.state = OpticalState::Initialized { adaptive: on };
        debug!(engine = %self.id, adaptive = on, "adaptive mode changed");
        Ok(())
    }

    /// Feeds one range sample to the adaptive controller.
    pub fn adaptive_tick(
        &self,
        sample: &Measurement,
        environment: &EnvironmentalConditions,
    ) -> Result<Option<AdaptiveEvent>, OpticalError> {
        environment.validate()?;
        let mut inner = self.inner.lock();
        inner.require(
            "adaptive_tick",
            inner.state == OpticalState::Initialized { adaptive: true },
        )?;
        let decision =
            adaptive::decide_next_state(&inner.adaptive, sample, environment, &inner.laser);
        match decision.event {
            Some(AdaptiveEvent::ProfileSwitched(category)) => {
                let profile = Arc::new(PowerProfile::for_range_category(category).compile()?);
                self.apply_output(&mut inner, &profile, decision.state.intensity_pct)?;
                info!(engine = %self.id, profile = category.as_str(), "power profile switched");
                inner.profile = profile;
                inner.ecc_parity = ecc::parity_for(category);
                inner.intensity_pct = decision.state.intensity_pct;
            }
            Some(AdaptiveEvent::IntensityRaised(pct))
            | Some(AdaptiveEvent::IntensityLowered(pct)) => {
                let profile = Arc::clone(&inner.profile);
                self.apply_output(&mut inner, &profile, pct)?;
                inner.intensity_pct = pct;
            }
            Some(AdaptiveEvent::ExitedDegradedSafe) => {
                let profile = Arc::clone(&inner.profile);
                self.apply_output(&mut inner, &profile, decision.state.intensity_pct)?;
                inner.intensity_pct = decision.state.intensity_pct;
                info!(engine = %self.id, "adaptive control resumed");
            }
            Some(AdaptiveEvent::EnteredDegradedSafe) => {
                inner.alignment.locked = false;
                warn!(
                    engine = %self.id,
                    strength = sample.signal_strength,
                    "signal lost; holding output"
                );
                self.events.publish(LinkEvent::AlignmentLost {
                    source: self.id,
                    signal_strength: sample.signal_strength,
                });
            }
            None => {}
        }
        inner.adaptive = decision.state;
        Ok(decision.event)
    }

    /// Samples `detector` (outside the engine lock) and runs one adaptive tick.
    /// Silence from the detector is fed in as a zero-strength sample.
    pub fn adaptive_tick_from(
        &self,
        detector: &RangeDetector,
    ) -> Result<Option<AdaptiveEvent>, OpticalError> {
        let sample = match detector.measure_distance_fast() {
            Ok(sample) => sample,
            Err(RangeError::NoSignal(_)) | Err(RangeError::Sensor(DriverFault::NoEcho)) => {
                Measurement {
                    distance_m: 0.0,
                    signal_strength: 0.0,
                    quality_score: 0.0,
                    timestamp_ms: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64,
                }
            }
            Err(err) => return Err(OpticalError::SignalSource(err.to_string())),
        };
        let environment = detector
            .environment()
            .map_err(|e| OpticalError::SignalSource(e.to_string()))?;
        self.adaptive_tick(&sample, &environment)
    }

    /// Validates and swaps the power profile, re-deriving the output level.
    pub fn update_power_profile(
        &self,
        profile: PowerProfile,
    ) -> Result<Arc<CompiledPowerProfile>, OpticalError> {
        let compiled = Arc::new(profile.compile()?);
        let mut inner = self.inner.lock();
        inner.require(
            "update_power_profile",
            matches!(inner.state, OpticalState::Created | OpticalState::Initialized { .. }),
        )?;
        let intensity = inner.intensity_pct;
        self.apply_output(&mut inner, &compiled, intensity)?;
        inner.profile = Arc::clone(&compiled);
        info!(engine = %self.id, profile = compiled.config_id(), "power profile updated");
        Ok(compiled)
    }

    pub fn current_power_profile(&self) -> Arc<CompiledPowerProfile> {
        Arc::clone(&self.inner.lock().profile)
    }

    /// Forces the laser off and latches emergency shutdown.
    ///
    /// # Guarantees
    /// * Succeeds in every state and may be repeated; the driver is told to
    ///   zero output on every call.
    /// * A shut-down engine stays `Shutdown`; the latch only applies to an
    ///   engine that can still be revived.
    pub fn emergency_shutdown(&self) -> Result<(), OpticalError> {
        let mut inner = self.inner.lock();
        match inner.state {
            OpticalState::Created | OpticalState::Initialized { .. } => {
                self.latch(&mut inner, "manual emergency shutdown".into());
            }
            OpticalState::EmergencyShutdown | OpticalState::Shutdown => {
                if let Err(fault) = inner.driver.set_power_mw(0.0) {
                    warn!(engine = %self.id, %fault, "laser refused repeated power-down");
                }
                inner.safety.set_output(0.0, Instant::now());
                debug!(engine = %self.id, state = %inner.state, "emergency shutdown repeated");
            }
        }
        Ok(())
    }

    /// Explicit reset path out of emergency shutdown, back to `Created`.
    /// Safety counters survive; clear them with
    /// [`OpticalBeamEngine::reset_energy_monitoring`].
    pub fn clear_emergency_latch(&self) -> Result<(), OpticalError> {
        let mut inner = self.inner.lock();
        if inner.state != OpticalState::EmergencyShutdown {
            return Err(OpticalError::WrongState {
                op: "clear_emergency_latch",
                state: inner.state,
            });
        }
        inner.safety.unlatch();
        inner.alignment.locked = false;
        inner.state = OpticalState::Created;
        info!(engine = %self.id, "emergency latch cleared");
        Ok(())
    }

    pub fn safety_stats(&self) -> SafetyStats {
        self.inner.lock().safety.stats(Instant::now())
    }

    pub fn reset_energy_monitoring(&self) -> Result<(), OpticalError> {
        let mut inner = self.inner.lock();
        inner.require(
            "reset_energy_monitoring",
            matches!(inner.state, OpticalState::Created | OpticalState::Initialized { .. }),
        )?;
        inner.safety.reset(Instant::now());
        debug!(engine = %self.id, "energy monitoring reset");
        Ok(())
    }

    pub fn alignment_status(&self) -> AlignmentStatus {
        self.inner.lock().alignment
    }

    pub fn channel_diagnostics(&self) -> OpticalDiagnostics {
        let inner = self.inner.lock();
        let limit = inner.limit_for(&inner.profile);
        let emitting = inner.state.is_initialized();
        OpticalDiagnostics {
            engine_id: self.id,
            state: inner.state,
            power_profile: inner.profile.profile().name.clone(),
            power_profile_id: inner.profile.config_id().to_string(),
            intensity_pct: inner.intensity_pct,
            output_power_mw: if emitting { inner.output_mw() } else { 0.0 },
            effective_limit_mw: limit,
            frames_sent: inner.frames_sent,
            frames_received: inner.lifetime.observed_frames(),
            frame_errors: inner.lifetime.corrupt_frames(),
            ecc_parity_shards: inner.ecc_parity,
            ecc_repaired_shards: inner.ecc_repaired,
            metrics: inner.lifetime.metrics(),
            degraded: inner.health.active_reason(),
            alignment: inner.alignment,
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Zeroes output and ends the engine.
    pub fn shutdown(&self) -> Result<(), OpticalError> {
        let mut inner = self.inner.lock();
        inner.require(
            "shutdown",
            matches!(inner.state, OpticalState::Created | OpticalState::Initialized { .. }),
        )?;
        if inner.state.is_initialized() {
            if let Err(fault) = inner.driver.set_power_mw(0.0) {
                warn!(engine = %self.id, %fault, "laser refused power-down during shutdown");
            }
        }
        inner.safety.set_output(0.0, Instant::now());
        inner.alignment.locked = false;
        inner.state = OpticalState::Shutdown;
        info!(engine = %self.id, "optical engine shut down");
        Ok(())
    }

    /// Checks and applies an output level for `profile`; commits nothing
    /// else. Only an initialized engine drives the laser.
    fn apply_output(
        &self,
        inner: &mut OpticalInner,
        profile: &CompiledPowerProfile,
        intensity_pct: f32,
    ) -> Result<(), OpticalError> {
        if !inner.state.is_initialized() {
            return Ok(());
        }
        let now = Instant::now();
        let limit = inner.limit_for(profile);
        let power = limit * intensity_pct / 100.0;
        if let Err(breach) = inner.safety.check(power, limit, now) {
            return Err(self.on_breach(inner, breach));
        }
        inner.driver.set_power_mw(power)?;
        inner.safety.set_output(power, now);
        Ok(())
    }

    fn on_breach(&self, inner: &mut OpticalInner, breach: safety::Breach) -> OpticalError {
        warn!(
            engine = %self.id,
            reason = %breach.reason,
            latched = breach.latched,
            "safety breach"
        );
        if breach.latched {
            self.latch(inner, breach.reason.clone());
        }
        OpticalError::SafetyTrip(breach.reason)
    }

    fn latch(&self, inner: &mut OpticalInner, reason: String) {
        if let Err(fault) = inner.driver.set_power_mw(0.0) {
            warn!(engine = %self.id, %fault, "laser refused power-down during emergency shutdown");
        }
        inner.safety.latch(reason.clone(), Instant::now());
        inner.alignment.locked = false;
        inner.state = OpticalState::EmergencyShutdown;
        warn!(engine = %self.id, %reason, "emergency shutdown latched");
        self.events.publish(LinkEvent::SafetyTrip {
            source: self.id,
            reason,
        });
    }

    fn evaluate_health(&self, inner: &mut OpticalInner) {
        match inner.health.feed(&inner.window, None) {
            Some(HealthEvent::Degraded(reason)) => {
                warn!(engine = %self.id, reason = reason.as_str(), "optical channel degraded");
                self.events.publish(LinkEvent::ChannelDegraded {
                    source: self.id,
                    reason: reason.as_str().into(),
                });
            }
            Some(HealthEvent::Recovered(_)) => {
                info!(engine = %self.id, "optical channel recovered");
                self.events.publish(LinkEvent::ChannelRecovered { source: self.id });
            }
            None => {}
        }
        if inner.window.observed_frames() + inner.window.corrupt_frames() >= HEALTH_WINDOW_FRAMES {
            inner.window = LinkConditions::new();
        }
    }
}

impl FrameTransport for OpticalBeamEngine {
    fn send_frame(&self, bytes: &[u8]) -> Result<(), String> {
        self.transmit_data(bytes).map_err(|e| e.to_string())
    }
}
