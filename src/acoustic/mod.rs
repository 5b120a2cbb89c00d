//! Ultrasonic beam engine.
//!
//! Frames leave through a priority queue, are FEC-coded and keyed onto the
//! parametric carriers, and come back in through the transducer's
//! demodulator. The engine owns its transducer; one instance is driven by one
//! caller at a time.
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bounds::{self, BoundsError};
use crate::channel::FrameTransport;
use crate::crypto::ChallengeAuthenticator;
use crate::events::{EventBus, LinkEvent};
use crate::framing::{FrameCodec, FrameKind, RawFrame};
use crate::hal::{AcousticTransducer, DriverFault, HardwareCapabilities, Modality};
use crate::health::{DegradeReason, HealthEvent, HealthMonitor};
use crate::link_quality::{LinkConditions, LinkMetrics, SequenceUnwrapper};
use crate::profile::{BeamConfig, CompiledBeamConfig, ProfileError};

pub mod modulation;
pub mod queue;

pub use modulation::Waveform;
pub use queue::{Admission, TransmitQueue, DATA_PRIORITY, DEFAULT_QUEUE_CAPACITY};

pub const MAX_SYNC_PATTERN: usize = 16;
pub const MAX_CONTROL_DATA: usize = 32;
pub const MAX_AUTH_CHALLENGE: usize = 64;
pub const AUTH_SIGNATURE_LEN: usize = 64;
/// Largest payload one ultrasonic frame carries. Every payload byte becomes
/// 14 coded symbols of carrier samples, so this also bounds one waveform.
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024;
/// Frames per health evaluation window.
const HEALTH_WINDOW_FRAMES: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcousticState {
    Created,
    Initialized,
    Shutdown,
}

impl fmt::Display for AcousticState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcousticState::Created => "created",
            AcousticState::Initialized => "initialized",
            AcousticState::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcousticError {
    #[error("{op} not allowed in state {state}")]
    WrongState {
        op: &'static str,
        state: AcousticState,
    },
    #[error(transparent)]
    Bounds(#[from] BoundsError),
    #[error("beam config: {0}")]
    Profile(#[from] ProfileError),
    #[error("transducer: {0}")]
    Transducer(#[from] DriverFault),
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("transmit queue full")]
    QueueFull,
}

/// A frame recovered from the beam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BeamSignal {
    Data { payload: Vec<u8> },
    Sync { pattern: Vec<u8> },
    Auth { challenge: Vec<u8>, signature: Vec<u8> },
    Control { priority: u8, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BeamReception {
    pub seq: u64,
    pub signal: BeamSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcousticDiagnostics {
    pub engine_id: Uuid,
    pub state: AcousticState,
    pub config_id: String,
    pub carrier_hz: f32,
    pub power_level: f32,
    pub range_m: f32,
    pub presence_detected: bool,
    pub snr_db: Option<f32>,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frame_errors: u64,
    pub queued_frames: usize,
    pub metrics: LinkMetrics,
    pub degraded: Option<DegradeReason>,
    pub uptime_ms: u64,
}

struct AcousticInner {
    state: AcousticState,
    config: Arc<CompiledBeamConfig>,
    transducer: Box<dyn AcousticTransducer>,
    codec: FrameCodec,
    rx_buf: BytesMut,
    tx_queue: TransmitQueue,
    tx_seq: u16,
    rx_seq: SequenceUnwrapper,
    lifetime: LinkConditions,
    window: LinkConditions,
    health: HealthMonitor,
    presence: bool,
    snr_db: Option<f32>,
    frames_sent: u64,
}

impl AcousticInner {
    fn require(&self, op: &'static str, ok: bool) -> Result<(), AcousticError> {
        if ok {
            Ok(())
        } else {
            Err(AcousticError::WrongState {
                op,
                state: self.state,
            })
        }
    }

    fn require_initialized(&self, op: &'static str) -> Result<(), AcousticError> {
        self.require(op, self.state == AcousticState::Initialized)
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.tx_seq;
        self.tx_seq = self.tx_seq.wrapping_add(1);
        seq
    }

    fn emit_now(&mut self, kind: FrameKind, payload: Vec<u8>) -> Result<(), AcousticError> {
        let seq = self.tx_seq;
        let bytes = encode(&mut self.codec, RawFrame::new(kind, seq, payload))?;
        let wave = modulation::synthesize(&self.config, &bytes);
        self.transducer.emit(&wave.samples)?;
        self.next_seq();
        self.frames_sent += 1;
        Ok(())
    }

    fn enqueue(
        &mut self,
        priority: u8,
        kind: FrameKind,
        payload: Vec<u8>,
    ) -> Result<Admission, AcousticError> {
        let seq = self.tx_seq;
        match self.tx_queue.push(priority, RawFrame::new(kind, seq, payload)) {
            Admission::Rejected => Err(AcousticError::QueueFull),
            admitted => {
                self.next_seq();
                Ok(admitted)
            }
        }
    }

    fn sample_snr(&mut self) -> Result<(f32, Option<f32>), AcousticError> {
        let energy = self.transducer.carrier_energy()?;
        let noise = self.transducer.noise_floor()?;
        let snr = if energy > 0.0 && noise > 0.0 {
            Some(10.0 * (energy / noise).log10())
        } else {
            None
        };
        Ok((energy, snr))
    }
}

fn encode(codec: &mut FrameCodec, frame: RawFrame) -> Result<Vec<u8>, AcousticError> {
    let len = frame.payload.len();
    codec.encode_to_vec(frame).map_err(|_| {
        AcousticError::Bounds(BoundsError::TooLarge {
            what: "frame payload",
            limit: MAX_FRAME_PAYLOAD,
            len,
        })
    })
}

fn parse_signal(frame: RawFrame) -> Option<BeamSignal> {
    match frame.kind {
        FrameKind::Data => Some(BeamSignal::Data {
            payload: frame.payload,
        }),
        FrameKind::Sync => Some(BeamSignal::Sync {
            pattern: frame.payload,
        }),
        FrameKind::Control => {
            let (&priority, data) = frame.payload.split_first()?;
            Some(BeamSignal::Control {
                priority,
                data: data.to_vec(),
            })
        }
        FrameKind::Auth => {
            let (&len, rest) = frame.payload.split_first()?;
            let len = len as usize;
            if len == 0 || rest.len() != len + AUTH_SIGNATURE_LEN {
                return None;
            }
            let (challenge, signature) = rest.split_at(len);
            Some(BeamSignal::Auth {
                challenge: challenge.to_vec(),
                signature: signature.to_vec(),
            })
        }
    }
}

/// Covert ultrasonic channel.
///
/// # Guarantees
/// * Every operation is all-or-nothing; a transducer fault leaves queues,
///   counters and state as they were.
/// * Higher-priority frames always leave before lower-priority ones still queued.
pub struct AcousticBeamEngine {
    id: Uuid,
    events: EventBus,
    started: Instant,
    inner: Mutex<AcousticInner>,
}

impl fmt::Debug for AcousticBeamEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcousticBeamEngine")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl AcousticBeamEngine {
    pub fn new(
        config: BeamConfig,
        transducer: Box<dyn AcousticTransducer>,
        events: EventBus,
    ) -> Result<Self, AcousticError> {
        let config = config.compile()?;
        let snr_floor = config.config().snr_threshold_db;
        Ok(Self {
            id: Uuid::new_v4(),
            events,
            started: Instant::now(),
            inner: Mutex::new(AcousticInner {
                state: AcousticState::Created,
                config: Arc::new(config),
                transducer,
                codec: FrameCodec::new(MAX_FRAME_PAYLOAD),
                rx_buf: BytesMut::new(),
                tx_queue: TransmitQueue::new(DEFAULT_QUEUE_CAPACITY),
                tx_seq: 0,
                rx_seq: SequenceUnwrapper::new(),
                lifetime: LinkConditions::new(),
                window: LinkConditions::new(),
                health: HealthMonitor::new(snr_floor),
                presence: false,
                snr_db: None,
                frames_sent: 0,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> AcousticState {
        self.inner.lock().state
    }

    /// `Created -> Initialized`; refuses when the host has no ultrasonic path.
    pub fn initialize(&self, caps: &HardwareCapabilities) -> Result<(), AcousticError> {
        let mut inner = self.inner.lock();
        inner.require("initialize", inner.state == AcousticState::Created)?;
        caps.require(Modality::Ultrasonic)
            .map_err(AcousticError::HardwareUnavailable)?;
        if let Some(max) = caps.max_sample_rate_hz {
            let wanted = inner.config.config().sample_rate_hz;
            if wanted > max {
                return Err(AcousticError::HardwareUnavailable(format!(
                    "sample rate {wanted} Hz above device maximum {max} Hz"
                )));
            }
        }
        inner.transducer.noise_floor()?;
        inner.state = AcousticState::Initialized;
        info!(engine = %self.id, config = inner.config.config_id(), "acoustic engine initialized");
        Ok(())
    }

    /// Encodes `payload` as a data frame and renders its carrier waveform
    /// without emitting it. Payloads above [`MAX_FRAME_PAYLOAD`] are refused
    /// before anything is allocated.
    pub fn generate_parametric_audio(&self, payload: &[u8]) -> Result<Waveform, AcousticError> {
        bounds::check_len("payload", payload, MAX_FRAME_PAYLOAD)?;
        let mut inner = self.inner.lock();
        inner.require("generate_parametric_audio", inner.state != AcousticState::Shutdown)?;
        let bytes = encode(&mut inner.codec, RawFrame::new(FrameKind::Data, 0, payload.to_vec()))?;
        Ok(modulation::synthesize(&inner.config, &bytes))
    }

    /// Emits a clock-recovery preamble ahead of the queue.
    pub fn transmit_sync_pulse(&self, pattern: &[u8]) -> Result<(), AcousticError> {
        bounds::check_nonempty_payload("sync pattern", pattern)?;
        bounds::check_len("sync pattern", pattern, MAX_SYNC_PATTERN)?;
        let mut inner = self.inner.lock();
        inner.require_initialized("transmit_sync_pulse")?;
        inner.emit_now(FrameKind::Sync, pattern.to_vec())
    }

    /// Emits a proximity challenge/response pair ahead of the queue.
    pub fn transmit_auth_signal(
        &self,
        challenge: &[u8],
        signature: &[u8],
    ) -> Result<(), AcousticError> {
        bounds::check_nonempty_payload("auth challenge", challenge)?;
        bounds::check_len("auth challenge", challenge, MAX_AUTH_CHALLENGE)?;
        if signature.len() != AUTH_SIGNATURE_LEN {
            return Err(AcousticError::Bounds(BoundsError::OutOfRange {
                what: "auth signature length",
                min: AUTH_SIGNATURE_LEN.to_string(),
                max: AUTH_SIGNATURE_LEN.to_string(),
                value: signature.len().to_string(),
            }));
        }
        let mut payload = Vec::with_capacity(1 + challenge.len() + signature.len());
        payload.push(challenge.len() as u8);
        payload.extend_from_slice(challenge);
        payload.extend_from_slice(signature);
        let mut inner = self.inner.lock();
        inner.require_initialized("transmit_auth_signal")?;
        inner.emit_now(FrameKind::Auth, payload)
    }

    /// Signs `challenge` with `authenticator` and emits the pair.
    pub fn respond_to_challenge(
        &self,
        challenge: &[u8],
        authenticator: &dyn ChallengeAuthenticator,
    ) -> Result<(), AcousticError> {
        let signature = authenticator.sign_challenge(challenge);
        self.transmit_auth_signal(challenge, &signature)
    }

    /// Passive listen for peer carrier energy. Publishes presence edges.
    pub fn detect_presence(&self) -> Result<bool, AcousticError> {
        let mut inner = self.inner.lock();
        inner.require_initialized("detect_presence")?;
        let (energy, snr) = inner.sample_snr()?;
        inner.snr_db = snr;
        let present = energy >= inner.config.config().presence_threshold;
        if present != inner.presence {
            inner.presence = present;
            let event = if present {
                LinkEvent::PresenceDetected {
                    source: self.id,
                    energy,
                }
            } else {
                LinkEvent::PresenceLost { source: self.id }
            };
            debug!(engine = %self.id, present, energy, "presence changed");
            self.events.publish(event);
        }
        Ok(present)
    }

    /// Queues a control-plane message; higher `priority` leaves first.
    pub fn transmit_control_data(
        &self,
        data: &[u8],
        priority: u8,
    ) -> Result<Admission, AcousticError> {
        bounds::check_nonempty_payload("control data", data)?;
        bounds::check_len("control data", data, MAX_CONTROL_DATA)?;
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(priority);
        payload.extend_from_slice(data);
        let mut inner = self.inner.lock();
        inner.require_initialized("transmit_control_data")?;
        let admission = inner.enqueue(priority, FrameKind::Control, payload)?;
        if let Admission::Preempted(evicted) = admission {
            warn!(engine = %self.id, evicted, priority, "control frame preempted queued frame");
        }
        Ok(admission)
    }

    /// Queues an opaque data frame at [`DATA_PRIORITY`]; at most
    /// [`MAX_FRAME_PAYLOAD`] bytes.
    pub fn enqueue_data(&self, payload: &[u8]) -> Result<Admission, AcousticError> {
        bounds::check_nonempty_payload("data payload", payload)?;
        bounds::check_len("data payload", payload, MAX_FRAME_PAYLOAD)?;
        let mut inner = self.inner.lock();
        inner.require_initialized("enqueue_data")?;
        inner.enqueue(DATA_PRIORITY, FrameKind::Data, payload.to_vec())
    }

    /// Emits up to `max_frames` queued frames, highest priority first.
    ///
    /// A transducer fault puts the failed frame back in its place and is
    /// returned; frames already emitted stay emitted.
    pub fn service_transmit_queue(&self, max_frames: usize) -> Result<usize, AcousticError> {
        let mut inner = self.inner.lock();
        inner.require_initialized("service_transmit_queue")?;
        let mut sent = 0;
        while sent < max_frames {
            let Some(queued) = inner.tx_queue.pop() else {
                break;
            };
            let bytes = match encode(&mut inner.codec, queued.frame.clone()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    inner.tx_queue.restore(queued);
                    return Err(err);
                }
            };
            let wave = modulation::synthesize(&inner.config, &bytes);
            if let Err(fault) = inner.transducer.emit(&wave.samples) {
                inner.tx_queue.restore(queued);
                warn!(engine = %self.id, %fault, "transducer refused frame");
                return Err(fault.into());
            }
            inner.frames_sent += 1;
            sent += 1;
        }
        Ok(sent)
    }

    /// Drains and decodes everything the demodulator recovered.
    pub fn receive_beam_signals(&self) -> Result<Vec<BeamReception>, AcousticError> {
        let mut inner = self.inner.lock();
        inner.require_initialized("receive_beam_signals")?;
        let (_, snr) = inner.sample_snr()?;
        let bytes = inner.transducer.read_demodulated()?;
        let inner = &mut *inner;
        inner.snr_db = snr;
        inner.rx_buf.extend_from_slice(&bytes);

        let arrival_us = self.started.elapsed().as_micros() as u64;
        let mut received = Vec::new();
        let mut malformed = 0u64;
        while let Ok(Some(frame)) = inner.codec.decode(&mut inner.rx_buf) {
            let seq = inner.rx_seq.extend(frame.seq);
            match parse_signal(frame) {
                Some(signal) => {
                    inner.lifetime.record_frame(seq, arrival_us);
                    inner.window.record_frame(seq, arrival_us);
                    received.push(BeamReception { seq, signal });
                }
                None => malformed += 1,
            }
        }
        let corrupt = inner.codec.take_corrupt() + malformed;
        if corrupt > 0 {
            inner.lifetime.record_corrupt(corrupt);
            inner.window.record_corrupt(corrupt);
            debug!(engine = %self.id, corrupt, "discarded corrupt frames");
        }
        if !received.is_empty() || corrupt > 0 {
            self.evaluate_health(inner);
        }
        Ok(received)
    }

    fn evaluate_health(&self, inner: &mut AcousticInner) {
        match inner.health.feed(&inner.window, inner.snr_db) {
            Some(HealthEvent::Degraded(reason)) => {
                warn!(engine = %self.id, reason = reason.as_str(), "acoustic channel degraded");
                self.events.publish(LinkEvent::ChannelDegraded {
                    source: self.id,
                    reason: reason.as_str().into(),
                });
            }
            Some(HealthEvent::Recovered(reason)) => {
                info!(engine = %self.id, reason = reason.as_str(), "acoustic channel recovered");
                self.events.publish(LinkEvent::ChannelRecovered { source: self.id });
            }
            None => {}
        }
        if inner.window.observed_frames() + inner.window.corrupt_frames() >= HEALTH_WINDOW_FRAMES {
            inner.window = LinkConditions::new();
        }
    }

    pub fn config(&self) -> Arc<CompiledBeamConfig> {
        Arc::clone(&self.inner.lock().config)
    }

    /// Validates and swaps the carrier plan; the prior one stays on failure.
    pub fn update_config(
        &self,
        config: BeamConfig,
    ) -> Result<Arc<CompiledBeamConfig>, AcousticError> {
        let compiled = Arc::new(config.compile()?);
        let mut inner = self.inner.lock();
        inner.require("update_config", inner.state != AcousticState::Shutdown)?;
        inner.health.set_snr_floor(compiled.config().snr_threshold_db);
        inner.config = Arc::clone(&compiled);
        info!(engine = %self.id, config = compiled.config_id(), "beam config updated");
        Ok(compiled)
    }

    pub fn channel_diagnostics(&self) -> AcousticDiagnostics {
        let inner = self.inner.lock();
        let cfg = inner.config.config();
        AcousticDiagnostics {
            engine_id: self.id,
            state: inner.state,
            config_id: inner.config.config_id().to_string(),
            carrier_hz: cfg.fundamental_hz.first().copied().unwrap_or_default(),
            power_level: cfg.power_level,
            range_m: cfg.range_m,
            presence_detected: inner.presence,
            snr_db: inner.snr_db,
            frames_sent: inner.frames_sent,
            frames_received: inner.lifetime.observed_frames(),
            frame_errors: inner.lifetime.corrupt_frames(),
            queued_frames: inner.tx_queue.len(),
            metrics: inner.lifetime.metrics(),
            degraded: inner.health.active_reason(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Releases queues and buffers; fails if already shut down.
    pub fn shutdown(&self) -> Result<(), AcousticError> {
        let mut inner = self.inner.lock();
        inner.require("shutdown", inner.state != AcousticState::Shutdown)?;
        inner.tx_queue.clear();
        inner.rx_buf.clear();
        inner.presence = false;
        inner.state = AcousticState::Shutdown;
        info!(engine = %self.id, "acoustic engine shut down");
        Ok(())
    }
}

impl FrameTransport for AcousticBeamEngine {
    fn send_frame(&self, bytes: &[u8]) -> Result<(), String> {
        self.enqueue_data(bytes).map(|_| ()).map_err(|e| e.to_string())
    }
}
