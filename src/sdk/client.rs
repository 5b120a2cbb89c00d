use std::sync::Arc;

use crate::acoustic::{
    AcousticBeamEngine, AcousticDiagnostics, Admission, BeamReception, BeamSignal, Waveform,
};
use crate::bounds;
use crate::channel::SecureChannel;
use crate::config::LinkConfig;
use crate::crypto::ChallengeAuthenticator;
use crate::error::LinkError;
use crate::events::{EventBus, LinkEvent, Subscription};
use crate::hal::{
    AcousticTransducer, HardwareCapabilities, HardwareProbe, LaserDriver, Modality, PhotonReceiver,
    RangingSensor,
};
use crate::optical::{
    AdaptiveEvent, AlignmentStatus, OpticalBeamEngine, OpticalDiagnostics, SafetyStats,
    SignalSource,
};
use crate::profile::{
    BeamConfig, CompiledBeamConfig, CompiledPowerProfile, PowerProfile, RangeCategory,
};
use crate::range::{
    EnvironmentalConditions, Measurement, RangeDetector, RangingConfig, MAX_AVERAGED_SAMPLES,
};
use crate::registry::{Handle, Registry};
use crate::session::{Base64QrCodec, PeerIdentity, QrCodec, Session, SessionState};

pub type SessionHandle = Handle<Session>;
pub type DetectorHandle = Handle<RangeDetector>;
pub type AcousticHandle = Handle<AcousticBeamEngine>;
pub type OpticalHandle = Handle<OpticalBeamEngine>;

/// Handle-based entry point over every session and engine on this host.
///
/// # Guarantees
/// * An unknown or destroyed handle fails with [`LinkError::InvalidHandle`]
///   and touches nothing.
/// * Numeric arguments are range-checked here, before any instance lock is
///   taken; a rejected call leaves the instance unchanged.
/// * Hardware is probed once, at construction. Engines refuse to initialize
///   when a modality they need is missing from that snapshot.
pub struct BeamLink {
    config: LinkConfig,
    capabilities: HardwareCapabilities,
    events: EventBus,
    qr: Arc<dyn QrCodec>,
    sessions: Registry<Session>,
    detectors: Registry<RangeDetector>,
    acoustic: Registry<AcousticBeamEngine>,
    optical: Registry<OpticalBeamEngine>,
}

impl std::fmt::Debug for BeamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeamLink")
            .field("capabilities", &self.capabilities)
            .field("sessions", &self.sessions.len())
            .field("detectors", &self.detectors.len())
            .field("acoustic", &self.acoustic.len())
            .field("optical", &self.optical.len())
            .finish()
    }
}

impl BeamLink {
    pub fn new(probe: &dyn HardwareProbe, config: LinkConfig) -> Result<Self, LinkError> {
        config.validate()?;
        let capabilities = probe.probe();
        tracing::info!(
            ultrasonic = capabilities.ultrasonic,
            laser = capabilities.laser,
            photodiode = capabilities.photodiode,
            camera = capabilities.camera,
            "hardware probed"
        );
        Ok(Self {
            config,
            capabilities,
            events: EventBus::new(),
            qr: Arc::new(Base64QrCodec),
            sessions: Registry::new(),
            detectors: Registry::new(),
            acoustic: Registry::new(),
            optical: Registry::new(),
        })
    }

    /// Swaps the QR text codec used by [`BeamLink::generate_qr_code`].
    pub fn with_qr_codec(mut self, codec: Arc<dyn QrCodec>) -> Self {
        self.qr = codec;
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Registers the single listener; a previous subscription stops receiving.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn capabilities(&self) -> &HardwareCapabilities {
        &self.capabilities
    }

    /// JSON descriptor of the probed hardware.
    pub fn capability_descriptor(&self) -> Result<String, LinkError> {
        self.capabilities
            .descriptor()
            .map_err(|e| LinkError::InvalidArgument(format!("capability descriptor: {e}")))
    }

    pub fn supports(&self, modality: Modality) -> bool {
        self.capabilities.supports(modality)
    }

    pub fn has_ultrasonic(&self) -> bool {
        self.supports(Modality::Ultrasonic)
    }

    pub fn has_laser(&self) -> bool {
        self.supports(Modality::Laser)
    }

    pub fn has_photodiode(&self) -> bool {
        self.supports(Modality::Photodiode)
    }

    pub fn has_camera(&self) -> bool {
        self.supports(Modality::Camera)
    }

    pub fn open_session(&self) -> SessionHandle {
        let session = Session::with_parts(
            crate::crypto::NodeCredentials::generate(),
            Arc::new(crate::crypto::ChaChaPolyCipher),
            self.config.audio_queue_depth,
        );
        self.sessions.insert(session)
    }

    /// Closes and forgets a session; its keys are wiped.
    pub fn destroy_session(&self, handle: SessionHandle) -> Result<(), LinkError> {
        let session = self.sessions.remove(handle).ok_or(LinkError::InvalidHandle)?;
        if !session.state().is_terminal() {
            session.close()?;
        }
        Ok(())
    }

    /// Current state; [`SessionState::Error`] for an invalid handle.
    pub fn session_state(&self, handle: SessionHandle) -> SessionState {
        self.sessions
            .get(handle)
            .map(|s| s.state())
            .unwrap_or(SessionState::Error)
    }

    pub fn initiate_handshake(&self, handle: SessionHandle) -> Result<[u8; 32], LinkError> {
        Ok(self.session(handle)?.initiate_handshake()?)
    }

    pub fn receive_nonce(&self, handle: SessionHandle, nonce: &[u8]) -> Result<String, LinkError> {
        bounds::check_payload("nonce", nonce)?;
        Ok(self.session(handle)?.receive_nonce(nonce)?)
    }

    pub fn qr_bootstrap_payload(&self, handle: SessionHandle) -> Result<Vec<u8>, LinkError> {
        Ok(self.session(handle)?.qr_bootstrap_payload()?)
    }

    pub fn process_qr_payload(
        &self,
        handle: SessionHandle,
        blob: &[u8],
    ) -> Result<PeerIdentity, LinkError> {
        bounds::check_nonempty_payload("qr payload", blob)?;
        Ok(self.session(handle)?.process_qr_payload(blob)?)
    }

    pub fn confirmation_tag(&self, handle: SessionHandle) -> Result<[u8; 32], LinkError> {
        Ok(self.session(handle)?.confirmation_tag()?)
    }

    pub fn receive_ack(&self, handle: SessionHandle) -> Result<(), LinkError> {
        let session = self.session(handle)?;
        session.receive_ack()?;
        self.events.publish(LinkEvent::SessionEstablished { session: session.id() });
        Ok(())
    }

    pub fn receive_ack_tag(&self, handle: SessionHandle, tag: &[u8]) -> Result<(), LinkError> {
        bounds::check_payload("ack tag", tag)?;
        let session = self.session(handle)?;
        session.receive_ack_tag(tag)?;
        self.events.publish(LinkEvent::SessionEstablished { session: session.id() });
        Ok(())
    }

    pub fn encrypt(&self, handle: SessionHandle, plaintext: &[u8]) -> Result<Vec<u8>, LinkError> {
        bounds::check_payload("plaintext", plaintext)?;
        Ok(self.session(handle)?.encrypt(plaintext)?)
    }

    pub fn decrypt(&self, handle: SessionHandle, ciphertext: &[u8]) -> Result<Vec<u8>, LinkError> {
        bounds::check_len("ciphertext", ciphertext, bounds::MAX_PAYLOAD_BYTES + 64)?;
        Ok(self.session(handle)?.decrypt(ciphertext)?)
    }

    pub fn close_session(&self, handle: SessionHandle) -> Result<(), LinkError> {
        Ok(self.session(handle)?.close()?)
    }

    /// Renders a bootstrap blob as printable QR text.
    pub fn generate_qr_code(&self, blob: &[u8]) -> Result<String, LinkError> {
        self.qr
            .encode(blob)
            .map_err(|e| LinkError::InvalidArgument(e.to_string()))
    }

    pub fn decode_qr_code(&self, text: &str) -> Result<Vec<u8>, LinkError> {
        self.qr
            .decode(text)
            .map_err(|e| LinkError::InvalidArgument(e.to_string()))
    }

    pub fn send_audio_data(
        &self,
        handle: SessionHandle,
        plaintext: &[u8],
    ) -> Result<(), LinkError> {
        bounds::check_nonempty_payload("audio plaintext", plaintext)?;
        Ok(self.session(handle)?.send_audio_data(plaintext)?)
    }

    pub fn receive_audio_data(&self, handle: SessionHandle) -> Result<Option<Vec<u8>>, LinkError> {
        Ok(self.session(handle)?.receive_audio_data()?)
    }

    pub fn is_receiving(&self, handle: SessionHandle) -> Result<bool, LinkError> {
        Ok(self.session(handle)?.is_receiving())
    }

    /// Moves a session's queued audio ciphertext onto an acoustic engine and
    /// emits it. Returns the number of frames handed over.
    pub fn pump_audio(
        &self,
        session: SessionHandle,
        engine: AcousticHandle,
    ) -> Result<usize, LinkError> {
        let channel = SecureChannel::new(self.session(session)?, self.acoustic_engine(engine)?);
        let handed = channel.pump()?;
        channel.transport().service_transmit_queue(usize::MAX)?;
        Ok(handed)
    }

    /// Feeds data frames an acoustic engine demodulated into a session's
    /// inbound queue. Other signal kinds are returned untouched.
    pub fn collect_audio(
        &self,
        session: SessionHandle,
        engine: AcousticHandle,
    ) -> Result<Vec<BeamReception>, LinkError> {
        let channel = SecureChannel::new(self.session(session)?, self.acoustic_engine(engine)?);
        let mut other = Vec::new();
        for reception in channel.transport().receive_beam_signals()? {
            match reception.signal {
                BeamSignal::Data { payload } => channel.accept(payload)?,
                _ => other.push(reception),
            }
        }
        Ok(other)
    }

    /// Creates a detector; `None` takes the link-wide ranging config.
    pub fn create_range_detector(
        &self,
        sensor: Box<dyn RangingSensor>,
        config: Option<RangingConfig>,
    ) -> Result<DetectorHandle, LinkError> {
        let config = config.unwrap_or_else(|| self.config.ranging.clone());
        let detector = RangeDetector::new(sensor, config)?;
        Ok(self.detectors.insert(detector))
    }

    pub fn destroy_range_detector(&self, handle: DetectorHandle) -> Result<(), LinkError> {
        self.detectors.remove(handle).map(|_| ()).ok_or(LinkError::InvalidHandle)
    }

    pub fn initialize_range_detector(&self, handle: DetectorHandle) -> Result<(), LinkError> {
        Ok(self.detector(handle)?.initialize(&self.capabilities)?)
    }

    pub fn measure_distance(&self, handle: DetectorHandle) -> Result<Measurement, LinkError> {
        Ok(self.detector(handle)?.measure_distance()?)
    }

    pub fn measure_distance_averaged(
        &self,
        handle: DetectorHandle,
        samples: i64,
    ) -> Result<Measurement, LinkError> {
        let samples = bounds::check_range("samples", samples, 1, MAX_AVERAGED_SAMPLES as i64)?;
        Ok(self.detector(handle)?.measure_distance_averaged(samples as u32)?)
    }

    pub fn measure_distance_fast(&self, handle: DetectorHandle) -> Result<Measurement, LinkError> {
        Ok(self.detector(handle)?.measure_distance_fast()?)
    }

    pub fn update_environmental_conditions(
        &self,
        handle: DetectorHandle,
        conditions: EnvironmentalConditions,
    ) -> Result<(), LinkError> {
        Ok(self.detector(handle)?.update_environmental_conditions(conditions)?)
    }

    pub fn environment(
        &self,
        handle: DetectorHandle,
    ) -> Result<EnvironmentalConditions, LinkError> {
        Ok(self.detector(handle)?.environment()?)
    }

    /// `None` until the detector has produced a measurement.
    pub fn current_range_category(
        &self,
        handle: DetectorHandle,
    ) -> Result<Option<RangeCategory>, LinkError> {
        Ok(self.detector(handle)?.current_range_category()?)
    }

    pub fn history_len(&self, handle: DetectorHandle) -> Result<usize, LinkError> {
        Ok(self.detector(handle)?.history_len()?)
    }

    pub fn history_get(
        &self,
        handle: DetectorHandle,
        index: i64,
    ) -> Result<Measurement, LinkError> {
        let index = bounds::check_range("index", index, 0, i64::from(u32::MAX))?;
        Ok(self.detector(handle)?.history_get(index as usize)?)
    }

    pub fn shutdown_range_detector(&self, handle: DetectorHandle) -> Result<(), LinkError> {
        Ok(self.detector(handle)?.shutdown()?)
    }

    /// Creates an engine; `None` takes the link-wide beam config.
    pub fn create_acoustic_engine(
        &self,
        transducer: Box<dyn AcousticTransducer>,
        config: Option<BeamConfig>,
    ) -> Result<AcousticHandle, LinkError> {
        let config = config.unwrap_or_else(|| self.config.beam.clone());
        let engine = AcousticBeamEngine::new(config, transducer, self.events.clone())?;
        Ok(self.acoustic.insert(engine))
    }

    pub fn destroy_acoustic_engine(&self, handle: AcousticHandle) -> Result<(), LinkError> {
        self.acoustic.remove(handle).map(|_| ()).ok_or(LinkError::InvalidHandle)
    }

    pub fn initialize_acoustic_engine(&self, handle: AcousticHandle) -> Result<(), LinkError> {
        Ok(self.acoustic_engine(handle)?.initialize(&self.capabilities)?)
    }

    pub fn generate_parametric_audio(
        &self,
        handle: AcousticHandle,
        payload: &[u8],
    ) -> Result<Waveform, LinkError> {
        bounds::check_payload("payload", payload)?;
        Ok(self.acoustic_engine(handle)?.generate_parametric_audio(payload)?)
    }

    pub fn transmit_sync_pulse(
        &self,
        handle: AcousticHandle,
        pattern: &[u8],
    ) -> Result<(), LinkError> {
        Ok(self.acoustic_engine(handle)?.transmit_sync_pulse(pattern)?)
    }

    pub fn transmit_auth_signal(
        &self,
        handle: AcousticHandle,
        challenge: &[u8],
        signature: &[u8],
    ) -> Result<(), LinkError> {
        Ok(self.acoustic_engine(handle)?.transmit_auth_signal(challenge, signature)?)
    }

    pub fn respond_to_challenge(
        &self,
        handle: AcousticHandle,
        challenge: &[u8],
        authenticator: &dyn ChallengeAuthenticator,
    ) -> Result<(), LinkError> {
        Ok(self.acoustic_engine(handle)?.respond_to_challenge(challenge, authenticator)?)
    }

    pub fn detect_presence(&self, handle: AcousticHandle) -> Result<bool, LinkError> {
        Ok(self.acoustic_engine(handle)?.detect_presence()?)
    }

    pub fn transmit_control_data(
        &self,
        handle: AcousticHandle,
        data: &[u8],
        priority: i64,
    ) -> Result<Admission, LinkError> {
        let priority = bounds::check_range("priority", priority, 0, 255)?;
        Ok(self.acoustic_engine(handle)?.transmit_control_data(data, priority as u8)?)
    }

    pub fn service_transmit_queue(
        &self,
        handle: AcousticHandle,
        max_frames: i64,
    ) -> Result<usize, LinkError> {
        let max_frames = bounds::check_range("max_frames", max_frames, 1, i64::from(u32::MAX))?;
        Ok(self.acoustic_engine(handle)?.service_transmit_queue(max_frames as usize)?)
    }

    pub fn receive_beam_signals(
        &self,
        handle: AcousticHandle,
    ) -> Result<Vec<BeamReception>, LinkError> {
        Ok(self.acoustic_engine(handle)?.receive_beam_signals()?)
    }

    pub fn acoustic_config(
        &self,
        handle: AcousticHandle,
    ) -> Result<Arc<CompiledBeamConfig>, LinkError> {
        Ok(self.acoustic_engine(handle)?.config())
    }

    pub fn update_acoustic_config(
        &self,
        handle: AcousticHandle,
        config: BeamConfig,
    ) -> Result<Arc<CompiledBeamConfig>, LinkError> {
        Ok(self.acoustic_engine(handle)?.update_config(config)?)
    }

    pub fn acoustic_diagnostics(
        &self,
        handle: AcousticHandle,
    ) -> Result<AcousticDiagnostics, LinkError> {
        Ok(self.acoustic_engine(handle)?.channel_diagnostics())
    }

    pub fn shutdown_acoustic_engine(&self, handle: AcousticHandle) -> Result<(), LinkError> {
        Ok(self.acoustic_engine(handle)?.shutdown()?)
    }

    /// Creates an engine from CBOR laser and reception blobs; both must be
    /// non-empty and valid or no engine is created.
    pub fn create_optical_engine(
        &self,
        laser_config: &[u8],
        reception_config: &[u8],
        driver: Box<dyn LaserDriver>,
        receiver: Box<dyn PhotonReceiver>,
    ) -> Result<OpticalHandle, LinkError> {
        bounds::check_payload("laser config", laser_config)?;
        bounds::check_payload("reception config", reception_config)?;
        let engine = OpticalBeamEngine::from_cbor(
            laser_config,
            reception_config,
            driver,
            receiver,
            self.events.clone(),
        )?;
        Ok(self.optical.insert(engine))
    }

    pub fn destroy_optical_engine(&self, handle: OpticalHandle) -> Result<(), LinkError> {
        self.optical.remove(handle).map(|_| ()).ok_or(LinkError::InvalidHandle)
    }

    pub fn initialize_optical_engine(&self, handle: OpticalHandle) -> Result<(), LinkError> {
        Ok(self.optical_engine(handle)?.initialize(&self.capabilities)?)
    }

    pub fn transmit_data(&self, handle: OpticalHandle, data: &[u8]) -> Result<(), LinkError> {
        bounds::check_nonempty_payload("optical payload", data)?;
        Ok(self.optical_engine(handle)?.transmit_data(data)?)
    }

    /// Waits at most `timeout_ms` (0..=30000) for one inbound frame.
    pub async fn receive_data(
        &self,
        handle: OpticalHandle,
        timeout_ms: i64,
    ) -> Result<Vec<u8>, LinkError> {
        let timeout_ms = bounds::check_range(
            "timeout_ms",
            timeout_ms,
            0,
            i64::from(crate::optical::MAX_RECEIVE_TIMEOUT_MS),
        )?;
        let engine = self.optical_engine(handle)?;
        Ok(engine.receive_data(timeout_ms as u32).await?)
    }

    pub fn set_intensity(
        &self,
        handle: OpticalHandle,
        intensity_pct: f64,
    ) -> Result<(), LinkError> {
        let intensity = wide_f32("intensity", intensity_pct, 0.0, 100.0)?;
        Ok(self.optical_engine(handle)?.set_intensity(intensity)?)
    }

    pub fn set_alignment_target(
        &self,
        handle: OpticalHandle,
        x: f64,
        y: f64,
    ) -> Result<(), LinkError> {
        let x = wide_f32("target_x", x, -1.0, 1.0)?;
        let y = wide_f32("target_y", y, -1.0, 1.0)?;
        Ok(self.optical_engine(handle)?.set_alignment_target(x, y)?)
    }

    /// Aligns using fast samples from a detector as the error signal.
    pub fn auto_align(
        &self,
        handle: OpticalHandle,
        max_attempts: i64,
        detector: DetectorHandle,
    ) -> Result<AlignmentStatus, LinkError> {
        let max_attempts = check_attempts(max_attempts)?;
        let engine = self.optical_engine(handle)?;
        let detector = self.detector(detector)?;
        Ok(engine.auto_align_with(max_attempts, &detector)?)
    }

    /// Aligns using a caller-supplied strength source.
    pub fn auto_align_with_source(
        &self,
        handle: OpticalHandle,
        max_attempts: i64,
        source: &mut dyn SignalSource,
    ) -> Result<AlignmentStatus, LinkError> {
        let max_attempts = check_attempts(max_attempts)?;
        Ok(self.optical_engine(handle)?.auto_align(max_attempts, source)?)
    }

    pub fn enable_adaptive_mode(&self, handle: OpticalHandle) -> Result<(), LinkError> {
        Ok(self.optical_engine(handle)?.enable_adaptive_mode()?)
    }

    pub fn disable_adaptive_mode(&self, handle: OpticalHandle) -> Result<(), LinkError> {
        Ok(self.optical_engine(handle)?.disable_adaptive_mode()?)
    }

    /// One adaptive control step fed by a fresh detector sample.
    pub fn adaptive_tick(
        &self,
        handle: OpticalHandle,
        detector: DetectorHandle,
    ) -> Result<Option<AdaptiveEvent>, LinkError> {
        let engine = self.optical_engine(handle)?;
        let detector = self.detector(detector)?;
        Ok(engine.adaptive_tick_from(&detector)?)
    }

    pub fn update_power_profile(
        &self,
        handle: OpticalHandle,
        profile: PowerProfile,
    ) -> Result<Arc<CompiledPowerProfile>, LinkError> {
        Ok(self.optical_engine(handle)?.update_power_profile(profile)?)
    }

    pub fn current_power_profile(
        &self,
        handle: OpticalHandle,
    ) -> Result<Arc<CompiledPowerProfile>, LinkError> {
        Ok(self.optical_engine(handle)?.current_power_profile())
    }

    pub fn emergency_shutdown(&self, handle: OpticalHandle) -> Result<(), LinkError> {
        Ok(self.optical_engine(handle)?.emergency_shutdown()?)
    }

    pub fn clear_emergency_latch(&self, handle: OpticalHandle) -> Result<(), LinkError> {
        Ok(self.optical_engine(handle)?.clear_emergency_latch()?)
    }

    pub fn safety_stats(&self, handle: OpticalHandle) -> Result<SafetyStats, LinkError> {
        Ok(self.optical_engine(handle)?.safety_stats())
    }

    pub fn reset_energy_monitoring(&self, handle: OpticalHandle) -> Result<(), LinkError> {
        Ok(self.optical_engine(handle)?.reset_energy_monitoring()?)
    }

    pub fn alignment_status(&self, handle: OpticalHandle) -> Result<AlignmentStatus, LinkError> {
        Ok(self.optical_engine(handle)?.alignment_status())
    }

    pub fn optical_diagnostics(
        &self,
        handle: OpticalHandle,
    ) -> Result<OpticalDiagnostics, LinkError> {
        Ok(self.optical_engine(handle)?.channel_diagnostics())
    }

    pub fn shutdown_optical_engine(&self, handle: OpticalHandle) -> Result<(), LinkError> {
        Ok(self.optical_engine(handle)?.shutdown()?)
    }

    fn session(&self, handle: SessionHandle) -> Result<Arc<Session>, LinkError> {
        self.sessions.get(handle).ok_or(LinkError::InvalidHandle)
    }

    fn detector(&self, handle: DetectorHandle) -> Result<Arc<RangeDetector>, LinkError> {
        self.detectors.get(handle).ok_or(LinkError::InvalidHandle)
    }

    fn acoustic_engine(
        &self,
        handle: AcousticHandle,
    ) -> Result<Arc<AcousticBeamEngine>, LinkError> {
        self.acoustic.get(handle).ok_or(LinkError::InvalidHandle)
    }

    fn optical_engine(&self, handle: OpticalHandle) -> Result<Arc<OpticalBeamEngine>, LinkError> {
        self.optical.get(handle).ok_or(LinkError::InvalidHandle)
    }
}

fn check_attempts(max_attempts: i64) -> Result<u32, LinkError> {
    let max_attempts = bounds::check_range(
        "max_attempts",
        max_attempts,
        1,
        i64::from(crate::optical::MAX_ALIGNMENT_ATTEMPTS),
    )?;
    Ok(max_attempts as u32)
}

/// Narrows a boundary float after the range check so rounding cannot move
/// it across a bound.
fn wide_f32(what: &'static str, value: f64, min: f32, max: f32) -> Result<f32, LinkError> {
    if !value.is_finite() {
        return Err(bounds::BoundsError::NotFinite { what }.into());
    }
    bounds::check_range(what, value, f64::from(min), f64::from(max))?;
    Ok(value as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::loopback::{SimulatedLaser, SimulatedTarget};
    use crate::hal::StaticProbe;

    fn link() -> BeamLink {
        BeamLink::new(&StaticProbe::full(), LinkConfig::default()).unwrap()
    }

    #[test]
    fn stale_handles_fail_without_effect() {
        let link = link();
        let handle = link.open_session();
        link.destroy_session(handle).unwrap();
        assert_eq!(link.session_state(handle), SessionState::Error);
        assert_eq!(link.initiate_handshake(handle), Err(LinkError::InvalidHandle));
        assert_eq!(link.destroy_session(handle), Err(LinkError::InvalidHandle));
        let fresh = link.open_session();
        assert_eq!(link.session_state(fresh), SessionState::Idle);
        assert_eq!(link.session_state(handle), SessionState::Error);
    }

    #[test]
    fn wide_numbers_are_checked_first() {
        let link = link();
        let detector = link
            .create_range_detector(Box::new(SimulatedTarget::new(40.0, 0.9)), None)
            .unwrap();
        link.initialize_range_detector(detector).unwrap();
        assert!(matches!(
            link.measure_distance_averaged(detector, 0),
            Err(LinkError::InvalidArgument(_))
        ));
        assert!(matches!(
            link.measure_distance_averaged(detector, 1001),
            Err(LinkError::InvalidArgument(_))
        ));
        assert!(link.measure_distance_averaged(detector, 5).is_ok());
        assert!(matches!(link.history_get(detector, -1), Err(LinkError::InvalidArgument(_))));
    }

    #[test]
    fn missing_modality_blocks_initialize() {
        let probe = StaticProbe::new(HardwareCapabilities {
            ultrasonic: true,
            ..Default::default()
        });
        let link = BeamLink::new(&probe, LinkConfig::default()).unwrap();
        assert!(!link.has_laser());
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let engine = link
            .create_optical_engine(
                &crate::optical::LaserConfig::default().to_cbor().unwrap(),
                &crate::optical::ReceptionConfig::default().to_cbor().unwrap(),
                Box::new(SimulatedLaser::new()),
                Box::new(rx),
            )
            .unwrap();
        assert!(matches!(
            link.initialize_optical_engine(engine),
            Err(LinkError::HardwareUnavailable(_))
        ));
        let descriptor = link.capability_descriptor().unwrap();
        let decoded = HardwareCapabilities::from_descriptor(&descriptor).unwrap();
        assert_eq!(decoded, *link.capabilities());
    }

    #[test]
    fn intensity_outside_bounds_is_rejected() {
        let link = link();
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let engine = link
            .create_optical_engine(
                &crate::optical::LaserConfig::default().to_cbor().unwrap(),
                &crate::optical::ReceptionConfig::default().to_cbor().unwrap(),
                Box::new(SimulatedLaser::new()),
                Box::new(rx),
            )
            .unwrap();
        link.initialize_optical_engine(engine).unwrap();
        link.set_intensity(engine, 30.0).unwrap();
        assert!(link.set_intensity(engine, -1.0).is_err());
        assert!(link.set_intensity(engine, 101.0).is_err());
        assert!(link.set_intensity(engine, f64::NAN).is_err());
        assert_eq!(link.optical_diagnostics(engine).unwrap().intensity_pct, 30.0);
        link.set_intensity(engine, 0.0).unwrap();
        link.set_intensity(engine, 100.0).unwrap();
    }
}
