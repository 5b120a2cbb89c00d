//! In-process helpers that bring peers to `Established` without a physical
//! channel. Used by integration tests and benches.
use crate::acoustic::AcousticBeamEngine;
use crate::events::EventBus;
use crate::hal::loopback::{AcousticMedium, LoopbackTransducer};
use crate::hal::HardwareCapabilities;
use crate::profile::BeamConfig;
use crate::session::{Base64QrCodec, QrCodec, Session, SessionError};

/// Runs the nonce exchange and explicit key confirmation in both directions.
pub fn establish_pair() -> Result<(Session, Session), SessionError> {
    let alice = Session::new();
    let bob = Session::new();
    let alice_public = alice.initiate_handshake()?;
    let bob_public = bob.initiate_handshake()?;
    alice.receive_nonce(&bob_public)?;
    bob.receive_nonce(&alice_public)?;
    let alice_tag = alice.confirmation_tag()?;
    let bob_tag = bob.confirmation_tag()?;
    alice.receive_ack_tag(&bob_tag)?;
    bob.receive_ack_tag(&alice_tag)?;
    Ok((alice, bob))
}

/// Same as [`establish_pair`] but the initiator learns the responder's public
/// value from its printed QR bootstrap text instead of the nonce exchange.
pub fn establish_pair_via_qr() -> Result<(Session, Session), SessionError> {
    let alice = Session::new();
    let bob = Session::new();
    let alice_public = alice.initiate_handshake()?;
    bob.initiate_handshake()?;
    let text = Base64QrCodec
        .encode(&bob.qr_bootstrap_payload()?)
        .map_err(|e| SessionError::InvalidArgument(e.to_string()))?;
    let blob = Base64QrCodec
        .decode(&text)
        .map_err(|e| SessionError::InvalidArgument(e.to_string()))?;
    alice.process_qr_payload(&blob)?;
    bob.receive_nonce(&alice_public)?;
    let alice_tag = alice.confirmation_tag()?;
    let bob_tag = bob.confirmation_tag()?;
    alice.receive_ack_tag(&bob_tag)?;
    bob.receive_ack_tag(&alice_tag)?;
    Ok((alice, bob))
}

/// Two initialized acoustic engines joined by an in-memory medium.
pub fn acoustic_pair(
    events: &EventBus,
) -> Result<
    (AcousticBeamEngine, AcousticBeamEngine, AcousticMedium),
    crate::acoustic::AcousticError,
> {
    let config = BeamConfig::default().compile()?;
    let (left, right, medium) = LoopbackTransducer::pair(config.samples_per_symbol());
    let a = AcousticBeamEngine::new(config.config().clone(), Box::new(left), events.clone())?;
    let b = AcousticBeamEngine::new(config.config().clone(), Box::new(right), events.clone())?;
    let caps = HardwareCapabilities::full();
    a.initialize(&caps)?;
    b.initialize(&caps)?;
    Ok((a, b, medium))
}
