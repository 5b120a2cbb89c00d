use std::sync::Arc;

use beamlink::acoustic::{Admission, BeamSignal, MAX_FRAME_PAYLOAD};
use beamlink::crypto::{ChallengeAuthenticator, Ed25519Authenticator, NodeCredentials};
use beamlink::e2e_common::{acoustic_pair, establish_pair};
use beamlink::hal::loopback::LoopbackTransducer;
use beamlink::hal::StaticProbe;
use beamlink::sdk::{AcousticHandle, SessionHandle};
use beamlink::{
    BeamConfig, BeamLink, EventBus, LinkConfig, LinkError, LinkEvent, SecureChannel, SessionState,
};

fn link() -> BeamLink {
    BeamLink::new(&StaticProbe::full(), LinkConfig::default()).expect("link")
}

fn engines(link: &BeamLink) -> (AcousticHandle, AcousticHandle) {
    let sps = BeamConfig::default().compile().unwrap().samples_per_symbol();
    let (left, right, _medium) = LoopbackTransducer::pair(sps);
    let a = link.create_acoustic_engine(Box::new(left), None).unwrap();
    let b = link.create_acoustic_engine(Box::new(right), None).unwrap();
    link.initialize_acoustic_engine(a).unwrap();
    link.initialize_acoustic_engine(b).unwrap();
    (a, b)
}

fn sessions(link: &BeamLink) -> (SessionHandle, SessionHandle) {
    let a = link.open_session();
    let b = link.open_session();
    let pa = link.initiate_handshake(a).unwrap();
    let pb = link.initiate_handshake(b).unwrap();
    link.receive_nonce(a, &pb).unwrap();
    link.receive_nonce(b, &pa).unwrap();
    link.receive_ack(a).unwrap();
    link.receive_ack(b).unwrap();
    (a, b)
}

#[test]
fn secure_channel_over_loopback_ultrasound() {
    let bus = EventBus::new();
    let (alice, bob) = establish_pair().unwrap();
    let (tx_engine, rx_engine, _medium) = acoustic_pair(&bus).unwrap();
    let tx_engine = Arc::new(tx_engine);
    let channel = SecureChannel::new(Arc::new(alice), Arc::clone(&tx_engine));
    let bob = Arc::new(bob);
    let inbound = SecureChannel::new(Arc::clone(&bob), Arc::clone(&tx_engine));

    assert_eq!(channel.send(b"first").unwrap(), 1);
    assert_eq!(channel.send(b"second").unwrap(), 1);
    assert_eq!(tx_engine.service_transmit_queue(16).unwrap(), 2);

    for reception in rx_engine.receive_beam_signals().unwrap() {
        if let BeamSignal::Data { payload } = reception.signal {
            inbound.accept(payload).unwrap();
        }
    }
    assert!(bob.is_receiving());
    assert_eq!(inbound.recv().unwrap().as_deref(), Some(&b"first"[..]));
    assert_eq!(inbound.recv().unwrap().as_deref(), Some(&b"second"[..]));
    assert_eq!(inbound.recv().unwrap(), None);
    assert!(!bob.is_receiving());
}

#[test]
fn facade_pumps_audio_between_sessions() {
    let link = link();
    let (ea, eb) = engines(&link);
    let (sa, sb) = sessions(&link);

    link.send_audio_data(sa, b"over the air").unwrap();
    link.send_audio_data(sa, b"twice").unwrap();
    assert_eq!(link.pump_audio(sa, ea).unwrap(), 2);
    link.transmit_sync_pulse(ea, &[0xAA, 0x55]).unwrap();

    let others = link.collect_audio(sb, eb).unwrap();
    assert_eq!(others.len(), 1);
    assert!(matches!(others[0].signal, BeamSignal::Sync { .. }));
    assert!(link.is_receiving(sb).unwrap());
    assert_eq!(link.receive_audio_data(sb).unwrap(), Some(b"over the air".to_vec()));
    assert_eq!(link.receive_audio_data(sb).unwrap(), Some(b"twice".to_vec()));
    assert_eq!(link.receive_audio_data(sb).unwrap(), None);

    let diag = link.acoustic_diagnostics(eb).unwrap();
    assert_eq!(diag.frames_received, 3);
    assert_eq!(diag.frame_errors, 0);
}

#[test]
fn audio_needs_an_established_session() {
    let link = link();
    let (ea, _) = engines(&link);
    let s = link.open_session();
    assert!(matches!(link.send_audio_data(s, b"early"), Err(LinkError::WrongState(_))));
    assert_eq!(link.pump_audio(s, ea).unwrap(), 0);
    assert_eq!(link.session_state(s), SessionState::Idle);
}

#[test]
fn control_priority_and_bounds() {
    let link = link();
    let (ea, eb) = engines(&link);
    assert_eq!(link.transmit_control_data(ea, b"routine", 10).unwrap(), Admission::Queued);
    assert_eq!(link.transmit_control_data(ea, b"urgent", 255).unwrap(), Admission::Queued);
    for bad in [-1i64, 256, i64::MAX] {
        assert!(matches!(
            link.transmit_control_data(ea, b"x", bad),
            Err(LinkError::InvalidArgument(_))
        ));
    }
    assert!(matches!(link.service_transmit_queue(ea, 0), Err(LinkError::InvalidArgument(_))));
    assert_eq!(link.service_transmit_queue(ea, 8).unwrap(), 2);

    let received: Vec<u8> = link
        .receive_beam_signals(eb)
        .unwrap()
        .into_iter()
        .filter_map(|r| match r.signal {
            BeamSignal::Control { priority, .. } => Some(priority),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![255, 10]);
}

#[test]
fn proximity_challenge_verifies_at_peer() {
    let link = link();
    let (ea, eb) = engines(&link);
    let prover = NodeCredentials::generate();
    let verifier =
        Ed25519Authenticator::with_peer(NodeCredentials::generate(), prover.public_bytes());
    let challenge = b"nonce-1234";
    link.respond_to_challenge(ea, challenge, &Ed25519Authenticator::new(prover))
        .unwrap();

    let signals = link.receive_beam_signals(eb).unwrap();
    let BeamSignal::Auth { challenge: got, signature } = &signals[0].signal else {
        panic!("expected auth signal, got {:?}", signals[0].signal);
    };
    assert_eq!(got.as_slice(), challenge);
    assert!(verifier.verify_challenge(got, signature));
    assert!(!verifier.verify_challenge(b"other", signature));
}

#[test]
fn presence_events_reach_the_subscriber() {
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let (tx, rx, medium) = acoustic_pair(&bus).unwrap();
    assert!(!rx.detect_presence().unwrap());
    tx.transmit_sync_pulse(&[0xAA]).unwrap();
    assert!(rx.detect_presence().unwrap());
    medium.silence(1);
    assert!(!rx.detect_presence().unwrap());
    let seen = events.drain();
    assert!(matches!(seen[0], LinkEvent::PresenceDetected { source, .. } if source == rx.id()));
    assert!(matches!(seen[1], LinkEvent::PresenceLost { .. }));
}

#[test]
fn waveform_is_pure_and_bounded() {
    let link = link();
    let (ea, _) = engines(&link);
    let one = link.generate_parametric_audio(ea, b"abc").unwrap();
    let two = link.generate_parametric_audio(ea, b"abc").unwrap();
    assert_eq!(one.samples, two.samples);
    assert_eq!(one.sample_rate_hz, 384_000);
    assert!(one.samples.iter().all(|s| s.abs() <= 1.0));
    assert_eq!(link.acoustic_diagnostics(ea).unwrap().frames_sent, 0);
    assert!(link.generate_parametric_audio(ea, &vec![0u8; MAX_FRAME_PAYLOAD]).is_ok());
    assert!(matches!(
        link.generate_parametric_audio(ea, &vec![0u8; MAX_FRAME_PAYLOAD + 1]),
        Err(LinkError::InvalidArgument(_))
    ));
    assert!(matches!(
        link.generate_parametric_audio(ea, &vec![0u8; 10 * 1024 * 1024 + 1]),
        Err(LinkError::InvalidArgument(_))
    ));
    link.shutdown_acoustic_engine(ea).unwrap();
    assert!(matches!(link.shutdown_acoustic_engine(ea), Err(LinkError::WrongState(_))));
    link.destroy_acoustic_engine(ea).unwrap();
    assert_eq!(link.detect_presence(ea), Err(LinkError::InvalidHandle));
}
