use beamlink::hal::loopback::{SimulatedLaser, SimulatedTarget};
use beamlink::hal::StaticProbe;
use beamlink::optical::{AdaptiveEvent, FnSource, LaserConfig, ReceptionConfig};
use beamlink::sdk::{DetectorHandle, OpticalHandle};
use beamlink::{
    BeamLink, EnvironmentalConditions, LinkConfig, LinkError, LinkEvent, OpticalState,
    RangeCategory, RangingConfig,
};
use tokio::sync::mpsc;

fn link() -> BeamLink {
    BeamLink::new(&StaticProbe::full(), LinkConfig::default()).expect("link")
}

fn blobs() -> (Vec<u8>, Vec<u8>) {
    (
        LaserConfig::default().to_cbor().unwrap(),
        ReceptionConfig::default().to_cbor().unwrap(),
    )
}

fn optical(
    link: &BeamLink,
    laser: SimulatedLaser,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> OpticalHandle {
    let (laser_blob, rx_blob) = blobs();
    let handle = link
        .create_optical_engine(&laser_blob, &rx_blob, Box::new(laser), Box::new(rx))
        .unwrap();
    link.initialize_optical_engine(handle).unwrap();
    handle
}

fn detector(
    link: &BeamLink,
    target: &SimulatedTarget,
    config: Option<RangingConfig>,
) -> DetectorHandle {
    let handle = link.create_range_detector(Box::new(target.clone()), config).unwrap();
    link.initialize_range_detector(handle).unwrap();
    handle
}

#[tokio::test]
async fn aligned_beam_carries_frames() {
    let link = link();
    let (to_b, rx_b) = mpsc::unbounded_channel();
    let (_to_a, rx_a) = mpsc::unbounded_channel();
    let laser_a = SimulatedLaser::linked(to_b);
    let a = optical(&link, laser_a.clone(), rx_a);
    let b = optical(&link, SimulatedLaser::new(), rx_b);

    assert!(matches!(link.transmit_data(a, b"photons"), Err(LinkError::WrongState(_))));

    let view = laser_a.clone();
    let mut source = FnSource(move || view.strength_toward((0.4, -0.2)));
    let status = link.auto_align_with_source(a, 100, &mut source).unwrap();
    assert!(status.locked);
    assert!(status.attempts_used <= 100);

    link.transmit_data(a, b"photons").unwrap();
    assert_eq!(link.receive_data(b, 500).await.unwrap(), b"photons");
    assert_eq!(link.receive_data(b, 20).await, Err(LinkError::Timeout));
    assert!(matches!(link.receive_data(b, 30_001).await, Err(LinkError::InvalidArgument(_))));
    assert!(matches!(link.receive_data(b, -1).await, Err(LinkError::InvalidArgument(_))));

    let diag = link.optical_diagnostics(b).unwrap();
    assert_eq!(diag.frames_received, 1);
    assert_eq!(link.optical_diagnostics(a).unwrap().frames_sent, 1);
    assert!(link.safety_stats(a).unwrap().total_energy_j > 0.0);
}

#[test]
fn alignment_converges_or_keeps_best() {
    let link = link();
    let (_tx, rx) = mpsc::unbounded_channel();
    let engine = optical(&link, SimulatedLaser::new(), rx);

    let mut improving = vec![0.2f32, 0.4, 0.6, 0.8, 0.9, 0.99].into_iter();
    let mut source = FnSource(move || improving.next().unwrap_or(0.0));
    let status = link.auto_align_with_source(engine, 10, &mut source).unwrap();
    assert!(status.locked && status.attempts_used <= 10);

    link.set_alignment_target(engine, 0.5, 0.5).unwrap();
    assert!(!link.alignment_status(engine).unwrap().locked);
    let mut flat = FnSource(|| 0.2f32);
    assert!(matches!(
        link.auto_align_with_source(engine, 5, &mut flat),
        Err(LinkError::WrongState(_))
    ));
    let status = link.alignment_status(engine).unwrap();
    assert_eq!(status.attempts_used, 5);
    assert!(!status.locked);
    assert_eq!((status.current_x, status.current_y), (0.5, 0.5));

    assert!(matches!(
        link.auto_align_with_source(engine, 0, &mut flat),
        Err(LinkError::InvalidArgument(_))
    ));
    assert!(matches!(
        link.auto_align_with_source(engine, 101, &mut flat),
        Err(LinkError::InvalidArgument(_))
    ));
    assert!(matches!(
        link.set_alignment_target(engine, 1.5, 0.0),
        Err(LinkError::InvalidArgument(_))
    ));
}

#[test]
fn detector_drives_alignment() {
    let link = link();
    let mut events = link.subscribe();
    let target = SimulatedTarget::new(40.0, 0.97);
    let det = detector(&link, &target, None);
    let (_tx, rx) = mpsc::unbounded_channel();
    let engine = optical(&link, SimulatedLaser::new(), rx);

    let status = link.auto_align(engine, 10, det).unwrap();
    assert!(status.locked);
    assert_eq!(status.attempts_used, 1);
    // fast samples never enter the history
    assert_eq!(link.history_len(det).unwrap(), 0);
    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, LinkEvent::AlignmentLocked { attempts: 1, .. })));
}

#[test]
fn emergency_latch_until_explicit_reset() {
    let link = link();
    let mut events = link.subscribe();
    let (_tx, rx) = mpsc::unbounded_channel();
    let laser = SimulatedLaser::new();
    let engine = optical(&link, laser.clone(), rx);
    link.auto_align_with_source(engine, 1, &mut FnSource(|| 1.0f32)).unwrap();
    link.transmit_data(engine, b"before").unwrap();

    link.emergency_shutdown(engine).unwrap();
    assert_eq!(laser.power_mw(), 0.0);
    for _ in 0..5 {
        assert!(matches!(link.transmit_data(engine, b"x"), Err(LinkError::SafetyTrip(_))));
    }
    assert!(matches!(link.reset_energy_monitoring(engine), Err(LinkError::SafetyTrip(_))));
    assert!(matches!(link.set_intensity(engine, 10.0), Err(LinkError::SafetyTrip(_))));
    let stats = link.safety_stats(engine).unwrap();
    assert!(stats.latched);
    assert!(events.drain().iter().any(|e| matches!(e, LinkEvent::SafetyTrip { .. })));

    link.clear_emergency_latch(engine).unwrap();
    assert_eq!(link.optical_diagnostics(engine).unwrap().state, OpticalState::Created);
    assert!(link.safety_stats(engine).unwrap().last_shutdown_reason.is_some());
    link.reset_energy_monitoring(engine).unwrap();
    link.initialize_optical_engine(engine).unwrap();
    link.auto_align_with_source(engine, 1, &mut FnSource(|| 1.0f32)).unwrap();
    link.transmit_data(engine, b"after").unwrap();
    assert_eq!(laser.emitted().len(), 2);
}

#[test]
fn adaptive_mode_follows_the_detector() {
    let link = link();
    let mut events = link.subscribe();
    let target = SimulatedTarget::new(120.0, 0.9);
    let det = detector(&link, &target, None);
    let (_tx, rx) = mpsc::unbounded_channel();
    let laser = SimulatedLaser::new();
    let engine = optical(&link, laser.clone(), rx);

    assert!(matches!(link.adaptive_tick(engine, det), Err(LinkError::WrongState(_))));
    link.enable_adaptive_mode(engine).unwrap();
    assert_eq!(
        link.adaptive_tick(engine, det).unwrap(),
        Some(AdaptiveEvent::ProfileSwitched(RangeCategory::Far))
    );
    // far preset: min(50, 100, 10 mW x 2.0) = 20 mW at full intensity
    assert_eq!(laser.power_mw(), 20.0);
    assert_eq!(link.current_power_profile(engine).unwrap().profile().max_power_mw, 50.0);

    target.set_strength(0.05);
    let mut entered = false;
    for _ in 0..3 {
        let event = link.adaptive_tick(engine, det).unwrap();
        entered |= event == Some(AdaptiveEvent::EnteredDegradedSafe);
    }
    assert!(entered);
    assert!(events.drain().iter().any(|e| matches!(e, LinkEvent::AlignmentLost { .. })));

    target.set_strength(0.9);
    assert_eq!(
        link.adaptive_tick(engine, det).unwrap(),
        Some(AdaptiveEvent::ExitedDegradedSafe)
    );
    assert_eq!(laser.power_mw(), 20.0);

    link.disable_adaptive_mode(engine).unwrap();
    assert!(link.adaptive_tick(engine, det).is_err());
}

#[test]
fn invalid_blobs_create_nothing() {
    let link = link();
    let (laser_blob, rx_blob) = blobs();
    let (_tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    assert!(matches!(
        link.create_optical_engine(&[], &rx_blob, Box::new(SimulatedLaser::new()), Box::new(rx)),
        Err(LinkError::InvalidArgument(_))
    ));
    let bad = ReceptionConfig {
        photodiode: false,
        camera: false,
        ..Default::default()
    }
    .to_cbor()
    .unwrap();
    let (_tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    assert!(link
        .create_optical_engine(&laser_blob, &bad, Box::new(SimulatedLaser::new()), Box::new(rx))
        .is_err());
}

#[test]
fn history_keeps_the_newest_samples() {
    let link = link();
    let target = SimulatedTarget::new(20.0, 0.9);
    let config = RangingConfig {
        history_capacity: 5,
        ..Default::default()
    };
    let det = detector(&link, &target, Some(config));
    assert_eq!(link.current_range_category(det).unwrap(), None);

    let mut taken = Vec::new();
    for i in 0..7 {
        target.set_distance(20.0 + 3.0 * i as f64);
        taken.push(link.measure_distance(det).unwrap());
    }
    assert_eq!(link.history_len(det).unwrap(), 5);
    assert_eq!(link.history_get(det, 0).unwrap(), taken[2]);
    assert_eq!(link.history_get(det, 4).unwrap(), taken[6]);
    assert!(matches!(link.history_get(det, 5), Err(LinkError::InvalidArgument(_))));
    assert_eq!(link.current_range_category(det).unwrap(), Some(RangeCategory::Close));

    link.measure_distance_fast(det).unwrap();
    assert_eq!(link.history_get(det, 4).unwrap(), taken[6]);
    let averaged = link.measure_distance_averaged(det, 10).unwrap();
    assert_eq!(link.history_get(det, 4).unwrap(), averaged);
}

#[test]
fn environment_updates_are_atomic() {
    let link = link();
    let target = SimulatedTarget::new(100.0, 0.9);
    let det = detector(&link, &target, None);
    let before = link.measure_distance(det).unwrap();

    let hot = EnvironmentalConditions {
        temperature_c: 40.0,
        ..Default::default()
    };
    link.update_environmental_conditions(det, hot).unwrap();
    let after = link.measure_distance(det).unwrap();
    assert!(after.distance_m > before.distance_m);

    let bad = EnvironmentalConditions {
        temperature_c: 150.0,
        ..Default::default()
    };
    assert!(matches!(
        link.update_environmental_conditions(det, bad),
        Err(LinkError::InvalidArgument(_))
    ));
    assert_eq!(link.environment(det).unwrap(), hot);

    link.shutdown_range_detector(det).unwrap();
    assert!(matches!(link.measure_distance(det), Err(LinkError::WrongState(_))));
    link.destroy_range_detector(det).unwrap();
    assert_eq!(link.measure_distance(det), Err(LinkError::InvalidHandle));
}

#[test]
fn averaging_smooths_jittered_echoes() {
    let link = link();
    let target = SimulatedTarget::new(50.0, 0.8)
        .with_speed_of_sound(EnvironmentalConditions::default().speed_of_sound())
        .with_jitter_us(300.0);
    let det = detector(&link, &target, None);
    let m = link.measure_distance_averaged(det, 20).unwrap();
    assert!((m.distance_m - 50.0).abs() < 0.1, "distance {}", m.distance_m);
    assert_eq!(link.history_len(det).unwrap(), 1);
}
