//! Laser-to-ultrasound fallback.
//!
//! [`FallbackLink`] is a [`FrameTransport`] over one optical and one acoustic
//! engine. Sealed frames go out over the laser while it is healthy and over
//! ultrasound once the laser degrades, loses alignment, trips its interlock
//! or refuses a frame. The session sealing the frames lives above the
//! transport, so a switch never touches keys or counters.
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::acoustic::AcousticBeamEngine;
use crate::channel::FrameTransport;
use crate::events::{EventBus, LinkEvent, Subscription};
use crate::optical::OpticalBeamEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveChannel {
    Optical,
    Acoustic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Engine events and refused frames switch channels.
    Automatic,
    /// Only [`FallbackLink::manual_fallback`] and
    /// [`FallbackLink::restore_optical`] switch channels.
    Manual,
    /// The laser is the only channel.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ChannelFailure {
    LaserAlignmentLost,
    LaserDegraded(String),
    LaserSafetyTrip(String),
    LaserSendFailed(String),
    Manual,
}

impl ChannelFailure {
    fn describe(&self) -> String {
        match self {
            ChannelFailure::LaserAlignmentLost => "laser alignment lost".into(),
            ChannelFailure::LaserDegraded(reason) => format!("laser degraded: {reason}"),
            ChannelFailure::LaserSafetyTrip(reason) => format!("laser safety trip: {reason}"),
            ChannelFailure::LaserSendFailed(reason) => format!("laser refused frame: {reason}"),
            ChannelFailure::Manual => "manual fallback".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FallbackConfig {
    pub mode: FallbackMode,
    /// Returns to the laser allowed per link; after that the link stays on
    /// ultrasound.
    pub max_recovery_attempts: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            mode: FallbackMode::Automatic,
            max_recovery_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackStatus {
    pub active: bool,
    pub channel: ActiveChannel,
    pub failure: Option<ChannelFailure>,
    pub activations: u32,
    pub recovery_attempts: u32,
    pub since_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FallbackError {
    #[error("fallback disabled")]
    Disabled,
    #[error("optical channel not usable: {0}")]
    OpticalUnavailable(String),
}

struct FallbackInner {
    channel: ActiveChannel,
    failure: Option<ChannelFailure>,
    activations: u32,
    recovery_attempts: u32,
    since: Option<Instant>,
}

pub struct FallbackLink {
    optical: Arc<OpticalBeamEngine>,
    acoustic: Arc<AcousticBeamEngine>,
    config: FallbackConfig,
    events: EventBus,
    inner: Mutex<FallbackInner>,
}

impl std::fmt::Debug for FallbackLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackLink")
            .field("optical", &self.optical.id())
            .field("acoustic", &self.acoustic.id())
            .field("channel", &self.active_channel())
            .finish()
    }
}

impl FallbackLink {
    pub fn new(
        optical: Arc<OpticalBeamEngine>,
        acoustic: Arc<AcousticBeamEngine>,
        config: FallbackConfig,
        events: EventBus,
    ) -> Self {
        Self {
            optical,
            acoustic,
            config,
            events,
            inner: Mutex::new(FallbackInner {
                channel: ActiveChannel::Optical,
                failure: None,
                activations: 0,
                recovery_attempts: 0,
                since: None,
            }),
        }
    }

    pub fn optical(&self) -> &Arc<OpticalBeamEngine> {
        &self.optical
    }

    pub fn acoustic(&self) -> &Arc<AcousticBeamEngine> {
        &self.acoustic
    }

    pub fn active_channel(&self) -> ActiveChannel {
        self.inner.lock().channel
    }

    pub fn is_fallback_active(&self) -> bool {
        self.active_channel() == ActiveChannel::Acoustic
    }

    pub fn status(&self) -> FallbackStatus {
        let inner = self.inner.lock();
        FallbackStatus {
            active: inner.channel == ActiveChannel::Acoustic,
            channel: inner.channel,
            failure: inner.failure.clone(),
            activations: inner.activations,
            recovery_attempts: inner.recovery_attempts,
            since_ms: inner.since.map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Reacts to one event from the optical engine; events from other
    /// sources are ignored. Returns the channel switched to, if any.
    pub fn observe(&self, event: &LinkEvent) -> Option<ActiveChannel> {
        if self.config.mode != FallbackMode::Automatic {
            return None;
        }
        let optical = self.optical.id();
        match event {
            LinkEvent::ChannelDegraded { source, reason } if *source == optical => {
                self.fall_back(ChannelFailure::LaserDegraded(reason.clone()))
            }
            LinkEvent::AlignmentLost { source, .. } if *source == optical => {
                self.fall_back(ChannelFailure::LaserAlignmentLost)
            }
            LinkEvent::SafetyTrip { source, reason } if *source == optical => {
                self.fall_back(ChannelFailure::LaserSafetyTrip(reason.clone()))
            }
            LinkEvent::ChannelRecovered { source } | LinkEvent::AlignmentLocked { source, .. }
                if *source == optical =>
            {
                self.recover().ok().flatten()
            }
            _ => None,
        }
    }

    /// Feeds every queued event from `subscription` to [`FallbackLink::observe`]
    /// and hands them back for the caller's own use.
    pub fn observe_all(&self, subscription: &mut Subscription) -> Vec<LinkEvent> {
        let events = subscription.drain();
        for event in &events {
            self.observe(event);
        }
        events
    }

    /// Switches to ultrasound regardless of laser health.
    pub fn manual_fallback(&self) -> Result<(), FallbackError> {
        if self.config.mode == FallbackMode::Disabled {
            return Err(FallbackError::Disabled);
        }
        self.fall_back(ChannelFailure::Manual);
        Ok(())
    }

    /// Returns to the laser if it is initialized and aligned.
    ///
    /// # Errors
    /// * `Disabled` in [`FallbackMode::Disabled`].
    /// * `OpticalUnavailable` when the laser cannot carry frames yet or the
    ///   recovery budget is spent.
    pub fn restore_optical(&self) -> Result<(), FallbackError> {
        if self.config.mode == FallbackMode::Disabled {
            return Err(FallbackError::Disabled);
        }
        self.recover().map(|_| ())
    }

    fn fall_back(&self, failure: ChannelFailure) -> Option<ActiveChannel> {
        if self.config.mode == FallbackMode::Disabled {
            return None;
        }
        let mut inner = self.inner.lock();
        if inner.channel == ActiveChannel::Acoustic {
            debug!(
                optical = %self.optical.id(),
                reason = %failure.describe(),
                "already on ultrasound"
            );
            inner.failure = Some(failure);
            return None;
        }
        let reason = failure.describe();
        inner.channel = ActiveChannel::Acoustic;
        inner.failure = Some(failure);
        inner.activations += 1;
        inner.since = Some(Instant::now());
        warn!(
            optical = %self.optical.id(),
            acoustic = %self.acoustic.id(),
            %reason,
            "falling back to ultrasound"
        );
        self.events.publish(LinkEvent::FallbackActivated {
            source: self.optical.id(),
            reason,
        });
        Some(ActiveChannel::Acoustic)
    }

    fn recover(&self) -> Result<Option<ActiveChannel>, FallbackError> {
        // engine state is read before our own lock is taken
        let state = self.optical.state();
        let aligned = self.optical.alignment_status().locked;
        let mut inner = self.inner.lock();
        if inner.channel == ActiveChannel::Optical {
            return Ok(None);
        }
        if inner.recovery_attempts >= self.config.max_recovery_attempts {
            warn!(
                optical = %self.optical.id(),
                attempts = inner.recovery_attempts,
                "recovery budget spent; staying on ultrasound"
            );
            return Err(FallbackError::OpticalUnavailable(
                "recovery attempts exhausted".into(),
            ));
        }
        if !state.is_initialized() {
            return Err(FallbackError::OpticalUnavailable(format!("laser {state}")));
        }
        if !aligned {
            return Err(FallbackError::OpticalUnavailable("laser not aligned".into()));
        }
        inner.channel = ActiveChannel::Optical;
        inner.failure = None;
        inner.recovery_attempts += 1;
        inner.since = None;
        info!(optical = %self.optical.id(), attempts = inner.recovery_attempts, "laser restored");
        self.events.publish(LinkEvent::FallbackRecovered {
            source: self.optical.id(),
        });
        Ok(Some(ActiveChannel::Optical))
    }
}

impl FrameTransport for FallbackLink {
    /// Laser first; in automatic mode a refused frame switches the link to
    /// ultrasound and the same frame is queued there.
    fn send_frame(&self, bytes: &[u8]) -> Result<(), String> {
        if self.active_channel() == ActiveChannel::Optical {
            match self.optical.transmit_data(bytes) {
                Ok(()) => return Ok(()),
                Err(err) if self.config.mode == FallbackMode::Automatic => {
                    self.fall_back(ChannelFailure::LaserSendFailed(err.to_string()));
                }
                Err(err) => return Err(err.to_string()),
            }
        }
        self.acoustic
            .enqueue_data(bytes)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::e2e_common::acoustic_pair;
    use crate::hal::loopback::SimulatedLaser;
    use crate::hal::HardwareCapabilities;
    use crate::optical::{FnSource, LaserConfig, ReceptionConfig};
    use tokio::sync::mpsc;

    fn link(config: FallbackConfig) -> (FallbackLink, EventBus) {
        let bus = EventBus::new();
        let (_tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let optical = OpticalBeamEngine::new(
            LaserConfig::default(),
            ReceptionConfig::default(),
            Box::new(SimulatedLaser::new()),
            Box::new(rx),
            bus.clone(),
        )
        .unwrap();
        optical.initialize(&HardwareCapabilities::full()).unwrap();
        optical.auto_align(1, &mut FnSource(|| 1.0f32)).unwrap();
        let (acoustic, _, _) = acoustic_pair(&bus).unwrap();
        let link = FallbackLink::new(Arc::new(optical), Arc::new(acoustic), config, bus.clone());
        (link, bus)
    }

    #[test]
    fn degraded_laser_switches_and_recovery_returns() {
        let (link, bus) = link(FallbackConfig::default());
        let mut sub = bus.subscribe();
        let source = link.optical().id();
        let degraded = LinkEvent::ChannelDegraded {
            source,
            reason: "sustained_loss".into(),
        };
        assert_eq!(link.observe(&degraded), Some(ActiveChannel::Acoustic));
        assert_eq!(link.observe(&degraded), None);
        assert!(link.is_fallback_active());
        assert!(matches!(
            sub.try_recv(),
            Some(LinkEvent::FallbackActivated { .. })
        ));

        assert_eq!(
            link.observe(&LinkEvent::ChannelRecovered { source }),
            Some(ActiveChannel::Optical)
        );
        assert_eq!(sub.try_recv(), Some(LinkEvent::FallbackRecovered { source }));
        let status = link.status();
        assert!(!status.active);
        assert_eq!(status.activations, 1);
        assert_eq!(status.recovery_attempts, 1);
    }

    #[test]
    fn events_from_other_engines_are_ignored() {
        let (link, _) = link(FallbackConfig::default());
        let other = link.acoustic().id();
        assert_eq!(
            link.observe(&LinkEvent::ChannelDegraded {
                source: other,
                reason: "low_snr".into(),
            }),
            None
        );
        assert_eq!(link.active_channel(), ActiveChannel::Optical);
    }

    #[test]
    fn refused_laser_frame_is_requeued_on_ultrasound() {
        let (link, _) = link(FallbackConfig::default());
        link.optical().emergency_shutdown().unwrap();
        link.send_frame(b"sealed").unwrap();
        assert!(link.is_fallback_active());
        assert!(matches!(
            link.status().failure,
            Some(ChannelFailure::LaserSendFailed(_))
        ));
        assert_eq!(link.acoustic().channel_diagnostics().queued_frames, 1);
        // a latched laser cannot take the link back
        assert!(matches!(
            link.restore_optical(),
            Err(FallbackError::OpticalUnavailable(_))
        ));
    }

    #[test]
    fn manual_and_disabled_modes() {
        let (manual, _) = link(FallbackConfig {
            mode: FallbackMode::Manual,
            ..FallbackConfig::default()
        });
        let source = manual.optical().id();
        let lost = LinkEvent::AlignmentLost {
            source,
            signal_strength: 0.0,
        };
        assert_eq!(manual.observe(&lost), None);
        manual.manual_fallback().unwrap();
        assert_eq!(manual.status().failure, Some(ChannelFailure::Manual));
        manual.restore_optical().unwrap();
        assert!(!manual.is_fallback_active());

        let (disabled, _) = link(FallbackConfig {
            mode: FallbackMode::Disabled,
            ..FallbackConfig::default()
        });
        assert_eq!(disabled.manual_fallback(), Err(FallbackError::Disabled));
        disabled.optical().emergency_shutdown().unwrap();
        assert!(disabled.send_frame(b"sealed").is_err());
        assert!(!disabled.is_fallback_active());
    }

    #[test]
    fn recovery_budget_pins_ultrasound() {
        let (link, _) = link(FallbackConfig {
            max_recovery_attempts: 1,
            ..FallbackConfig::default()
        });
        let source = link.optical().id();
        let lost = LinkEvent::AlignmentLost {
            source,
            signal_strength: 0.0,
        };
        let locked = LinkEvent::AlignmentLocked {
            source,
            attempts: 1,
            error: 0.0,
        };
        link.observe(&lost);
        assert_eq!(link.observe(&locked), Some(ActiveChannel::Optical));
        link.observe(&lost);
        assert_eq!(link.observe(&locked), None);
        assert!(link.is_fallback_active());
        assert_eq!(link.status().activations, 2);
    }
}
