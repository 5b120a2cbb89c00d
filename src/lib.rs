//! beamlink: authenticated sessions over ultrasonic and free-space optical links.
//!
//! A [`Session`] negotiates keys (X25519 + HKDF, optional QR bootstrap) and
//! seals payloads with ChaCha20-Poly1305. The sealed frames ride one of the
//! physical engines: [`AcousticBeamEngine`] for parametric ultrasound or
//! [`OpticalBeamEngine`] for a steered laser, whose alignment and power loops
//! are fed by a [`RangeDetector`]. A [`FallbackLink`] moves sealed frames
//! from the laser to ultrasound when the beam fails, without touching the
//! session. [`BeamLink`] exposes the engines through generation-checked
//! handles.

pub mod acoustic;
pub mod bounds;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod e2e_common;
pub mod error;
pub mod events;
pub mod fallback;
pub mod framing;
pub mod hal;
pub mod health;
pub mod link_quality;
pub mod optical;
pub mod profile;
pub mod range;
pub mod registry;
pub mod sdk;
pub mod session;

pub use acoustic::{AcousticBeamEngine, AcousticError, AcousticState, BeamSignal};
pub use channel::{FrameTransport, SecureChannel};
pub use config::LinkConfig;
pub use error::LinkError;
pub use events::{EventBus, LinkEvent, Subscription};
pub use fallback::{ActiveChannel, FallbackConfig, FallbackLink, FallbackMode};
pub use hal::{HardwareCapabilities, HardwareProbe, Modality};
pub use optical::{OpticalBeamEngine, OpticalError, OpticalState};
pub use profile::{
    BeamConfig, CompiledBeamConfig, CompiledPowerProfile, PowerProfile, RangeCategory,
};
pub use range::{EnvironmentalConditions, Measurement, RangeDetector, RangeError, RangingConfig};
pub use registry::{Handle, Registry};
pub use sdk::BeamLink;
pub use session::{Session, SessionError, SessionState};
