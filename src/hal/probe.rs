//! One-shot hardware capability discovery.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Ultrasonic,
    Laser,
    Photodiode,
    Camera,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Ultrasonic => "ultrasonic",
            Modality::Laser => "laser",
            Modality::Photodiode => "photodiode",
            Modality::Camera => "camera",
        }
    }
}

/// Snapshot of what the host can drive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub ultrasonic: bool,
    pub laser: bool,
    pub photodiode: bool,
    pub camera: bool,
    /// Highest audio sample rate the transducer path supports.
    #[serde(default)]
    pub max_sample_rate_hz: Option<u32>,
    /// Laser wavelengths available, in nanometres.
    #[serde(default)]
    pub laser_wavelengths_nm: Vec<u32>,
}

impl HardwareCapabilities {
    /// Everything present; what the loopback drivers emulate.
    pub fn full() -> Self {
        Self {
            ultrasonic: true,
            laser: true,
            photodiode: true,
            camera: true,
            max_sample_rate_hz: Some(768_000),
            laser_wavelengths_nm: vec![650, 905],
        }
    }

    pub fn supports(&self, modality: Modality) -> bool {
        match modality {
            Modality::Ultrasonic => self.ultrasonic,
            Modality::Laser => self.laser,
            Modality::Photodiode => self.photodiode,
            Modality::Camera => self.camera,
        }
    }

    /// Fails with the modality name when it is absent.
    pub fn require(&self, modality: Modality) -> Result<(), String> {
        if self.supports(modality) {
            Ok(())
        } else {
            Err(format!("{} not available", modality.as_str()))
        }
    }

    /// Serialized descriptor handed across the boundary.
    pub fn descriptor(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_descriptor(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Read-only capability probe. Implementations must be safe to call
/// concurrently.
pub trait HardwareProbe: Send + Sync {
    fn probe(&self) -> HardwareCapabilities;
}

/// Probe answering with a fixed snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    caps: HardwareCapabilities,
}

impl StaticProbe {
    pub fn new(caps: HardwareCapabilities) -> Self {
        Self { caps }
    }

    pub fn full() -> Self {
        Self::new(HardwareCapabilities::full())
    }

    pub fn none() -> Self {
        Self::new(HardwareCapabilities::default())
    }
}

impl HardwareProbe for StaticProbe {
    fn probe(&self) -> HardwareCapabilities {
        self.caps.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_carries_every_modality() {
        let caps = HardwareCapabilities {
            ultrasonic: true,
            camera: true,
            ..Default::default()
        };
        let json = caps.descriptor().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ultrasonic"], true);
        assert_eq!(value["laser"], false);
        assert_eq!(HardwareCapabilities::from_descriptor(&json).unwrap(), caps);
    }

    #[test]
    fn require_names_the_missing_modality() {
        let caps = StaticProbe::none().probe();
        assert_eq!(caps.require(Modality::Laser), Err("laser not available".into()));
        assert!(StaticProbe::full().probe().require(Modality::Laser).is_ok());
    }
}
