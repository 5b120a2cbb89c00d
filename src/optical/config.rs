//! Laser and receiver configuration, CBOR-encoded at the boundary.
use serde::{Deserialize, Serialize};

use super::OpticalError;
use crate::hal::Modality;

/// Class-1 style accessible emission limits.
const VISIBLE_SAFE_MW: f32 = 1.0;
const INFRARED_SAFE_MW: f32 = 10.0;
const MAX_LASER_POWER_MW: f32 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaserType {
    Visible,
    Infrared,
}

impl LaserType {
    pub fn wavelength_band_nm(&self) -> (f32, f32) {
        match self {
            LaserType::Visible => (400.0, 700.0),
            LaserType::Infrared => (700.0, 1100.0),
        }
    }

    /// Eye-safe output before the profile safety margin is applied.
    pub fn eye_safe_mw(&self) -> f32 {
        match self {
            LaserType::Visible => VISIBLE_SAFE_MW,
            LaserType::Infrared => INFRARED_SAFE_MW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserConfig {
    pub laser_type: LaserType,
    pub wavelength_nm: f32,
    pub max_power_mw: f32,
    pub beam_diameter_mm: f32,
    pub range_m: f32,
    #[serde(default = "default_energy_budget")]
    pub max_energy_j: f64,
    #[serde(default = "default_breach_limit")]
    pub breach_limit: u32,
}

fn default_energy_budget() -> f64 {
    1000.0
}

fn default_breach_limit() -> u32 {
    3
}

impl Default for LaserConfig {
    fn default() -> Self {
        Self {
            laser_type: LaserType::Infrared,
            wavelength_nm: 905.0,
            max_power_mw: 100.0,
            beam_diameter_mm: 3.0,
            range_m: 200.0,
            max_energy_j: default_energy_budget(),
            breach_limit: default_breach_limit(),
        }
    }
}

impl LaserConfig {
    pub fn validate(&self) -> Result<(), OpticalError> {
        let (lo, hi) = self.laser_type.wavelength_band_nm();
        if !self.wavelength_nm.is_finite() || self.wavelength_nm < lo || self.wavelength_nm > hi {
            return Err(OpticalError::InvalidConfig(format!(
                "wavelength {} nm outside [{lo}, {hi}] nm for {:?} laser",
                self.wavelength_nm, self.laser_type
            )));
        }
        if !(self.max_power_mw > 0.0 && self.max_power_mw <= MAX_LASER_POWER_MW) {
            return Err(OpticalError::InvalidConfig(format!(
                "max power {} mW outside (0, {MAX_LASER_POWER_MW}] mW",
                self.max_power_mw
            )));
        }
        if !(self.beam_diameter_mm > 0.0 && self.beam_diameter_mm <= 100.0) {
            return Err(OpticalError::InvalidConfig(format!(
                "beam diameter {} mm outside (0, 100] mm",
                self.beam_diameter_mm
            )));
        }
        if !(self.range_m >= 1.0 && self.range_m <= 10_000.0) {
            return Err(OpticalError::InvalidConfig(format!(
                "range {} m outside [1, 10000] m",
                self.range_m
            )));
        }
        if !(self.max_energy_j > 0.0 && self.max_energy_j <= 1.0e6) {
            return Err(OpticalError::InvalidConfig(format!(
                "energy budget {} J outside (0, 1e6] J",
                self.max_energy_j
            )));
        }
        if self.breach_limit == 0 {
            return Err(OpticalError::InvalidConfig("breach limit must be at least 1".into()));
        }
        Ok(())
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, OpticalError> {
        decode_cbor("laser config", bytes)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, OpticalError> {
        serde_cbor::to_vec(self).map_err(|e| OpticalError::InvalidConfig(format!("encode: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceptionConfig {
    pub photodiode: bool,
    pub camera: bool,
    /// Detector sensitivity in `(0, 1]`.
    pub sensitivity: f32,
    pub frame_rate_hz: u32,
}

impl Default for ReceptionConfig {
    fn default() -> Self {
        Self {
            photodiode: true,
            camera: false,
            sensitivity: 0.8,
            frame_rate_hz: 120,
        }
    }
}

impl ReceptionConfig {
    pub fn validate(&self) -> Result<(), OpticalError> {
        if !self.photodiode && !self.camera {
            return Err(OpticalError::InvalidConfig(
                "reception needs a photodiode or a camera".into(),
            ));
        }
        if !(self.sensitivity > 0.0 && self.sensitivity <= 1.0) {
            return Err(OpticalError::InvalidConfig(format!(
                "sensitivity {} outside (0, 1]",
                self.sensitivity
            )));
        }
        if !(1..=1000).contains(&self.frame_rate_hz) {
            return Err(OpticalError::InvalidConfig(format!(
                "frame rate {} Hz outside [1, 1000] Hz",
                self.frame_rate_hz
            )));
        }
        Ok(())
    }

    /// Modalities the receiver path needs.
    pub fn modalities(&self) -> Vec<Modality> {
        let mut needed = Vec::with_capacity(2);
        if self.photodiode {
            needed.push(Modality::Photodiode);
        }
        if self.camera {
            needed.push(Modality::Camera);
        }
        needed
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, OpticalError> {
        decode_cbor("reception config", bytes)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, OpticalError> {
        serde_cbor::to_vec(self).map_err(|e| OpticalError::InvalidConfig(format!("encode: {e}")))
    }
}

fn decode_cbor<T: serde::de::DeserializeOwned>(
    what: &str,
    bytes: &[u8],
) -> Result<T, OpticalError> {
    if bytes.is_empty() {
        return Err(OpticalError::InvalidConfig(format!("{what} is empty")));
    }
    serde_cbor::from_slice(bytes).map_err(|e| OpticalError::InvalidConfig(format!("{what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wavelength_must_match_laser_type() {
        let cfg = LaserConfig {
            laser_type: LaserType::Visible,
            wavelength_nm: 905.0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(OpticalError::InvalidConfig(_))));
        assert!(LaserConfig::default().validate().is_ok());
    }

    #[test]
    fn cbor_blob_decodes_with_defaults() {
        #[derive(Serialize)]
        struct Minimal {
            laser_type: LaserType,
            wavelength_nm: f32,
            max_power_mw: f32,
            beam_diameter_mm: f32,
            range_m: f32,
        }
        let bytes = serde_cbor::to_vec(&Minimal {
            laser_type: LaserType::Visible,
            wavelength_nm: 650.0,
            max_power_mw: 5.0,
            beam_diameter_mm: 2.0,
            range_m: 50.0,
        })
        .unwrap();
        let cfg = LaserConfig::from_cbor(&bytes).unwrap();
        assert_eq!(cfg.max_energy_j, 1000.0);
        assert_eq!(cfg.breach_limit, 3);
        assert!(LaserConfig::from_cbor(&[]).is_err());
        assert!(LaserConfig::from_cbor(&[0xff, 0x00]).is_err());
    }

    #[test]
    fn reception_needs_a_detector() {
        let cfg = ReceptionConfig {
            photodiode: false,
            camera: false,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let both = ReceptionConfig {
            camera: true,
            ..Default::default()
        };
        assert_eq!(both.modalities(), vec![Modality::Photodiode, Modality::Camera]);
    }
}
