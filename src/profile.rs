use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Discretized distance bucket, ordered from nearest to farthest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeCategory {
    /// Below 50 m.
    Close,
    /// 50 m up to 100 m.
    Medium,
    /// 100 m up to 150 m.
    Far,
    /// 150 m and beyond.
    Extreme,
}

impl RangeCategory {
    pub fn from_distance(distance_m: f32) -> Self {
        if distance_m < 50.0 {
            RangeCategory::Close
        } else if distance_m < 100.0 {
            RangeCategory::Medium
        } else if distance_m < 150.0 {
            RangeCategory::Far
        } else {
            RangeCategory::Extreme
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeCategory::Close => "close",
            RangeCategory::Medium => "medium",
            RangeCategory::Far => "far",
            RangeCategory::Extreme => "extreme",
        }
    }
}

/// Error produced when a beam configuration or power profile fails validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProfileError {
    #[error("profile name must not be empty")]
    EmptyName,
    #[error("at least one fundamental carrier is required")]
    NoCarriers,
    #[error("{band} carrier {hz} Hz outside [{min}, {max}] Hz")]
    CarrierOutOfBand {
        band: &'static str,
        hz: f32,
        min: f32,
        max: f32,
    },
    #[error("carrier {hz} Hz is at or above Nyquist for {sample_rate} Hz sampling")]
    AboveNyquist { hz: f32, sample_rate: u32 },
    #[error("sample rate {0} Hz unsupported")]
    SampleRate(u32),
    #[error("symbol rate {symbol_rate} Hz must divide the sample rate into at least 4 samples")]
    SymbolRate { symbol_rate: u32 },
    #[error("{field} = {value} outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
    #[error("power levels must satisfy 0 < min <= optimal <= max")]
    PowerOrdering,
}

fn ensure(field: &'static str, value: f32, min: f32, max: f32) -> Result<(), ProfileError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ProfileError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

const FUNDAMENTAL_BAND_HZ: (f32, f32) = (20_000.0, 60_000.0);
const HARMONIC_BAND_HZ: (f32, f32) = (40_000.0, 120_000.0);
const SAMPLE_RATE_RANGE_HZ: (u32, u32) = (96_000, 768_000);
const MIN_SAMPLES_PER_SYMBOL: u32 = 4;

/// Carrier parameters for the acoustic beam.
///
/// Named and versioned; the engine only ever holds the compiled form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamConfig {
    pub name: String,
    pub version: u32,
    pub fundamental_hz: Vec<f32>,
    pub harmonic_hz: Vec<f32>,
    pub sample_rate_hz: u32,
    pub symbol_rate_hz: u32,
    pub beam_angle_deg: f32,
    pub range_m: f32,
    /// Drive level in `[0, 1]`.
    pub power_level: f32,
    /// Carrier energy above which a peer is considered present.
    pub presence_threshold: f32,
    pub snr_threshold_db: f32,
    pub beamforming: bool,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            version: 1,
            fundamental_hz: vec![40_000.0, 48_000.0, 56_000.0],
            harmonic_hz: vec![80_000.0, 96_000.0, 112_000.0],
            sample_rate_hz: 384_000,
            symbol_rate_hz: 24_000,
            beam_angle_deg: 15.0,
            range_m: 20.0,
            power_level: 0.8,
            presence_threshold: 0.05,
            snr_threshold_db: 10.0,
            beamforming: true,
        }
    }
}

impl BeamConfig {
    /// Validates the carrier plan and freezes it.
    ///
    /// # Guarantees
    /// * Every carrier sits inside its band and strictly below Nyquist.
    /// * The symbol period is a whole number of samples.
    /// * `config_id` is a SHA-256 over every field, so equal configs share an id.
    pub fn compile(self) -> Result<CompiledBeamConfig, ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::EmptyName);
        }
        if self.fundamental_hz.is_empty() {
            return Err(ProfileError::NoCarriers);
        }
        if !(SAMPLE_RATE_RANGE_HZ.0..=SAMPLE_RATE_RANGE_HZ.1).contains(&self.sample_rate_hz) {
            return Err(ProfileError::SampleRate(self.sample_rate_hz));
        }
        let nyquist = self.sample_rate_hz as f32 / 2.0;
        let bands = self
            .fundamental_hz
            .iter()
            .map(|hz| ("fundamental", *hz, FUNDAMENTAL_BAND_HZ))
            .chain(
                self.harmonic_hz
                    .iter()
                    .map(|hz| ("harmonic", *hz, HARMONIC_BAND_HZ)),
            );
        for (band, hz, (min, max)) in bands {
            if !hz.is_finite() || hz < min || hz > max {
                return Err(ProfileError::CarrierOutOfBand { band, hz, min, max });
            }
            if hz >= nyquist {
                return Err(ProfileError::AboveNyquist {
                    hz,
                    sample_rate: self.sample_rate_hz,
                });
            }
        }
        if self.symbol_rate_hz == 0
            || self.sample_rate_hz % self.symbol_rate_hz != 0
            || self.sample_rate_hz / self.symbol_rate_hz < MIN_SAMPLES_PER_SYMBOL
        {
            return Err(ProfileError::SymbolRate {
                symbol_rate: self.symbol_rate_hz,
            });
        }
        ensure("beam_angle_deg", self.beam_angle_deg, 1.0, 90.0)?;
        ensure("range_m", self.range_m, 10.0, 30.0)?;
        ensure("power_level", self.power_level, 0.0, 1.0)?;
        ensure("presence_threshold", self.presence_threshold, f32::EPSILON, 1.0)?;
        ensure("snr_threshold_db", self.snr_threshold_db, 0.0, 60.0)?;

        let mut hasher = Sha256::new();
        hasher.update((self.name.len() as u64).to_be_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update(self.version.to_be_bytes());
        hasher.update((self.fundamental_hz.len() as u64).to_be_bytes());
        hasher.update((self.harmonic_hz.len() as u64).to_be_bytes());
        for hz in self.fundamental_hz.iter().chain(self.harmonic_hz.iter()) {
            hasher.update(hz.to_bits().to_be_bytes());
        }
        hasher.update(self.sample_rate_hz.to_be_bytes());
        hasher.update(self.symbol_rate_hz.to_be_bytes());
        for value in [
            self.beam_angle_deg,
            self.range_m,
            self.power_level,
            self.presence_threshold,
            self.snr_threshold_db,
        ] {
            hasher.update(value.to_bits().to_be_bytes());
        }
        hasher.update([self.beamforming as u8]);

        Ok(CompiledBeamConfig {
            samples_per_symbol: (self.sample_rate_hz / self.symbol_rate_hz) as usize,
            config_id: hex_digest(hasher),
            config: self,
        })
    }
}

/// Immutable, validated beam configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledBeamConfig {
    config: BeamConfig,
    samples_per_symbol: usize,
    config_id: String,
}

impl CompiledBeamConfig {
    pub fn config(&self) -> &BeamConfig {
        &self.config
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn samples_per_symbol(&self) -> usize {
        self.samples_per_symbol
    }
}

const MAX_PROFILE_POWER_MW: f32 = 500.0;

/// Transmit power envelope for the optical beam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerProfile {
    pub name: String,
    pub version: u32,
    pub max_power_mw: f32,
    pub optimal_power_mw: f32,
    pub min_power_mw: f32,
    pub data_rate_bps: u32,
    pub beam_angle_deg: f32,
    /// Multiplier applied to the eye-safety limit, `>= 1`.
    pub safety_margin: f32,
}

impl PowerProfile {
    fn preset(
        name: &str,
        max: f32,
        optimal: f32,
        min: f32,
        data_rate_bps: u32,
        beam_angle_deg: f32,
        safety_margin: f32,
    ) -> Self {
        Self {
            name: name.into(),
            version: 1,
            max_power_mw: max,
            optimal_power_mw: optimal,
            min_power_mw: min,
            data_rate_bps,
            beam_angle_deg,
            safety_margin,
        }
    }

    /// Built-in profile tuned for a range bucket.
    pub fn for_range_category(category: RangeCategory) -> Self {
        match category {
            RangeCategory::Close => Self::preset("close", 5.0, 2.0, 0.5, 2_000_000, 10.0, 1.0),
            RangeCategory::Medium => Self::preset("medium", 15.0, 8.0, 3.0, 1_000_000, 12.0, 1.5),
            RangeCategory::Far => Self::preset("far", 50.0, 25.0, 10.0, 500_000, 15.0, 2.0),
            RangeCategory::Extreme => {
                Self::preset("extreme", 100.0, 60.0, 20.0, 250_000, 20.0, 3.0)
            }
        }
    }

    /// Validates and freezes the profile.
    ///
    /// # Guarantees
    /// * `0 < min <= optimal <= max <= 500 mW`.
    /// * Rejected profiles leave nothing behind; callers keep their prior snapshot.
    pub fn compile(self) -> Result<CompiledPowerProfile, ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::EmptyName);
        }
        ensure("max_power_mw", self.max_power_mw, f32::EPSILON, MAX_PROFILE_POWER_MW)?;
        ensure("optimal_power_mw", self.optimal_power_mw, f32::EPSILON, MAX_PROFILE_POWER_MW)?;
        ensure("min_power_mw", self.min_power_mw, f32::EPSILON, MAX_PROFILE_POWER_MW)?;
        if !(self.min_power_mw <= self.optimal_power_mw
            && self.optimal_power_mw <= self.max_power_mw)
        {
            return Err(ProfileError::PowerOrdering);
        }
        ensure("data_rate_bps", self.data_rate_bps as f32, 1_000.0, 10_000_000.0)?;
        ensure("beam_angle_deg", self.beam_angle_deg, 0.1, 45.0)?;
        ensure("safety_margin", self.safety_margin, 1.0, 10.0)?;

        let mut hasher = Sha256::new();
        hasher.update((self.name.len() as u64).to_be_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update(self.version.to_be_bytes());
        for value in [
            self.max_power_mw,
            self.optimal_power_mw,
            self.min_power_mw,
            self.beam_angle_deg,
            self.safety_margin,
        ] {
            hasher.update(value.to_bits().to_be_bytes());
        }
        hasher.update(self.data_rate_bps.to_be_bytes());

        Ok(CompiledPowerProfile {
            config_id: hex_digest(hasher),
            profile: self,
        })
    }
}

impl Default for PowerProfile {
    fn default() -> Self {
        Self::preset("default", 5.0, 3.0, 1.0, 1_000_000, 15.0, 1.0)
    }
}

/// Validated power profile as held by the optical engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPowerProfile {
    profile: PowerProfile,
    config_id: String,
}

impl CompiledPowerProfile {
    pub fn profile(&self) -> &PowerProfile {
        &self.profile
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_distance_thresholds() {
        assert_eq!(RangeCategory::from_distance(10.0), RangeCategory::Close);
        assert_eq!(RangeCategory::from_distance(50.0), RangeCategory::Medium);
        assert_eq!(RangeCategory::from_distance(149.9), RangeCategory::Far);
        assert_eq!(RangeCategory::from_distance(150.0), RangeCategory::Extreme);
        assert!(RangeCategory::Close < RangeCategory::Extreme);
    }

    #[test]
    fn default_beam_config_compiles() {
        let compiled = BeamConfig::default().compile().unwrap();
        assert_eq!(compiled.samples_per_symbol(), 16);
        assert_eq!(compiled.config_id().len(), 64);
    }

    #[test]
    fn config_id_tracks_content() {
        let a = BeamConfig::default().compile().unwrap();
        let b = BeamConfig::default().compile().unwrap();
        let c = BeamConfig {
            power_level: 0.5,
            ..BeamConfig::default()
        }
        .compile()
        .unwrap();
        assert_eq!(a.config_id(), b.config_id());
        assert_ne!(a.config_id(), c.config_id());
    }

    #[test]
    fn config_id_keeps_carrier_lists_apart() {
        let split = |fundamentals: usize, harmonics: usize| {
            BeamConfig {
                fundamental_hz: vec![45_000.0; fundamentals],
                harmonic_hz: vec![45_000.0; harmonics],
                ..BeamConfig::default()
            }
            .compile()
            .unwrap()
        };
        // 257 wraps to 1 in a byte-wide count
        assert_ne!(split(257, 1).config_id(), split(1, 257).config_id());
        assert_ne!(split(2, 1).config_id(), split(1, 2).config_id());
    }

    #[test]
    fn carrier_above_nyquist_rejected() {
        let err = BeamConfig {
            sample_rate_hz: 192_000,
            ..BeamConfig::default()
        }
        .compile()
        .unwrap_err();
        assert!(matches!(err, ProfileError::AboveNyquist { .. }));
    }

    #[test]
    fn beam_range_bounds() {
        let err = BeamConfig {
            range_m: 31.0,
            ..BeamConfig::default()
        }
        .compile()
        .unwrap_err();
        assert!(matches!(err, ProfileError::OutOfRange { field: "range_m", .. }));
    }

    #[test]
    fn presets_compile() {
        for category in [
            RangeCategory::Close,
            RangeCategory::Medium,
            RangeCategory::Far,
            RangeCategory::Extreme,
        ] {
            let compiled = PowerProfile::for_range_category(category).compile().unwrap();
            assert_eq!(compiled.profile().name, category.as_str());
        }
    }

    #[test]
    fn power_ordering_enforced() {
        let err = PowerProfile {
            optimal_power_mw: 9.0,
            ..PowerProfile::default()
        }
        .compile()
        .unwrap_err();
        assert_eq!(err, ProfileError::PowerOrdering);
    }
}
