use serde::{Deserialize, Serialize};

use crate::bounds::{self, BoundsError};

const STANDARD_PRESSURE_HPA: f64 = 1013.25;

/// Atmospheric snapshot used to compensate the speed of sound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalConditions {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub pressure_hpa: f32,
    pub wind_speed_mps: f32,
    pub visibility_m: f32,
}

impl Default for EnvironmentalConditions {
    fn default() -> Self {
        Self {
            temperature_c: 20.0,
            humidity_pct: 50.0,
            pressure_hpa: 1013.25,
            wind_speed_mps: 0.0,
            visibility_m: 10_000.0,
        }
    }
}

impl EnvironmentalConditions {
    /// Rejects the first out-of-range or non-finite field.
    pub fn validate(&self) -> Result<(), BoundsError> {
        bounds::check_f32("temperature_c", self.temperature_c, -100.0, 100.0)?;
        bounds::check_f32("humidity_pct", self.humidity_pct, 0.0, 100.0)?;
        bounds::check_f32("pressure_hpa", self.pressure_hpa, 800.0, 1200.0)?;
        bounds::check_f32("wind_speed_mps", self.wind_speed_mps, 0.0, 100.0)?;
        bounds::check_f32("visibility_m", self.visibility_m, 0.0, 50_000.0)?;
        Ok(())
    }

    /// Compensated speed of sound in m/s.
    pub fn speed_of_sound(&self) -> f64 {
        let t = self.temperature_c as f64;
        let h = self.humidity_pct as f64;
        let p = self.pressure_hpa as f64;
        let w = self.wind_speed_mps as f64;
        let base = 331.3 + 0.606 * t;
        let humidity = 1.0 + 1.2e-5 * h * h.sqrt();
        let pressure = (p / STANDARD_PRESSURE_HPA).sqrt();
        base * humidity * pressure + 0.001 * w * w.abs()
    }
}
