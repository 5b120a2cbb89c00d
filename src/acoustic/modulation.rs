//! Parametric waveform synthesis.
//!
//! Frame bytes are protected with Hamming(7,4) (two codewords per byte, high
//! nibble first) and on/off keyed onto the sum of every configured carrier:
//! a `1` symbol is a burst of all carriers, a `0` symbol is silence. Harmonic
//! carriers are driven at 70% of the fundamental level. With beamforming on,
//! each carrier gets a progressive delay-and-sum phase for the configured
//! beam angle.
use std::f32::consts::PI;

use serde::Serialize;

use crate::profile::CompiledBeamConfig;

const HARMONIC_GAIN: f32 = 0.7;
/// Mean-square energy separating an on symbol from silence.
const SYMBOL_ENERGY_FLOOR: f32 = 1e-6;

/// Sampled carrier waveform ready for the transducer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waveform {
    pub sample_rate_hz: u32,
    pub samples_per_symbol: usize,
    pub samples: Vec<f32>,
}

impl Waveform {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate_hz as f64
    }

    /// Mean-square amplitude over the whole waveform.
    pub fn energy(&self) -> f32 {
        mean_square(&self.samples)
    }
}

struct Carrier {
    omega: f32,
    amplitude: f32,
    phase: f32,
}

fn carriers(config: &CompiledBeamConfig) -> Vec<Carrier> {
    let cfg = config.config();
    let sample_rate = cfg.sample_rate_hz as f32;
    let total = (cfg.fundamental_hz.len() + cfg.harmonic_hz.len()) as f32;
    let steer = if cfg.beamforming {
        PI * cfg.beam_angle_deg.to_radians().sin()
    } else {
        0.0
    };
    cfg.fundamental_hz
        .iter()
        .map(|hz| (*hz, 1.0))
        .chain(cfg.harmonic_hz.iter().map(|hz| (*hz, HARMONIC_GAIN)))
        .enumerate()
        .map(|(idx, (hz, gain))| Carrier {
            omega: 2.0 * PI * hz / sample_rate,
            amplitude: cfg.power_level * gain / total,
            phase: steer * idx as f32,
        })
        .collect()
}

/// Encodes `frame` into a carrier waveform.
pub fn synthesize(config: &CompiledBeamConfig, frame: &[u8]) -> Waveform {
    let sps = config.samples_per_symbol();
    let bits = fec_encode(frame);
    let carriers = carriers(config);
    let mut samples = vec![0.0f32; bits.len() * sps];
    for (symbol, bit) in bits.iter().enumerate() {
        if !bit {
            continue;
        }
        let start = symbol * sps;
        for (offset, sample) in samples[start..start + sps].iter_mut().enumerate() {
            let n = (start + offset) as f32;
            *sample = carriers
                .iter()
                .map(|c| c.amplitude * (c.omega * n + c.phase).sin())
                .sum();
        }
    }
    Waveform {
        sample_rate_hz: config.config().sample_rate_hz,
        samples_per_symbol: sps,
        samples,
    }
}

/// Recovers frame bytes from an on/off keyed waveform, correcting single-bit
/// errors per codeword. Trailing partial symbols and codewords are ignored.
pub fn demodulate(samples: &[f32], samples_per_symbol: usize) -> Vec<u8> {
    if samples_per_symbol == 0 {
        return Vec::new();
    }
    let bits: Vec<bool> = samples
        .chunks_exact(samples_per_symbol)
        .map(|symbol| mean_square(symbol) > SYMBOL_ENERGY_FLOOR)
        .collect();
    fec_decode(&bits)
}

fn mean_square(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32
}

/// Hamming(7,4): `[p1, p2, d1, p3, d2, d3, d4]`.
fn hamming_encode(nibble: u8) -> [bool; 7] {
    let d1 = nibble & 0b1000 != 0;
    let d2 = nibble & 0b0100 != 0;
    let d3 = nibble & 0b0010 != 0;
    let d4 = nibble & 0b0001 != 0;
    let p1 = d1 ^ d2 ^ d4;
    let p2 = d1 ^ d3 ^ d4;
    let p3 = d2 ^ d3 ^ d4;
    [p1, p2, d1, p3, d2, d3, d4]
}

fn hamming_decode(code: &[bool]) -> u8 {
    let mut c = [false; 7];
    c.copy_from_slice(&code[..7]);
    let s1 = c[0] ^ c[2] ^ c[4] ^ c[6];
    let s2 = c[1] ^ c[2] ^ c[5] ^ c[6];
    let s3 = c[3] ^ c[4] ^ c[5] ^ c[6];
    let syndrome = (s1 as usize) | ((s2 as usize) << 1) | ((s3 as usize) << 2);
    if syndrome != 0 {
        c[syndrome - 1] = !c[syndrome - 1];
    }
    ((c[2] as u8) << 3) | ((c[4] as u8) << 2) | ((c[5] as u8) << 1) | (c[6] as u8)
}

pub fn fec_encode(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 14);
    for byte in bytes {
        bits.extend_from_slice(&hamming_encode(byte >> 4));
        bits.extend_from_slice(&hamming_encode(byte & 0x0f));
    }
    bits
}

pub fn fec_decode(bits: &[bool]) -> Vec<u8> {
    bits.chunks_exact(14)
        .map(|pair| (hamming_decode(&pair[..7]) << 4) | hamming_decode(&pair[7..]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::BeamConfig;

    #[test]
    fn hamming_corrects_any_single_flip() {
        for nibble in 0u8..16 {
            let code = hamming_encode(nibble);
            assert_eq!(hamming_decode(&code), nibble);
            for flip in 0..7 {
                let mut damaged = code;
                damaged[flip] = !damaged[flip];
                assert_eq!(hamming_decode(&damaged), nibble, "nibble {nibble} flip {flip}");
            }
        }
    }

    #[test]
    fn waveform_demodulates_to_frame_bytes() {
        let config = BeamConfig::default().compile().unwrap();
        let frame = b"\xB5\x1Cparametric".to_vec();
        let wave = synthesize(&config, &frame);
        assert_eq!(wave.samples.len(), frame.len() * 14 * config.samples_per_symbol());
        assert!(wave.samples.iter().all(|s| s.abs() <= 1.0));
        assert_eq!(demodulate(&wave.samples, wave.samples_per_symbol), frame);
    }

    #[test]
    fn single_symbol_dropout_is_corrected() {
        let config = BeamConfig::default().compile().unwrap();
        let wave = synthesize(&config, &[0xFF]);
        let sps = wave.samples_per_symbol;
        let mut damaged = wave.samples.clone();
        damaged[..sps].iter_mut().for_each(|s| *s = 0.0);
        assert_eq!(demodulate(&damaged, sps), vec![0xFF]);
    }
}
