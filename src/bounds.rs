//! Input validation shared by every boundary-facing operation.
use std::fmt::Display;

use thiserror::Error;

/// Hard cap on any opaque channel payload.
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundsError {
    #[error("{what} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        what: &'static str,
        min: String,
        max: String,
        value: String,
    },
    #[error("{what} is not a finite number")]
    NotFinite { what: &'static str },
    #[error("{what} exceeds {limit} bytes ({len})")]
    TooLarge {
        what: &'static str,
        limit: usize,
        len: usize,
    },
    #[error("{what} must not be empty")]
    Empty { what: &'static str },
}

/// Rejects payloads above [`MAX_PAYLOAD_BYTES`].
pub fn check_payload(what: &'static str, bytes: &[u8]) -> Result<(), BoundsError> {
    check_len(what, bytes, MAX_PAYLOAD_BYTES)
}

/// Rejects empty payloads and payloads above [`MAX_PAYLOAD_BYTES`].
pub fn check_nonempty_payload(what: &'static str, bytes: &[u8]) -> Result<(), BoundsError> {
    if bytes.is_empty() {
        return Err(BoundsError::Empty { what });
    }
    check_payload(what, bytes)
}

pub fn check_len(what: &'static str, bytes: &[u8], limit: usize) -> Result<(), BoundsError> {
    if bytes.len() > limit {
        return Err(BoundsError::TooLarge {
            what,
            limit,
            len: bytes.len(),
        });
    }
    Ok(())
}

/// Inclusive range check for integers.
pub fn check_range<T>(what: &'static str, value: T, min: T, max: T) -> Result<T, BoundsError>
where
    T: PartialOrd + Display + Copy,
{
    if value < min || value > max {
        return Err(BoundsError::OutOfRange {
            what,
            min: min.to_string(),
            max: max.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Inclusive range check for floats; NaN and infinities are rejected.
pub fn check_f32(what: &'static str, value: f32, min: f32, max: f32) -> Result<f32, BoundsError> {
    if !value.is_finite() {
        return Err(BoundsError::NotFinite { what });
    }
    check_range(what, value, min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_edges_are_inclusive() {
        assert_eq!(check_range("intensity", 0, 0, 100), Ok(0));
        assert_eq!(check_range("intensity", 100, 0, 100), Ok(100));
        assert!(check_range("intensity", -1, 0, 100).is_err());
        assert!(check_range("intensity", 101, 0, 100).is_err());
    }

    #[test]
    fn nan_is_rejected() {
        assert_eq!(
            check_f32("x", f32::NAN, -1.0, 1.0),
            Err(BoundsError::NotFinite { what: "x" })
        );
    }

    #[test]
    fn payload_cap() {
        let big = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert!(check_payload("payload", &big).is_err());
        assert!(check_payload("payload", &big[..MAX_PAYLOAD_BYTES]).is_ok());
        assert!(check_nonempty_payload("payload", &[]).is_err());
    }
}
