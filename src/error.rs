//! Boundary error taxonomy.
//!
//! Component modules raise their own `thiserror` enums; everything that crosses
//! the handle-based API is folded into [`LinkError`] so callers match on a small,
//! stable set of failure kinds.
use thiserror::Error;

use crate::acoustic::AcousticError;
use crate::bounds::BoundsError;
use crate::channel::ChannelError;
use crate::crypto::CryptoError;
use crate::optical::OpticalError;
use crate::profile::ProfileError;
use crate::range::RangeError;
use crate::session::SessionError;

/// Failure kinds surfaced by the public API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LinkError {
    /// Unknown or destroyed instance handle.
    #[error("invalid handle")]
    InvalidHandle,
    /// Value outside its documented bounds or undecodable input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation is illegal in the instance's current state.
    #[error("wrong state: {0}")]
    WrongState(String),
    /// Authentication, replay or key agreement failure. Always fails closed.
    #[error("crypto failure")]
    CryptoFailure,
    /// A required physical modality is absent or its driver faulted.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),
    /// A bounded wait elapsed.
    #[error("timed out")]
    Timeout,
    /// Emergency shutdown is latched; cleared only by an explicit reset.
    #[error("safety trip latched: {0}")]
    SafetyTrip(String),
}

impl From<BoundsError> for LinkError {
    fn from(err: BoundsError) -> Self {
        LinkError::InvalidArgument(err.to_string())
    }
}

impl From<ProfileError> for LinkError {
    fn from(err: ProfileError) -> Self {
        LinkError::InvalidArgument(err.to_string())
    }
}

impl From<CryptoError> for LinkError {
    fn from(_: CryptoError) -> Self {
        LinkError::CryptoFailure
    }
}

impl From<SessionError> for LinkError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::WrongState { .. } => LinkError::WrongState(err.to_string()),
            SessionError::InvalidArgument(msg) => LinkError::InvalidArgument(msg),
            SessionError::Crypto(_) | SessionError::KeyConfirmation => LinkError::CryptoFailure,
        }
    }
}

impl From<ChannelError> for LinkError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotEstablished => LinkError::WrongState(err.to_string()),
            ChannelError::Session(inner) => inner.into(),
            ChannelError::Transport(reason) => LinkError::HardwareUnavailable(reason),
        }
    }
}

impl From<RangeError> for LinkError {
    fn from(err: RangeError) -> Self {
        match err {
            RangeError::WrongState { .. } => LinkError::WrongState(err.to_string()),
            RangeError::InvalidArgument(msg) => LinkError::InvalidArgument(msg),
            RangeError::Bounds(inner) => inner.into(),
            RangeError::NoSignal(_) => LinkError::HardwareUnavailable(err.to_string()),
            RangeError::Sensor(_) | RangeError::HardwareUnavailable(_) => {
                LinkError::HardwareUnavailable(err.to_string())
            }
            RangeError::NoMeasurement => LinkError::WrongState(err.to_string()),
            RangeError::HistoryIndex { .. } => LinkError::InvalidArgument(err.to_string()),
        }
    }
}

impl From<AcousticError> for LinkError {
    fn from(err: AcousticError) -> Self {
        match err {
            AcousticError::WrongState { .. } => LinkError::WrongState(err.to_string()),
            AcousticError::Bounds(inner) => inner.into(),
            AcousticError::Profile(inner) => inner.into(),
            AcousticError::Transducer(_) | AcousticError::HardwareUnavailable(_) => {
                LinkError::HardwareUnavailable(err.to_string())
            }
            AcousticError::QueueFull => LinkError::WrongState(err.to_string()),
        }
    }
}

impl From<OpticalError> for LinkError {
    fn from(err: OpticalError) -> Self {
        match err {
            OpticalError::WrongState { .. } => LinkError::WrongState(err.to_string()),
            OpticalError::InvalidConfig(msg) => LinkError::InvalidArgument(msg),
            OpticalError::Bounds(inner) => inner.into(),
            OpticalError::Profile(inner) => inner.into(),
            OpticalError::Misaligned { .. } => LinkError::WrongState(err.to_string()),
            OpticalError::AlignmentFailed { .. } => LinkError::WrongState(err.to_string()),
            OpticalError::SignalSource(_)
            | OpticalError::Driver(_)
            | OpticalError::HardwareUnavailable(_) => {
                LinkError::HardwareUnavailable(err.to_string())
            }
            OpticalError::Timeout(_) => LinkError::Timeout,
            OpticalError::MalformedFrame => LinkError::InvalidArgument(err.to_string()),
            OpticalError::SafetyTrip(reason) => LinkError::SafetyTrip(reason),
            OpticalError::Ecc(_) => LinkError::InvalidArgument(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_trip_keeps_reason() {
        let err: LinkError = OpticalError::SafetyTrip("energy budget exceeded".into()).into();
        assert_eq!(err, LinkError::SafetyTrip("energy budget exceeded".into()));
    }

    #[test]
    fn crypto_errors_collapse() {
        let err: LinkError = SessionError::Crypto(CryptoError::Authentication).into();
        assert_eq!(err, LinkError::CryptoFailure);
    }
}
