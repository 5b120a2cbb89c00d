//! Handle-based facade over sessions and physical-channel engines.
//!
//! Every instance lives in a generation-checked registry and is addressed by a
//! typed [`crate::registry::Handle`]; every call returns a
//! [`crate::error::LinkError`] instead of panicking.
pub mod client;

pub use client::{AcousticHandle, BeamLink, DetectorHandle, OpticalHandle, SessionHandle};
