use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Handshake and lifecycle states of a session.
///
/// Transitions only move forward within a handshake attempt; `Error` and
/// `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    HandshakeInitiated,
    NonceExchanged,
    QrVerified,
    Established,
    Closed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal session transition {from} -> {to}")]
pub struct SessionStateError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    /// True once the handshake is complete and before close.
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Established)
    }

    /// Pre-`Established` handshake states in which bootstrap material is accepted.
    pub fn accepts_bootstrap(&self) -> bool {
        matches!(
            self,
            SessionState::HandshakeInitiated | SessionState::NonceExchanged
        )
    }

    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = match (self, next) {
            (Idle, HandshakeInitiated) => true,
            (HandshakeInitiated, NonceExchanged) => true,
            (HandshakeInitiated, QrVerified) => true,
            (NonceExchanged, QrVerified) => true,
            (NonceExchanged, Established) => true,
            (QrVerified, Established) => true,
            (from, Closed) => !from.is_terminal(),
            (from, Error) => !from.is_terminal(),
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::HandshakeInitiated => "handshake_initiated",
            SessionState::NonceExchanged => "nonce_exchanged",
            SessionState::QrVerified => "qr_verified",
            SessionState::Established => "established",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
