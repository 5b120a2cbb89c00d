//! Out-of-band bootstrap blob and its printable QR text form.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{CryptoError, NodeCredentials, PUBLIC_KEY_LEN};

pub const QR_PAYLOAD_VERSION: u8 = 1;
/// Binary capacity of a version 40 QR symbol at low error correction.
pub const QR_MAX_BYTES: usize = 2953;

const QR_TEXT_PREFIX: &str = "BLQR1:";
const QR_SIGNING_LABEL: &[u8] = b"beamlink qr v1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QrCodecError {
    #[error("qr payload empty")]
    Empty,
    #[error("qr payload of {0} bytes exceeds symbol capacity")]
    TooLarge(usize),
    #[error("qr text missing prefix")]
    MissingPrefix,
    #[error("qr text decode: {0}")]
    Decode(String),
}

/// Bytes <-> printable text capability used for the bootstrap channel.
pub trait QrCodec: Send + Sync {
    fn encode(&self, bytes: &[u8]) -> Result<String, QrCodecError>;
    fn decode(&self, text: &str) -> Result<Vec<u8>, QrCodecError>;
}

/// Prefixed URL-safe base64, suitable for alphanumeric QR payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64QrCodec;

impl QrCodec for Base64QrCodec {
    fn encode(&self, bytes: &[u8]) -> Result<String, QrCodecError> {
        if bytes.is_empty() {
            return Err(QrCodecError::Empty);
        }
        if bytes.len() > QR_MAX_BYTES {
            return Err(QrCodecError::TooLarge(bytes.len()));
        }
        Ok(format!("{QR_TEXT_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
    }

    fn decode(&self, text: &str) -> Result<Vec<u8>, QrCodecError> {
        let body = text
            .trim()
            .strip_prefix(QR_TEXT_PREFIX)
            .ok_or(QrCodecError::MissingPrefix)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| QrCodecError::Decode(e.to_string()))?;
        if bytes.is_empty() {
            return Err(QrCodecError::Empty);
        }
        if bytes.len() > QR_MAX_BYTES {
            return Err(QrCodecError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }
}

/// Peer identity learned from a verified bootstrap blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerIdentity {
    pub device_id: Uuid,
    pub identity_key: [u8; 32],
}

/// Signed bootstrap blob carried out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    pub version: u8,
    pub device_id: Uuid,
    pub identity_key: Vec<u8>,
    pub public_material: Vec<u8>,
    pub signature: Vec<u8>,
}

impl QrPayload {
    pub fn build(creds: &NodeCredentials, device_id: Uuid, public: &[u8; PUBLIC_KEY_LEN]) -> Self {
        let signature = creds.sign(&signing_input(&device_id, public)).to_vec();
        Self {
            version: QR_PAYLOAD_VERSION,
            device_id,
            identity_key: creds.public_bytes().to_vec(),
            public_material: public.to_vec(),
            signature,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        serde_cbor::to_vec(self).map_err(|e| format!("encode qr payload: {e}"))
    }

    /// Parses and shape-checks a blob without verifying the signature.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let payload: QrPayload =
            serde_cbor::from_slice(bytes).map_err(|e| format!("decode qr payload: {e}"))?;
        if payload.version != QR_PAYLOAD_VERSION {
            return Err(format!("unsupported qr payload version {}", payload.version));
        }
        if payload.identity_key.len() != 32 || payload.public_material.len() != PUBLIC_KEY_LEN {
            return Err("qr payload key material has wrong length".into());
        }
        Ok(payload)
    }

    /// Verifies the self-signature, returning the peer's public material.
    pub fn verify(&self) -> Result<(PeerIdentity, [u8; PUBLIC_KEY_LEN]), CryptoError> {
        let identity_key: [u8; 32] = self
            .identity_key
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Signature)?;
        let public: [u8; PUBLIC_KEY_LEN] = self
            .public_material
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Signature)?;
        NodeCredentials::verify_with(
            &identity_key,
            &signing_input(&self.device_id, &public),
            &self.signature,
        )?;
        Ok((
            PeerIdentity {
                device_id: self.device_id,
                identity_key,
            },
            public,
        ))
    }
}

fn signing_input(device_id: &Uuid, public: &[u8; PUBLIC_KEY_LEN]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(QR_SIGNING_LABEL.len() + PUBLIC_KEY_LEN + 16);
    msg.extend_from_slice(QR_SIGNING_LABEL);
    msg.extend_from_slice(public);
    msg.extend_from_slice(device_id.as_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrip_and_prefix() {
        let codec = Base64QrCodec;
        let text = codec.encode(b"\x00\x01bootstrap").unwrap();
        assert!(text.starts_with("BLQR1:"));
        assert_eq!(codec.decode(&text).unwrap(), b"\x00\x01bootstrap");
        assert_eq!(codec.decode("nope"), Err(QrCodecError::MissingPrefix));
        assert!(matches!(codec.decode("BLQR1:!!"), Err(QrCodecError::Decode(_))));
    }

    #[test]
    fn codec_capacity_limit() {
        let codec = Base64QrCodec;
        assert!(codec.encode(&vec![1u8; QR_MAX_BYTES]).is_ok());
        assert_eq!(
            codec.encode(&vec![1u8; QR_MAX_BYTES + 1]),
            Err(QrCodecError::TooLarge(QR_MAX_BYTES + 1))
        );
        assert_eq!(codec.encode(&[]), Err(QrCodecError::Empty));
    }

    #[test]
    fn payload_signature_binds_material() {
        let creds = NodeCredentials::generate();
        let device = Uuid::new_v4();
        let payload = QrPayload::build(&creds, device, &[9u8; 32]);
        let decoded = QrPayload::from_bytes(&payload.to_bytes().unwrap()).unwrap();
        let (peer, public) = decoded.verify().unwrap();
        assert_eq!(peer.device_id, device);
        assert_eq!(public, [9u8; 32]);

        let mut tampered = decoded.clone();
        tampered.public_material[0] ^= 0xff;
        assert_eq!(tampered.verify().unwrap_err(), CryptoError::Signature);
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(QrPayload::from_bytes(b"not cbor at all").is_err());
    }
}
