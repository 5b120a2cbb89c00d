use std::io::BufReader;

use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use zeroize::Zeroize;

use super::CryptoError;

/// Long-term Ed25519 identity of a device.
#[derive(Debug, Clone)]
pub struct NodeCredentials {
    pub signing: SigningKey,
    pub verifying: VerifyingKey,
}

impl NodeCredentials {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let signing = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Self::from_signing(signing)
    }

    pub fn from_signing(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// Loads a provisioned PKCS#8 PEM private key.
    ///
    /// # Errors
    /// Returns `CryptoError::Credentials` when no PKCS#8 block is present or the
    /// key is not Ed25519.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        let mut reader = BufReader::new(pem.as_bytes());
        let key = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .next()
            .ok_or_else(|| CryptoError::Credentials("no PKCS#8 private key block".into()))?
            .map_err(|e| CryptoError::Credentials(e.to_string()))?;
        let signing = SigningKey::from_pkcs8_der(key.secret_pkcs8_der())
            .map_err(|e| CryptoError::Credentials(e.to_string()))?;
        Ok(Self::from_signing(signing))
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing.sign(msg)
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        self.verifying.verify(msg, sig).is_ok()
    }

    /// Verifies a signature against a peer's raw public key.
    pub fn verify_with(public: &[u8; 32], msg: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::Signature)?;
        let sig = Signature::from_slice(signature).map_err(|_| CryptoError::Signature)?;
        key.verify_strict(msg, &sig).map_err(|_| CryptoError::Signature)
    }
}

/// Signs and checks proximity challenges.
pub trait ChallengeAuthenticator {
    fn sign_challenge(&self, challenge: &[u8]) -> Vec<u8>;
    fn verify_challenge(&self, challenge: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519-based authenticator using loaded credentials.
///
/// Verification is against a pinned peer key learned during bootstrap.
pub struct Ed25519Authenticator {
    creds: NodeCredentials,
    peer: Option<[u8; 32]>,
}

impl Ed25519Authenticator {
    pub fn new(creds: NodeCredentials) -> Self {
        Self { creds, peer: None }
    }

    pub fn with_peer(creds: NodeCredentials, peer: [u8; 32]) -> Self {
        Self {
            creds,
            peer: Some(peer),
        }
    }
}

impl ChallengeAuthenticator for Ed25519Authenticator {
    fn sign_challenge(&self, challenge: &[u8]) -> Vec<u8> {
        self.creds.sign(challenge).to_vec()
    }

    fn verify_challenge(&self, challenge: &[u8], signature: &[u8]) -> bool {
        match self.peer {
            Some(peer) => NodeCredentials::verify_with(&peer, challenge, signature).is_ok(),
            None => Signature::from_slice(signature)
                .map(|sig| self.creds.verify(challenge, &sig))
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip() {
        let creds = NodeCredentials::generate();
        let sig = creds.sign(b"challenge");
        assert!(creds.verify(b"challenge", &sig));
        let public = creds.public_bytes();
        assert!(NodeCredentials::verify_with(&public, b"challenge", &sig.to_bytes()).is_ok());
        assert!(NodeCredentials::verify_with(&public, b"other", &sig.to_bytes()).is_err());
    }

    #[test]
    fn pinned_peer_authenticator() {
        let local = NodeCredentials::generate();
        let remote = NodeCredentials::generate();
        let remote_auth = Ed25519Authenticator::new(remote.clone());
        let sig = remote_auth.sign_challenge(b"nonce");

        let pinned = Ed25519Authenticator::with_peer(local, remote.public_bytes());
        assert!(pinned.verify_challenge(b"nonce", &sig));
        assert!(!pinned.verify_challenge(b"nonce2", &sig));
    }

    #[test]
    fn pem_without_key_block_rejected() {
        let pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        let err = NodeCredentials::from_pkcs8_pem(pem).unwrap_err();
        assert!(matches!(err, CryptoError::Credentials(_)));
    }
}
