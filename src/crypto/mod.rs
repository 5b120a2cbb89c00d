//! Key agreement, key schedule and payload sealing for beam sessions.
//!
//! X25519 for agreement, HKDF-SHA256 for the key schedule, and an AEAD behind
//! the [`PayloadCipher`] seam (ChaCha20-Poly1305 by default).
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub mod identity;
pub mod replay;

pub use identity::{ChallengeAuthenticator, Ed25519Authenticator, NodeCredentials};
pub use replay::ReplayWindow;

const KEY_SCHEDULE_INFO: &[u8] = b"beamlink session v1";
const SAS_LABEL: &[u8] = b"beamlink sas";
const ACK_LABEL: &[u8] = b"beamlink key confirmation";

pub const PUBLIC_KEY_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const BINDING_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    Authentication,
    #[error("replayed or stale counter")]
    Replay,
    #[error("send counter exhausted")]
    CounterExhausted,
    #[error("peer public value is low order")]
    NonContributory,
    #[error("peer public value reflects our own")]
    Reflection,
    #[error("malformed ciphertext")]
    MalformedCiphertext,
    #[error("unsupported ciphertext version {0}")]
    UnsupportedVersion(u8),
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("signature invalid")]
    Signature,
    #[error("credential load failed: {0}")]
    Credentials(String),
}

/// Key agreement seam.
pub trait KeyExchange {
    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN];
    fn derive_shared(
        &self,
        peer: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError>;
}

/// X25519 ephemeral key pair.
///
/// Uses a static secret so a rejected peer value does not consume the key.
pub struct X25519KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyExchange {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl Default for X25519KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange for X25519KeyExchange {
    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    fn derive_shared(
        &self,
        peer: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        if peer == self.public.as_bytes() {
            return Err(CryptoError::Reflection);
        }
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

/// Which side of the canonical key ordering we sit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Low,
    High,
}

/// Directional traffic keys plus confirmation material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    tx_key: [u8; KEY_LEN],
    rx_key: [u8; KEY_LEN],
    confirm_key: [u8; KEY_LEN],
    binding: [u8; BINDING_LEN],
    #[zeroize(skip)]
    role: KeyRole,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("role", &self.role)
            .field("binding", &hex(&self.binding))
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Runs the key schedule over a shared secret and both public values.
    ///
    /// Both sides feed the public values in canonical (byte-sorted) order, so
    /// they agree on the salt and on which expanded key each direction uses.
    pub fn derive(
        shared: &[u8; 32],
        local_public: &[u8; PUBLIC_KEY_LEN],
        peer_public: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<Self, CryptoError> {
        let role = if local_public < peer_public {
            KeyRole::Low
        } else if local_public > peer_public {
            KeyRole::High
        } else {
            return Err(CryptoError::Reflection);
        };
        let (low, high) = match role {
            KeyRole::Low => (local_public, peer_public),
            KeyRole::High => (peer_public, local_public),
        };
        let mut salt = [0u8; PUBLIC_KEY_LEN * 2];
        salt[..PUBLIC_KEY_LEN].copy_from_slice(low);
        salt[PUBLIC_KEY_LEN..].copy_from_slice(high);

        let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);
        let mut okm = Zeroizing::new([0u8; KEY_LEN * 3 + BINDING_LEN]);
        hk.expand(KEY_SCHEDULE_INFO, &mut okm[..])
            .map_err(|_| CryptoError::KeyDerivation)?;

        let mut low_to_high = [0u8; KEY_LEN];
        let mut high_to_low = [0u8; KEY_LEN];
        let mut confirm_key = [0u8; KEY_LEN];
        let mut binding = [0u8; BINDING_LEN];
        low_to_high.copy_from_slice(&okm[..KEY_LEN]);
        high_to_low.copy_from_slice(&okm[KEY_LEN..KEY_LEN * 2]);
        confirm_key.copy_from_slice(&okm[KEY_LEN * 2..KEY_LEN * 3]);
        binding.copy_from_slice(&okm[KEY_LEN * 3..]);

        let (tx_key, rx_key) = match role {
            KeyRole::Low => (low_to_high, high_to_low),
            KeyRole::High => (high_to_low, low_to_high),
        };
        low_to_high.zeroize();
        high_to_low.zeroize();
        Ok(Self {
            tx_key,
            rx_key,
            confirm_key,
            binding,
            role,
        })
    }

    pub fn tx_key(&self) -> &[u8; KEY_LEN] {
        &self.tx_key
    }

    pub fn rx_key(&self) -> &[u8; KEY_LEN] {
        &self.rx_key
    }

    /// Transcript-derived identifier bound into every AEAD call.
    pub fn binding(&self) -> &[u8; BINDING_LEN] {
        &self.binding
    }

    pub fn role(&self) -> KeyRole {
        self.role
    }

    /// Six-digit short authentication string; equal on both peers.
    pub fn confirmation_code(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.confirm_key);
        hasher.update(SAS_LABEL);
        let digest = hasher.finalize();
        let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        format!("{:06}", value % 1_000_000)
    }

    /// Key-confirmation tag as sent by the holder of `role`.
    pub fn confirmation_tag(&self, role: KeyRole) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.confirm_key);
        hasher.update(ACK_LABEL);
        hasher.update([role as u8]);
        hasher.finalize().into()
    }

    /// Checks a tag produced by the peer.
    pub fn verify_peer_tag(&self, tag: &[u8]) -> bool {
        let peer_role = match self.role {
            KeyRole::Low => KeyRole::High,
            KeyRole::High => KeyRole::Low,
        };
        constant_time_eq(&self.confirmation_tag(peer_role), tag)
    }
}

/// Authenticated encryption capability.
pub trait PayloadCipher: Send + Sync {
    fn seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// ChaCha20-Poly1305 implementation of [`PayloadCipher`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaPolyCipher;

impl PayloadCipher for ChaChaPolyCipher {
    fn seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)
    }

    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::MalformedCiphertext);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)
    }
}

/// 96-bit nonce: four zero bytes followed by the big-endian counter.
pub fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
