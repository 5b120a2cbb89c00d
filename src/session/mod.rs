//! Authenticated session: handshake state machine, payload sealing and the
//! audio framing queues the acoustic engine drains.
//!
//! A session is driven entirely by caller input (nonces, bootstrap blobs,
//! acknowledgements); it never talks to a transport itself.
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bounds::{self, MAX_PAYLOAD_BYTES};
use crate::crypto::{
    counter_nonce, ChaChaPolyCipher, CryptoError, KeyExchange, NodeCredentials, PayloadCipher,
    ReplayWindow, SessionKeys, X25519KeyExchange, BINDING_LEN, PUBLIC_KEY_LEN, TAG_LEN,
};

pub mod qr;
pub mod state;

pub use qr::{Base64QrCodec, PeerIdentity, QrCodec, QrCodecError, QrPayload};
pub use state::{SessionState, SessionStateError};

/// Version byte leading every sealed payload.
pub const CIPHERTEXT_VERSION: u8 = 1;
/// `version || counter`.
pub const CIPHERTEXT_HEADER_LEN: usize = 1 + 8;
/// Inbound audio frames held before the oldest is dropped.
pub const DEFAULT_AUDIO_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("{op} not allowed in state {state}")]
    WrongState {
        op: &'static str,
        state: SessionState,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("peer key confirmation mismatch")]
    KeyConfirmation,
}

impl From<QrCodecError> for SessionError {
    fn from(err: QrCodecError) -> Self {
        SessionError::InvalidArgument(err.to_string())
    }
}

impl From<bounds::BoundsError> for SessionError {
    fn from(err: bounds::BoundsError) -> Self {
        SessionError::InvalidArgument(err.to_string())
    }
}

struct SessionInner {
    state: SessionState,
    exchange: Option<X25519KeyExchange>,
    peer_public: Option<[u8; PUBLIC_KEY_LEN]>,
    peer_identity: Option<PeerIdentity>,
    pending: Option<SessionKeys>,
    keys: Option<SessionKeys>,
    send_counter: u64,
    replay: ReplayWindow,
    audio_out: VecDeque<Vec<u8>>,
    audio_in: VecDeque<Vec<u8>>,
}

impl SessionInner {
    fn fresh() -> Self {
        Self {
            state: SessionState::Idle,
            exchange: None,
            peer_public: None,
            peer_identity: None,
            pending: None,
            keys: None,
            send_counter: 0,
            replay: ReplayWindow::new(),
            audio_out: VecDeque::new(),
            audio_in: VecDeque::new(),
        }
    }

    fn require(&self, op: &'static str, ok: bool) -> Result<(), SessionError> {
        if ok {
            Ok(())
        } else {
            Err(SessionError::WrongState {
                op,
                state: self.state,
            })
        }
    }

    fn advance(&mut self, op: &'static str, next: SessionState) -> Result<(), SessionError> {
        self.state = self
            .state
            .transition(next)
            .map_err(|err| SessionError::WrongState { op, state: err.from })?;
        Ok(())
    }

    /// Moves to `Error` and drops every piece of key material.
    fn poison(&mut self) {
        self.state = SessionState::Error;
        self.exchange = None;
        self.pending = None;
        self.keys = None;
        self.audio_in.clear();
        self.audio_out.clear();
    }

    fn established_keys(&self, op: &'static str) -> Result<&SessionKeys, SessionError> {
        match (&self.state, &self.keys) {
            (SessionState::Established, Some(keys)) => Ok(keys),
            _ => Err(SessionError::WrongState {
                op,
                state: self.state,
            }),
        }
    }
}

/// One end of an authenticated beam session.
///
/// # Guarantees
/// * Every operation is all-or-nothing: a failed call leaves the state and
///   key material exactly as they were, except for protocol violations,
///   which move the session to `Error`.
/// * Decryption fails closed and never returns partial plaintext.
pub struct Session {
    id: Uuid,
    credentials: NodeCredentials,
    cipher: Arc<dyn PayloadCipher>,
    audio_depth: usize,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Opens a session with a fresh identity and the default cipher.
    pub fn new() -> Self {
        Self::with_parts(
            NodeCredentials::generate(),
            Arc::new(ChaChaPolyCipher),
            DEFAULT_AUDIO_QUEUE_DEPTH,
        )
    }

    pub fn with_parts(
        credentials: NodeCredentials,
        cipher: Arc<dyn PayloadCipher>,
        audio_depth: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            credentials,
            cipher,
            audio_depth: audio_depth.max(1),
            inner: Mutex::new(SessionInner::fresh()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn identity_key(&self) -> [u8; 32] {
        self.credentials.public_bytes()
    }

    /// Local ephemeral public value, once the handshake has started.
    pub fn local_public(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.inner.lock().exchange.as_ref().map(|kx| kx.public_key())
    }

    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        self.inner.lock().peer_identity.clone()
    }

    /// `Idle -> HandshakeInitiated`; returns the public value to send the peer.
    pub fn initiate_handshake(&self) -> Result<[u8; PUBLIC_KEY_LEN], SessionError> {
        let mut inner = self.inner.lock();
        inner.require("initiate_handshake", inner.state == SessionState::Idle)?;
        let exchange = X25519KeyExchange::new();
        let public = exchange.public_key();
        inner.advance("initiate_handshake", SessionState::HandshakeInitiated)?;
        inner.exchange = Some(exchange);
        info!(session = %self.id, "handshake initiated");
        Ok(public)
    }

    /// Accepts the peer's 32-byte public value and derives candidate keys.
    ///
    /// Returns the six-digit confirmation code both users can compare.
    ///
    /// # Errors
    /// * `WrongState` outside `HandshakeInitiated`.
    /// * `InvalidArgument` for a wrong length or a non-contributory value.
    pub fn receive_nonce(&self, nonce: &[u8]) -> Result<String, SessionError> {
        let mut inner = self.inner.lock();
        inner.require(
            "receive_nonce",
            inner.state == SessionState::HandshakeInitiated,
        )?;
        let peer: [u8; PUBLIC_KEY_LEN] = nonce.try_into().map_err(|_| {
            SessionError::InvalidArgument(format!(
                "nonce must be {PUBLIC_KEY_LEN} bytes, got {}",
                nonce.len()
            ))
        })?;
        let keys = derive_keys(&inner, &peer)?;
        let code = keys.confirmation_code();
        inner.advance("receive_nonce", SessionState::NonceExchanged)?;
        inner.peer_public = Some(peer);
        inner.pending = Some(keys);
        debug!(session = %self.id, "nonce exchanged");
        Ok(code)
    }

    /// Builds this side's signed bootstrap blob.
    pub fn qr_bootstrap_payload(&self) -> Result<Vec<u8>, SessionError> {
        let inner = self.inner.lock();
        let exchange = inner.exchange.as_ref().ok_or(SessionError::WrongState {
            op: "qr_bootstrap_payload",
            state: inner.state,
        })?;
        QrPayload::build(&self.credentials, self.id, &exchange.public_key())
            .to_bytes()
            .map_err(SessionError::InvalidArgument)
    }

    /// Applies a peer bootstrap blob.
    ///
    /// In `HandshakeInitiated` the blob supplies the peer public value. After a
    /// nonce exchange it must corroborate the value already received; a
    /// mismatch is a protocol violation and moves the session to `Error`.
    pub fn process_qr_payload(&self, bytes: &[u8]) -> Result<PeerIdentity, SessionError> {
        let mut inner = self.inner.lock();
        inner.require("process_qr_payload", inner.state.accepts_bootstrap())?;
        let payload = QrPayload::from_bytes(bytes).map_err(SessionError::InvalidArgument)?;
        let (identity, public) = payload.verify()?;

        match inner.state {
            SessionState::HandshakeInitiated => {
                let keys = derive_keys(&inner, &public)?;
                inner.advance("process_qr_payload", SessionState::QrVerified)?;
                inner.peer_public = Some(public);
                inner.pending = Some(keys);
            }
            _ => {
                if inner.peer_public != Some(public) {
                    warn!(session = %self.id, "bootstrap material contradicts exchanged nonce");
                    inner.poison();
                    return Err(SessionError::Crypto(CryptoError::Authentication));
                }
                inner.advance("process_qr_payload", SessionState::QrVerified)?;
            }
        }
        inner.peer_identity = Some(identity.clone());
        info!(session = %self.id, peer = %identity.device_id, "bootstrap payload verified");
        Ok(identity)
    }

    /// Tag proving to the peer that we derived the same keys.
    pub fn confirmation_tag(&self) -> Result<[u8; 32], SessionError> {
        let inner = self.inner.lock();
        let keys = inner.pending.as_ref().ok_or(SessionError::WrongState {
            op: "confirmation_tag",
            state: inner.state,
        })?;
        Ok(keys.confirmation_tag(keys.role()))
    }

    /// Completes the handshake on out-of-band confirmation.
    pub fn receive_ack(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        inner.require(
            "receive_ack",
            matches!(
                inner.state,
                SessionState::NonceExchanged | SessionState::QrVerified
            ),
        )?;
        self.establish(&mut inner)
    }

    /// Completes the handshake after checking the peer's confirmation tag.
    ///
    /// A mismatching tag means the peers hold different keys; the session
    /// moves to `Error`.
    pub fn receive_ack_tag(&self, tag: &[u8]) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        inner.require(
            "receive_ack",
            matches!(
                inner.state,
                SessionState::NonceExchanged | SessionState::QrVerified
            ),
        )?;
        let matches = inner
            .pending
            .as_ref()
            .map(|keys| keys.verify_peer_tag(tag))
            .unwrap_or(false);
        if !matches {
            warn!(session = %self.id, "key confirmation failed");
            inner.poison();
            return Err(SessionError::KeyConfirmation);
        }
        self.establish(&mut inner)
    }

    fn establish(&self, inner: &mut SessionInner) -> Result<(), SessionError> {
        if inner.pending.is_none() {
            return Err(SessionError::WrongState {
                op: "receive_ack",
                state: inner.state,
            });
        }
        inner.advance("receive_ack", SessionState::Established)?;
        inner.keys = inner.pending.take();
        inner.exchange = None;
        inner.send_counter = 0;
        inner.replay = ReplayWindow::new();
        info!(session = %self.id, "session established");
        Ok(())
    }

    /// Seals `plaintext` as `version || counter || ciphertext+tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        bounds::check_payload("plaintext", plaintext)?;
        let mut inner = self.inner.lock();
        let sealed = self.seal_locked(&mut inner, plaintext)?;
        Ok(sealed)
    }

    fn seal_locked(
        &self,
        inner: &mut SessionInner,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let counter = inner.send_counter;
        let keys = inner.established_keys("encrypt")?;
        if counter == u64::MAX {
            return Err(CryptoError::CounterExhausted.into());
        }
        let aad = associated_data(keys.binding(), counter);
        let body = self
            .cipher
            .seal(keys.tx_key(), &counter_nonce(counter), &aad, plaintext)?;
        let mut out = Vec::with_capacity(CIPHERTEXT_HEADER_LEN + body.len());
        out.push(CIPHERTEXT_VERSION);
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&body);
        inner.send_counter = counter + 1;
        Ok(out)
    }

    /// Opens a sealed payload; replays and forgeries fail closed.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        bounds::check_len(
            "ciphertext",
            ciphertext,
            MAX_PAYLOAD_BYTES + CIPHERTEXT_HEADER_LEN + TAG_LEN,
        )?;
        let mut inner = self.inner.lock();
        self.open_locked(&mut inner, ciphertext)
    }

    fn open_locked(
        &self,
        inner: &mut SessionInner,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let keys = inner.established_keys("decrypt")?;
        if ciphertext.len() < CIPHERTEXT_HEADER_LEN + TAG_LEN {
            return Err(CryptoError::MalformedCiphertext.into());
        }
        if ciphertext[0] != CIPHERTEXT_VERSION {
            return Err(CryptoError::UnsupportedVersion(ciphertext[0]).into());
        }
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&ciphertext[1..CIPHERTEXT_HEADER_LEN]);
        let counter = u64::from_be_bytes(counter_bytes);
        if !inner.replay.check(counter) {
            debug!(session = %self.id, counter, "replayed ciphertext rejected");
            return Err(CryptoError::Replay.into());
        }
        let aad = associated_data(keys.binding(), counter);
        let plaintext = self.cipher.open(
            keys.rx_key(),
            &counter_nonce(counter),
            &aad,
            &ciphertext[CIPHERTEXT_HEADER_LEN..],
        )?;
        inner.replay.commit(counter);
        Ok(plaintext)
    }

    /// Encrypts and queues a frame for the acoustic transmitter.
    pub fn send_audio_data(&self, plaintext: &[u8]) -> Result<(), SessionError> {
        bounds::check_nonempty_payload("audio payload", plaintext)?;
        let mut inner = self.inner.lock();
        let frame = self.seal_locked(&mut inner, plaintext)?;
        inner.audio_out.push_back(frame);
        Ok(())
    }

    /// Hands every queued outbound audio frame to the caller.
    pub fn drain_audio_outbound(&self) -> Vec<Vec<u8>> {
        self.inner.lock().audio_out.drain(..).collect()
    }

    /// Queues an inbound ciphertext frame received over the acoustic channel.
    pub fn deliver_audio_frame(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        bounds::check_nonempty_payload("audio frame", &frame)?;
        let mut inner = self.inner.lock();
        inner.established_keys("deliver_audio_frame")?;
        if inner.audio_in.len() >= self.audio_depth {
            inner.audio_in.pop_front();
            warn!(session = %self.id, "inbound audio queue full; dropped oldest frame");
        }
        inner.audio_in.push_back(frame);
        Ok(())
    }

    /// Pops and decrypts the next inbound audio frame; `None` if nothing is queued.
    pub fn receive_audio_data(&self) -> Result<Option<Vec<u8>>, SessionError> {
        let mut inner = self.inner.lock();
        inner.established_keys("receive_audio_data")?;
        let Some(frame) = inner.audio_in.pop_front() else {
            return Ok(None);
        };
        self.open_locked(&mut inner, &frame).map(Some)
    }

    /// Non-blocking poll for queued inbound audio.
    pub fn is_receiving(&self) -> bool {
        let inner = self.inner.lock();
        inner.state.is_established() && !inner.audio_in.is_empty()
    }

    /// Ends the session and drops key material.
    pub fn close(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        inner.advance("close", SessionState::Closed)?;
        inner.exchange = None;
        inner.pending = None;
        inner.keys = None;
        inner.audio_in.clear();
        inner.audio_out.clear();
        info!(session = %self.id, "session closed");
        Ok(())
    }
}

fn derive_keys(
    inner: &SessionInner,
    peer: &[u8; PUBLIC_KEY_LEN],
) -> Result<SessionKeys, SessionError> {
    let exchange = inner.exchange.as_ref().ok_or(SessionError::WrongState {
        op: "derive_keys",
        state: inner.state,
    })?;
    let shared = exchange
        .derive_shared(peer)
        .map_err(|err| SessionError::InvalidArgument(format!("peer public value: {err}")))?;
    Ok(SessionKeys::derive(&shared, &exchange.public_key(), peer)?)
}

fn associated_data(binding: &[u8; BINDING_LEN], counter: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + BINDING_LEN + 8);
    aad.push(CIPHERTEXT_VERSION);
    aad.extend_from_slice(binding);
    aad.extend_from_slice(&counter.to_be_bytes());
    aad
}
